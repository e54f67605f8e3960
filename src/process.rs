//! External command execution.
//!
//! Commands are structured argument vectors ([`Cmd`]), never shell strings.
//! A [`CommandRunner`] executes them; [`SystemRunner`] is the real one and
//! tests substitute a fake that records argv vectors.
//!
//! ```rust,ignore
//! let cmd = Cmd::new("make")
//!     .args(["-j8", "Image"])
//!     .current_dir(&kernel_dir)
//!     .error_msg("Failed to build kernel image");
//! run_command(&mut runner, &mut log, &cmd, OutputMode::Stream)?;
//! ```

use anyhow::{bail, Result};
use std::fmt;
use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

use crate::log::LogSink;

/// Exit status reported when a program could not be started at all.
pub const EXIT_NOT_STARTED: i32 = 127;

/// Where a command's output goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Merged stdout/stderr shown live on the console and mirrored to the log.
    Stream,
    /// Merged stdout/stderr appended to the log file only.
    Quiet,
}

/// An external command as an argument vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    envs: Vec<(String, String)>,
    error_msg: Option<String>,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            envs: Vec::new(),
            error_msg: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.to_string_lossy().into_owned())
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Message used for the error returned by [`run_command`] on failure.
    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn get_current_dir(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    pub fn get_envs(&self) -> &[(String, String)] {
        &self.envs
    }

    /// Program followed by its arguments.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        if let Some(dir) = &self.cwd {
            command.current_dir(dir);
        }
        for (key, value) in &self.envs {
            command.env(key, value);
        }
        command
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.envs {
            write!(f, "{key}={} ", quote(value))?;
        }
        write!(f, "{}", quote(&self.program))?;
        for arg in &self.args {
            write!(f, " {}", quote(arg))?;
        }
        Ok(())
    }
}

fn quote(s: &str) -> String {
    if !s.is_empty() && !s.contains(|c: char| c.is_whitespace() || c == '\'' || c == '"') {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Executes commands on behalf of pipeline steps.
pub trait CommandRunner {
    /// Run `cmd` to completion and return its exit status (0 = success).
    ///
    /// Any failure to start the program is reported as [`EXIT_NOT_STARTED`].
    fn execute(&mut self, cmd: &Cmd, mode: OutputMode, log: &mut LogSink) -> i32;

    /// Run `cmd` and return its merged output if it exits successfully.
    fn capture(&mut self, cmd: &Cmd, log: &mut LogSink) -> Option<String>;

    /// Whether `program` resolves on PATH.
    fn command_exists(&self, program: &str) -> bool {
        which::which(program).is_ok()
    }
}

/// Run `cmd`, logging an `ERROR` entry and returning an error on non-zero exit.
///
/// There is no retry; callers decide whether the error is fatal.
pub fn run_command(
    runner: &mut dyn CommandRunner,
    log: &mut LogSink,
    cmd: &Cmd,
    mode: OutputMode,
) -> Result<()> {
    let status = runner.execute(cmd, mode, log);
    if status != 0 {
        log.error(format!("Command failed (exit {}): {}", status, cmd));
        match &cmd.error_msg {
            Some(msg) => bail!("{}", msg),
            None => bail!("`{}` exited with status {}", cmd, status),
        }
    }
    Ok(())
}

/// Runs commands as real child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl SystemRunner {
    fn stream(cmd: &Cmd, log: &mut LogSink) -> io::Result<ExitStatus> {
        let (reader, writer) = io::pipe()?;
        let mut command = cmd.to_command();
        command
            .stdin(Stdio::inherit())
            .stdout(writer.try_clone()?)
            .stderr(writer);
        let mut child = command.spawn()?;
        // Drop our copies of the write end so the reader sees EOF.
        drop(command);

        let copied = Self::mirror_lines(reader, log);
        // Reap the child even when reading its output failed.
        let status = child.wait()?;
        copied.map(|()| status)
    }

    /// Copy lines from `reader` to stdout and the log until EOF.
    fn mirror_lines(reader: impl io::Read, log: &mut LogSink) -> io::Result<()> {
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();
        let stdout = io::stdout();
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line)? == 0 {
                return Ok(());
            }
            let mut out = stdout.lock();
            let _ = out.write_all(&line);
            let _ = out.flush();
            log.write_raw(&line);
        }
    }

    fn quiet(cmd: &Cmd, log: &mut LogSink) -> io::Result<ExitStatus> {
        let (stdout, stderr) = match log.child_handle() {
            Some(file) => (Stdio::from(file.try_clone()?), Stdio::from(file)),
            None => (Stdio::null(), Stdio::null()),
        };
        cmd.to_command()
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .status()
    }
}

impl CommandRunner for SystemRunner {
    fn execute(&mut self, cmd: &Cmd, mode: OutputMode, log: &mut LogSink) -> i32 {
        let result = match mode {
            OutputMode::Stream => {
                log.command_line(&cmd.to_string());
                Self::stream(cmd, log)
            }
            OutputMode::Quiet => {
                log.write_raw(format!("$ {}\n", cmd).as_bytes());
                Self::quiet(cmd, log)
            }
        };

        match result {
            Ok(status) => exit_code(status),
            Err(e) => {
                log.error(format!("Could not run '{}': {}", cmd.program(), e));
                EXIT_NOT_STARTED
            }
        }
    }

    fn capture(&mut self, cmd: &Cmd, log: &mut LogSink) -> Option<String> {
        log.write_raw(format!("$ {}\n", cmd).as_bytes());
        let output = cmd.to_command().stdin(Stdio::null()).output().ok()?;
        log.write_raw(&output.stdout);
        log.write_raw(&output.stderr);
        if !output.status.success() {
            return None;
        }
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Some(text)
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    }
}

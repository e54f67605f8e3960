//! Append-only build log.
//!
//! Every entry goes to the console (colored by level when stdout is a
//! terminal) and to the log file as `[timestamp] [LEVEL] message`. Output of
//! external commands is mirrored into the same file, so the file is the
//! complete record of a run.
//!
//! The sink is an explicit context object owned by the pipeline context, not a
//! global. Call [`LogSink::close`] on every exit path; `Drop` flushes as a
//! backstop.

use anyhow::{Context, Result};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, IsTerminal, Write};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;

const COLOR_RESET: &str = "\x1b[0m";
const COLOR_RED: &str = "\x1b[31m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_YELLOW: &str = "\x1b[33m";
const COLOR_BLUE: &str = "\x1b[34m";
const COLOR_CYAN: &str = "\x1b[36m";
const COLOR_BOLD: &str = "\x1b[1m";

/// Severity tag of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Success,
    Warning,
    Error,
}

impl Level {
    fn color(self) -> &'static str {
        match self {
            Level::Info => COLOR_RESET,
            Level::Success => COLOR_GREEN,
            Level::Warning => COLOR_YELLOW,
            Level::Error => COLOR_RED,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Info => write!(f, "INFO"),
            Level::Success => write!(f, "SUCCESS"),
            Level::Warning => write!(f, "WARNING"),
            Level::Error => write!(f, "ERROR"),
        }
    }
}

/// Console emphasis for banners and summaries printed outside the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    Heading,
    Good,
    Caution,
    Bad,
}

/// `text` in bold and the color of `tone` when stdout is a terminal.
pub fn paint(tone: Tone, text: &str) -> String {
    if !io::stdout().is_terminal() {
        return text.to_string();
    }
    let color = match tone {
        Tone::Heading => COLOR_CYAN,
        Tone::Good => COLOR_GREEN,
        Tone::Caution => COLOR_YELLOW,
        Tone::Bad => COLOR_RED,
    };
    format!("{COLOR_BOLD}{color}{text}{COLOR_RESET}")
}

pub struct LogSink {
    path: Option<PathBuf>,
    file: Option<BufWriter<File>>,
    console: bool,
    color: bool,
}

impl LogSink {
    /// Open (or create) the log file in append mode.
    ///
    /// A log file that cannot be opened is not fatal: the sink warns on the
    /// console and continues console-only.
    pub fn open(path: &Path) -> Self {
        let mut sink = Self::console_only();
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                sink.path = Some(path.to_path_buf());
                sink.file = Some(BufWriter::new(file));
            }
            Err(e) => sink.warning(format!(
                "Could not open log file {}: {}",
                path.display(),
                e
            )),
        }
        sink
    }

    /// A sink that only writes to the console.
    pub fn console_only() -> Self {
        Self {
            path: None,
            file: None,
            console: true,
            color: io::stdout().is_terminal(),
        }
    }

    /// Stop echoing entries to the console. The file still receives them.
    pub fn quiet(mut self) -> Self {
        self.console = false;
        self
    }

    /// Path of the backing log file, if one is open.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn log(&mut self, level: Level, message: impl AsRef<str>) {
        let message = message.as_ref();
        let timestamp = timestamp();

        if self.console {
            if self.color {
                println!(
                    "[{COLOR_CYAN}{timestamp}{COLOR_RESET}] {}{message}{COLOR_RESET}",
                    level.color()
                );
            } else {
                println!("[{timestamp}] {message}");
            }
        }

        if let Some(file) = self.file.as_mut() {
            // A failing log write must not take the build down with it.
            let _ = writeln!(file, "[{timestamp}] [{level}] {message}");
            let _ = file.flush();
        }
    }

    pub fn info(&mut self, message: impl AsRef<str>) {
        self.log(Level::Info, message);
    }

    pub fn success(&mut self, message: impl AsRef<str>) {
        self.log(Level::Success, message);
    }

    pub fn warning(&mut self, message: impl AsRef<str>) {
        self.log(Level::Warning, message);
    }

    pub fn error(&mut self, message: impl AsRef<str>) {
        self.log(Level::Error, message);
    }

    /// Echo a command line before it runs (console in blue, file verbatim).
    pub fn command_line(&mut self, line: &str) {
        if self.console {
            if self.color {
                println!("{COLOR_BLUE}{line}{COLOR_RESET}");
            } else {
                println!("{line}");
            }
        }
        self.write_raw(format!("$ {line}\n").as_bytes());
    }

    /// Append raw command output to the log file.
    pub fn write_raw(&mut self, bytes: &[u8]) {
        if let Some(file) = self.file.as_mut() {
            let _ = file.write_all(bytes);
            let _ = file.flush();
        }
    }

    /// A second handle on the log file for a child process's stdout/stderr.
    ///
    /// Buffered entries are flushed first so the child's output lands after
    /// them. The cloned descriptor shares the append flag.
    pub fn child_handle(&mut self) -> Option<File> {
        let file = self.file.as_mut()?;
        let _ = file.flush();
        file.get_ref().try_clone().ok()
    }

    /// Flush and release the log file.
    pub fn close(mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().with_context(|| match &self.path {
                Some(path) => format!("flushing log file '{}'", path.display()),
                None => "flushing log file".to_string(),
            })?;
        }
        Ok(())
    }
}

impl Drop for LogSink {
    fn drop(&mut self) {
        if let Some(file) = self.file.as_mut() {
            let _ = file.flush();
        }
    }
}

fn timestamp() -> String {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

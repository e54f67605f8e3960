//! The installer pipeline: compile the kernel builder, install it, and wire
//! up shell conveniences.
//!
//! - [`packages`] - Package manager detection and toolchain packages
//! - [`shell`] - Aliases, bash completion, desktop entry
//!
//! `--force` turns the package manager steps into warnings and skips the
//! system requirements check entirely.

pub mod packages;
pub mod shell;

use anyhow::{bail, Result};
use std::path::PathBuf;

use crate::log::LogSink;
use crate::pipeline::{Pipeline, PipelineContext, Severity};
use crate::preflight;
use crate::process::{run_command, Cmd, CommandRunner, OutputMode};
use crate::staging::{copy_executable, ensure_dir};

pub use packages::PackageManager;

pub const KERNEL_BUILDER_NAME: &str = "orangepi-kernel-builder";
pub const DEFAULT_INSTALL_DIR: &str = "/usr/local/bin";
pub const INSTALLER_LOG_FILE: &str = "/tmp/orangepi-installer.log";

pub const STEP_REQUIREMENTS: &str = "Check system requirements";
pub const STEP_DETECT_PM: &str = "Detect package manager";
pub const STEP_DEPENDENCIES: &str = "Install build dependencies";
pub const STEP_COMPILE: &str = "Compile kernel builder";
pub const STEP_INSTALL: &str = "Install kernel builder";
pub const STEP_SHELL: &str = "Set up shell integration";
pub const STEP_DESKTOP: &str = "Create desktop entry";
pub const STEP_VERIFY: &str = "Verify installation";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallerConfig {
    pub install_dir: PathBuf,
    /// Checkout containing the kernel builder's `Cargo.toml`.
    pub source_dir: PathBuf,
    pub skip_desktop: bool,
    pub skip_shell: bool,
    pub verbose: bool,
    pub force: bool,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            install_dir: PathBuf::from(DEFAULT_INSTALL_DIR),
            source_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            skip_desktop: false,
            skip_shell: false,
            verbose: false,
            force: false,
        }
    }
}

impl InstallerConfig {
    pub fn finalize(self) -> Result<Self> {
        if self.install_dir.as_os_str().is_empty() {
            bail!("install directory must not be empty");
        }
        if self.source_dir.as_os_str().is_empty() {
            bail!("source directory must not be empty");
        }
        Ok(self)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.source_dir.join("Cargo.toml")
    }

    pub fn target_dir(&self) -> PathBuf {
        self.source_dir.join("target")
    }

    /// Binary produced by the release build.
    pub fn artifact_path(&self) -> PathBuf {
        self.target_dir().join("release").join(KERNEL_BUILDER_NAME)
    }

    pub fn installed_path(&self) -> PathBuf {
        self.install_dir.join(KERNEL_BUILDER_NAME)
    }
}

/// Host locations the installer reads or writes outside `install_dir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallerPaths {
    pub home: Option<PathBuf>,
    pub shell: Option<String>,
    pub completion_dir: PathBuf,
    pub os_release: PathBuf,
    /// Filesystem checked for free space.
    pub scratch: PathBuf,
}

impl Default for InstallerPaths {
    fn default() -> Self {
        Self {
            home: dirs::home_dir(),
            shell: std::env::var("SHELL").ok(),
            completion_dir: PathBuf::from("/etc/bash_completion.d"),
            os_release: PathBuf::from(preflight::OS_RELEASE),
            scratch: PathBuf::from("/tmp"),
        }
    }
}

pub struct InstallContext {
    pub config: InstallerConfig,
    pub paths: InstallerPaths,
    pub log: LogSink,
    /// Set by the detection step.
    pub package_manager: Option<PackageManager>,
    runner: Box<dyn CommandRunner>,
}

impl InstallContext {
    pub fn new(
        config: InstallerConfig,
        paths: InstallerPaths,
        log: LogSink,
        runner: Box<dyn CommandRunner>,
    ) -> Self {
        Self {
            config,
            paths,
            log,
            package_manager: None,
            runner,
        }
    }

    pub fn run(&mut self, cmd: &Cmd) -> Result<()> {
        run_command(&mut *self.runner, &mut self.log, cmd, OutputMode::Stream)
    }

    /// Output goes to the log file unless verbose.
    pub fn run_quiet(&mut self, cmd: &Cmd) -> Result<()> {
        let mode = if self.config.verbose {
            OutputMode::Stream
        } else {
            OutputMode::Quiet
        };
        run_command(&mut *self.runner, &mut self.log, cmd, mode)
    }

    pub fn command_exists(&self, program: &str) -> bool {
        self.runner.command_exists(program)
    }

    pub fn into_log(self) -> LogSink {
        self.log
    }
}

impl PipelineContext for InstallContext {
    fn log(&mut self) -> &mut LogSink {
        &mut self.log
    }
}

/// Ordered installer steps for `config`.
pub fn installer_pipeline(config: &InstallerConfig) -> Pipeline<InstallContext> {
    use Severity::{Fatal, Warning};

    let package_severity = if config.force { Warning } else { Fatal };

    Pipeline::<InstallContext>::new()
        .step_if(!config.force, STEP_REQUIREMENTS, Warning, |ctx| {
            check_system_requirements(ctx).into()
        })
        .step(STEP_DETECT_PM, package_severity, |ctx| {
            detect_package_manager(ctx).into()
        })
        .step(STEP_DEPENDENCIES, package_severity, |ctx| {
            install_build_dependencies(ctx).into()
        })
        .step(STEP_COMPILE, Fatal, |ctx| compile_kernel_builder(ctx).into())
        .step(STEP_INSTALL, Fatal, |ctx| install_kernel_builder(ctx).into())
        .step_if(!config.skip_shell, STEP_SHELL, Warning, |ctx| {
            shell::setup_shell_integration(ctx).into()
        })
        .step_if(!config.skip_desktop, STEP_DESKTOP, Warning, |ctx| {
            shell::create_desktop_entry(ctx).into()
        })
        .step(STEP_VERIFY, Fatal, |ctx| verify_installation(ctx).into())
}

/// Advisory checks; only ever warns.
pub fn check_system_requirements(ctx: &mut InstallContext) -> Result<()> {
    let arch = preflight::host_arch();
    ctx.log.info(format!("Detected architecture: {}", arch));
    preflight::check_arch(&arch, &mut ctx.log);

    if ctx.paths.os_release.exists() {
        ctx.log.info("Linux system detected");
    } else {
        ctx.log
            .warning("Operating system may not be fully supported");
    }

    let scratch = ctx.paths.scratch.clone();
    preflight::check_free_space(&scratch, preflight::RECOMMENDED_FREE_BYTES, &mut ctx.log);
    Ok(())
}

pub fn detect_package_manager(ctx: &mut InstallContext) -> Result<()> {
    let detected = PackageManager::detect(|program| ctx.command_exists(program));
    match detected {
        Some(pm) => {
            ctx.log.info(format!("Using package manager: {}", pm));
            ctx.package_manager = Some(pm);
            Ok(())
        }
        None => bail!("No supported package manager found (apt, yum, dnf, pacman, zypper)"),
    }
}

pub fn install_build_dependencies(ctx: &mut InstallContext) -> Result<()> {
    let Some(pm) = ctx.package_manager else {
        ctx.log
            .info("No package manager detected, skipping dependency installation");
        return Ok(());
    };

    ctx.log.info("Installing build dependencies...");
    if let Some(refresh) = pm.refresh_command() {
        if ctx.run(&refresh).is_err() {
            ctx.log.warning("Failed to update package lists");
        }
    }
    ctx.run(&pm.install_command())
}

pub fn compile_kernel_builder(ctx: &mut InstallContext) -> Result<()> {
    ctx.log.info("Compiling Orange Pi Kernel Builder...");
    let manifest = ctx.config.manifest_path();
    if !manifest.is_file() {
        bail!("Source manifest not found: {}", manifest.display());
    }

    let cmd = Cmd::new("cargo")
        .args(["build", "--release", "--bin", KERNEL_BUILDER_NAME, "--manifest-path"])
        .arg_path(&manifest)
        .env(
            "CARGO_TARGET_DIR",
            ctx.config.target_dir().to_string_lossy(),
        )
        .error_msg("Compilation failed");
    ctx.run_quiet(&cmd)?;

    let artifact = ctx.config.artifact_path();
    if !artifact.is_file() {
        bail!("Compiled binary not found: {}", artifact.display());
    }
    Ok(())
}

pub fn install_kernel_builder(ctx: &mut InstallContext) -> Result<()> {
    ctx.log.info("Installing Orange Pi Kernel Builder...");
    let install_dir = ctx.config.install_dir.clone();
    ensure_dir(&install_dir)?;

    let dest = ctx.config.installed_path();
    copy_executable(&ctx.config.artifact_path(), &dest)?;
    if !dest.exists() {
        bail!("Installation verification failed");
    }
    ctx.log.info(format!("Installed {}", dest.display()));
    Ok(())
}

pub fn verify_installation(ctx: &mut InstallContext) -> Result<()> {
    ctx.log.info("Verifying installation...");
    let binary = ctx.config.installed_path();
    if !binary.is_file() {
        bail!("Binary not found in installation directory");
    }
    let cmd = Cmd::new(binary.to_string_lossy())
        .arg("--help")
        .error_msg("Binary does not execute properly");
    ctx.run_quiet(&cmd)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::fs;
    use tempfile::TempDir;

    use super::{InstallContext, InstallerConfig, InstallerPaths};
    use crate::log::LogSink;
    use crate::process::fake::FakeRunner;

    pub(crate) fn config(temp: &TempDir) -> InstallerConfig {
        InstallerConfig {
            install_dir: temp.path().join("bin"),
            source_dir: temp.path().join("src"),
            ..InstallerConfig::default()
        }
    }

    pub(crate) fn paths(temp: &TempDir) -> InstallerPaths {
        let home = temp.path().join("home");
        let completion_dir = temp.path().join("bash_completion.d");
        fs::create_dir_all(&home).unwrap();
        fs::create_dir_all(&completion_dir).unwrap();
        InstallerPaths {
            home: Some(home),
            shell: Some("/bin/bash".to_string()),
            completion_dir,
            os_release: temp.path().join("os-release"),
            scratch: temp.path().to_path_buf(),
        }
    }

    pub(crate) fn context(temp: &TempDir, runner: &FakeRunner) -> InstallContext {
        context_with(temp, runner, config(temp))
    }

    pub(crate) fn context_with(
        temp: &TempDir,
        runner: &FakeRunner,
        config: InstallerConfig,
    ) -> InstallContext {
        InstallContext::new(
            config,
            paths(temp),
            LogSink::open(&temp.path().join("orangepi-installer.log")).quiet(),
            Box::new(runner.clone()),
        )
    }

    /// Checkout with a manifest and an already built release binary.
    pub(crate) fn seed_checkout(config: &InstallerConfig) {
        fs::create_dir_all(&config.source_dir).unwrap();
        fs::write(config.manifest_path(), "[package]\nname = \"orangepi-kernel-builder\"\n")
            .unwrap();
        let artifact = config.artifact_path();
        fs::create_dir_all(artifact.parent().unwrap()).unwrap();
        fs::write(&artifact, b"\x7fELF builder").unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{config, context, context_with, seed_checkout};
    use super::*;
    use crate::process::fake::FakeRunner;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    #[test]
    fn default_pipeline_runs_every_step() {
        let temp = TempDir::new().unwrap();
        let pipeline = installer_pipeline(&config(&temp));

        assert_eq!(
            pipeline.step_names(),
            vec![
                STEP_REQUIREMENTS,
                STEP_DETECT_PM,
                STEP_DEPENDENCIES,
                STEP_COMPILE,
                STEP_INSTALL,
                STEP_SHELL,
                STEP_DESKTOP,
                STEP_VERIFY,
            ]
        );
    }

    #[test]
    fn force_skips_requirements_and_softens_package_steps() {
        let temp = TempDir::new().unwrap();
        let pipeline = installer_pipeline(&InstallerConfig {
            force: true,
            skip_desktop: true,
            ..config(&temp)
        });

        let steps: Vec<(&str, Severity)> = pipeline
            .steps()
            .iter()
            .map(|s| (s.name(), s.severity()))
            .collect();
        assert_eq!(
            steps,
            vec![
                (STEP_DETECT_PM, Severity::Warning),
                (STEP_DEPENDENCIES, Severity::Warning),
                (STEP_COMPILE, Severity::Fatal),
                (STEP_INSTALL, Severity::Fatal),
                (STEP_SHELL, Severity::Warning),
                (STEP_VERIFY, Severity::Fatal),
            ]
        );
    }

    #[test]
    fn missing_package_manager_without_force_fails_before_compiling() {
        let temp = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        runner.only_programs(&[]);
        let config = config(&temp);
        seed_checkout(&config);
        let pipeline = installer_pipeline(&config);
        let mut ctx = context_with(&temp, &runner, config);

        let report = pipeline.run(&mut ctx);

        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.fatal.unwrap().step, STEP_DETECT_PM);
        assert!(!runner.ran(&["cargo"]));
    }

    #[test]
    fn forced_install_without_package_manager_still_completes() {
        let temp = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        runner.only_programs(&[]);
        let config = InstallerConfig {
            force: true,
            ..config(&temp)
        };
        seed_checkout(&config);
        let pipeline = installer_pipeline(&config);
        let mut ctx = context_with(&temp, &runner, config);

        let report = pipeline.run(&mut ctx);

        assert_eq!(report.exit_code(), 0, "{:?}", report.fatal);
        let warned: Vec<&str> = report.warnings.iter().map(|w| w.step).collect();
        assert_eq!(warned, vec![STEP_DETECT_PM]);
        assert!(runner.ran(&["cargo", "build", "--release"]));
        assert!(!runner.ran(&["apt"]));
    }

    #[test]
    fn full_install_with_apt() {
        let temp = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        runner.only_programs(&["dnf", "apt"]);
        let config = config(&temp);
        seed_checkout(&config);
        let pipeline = installer_pipeline(&config);
        let mut ctx = context_with(&temp, &runner, config);

        let report = pipeline.run(&mut ctx);

        assert_eq!(report.exit_code(), 0, "{:?}", report.fatal);
        assert_eq!(ctx.package_manager, Some(PackageManager::Apt));
        assert!(runner.ran(&["apt", "update"]));
        assert!(runner.ran(&["apt", "install", "-y", "build-essential"]));
        assert!(!runner.ran(&["dnf"]));

        let installed = ctx.config.installed_path();
        assert_eq!(fs::read(&installed).unwrap(), b"\x7fELF builder");
        let mode = fs::metadata(&installed).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        assert!(runner.ran(&[installed.to_str().unwrap(), "--help"]));
        let rc = ctx.paths.home.clone().unwrap().join(".bashrc");
        assert!(fs::read_to_string(rc).unwrap().contains("alias opi-build-quick="));
    }

    #[test]
    fn compile_uses_checkout_manifest() {
        let temp = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        let mut ctx = context(&temp, &runner);
        seed_checkout(&ctx.config);

        compile_kernel_builder(&mut ctx).unwrap();

        let calls = runner.calls();
        let manifest = ctx.config.manifest_path();
        assert_eq!(
            calls[0].argv(),
            vec![
                "cargo",
                "build",
                "--release",
                "--bin",
                KERNEL_BUILDER_NAME,
                "--manifest-path",
                manifest.to_str().unwrap(),
            ]
        );
    }

    #[test]
    fn compile_without_manifest_fails() {
        let temp = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        let mut ctx = context(&temp, &runner);

        let err = compile_kernel_builder(&mut ctx).unwrap_err();
        assert!(err.to_string().starts_with("Source manifest not found"));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn compile_without_artifact_fails() {
        let temp = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        let mut ctx = context(&temp, &runner);
        fs::create_dir_all(&ctx.config.source_dir).unwrap();
        fs::write(ctx.config.manifest_path(), "").unwrap();

        let err = compile_kernel_builder(&mut ctx).unwrap_err();
        assert!(err.to_string().starts_with("Compiled binary not found"));
    }

    #[test]
    fn failing_help_fails_verification() {
        let temp = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        let mut ctx = context(&temp, &runner);
        seed_checkout(&ctx.config);
        install_kernel_builder(&mut ctx).unwrap();
        let installed = ctx.config.installed_path();
        runner.fail_when(&[installed.to_str().unwrap()]);

        let err = verify_installation(&mut ctx).unwrap_err();
        assert_eq!(err.to_string(), "Binary does not execute properly");
    }

    #[test]
    fn requirements_check_never_fails() {
        let temp = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        let mut ctx = context(&temp, &runner);

        assert!(check_system_requirements(&mut ctx).is_ok());
    }

    #[test]
    fn empty_install_dir_is_rejected() {
        let result = InstallerConfig {
            install_dir: PathBuf::new(),
            ..InstallerConfig::default()
        }
        .finalize();
        assert!(result.is_err());
    }
}

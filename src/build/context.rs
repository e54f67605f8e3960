//! Build context shared by every builder step.
//!
//! The context owns the finalized [`BuildConfig`], the host paths the GPU and
//! install steps write into, the log sink, and the command runner. Steps get
//! `&mut BuildContext` and nothing else.

use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::config::BuildConfig;
use crate::log::LogSink;
use crate::pipeline::PipelineContext;
use crate::process::{run_command, Cmd, CommandRunner, OutputMode};

/// Host locations written by the GPU and install steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPaths {
    /// Where downloaded Mali blobs are staged before install.
    pub mali_staging: PathBuf,
    pub firmware_dir: PathBuf,
    pub lib_dir: PathBuf,
    pub opencl_vendors_dir: PathBuf,
    pub vulkan_icd_dir: PathBuf,
    pub boot_dir: PathBuf,
}

impl Default for HostPaths {
    fn default() -> Self {
        Self {
            mali_staging: PathBuf::from("/tmp/mali_install"),
            firmware_dir: PathBuf::from("/lib/firmware"),
            lib_dir: PathBuf::from("/usr/lib"),
            opencl_vendors_dir: PathBuf::from("/etc/OpenCL/vendors"),
            vulkan_icd_dir: PathBuf::from("/usr/share/vulkan/icd.d"),
            boot_dir: PathBuf::from("/boot"),
        }
    }
}

impl HostPaths {
    /// The default layout re-rooted under `root`.
    pub fn under(root: &Path) -> Self {
        let defaults = Self::default();
        let reroot = |path: &Path| root.join(path.strip_prefix("/").unwrap_or(path));
        Self {
            mali_staging: reroot(&defaults.mali_staging),
            firmware_dir: reroot(&defaults.firmware_dir),
            lib_dir: reroot(&defaults.lib_dir),
            opencl_vendors_dir: reroot(&defaults.opencl_vendors_dir),
            vulkan_icd_dir: reroot(&defaults.vulkan_icd_dir),
            boot_dir: reroot(&defaults.boot_dir),
        }
    }
}

pub struct BuildContext {
    pub config: BuildConfig,
    pub paths: HostPaths,
    pub log: LogSink,
    runner: Box<dyn CommandRunner>,
}

impl BuildContext {
    pub fn new(
        config: BuildConfig,
        paths: HostPaths,
        log: LogSink,
        runner: Box<dyn CommandRunner>,
    ) -> Self {
        Self {
            config,
            paths,
            log,
            runner,
        }
    }

    /// Run a command with its output streamed to the console.
    pub fn run(&mut self, cmd: &Cmd) -> Result<()> {
        run_command(&mut *self.runner, &mut self.log, cmd, OutputMode::Stream)
    }

    /// Run a command with its output sent to the log only (streamed when
    /// verbose).
    pub fn run_quiet(&mut self, cmd: &Cmd) -> Result<()> {
        let mode = if self.config.verbose {
            OutputMode::Stream
        } else {
            OutputMode::Quiet
        };
        run_command(&mut *self.runner, &mut self.log, cmd, mode)
    }

    /// Run a best-effort command: a failure is logged as `warning` and
    /// reported as `false`.
    pub fn run_or_warn(&mut self, cmd: &Cmd, warning: &str) -> bool {
        match self.run(cmd) {
            Ok(()) => true,
            Err(_) => {
                self.log.warning(warning);
                false
            }
        }
    }

    pub fn capture(&mut self, cmd: &Cmd) -> Option<String> {
        self.runner.capture(cmd, &mut self.log)
    }

    /// `make` in the kernel tree with the cross-compilation environment.
    pub fn make(&self) -> Cmd {
        Cmd::new("make")
            .current_dir(&self.config.kernel_dir())
            .env("ARCH", self.config.arch.as_str())
            .env("CROSS_COMPILE", self.config.cross_compile.as_str())
    }

    /// Release the context, handing back the log for closing.
    pub fn into_log(self) -> LogSink {
        self.log
    }
}

impl PipelineContext for BuildContext {
    fn log(&mut self) -> &mut LogSink {
        &mut self.log
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_paths_reroot() {
        let paths = HostPaths::under(Path::new("/srv/sysroot"));
        assert_eq!(paths.firmware_dir, PathBuf::from("/srv/sysroot/lib/firmware"));
        assert_eq!(
            paths.vulkan_icd_dir,
            PathBuf::from("/srv/sysroot/usr/share/vulkan/icd.d")
        );
        assert_eq!(paths.mali_staging, PathBuf::from("/srv/sysroot/tmp/mali_install"));
    }

    #[test]
    fn make_carries_cross_environment() {
        let temp = tempfile::tempdir().unwrap();
        let config = BuildConfig {
            build_dir: temp.path().to_path_buf(),
            jobs: 2,
            ..BuildConfig::default()
        };
        let ctx = BuildContext::new(
            config,
            HostPaths::under(temp.path()),
            LogSink::console_only().quiet(),
            Box::new(crate::process::SystemRunner),
        );

        let cmd = ctx.make().arg("olddefconfig");
        assert_eq!(cmd.get_current_dir(), Some(temp.path().join("linux").as_path()));
        assert!(cmd
            .get_envs()
            .contains(&("ARCH".to_string(), "arm64".to_string())));
        assert!(cmd
            .get_envs()
            .contains(&("CROSS_COMPILE".to_string(), "aarch64-linux-gnu-".to_string())));
    }
}

//! Builder configuration.
//!
//! Layering: built-in defaults, then an optional TOML file, then command-line
//! flags. [`BuildConfig::finalize`] validates the result and applies the GPU
//! cascade; after that the record is read-only for the rest of the run.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_KERNEL_VERSION: &str = "6.8.0";
pub const DEFAULT_BUILD_DIR: &str = "/tmp/kernel_build";
pub const DEFAULT_CROSS_COMPILE: &str = "aarch64-linux-gnu-";
pub const DEFAULT_ARCH: &str = "arm64";
pub const DEFAULT_DEFCONFIG: &str = "rockchip_linux_defconfig";

/// Fixed log location of the builder.
pub const BUILDER_LOG_FILE: &str = "/tmp/kernel_build.log";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildConfig {
    pub kernel_version: String,
    pub build_dir: PathBuf,
    pub cross_compile: String,
    pub arch: String,
    pub defconfig: String,
    pub jobs: u32,
    pub verbose: bool,
    pub clean_build: bool,
    pub install_gpu_blobs: bool,
    pub enable_opencl: bool,
    pub enable_vulkan: bool,
    pub no_install: bool,
    pub cleanup_after: bool,
    pub verify_gpu: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            kernel_version: DEFAULT_KERNEL_VERSION.to_string(),
            build_dir: PathBuf::from(DEFAULT_BUILD_DIR),
            cross_compile: DEFAULT_CROSS_COMPILE.to_string(),
            arch: DEFAULT_ARCH.to_string(),
            defconfig: DEFAULT_DEFCONFIG.to_string(),
            jobs: detected_jobs(),
            verbose: false,
            clean_build: false,
            install_gpu_blobs: true,
            enable_opencl: true,
            enable_vulkan: true,
            no_install: false,
            cleanup_after: false,
            verify_gpu: false,
        }
    }
}

/// Number of CPUs, or 4 if it cannot be detected.
pub fn detected_jobs() -> u32 {
    match std::thread::available_parallelism() {
        Ok(n) => u32::try_from(n.get()).unwrap_or(u32::MAX),
        Err(e) => {
            eprintln!("  [WARN] Could not detect CPU count ({}), using 4 jobs", e);
            4
        }
    }
}

/// On-disk overrides. Every field is optional; unknown keys are rejected.
///
/// ```toml
/// kernel_version = "6.10.0"
/// jobs = 8
///
/// [gpu]
/// enabled = true
/// vulkan = false
/// ```
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub kernel_version: Option<String>,
    pub build_dir: Option<PathBuf>,
    pub cross_compile: Option<String>,
    pub arch: Option<String>,
    pub defconfig: Option<String>,
    pub jobs: Option<u32>,
    pub verbose: Option<bool>,
    pub clean: Option<bool>,
    pub no_install: Option<bool>,
    pub cleanup: Option<bool>,
    pub gpu: Option<GpuFileConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GpuFileConfig {
    pub enabled: Option<bool>,
    pub opencl: Option<bool>,
    pub vulkan: Option<bool>,
    pub verify: Option<bool>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading builder config '{}'", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("parsing builder config '{}'", path.display()))
    }
}

impl BuildConfig {
    /// Overlay the values present in a config file.
    pub fn apply_file(&mut self, file: FileConfig) {
        if let Some(v) = file.kernel_version {
            self.kernel_version = v;
        }
        if let Some(v) = file.build_dir {
            self.build_dir = v;
        }
        if let Some(v) = file.cross_compile {
            self.cross_compile = v;
        }
        if let Some(v) = file.arch {
            self.arch = v;
        }
        if let Some(v) = file.defconfig {
            self.defconfig = v;
        }
        if let Some(v) = file.jobs {
            self.jobs = v;
        }
        if let Some(v) = file.verbose {
            self.verbose = v;
        }
        if let Some(v) = file.clean {
            self.clean_build = v;
        }
        if let Some(v) = file.no_install {
            self.no_install = v;
        }
        if let Some(v) = file.cleanup {
            self.cleanup_after = v;
        }
        if let Some(gpu) = file.gpu {
            if let Some(v) = gpu.enabled {
                self.install_gpu_blobs = v;
            }
            if let Some(v) = gpu.opencl {
                self.enable_opencl = v;
            }
            if let Some(v) = gpu.vulkan {
                self.enable_vulkan = v;
            }
            if let Some(v) = gpu.verify {
                self.verify_gpu = v;
            }
        }
    }

    /// Validate and apply the GPU cascade.
    ///
    /// OpenCL and Vulkan only exist on top of the Mali blobs, so both are
    /// forced off when the blobs are not installed.
    pub fn finalize(mut self) -> Result<Self> {
        validate_kernel_version(&self.kernel_version)?;
        if self.build_dir.as_os_str().is_empty() {
            bail!("build directory must not be empty");
        }
        if self.arch.trim().is_empty() {
            bail!("target architecture must not be empty");
        }
        if self.defconfig.trim().is_empty() {
            bail!("defconfig must not be empty");
        }
        if self.jobs == 0 {
            bail!("jobs must be a positive integer");
        }

        if !self.install_gpu_blobs {
            self.enable_opencl = false;
            self.enable_vulkan = false;
        }
        Ok(self)
    }

    /// Directory the kernel tree is cloned into.
    pub fn kernel_dir(&self) -> PathBuf {
        self.build_dir.join("linux")
    }

    /// Directory the board patch repository is cloned into.
    pub fn patches_dir(&self) -> PathBuf {
        self.build_dir.join("ubuntu-rockchip")
    }

    /// Release name used for files in /boot and the initramfs.
    pub fn release_name(&self) -> String {
        format!("{}-opi5plus-mali", self.kernel_version)
    }

    /// Mainline git tag for the configured version.
    ///
    /// Mainline tags omit a zero sublevel: `6.8.0` is tagged `v6.8`.
    pub fn mainline_tag(&self) -> String {
        let version = self
            .kernel_version
            .strip_suffix(".0")
            .filter(|major_minor| major_minor.contains('.'))
            .unwrap_or(&self.kernel_version);
        format!("v{}", version)
    }
}

fn validate_kernel_version(version: &str) -> Result<()> {
    let parts: Vec<&str> = version.split('.').collect();
    let valid = (2..=3).contains(&parts.len())
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()));
    if !valid {
        bail!(
            "invalid kernel version '{}': expected MAJOR.MINOR or MAJOR.MINOR.SUBLEVEL",
            version
        );
    }
    Ok(())
}

//! Kernel source, configuration, build and installation steps.
//!
//! Every `make` runs in the kernel tree with `ARCH` and `CROSS_COMPILE` set
//! (see [`BuildContext::make`]).
//!
//! ```rust,ignore
//! download_kernel_source(&mut ctx)?;
//! configure_kernel(&mut ctx)?;
//! build_kernel(&mut ctx)?;
//! install_kernel_image(&mut ctx)?;
//! ```

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;

use crate::build::context::BuildContext;
use crate::log::LogSink;
use crate::process::Cmd;
use crate::staging::{ensure_dir, install_file};

pub const VENDOR_KERNEL_REPO: &str = "https://github.com/Joshua-Riek/linux-rockchip.git";
pub const VENDOR_KERNEL_BRANCH: &str = "ubuntu-rockchip-6.8-opi5";
pub const MAINLINE_KERNEL_REPO: &str =
    "https://git.kernel.org/pub/scm/linux/kernel/git/torvalds/linux.git";
pub const PATCHES_REPO: &str = "https://github.com/Joshua-Riek/ubuntu-rockchip.git";

/// Options layered on top of the defconfig for RK3588 and the Mali G610.
pub const RK3588_KCONFIG: &str = r#"
# Basic RK3588 support
CONFIG_ARCH_ROCKCHIP=y
CONFIG_ARM64=y
CONFIG_ROCKCHIP_RK3588=y
CONFIG_COMMON_CLK_RK808=y
CONFIG_ROCKCHIP_IOMMU=y
CONFIG_ROCKCHIP_PM_DOMAINS=y
CONFIG_ROCKCHIP_THERMAL=y

# Display and GPU
CONFIG_DRM=y
CONFIG_DRM_ROCKCHIP=y
CONFIG_ROCKCHIP_VOP2=y
CONFIG_DRM_PANFROST=y
CONFIG_DRM_PANEL_BRIDGE=y
CONFIG_DRM_PANEL_SIMPLE=y

# Mali kernel driver
CONFIG_MALI_MIDGARD=m
CONFIG_MALI_PLATFORM_NAME="devicetree"
CONFIG_MALI_CSF_SUPPORT=y
CONFIG_MALI_DEVFREQ=y
CONFIG_MALI_DMA_FENCE=y

# Memory and DMA
CONFIG_DMA_CMA=y
CONFIG_CMA=y
CONFIG_CMA_SIZE_MBYTES=128
CONFIG_DMA_SHARED_BUFFER=y
CONFIG_SYNC_FILE=y

# Hardware acceleration
CONFIG_PHY_ROCKCHIP_INNO_USB2=y
CONFIG_PHY_ROCKCHIP_NANENG_COMBO_PHY=y
CONFIG_ROCKCHIP_SARADC=y
CONFIG_MMC_DW_ROCKCHIP=y
CONFIG_PCIE_ROCKCHIP_HOST=y

# Video codecs
CONFIG_STAGING_MEDIA=y
CONFIG_VIDEO_ROCKCHIP_RGA=m
CONFIG_VIDEO_ROCKCHIP_VDEC=m
CONFIG_ROCKCHIP_VPU=y
CONFIG_VIDEO_HANTRO=m

# Power management
CONFIG_CPU_FREQ=y
CONFIG_CPU_FREQ_DEFAULT_GOV_ONDEMAND=y
CONFIG_CPU_FREQ_GOV_PERFORMANCE=y
CONFIG_CPU_FREQ_GOV_POWERSAVE=y
CONFIG_CPU_FREQ_GOV_USERSPACE=y
CONFIG_CPU_FREQ_GOV_SCHEDUTIL=y
CONFIG_CPUFREQ_DT=y
CONFIG_ARM_ROCKCHIP_CPUFREQ=y

# Framebuffer console
CONFIG_FB=y
CONFIG_FB_SIMPLE=y
CONFIG_LOGO=y
CONFIG_LOGO_LINUX_CLUT224=y
"#;

fn git_clone(build_dir: &Path, branch: &str, repo: &str, dest: &str) -> Cmd {
    Cmd::new("git")
        .args(["clone", "--depth", "1", "--branch", branch, repo, dest])
        .current_dir(build_dir)
}

/// A tree without a Makefile is the leftover of an interrupted clone.
fn remove_partial_tree(dir: &Path, log: &mut LogSink) -> Result<()> {
    if dir.exists() {
        log.warning(format!("Removing incomplete tree at {}", dir.display()));
        fs::remove_dir_all(dir)
            .with_context(|| format!("Failed to remove {}", dir.display()))?;
    }
    Ok(())
}

pub fn download_kernel_source(ctx: &mut BuildContext) -> Result<()> {
    let build_dir = ctx.config.build_dir.clone();
    let kernel_dir = ctx.config.kernel_dir();
    ensure_dir(&build_dir)?;

    if kernel_dir.join("Makefile").exists() {
        ctx.log.info(format!(
            "Kernel source already present at {}, skipping download",
            kernel_dir.display()
        ));
        return Ok(());
    }
    remove_partial_tree(&kernel_dir, &mut ctx.log)?;

    ctx.log.info(format!(
        "Downloading Ubuntu Rockchip kernel source ({})...",
        VENDOR_KERNEL_BRANCH
    ));
    let vendor = git_clone(&build_dir, VENDOR_KERNEL_BRANCH, VENDOR_KERNEL_REPO, "linux");
    if ctx.run(&vendor).is_ok() {
        return Ok(());
    }

    ctx.log
        .warning("Failed to clone Ubuntu Rockchip kernel, trying mainline...");
    remove_partial_tree(&kernel_dir, &mut ctx.log)?;
    let tag = ctx.config.mainline_tag();
    let mainline = git_clone(&build_dir, &tag, MAINLINE_KERNEL_REPO, "linux")
        .error_msg("Failed to download kernel source");
    ctx.run(&mainline)
}

pub fn download_patches(ctx: &mut BuildContext) -> Result<()> {
    let patches_dir = ctx.config.patches_dir();
    if patches_dir.exists() {
        ctx.log
            .info("Ubuntu Rockchip patches already present, skipping clone");
        return Ok(());
    }

    ctx.log.info("Downloading Ubuntu Rockchip patches...");
    let cmd = Cmd::new("git")
        .args(["clone", "--depth", "1", PATCHES_REPO, "ubuntu-rockchip"])
        .current_dir(&ctx.config.build_dir)
        .error_msg("Failed to download Ubuntu Rockchip patches");
    ctx.run(&cmd)
}

pub fn configure_kernel(ctx: &mut BuildContext) -> Result<()> {
    let kernel_dir = ctx.config.kernel_dir();
    if !kernel_dir.join("Makefile").exists() {
        bail!(
            "Invalid kernel source - no Makefile found in {}",
            kernel_dir.display()
        );
    }

    if ctx.config.clean_build {
        ctx.log.info("Cleaning previous build artifacts...");
        let mrproper = ctx.make().arg("mrproper");
        ctx.run_or_warn(&mrproper, "Failed to clean build artifacts");
    }

    let defconfig = ctx.make().arg(ctx.config.defconfig.as_str());
    if ctx.run(&defconfig).is_err() {
        ctx.log
            .warning("Failed to use specific defconfig, trying generic...");
        let generic = ctx
            .make()
            .arg("defconfig")
            .error_msg("Failed to configure kernel");
        ctx.run(&generic)?;
    }

    ctx.log.info(
        "Enabling RK3588, Mali GPU, and hardware acceleration configurations...",
    );
    apply_kernel_config(&kernel_dir.join(".config"), RK3588_KCONFIG)?;

    let olddefconfig = ctx.make().arg("olddefconfig");
    ctx.run_or_warn(&olddefconfig, "Failed to resolve config dependencies");
    Ok(())
}

/// Merge `kconfig` options into a `.config` file.
///
/// Earlier assignments of the same keys, including `# CONFIG_X is not set`
/// lines, are dropped and the new values appended. Comments and blank lines
/// in `kconfig` are ignored.
pub fn apply_kernel_config(config_path: &Path, kconfig: &str) -> Result<()> {
    // An unreadable existing config is an error, not an empty one.
    let existing = if config_path.exists() {
        fs::read_to_string(config_path).with_context(|| {
            format!("Failed to read kernel config at {}", config_path.display())
        })?
    } else {
        String::new()
    };

    let options: Vec<(&str, &str)> = kconfig
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('=').map(|(key, _)| (key, line)))
        .collect();

    let mut config = String::with_capacity(existing.len() + kconfig.len());
    for line in existing.lines() {
        let overridden = options.iter().any(|(key, _)| {
            line.strip_prefix(key)
                .map(|rest| rest.starts_with('='))
                .unwrap_or(false)
                || line == format!("# {} is not set", key)
        });
        if !overridden {
            config.push_str(line);
            config.push('\n');
        }
    }
    for (_, line) in &options {
        config.push_str(line);
        config.push('\n');
    }

    fs::write(config_path, config)
        .with_context(|| format!("Failed to write kernel config at {}", config_path.display()))
}

pub fn build_kernel(ctx: &mut BuildContext) -> Result<()> {
    ctx.log
        .info("Building kernel with Mali GPU support (this may take a while)...");
    let jobs = format!("-j{}", ctx.config.jobs);

    for (target, failure) in [
        ("Image", "Failed to build kernel image"),
        ("dtbs", "Failed to build device tree blobs"),
        ("modules", "Failed to build kernel modules"),
    ] {
        let cmd = ctx
            .make()
            .args([jobs.as_str(), target])
            .error_msg(failure);
        ctx.run(&cmd)?;
    }

    let kernel_dir = ctx.config.kernel_dir();
    let modules = count_modules(&kernel_dir, &mut ctx.log);
    ctx.log.info(format!("Built {} kernel modules", modules));
    match built_release(&kernel_dir) {
        Some(release) => ctx.log.info(format!(
            "Kernel release: {} (installed as {})",
            release,
            ctx.config.release_name()
        )),
        None => ctx
            .log
            .info(format!("Kernel will be installed as {}", ctx.config.release_name())),
    }
    Ok(())
}

/// Number of `.ko` files under `dir`.
pub fn count_modules(dir: &Path, log: &mut LogSink) -> usize {
    let mut count = 0;
    let mut walk_errors = 0;
    for entry in walkdir::WalkDir::new(dir) {
        match entry {
            Ok(e) => {
                if e.file_type().is_file()
                    && e.path().extension().map(|ext| ext == "ko").unwrap_or(false)
                {
                    count += 1;
                }
            }
            Err(e) => {
                walk_errors += 1;
                log.warning(format!("Error reading module entry: {}", e));
            }
        }
    }
    if walk_errors > 0 {
        log.warning(format!(
            "{} errors encountered while counting modules (count may be inaccurate)",
            walk_errors
        ));
    }
    count
}

/// Release string kbuild recorded for the last build, if any.
pub fn built_release(kernel_dir: &Path) -> Option<String> {
    let release = fs::read_to_string(kernel_dir.join("include/config/kernel.release")).ok()?;
    let release = release.trim();
    (!release.is_empty()).then(|| release.to_string())
}

pub fn install_modules(ctx: &mut BuildContext) -> Result<()> {
    ctx.log.info("Installing kernel and Mali GPU modules...");
    let cmd = ctx
        .make()
        .arg("modules_install")
        .error_msg("Failed to install kernel modules");
    ctx.run(&cmd)
}

pub fn install_device_trees(ctx: &mut BuildContext) -> Result<()> {
    let cmd = ctx
        .make()
        .arg("dtbs_install")
        .error_msg("Failed to install device tree blobs");
    ctx.run(&cmd)
}

pub fn install_kernel_image(ctx: &mut BuildContext) -> Result<()> {
    let image = ctx
        .config
        .kernel_dir()
        .join("arch")
        .join(&ctx.config.arch)
        .join("boot/Image");
    let boot_dir = ctx.paths.boot_dir.clone();
    let dest = boot_dir.join(format!("vmlinuz-{}", ctx.config.release_name()));

    ensure_dir(&boot_dir)?;
    install_file(&image, &dest, 0o644).context("Failed to copy kernel image")?;
    ctx.log.info(format!("Installed {}", dest.display()));
    Ok(())
}

/// Copy `System.map` and `.config` next to the kernel image.
///
/// Both copies are attempted; the first failure is returned.
pub fn install_system_map(ctx: &mut BuildContext) -> Result<()> {
    let kernel_dir = ctx.config.kernel_dir();
    let release = ctx.config.release_name();
    let boot_dir = ctx.paths.boot_dir.clone();
    ensure_dir(&boot_dir)?;

    let system_map = install_file(
        &kernel_dir.join("System.map"),
        &boot_dir.join(format!("System.map-{}", release)),
        0o644,
    )
    .context("Failed to copy System.map");
    if let Err(e) = &system_map {
        ctx.log.warning(format!("{:#}", e));
    }

    let config = install_file(
        &kernel_dir.join(".config"),
        &boot_dir.join(format!("config-{}", release)),
        0o644,
    )
    .context("Failed to copy kernel config");
    if let Err(e) = &config {
        ctx.log.warning(format!("{:#}", e));
    }

    system_map.and(config)
}

pub fn update_initramfs(ctx: &mut BuildContext) -> Result<()> {
    let cmd = Cmd::new("update-initramfs")
        .args(["-c", "-k"])
        .arg(ctx.config.release_name())
        .error_msg("Failed to update initramfs");
    ctx.run(&cmd)
}

pub fn update_bootloader(ctx: &mut BuildContext) -> Result<()> {
    let cmd = Cmd::new("u-boot-update").error_msg("Failed to update u-boot configuration");
    ctx.run(&cmd)
}

/// Remove the build directory and the Mali staging directory.
///
/// Both removals are attempted; the first failure is returned.
pub fn cleanup_build(ctx: &mut BuildContext) -> Result<()> {
    ctx.log.info("Cleaning up build artifacts...");
    let mut first_error = None;
    for dir in [ctx.config.build_dir.clone(), ctx.paths.mali_staging.clone()] {
        if !dir.exists() {
            continue;
        }
        if let Err(e) = fs::remove_dir_all(&dir)
            .with_context(|| format!("Failed to remove {}", dir.display()))
        {
            ctx.log.warning(format!("{:#}", e));
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

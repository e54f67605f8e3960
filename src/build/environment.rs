//! Host preparation: build directory, package lists, toolchain packages.

use anyhow::{bail, Result};

use crate::build::context::BuildContext;
use crate::process::Cmd;
use crate::staging::ensure_dir;

/// Packages needed to cross-build the kernel and use the Mali userspace.
pub const PREREQUISITES: &[&str] = &[
    // Basic build tools
    "build-essential",
    "gcc-aarch64-linux-gnu",
    "g++-aarch64-linux-gnu",
    "libncurses-dev",
    "gawk",
    "flex",
    "bison",
    "openssl",
    "libssl-dev",
    "dkms",
    "libelf-dev",
    "libudev-dev",
    "libpci-dev",
    "libiberty-dev",
    "autoconf",
    "llvm",
    // Additional tools
    "git",
    "wget",
    "curl",
    "bc",
    "rsync",
    "kmod",
    "cpio",
    "python3",
    "python3-pip",
    "device-tree-compiler",
    // Ubuntu kernel build dependencies
    "fakeroot",
    "kernel-package",
    "pkg-config-dbgsym",
    // Mali GPU and OpenCL/Vulkan support
    "mesa-opencl-icd",
    "vulkan-tools",
    "vulkan-utils",
    "vulkan-validationlayers",
    "libvulkan-dev",
    "ocl-icd-opencl-dev",
    "opencl-headers",
    "clinfo",
    // Media and hardware acceleration
    "va-driver-all",
    "vdpau-driver-all",
    "mesa-va-drivers",
    "mesa-vdpau-drivers",
    // Development libraries
    "libegl1-mesa-dev",
    "libgles2-mesa-dev",
    "libgl1-mesa-dev",
    "libdrm-dev",
    "libgbm-dev",
    "libwayland-dev",
    "libx11-dev",
    "meson",
    "ninja-build",
];

pub fn setup_build_environment(ctx: &mut BuildContext) -> Result<()> {
    ctx.log.info("Setting up build environment...");
    ensure_dir(&ctx.config.build_dir)?;
    ctx.run(
        &Cmd::new("apt")
            .arg("update")
            .error_msg("Failed to update package lists"),
    )
}

pub fn install_prerequisites(ctx: &mut BuildContext) -> Result<()> {
    ctx.log.info("Installing build prerequisites...");
    let cmd = Cmd::new("apt")
        .args(["install", "-y"])
        .args(PREREQUISITES.iter().copied())
        .env("DEBIAN_FRONTEND", "noninteractive")
        .error_msg("Failed to install prerequisites");
    ctx.run(&cmd)
}

/// Ubuntu's own kernel build dependencies for the running release.
pub fn install_kernel_build_deps(ctx: &mut BuildContext) -> Result<()> {
    let release = ctx
        .capture(&Cmd::new("uname").arg("-r"))
        .map(|out| out.trim().to_string())
        .unwrap_or_default();
    if release.is_empty() {
        bail!("Could not determine the running kernel release");
    }

    ctx.run(
        &Cmd::new("apt")
            .args(["build-dep", "-y", "linux"])
            .arg(format!("linux-image-unsigned-{}", release))
            .env("DEBIAN_FRONTEND", "noninteractive")
            .error_msg("Failed to install some kernel build dependencies"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::testing::context;
    use crate::process::fake::FakeRunner;
    use tempfile::TempDir;

    #[test]
    fn environment_creates_build_dir_and_refreshes_lists() {
        let temp = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        let mut ctx = context(&temp, &runner);

        setup_build_environment(&mut ctx).unwrap();

        assert!(ctx.config.build_dir.is_dir());
        assert!(runner.ran(&["apt", "update"]));
    }

    #[test]
    fn prerequisites_install_noninteractively() {
        let temp = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        let mut ctx = context(&temp, &runner);

        install_prerequisites(&mut ctx).unwrap();

        let calls = runner.calls();
        assert_eq!(&calls[0].argv()[..4], ["apt", "install", "-y", "build-essential"]);
        assert_eq!(calls[0].get_args().len(), PREREQUISITES.len() + 2);
        assert!(calls[0]
            .get_envs()
            .contains(&("DEBIAN_FRONTEND".to_string(), "noninteractive".to_string())));
    }

    #[test]
    fn kernel_build_deps_follow_running_release() {
        let temp = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        runner.output_for("uname", "6.1.0-1025-rockchip\n");
        let mut ctx = context(&temp, &runner);

        install_kernel_build_deps(&mut ctx).unwrap();

        assert!(runner.ran(&[
            "apt",
            "build-dep",
            "-y",
            "linux",
            "linux-image-unsigned-6.1.0-1025-rockchip"
        ]));
    }

    #[test]
    fn unknown_release_skips_build_deps() {
        let temp = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        let mut ctx = context(&temp, &runner);

        assert!(install_kernel_build_deps(&mut ctx).is_err());
        assert!(!runner.ran(&["apt"]));
    }
}

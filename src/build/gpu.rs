//! Mali G610 blobs: download, install, OpenCL / Vulkan ICDs, verification.
//!
//! Blobs are fetched into [`HostPaths::mali_staging`] first and only copied
//! into the firmware and library directories once both mandatory downloads
//! succeeded.
//!
//! [`HostPaths::mali_staging`]: crate::build::context::HostPaths

use anyhow::{bail, Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

use crate::build::context::BuildContext;
use crate::process::Cmd;
use crate::staging::{ensure_dir, force_symlink, install_file, write_text_mode};

pub const FIRMWARE_BLOB: &str = "mali_csffw.bin";
pub const DRIVER_LIB: &str = "libmali-valhall-g610-g6p0-x11-wayland-gbm.so";
pub const VULKAN_DRIVER_LIB: &str = "libmali-valhall-g610-g6p0-wayland-gbm-vulkan.so";

const BLOB_MIRROR: &str = "https://github.com/JeffyCN/mirrors/raw/libmali";
const LIBMALI_REPO: &str = "https://github.com/tsukumijima/libmali-rockchip.git";
const LIBMALI_BRANCH: &str = "libmali";
const LIBMALI_CHECKOUT: &str = "libmali-src";

/// Names the Mali driver is also published under, one per client API.
pub const DRIVER_LINKS: &[&str] = &[
    "libMali.so",
    "libMali.so.1",
    "libmali.so",
    "libmali.so.1",
    "libEGL.so.1",
    "libGLESv1_CM.so.1",
    "libGLESv2.so.2",
    "libgbm.so.1",
];
pub const VULKAN_DRIVER_LINK: &str = "libvulkan_mali.so";

pub const OPENCL_ICD_FILE: &str = "mali.icd";
pub const VULKAN_ICD_FILE: &str = "mali.json";
const VULKAN_ICD_FORMAT_VERSION: &str = "1.0.0";
const VULKAN_API_VERSION: &str = "1.2.131";

fn firmware_url() -> String {
    format!("{}/firmware/g610/{}", BLOB_MIRROR, FIRMWARE_BLOB)
}

fn library_url(name: &str) -> String {
    format!("{}/lib/aarch64-linux-gnu/{}", BLOB_MIRROR, name)
}

fn wget(staging: &Path, file: &str, url: &str) -> Cmd {
    Cmd::new("wget")
        .args(["-O", file, url])
        .current_dir(staging)
}

pub fn download_mali_blobs(ctx: &mut BuildContext) -> Result<()> {
    ctx.log
        .info("Downloading Mali G610 GPU blobs and libraries...");
    let staging = ctx.paths.mali_staging.clone();
    ensure_dir(&staging)?;

    ctx.log.info("Downloading Mali CSF firmware...");
    ctx.run(
        &wget(&staging, FIRMWARE_BLOB, &firmware_url())
            .error_msg("Failed to download Mali firmware"),
    )?;

    ctx.log.info("Downloading Mali userspace driver...");
    ctx.run(
        &wget(&staging, DRIVER_LIB, &library_url(DRIVER_LIB))
            .error_msg("Failed to download Mali userspace driver"),
    )?;

    if ctx.config.enable_vulkan {
        ctx.log.info("Downloading Mali Vulkan-enabled driver...");
        let fetched = ctx.run_or_warn(
            &wget(&staging, VULKAN_DRIVER_LIB, &library_url(VULKAN_DRIVER_LIB)),
            "Failed to download Mali Vulkan driver, using standard version",
        );
        // wget -O leaves an empty or truncated file behind on failure.
        let partial = staging.join(VULKAN_DRIVER_LIB);
        if !fetched && partial.exists() {
            if let Err(e) = fs::remove_file(&partial) {
                ctx.log.warning(format!(
                    "Could not remove partial download {}: {}",
                    partial.display(),
                    e
                ));
            }
        }
    }

    if staging.join(LIBMALI_CHECKOUT).exists() {
        ctx.log
            .info("Additional Mali components already present, skipping clone");
    } else {
        ctx.log.info("Downloading additional Mali components...");
        ctx.run_or_warn(
            &Cmd::new("git")
                .args(["clone", "--depth", "1", "--branch", LIBMALI_BRANCH])
                .args([LIBMALI_REPO, LIBMALI_CHECKOUT])
                .current_dir(&staging),
            "Failed to download additional Mali components",
        );
    }

    for blob in [FIRMWARE_BLOB, DRIVER_LIB, VULKAN_DRIVER_LIB] {
        let path = staging.join(blob);
        if !path.is_file() {
            continue;
        }
        match sha256_file(&path) {
            Ok(digest) => ctx.log.info(format!("  sha256 {}  {}", digest, blob)),
            Err(e) => ctx.log.warning(format!("  Could not checksum {}: {:#}", blob, e)),
        }
    }

    Ok(())
}

pub fn install_mali_drivers(ctx: &mut BuildContext) -> Result<()> {
    ctx.log
        .info("Installing Mali G610 drivers and firmware...");
    let staging = ctx.paths.mali_staging.clone();
    let firmware_dir = ctx.paths.firmware_dir.clone();
    let lib_dir = ctx.paths.lib_dir.clone();

    ensure_dir(&firmware_dir)?;
    install_file(
        &staging.join(FIRMWARE_BLOB),
        &firmware_dir.join(FIRMWARE_BLOB),
        0o644,
    )
    .context("Failed to install Mali firmware")?;

    ensure_dir(&lib_dir)?;
    let driver = lib_dir.join(DRIVER_LIB);
    install_file(&staging.join(DRIVER_LIB), &driver, 0o755)
        .context("Failed to install Mali userspace driver")?;

    ctx.log.info("Creating Mali driver symbolic links...");
    let mut link_failures = 0;
    for link in DRIVER_LINKS {
        if let Err(e) = force_symlink(&driver, &lib_dir.join(link)) {
            ctx.log.warning(format!("{:#}", e));
            link_failures += 1;
        }
    }
    if link_failures > 0 {
        ctx.log
            .warning("Failed to create some Mali symbolic links");
    }

    let vulkan_blob = staging.join(VULKAN_DRIVER_LIB);
    if ctx.config.enable_vulkan && has_content(&vulkan_blob) {
        ctx.log.info("Installing Mali Vulkan driver...");
        let vulkan_driver = lib_dir.join(VULKAN_DRIVER_LIB);
        let installed = install_file(&vulkan_blob, &vulkan_driver, 0o755)
            .and_then(|()| force_symlink(&vulkan_driver, &lib_dir.join(VULKAN_DRIVER_LINK)));
        if let Err(e) = installed {
            ctx.log
                .warning(format!("Failed to install Mali Vulkan driver: {:#}", e));
        }
    }

    if ctx.run_quiet(&Cmd::new("ldconfig")).is_err() {
        ctx.log.warning("Failed to update library cache");
    }
    Ok(())
}

pub fn setup_opencl_support(ctx: &mut BuildContext) -> Result<()> {
    ctx.log.info("Setting up OpenCL support for Mali G610...");
    let vendors_dir = ctx.paths.opencl_vendors_dir.clone();
    ensure_dir(&vendors_dir)?;

    let driver = ctx.paths.lib_dir.join(DRIVER_LIB);
    write_text_mode(
        &vendors_dir.join(OPENCL_ICD_FILE),
        &format!("{}\n", driver.display()),
        0o644,
    )
    .context("Failed to create Mali OpenCL ICD file")
}

#[derive(Debug, Serialize)]
struct VulkanIcdManifest {
    file_format_version: &'static str,
    #[serde(rename = "ICD")]
    icd: VulkanIcd,
}

#[derive(Debug, Serialize)]
struct VulkanIcd {
    library_path: PathBuf,
    api_version: &'static str,
}

/// ICD manifest pointing the Vulkan loader at `library`.
pub fn vulkan_icd_json(library: &Path) -> Result<String> {
    let manifest = VulkanIcdManifest {
        file_format_version: VULKAN_ICD_FORMAT_VERSION,
        icd: VulkanIcd {
            library_path: library.to_path_buf(),
            api_version: VULKAN_API_VERSION,
        },
    };
    let mut json =
        serde_json::to_string_pretty(&manifest).context("serializing Vulkan ICD manifest")?;
    json.push('\n');
    Ok(json)
}

pub fn setup_vulkan_support(ctx: &mut BuildContext) -> Result<()> {
    ctx.log.info("Setting up Vulkan support for Mali G610...");
    let icd_dir = ctx.paths.vulkan_icd_dir.clone();
    ensure_dir(&icd_dir)?;

    // Prefer the Vulkan-enabled build when the install step put it in place.
    let vulkan_driver = ctx.paths.lib_dir.join(VULKAN_DRIVER_LIB);
    let library = if has_content(&vulkan_driver) {
        vulkan_driver
    } else {
        ctx.paths.lib_dir.join(DRIVER_LIB)
    };

    write_text_mode(
        &icd_dir.join(VULKAN_ICD_FILE),
        &vulkan_icd_json(&library)?,
        0o644,
    )
    .context("Failed to create Mali Vulkan ICD file")
}

pub fn verify_gpu_installation(ctx: &mut BuildContext) -> Result<()> {
    ctx.log.info("Verifying Mali GPU installation...");

    if !ctx.paths.firmware_dir.join(FIRMWARE_BLOB).exists() {
        bail!("Mali firmware not found");
    }
    if !ctx.paths.lib_dir.join(DRIVER_LIB).exists() {
        bail!("Mali driver library not found");
    }

    if ctx.paths.opencl_vendors_dir.join(OPENCL_ICD_FILE).exists() {
        ctx.log.info("Testing OpenCL functionality...");
        if mentions_mali(ctx.capture(&Cmd::new("clinfo"))) {
            ctx.log.success("OpenCL Mali support detected");
        } else {
            ctx.log
                .warning("OpenCL Mali support not detected (may need reboot)");
        }
    }

    if ctx.paths.vulkan_icd_dir.join(VULKAN_ICD_FILE).exists() {
        ctx.log.info("Testing Vulkan functionality...");
        if mentions_mali(ctx.capture(&Cmd::new("vulkaninfo"))) {
            ctx.log.success("Vulkan Mali support detected");
        } else {
            ctx.log
                .warning("Vulkan Mali support not detected (may need reboot)");
        }
    }

    Ok(())
}

fn mentions_mali(output: Option<String>) -> bool {
    output
        .map(|text| text.to_ascii_lowercase().contains("mali"))
        .unwrap_or(false)
}

/// A regular file with at least one byte in it.
fn has_content(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

fn sha256_file(path: &Path) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::context::HostPaths;
    use crate::build::testing::context;
    use crate::process::fake::FakeRunner;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn stage_blobs(paths: &HostPaths, names: &[&str]) {
        fs::create_dir_all(&paths.mali_staging).unwrap();
        for name in names {
            fs::write(paths.mali_staging.join(name), format!("blob:{name}")).unwrap();
        }
    }

    #[test]
    fn download_fetches_firmware_and_driver() {
        let temp = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        let mut ctx = context(&temp, &runner);

        download_mali_blobs(&mut ctx).unwrap();

        assert!(ctx.paths.mali_staging.is_dir());
        assert!(runner.ran(&["wget", "-O", FIRMWARE_BLOB]));
        assert!(runner.ran(&["wget", "-O", DRIVER_LIB]));
        assert!(runner.ran(&["wget", "-O", VULKAN_DRIVER_LIB]));
        let firmware = runner
            .calls()
            .into_iter()
            .find(|cmd| cmd.get_args().first().map(String::as_str) == Some("-O"))
            .unwrap();
        assert_eq!(firmware.get_current_dir(), Some(ctx.paths.mali_staging.as_path()));
    }

    #[test]
    fn download_skips_vulkan_driver_when_disabled() {
        let temp = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        let mut ctx = context(&temp, &runner);
        ctx.config.enable_vulkan = false;

        download_mali_blobs(&mut ctx).unwrap();

        assert!(!runner.ran(&["wget", "-O", VULKAN_DRIVER_LIB]));
    }

    #[test]
    fn missing_firmware_download_is_fatal() {
        let temp = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        runner.fail_when(&["wget", "-O", FIRMWARE_BLOB]);
        let mut ctx = context(&temp, &runner);

        let err = download_mali_blobs(&mut ctx).unwrap_err();
        assert_eq!(err.to_string(), "Failed to download Mali firmware");
        assert!(!runner.ran(&["wget", "-O", DRIVER_LIB]));
    }

    #[test]
    fn optional_downloads_only_warn() {
        let temp = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        runner.fail_when(&["wget", "-O", VULKAN_DRIVER_LIB]);
        runner.fail_when(&["git", "clone"]);
        let mut ctx = context(&temp, &runner);

        assert!(download_mali_blobs(&mut ctx).is_ok());
    }

    #[test]
    fn install_copies_blobs_and_links_driver() {
        let temp = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        let mut ctx = context(&temp, &runner);
        stage_blobs(&ctx.paths, &[FIRMWARE_BLOB, DRIVER_LIB, VULKAN_DRIVER_LIB]);

        install_mali_drivers(&mut ctx).unwrap();

        let firmware = ctx.paths.firmware_dir.join(FIRMWARE_BLOB);
        assert_eq!(fs::read_to_string(&firmware).unwrap(), "blob:mali_csffw.bin");
        let driver = ctx.paths.lib_dir.join(DRIVER_LIB);
        let mode = fs::metadata(&driver).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        for link in DRIVER_LINKS {
            assert_eq!(fs::read_link(ctx.paths.lib_dir.join(link)).unwrap(), driver);
        }
        assert_eq!(
            fs::read_link(ctx.paths.lib_dir.join(VULKAN_DRIVER_LINK)).unwrap(),
            ctx.paths.lib_dir.join(VULKAN_DRIVER_LIB)
        );
        assert!(runner.ran(&["ldconfig"]));
    }

    #[test]
    fn install_without_downloaded_driver_fails() {
        let temp = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        let mut ctx = context(&temp, &runner);
        stage_blobs(&ctx.paths, &[FIRMWARE_BLOB]);

        let err = install_mali_drivers(&mut ctx).unwrap_err();
        assert!(err.to_string().contains("Mali userspace driver"));
    }

    #[test]
    fn failing_ldconfig_is_not_fatal() {
        let temp = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        runner.fail_when(&["ldconfig"]);
        let mut ctx = context(&temp, &runner);
        stage_blobs(&ctx.paths, &[FIRMWARE_BLOB, DRIVER_LIB]);

        assert!(install_mali_drivers(&mut ctx).is_ok());
    }

    #[test]
    fn opencl_icd_points_at_driver() {
        let temp = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        let mut ctx = context(&temp, &runner);

        setup_opencl_support(&mut ctx).unwrap();

        let icd = ctx.paths.opencl_vendors_dir.join(OPENCL_ICD_FILE);
        assert_eq!(
            fs::read_to_string(&icd).unwrap(),
            format!("{}\n", ctx.paths.lib_dir.join(DRIVER_LIB).display())
        );
        let mode = fs::metadata(&icd).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[test]
    fn vulkan_icd_prefers_vulkan_driver() {
        let temp = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        let mut ctx = context(&temp, &runner);
        fs::create_dir_all(&ctx.paths.lib_dir).unwrap();
        fs::write(ctx.paths.lib_dir.join(VULKAN_DRIVER_LIB), "vulkan").unwrap();

        setup_vulkan_support(&mut ctx).unwrap();

        let json = fs::read_to_string(ctx.paths.vulkan_icd_dir.join(VULKAN_ICD_FILE)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["file_format_version"], "1.0.0");
        assert_eq!(value["ICD"]["api_version"], "1.2.131");
        assert_eq!(
            value["ICD"]["library_path"],
            ctx.paths.lib_dir.join(VULKAN_DRIVER_LIB).display().to_string()
        );
    }

    #[test]
    fn vulkan_icd_falls_back_to_standard_driver() {
        let temp = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        let mut ctx = context(&temp, &runner);

        setup_vulkan_support(&mut ctx).unwrap();

        let json = fs::read_to_string(ctx.paths.vulkan_icd_dir.join(VULKAN_ICD_FILE)).unwrap();
        assert!(json.contains(DRIVER_LIB));
        assert!(!json.contains(VULKAN_DRIVER_LIB));
    }

    #[test]
    fn failed_vulkan_download_leaves_no_partial_file() {
        let temp = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        runner.fail_when(&["wget", "-O", VULKAN_DRIVER_LIB]);
        let mut ctx = context(&temp, &runner);
        // What wget -O leaves behind when the transfer fails.
        stage_blobs(&ctx.paths, &[]);
        fs::write(ctx.paths.mali_staging.join(VULKAN_DRIVER_LIB), "").unwrap();

        download_mali_blobs(&mut ctx).unwrap();

        assert!(!ctx.paths.mali_staging.join(VULKAN_DRIVER_LIB).exists());
    }

    #[test]
    fn empty_vulkan_blob_is_neither_installed_nor_registered() {
        let temp = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        let mut ctx = context(&temp, &runner);
        stage_blobs(&ctx.paths, &[FIRMWARE_BLOB, DRIVER_LIB]);
        fs::write(ctx.paths.mali_staging.join(VULKAN_DRIVER_LIB), "").unwrap();

        install_mali_drivers(&mut ctx).unwrap();
        setup_vulkan_support(&mut ctx).unwrap();

        assert!(!ctx.paths.lib_dir.join(VULKAN_DRIVER_LIB).exists());
        assert!(!ctx.paths.lib_dir.join(VULKAN_DRIVER_LINK).exists());
        let json = fs::read_to_string(ctx.paths.vulkan_icd_dir.join(VULKAN_ICD_FILE)).unwrap();
        assert!(json.contains(DRIVER_LIB));
        assert!(!json.contains(VULKAN_DRIVER_LIB));
    }

    #[test]
    fn empty_vulkan_driver_in_lib_dir_is_not_registered() {
        let temp = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        let mut ctx = context(&temp, &runner);
        fs::create_dir_all(&ctx.paths.lib_dir).unwrap();
        fs::write(ctx.paths.lib_dir.join(VULKAN_DRIVER_LIB), "").unwrap();

        setup_vulkan_support(&mut ctx).unwrap();

        let json = fs::read_to_string(ctx.paths.vulkan_icd_dir.join(VULKAN_ICD_FILE)).unwrap();
        assert!(!json.contains(VULKAN_DRIVER_LIB));
    }

    #[test]
    fn verify_requires_installed_blobs() {
        let temp = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        let mut ctx = context(&temp, &runner);

        let err = verify_gpu_installation(&mut ctx).unwrap_err();
        assert_eq!(err.to_string(), "Mali firmware not found");
    }

    #[test]
    fn verify_probes_configured_apis() {
        let temp = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        runner.output_for("clinfo", "  Platform Name  ARM Platform\n  Device Name  Mali-G610 r0p0\n");
        let mut ctx = context(&temp, &runner);
        stage_blobs(&ctx.paths, &[FIRMWARE_BLOB, DRIVER_LIB]);
        install_mali_drivers(&mut ctx).unwrap();
        setup_opencl_support(&mut ctx).unwrap();

        verify_gpu_installation(&mut ctx).unwrap();

        assert!(runner.ran(&["clinfo"]));
        assert!(!runner.ran(&["vulkaninfo"]));
    }

    #[test]
    fn mali_detection_is_case_insensitive() {
        assert!(mentions_mali(Some("Device Name: MALI-G610".into())));
        assert!(!mentions_mali(Some("llvmpipe".into())));
        assert!(!mentions_mali(None));
    }

    #[test]
    fn checksum_matches_known_digest() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("empty.bin");
        fs::write(&path, b"").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}

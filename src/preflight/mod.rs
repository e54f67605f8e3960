//! Host checks that run before a pipeline starts.
//!
//! Only a missing root account or a non-Debian builder host stops a run here;
//! an untested architecture or a small disk is a warning.
//!
//! # Example
//!
//! ```rust,ignore
//! use orangepi_kernel_builder::preflight;
//!
//! preflight::check_builder_host(&mut log)?;
//! ```

use anyhow::{bail, Result};
use std::ffi::CStr;
use std::path::Path;

use crate::log::LogSink;

/// Architectures the tools have been run on.
pub const SUPPORTED_ARCHES: &[&str] = &["aarch64", "x86_64"];

/// Recommended free space for a kernel build (10 GiB).
pub const RECOMMENDED_FREE_BYTES: u64 = 10 * 1024 * 1024 * 1024;

/// Marker file present on Debian and Ubuntu.
pub const DEBIAN_MARKER: &str = "/etc/debian_version";

/// Marker file present on any systemd-era Linux.
pub const OS_RELEASE: &str = "/etc/os-release";

fn effective_uid() -> u32 {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() }
}

/// Fail unless the effective user is root.
pub fn require_root() -> Result<()> {
    check_root(effective_uid())
}

fn check_root(euid: u32) -> Result<()> {
    if euid != 0 {
        bail!("This tool requires root privileges. Please run with sudo.");
    }
    Ok(())
}

pub fn is_supported_arch(arch: &str) -> bool {
    SUPPORTED_ARCHES.contains(&arch)
}

/// Machine hardware name of the running kernel, as `uname -m` prints it.
///
/// Falls back to the compile-time architecture if `uname(2)` fails.
pub fn host_arch() -> String {
    // SAFETY: utsname is plain old data; uname fills it with NUL-terminated
    // strings on success.
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut uts) } != 0 {
        return std::env::consts::ARCH.to_string();
    }
    let machine = unsafe { CStr::from_ptr(uts.machine.as_ptr()) };
    machine.to_string_lossy().into_owned()
}

/// Warn about an untested architecture. Returns whether it is supported.
pub fn check_arch(arch: &str, log: &mut LogSink) -> bool {
    if is_supported_arch(arch) {
        return true;
    }
    log.warning(format!("Untested architecture detected: {}", arch));
    false
}

/// Warn if `path` has less than `required` bytes free.
///
/// Returns whether enough space is available. A filesystem that cannot be
/// queried is reported and treated as sufficient.
pub fn check_free_space(path: &Path, required: u64, log: &mut LogSink) -> bool {
    match fs2::available_space(path) {
        Ok(available) if available < required => {
            log.warning(format!(
                "Only {} MB available in {}, {} MB recommended",
                available / (1024 * 1024),
                path.display(),
                required / (1024 * 1024)
            ));
            false
        }
        Ok(_) => true,
        Err(e) => {
            log.warning(format!(
                "Could not determine free space in {}: {}",
                path.display(),
                e
            ));
            true
        }
    }
}

/// Builder host checks, in order: Debian family (required), architecture and
/// disk space (advisory), then root.
pub fn check_builder_host(log: &mut LogSink) -> Result<()> {
    check_builder_host_at(
        Path::new(DEBIAN_MARKER),
        &host_arch(),
        Path::new("/tmp"),
        effective_uid(),
        log,
    )
}

pub(crate) fn check_builder_host_at(
    debian_marker: &Path,
    arch: &str,
    scratch: &Path,
    euid: u32,
    log: &mut LogSink,
) -> Result<()> {
    if !debian_marker.exists() {
        bail!("This tool is designed for Ubuntu/Debian systems");
    }
    check_arch(arch, log);
    check_free_space(scratch, RECOMMENDED_FREE_BYTES, log);
    check_root(euid)
}

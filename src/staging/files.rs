//! File operations: copies, whole-file writes, guarded appends, symlinks.

use anyhow::{bail, Context, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Copy `src` to `dest` byte for byte and mark `dest` executable (0755).
pub fn copy_executable(src: &Path, dest: &Path) -> Result<()> {
    install_file(src, dest, 0o755)
}

/// Copy `src` to `dest` byte for byte and set `dest` to `mode`.
pub fn install_file(src: &Path, dest: &Path, mode: u32) -> Result<()> {
    if !src.is_file() {
        bail!("Cannot open source file: {}", src.display());
    }
    fs::copy(src, dest)
        .with_context(|| format!("Cannot copy {} to {}", src.display(), dest.display()))?;
    fs::set_permissions(dest, fs::Permissions::from_mode(mode))
        .with_context(|| format!("Cannot set permissions on {}", dest.display()))?;
    Ok(())
}

/// Replace the contents of `path` with `content`.
///
/// The parent directory must already exist; a destination that cannot be
/// opened is an error.
pub fn write_text(path: &Path, content: &str) -> Result<()> {
    fs::write(path, content).with_context(|| format!("Cannot create file: {}", path.display()))
}

/// Write a file with specific permissions.
pub fn write_text_mode(path: &Path, content: &str, mode: u32) -> Result<()> {
    write_text(path, content)?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("Cannot set permissions on {}", path.display()))?;
    Ok(())
}

/// Append `block` to `path` unless the file already contains `marker`.
///
/// Returns `true` if the block was appended. A missing file is created.
pub fn append_once(path: &Path, marker: &str, block: &str) -> Result<bool> {
    if path.exists() {
        let existing = fs::read_to_string(path)
            .with_context(|| format!("Cannot read {}", path.display()))?;
        if existing.contains(marker) {
            return Ok(false);
        }
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Cannot open {} for appending", path.display()))?;
    file.write_all(block.as_bytes())
        .with_context(|| format!("Cannot append to {}", path.display()))?;
    Ok(true)
}

/// Point `link` at `target`, replacing whatever `link` was before.
pub fn force_symlink(target: &Path, link: &Path) -> Result<()> {
    if link.is_symlink() || link.exists() {
        fs::remove_file(link)
            .with_context(|| format!("Cannot remove existing {}", link.display()))?;
    }
    std::os::unix::fs::symlink(target, link)
        .with_context(|| format!("Cannot link {} -> {}", link.display(), target.display()))
}

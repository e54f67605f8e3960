//! Directory creation.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Create `path` (and any missing parents) unless it already exists.
///
/// An existing directory is success. Anything else that stops creation,
/// such as permission denied or a file in the way, is an error.
pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory: {}", path.display()))
}

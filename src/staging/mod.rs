//! Filesystem staging operations used by pipeline steps.
//!
//! - [`directories`] - idempotent directory creation
//! - [`files`] - file copies, whole-file writes, marker-guarded appends, symlinks
//!
//! All failures come back as errors with the offending path in the message;
//! the calling step decides whether they are fatal.

pub mod directories;
pub mod files;

pub use directories::ensure_dir;
pub use files::{
    append_once, copy_executable, force_symlink, install_file, write_text, write_text_mode,
};

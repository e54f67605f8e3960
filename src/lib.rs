//! Kernel builder and installer for the Orange Pi 5 Plus (RK3588).
//!
//! Two binaries share this crate:
//!
//! - **orangepi-kernel-builder** - fetches, configures, compiles and installs
//!   a kernel with Mali G610 GPU support
//! - **orangepi-installer** - compiles the builder from a checkout and wires
//!   it into the host (binary, shell aliases, completion, desktop entry)
//!
//! # Architecture
//!
//! ```text
//! orangepi-kernel-builder          orangepi-installer
//!     │                                │
//!     ├── config::BuildConfig          ├── install::InstallerConfig
//!     └── build::builder_pipeline      └── install::installer_pipeline
//!              │                                │
//!              └──────────┬─────────────────────┘
//!                         │
//!             pipeline::Pipeline (fatal / warning steps)
//!                         │
//!     process (CommandRunner)   log (LogSink)   staging (fs helpers)
//! ```
//!
//! Every external command goes through [`process::CommandRunner`], so the
//! pipelines run unchanged against a scripted runner in tests.

pub mod build;
pub mod config;
pub mod install;
pub mod log;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod staging;

pub use build::{BuildContext, HostPaths};
pub use config::BuildConfig;
pub use install::{InstallContext, InstallerConfig};
pub use pipeline::{Pipeline, RunReport, Severity};

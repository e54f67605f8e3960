//! The kernel builder pipeline.
//!
//! - [`context`] - Build context handed to every step
//! - [`environment`] - Host packages and build directory
//! - [`gpu`] - Mali blobs and OpenCL / Vulkan ICDs
//! - [`kernel`] - Kernel source, configuration, build and install
//!
//! [`builder_pipeline`] turns a finalized [`BuildConfig`] into the ordered
//! step list. Steps the configuration disables are not in the list at all.

pub mod context;
pub mod environment;
pub mod gpu;
pub mod kernel;

use crate::config::BuildConfig;
use crate::pipeline::{Pipeline, Severity};

pub use context::{BuildContext, HostPaths};

pub const STEP_ENVIRONMENT: &str = "Set up build environment";
pub const STEP_PREREQUISITES: &str = "Install prerequisites";
pub const STEP_BUILD_DEPS: &str = "Install kernel build dependencies";
pub const STEP_GPU_DOWNLOAD: &str = "Download Mali GPU blobs";
pub const STEP_GPU_INSTALL: &str = "Install Mali drivers";
pub const STEP_OPENCL: &str = "Set up OpenCL support";
pub const STEP_VULKAN: &str = "Set up Vulkan support";
pub const STEP_SOURCE: &str = "Download kernel source";
pub const STEP_PATCHES: &str = "Download Ubuntu Rockchip patches";
pub const STEP_CONFIGURE: &str = "Configure kernel";
pub const STEP_BUILD: &str = "Build kernel";
pub const STEP_MODULES: &str = "Install kernel modules";
pub const STEP_DTBS: &str = "Install device tree blobs";
pub const STEP_IMAGE: &str = "Install kernel image";
pub const STEP_SYSTEM_MAP: &str = "Install System.map and config";
pub const STEP_INITRAMFS: &str = "Update initramfs";
pub const STEP_BOOTLOADER: &str = "Update bootloader";
pub const STEP_VERIFY_GPU: &str = "Verify GPU installation";
pub const STEP_CLEANUP: &str = "Clean up build artifacts";

/// Ordered builder steps for `config`.
pub fn builder_pipeline(config: &BuildConfig) -> Pipeline<BuildContext> {
    use Severity::{Fatal, Warning};

    let with_gpu = config.install_gpu_blobs;
    let install = !config.no_install;

    Pipeline::<BuildContext>::new()
        .step(STEP_ENVIRONMENT, Fatal, |ctx| {
            environment::setup_build_environment(ctx).into()
        })
        .step(STEP_PREREQUISITES, Fatal, |ctx| {
            environment::install_prerequisites(ctx).into()
        })
        .step(STEP_BUILD_DEPS, Warning, |ctx| {
            environment::install_kernel_build_deps(ctx).into()
        })
        .step_if(with_gpu, STEP_GPU_DOWNLOAD, Fatal, |ctx| {
            gpu::download_mali_blobs(ctx).into()
        })
        .step_if(with_gpu, STEP_GPU_INSTALL, Fatal, |ctx| {
            gpu::install_mali_drivers(ctx).into()
        })
        .step_if(with_gpu && config.enable_opencl, STEP_OPENCL, Fatal, |ctx| {
            gpu::setup_opencl_support(ctx).into()
        })
        .step_if(with_gpu && config.enable_vulkan, STEP_VULKAN, Fatal, |ctx| {
            gpu::setup_vulkan_support(ctx).into()
        })
        .step(STEP_SOURCE, Fatal, |ctx| kernel::download_kernel_source(ctx).into())
        .step(STEP_PATCHES, Warning, |ctx| kernel::download_patches(ctx).into())
        .step(STEP_CONFIGURE, Fatal, |ctx| kernel::configure_kernel(ctx).into())
        .step(STEP_BUILD, Fatal, |ctx| kernel::build_kernel(ctx).into())
        .step_if(install, STEP_MODULES, Fatal, |ctx| {
            kernel::install_modules(ctx).into()
        })
        .step_if(install, STEP_DTBS, Warning, |ctx| {
            kernel::install_device_trees(ctx).into()
        })
        .step_if(install, STEP_IMAGE, Fatal, |ctx| {
            kernel::install_kernel_image(ctx).into()
        })
        .step_if(install, STEP_SYSTEM_MAP, Warning, |ctx| {
            kernel::install_system_map(ctx).into()
        })
        .step_if(install, STEP_INITRAMFS, Warning, |ctx| {
            kernel::update_initramfs(ctx).into()
        })
        .step_if(install, STEP_BOOTLOADER, Warning, |ctx| {
            kernel::update_bootloader(ctx).into()
        })
        .step_if(
            install && config.verify_gpu && with_gpu,
            STEP_VERIFY_GPU,
            Warning,
            |ctx| gpu::verify_gpu_installation(ctx).into(),
        )
        .step_if(config.cleanup_after, STEP_CLEANUP, Warning, |ctx| {
            kernel::cleanup_build(ctx).into()
        })
}

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Result;
use clap::error::ErrorKind;
use clap::{ArgMatches, CommandFactory, FromArgMatches, Parser};

use orangepi_kernel_builder::build::{builder_pipeline, BuildContext, HostPaths};
use orangepi_kernel_builder::config::{BuildConfig, FileConfig, BUILDER_LOG_FILE};
use orangepi_kernel_builder::log::{paint, LogSink, Tone};
use orangepi_kernel_builder::preflight;
use orangepi_kernel_builder::process::SystemRunner;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "orangepi-kernel-builder")]
#[command(about = "Build and install a Linux kernel with Mali G610 GPU support for the Orange Pi 5 Plus")]
#[command(disable_version_flag = true)]
struct Cli {
    /// Kernel version to build
    #[arg(short = 'v', long = "version", value_name = "VERSION")]
    kernel_version: Option<String>,

    /// Number of parallel jobs (default: CPU count)
    #[arg(short, long, value_name = "N", value_parser = clap::value_parser!(u32).range(1..))]
    jobs: Option<u32>,

    /// Build directory
    #[arg(short = 'd', long, value_name = "PATH")]
    build_dir: Option<PathBuf>,

    /// Clean previous build artifacts before configuring
    #[arg(short, long)]
    clean: bool,

    /// Kernel defconfig to start from
    #[arg(long, value_name = "NAME")]
    defconfig: Option<String>,

    /// Cross-compiler prefix
    #[arg(long, value_name = "PREFIX")]
    cross_compile: Option<String>,

    /// Show output of quiet commands
    #[arg(long)]
    verbose: bool,

    /// Build only; do not install the kernel
    #[arg(long)]
    no_install: bool,

    /// Remove the build directory afterwards
    #[arg(long)]
    cleanup: bool,

    // The GPU toggles are applied in command-line order by `gpu_toggles`.
    /// Install the Mali GPU blobs (default)
    #[arg(long)]
    enable_gpu: bool,

    /// Skip the Mali GPU blobs (also turns OpenCL / Vulkan off)
    #[arg(long)]
    disable_gpu: bool,

    /// Set up the OpenCL ICD (default)
    #[arg(long)]
    enable_opencl: bool,

    /// Skip the OpenCL ICD
    #[arg(long)]
    disable_opencl: bool,

    /// Set up the Vulkan ICD (default)
    #[arg(long)]
    enable_vulkan: bool,

    /// Skip the Vulkan ICD
    #[arg(long)]
    disable_vulkan: bool,

    /// Check the GPU installation after installing
    #[arg(long)]
    verify_gpu: bool,

    /// TOML file with build defaults
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

/// One `--enable-*` / `--disable-*` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Toggle {
    Gpu(bool),
    OpenCl(bool),
    Vulkan(bool),
}

impl Toggle {
    /// Disabling the GPU also disables both APIs; enabling it leaves them as
    /// they are.
    fn apply(self, config: &mut BuildConfig) {
        match self {
            Toggle::Gpu(true) => config.install_gpu_blobs = true,
            Toggle::Gpu(false) => {
                config.install_gpu_blobs = false;
                config.enable_opencl = false;
                config.enable_vulkan = false;
            }
            Toggle::OpenCl(on) => config.enable_opencl = on,
            Toggle::Vulkan(on) => config.enable_vulkan = on,
        }
    }
}

/// GPU toggles set in `cli`, in the order they appeared on the command line.
fn gpu_toggles(cli: &Cli, matches: &ArgMatches) -> Vec<Toggle> {
    let flags = [
        (cli.enable_gpu, "enable_gpu", Toggle::Gpu(true)),
        (cli.disable_gpu, "disable_gpu", Toggle::Gpu(false)),
        (cli.enable_opencl, "enable_opencl", Toggle::OpenCl(true)),
        (cli.disable_opencl, "disable_opencl", Toggle::OpenCl(false)),
        (cli.enable_vulkan, "enable_vulkan", Toggle::Vulkan(true)),
        (cli.disable_vulkan, "disable_vulkan", Toggle::Vulkan(false)),
    ];
    let mut seen: Vec<(usize, Toggle)> = flags
        .into_iter()
        .filter(|(set, _, _)| *set)
        .filter_map(|(_, id, toggle)| matches.index_of(id).map(|index| (index, toggle)))
        .collect();
    seen.sort_by_key(|(index, _)| *index);
    seen.into_iter().map(|(_, toggle)| toggle).collect()
}

fn parse_cli(
    args: impl IntoIterator<Item = std::ffi::OsString>,
) -> clap::error::Result<(Cli, Vec<Toggle>)> {
    let matches = Cli::command().try_get_matches_from(args)?;
    let cli = Cli::from_arg_matches(&matches)?;
    let toggles = gpu_toggles(&cli, &matches);
    Ok((cli, toggles))
}

/// Defaults, then the config file, then flags.
fn build_config(cli: Cli, toggles: &[Toggle]) -> Result<BuildConfig> {
    let mut config = BuildConfig::default();
    if let Some(path) = &cli.config {
        config.apply_file(FileConfig::load(path)?);
    }

    if let Some(v) = cli.kernel_version {
        config.kernel_version = v;
    }
    if let Some(v) = cli.jobs {
        config.jobs = v;
    }
    if let Some(v) = cli.build_dir {
        config.build_dir = v;
    }
    if let Some(v) = cli.defconfig {
        config.defconfig = v;
    }
    if let Some(v) = cli.cross_compile {
        config.cross_compile = v;
    }
    config.clean_build |= cli.clean;
    config.verbose |= cli.verbose;
    config.no_install |= cli.no_install;
    config.cleanup_after |= cli.cleanup;
    config.verify_gpu |= cli.verify_gpu;
    for toggle in toggles {
        toggle.apply(&mut config);
    }

    config.finalize()
}

fn enabled(flag: bool) -> &'static str {
    if flag {
        "Enabled"
    } else {
        "Disabled"
    }
}

fn print_header() {
    let rule = "═══════════════════════════════════════════════════════════════";
    println!("{}", paint(Tone::Heading, rule));
    println!(
        "{}",
        paint(
            Tone::Heading,
            &format!("    Orange Pi 5 Plus Kernel Builder v{}", VERSION)
        )
    );
    println!(
        "{}",
        paint(Tone::Heading, "    RK3588 kernel with Mali G610 GPU support")
    );
    println!("{}", paint(Tone::Heading, rule));
}

fn print_configuration(config: &BuildConfig) {
    println!("\n{}", paint(Tone::Caution, "Build Configuration:"));
    println!("  Kernel Version: {}", config.kernel_version);
    println!("  Build Directory: {}", config.build_dir.display());
    println!("  Parallel Jobs: {}", config.jobs);
    println!("  Mali GPU Support: {}", enabled(config.install_gpu_blobs));
    println!("  OpenCL Support: {}", enabled(config.enable_opencl));
    println!("  Vulkan Support: {}", enabled(config.enable_vulkan));
    println!("  Clean Build: {}", if config.clean_build { "Yes" } else { "No" });
    println!();
}

fn print_next_steps(config: &BuildConfig) {
    if config.no_install {
        println!("\n{}", paint(Tone::Good, "Build finished (not installed):"));
        println!("  Kernel tree: {}", config.kernel_dir().display());
    } else {
        println!("\n{}", paint(Tone::Good, "Next steps:"));
        println!("1. Reboot your Orange Pi 5 Plus");
        println!("2. Select the new kernel from the boot menu");
        println!("3. Verify with: uname -r (expect {})", config.release_name());
    }

    if config.install_gpu_blobs {
        println!("\n{}", paint(Tone::Heading, "Mali GPU Features Available:"));
        println!("• Hardware-accelerated graphics rendering");
        if config.enable_opencl {
            println!("• OpenCL compute support (test with: clinfo)");
        }
        if config.enable_vulkan {
            println!("• Vulkan graphics API (test with: vulkaninfo)");
        }
        println!("• EGL and OpenGL ES support");

        println!("\n{}", paint(Tone::Caution, "GPU Testing Commands:"));
        println!("• Check OpenCL: clinfo | grep -i mali");
        println!("• Check Vulkan: vulkaninfo | grep -i mali");
        println!("• GPU load: cat /sys/class/devfreq/fb000000.gpu/load");
    }
    println!();
}

fn print_troubleshooting(log_path: &Path) {
    println!("\n{}", paint(Tone::Bad, "Troubleshooting:"));
    println!("• Check the build log: {}", log_path.display());
    println!("• Ensure you have sufficient disk space (>10GB)");
    println!("• Verify your internet connection for downloads");
    println!("• Try running with --clean flag");
    println!("• For GPU issues, try --disable-gpu flag");
}

fn close_log(log: LogSink) {
    if let Err(e) = log.close() {
        eprintln!("  [WARN] {:#}", e);
    }
}

fn main() -> ExitCode {
    let (cli, toggles) = match parse_cli(std::env::args_os()) {
        Ok(parsed) => parsed,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            };
        }
    };

    print_header();

    let config = match build_config(cli, &toggles) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let log_path = Path::new(BUILDER_LOG_FILE);
    let mut log = LogSink::open(log_path);
    if let Err(e) = preflight::check_builder_host(&mut log) {
        log.error(format!("{:#}", e));
        close_log(log);
        return ExitCode::FAILURE;
    }

    log.info("Starting Orange Pi 5 Plus kernel build process with Mali GPU support");
    print_configuration(&config);

    let pipeline = builder_pipeline(&config);
    let mut ctx = BuildContext::new(
        config,
        HostPaths::default(),
        log,
        Box::new(SystemRunner),
    );
    let report = pipeline.run(&mut ctx);
    let config = ctx.config.clone();
    let mut log = ctx.into_log();

    if report.is_success() {
        if !report.warnings.is_empty() {
            log.warning(format!(
                "{} step(s) finished with warnings: {}",
                report.warnings.len(),
                report
                    .warnings
                    .iter()
                    .map(|w| w.step)
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }
        log.success("Kernel build process completed successfully!");
        print_next_steps(&config);
    } else {
        log.error("Kernel build process failed!");
        print_troubleshooting(log.path().unwrap_or(log_path));
    }

    close_log(log);
    ExitCode::from(report.exit_code() as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn parse(args: &[&str]) -> Result<BuildConfig> {
        let argv = std::iter::once("orangepi-kernel-builder")
            .chain(args.iter().copied())
            .map(std::ffi::OsString::from);
        let (cli, toggles) = parse_cli(argv)?;
        build_config(cli, &toggles)
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn short_v_sets_kernel_version() {
        let config = parse(&["-v", "6.10.3", "-j", "2"]).unwrap();
        assert_eq!(config.kernel_version, "6.10.3");
        assert_eq!(config.jobs, 2);
    }

    #[test]
    fn disable_gpu_cascades() {
        let config = parse(&["--disable-gpu", "--enable-vulkan"]).unwrap();
        assert!(!config.install_gpu_blobs);
        assert!(!config.enable_opencl);
        assert!(!config.enable_vulkan);
    }

    #[test]
    fn last_toggle_wins() {
        let config = parse(&["--disable-vulkan", "--enable-vulkan"]).unwrap();
        assert!(config.enable_vulkan);
        let config = parse(&["--enable-opencl", "--disable-opencl"]).unwrap();
        assert!(!config.enable_opencl);
    }

    #[test]
    fn reenabling_gpu_keeps_apis_disabled() {
        let config = parse(&["--disable-gpu", "--enable-gpu"]).unwrap();
        assert!(config.install_gpu_blobs);
        assert!(!config.enable_opencl);
        assert!(!config.enable_vulkan);

        let config = parse(&["--disable-gpu", "--enable-gpu", "--enable-vulkan"]).unwrap();
        assert!(config.install_gpu_blobs);
        assert!(!config.enable_opencl);
        assert!(config.enable_vulkan);
    }

    #[test]
    fn toggles_follow_command_line_order() {
        let argv = [
            "orangepi-kernel-builder",
            "--enable-vulkan",
            "-j",
            "2",
            "--disable-gpu",
        ];
        let (_, toggles) = parse_cli(argv.iter().map(std::ffi::OsString::from)).unwrap();
        assert_eq!(toggles, vec![Toggle::Vulkan(true), Toggle::Gpu(false)]);
    }

    #[test]
    fn zero_jobs_is_a_usage_error() {
        assert!(Cli::try_parse_from(["orangepi-kernel-builder", "-j", "0"]).is_err());
    }

    #[test]
    fn unknown_flag_is_a_usage_error() {
        let err = Cli::try_parse_from(["orangepi-kernel-builder", "--bogus"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownArgument);
    }

    #[test]
    fn help_is_not_an_error_exit() {
        let err = Cli::try_parse_from(["orangepi-kernel-builder", "--help"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DisplayHelp);
    }

    #[test]
    fn flags_override_config_file() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("builder.toml");
        std::fs::write(&path, "jobs = 3\ncleanup = true\n\n[gpu]\nopencl = false\n").unwrap();
        let path = path.to_str().unwrap();

        let config = parse(&["--config", path, "-j", "5"]).unwrap();
        assert_eq!(config.jobs, 5);
        assert!(config.cleanup_after);
        assert!(!config.enable_opencl);

        let config = parse(&["--config", path, "--enable-opencl"]).unwrap();
        assert!(config.enable_opencl);
    }
}

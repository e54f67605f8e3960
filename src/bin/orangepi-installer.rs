use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Result;
use clap::error::ErrorKind;
use clap::Parser;

use orangepi_kernel_builder::install::{
    installer_pipeline, InstallContext, InstallerConfig, InstallerPaths, INSTALLER_LOG_FILE,
};
use orangepi_kernel_builder::log::{paint, LogSink, Tone};
use orangepi_kernel_builder::preflight;
use orangepi_kernel_builder::process::SystemRunner;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "orangepi-installer")]
#[command(about = "Compile and install the Orange Pi 5 Plus kernel builder")]
#[command(disable_version_flag = true)]
#[command(after_help = "Supported package managers: apt, yum, dnf, pacman, zypper\n\
                        Architectures: x86_64, aarch64")]
struct Cli {
    /// Installation directory
    #[arg(long, value_name = "PATH", default_value = "/usr/local/bin")]
    install_dir: PathBuf,

    /// Checkout of the kernel builder (default: current directory)
    #[arg(long, value_name = "PATH")]
    source_dir: Option<PathBuf>,

    /// Skip desktop entry creation
    #[arg(long)]
    skip_desktop: bool,

    /// Skip shell aliases and bash completion
    #[arg(long)]
    skip_shell: bool,

    /// Show compiler output
    #[arg(long)]
    verbose: bool,

    /// Continue when requirement or package manager checks fail
    #[arg(long)]
    force: bool,
}

fn installer_config(cli: Cli) -> Result<InstallerConfig> {
    let mut config = InstallerConfig {
        install_dir: cli.install_dir,
        skip_desktop: cli.skip_desktop,
        skip_shell: cli.skip_shell,
        verbose: cli.verbose,
        force: cli.force,
        ..InstallerConfig::default()
    };
    if let Some(dir) = cli.source_dir {
        config.source_dir = dir;
    }
    config.finalize()
}

fn print_header() {
    let rule = "═══════════════════════════════════════════════════════════════";
    println!("{}", paint(Tone::Heading, rule));
    println!(
        "{}",
        paint(
            Tone::Heading,
            &format!("    Orange Pi 5 Plus Kernel Builder Installer v{}", VERSION)
        )
    );
    println!("{}", paint(Tone::Heading, rule));
}

fn print_success(config: &InstallerConfig) {
    let builder = config.installed_path();
    let builder = builder.display();

    println!("\n{}", paint(Tone::Good, "Installation Complete!"));
    println!("\n{}", paint(Tone::Heading, "Quick Start:"));
    println!("  sudo {builder}              # Build with all defaults");
    println!("  sudo {builder} --clean      # Clean build");
    println!("  sudo {builder} --help       # Show all options");

    if !config.skip_shell {
        println!("\n{}", paint(Tone::Caution, "Aliases available:"));
        println!("  opi-build        # sudo {builder}");
        println!("  opi-build-clean  # sudo {builder} --clean");
        println!("  opi-build-quick  # sudo {builder} --no-install");
        println!("  opi-build-nogpu  # sudo {builder} --disable-gpu");
        println!("\nOpen a new shell (or source your shell rc file) to use them.");
    }

    println!("\n{}", paint(Tone::Caution, "Important Notes:"));
    println!("  • Ensure you have at least 10GB free disk space");
    println!("  • Kernel compilation can take 30-60 minutes");
    println!("  • GPU drivers require a reboot to take effect");
    println!("  • Always backup your system before installing a custom kernel");
    println!();
}

fn print_troubleshooting(log_path: &Path) {
    println!("\n{}", paint(Tone::Bad, "Installation Failed!"));
    println!("\n{}", paint(Tone::Bad, "Troubleshooting:"));
    println!("  • Check the installation log: {}", log_path.display());
    println!("  • Ensure you have root privileges (run with sudo)");
    println!("  • Verify your internet connection for package downloads");
    println!("  • Try running with --force flag to skip some checks");
    println!("  • Ensure --source-dir points at a checkout with Cargo.toml");
}

fn close_log(log: LogSink) {
    if let Err(e) = log.close() {
        eprintln!("  [WARN] {:#}", e);
    }
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            };
        }
    };

    print_header();

    let config = match installer_config(cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let log_path = Path::new(INSTALLER_LOG_FILE);
    let mut log = LogSink::open(log_path);
    if let Err(e) = preflight::require_root() {
        log.error(format!("{:#}", e));
        print_troubleshooting(log.path().unwrap_or(log_path));
        close_log(log);
        return ExitCode::FAILURE;
    }

    let pipeline = installer_pipeline(&config);
    let mut ctx = InstallContext::new(
        config,
        InstallerPaths::default(),
        log,
        Box::new(SystemRunner),
    );
    let report = pipeline.run(&mut ctx);
    let config = ctx.config.clone();
    let mut log = ctx.into_log();

    if report.is_success() {
        log.success("Orange Pi Kernel Builder installed successfully!");
        print_success(&config);
    } else {
        log.error("Installation failed!");
        print_troubleshooting(log.path().unwrap_or(log_path));
    }

    close_log(log);
    ExitCode::from(report.exit_code() as u8)
}

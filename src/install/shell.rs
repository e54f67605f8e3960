//! Shell aliases, bash completion and the desktop entry.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::install::{InstallContext, KERNEL_BUILDER_NAME};
use crate::staging::{append_once, ensure_dir, write_text_mode};

/// Substring whose presence in an rc file means the aliases are installed.
pub const ALIAS_MARKER: &str = KERNEL_BUILDER_NAME;

/// Startup file of the user's login shell.
pub fn rc_file_for(home: &Path, shell: Option<&str>) -> PathBuf {
    let name = shell
        .and_then(|s| Path::new(s).file_name())
        .and_then(|n| n.to_str());
    match name {
        Some("bash") => home.join(".bashrc"),
        Some("zsh") => home.join(".zshrc"),
        _ => home.join(".profile"),
    }
}

pub fn alias_block(install_dir: &Path) -> String {
    let builder = install_dir.join(KERNEL_BUILDER_NAME);
    let builder = builder.display();
    format!(
        "\n# Orange Pi Kernel Builder aliases\n\
         alias opi-build='sudo {builder}'\n\
         alias opi-build-clean='sudo {builder} --clean'\n\
         alias opi-build-quick='sudo {builder} --no-install'\n\
         alias opi-build-nogpu='sudo {builder} --disable-gpu'\n"
    )
}

pub fn completion_script() -> String {
    format!(
        r#"# Orange Pi Kernel Builder bash completion

_{name}() {{
    local cur prev opts
    COMPREPLY=()
    cur="${{COMP_WORDS[COMP_CWORD]}}"
    prev="${{COMP_WORDS[COMP_CWORD-1]}}"

    opts="--help --version --jobs --build-dir --clean --defconfig --cross-compile
          --verbose --no-install --cleanup --enable-gpu --disable-gpu
          --enable-opencl --disable-opencl --enable-vulkan --disable-vulkan
          --verify-gpu --config"

    case ${{prev}} in
        --version|-v)
            COMPREPLY=( $(compgen -W "6.8.0 6.9.0 6.10.0" -- ${{cur}}) )
            return 0
            ;;
        --jobs|-j)
            COMPREPLY=( $(compgen -W "1 2 4 8 16" -- ${{cur}}) )
            return 0
            ;;
        --build-dir|-d)
            COMPREPLY=( $(compgen -d -- ${{cur}}) )
            return 0
            ;;
        --config)
            COMPREPLY=( $(compgen -f -- ${{cur}}) )
            return 0
            ;;
        *)
            ;;
    esac

    COMPREPLY=( $(compgen -W "${{opts}}" -- ${{cur}}) )
    return 0
}}

complete -F _{name} {name}
"#,
        name = KERNEL_BUILDER_NAME
    )
}

pub fn desktop_entry(install_dir: &Path) -> String {
    format!(
        "[Desktop Entry]\n\
         Version=1.0\n\
         Type=Application\n\
         Name=Orange Pi Kernel Builder\n\
         Comment=Build optimized Linux kernels for Orange Pi 5 Plus with Mali GPU support\n\
         Exec=x-terminal-emulator -e sudo {}\n\
         Icon=applications-development\n\
         Terminal=true\n\
         Categories=Development;System;\n\
         Keywords=kernel;build;orangepi;mali;gpu;\n",
        install_dir.join(KERNEL_BUILDER_NAME).display()
    )
}

fn home_dir(ctx: &InstallContext) -> Result<PathBuf> {
    ctx.paths
        .home
        .clone()
        .context("Cannot determine home directory")
}

fn install_completion(ctx: &mut InstallContext) -> Result<()> {
    ctx.log.info("Creating bash completion...");
    let path = ctx.paths.completion_dir.join(KERNEL_BUILDER_NAME);
    write_text_mode(&path, &completion_script(), 0o644)
        .context("Failed to create bash completion")?;
    ctx.log.success("Bash completion installed");
    Ok(())
}

/// Bash completion (best effort) and the alias block in the rc file.
pub fn setup_shell_integration(ctx: &mut InstallContext) -> Result<()> {
    ctx.log.info("Setting up shell integration...");

    if let Err(e) = install_completion(ctx) {
        ctx.log.warning(format!("{:#}", e));
    }

    let home = home_dir(ctx)?;
    let rc = rc_file_for(&home, ctx.paths.shell.as_deref());
    let block = alias_block(&ctx.config.install_dir);
    let appended = append_once(&rc, ALIAS_MARKER, &block).context("Failed to add shell aliases")?;
    if appended {
        ctx.log
            .success(format!("Shell aliases added to {}", rc.display()));
    } else {
        ctx.log.info("Shell aliases already exist");
    }
    Ok(())
}

pub fn create_desktop_entry(ctx: &mut InstallContext) -> Result<()> {
    ctx.log.info("Creating desktop entry...");
    let applications = home_dir(ctx)?.join(".local/share/applications");
    ensure_dir(&applications)?;

    let path = applications.join(format!("{}.desktop", KERNEL_BUILDER_NAME));
    write_text_mode(&path, &desktop_entry(&ctx.config.install_dir), 0o755)
        .context("Failed to create desktop entry")
}

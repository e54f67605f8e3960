//! Host package managers and the build toolchain each one installs.

use std::fmt;

use crate::process::Cmd;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Apt,
    Yum,
    Dnf,
    Pacman,
    Zypper,
}

impl PackageManager {
    /// Probe order; the first one on PATH wins.
    pub const ALL: [PackageManager; 5] = [
        PackageManager::Apt,
        PackageManager::Yum,
        PackageManager::Dnf,
        PackageManager::Pacman,
        PackageManager::Zypper,
    ];

    pub fn program(self) -> &'static str {
        match self {
            PackageManager::Apt => "apt",
            PackageManager::Yum => "yum",
            PackageManager::Dnf => "dnf",
            PackageManager::Pacman => "pacman",
            PackageManager::Zypper => "zypper",
        }
    }

    /// First package manager for which `exists` holds.
    pub fn detect(exists: impl Fn(&str) -> bool) -> Option<Self> {
        Self::ALL.into_iter().find(|pm| exists(pm.program()))
    }

    /// Toolchain needed to build the kernel builder from source.
    pub fn packages(self) -> &'static [&'static str] {
        match self {
            PackageManager::Apt => &[
                "build-essential",
                "gcc",
                "g++",
                "make",
                "git",
                "wget",
                "curl",
                "sudo",
                "libncurses-dev",
                "flex",
                "bison",
                "openssl",
                "libssl-dev",
                "cargo",
            ],
            PackageManager::Yum | PackageManager::Dnf | PackageManager::Zypper => &[
                "gcc",
                "gcc-c++",
                "make",
                "git",
                "wget",
                "curl",
                "sudo",
                "ncurses-devel",
                "flex",
                "bison",
                "openssl-devel",
                "cargo",
            ],
            PackageManager::Pacman => &[
                "base-devel",
                "git",
                "wget",
                "curl",
                "sudo",
                "ncurses",
                "flex",
                "bison",
                "openssl",
                "rust",
            ],
        }
    }

    /// Package list refresh run before installing, where the manager needs one.
    pub fn refresh_command(self) -> Option<Cmd> {
        match self {
            PackageManager::Apt => Some(
                Cmd::new("apt")
                    .arg("update")
                    .error_msg("Failed to update package lists"),
            ),
            _ => None,
        }
    }

    pub fn install_command(self) -> Cmd {
        let cmd = match self {
            PackageManager::Apt => Cmd::new("apt")
                .args(["install", "-y"])
                .env("DEBIAN_FRONTEND", "noninteractive"),
            PackageManager::Yum | PackageManager::Dnf | PackageManager::Zypper => {
                Cmd::new(self.program()).args(["install", "-y"])
            }
            PackageManager::Pacman => Cmd::new("pacman").args(["-S", "--noconfirm"]),
        };
        cmd.args(self.packages().iter().copied())
            .error_msg("Failed to install build dependencies")
    }
}

impl fmt::Display for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.program())
    }
}

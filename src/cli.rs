use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::tweaks::{PrimeProfile, Tweak};
use crate::types::DriverOperation;

/// gpupilot - GPU driver manager for Linux
#[derive(Parser, Debug)]
#[command(name = "gpupilot")]
#[command(about = "Detect GPUs and install, switch or remove their drivers")]
#[command(version)]
pub struct Cli {
    /// Path to a JSON configuration file (defaults are used when absent)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    /// Dry-run mode: show what would be executed without making changes.
    ///
    /// Read-only probes (lspci, mokutil, /proc) still run so the preview is
    /// realistic; privileged chains are printed and reported as successful.
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Answer every command from built-in sample output (no process is spawned)
    #[arg(long, global = true)]
    pub simulate: bool,

    /// Take a system snapshot before running a privileged chain
    #[arg(long, global = true)]
    pub snapshot: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Show the detected GPU, active driver and Secure Boot state
    Detect {
        /// Ignore the cached snapshot and probe again
        #[arg(long)]
        refresh: bool,
        /// Include CPU, RAM, distribution, kernel and display server
        #[arg(long)]
        full: bool,
    },
    /// List installable NVIDIA driver versions
    Versions,
    /// Install the NVIDIA proprietary driver
    InstallProprietary {
        /// Driver branch (e.g. 550); the package manager picks one when omitted
        #[arg(long)]
        version: Option<String>,
    },
    /// Install the driver the package manager recommends for this GPU
    InstallExpress,
    /// Install the NVIDIA open kernel module driver
    InstallOpenKernel {
        /// Driver branch (defaults to the configured open kernel version)
        #[arg(long)]
        version: Option<String>,
    },
    /// Install the AMD Mesa and Vulkan stack
    InstallAmdMesa,
    /// Remove NVIDIA drivers and restore nouveau
    RemoveDrivers {
        /// Also remove leftover NVIDIA configuration files
        #[arg(long)]
        deep_clean: bool,
    },
    /// Switch package mirrors to the nearest country and refresh
    OptimizeRepositories,
    /// Print live GPU and system statistics
    Stats,
    /// System tweaks
    Tweak {
        #[command(subcommand)]
        tweak: TweakCommands,
    },
    /// Reboot the system
    Reboot,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum TweakCommands {
    /// Show the current hybrid graphics profile
    PrimeQuery,
    /// Switch the hybrid graphics profile (takes effect after reboot)
    PrimeSet {
        /// nvidia, intel or on-demand
        profile: PrimeProfile,
    },
    /// Add nvidia-drm.modeset=1 to the kernel command line
    WaylandModeset,
    /// Install Feral GameMode
    Gamemode,
    /// Update and repair Flatpak runtimes
    FlatpakRepair,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

impl Commands {
    /// Driver operation behind this command, if it is one.
    pub fn to_operation(&self) -> Option<DriverOperation> {
        match self {
            Self::InstallProprietary { version } => Some(DriverOperation::InstallProprietary {
                version: version.clone(),
            }),
            Self::InstallExpress => Some(DriverOperation::InstallProprietary { version: None }),
            Self::InstallOpenKernel { version } => Some(DriverOperation::InstallOpenKernel {
                version: version.clone(),
            }),
            Self::InstallAmdMesa => Some(DriverOperation::InstallAmdMesa),
            Self::RemoveDrivers { deep_clean } => Some(DriverOperation::RemoveAllDrivers {
                deep_clean: *deep_clean,
            }),
            Self::OptimizeRepositories => Some(DriverOperation::OptimizeRepositories),
            _ => None,
        }
    }
}

impl TweakCommands {
    /// Privileged tweak behind this command; `None` for read-only queries.
    pub fn to_tweak(&self) -> Option<Tweak> {
        match self {
            Self::PrimeQuery => None,
            Self::PrimeSet { profile } => Some(Tweak::SetPrimeProfile(*profile)),
            Self::WaylandModeset => Some(Tweak::WaylandModeset),
            Self::Gamemode => Some(Tweak::GameMode),
            Self::FlatpakRepair => Some(Tweak::FlatpakRepair),
        }
    }
}

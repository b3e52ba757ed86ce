//! Auxiliary system tweaks
//!
//! Each tweak is one privileged chain run through `Orchestrator::execute_chain`,
//! so it gets the same diagnostics, plan logging, single elevation prompt and
//! failure classification as a driver operation.

use serde::Serialize;
use std::path::Path;
use strum::{Display, EnumIter, EnumString};
use tracing::info;

use crate::chain::{ChainBuilder, ChainStep, CommandChain};
use crate::command_executor::CommandRunner;
use crate::error::{ProbeError, Result};
use crate::orchestrator::Orchestrator;
use crate::package_manager::require_verbs;
use crate::transaction::{TransactionReport, TransactionStatus};
use crate::types::{PackageManagerKind, StepTag};

pub const GRUB_DEFAULTS: &str = "/etc/default/grub";
pub const MODESET_PARAM: &str = "nvidia-drm.modeset=1";

/// Hybrid graphics profile understood by `prime-select`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum PrimeProfile {
    Nvidia,
    Intel,
    OnDemand,
}

/// A tweak requested by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tweak {
    SetPrimeProfile(PrimeProfile),
    WaylandModeset,
    GameMode,
    FlatpakRepair,
}

impl Tweak {
    pub fn task_name(&self) -> &'static str {
        match self {
            Self::SetPrimeProfile(_) => "PRIME profile switch",
            Self::WaylandModeset => "NVIDIA Wayland modeset",
            Self::GameMode => "GameMode installation",
            Self::FlatpakRepair => "Flatpak repair",
        }
    }
}

/// Current `prime-select` profile.
pub fn prime_query(runner: &dyn CommandRunner) -> std::result::Result<PrimeProfile, ProbeError> {
    if !runner.tool_available("prime-select") {
        return Err(ProbeError::ToolMissing("prime-select".to_string()));
    }
    let output = runner
        .run("prime-select query")
        .ok_or_else(|| ProbeError::command_failed("prime-select query"))?;
    output
        .trim()
        .parse()
        .map_err(|_| ProbeError::unparseable("prime-select profile"))
}

/// Returns true if the kernel command line defaults already carry the
/// modeset parameter.
pub fn modeset_configured(runner: &dyn CommandRunner) -> bool {
    runner
        .read_file(Path::new(GRUB_DEFAULTS))
        .map(|grub| grub.contains(MODESET_PARAM))
        .unwrap_or(false)
}

/// Regenerates the GRUB menu the way each distribution family expects
fn grub_update_step(kind: PackageManagerKind) -> ChainStep {
    match kind {
        PackageManagerKind::Apt => ChainStep::new(StepTag::FinalizeBoot, "update-grub"),
        PackageManagerKind::Pacman => ChainStep::new(StepTag::FinalizeBoot, "grub-mkconfig")
            .args(["-o", "/boot/grub/grub.cfg"]),
        _ => ChainStep::new(StepTag::FinalizeBoot, "grub2-mkconfig")
            .args(["-o", "/boot/grub2/grub.cfg"]),
    }
}

/// Chain for `tweak`, or `None` when there is nothing to change.
pub fn tweak_chain(
    tweak: Tweak,
    runner: &dyn CommandRunner,
    kind: PackageManagerKind,
) -> Result<Option<CommandChain>> {
    let mut builder = ChainBuilder::new(tweak.task_name());

    match tweak {
        Tweak::SetPrimeProfile(profile) => {
            builder.push(ChainStep::new(StepTag::DriverAction, "prime-select").arg(profile.to_string()));
        }

        Tweak::WaylandModeset => {
            if modeset_configured(runner) {
                return Ok(None);
            }
            let sed = format!(
                "s/GRUB_CMDLINE_LINUX_DEFAULT=\"/GRUB_CMDLINE_LINUX_DEFAULT=\"{} /",
                MODESET_PARAM
            );
            builder
                .push(
                    ChainStep::new(StepTag::Backup, "cp")
                        .args([GRUB_DEFAULTS.to_string(), format!("{}.bak", GRUB_DEFAULTS)]),
                )
                .push(ChainStep::new(StepTag::DriverAction, "sed").args(["-i", sed.as_str(), GRUB_DEFAULTS]))
                .push(grub_update_step(kind));
        }

        Tweak::GameMode => {
            let verbs = require_verbs(kind)?;
            for (key, value) in verbs.env {
                builder.env(*key, *value);
            }
            builder.push(verbs.install.step_with(StepTag::DriverAction, "gamemode"));
        }

        Tweak::FlatpakRepair => {
            builder
                .push(ChainStep::new(StepTag::RepoUpdate, "flatpak").args(["update", "-y"]))
                .push(ChainStep::new(StepTag::Cleanup, "flatpak").arg("repair"));
        }
    }

    Ok(Some(builder.freeze()))
}

/// Apply `tweak` on the orchestrator's host.
pub fn apply(orchestrator: &mut Orchestrator, tweak: Tweak) -> Result<TransactionReport> {
    let chain = tweak_chain(
        tweak,
        orchestrator.runner().as_ref(),
        orchestrator.package_manager(),
    )?;

    match chain {
        Some(chain) => orchestrator.execute_chain(chain),
        None => {
            let msg = format!("{} is already set in {}; nothing to do", MODESET_PARAM, GRUB_DEFAULTS);
            info!("{}", msg);
            Ok(TransactionReport {
                task_name: tweak.task_name().to_string(),
                status: TransactionStatus::Succeeded,
                plan: Vec::new(),
                result: None,
                rescue: None,
                log: vec![msg],
            })
        }
    }
}

/// Ask systemd to reboot. Goes through `run_program` so a dry run records it.
pub fn request_reboot(runner: &dyn CommandRunner) -> bool {
    info!("Requesting system reboot");
    let output = runner.run_program("systemctl", &["reboot".to_string()]);
    if !output.success() {
        tracing::error!("Reboot request failed (exit {}): {}", output.exit_code, output.stderr);
    }
    output.success()
}

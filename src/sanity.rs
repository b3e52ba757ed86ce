//! Pre-flight sanity checks for runtime environment
//!
//! This module verifies the host before any elevation prompt is shown:
//! - A supported package manager was detected
//! - The elevation helper is on PATH (skipped when nothing will be spawned)
//! - Whether we already run as root (logged only, the helper still works)
//!
//! A failed check surfaces as `PilotError::EnvironmentUnsupported`.

use tracing::{debug, info, warn};

use crate::command_executor::CommandRunner;
use crate::config::PilotConfig;
use crate::error::{PilotError, Result};
use crate::types::PackageManagerKind;

/// Result of environment verification
#[derive(Debug)]
pub struct SanityCheckResult {
    pub package_manager: PackageManagerKind,
    pub missing_tools: Vec<String>,
    pub is_root: bool,
}

impl SanityCheckResult {
    /// Returns true if all checks passed
    pub fn is_ok(&self) -> bool {
        !self.package_manager.is_unsupported() && self.missing_tools.is_empty()
    }

    /// Human-readable list of the failed checks
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.package_manager.is_unsupported() {
            problems.push("no supported package manager (apt, dnf, pacman, zypper) detected".to_string());
        }
        for tool in &self.missing_tools {
            problems.push(format!("required tool not found on PATH: {}", tool));
        }
        problems
    }
}

/// Check if running as root (EUID 0)
fn is_running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Run all checks. `skip_helper_check` is set for simulated and dry runs,
/// where the elevation helper is never spawned.
pub fn verify_environment(
    runner: &dyn CommandRunner,
    config: &PilotConfig,
    kind: PackageManagerKind,
    skip_helper_check: bool,
) -> SanityCheckResult {
    let mut missing = Vec::new();
    if skip_helper_check {
        debug!("Elevation helper check skipped");
    } else if !runner.tool_available(&config.elevation_helper) {
        missing.push(config.elevation_helper.clone());
    }

    SanityCheckResult {
        package_manager: kind,
        missing_tools: missing,
        is_root: is_running_as_root(),
    }
}

/// Verify the environment and refuse with `EnvironmentUnsupported` on failure.
pub fn preflight(
    runner: &dyn CommandRunner,
    config: &PilotConfig,
    kind: PackageManagerKind,
    skip_helper_check: bool,
) -> Result<SanityCheckResult> {
    debug!("Running pre-flight sanity checks...");
    let result = verify_environment(runner, config, kind, skip_helper_check);

    if result.is_root {
        warn!("Running as root; {} will still be used for privileged chains", config.elevation_helper);
    }
    if !result.is_ok() {
        return Err(PilotError::unsupported(result.problems().join("; ")));
    }

    info!("Pre-flight checks passed: package manager={}", result.package_manager);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_executor::{ExecutionMode, SystemCommandRunner};

    fn native() -> SystemCommandRunner {
        SystemCommandRunner::new(ExecutionMode::Native)
    }

    #[test]
    fn test_missing_helper_is_unsupported() {
        let config = PilotConfig {
            elevation_helper: "this_binary_definitely_does_not_exist_12345".to_string(),
            ..PilotConfig::default()
        };
        let err = preflight(&native(), &config, PackageManagerKind::Apt, false).unwrap_err();
        assert!(matches!(err, PilotError::EnvironmentUnsupported(_)));
        assert!(err.to_string().contains("this_binary_definitely_does_not_exist_12345"));
    }

    #[test]
    fn test_helper_check_skipped_for_dry_runs() {
        let config = PilotConfig {
            elevation_helper: "this_binary_definitely_does_not_exist_12345".to_string(),
            ..PilotConfig::default()
        };
        assert!(preflight(&native(), &config, PackageManagerKind::Apt, true).is_ok());
    }

    #[test]
    fn test_no_package_manager_is_unsupported() {
        let config = PilotConfig {
            elevation_helper: "sh".to_string(),
            ..PilotConfig::default()
        };
        let result = verify_environment(&native(), &config, PackageManagerKind::None, false);
        assert!(!result.is_ok());
        assert_eq!(result.problems().len(), 1);
    }

    #[test]
    fn test_sanity_result_is_ok() {
        let ok_result = SanityCheckResult {
            package_manager: PackageManagerKind::Pacman,
            missing_tools: vec![],
            is_root: false,
        };
        assert!(ok_result.is_ok());

        let missing_tool = SanityCheckResult {
            package_manager: PackageManagerKind::Pacman,
            missing_tools: vec!["pkexec".to_string()],
            is_root: true,
        };
        assert!(!missing_tool.is_ok());
    }
}

//! Available NVIDIA driver versions
//!
//! apt hosts ask `ubuntu-drivers devices` first and fall back to the archive
//! index; dnf hosts list the akmod packages. When nothing can be parsed a
//! fixed list of long-lived branches is offered instead.

use serde::Serialize;
use std::collections::BTreeSet;

use crate::command_executor::CommandRunner;
use crate::types::PackageManagerKind;

/// Offered when no source yields a version, newest first
pub const DEFAULT_VERSIONS: [&str; 4] = ["550", "535", "470", "390"];

/// Archive results at or below this branch are not offered
const MIN_ARCHIVE_BRANCH: u32 = 300;

/// Where the version list came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum VersionSource {
    UbuntuDrivers,
    AptCache,
    Dnf,
    Defaults,
}

/// Driver versions offered to the user, newest first
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AvailableVersions {
    pub versions: Vec<String>,
    /// Branch flagged "recommended" by `ubuntu-drivers`
    pub recommended: Option<String>,
    pub source: VersionSource,
}

impl AvailableVersions {
    /// Version used by the express install
    pub fn best_version(&self) -> Option<&str> {
        self.recommended
            .as_deref()
            .or_else(|| self.versions.first().map(String::as_str))
    }

    fn defaults() -> Self {
        Self {
            versions: DEFAULT_VERSIONS.iter().map(|v| v.to_string()).collect(),
            recommended: None,
            source: VersionSource::Defaults,
        }
    }
}

/// Numbers following each `nvidia-driver-` in `text`, unique and sorted
/// numerically descending.
fn driver_branches(text: &str) -> Vec<u32> {
    let set: BTreeSet<u32> = text
        .match_indices("nvidia-driver-")
        .filter_map(|(idx, needle)| {
            let digits: String = text[idx + needle.len()..]
                .chars()
                .take_while(char::is_ascii_digit)
                .collect();
            digits.parse().ok()
        })
        .collect();
    set.into_iter().rev().collect()
}

/// Parse `ubuntu-drivers devices`: (branches, recommended branch).
pub fn parse_ubuntu_drivers(output: &str) -> (Vec<String>, Option<String>) {
    let versions = driver_branches(output).iter().map(u32::to_string).collect();
    let recommended = output
        .lines()
        .filter(|line| line.contains("recommended"))
        .find_map(|line| driver_branches(line).first().copied())
        .map(|v| v.to_string());
    (versions, recommended)
}

/// Parse `apt-cache search ^nvidia-driver-[0-9]+$`, keeping modern branches.
pub fn parse_apt_cache(output: &str) -> Vec<String> {
    driver_branches(output)
        .into_iter()
        .filter(|v| *v > MIN_ARCHIVE_BRANCH)
        .map(|v| v.to_string())
        .collect()
}

/// Parse `dnf list available 'akmod-nvidia*'` into major versions.
pub fn parse_dnf_list(output: &str) -> Vec<String> {
    let majors: BTreeSet<u32> = output
        .lines()
        .filter(|line| line.trim_start().starts_with("akmod-nvidia"))
        .filter_map(|line| line.split_whitespace().nth(1))
        .filter_map(|version| {
            // "3:550.67-1.fc39" → 550
            let version = version.rsplit(':').next().unwrap_or(version);
            version.split('.').next()?.parse().ok()
        })
        .collect();
    majors.into_iter().rev().map(|v| v.to_string()).collect()
}

/// Query the host for installable NVIDIA driver branches.
pub fn available_versions(runner: &dyn CommandRunner, kind: PackageManagerKind) -> AvailableVersions {
    match kind {
        PackageManagerKind::Apt => {
            if let Some(output) = runner.run("ubuntu-drivers devices") {
                let (versions, recommended) = parse_ubuntu_drivers(&output);
                if !versions.is_empty() {
                    return AvailableVersions {
                        versions,
                        recommended,
                        source: VersionSource::UbuntuDrivers,
                    };
                }
            }
            if let Some(output) = runner.run("apt-cache search '^nvidia-driver-[0-9]+$'") {
                let versions = parse_apt_cache(&output);
                if !versions.is_empty() {
                    return AvailableVersions {
                        versions,
                        recommended: None,
                        source: VersionSource::AptCache,
                    };
                }
            }
        }
        PackageManagerKind::Dnf => {
            if let Some(output) = runner.run("dnf list available 'akmod-nvidia*'") {
                let versions = parse_dnf_list(&output);
                if !versions.is_empty() {
                    return AvailableVersions {
                        versions,
                        recommended: None,
                        source: VersionSource::Dnf,
                    };
                }
            }
        }
        _ => {}
    }

    tracing::debug!("No driver versions discovered for {}, using defaults", kind);
    AvailableVersions::defaults()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_executor::{ExecutionMode, SystemCommandRunner};

    const UBUNTU_DRIVERS: &str = "== /sys/devices/pci0000:00/0000:00:01.0/0000:01:00.0 ==
vendor   : NVIDIA Corporation
driver   : nvidia-driver-535 - distro non-free recommended
driver   : nvidia-driver-550 - distro non-free
driver   : nvidia-driver-535-open - distro non-free
driver   : nvidia-driver-470 - distro non-free
driver   : xserver-xorg-video-nouveau - distro free builtin";

    #[test]
    fn test_parse_ubuntu_drivers() {
        let (versions, recommended) = parse_ubuntu_drivers(UBUNTU_DRIVERS);
        assert_eq!(versions, vec!["550", "535", "470"]);
        assert_eq!(recommended.as_deref(), Some("535"));
    }

    #[test]
    fn test_parse_apt_cache_filters_old_branches() {
        let output = "nvidia-driver-550 - NVIDIA driver metapackage
nvidia-driver-390 - NVIDIA driver metapackage
nvidia-driver-96 - legacy
nvidia-driver-545 - NVIDIA driver metapackage";
        assert_eq!(parse_apt_cache(output), vec!["550", "545", "390"]);
    }

    #[test]
    fn test_parse_dnf_list() {
        let output = "Available Packages
akmod-nvidia.x86_64          3:550.67-1.fc39         rpmfusion-nonfree-updates
akmod-nvidia-470xx.x86_64    1:470.239.06-1.fc39     rpmfusion-nonfree";
        assert_eq!(parse_dnf_list(output), vec!["550", "470"]);
    }

    #[test]
    fn test_best_version_prefers_recommended() {
        let runner = SystemCommandRunner::new(ExecutionMode::Simulated);
        let available = available_versions(&runner, PackageManagerKind::Apt);
        assert_eq!(available.source, VersionSource::UbuntuDrivers);
        assert_eq!(available.best_version(), Some("535"));
        assert_eq!(available.versions[0], "550");
    }

    #[test]
    fn test_defaults_when_nothing_parses() {
        let runner = SystemCommandRunner::new(ExecutionMode::Simulated);
        let available = available_versions(&runner, PackageManagerKind::Pacman);
        assert_eq!(available.source, VersionSource::Defaults);
        assert_eq!(available.versions, DEFAULT_VERSIONS.to_vec());
        assert_eq!(available.best_version(), Some("550"));
    }
}

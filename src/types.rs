//! Type-safe domain types for gpupilot
//!
//! Vendor names, package manager names and chain step labels are carried as
//! enums instead of strings, so matching is exhaustive and parsing goes through
//! strum rather than ad-hoc string comparisons.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// GPU vendor as classified from an `lspci -vmm` record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
pub enum GpuVendor {
    #[strum(serialize = "NVIDIA")]
    Nvidia,
    #[strum(serialize = "AMD")]
    Amd,
    #[strum(serialize = "Intel")]
    Intel,
    #[default]
    #[strum(serialize = "Unknown")]
    Unknown,
}

impl GpuVendor {
    /// Classify the raw `Vendor:` field of an lspci record.
    ///
    /// NVIDIA is checked first, then AMD ("Advanced Micro Devices" or "AMD"),
    /// then Intel. Anything else is `Unknown`.
    pub fn classify(vendor_field: &str) -> Self {
        if vendor_field.contains("NVIDIA") {
            Self::Nvidia
        } else if vendor_field.contains("Advanced Micro Devices") || vendor_field.contains("AMD") {
            Self::Amd
        } else if vendor_field.contains("Intel") {
            Self::Intel
        } else {
            Self::Unknown
        }
    }

    /// Preference rank on multi-GPU machines (lower wins).
    pub const fn priority(self) -> u8 {
        match self {
            Self::Nvidia => 0,
            Self::Amd => 1,
            Self::Intel => 2,
            Self::Unknown => 3,
        }
    }

    pub fn is_known(self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

/// Package manager family, derived once from the distribution identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum PackageManagerKind {
    Apt,
    Dnf,
    Pacman,
    Zypper,
    #[default]
    None,
}

impl PackageManagerKind {
    /// Returns true when no supported package manager was found.
    pub fn is_unsupported(self) -> bool {
        matches!(self, Self::None)
    }
}

/// Secure Boot state as reported by `mokutil --sb-state`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
pub enum SecureBootState {
    #[strum(serialize = "enabled")]
    Enabled,
    #[strum(serialize = "disabled")]
    Disabled,
    /// mokutil missing or its output could not be read
    #[default]
    #[strum(serialize = "unknown")]
    Unknown,
}

impl SecureBootState {
    pub fn is_enabled(self) -> bool {
        matches!(self, Self::Enabled)
    }
}

/// Semantic role of one step inside a command chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum StepTag {
    Backup,
    Blacklist,
    PrepareDeps,
    RepoUpdate,
    DriverAction,
    Cleanup,
    FinalizeBoot,
}

/// A driver operation requested by the caller.
///
/// Consumed once per transaction. Versions are validated when the chain is
/// built, not when the operation is constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "kebab-case")]
pub enum DriverOperation {
    /// NVIDIA closed driver; `None` lets the package manager pick the best version
    InstallProprietary { version: Option<String> },
    /// NVIDIA open kernel module variant; `None` falls back to the configured default
    InstallOpenKernel { version: Option<String> },
    /// AMD Mesa stack (no proprietary kernel module involved)
    InstallAmdMesa,
    /// Purge NVIDIA packages and restore nouveau; `deep_clean` also wipes leftover configs
    RemoveAllDrivers { deep_clean: bool },
    /// Rewrite mirrors to the nearest country and enable the standard components
    OptimizeRepositories,
}

impl DriverOperation {
    /// Human-readable label used as the transaction's task name.
    pub fn task_name(&self) -> &'static str {
        match self {
            Self::InstallProprietary { .. } => "NVIDIA proprietary driver installation",
            Self::InstallOpenKernel { .. } => "NVIDIA open kernel driver installation",
            Self::InstallAmdMesa => "AMD Mesa installation",
            Self::RemoveAllDrivers { .. } => "Driver removal",
            Self::OptimizeRepositories => "Repository optimization",
        }
    }

    /// Returns true if the operation loads or unloads a kernel module and
    /// therefore needs an initramfs rebuild.
    pub fn touches_kernel_modules(&self) -> bool {
        matches!(
            self,
            Self::InstallProprietary { .. }
                | Self::InstallOpenKernel { .. }
                | Self::RemoveAllDrivers { .. }
        )
    }
}

impl std::fmt::Display for DriverOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InstallProprietary { version: Some(v) } => {
                write!(f, "install-proprietary (v{})", v)
            }
            Self::InstallProprietary { version: None } => write!(f, "install-proprietary (auto)"),
            Self::InstallOpenKernel { version: Some(v) } => {
                write!(f, "install-open-kernel (v{})", v)
            }
            Self::InstallOpenKernel { version: None } => write!(f, "install-open-kernel (default)"),
            Self::InstallAmdMesa => write!(f, "install-amd-mesa"),
            Self::RemoveAllDrivers { deep_clean } => {
                write!(f, "remove-drivers (deep_clean={})", deep_clean)
            }
            Self::OptimizeRepositories => write!(f, "optimize-repositories"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_vendor_classification() {
        assert_eq!(GpuVendor::classify("NVIDIA Corporation"), GpuVendor::Nvidia);
        assert_eq!(
            GpuVendor::classify("Advanced Micro Devices, Inc. [AMD/ATI]"),
            GpuVendor::Amd
        );
        assert_eq!(GpuVendor::classify("Intel Corporation"), GpuVendor::Intel);
        assert_eq!(GpuVendor::classify("VMware"), GpuVendor::Unknown);
        assert_eq!(GpuVendor::classify(""), GpuVendor::Unknown);
    }

    #[test]
    fn test_vendor_priority_order() {
        assert!(GpuVendor::Nvidia.priority() < GpuVendor::Amd.priority());
        assert!(GpuVendor::Amd.priority() < GpuVendor::Intel.priority());
        assert!(GpuVendor::Intel.priority() < GpuVendor::Unknown.priority());
    }

    #[test]
    fn test_package_manager_kind_parse() {
        assert_eq!("apt".parse::<PackageManagerKind>().unwrap(), PackageManagerKind::Apt);
        assert_eq!(PackageManagerKind::Zypper.to_string(), "zypper");
        assert!(PackageManagerKind::None.is_unsupported());
        assert!(!PackageManagerKind::Pacman.is_unsupported());
    }

    #[test]
    fn test_step_tags_are_kebab_case() {
        assert_eq!(StepTag::PrepareDeps.to_string(), "prepare-deps");
        assert_eq!(StepTag::FinalizeBoot.to_string(), "finalize-boot");
        for tag in StepTag::iter() {
            let parsed: StepTag = tag.to_string().parse().unwrap();
            assert_eq!(parsed, tag);
        }
    }

    #[test]
    fn test_operation_labels() {
        let op = DriverOperation::InstallOpenKernel { version: None };
        assert!(op.touches_kernel_modules());
        assert_eq!(op.to_string(), "install-open-kernel (default)");
        assert!(!DriverOperation::InstallAmdMesa.touches_kernel_modules());
        assert!(!DriverOperation::OptimizeRepositories.touches_kernel_modules());
    }
}

//! Hardware detection
//!
//! Runs read-only diagnostic commands (`lspci -vmm`, `lspci -k`,
//! `mokutil --sb-state`, procfs, `/etc/os-release`) and folds their text into a
//! `HardwareSnapshot`.
//!
//! # Design
//!
//! - **Probes return `Result<_, ProbeError>`**: each failure is mapped to a
//!   documented placeholder at the call site in `HardwareDetector::detect`
//! - **Pure parsers**: every `parse_*` function works on text only, so the
//!   parsing rules are unit-testable without a runner
//! - **Snapshot cache**: the detector holds `Option<HardwareSnapshot>`; a
//!   refresh replaces it wholesale, it is never patched field by field

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::command_executor::CommandRunner;
use crate::error::ProbeError;
use crate::package_manager::OsRelease;
use crate::types::{GpuVendor, SecureBootState};

/// Vendor label used when no display controller was found
pub const PLACEHOLDER_VENDOR: &str = "Generic";
/// Model label used when no display controller was found
pub const PLACEHOLDER_MODEL: &str = "Graphics Adapter";
/// Driver label used when no kernel driver could be identified
pub const PLACEHOLDER_DRIVER: &str = "unknown";
/// Value for any `SystemInfo` field whose probe failed
pub const UNKNOWN: &str = "Unknown";

const DISPLAY_CLASSES: [&str; 3] = ["VGA", "3D controller", "Display controller"];

// ============================================================================
// Snapshot types
// ============================================================================

/// The display controller gpupilot will manage
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GpuIdentity {
    pub vendor: GpuVendor,
    /// Normalized vendor label ("NVIDIA", "AMD", "Intel") or the raw lspci
    /// vendor field for other vendors
    pub vendor_name: String,
    pub model: String,
    /// PCI slot ("01:00.0"), used to match the `lspci -k` section
    pub slot: Option<String>,
}

impl GpuIdentity {
    pub fn placeholder() -> Self {
        Self {
            vendor: GpuVendor::Unknown,
            vendor_name: PLACEHOLDER_VENDOR.to_string(),
            model: PLACEHOLDER_MODEL.to_string(),
            slot: None,
        }
    }
}

/// Immutable result of one detection pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HardwareSnapshot {
    pub vendor: GpuVendor,
    pub vendor_name: String,
    pub model: String,
    /// Kernel driver bound to the GPU, lowercase ("nouveau", "nvidia", ...)
    pub active_driver: String,
    pub secure_boot: SecureBootState,
    pub captured_at: DateTime<Utc>,
}

impl HardwareSnapshot {
    /// True only when Secure Boot was positively detected as enabled
    pub fn secure_boot_enabled(&self) -> bool {
        self.secure_boot.is_enabled()
    }

    /// Returns true if the bound driver is `name` (case-insensitive).
    pub fn driver_is(&self, name: &str) -> bool {
        self.active_driver.eq_ignore_ascii_case(name)
    }
}

impl fmt::Display for HardwareSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} (driver: {}, secure boot: {})",
            self.vendor_name, self.model, self.active_driver, self.secure_boot
        )
    }
}

/// Snapshot plus host summary, for diagnostics and the `detect --full` view
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SystemInfo {
    pub gpu: HardwareSnapshot,
    pub cpu: String,
    pub ram: String,
    pub distro: String,
    pub kernel: String,
    pub display_server: String,
}

impl SystemInfo {
    /// Multi-line report written before every transaction
    pub fn diagnostic_report(&self) -> Vec<String> {
        vec![
            "=== System diagnostics ===".to_string(),
            format!("OS: {}", self.distro),
            format!("Kernel: {}", self.kernel),
            format!("CPU: {}", self.cpu),
            format!("RAM: {}", self.ram),
            format!("GPU: {} {}", self.gpu.vendor_name, self.gpu.model),
            format!("Active driver: {}", self.gpu.active_driver),
            format!("Secure Boot: {}", self.gpu.secure_boot),
            format!("Display server: {}", self.display_server),
        ]
    }
}

// ============================================================================
// Parsers
// ============================================================================

fn record_fields(record: &str) -> impl Iterator<Item = (&str, &str)> {
    record
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim(), v.trim()))
}

fn record_field<'a>(record: &'a str, key: &str) -> Option<&'a str> {
    record_fields(record).find(|(k, _)| *k == key).map(|(_, v)| v)
}

fn is_display_class(class: &str) -> bool {
    DISPLAY_CLASSES.iter().any(|c| class.contains(c))
}

/// Pick the managed GPU from `lspci -vmm` output.
///
/// Records are blank-line separated `Key:\tValue` blocks. Among records whose
/// `Class` is a display class, the first NVIDIA record wins, else the first
/// AMD, else the first Intel, else the first display record of any vendor.
pub fn parse_lspci_vmm(output: &str) -> Result<GpuIdentity, ProbeError> {
    let mut best: Option<(u8, GpuIdentity)> = None;

    let display_records = output
        .split("\n\n")
        .filter(|record| record_field(record, "Class").is_some_and(is_display_class));

    for record in display_records {
        let vendor_field = record_field(record, "Vendor").unwrap_or("");
        let vendor = GpuVendor::classify(vendor_field);
        let rank = vendor.priority();

        // Strictly lower rank replaces; ties keep the earlier record
        if best.as_ref().is_some_and(|(r, _)| *r <= rank) {
            continue;
        }

        let vendor_name = if vendor.is_known() {
            vendor.to_string()
        } else {
            vendor_field.to_string()
        };
        best = Some((
            rank,
            GpuIdentity {
                vendor,
                vendor_name,
                model: record_field(record, "Device")
                    .filter(|d| !d.is_empty())
                    .unwrap_or(PLACEHOLDER_MODEL)
                    .to_string(),
                slot: record_field(record, "Slot").map(str::to_string),
            },
        ));

        if vendor == GpuVendor::Nvidia {
            break;
        }
    }

    match best {
        Some((_, gpu)) if !gpu.vendor_name.is_empty() => Ok(gpu),
        _ => Err(ProbeError::unparseable("display controller in lspci -vmm")),
    }
}

/// Find the kernel driver bound to a display controller in `lspci -k` output.
///
/// When `slot` is given and a display section starts with it, that section's
/// driver is returned; otherwise the first display section with a driver line.
pub fn parse_active_driver(output: &str, slot: Option<&str>) -> Result<String, ProbeError> {
    let mut current_slot: Option<&str> = None;
    let mut first_match: Option<&str> = None;

    for line in output.lines() {
        let indented = line.starts_with(char::is_whitespace);
        if !indented {
            current_slot = if is_display_class(line) {
                line.split_whitespace().next()
            } else {
                None
            };
            continue;
        }

        let Some(section) = current_slot else { continue };
        let Some((_, driver)) = line.split_once("Kernel driver in use:") else {
            continue;
        };
        let driver = driver.trim();
        if driver.is_empty() {
            continue;
        }

        // lspci -k prints slots without the PCI domain unless -D is given
        let wanted = slot.is_some_and(|s| s.ends_with(section) || section.ends_with(s));
        if wanted {
            return Ok(driver.to_lowercase());
        }
        if first_match.is_none() {
            first_match = Some(driver);
        }
    }

    first_match
        .map(str::to_lowercase)
        .ok_or_else(|| ProbeError::unparseable("kernel driver in lspci -k"))
}

/// Interpret `mokutil --sb-state` output.
pub fn parse_secure_boot(output: &str) -> SecureBootState {
    if output.contains("SecureBoot enabled") {
        SecureBootState::Enabled
    } else {
        SecureBootState::Disabled
    }
}

/// First `model name` entry of `/proc/cpuinfo`
pub fn parse_cpu_model(cpuinfo: &str) -> Result<String, ProbeError> {
    cpuinfo
        .lines()
        .filter(|line| line.starts_with("model name"))
        .find_map(|line| line.split_once(':'))
        .map(|(_, v)| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ProbeError::unparseable("model name in /proc/cpuinfo"))
}

/// Total memory from `LC_ALL=C free -h`, with `Gi`/`Mi` rewritten as GB/MB
pub fn parse_free_total(output: &str) -> Result<String, ProbeError> {
    output
        .lines()
        .find(|line| line.starts_with("Mem:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .map(|total| total.replace("Gi", " GB").replace("Mi", " MB"))
        .ok_or_else(|| ProbeError::unparseable("Mem: line in free -h"))
}

// ============================================================================
// Probes
// ============================================================================

fn run_probe(runner: &dyn CommandRunner, command: &str) -> Result<String, ProbeError> {
    runner
        .run(command)
        .ok_or_else(|| ProbeError::command_failed(command))
}

fn require_tool(runner: &dyn CommandRunner, tool: &str) -> Result<(), ProbeError> {
    if runner.tool_available(tool) {
        Ok(())
    } else {
        Err(ProbeError::ToolMissing(tool.to_string()))
    }
}

pub fn probe_gpu(runner: &dyn CommandRunner) -> Result<GpuIdentity, ProbeError> {
    require_tool(runner, "lspci")?;
    parse_lspci_vmm(&run_probe(runner, "lspci -vmm")?)
}

pub fn probe_active_driver(
    runner: &dyn CommandRunner,
    slot: Option<&str>,
) -> Result<String, ProbeError> {
    require_tool(runner, "lspci")?;
    parse_active_driver(&run_probe(runner, "lspci -k")?, slot)
}

pub fn probe_secure_boot(runner: &dyn CommandRunner) -> Result<SecureBootState, ProbeError> {
    require_tool(runner, "mokutil")?;
    Ok(parse_secure_boot(&run_probe(runner, "mokutil --sb-state")?))
}

pub fn probe_cpu(runner: &dyn CommandRunner) -> Result<String, ProbeError> {
    parse_cpu_model(&runner.read_file(Path::new("/proc/cpuinfo"))?)
}

pub fn probe_ram(runner: &dyn CommandRunner) -> Result<String, ProbeError> {
    parse_free_total(&run_probe(runner, "LC_ALL=C free -h")?)
}

pub fn probe_distro(runner: &dyn CommandRunner) -> Result<String, ProbeError> {
    let os = OsRelease::load(runner)?;
    os.pretty_name()
        .map(str::to_string)
        .ok_or_else(|| ProbeError::unparseable("PRETTY_NAME in /etc/os-release"))
}

pub fn probe_kernel(runner: &dyn CommandRunner) -> Result<String, ProbeError> {
    run_probe(runner, "uname -r")
}

fn probe_display_server() -> Result<String, ProbeError> {
    std::env::var("XDG_SESSION_TYPE")
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ProbeError::unparseable("XDG_SESSION_TYPE"))
}

fn or_unknown(field: &str, result: Result<String, ProbeError>) -> String {
    result.unwrap_or_else(|e| {
        debug!("{} probe failed: {}", field, e);
        UNKNOWN.to_string()
    })
}

// ============================================================================
// Detector
// ============================================================================

/// Runs the probes and caches the resulting snapshot
///
/// `Undetected` (no snapshot) → `Detected` on the first `detect()`. A forced
/// refresh probes again and replaces the snapshot.
pub struct HardwareDetector {
    runner: Arc<dyn CommandRunner>,
    snapshot: Option<HardwareSnapshot>,
}

impl HardwareDetector {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            snapshot: None,
        }
    }

    pub fn is_detected(&self) -> bool {
        self.snapshot.is_some()
    }

    /// Cached snapshot, if any, without probing.
    pub fn cached(&self) -> Option<&HardwareSnapshot> {
        self.snapshot.as_ref()
    }

    /// Return the cached snapshot, or probe and cache a new one.
    ///
    /// Without `force_refresh` a cached snapshot is returned and no command runs.
    pub fn detect(&mut self, force_refresh: bool) -> HardwareSnapshot {
        if !force_refresh {
            if let Some(snapshot) = &self.snapshot {
                return snapshot.clone();
            }
        }

        let runner = self.runner.as_ref();

        let gpu = probe_gpu(runner).unwrap_or_else(|e| {
            debug!("GPU probe failed, using placeholder: {}", e);
            GpuIdentity::placeholder()
        });

        let active_driver = probe_active_driver(runner, gpu.slot.as_deref()).unwrap_or_else(|e| {
            debug!("Driver probe failed: {}", e);
            PLACEHOLDER_DRIVER.to_string()
        });

        let secure_boot = probe_secure_boot(runner).unwrap_or_else(|e| {
            debug!("Secure Boot state inconclusive: {}", e);
            SecureBootState::Unknown
        });

        let snapshot = HardwareSnapshot {
            vendor: gpu.vendor,
            vendor_name: gpu.vendor_name,
            model: gpu.model,
            active_driver,
            secure_boot,
            captured_at: Utc::now(),
        };
        info!("Hardware detected: {}", snapshot);

        self.snapshot = Some(snapshot.clone());
        snapshot
    }

    /// Snapshot plus CPU, RAM, distribution, kernel and session type.
    /// Each field degrades to "Unknown" on its own.
    pub fn get_full_system_info(&mut self) -> SystemInfo {
        let gpu = self.detect(false);
        let runner = self.runner.as_ref();

        SystemInfo {
            gpu,
            cpu: or_unknown("CPU", probe_cpu(runner)),
            ram: or_unknown("RAM", probe_ram(runner)),
            distro: or_unknown("Distribution", probe_distro(runner)),
            kernel: or_unknown("Kernel", probe_kernel(runner)),
            display_server: or_unknown("Display server", probe_display_server()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RTX_AND_INTEL: &str = "Slot:\t00:02.0
Class:\tVGA compatible controller
Vendor:\tIntel Corporation
Device:\tAlderLake-S GT1

Slot:\t01:00.0
Class:\tVGA compatible controller
Vendor:\tNVIDIA Corporation
Device:\tGeForce RTX 4060
SVendor:\tASUSTeK Computer Inc.
Rev:\ta1
";

    #[test]
    fn test_nvidia_preferred_over_earlier_intel() {
        let gpu = parse_lspci_vmm(RTX_AND_INTEL).unwrap();
        assert_eq!(gpu.vendor, GpuVendor::Nvidia);
        assert_eq!(gpu.vendor_name, "NVIDIA");
        assert_eq!(gpu.model, "GeForce RTX 4060");
        assert_eq!(gpu.slot.as_deref(), Some("01:00.0"));
    }

    #[test]
    fn test_missing_device_field_uses_placeholder_model() {
        let output = "Slot:\t01:00.0
Class:\tVGA compatible controller
Vendor:\tNVIDIA Corporation
";
        let gpu = parse_lspci_vmm(output).unwrap();
        assert_eq!(gpu.vendor, GpuVendor::Nvidia);
        assert_eq!(gpu.model, PLACEHOLDER_MODEL);
    }

    #[test]
    fn test_amd_detection() {
        let output = "Slot:\t03:00.0
Class:\tVGA compatible controller
Vendor:\tAdvanced Micro Devices, Inc. [AMD/ATI]
Device:\tNavi 21 [Radeon RX 6800/6800 XT / 6900 XT]
";
        let gpu = parse_lspci_vmm(output).unwrap();
        assert_eq!(gpu.vendor, GpuVendor::Amd);
        assert!(gpu.model.contains("Radeon RX 6800"));
    }

    #[test]
    fn test_unknown_vendor_keeps_first_display_record() {
        let output = "Slot:\t00:0f.0
Class:\tVGA compatible controller
Vendor:\tVMware
Device:\tSVGA II Adapter

Slot:\t00:10.0
Class:\tDisplay controller
Vendor:\tRed Hat, Inc.
Device:\tVirtio GPU
";
        let gpu = parse_lspci_vmm(output).unwrap();
        assert_eq!(gpu.vendor, GpuVendor::Unknown);
        assert_eq!(gpu.vendor_name, "VMware");
        assert_eq!(gpu.model, "SVGA II Adapter");
    }

    #[test]
    fn test_non_display_records_ignored() {
        let output = "Slot:\t00:1f.3
Class:\tAudio device
Vendor:\tNVIDIA Corporation
Device:\tAD107 High Definition Audio Controller
";
        assert!(parse_lspci_vmm(output).is_err());
        assert!(parse_lspci_vmm("").is_err());
    }

    #[test]
    fn test_active_driver_follows_gpu_section() {
        let output = "00:1f.3 Audio device: Intel Corporation Device 51c8
\tKernel driver in use: snd_hda_intel
01:00.0 VGA compatible controller: NVIDIA Corporation AD107 [GeForce RTX 4060]
\tSubsystem: ASUSTeK Computer Inc. Device 88b8
\tKernel driver in use: Nouveau
\tKernel modules: nvidiafb, nouveau";
        assert_eq!(parse_active_driver(output, None).unwrap(), "nouveau");
    }

    #[test]
    fn test_active_driver_prefers_selected_slot() {
        let output = "00:02.0 VGA compatible controller: Intel Corporation AlderLake-S GT1
\tKernel driver in use: i915
01:00.0 3D controller: NVIDIA Corporation AD107M
\tKernel driver in use: nvidia";
        assert_eq!(parse_active_driver(output, Some("01:00.0")).unwrap(), "nvidia");
        assert_eq!(parse_active_driver(output, Some("0000:01:00.0")).unwrap(), "nvidia");
        assert_eq!(parse_active_driver(output, None).unwrap(), "i915");
    }

    #[test]
    fn test_active_driver_missing() {
        let output = "01:00.0 VGA compatible controller: NVIDIA Corporation AD107\n\tKernel modules: nouveau";
        assert!(parse_active_driver(output, None).is_err());
    }

    #[test]
    fn test_secure_boot_phrase() {
        assert_eq!(parse_secure_boot("SecureBoot enabled"), SecureBootState::Enabled);
        assert_eq!(parse_secure_boot("SecureBoot disabled"), SecureBootState::Disabled);
        assert_eq!(
            parse_secure_boot("SecureBoot disabled\nPlatform is in Setup Mode"),
            SecureBootState::Disabled
        );
    }

    #[test]
    fn test_cpu_and_ram_parsers() {
        let cpuinfo = "processor\t: 0\nvendor_id\t: GenuineIntel\nmodel name\t: AMD Ryzen 7 7840U\n";
        assert_eq!(parse_cpu_model(cpuinfo).unwrap(), "AMD Ryzen 7 7840U");
        assert!(parse_cpu_model("processor : 0").is_err());

        let free = "               total        used\nMem:            15Gi       6.1Gi\nSwap:          2.0Gi          0B";
        assert_eq!(parse_free_total(free).unwrap(), "15 GB");
        let free = "Mem:           982Mi       500Mi";
        assert_eq!(parse_free_total(free).unwrap(), "982 MB");
        assert!(parse_free_total("garbage").is_err());
    }

    #[test]
    fn test_diagnostic_report_lines() {
        let info = SystemInfo {
            gpu: HardwareSnapshot {
                vendor: GpuVendor::Nvidia,
                vendor_name: "NVIDIA".into(),
                model: "GeForce RTX 4060".into(),
                active_driver: "nouveau".into(),
                secure_boot: SecureBootState::Enabled,
                captured_at: Utc::now(),
            },
            cpu: "i7".into(),
            ram: "15 GB".into(),
            distro: "Ubuntu 22.04.3 LTS".into(),
            kernel: "6.5.0-14-generic".into(),
            display_server: UNKNOWN.into(),
        };
        let report = info.diagnostic_report();
        assert!(report.contains(&"Kernel: 6.5.0-14-generic".to_string()));
        assert!(report.contains(&"GPU: NVIDIA GeForce RTX 4060".to_string()));
        assert!(report.contains(&"Secure Boot: enabled".to_string()));
    }
}

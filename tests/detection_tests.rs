//! Hardware detection against scripted probe output

mod common;

use std::sync::Arc;

use common::{ScriptedRunner, ubuntu_host};
use gpupilot::hardware::{HardwareDetector, PLACEHOLDER_MODEL, PLACEHOLDER_VENDOR, UNKNOWN};
use gpupilot::types::{GpuVendor, SecureBootState};

#[test]
fn test_rtx_4060_with_intel_igpu_end_to_end() {
    let runner = Arc::new(ubuntu_host());
    let mut detector = HardwareDetector::new(runner.clone());

    let snapshot = detector.detect(false);
    assert_eq!(snapshot.vendor, GpuVendor::Nvidia);
    assert_eq!(snapshot.vendor_name, "NVIDIA");
    assert!(snapshot.model.contains("GeForce RTX 4060"));
    // The Intel section comes first in lspci -k; the slot picks the NVIDIA one
    assert_eq!(snapshot.active_driver, "nouveau");
    assert_eq!(snapshot.secure_boot, SecureBootState::Disabled);
    assert!(!snapshot.secure_boot_enabled());
}

#[test]
fn test_detect_caches_until_forced() {
    let runner = Arc::new(ubuntu_host());
    let mut detector = HardwareDetector::new(runner.clone());
    assert!(!detector.is_detected());

    let first = detector.detect(false);
    let second = detector.detect(false);
    assert_eq!(first, second);
    assert_eq!(runner.count_calls("lspci -vmm"), 1);
    assert_eq!(runner.count_calls("lspci -k"), 1);
    assert_eq!(runner.count_calls("mokutil"), 1);

    detector.detect(true);
    assert_eq!(runner.count_calls("lspci -vmm"), 2);
    assert_eq!(runner.count_calls("mokutil"), 2);
}

#[test]
fn test_no_display_record_yields_placeholder() {
    let runner = Arc::new(
        ScriptedRunner::new()
            .respond(
                "lspci -vmm",
                "Slot:\t00:1f.3\nClass:\tAudio device\nVendor:\tIntel Corporation\nDevice:\tHD Audio",
            )
            .respond("lspci -k", "00:1f.3 Audio device: Intel Corporation\n\tKernel driver in use: snd_hda_intel"),
    );
    let snapshot = HardwareDetector::new(runner).detect(false);

    assert_eq!(snapshot.vendor, GpuVendor::Unknown);
    assert_eq!(snapshot.vendor_name, PLACEHOLDER_VENDOR);
    assert_eq!(snapshot.model, PLACEHOLDER_MODEL);
    assert!(!snapshot.vendor_name.is_empty());
}

#[test]
fn test_missing_mokutil_is_inconclusive_not_disabled() {
    let runner = Arc::new(ubuntu_host().without_tool("mokutil"));
    let snapshot = HardwareDetector::new(runner.clone()).detect(false);

    assert_eq!(snapshot.secure_boot, SecureBootState::Unknown);
    assert!(!snapshot.secure_boot_enabled());
    assert_eq!(runner.count_calls("mokutil"), 0);
}

#[test]
fn test_every_probe_failing_still_detects() {
    let runner = Arc::new(ScriptedRunner::new());
    let mut detector = HardwareDetector::new(runner);

    let info = detector.get_full_system_info();
    assert_eq!(info.gpu.model, PLACEHOLDER_MODEL);
    assert_eq!(info.cpu, UNKNOWN);
    assert_eq!(info.ram, UNKNOWN);
    assert_eq!(info.distro, UNKNOWN);
    assert_eq!(info.kernel, UNKNOWN);
}

#[test]
fn test_full_system_info_reuses_snapshot() {
    let runner = Arc::new(ubuntu_host());
    let mut detector = HardwareDetector::new(runner.clone());
    detector.detect(false);

    let info = detector.get_full_system_info();
    assert_eq!(runner.count_calls("lspci -vmm"), 1);
    assert_eq!(info.cpu, "AMD Ryzen 7 7840HS");
    assert_eq!(info.ram, "15 GB");
    assert_eq!(info.distro, "Ubuntu 24.04 LTS");
    assert_eq!(info.kernel, "6.5.0-14-generic");

    let report = info.diagnostic_report();
    assert!(report.iter().any(|l| l == "GPU: NVIDIA GeForce RTX 4060"));
    assert!(report.iter().any(|l| l == "Active driver: nouveau"));
}

//! Live GPU and system statistics
//!
//! Every field falls back to zero when its source is missing or unreadable,
//! so a dashboard can poll this without special-casing hosts that lack an
//! NVIDIA card or thermal sensors.

use serde::Serialize;
use std::path::Path;
use tracing::debug;

use crate::command_executor::CommandRunner;
use crate::error::ProbeError;

const NVIDIA_SMI_QUERY: &str = "nvidia-smi --query-gpu=temperature.gpu,utilization.gpu,memory.used,memory.total --format=csv,noheader,nounits";
const LOADAVG: &str = "/proc/loadavg";
const MEMINFO: &str = "/proc/meminfo";
const CPU_THERMAL_ZONE: &str = "/sys/class/thermal/thermal_zone0/temp";

/// NVIDIA GPU readings (°C, %, MiB)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GpuStats {
    pub temp: u32,
    pub load: u32,
    pub mem_used: u32,
    pub mem_total: u32,
}

/// Host readings: load and RAM percentages, RAM in MB, CPU temperature in °C
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SystemStats {
    pub cpu_load: u32,
    pub ram_used: u64,
    pub ram_total: u64,
    pub ram_percent: u32,
    pub cpu_temp: u32,
}

// ============================================================================
// Parsers
// ============================================================================

/// Parse one `nvidia-smi` CSV row: `temp, util, mem.used, mem.total`.
pub fn parse_nvidia_smi(output: &str) -> Result<GpuStats, ProbeError> {
    let row = output.lines().next().unwrap_or_default();
    let fields: Vec<u32> = row
        .split(',')
        .map(|f| f.trim().parse::<u32>())
        .collect::<Result<_, _>>()
        .map_err(|_| ProbeError::unparseable("nvidia-smi query"))?;

    match fields[..] {
        [temp, load, mem_used, mem_total, ..] => Ok(GpuStats {
            temp,
            load,
            mem_used,
            mem_total,
        }),
        _ => Err(ProbeError::unparseable("nvidia-smi query")),
    }
}

/// One-minute load average as a percentage of `cores`, capped at 100.
pub fn parse_loadavg(loadavg: &str, cores: usize) -> Result<u32, ProbeError> {
    let load: f64 = loadavg
        .split_whitespace()
        .next()
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| ProbeError::unparseable("/proc/loadavg"))?;
    let percent = load / cores.max(1) as f64 * 100.0;
    Ok(percent.clamp(0.0, 100.0) as u32)
}

/// `MemTotal - MemAvailable` from `/proc/meminfo`, in whole MB.
pub fn parse_meminfo(meminfo: &str) -> Result<(u64, u64), ProbeError> {
    let field = |key: &str| -> Option<u64> {
        meminfo.lines().find_map(|line| {
            let mut parts = line.split_whitespace();
            if parts.next()?.trim_end_matches(':') != key {
                return None;
            }
            parts.next()?.parse().ok()
        })
    };

    let total = field("MemTotal").ok_or_else(|| ProbeError::unparseable("MemTotal"))? / 1024;
    let available = field("MemAvailable").ok_or_else(|| ProbeError::unparseable("MemAvailable"))? / 1024;
    Ok((total.saturating_sub(available), total))
}

/// Millidegrees to whole degrees.
pub fn parse_thermal(raw: &str) -> Result<u32, ProbeError> {
    raw.trim()
        .parse::<i64>()
        .map(|milli| (milli / 1000).max(0) as u32)
        .map_err(|_| ProbeError::unparseable("thermal zone"))
}

// ============================================================================
// Collection
// ============================================================================

pub fn gpu_stats(runner: &dyn CommandRunner) -> GpuStats {
    if !runner.tool_available("nvidia-smi") {
        return GpuStats::default();
    }
    runner
        .run(NVIDIA_SMI_QUERY)
        .ok_or_else(|| ProbeError::command_failed(NVIDIA_SMI_QUERY))
        .and_then(|out| parse_nvidia_smi(&out))
        .unwrap_or_else(|e| {
            debug!("GPU stats unavailable: {}", e);
            GpuStats::default()
        })
}

fn logical_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn read_with<T>(
    runner: &dyn CommandRunner,
    path: &str,
    parse: impl FnOnce(&str) -> Result<T, ProbeError>,
) -> Option<T> {
    runner
        .read_file(Path::new(path))
        .map_err(ProbeError::from)
        .and_then(|raw| parse(&raw))
        .map_err(|e| debug!("{}: {}", path, e))
        .ok()
}

pub fn system_stats(runner: &dyn CommandRunner) -> SystemStats {
    let mut stats = SystemStats::default();

    if let Some(load) = read_with(runner, LOADAVG, |raw| parse_loadavg(raw, logical_cores())) {
        stats.cpu_load = load;
    }
    if let Some((used, total)) = read_with(runner, MEMINFO, parse_meminfo) {
        stats.ram_used = used;
        stats.ram_total = total;
        if total > 0 {
            stats.ram_percent = (used * 100 / total) as u32;
        }
    }
    if let Some(temp) = read_with(runner, CPU_THERMAL_ZONE, parse_thermal) {
        stats.cpu_temp = temp;
    }
    stats
}

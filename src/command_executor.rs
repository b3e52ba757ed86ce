//! command_executor.rs - Synchronous command execution behind a trait.
//!
//! Every process gpupilot starts goes through a `CommandRunner`. The system
//! implementation spawns real processes; on hosts that are not Linux (or when
//! simulation is forced) it answers a fixed table of diagnostic commands with
//! canned output so detection and orchestration can be exercised without root.
//!
//! Two call shapes exist:
//!
//! - `run` / `run_full` take a shell command string. They are used for
//!   read-only probes (`lspci -vmm`, `mokutil --sb-state`, ...).
//! - `run_program` takes an argv. It is used for the elevation helper, which
//!   receives the whole joined chain as one argument and needs no outer quoting.
//!
//! Nothing here retries or times out; callers run transactions off the UI
//! thread (see `worker`).

use serde::Serialize;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::chain::shell_quote;
use crate::process_guard::CommandProcessGroup;

/// Exit code reported when a process could not be spawned or waited on
pub const SPAWN_FAILURE_EXIT_CODE: i32 = -1;

/// Environment variable forcing simulated execution on Linux hosts
pub const SIMULATE_ENV_VAR: &str = "GPUPILOT_SIMULATE";

/// Captured outcome of one command
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct CommandOutput {
    pub exit_code: i32,
    /// Trimmed standard output
    pub stdout: String,
    /// Trimmed standard error
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Output for a command that never ran: sentinel exit code and the error text.
    pub fn spawn_failure(err: impl std::fmt::Display) -> Self {
        Self {
            exit_code: SPAWN_FAILURE_EXIT_CODE,
            stdout: String::new(),
            stderr: err.to_string(),
        }
    }

    fn from_output(output: std::process::Output) -> Self {
        Self {
            // Killed by a signal: no exit code
            exit_code: output.status.code().unwrap_or(SPAWN_FAILURE_EXIT_CODE),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
    }
}

/// Abstraction over process execution
///
/// Implementations must never panic and never return an error for a failed
/// command: failures are expressed through `CommandOutput`.
pub trait CommandRunner: Send + Sync {
    /// Run a shell command and capture exit code, stdout and stderr.
    fn run_full(&self, command: &str) -> CommandOutput;

    /// Run `program` with `args` directly (no shell in between).
    fn run_program(&self, program: &str, args: &[String]) -> CommandOutput;

    /// Returns true if `tool` can be found on PATH.
    fn tool_available(&self, tool: &str) -> bool;

    /// Read a text file (procfs, sysfs, /etc).
    fn read_file(&self, path: &Path) -> std::io::Result<String> {
        std::fs::read_to_string(path)
    }

    /// Run a low-stakes probe. Returns trimmed stdout on exit code 0, `None`
    /// otherwise.
    fn run(&self, command: &str) -> Option<String> {
        let output = self.run_full(command);
        if output.success() {
            Some(output.stdout)
        } else {
            debug!(
                "Command failed (exit {}): {} - {}",
                output.exit_code, command, output.stderr
            );
            None
        }
    }
}

/// How `SystemCommandRunner` executes commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Spawn real processes
    Native,
    /// Answer from the canned table, never spawn anything
    Simulated,
}

impl ExecutionMode {
    /// Simulated on non-Linux hosts, when `force_simulation` is set, or when
    /// `GPUPILOT_SIMULATE` is truthy; native otherwise.
    pub fn detect(force_simulation: bool) -> Self {
        let env_forced = std::env::var(SIMULATE_ENV_VAR)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        if !cfg!(target_os = "linux") || force_simulation || env_forced {
            Self::Simulated
        } else {
            Self::Native
        }
    }

    pub fn is_simulated(self) -> bool {
        matches!(self, Self::Simulated)
    }
}

/// `CommandRunner` backed by `std::process::Command`
#[derive(Debug, Clone)]
pub struct SystemCommandRunner {
    mode: ExecutionMode,
}

impl SystemCommandRunner {
    pub fn new(mode: ExecutionMode) -> Self {
        if mode.is_simulated() {
            info!("Command execution is simulated; no process will be spawned");
        }
        Self { mode }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }
}

impl CommandRunner for SystemCommandRunner {
    fn run_full(&self, command: &str) -> CommandOutput {
        if self.mode.is_simulated() {
            return simulate(command);
        }

        debug!("Executing: {}", command);
        match Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .in_new_process_group()
            .output()
        {
            Ok(output) => CommandOutput::from_output(output),
            Err(e) => {
                warn!("Failed to spawn '{}': {}", command, e);
                CommandOutput::spawn_failure(e)
            }
        }
    }

    fn run_program(&self, program: &str, args: &[String]) -> CommandOutput {
        if self.mode.is_simulated() {
            return simulate(&display_invocation(program, args));
        }

        debug!("Executing program: {} ({} args)", program, args.len());
        match Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .in_new_process_group()
            .output()
        {
            Ok(output) => CommandOutput::from_output(output),
            Err(e) => {
                warn!("Failed to spawn '{}': {}", program, e);
                CommandOutput::spawn_failure(e)
            }
        }
    }

    fn tool_available(&self, tool: &str) -> bool {
        if self.mode.is_simulated() {
            return true;
        }
        which::which(tool).is_ok()
    }

    fn read_file(&self, path: &Path) -> std::io::Result<String> {
        if self.mode.is_simulated() {
            return simulated_file(path).map(str::to_string).ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("{} is not simulated", path.display()),
                )
            });
        }
        std::fs::read_to_string(path)
    }
}

/// Wraps another runner: read-only probes pass through, privileged
/// invocations (`run_program`) are recorded and reported as successful.
pub struct DryRunRunner<R: CommandRunner> {
    inner: R,
    recorded: Mutex<Vec<String>>,
}

impl<R: CommandRunner> DryRunRunner<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            recorded: Mutex::new(Vec::new()),
        }
    }

    /// Invocations that would have been executed, in order.
    pub fn recorded(&self) -> Vec<String> {
        self.recorded
            .lock()
            .map(|r| r.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

impl<R: CommandRunner> CommandRunner for DryRunRunner<R> {
    fn run_full(&self, command: &str) -> CommandOutput {
        self.inner.run_full(command)
    }

    fn run_program(&self, program: &str, args: &[String]) -> CommandOutput {
        let invocation = display_invocation(program, args);
        info!("[dry-run] would execute: {}", invocation);
        match self.recorded.lock() {
            Ok(mut recorded) => recorded.push(invocation),
            Err(poisoned) => poisoned.into_inner().push(invocation),
        }
        CommandOutput {
            exit_code: 0,
            stdout: "[dry-run] not executed".to_string(),
            stderr: String::new(),
        }
    }

    fn tool_available(&self, tool: &str) -> bool {
        self.inner.tool_available(tool)
    }

    fn read_file(&self, path: &Path) -> std::io::Result<String> {
        self.inner.read_file(path)
    }
}

/// Render an argv as a copy-pasteable shell line
pub fn display_invocation(program: &str, args: &[String]) -> String {
    std::iter::once(shell_quote(program))
        .chain(args.iter().map(|a| shell_quote(a)))
        .collect::<Vec<_>>()
        .join(" ")
}

// ============================================================================
// Simulation table
// ============================================================================

const SIM_LSPCI_VMM: &str = "Slot:\t01:00.0
Class:\tVGA compatible controller
Vendor:\tNVIDIA Corporation
Device:\tGeForce RTX 4060
SVendor:\tASUSTeK Computer Inc.
SDevice:\tDevice 88b8
Rev:\ta1

Slot:\t00:02.0
Class:\tVGA compatible controller
Vendor:\tIntel Corporation
Device:\tAlderLake-S GT1
";

const SIM_LSPCI_K: &str = "01:00.0 VGA compatible controller: NVIDIA Corporation AD107 [GeForce RTX 4060]
\tSubsystem: ASUSTeK Computer Inc. Device 88b8
\tKernel driver in use: nouveau
\tKernel modules: nvidiafb, nouveau";

const SIM_UBUNTU_DRIVERS: &str = "== /sys/devices/pci0000:00/0000:00:01.0/0000:01:00.0 ==
modalias : pci:v000010DEd00002882sv00001043sd000088B8bc03sc00i00
vendor   : NVIDIA Corporation
model    : AD107 [GeForce RTX 4060]
driver   : nvidia-driver-535 - distro non-free recommended
driver   : nvidia-driver-550 - distro non-free
driver   : nvidia-driver-535-open - distro non-free
driver   : nvidia-driver-470 - distro non-free
driver   : xserver-xorg-video-nouveau - distro free builtin";

const SIM_OS_RELEASE: &str = "PRETTY_NAME=\"Ubuntu 22.04.3 LTS\"
NAME=\"Ubuntu\"
VERSION_ID=\"22.04\"
ID=ubuntu
ID_LIKE=debian";

const SIM_CPUINFO: &str = "model name\t: 12th Gen Intel(R) Core(TM) i7-12700H";

const SIM_FREE: &str = "               total        used        free      shared  buff/cache   available
Mem:            15Gi       6.1Gi       2.3Gi       512Mi       7.0Gi       8.8Gi
Swap:          2.0Gi          0B       2.0Gi";

/// Canned answer for a recognized command pattern; empty output otherwise.
/// Simulated commands always exit 0.
fn simulate(command: &str) -> CommandOutput {
    info!("[SIMULATION] {}", command);
    let stdout = if command.contains("pkexec") {
        "Success"
    } else if command.contains("lspci") && command.contains("-vmm") {
        SIM_LSPCI_VMM
    } else if command.contains("lspci") && command.contains("-k") {
        SIM_LSPCI_K
    } else if command.contains("mokutil") {
        "SecureBoot enabled"
    } else if command.contains("uname -r") {
        "6.5.0-14-generic"
    } else if command.contains("ubuntu-drivers devices") {
        SIM_UBUNTU_DRIVERS
    } else if command.contains("os-release") {
        SIM_OS_RELEASE
    } else if command.contains("cpuinfo") {
        SIM_CPUINFO
    } else if command.contains("free -h") {
        SIM_FREE
    } else if command.contains("nvidia-smi") {
        "46, 12, 812, 8188"
    } else if command.contains("prime-select query") {
        "on-demand"
    } else {
        ""
    };

    CommandOutput {
        exit_code: 0,
        stdout: stdout.trim().to_string(),
        stderr: String::new(),
    }
}

fn simulated_file(path: &Path) -> Option<&'static str> {
    match path.to_str()? {
        "/etc/os-release" => Some(SIM_OS_RELEASE),
        "/proc/cpuinfo" => Some(SIM_CPUINFO),
        "/proc/loadavg" => Some("1.52 1.31 1.20 2/1187 48213"),
        "/proc/meminfo" => Some("MemTotal:       16006504 kB\nMemFree:         2411460 kB\nMemAvailable:    9227140 kB"),
        "/sys/class/thermal/thermal_zone0/temp" => Some("48000"),
        "/etc/default/grub" => Some("GRUB_DEFAULT=0\nGRUB_TIMEOUT=5\nGRUB_CMDLINE_LINUX_DEFAULT=\"quiet splash\"\nGRUB_CMDLINE_LINUX=\"\""),
        _ => None,
    }
}

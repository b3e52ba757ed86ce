//! Scripted `CommandRunner` shared by the integration tests
//!
//! Probes are answered by substring match against the command line. Elevated
//! calls (`run_program`) pop results from a queue and default to success.
//! Every invocation is recorded so tests can count probes and inspect the
//! exact script handed to the elevation helper.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use gpupilot::command_executor::{CommandOutput, CommandRunner, SPAWN_FAILURE_EXIT_CODE};

#[derive(Default)]
pub struct ScriptedRunner {
    responses: Vec<(String, CommandOutput)>,
    files: HashMap<PathBuf, String>,
    missing_tools: HashSet<String>,
    program_results: Mutex<VecDeque<CommandOutput>>,
    calls: Mutex<Vec<String>>,
    program_calls: Mutex<Vec<(String, Vec<String>)>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands containing `pattern` with `stdout` and exit 0.
    pub fn respond(mut self, pattern: &str, stdout: &str) -> Self {
        self.responses.push((
            pattern.to_string(),
            CommandOutput {
                exit_code: 0,
                stdout: stdout.trim().to_string(),
                stderr: String::new(),
            },
        ));
        self
    }

    /// Make commands containing `pattern` exit with `code`.
    pub fn fail(mut self, pattern: &str, code: i32) -> Self {
        self.responses.push((
            pattern.to_string(),
            CommandOutput {
                exit_code: code,
                stdout: String::new(),
                stderr: format!("{} failed", pattern),
            },
        ));
        self
    }

    pub fn file(mut self, path: &str, content: &str) -> Self {
        self.files.insert(PathBuf::from(path), content.to_string());
        self
    }

    pub fn without_tool(mut self, tool: &str) -> Self {
        self.missing_tools.insert(tool.to_string());
        self
    }

    /// Queue the exit code of the next elevated call.
    pub fn elevated_exit(self, code: i32) -> Self {
        let stderr = if code == 0 {
            String::new()
        } else {
            format!("E: step failed with {}", code)
        };
        self.push_program_result(CommandOutput {
            exit_code: code,
            stdout: String::new(),
            stderr,
        })
    }

    /// Queue a spawn failure for the next elevated call.
    pub fn elevated_spawn_failure(self) -> Self {
        self.push_program_result(CommandOutput::spawn_failure("No such file or directory (os error 2)"))
    }

    fn push_program_result(self, output: CommandOutput) -> Self {
        self.program_results.lock().unwrap().push_back(output);
        self
    }

    /// Every shell command run so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count_calls(&self, pattern: &str) -> usize {
        self.calls().iter().filter(|c| c.contains(pattern)).count()
    }

    /// Every elevated invocation so far: (program, args).
    pub fn program_calls(&self) -> Vec<(String, Vec<String>)> {
        self.program_calls.lock().unwrap().clone()
    }

    /// The `-c` script of each elevated invocation.
    pub fn elevated_scripts(&self) -> Vec<String> {
        self.program_calls()
            .into_iter()
            .filter_map(|(_, args)| args.last().cloned())
            .collect()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run_full(&self, command: &str) -> CommandOutput {
        self.calls.lock().unwrap().push(command.to_string());
        self.responses
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_else(|| CommandOutput {
                exit_code: 127,
                stdout: String::new(),
                stderr: format!("{}: not scripted", command),
            })
    }

    fn run_program(&self, program: &str, args: &[String]) -> CommandOutput {
        self.program_calls
            .lock()
            .unwrap()
            .push((program.to_string(), args.to_vec()));
        self.program_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default()
    }

    fn tool_available(&self, tool: &str) -> bool {
        !self.missing_tools.contains(tool)
    }

    fn read_file(&self, path: &Path) -> std::io::Result<String> {
        self.files.get(path).cloned().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, path.display().to_string())
        })
    }
}

pub const LSPCI_RTX_4060_AND_INTEL: &str = "Slot:\t00:02.0
Class:\tVGA compatible controller
Vendor:\tIntel Corporation
Device:\tAlderLake-S GT1

Slot:\t01:00.0
Class:\tVGA compatible controller
Vendor:\tNVIDIA Corporation
Device:\tGeForce RTX 4060
SVendor:\tASUSTeK Computer Inc.
";

pub const LSPCI_K_NOUVEAU: &str = "00:02.0 VGA compatible controller: Intel Corporation AlderLake-S GT1
\tKernel driver in use: i915
01:00.0 VGA compatible controller: NVIDIA Corporation AD107 [GeForce RTX 4060]
\tKernel driver in use: nouveau";

/// A fully scripted Ubuntu host with an RTX 4060 and Intel iGPU
pub fn ubuntu_host() -> ScriptedRunner {
    ScriptedRunner::new()
        .respond("lspci -vmm", LSPCI_RTX_4060_AND_INTEL)
        .respond("lspci -k", LSPCI_K_NOUVEAU)
        .respond("mokutil --sb-state", "SecureBoot disabled")
        .respond("uname -r", "6.5.0-14-generic")
        .respond("free -h", "              total        used\nMem:           15Gi       6.1Gi")
        .file("/proc/cpuinfo", "model name\t: AMD Ryzen 7 7840HS")
        .file(
            "/etc/os-release",
            "PRETTY_NAME=\"Ubuntu 24.04 LTS\"\nID=ubuntu\nVERSION_ID=\"24.04\"",
        )
}

pub fn sentinel_exit() -> i32 {
    SPAWN_FAILURE_EXIT_CODE
}

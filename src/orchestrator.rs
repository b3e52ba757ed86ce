//! Transaction orchestrator
//!
//! Turns a `DriverOperation` into a frozen `CommandChain`, runs the whole chain
//! under a single elevation prompt and classifies the outcome.
//!
//! # Design
//!
//! - **One prompt per transaction**: the chain is joined with `&&` and handed
//!   to `<helper> <shell> -c <script>` as one argument, so the first failing
//!   step aborts the rest
//! - **Audit before dispatch**: the diagnostic report and the numbered
//!   execution plan are logged before anything runs, whatever the outcome
//! - **Results, not panics**: a failed chain is `TransactionStatus::Failed` in
//!   the report; only refusals raised before elevation are `Err`
//! - **Cancellation at dispatch boundaries only**: the `CancelFlag` is checked
//!   before a chain is dispatched, never while it runs
//!
//! The orchestrator holds no lock. Keeping a single transaction in flight is
//! the job of `worker::TransactionWorker`.

use chrono::{DateTime, Local};
use std::sync::Arc;
use std::sync::mpsc::Sender;
use tracing::{error, info, warn};

use crate::chain::{ChainBuilder, ChainStep, CommandChain};
use crate::command_executor::{CommandOutput, CommandRunner};
use crate::config::PilotConfig;
use crate::error::{PilotError, Result};
use crate::hardware::HardwareDetector;
use crate::package_manager::{DriverVersion, VerbSet, require_verbs};
use crate::process_guard::CancelFlag;
use crate::repo::RepoOptimizer;
use crate::transaction::{
    TransactionContext, TransactionReport, TransactionResult, TransactionStatus, execution_plan,
};
use crate::types::{DriverOperation, PackageManagerKind, StepTag};

pub const XORG_CONF: &str = "/etc/X11/xorg.conf";
pub const NOUVEAU_BLACKLIST: &str = "/etc/modprobe.d/blacklist-nouveau.conf";
const NOUVEAU_BLACKLIST_CONTENT: &str = "blacklist nouveau\\noptions nouveau modeset=0\\n";

/// Leftover NVIDIA configuration removed by a deep clean. Globs stay unquoted.
const DEEP_CLEAN_GLOBS: [&str; 4] = [
    "/etc/modprobe.d/nvidia*",
    "/etc/modules-load.d/nvidia*",
    "/etc/X11/xorg.conf.d/*nvidia*",
    "/usr/share/X11/xorg.conf.d/*nvidia*",
];
const VULKAN_ICD_FILES: [&str; 2] = [
    "/usr/share/vulkan/icd.d/nvidia_icd.json",
    "/etc/vulkan/icd.d/nvidia_icd.json",
];

/// Events emitted while a transaction runs
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    Log(String),
    Progress(u8),
    Finished(Box<TransactionReport>),
}

/// Collects log lines for the report and forwards them to the caller
pub struct TransactionLog {
    lines: Vec<String>,
    events: Option<Sender<ProgressEvent>>,
}

impl TransactionLog {
    pub fn new(events: Option<Sender<ProgressEvent>>) -> Self {
        Self {
            lines: Vec::new(),
            events,
        }
    }

    pub fn line(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        info!("{}", msg);
        self.send(ProgressEvent::Log(msg.clone()));
        self.lines.push(msg);
    }

    pub fn progress(&mut self, percent: u8) {
        self.send(ProgressEvent::Progress(percent.min(100)));
    }

    fn send(&self, event: ProgressEvent) {
        // A caller that stopped listening does not stop the transaction
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    pub fn into_lines(self) -> Vec<String> {
        self.lines
    }
}

// ============================================================================
// Chain recipes
// ============================================================================

/// Inputs to the driver chain recipes besides the operation itself
#[derive(Debug, Clone)]
pub struct RecipeContext<'a> {
    pub verbs: &'a VerbSet,
    /// Version used by `InstallOpenKernel { version: None }`
    pub open_kernel_default: &'a str,
    /// Suffix of the xorg.conf backup file
    pub backup_stamp: String,
    /// Whether `update-alternatives` exists on the host
    pub has_update_alternatives: bool,
}

impl<'a> RecipeContext<'a> {
    pub fn new(verbs: &'a VerbSet, open_kernel_default: &'a str, at: DateTime<Local>) -> Self {
        Self {
            verbs,
            open_kernel_default,
            backup_stamp: at.format("%Y%m%d_%H%M%S").to_string(),
            has_update_alternatives: false,
        }
    }
}

fn backup_xorg_step(stamp: &str) -> ChainStep {
    ChainStep::new(StepTag::Backup, "cp")
        .arg(XORG_CONF)
        .arg(format!("{}.backup_{}", XORG_CONF, stamp))
        .only_if_file_exists(XORG_CONF)
}

fn blacklist_step() -> ChainStep {
    ChainStep::new(StepTag::Blacklist, "printf")
        .arg(NOUVEAU_BLACKLIST_CONTENT)
        .write_stdout_to(NOUVEAU_BLACKLIST)
}

fn remove_file_step(path: &str) -> ChainStep {
    ChainStep::new(StepTag::Cleanup, "rm").args(["-f", path])
}

fn new_builder(task: &str, verbs: &VerbSet) -> ChainBuilder {
    let mut builder = ChainBuilder::new(task);
    for (key, value) in verbs.env {
        builder.env(*key, *value);
    }
    builder
}

/// Backup, blacklist and build dependencies shared by the NVIDIA installs
fn install_preamble(builder: &mut ChainBuilder, ctx: &RecipeContext<'_>) {
    builder
        .push(backup_xorg_step(&ctx.backup_stamp))
        .push(blacklist_step());
    if ctx.verbs.refresh_before_install {
        builder.push(ctx.verbs.refresh.step(StepTag::RepoUpdate));
    }
    builder.push(ctx.verbs.build_deps.step(StepTag::PrepareDeps));
}

/// Build the chain for a driver operation.
///
/// `OptimizeRepositories` is not a driver chain; see `repo::RepoOptimizer`.
pub fn driver_chain(op: &DriverOperation, ctx: &RecipeContext<'_>) -> Result<CommandChain> {
    let verbs = ctx.verbs;
    let mut builder = new_builder(op.task_name(), verbs);

    match op {
        DriverOperation::InstallProprietary { version } => {
            let version = version.as_deref().map(DriverVersion::parse).transpose()?;
            install_preamble(&mut builder, ctx);

            let driver = match version {
                Some(v) if verbs.proprietary.is_parameterized() => {
                    verbs.proprietary.step_with(StepTag::DriverAction, v.as_str())
                }
                Some(v) => {
                    warn!("{} packages are not versioned; ignoring version {}", verbs.kind, v);
                    verbs.proprietary.step(StepTag::DriverAction)
                }
                None => verbs.proprietary_auto.step(StepTag::DriverAction),
            };
            builder.push(driver);
        }

        DriverOperation::InstallOpenKernel { version } => {
            let raw = version.as_deref().unwrap_or(ctx.open_kernel_default);
            let version = DriverVersion::parse(raw)?;
            install_preamble(&mut builder, ctx);
            builder.push(verbs.open_kernel.step_with(StepTag::DriverAction, version.as_str()));
        }

        DriverOperation::InstallAmdMesa => {
            builder.push(verbs.amd_mesa.step(StepTag::DriverAction));
        }

        DriverOperation::RemoveAllDrivers { deep_clean } => {
            builder
                .push(backup_xorg_step(&ctx.backup_stamp))
                .push(remove_file_step(NOUVEAU_BLACKLIST));

            if *deep_clean {
                builder.push(remove_file_step(XORG_CONF));
                builder.extend(DEEP_CLEAN_GLOBS.iter().map(|glob| {
                    ChainStep::new(StepTag::Cleanup, "rm").arg("-f").raw_arg(*glob)
                }));
                builder.extend(VULKAN_ICD_FILES.iter().map(|path| remove_file_step(path)));
                if ctx.has_update_alternatives {
                    builder.push(
                        ChainStep::new(StepTag::Cleanup, "update-alternatives")
                            .args(["--auto", "glx"])
                            .tolerate_failure(),
                    );
                }
            }

            builder.push(verbs.purge_nvidia.step(StepTag::DriverAction));
            if let Some(extra) = verbs.purge_extra {
                builder.push(extra.step(StepTag::Cleanup));
            }
            if let Some(autoremove) = verbs.autoremove {
                builder.push(autoremove.step(StepTag::Cleanup));
            }
            builder.push(verbs.restore_nouveau.step(StepTag::DriverAction));
        }

        DriverOperation::OptimizeRepositories => {
            return Err(PilotError::config(
                "repository optimization is built by RepoOptimizer, not as a driver chain",
            ));
        }
    }

    if op.touches_kernel_modules() {
        builder.push(verbs.initramfs.step(StepTag::FinalizeBoot));
    }

    Ok(builder.freeze())
}

// ============================================================================
// Execution
// ============================================================================

/// Log the numbered command list of `chain`.
fn emit_plan(log: &mut TransactionLog, chain: &CommandChain) {
    log.line(format!("[Execution plan: {}]", chain.task_name()));
    for line in execution_plan(chain) {
        log.line(line);
    }
    log.line("-".repeat(40));
}

/// Run `chain` as one elevated invocation and log the classified outcome.
pub fn dispatch(
    runner: &dyn CommandRunner,
    config: &PilotConfig,
    chain: &CommandChain,
    log: &mut TransactionLog,
) -> TransactionResult {
    log.line(format!(
        "Waiting for authorization ({})...",
        config.elevation_helper
    ));

    let args = [
        config.elevation_shell.clone(),
        "-c".to_string(),
        chain.to_shell_script(),
    ];
    let output: CommandOutput = runner.run_program(&config.elevation_helper, &args);
    let result = TransactionResult::from_output(chain.task_name(), output);

    if result.succeeded {
        if !result.stdout.is_empty() {
            log.line("[Command output]");
            log.line(result.stdout.clone());
        }
        log.line(format!("SUCCESS: {} completed", chain.task_name()));
    } else {
        error!("{} failed with exit code {}", chain.task_name(), result.exit_code);
        log.line("[Critical error]");
        log.line(format!("Exit code: {}", result.exit_code));
        log.line("Command output (stderr):");
        if result.stderr.is_empty() {
            log.line("(no error output received, check the system journal)");
        } else {
            log.line(result.stderr.clone());
        }
    }
    result
}

/// Drives privileged transactions for one host
pub struct Orchestrator {
    runner: Arc<dyn CommandRunner>,
    detector: HardwareDetector,
    package_manager: PackageManagerKind,
    config: PilotConfig,
    cancel: CancelFlag,
    events: Option<Sender<ProgressEvent>>,
    snapshot_first: bool,
}

impl Orchestrator {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        package_manager: PackageManagerKind,
        config: PilotConfig,
    ) -> Self {
        Self {
            detector: HardwareDetector::new(Arc::clone(&runner)),
            runner,
            package_manager,
            config,
            cancel: CancelFlag::new(),
            events: None,
            snapshot_first: false,
        }
    }

    /// Orchestrator for the running host; the package manager comes from
    /// `/etc/os-release`.
    pub fn for_host(runner: Arc<dyn CommandRunner>, config: PilotConfig) -> Self {
        let kind = crate::package_manager::detect_package_manager(runner.as_ref());
        Self::new(runner, kind, config)
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Take a system snapshot before each transaction (failures are logged).
    pub fn with_snapshot(mut self, enabled: bool) -> Self {
        self.snapshot_first = enabled;
        self
    }

    /// Forward log and progress events to `events`.
    pub fn set_event_sender(&mut self, events: Option<Sender<ProgressEvent>>) {
        self.events = events;
    }

    pub fn package_manager(&self) -> PackageManagerKind {
        self.package_manager
    }

    pub fn config(&self) -> &PilotConfig {
        &self.config
    }

    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    pub fn detector(&mut self) -> &mut HardwareDetector {
        &mut self.detector
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    fn verbs(&self) -> Result<&'static VerbSet> {
        require_verbs(self.package_manager)
    }

    /// Chain for a driver operation on this host.
    pub fn build_chain(&self, op: &DriverOperation) -> Result<CommandChain> {
        if *op == DriverOperation::OptimizeRepositories {
            let optimizer = self.repo_optimizer();
            return optimizer.primary_chain(&optimizer.resolve_country_code());
        }
        let mut ctx = RecipeContext::new(
            self.verbs()?,
            &self.config.open_kernel_default_version,
            Local::now(),
        );
        ctx.has_update_alternatives = self.runner.tool_available("update-alternatives");
        driver_chain(op, &ctx)
    }

    fn repo_optimizer(&self) -> RepoOptimizer<'_> {
        RepoOptimizer::new(self.runner.as_ref(), &self.config, self.package_manager)
    }

    /// Run the external snapshot tool. Returns false (and logs) on any failure.
    pub fn create_snapshot(&self) -> bool {
        let tool = self.config.snapshot_tool.as_str();
        if !self.runner.tool_available(tool) {
            warn!("{} is not installed, skipping system snapshot", tool);
            return false;
        }

        info!("Creating system snapshot with {}", tool);
        let args: Vec<String> = [
            tool,
            "--create",
            "--comments",
            self.config.snapshot_comment.as_str(),
            "--tags",
            "D",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let output = self.runner.run_program(&self.config.elevation_helper, &args);
        if !output.success() {
            warn!(
                "Snapshot failed (exit {}), continuing without it: {}",
                output.exit_code, output.stderr
            );
        }
        output.success()
    }

    /// Run one driver operation end to end.
    ///
    /// `Err` means the operation was refused before any elevation prompt
    /// (unsupported platform, invalid version). Everything after that is
    /// reported through the returned `TransactionReport`.
    pub fn execute(&mut self, op: &DriverOperation) -> Result<TransactionReport> {
        info!("Requested operation: {}", op);
        match op {
            DriverOperation::OptimizeRepositories => self.execute_repositories(),
            _ => {
                let chain = self.build_chain(op)?;
                self.execute_chain(chain)
            }
        }
    }

    /// Run an already-built chain with the full transaction discipline.
    pub fn execute_chain(&mut self, chain: CommandChain) -> Result<TransactionReport> {
        if chain.is_empty() {
            return Err(PilotError::EmptyChain(chain.task_name().to_string()));
        }

        let mut ctx = TransactionContext::new(chain.task_name());
        let mut log = TransactionLog::new(self.events.clone());
        ctx.advance()?;
        log.progress(ctx.current_stage().progress_percent());

        self.emit_preamble(&mut log, &chain);
        if !self.await_privilege(&mut ctx, &mut log, &chain)? {
            return Ok(self.finish(ctx, log, &chain, None, None));
        }

        let result = dispatch(self.runner.as_ref(), &self.config, &chain, &mut log);
        ctx.finish(result.succeeded)?;
        Ok(self.finish(ctx, log, &chain, Some(result), None))
    }

    fn execute_repositories(&mut self) -> Result<TransactionReport> {
        let mut ctx = TransactionContext::new(DriverOperation::OptimizeRepositories.task_name());
        let mut log = TransactionLog::new(self.events.clone());
        ctx.advance()?;
        log.progress(ctx.current_stage().progress_percent());

        let (code, primary) = {
            let optimizer = self.repo_optimizer();
            let code = optimizer.resolve_country_code();
            let primary = optimizer.primary_chain(&code)?;
            (code, primary)
        };
        log.line(format!("Mirror country: {}", code.as_str().to_uppercase()));

        self.emit_preamble(&mut log, &primary);
        if !self.await_privilege(&mut ctx, &mut log, &primary)? {
            return Ok(self.finish(ctx, log, &primary, None, None));
        }

        let runner = self.runner.as_ref();
        let config = &self.config;
        let primary_task = primary.task_name().to_string();
        let outcome = RepoOptimizer::new(runner, config, self.package_manager).run_with_rescue(
            code,
            &primary,
            |chain| {
                if chain.task_name() != primary_task {
                    log.line("Primary chain failed, attempting rescue");
                    emit_plan(&mut log, chain);
                }
                dispatch(runner, config, chain, &mut log)
            },
        )?;

        if let Some(rescue) = &outcome.rescue {
            if rescue.succeeded {
                log.line("Original package sources restored");
            } else {
                log.line("Rescue failed; package sources may need manual repair");
            }
        }

        ctx.finish(outcome.succeeded())?;
        Ok(self.finish(ctx, log, &primary, Some(outcome.primary), outcome.rescue))
    }

    /// Diagnostic report, execution plan and the optional snapshot.
    fn emit_preamble(&mut self, log: &mut TransactionLog, chain: &CommandChain) {
        log.line(format!(
            "[{}] --- Starting: {} ---",
            Local::now().format("%H:%M:%S"),
            chain.task_name()
        ));

        let info = self.detector.get_full_system_info();
        for line in info.diagnostic_report() {
            log.line(line);
        }
        log.line("-".repeat(40));

        emit_plan(log, chain);

        if self.snapshot_first && !self.cancel.is_cancelled() && !self.create_snapshot() {
            log.line("System snapshot skipped or failed; continuing");
        }
    }

    /// Enter `AwaitingPrivilege`, honor a pending cancellation, then enter
    /// `Executing`. Returns false if the transaction was cancelled.
    fn await_privilege(
        &self,
        ctx: &mut TransactionContext,
        log: &mut TransactionLog,
        chain: &CommandChain,
    ) -> Result<bool> {
        ctx.advance()?;
        log.progress(ctx.current_stage().progress_percent());

        if self.cancel.is_cancelled() {
            ctx.cancel()?;
            log.line(format!("{} cancelled before execution", chain.task_name()));
            return Ok(false);
        }

        ctx.advance()?;
        log.progress(ctx.current_stage().progress_percent());
        Ok(true)
    }

    fn finish(
        &self,
        ctx: TransactionContext,
        mut log: TransactionLog,
        chain: &CommandChain,
        result: Option<TransactionResult>,
        rescue: Option<TransactionResult>,
    ) -> TransactionReport {
        log.progress(ctx.current_stage().progress_percent());
        let status = TransactionStatus::from_stage(ctx.current_stage())
            .unwrap_or(TransactionStatus::Failed);
        if status == TransactionStatus::Succeeded {
            log.line("Restart the system for the changes to take effect.");
        }

        TransactionReport {
            task_name: ctx.task_name().to_string(),
            status,
            plan: chain.commands(),
            result,
            rescue,
            log: log.into_lines(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ctx(kind: PackageManagerKind) -> RecipeContext<'static> {
        let at = Local.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).single().unwrap();
        RecipeContext::new(require_verbs(kind).unwrap(), "535", at)
    }

    #[test]
    fn test_proprietary_auto_apt() {
        let chain = driver_chain(
            &DriverOperation::InstallProprietary { version: None },
            &ctx(PackageManagerKind::Apt),
        )
        .unwrap();
        assert_eq!(
            chain.commands(),
            vec![
                "if [ -f /etc/X11/xorg.conf ]; then cp /etc/X11/xorg.conf /etc/X11/xorg.conf.backup_20240501_123000; fi",
                "printf 'blacklist nouveau\\noptions nouveau modeset=0\\n' > /etc/modprobe.d/blacklist-nouveau.conf",
                "apt-get update",
                "apt-get install -y build-essential linux-headers-$(uname -r)",
                "ubuntu-drivers autoinstall",
                "update-initramfs -u",
            ]
        );
        assert!(chain.to_shell_script().starts_with("export DEBIAN_FRONTEND=noninteractive && "));
    }

    #[test]
    fn test_proprietary_versioned() {
        let chain = driver_chain(
            &DriverOperation::InstallProprietary {
                version: Some("550".into()),
            },
            &ctx(PackageManagerKind::Apt),
        )
        .unwrap();
        let driver: Vec<_> = chain.steps_tagged(StepTag::DriverAction).collect();
        assert_eq!(driver.len(), 1);
        assert_eq!(driver[0].render(), "apt-get install -y nvidia-driver-550 nvidia-settings");
    }

    #[test]
    fn test_invalid_version_refused() {
        let op = DriverOperation::InstallProprietary {
            version: Some("550 && reboot".into()),
        };
        assert!(matches!(
            driver_chain(&op, &ctx(PackageManagerKind::Apt)),
            Err(PilotError::InvalidVersion(_))
        ));
    }

    #[test]
    fn test_open_kernel_single_finalize_step() {
        for kind in [
            PackageManagerKind::Apt,
            PackageManagerKind::Dnf,
            PackageManagerKind::Pacman,
            PackageManagerKind::Zypper,
        ] {
            let chain = driver_chain(
                &DriverOperation::InstallOpenKernel { version: None },
                &ctx(kind),
            )
            .unwrap();
            assert_eq!(chain.steps_tagged(StepTag::FinalizeBoot).count(), 1, "{}", kind);
            assert_eq!(chain.tags().last(), Some(&StepTag::FinalizeBoot));
        }
    }

    #[test]
    fn test_amd_mesa_has_no_kernel_steps() {
        let chain = driver_chain(&DriverOperation::InstallAmdMesa, &ctx(PackageManagerKind::Pacman))
            .unwrap();
        assert_eq!(chain.tags(), vec![StepTag::DriverAction]);
        assert_eq!(
            chain.commands()[0],
            "pacman -S --needed --noconfirm xf86-video-amdgpu mesa vulkan-radeon"
        );
    }

    #[test]
    fn test_remove_deep_clean_layout() {
        let mut context = ctx(PackageManagerKind::Apt);
        context.has_update_alternatives = true;
        let chain = driver_chain(&DriverOperation::RemoveAllDrivers { deep_clean: true }, &context)
            .unwrap();
        let commands = chain.commands();

        assert!(commands.contains(&"rm -f /etc/modprobe.d/blacklist-nouveau.conf".to_string()));
        assert!(commands.contains(&"rm -f /etc/X11/xorg.conf".to_string()));
        assert!(commands.contains(&"rm -f /etc/X11/xorg.conf.d/*nvidia*".to_string()));
        assert!(commands.contains(&"rm -f /etc/vulkan/icd.d/nvidia_icd.json".to_string()));
        assert!(commands.contains(&"{ update-alternatives --auto glx || true; }".to_string()));
        assert_eq!(
            &commands[commands.len() - 5..],
            &[
                "apt-get remove --purge -y '^nvidia-.*' '^libnvidia-.*' '^xserver-xorg-video-nvidia.*'",
                "{ apt-get remove --purge -y '^amdgpu-pro.*' || true; }",
                "apt-get autoremove -y",
                "apt-get install -y xserver-xorg-video-nouveau",
                "update-initramfs -u",
            ]
        );
    }

    #[test]
    fn test_finalize_only_for_kernel_module_operations() {
        let ops = [
            DriverOperation::InstallProprietary { version: None },
            DriverOperation::InstallOpenKernel { version: None },
            DriverOperation::InstallAmdMesa,
            DriverOperation::RemoveAllDrivers { deep_clean: false },
        ];
        for op in &ops {
            let chain = driver_chain(op, &ctx(PackageManagerKind::Zypper)).unwrap();
            let finalize = chain.steps_tagged(StepTag::FinalizeBoot).count();
            assert_eq!(finalize, usize::from(op.touches_kernel_modules()), "{}", op);
        }
    }

    #[test]
    fn test_optimize_is_not_a_driver_chain() {
        assert!(driver_chain(&DriverOperation::OptimizeRepositories, &ctx(PackageManagerKind::Apt)).is_err());
    }

    #[test]
    fn test_log_forwards_events() {
        let (tx, rx) = std::sync::mpsc::channel();
        let mut log = TransactionLog::new(Some(tx));
        log.line("hello");
        log.progress(150);
        drop(log);

        let events: Vec<_> = rx.iter().collect();
        assert!(matches!(&events[0], ProgressEvent::Log(l) if l == "hello"));
        assert!(matches!(events[1], ProgressEvent::Progress(100)));
    }
}

//! Transaction state machine and results
//!
//! One privileged transaction moves through a fixed sequence of stages and
//! ends in exactly one terminal stage. Nothing is resumable: a failed
//! transaction is finished, and the caller starts a new one to retry.
//!
//! # Stage Flow
//!
//! ```text
//! Idle
//!   ↓
//! BuildingChain ──────────┐
//!   ↓                     │
//! AwaitingPrivilege ──────┤ (cancel before dispatch)
//!   ↓                     ↓
//! Executing           Cancelled
//!   ↓
//! Succeeded | Failed
//! ```
//!
//! Any non-terminal stage may also go straight to `Failed` (e.g. a refused
//! environment check during chain construction).

use chrono::{DateTime, Local};
use serde::Serialize;
use std::fmt;

use crate::chain::CommandChain;
use crate::command_executor::CommandOutput;
use crate::error::{PilotError, Result};

/// Transaction stages in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransactionStage {
    Idle,
    BuildingChain,
    AwaitingPrivilege,
    Executing,
    Succeeded,
    Failed,
    Cancelled,
}

impl TransactionStage {
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// The next stage on the success path, or None at a terminal stage.
    /// `Executing` has two outcomes and is resolved by `finish`.
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Idle => Some(Self::BuildingChain),
            Self::BuildingChain => Some(Self::AwaitingPrivilege),
            Self::AwaitingPrivilege => Some(Self::Executing),
            Self::Executing => Some(Self::Succeeded),
            Self::Succeeded | Self::Failed | Self::Cancelled => None,
        }
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::BuildingChain => "Building command chain",
            Self::AwaitingPrivilege => "Waiting for authorization",
            Self::Executing => "Executing",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
        }
    }

    /// Approximate progress for the stage
    pub const fn progress_percent(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::BuildingChain => 10,
            Self::AwaitingPrivilege => 20,
            Self::Executing => 40,
            Self::Succeeded | Self::Failed | Self::Cancelled => 100,
        }
    }
}

impl fmt::Display for TransactionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Owns the current stage of one transaction and validates transitions
#[derive(Debug, Clone)]
pub struct TransactionContext {
    task_name: String,
    current: TransactionStage,
    history: Vec<(TransactionStage, DateTime<Local>)>,
}

impl TransactionContext {
    pub fn new(task_name: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            current: TransactionStage::Idle,
            history: vec![(TransactionStage::Idle, Local::now())],
        }
    }

    #[inline]
    pub fn current_stage(&self) -> TransactionStage {
        self.current
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn history(&self) -> &[(TransactionStage, DateTime<Local>)] {
        &self.history
    }

    /// Advance along the success path. `Executing` must be left with `finish`.
    pub fn advance(&mut self) -> Result<TransactionStage> {
        if self.current == TransactionStage::Executing {
            return Err(PilotError::invalid_transition(
                "leave Executing with finish(), not advance()",
            ));
        }
        let next = self.current.next().ok_or_else(|| self.terminal_error())?;
        self.enter(next);
        Ok(next)
    }

    /// Record the outcome of the elevated call.
    pub fn finish(&mut self, succeeded: bool) -> Result<TransactionStage> {
        if self.current != TransactionStage::Executing {
            return Err(PilotError::invalid_transition(format!(
                "cannot finish from {}",
                self.current
            )));
        }
        let outcome = if succeeded {
            TransactionStage::Succeeded
        } else {
            TransactionStage::Failed
        };
        self.enter(outcome);
        Ok(outcome)
    }

    /// Cancellation is only accepted before the chain has been dispatched.
    pub fn cancel(&mut self) -> Result<TransactionStage> {
        match self.current {
            TransactionStage::Idle
            | TransactionStage::BuildingChain
            | TransactionStage::AwaitingPrivilege => {
                self.enter(TransactionStage::Cancelled);
                Ok(TransactionStage::Cancelled)
            }
            TransactionStage::Executing => Err(PilotError::invalid_transition(
                "cannot cancel a dispatched chain",
            )),
            _ => Err(self.terminal_error()),
        }
    }

    /// Mark failure from any non-terminal stage.
    pub fn fail(&mut self) -> Result<TransactionStage> {
        if self.current.is_terminal() {
            return Err(self.terminal_error());
        }
        self.enter(TransactionStage::Failed);
        Ok(TransactionStage::Failed)
    }

    fn enter(&mut self, stage: TransactionStage) {
        tracing::debug!("[{}] {} -> {}", self.task_name, self.current, stage);
        self.current = stage;
        self.history.push((stage, Local::now()));
    }

    fn terminal_error(&self) -> PilotError {
        PilotError::invalid_transition(format!(
            "transaction '{}' already ended ({})",
            self.task_name, self.current
        ))
    }
}

// ============================================================================
// Results
// ============================================================================

/// Outcome of one elevated invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub succeeded: bool,
    pub task_name: String,
    pub timestamp: DateTime<Local>,
}

impl TransactionResult {
    pub fn from_output(task_name: impl Into<String>, output: CommandOutput) -> Self {
        Self {
            succeeded: output.success(),
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            task_name: task_name.into(),
            timestamp: Local::now(),
        }
    }
}

/// Terminal status of a transaction as seen by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransactionStatus {
    Succeeded,
    Failed,
    /// Cancelled before dispatch; nothing was executed
    Cancelled,
}

impl TransactionStatus {
    pub fn from_stage(stage: TransactionStage) -> Option<Self> {
        match stage {
            TransactionStage::Succeeded => Some(Self::Succeeded),
            TransactionStage::Failed => Some(Self::Failed),
            TransactionStage::Cancelled => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Process exit code for the CLI
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Succeeded => 0,
            Self::Failed => 1,
            Self::Cancelled => 130,
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Everything a caller needs to render or audit one transaction
#[derive(Debug, Clone, Serialize)]
pub struct TransactionReport {
    pub task_name: String,
    pub status: TransactionStatus,
    /// Ordered command list that was (or would have been) executed
    pub plan: Vec<String>,
    /// Primary elevated call; `None` when nothing was dispatched
    pub result: Option<TransactionResult>,
    /// Rescue elevated call, when the recipe has one and it ran
    pub rescue: Option<TransactionResult>,
    /// Every log line emitted for the transaction
    pub log: Vec<String>,
}

impl TransactionReport {
    pub fn succeeded(&self) -> bool {
        self.status == TransactionStatus::Succeeded
    }

    /// One-line human summary
    pub fn summary(&self) -> String {
        match (self.status, &self.result) {
            (TransactionStatus::Succeeded, _) if self.rescue.is_some() => format!(
                "{}: primary chain failed, original configuration restored",
                self.task_name
            ),
            (TransactionStatus::Succeeded, _) => format!("{} completed", self.task_name),
            (TransactionStatus::Cancelled, _) => {
                format!("{} cancelled before execution", self.task_name)
            }
            (TransactionStatus::Failed, Some(result)) => {
                format!("{} failed (exit code {})", self.task_name, result.exit_code)
            }
            (TransactionStatus::Failed, None) => format!("{} failed", self.task_name),
        }
    }
}

/// Execution plan lines for a chain, numbered from 1
pub fn execution_plan(chain: &CommandChain) -> Vec<String> {
    chain
        .commands()
        .into_iter()
        .enumerate()
        .map(|(i, cmd)| format!("{}. {}", i + 1, cmd))
        .collect()
}

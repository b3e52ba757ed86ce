//! gpupilot library
//!
//! Hardware detection and privileged driver transactions for Linux graphics
//! stacks. The binary in `main.rs` is a thin CLI over these modules.

pub mod chain;
pub mod cli;
pub mod command_executor;
pub mod config;
pub mod error;
pub mod hardware;
pub mod monitor;
pub mod orchestrator;
pub mod package_manager;
pub mod process_guard;
pub mod repo;
pub mod sanity;
pub mod transaction;
pub mod tweaks;
pub mod types;
pub mod versions;
pub mod worker;

// Re-export main types for convenience
pub use chain::{ChainBuilder, ChainStep, CommandChain, Word, shell_quote};
pub use command_executor::{
    CommandOutput, CommandRunner, DryRunRunner, ExecutionMode, SystemCommandRunner,
};
pub use config::PilotConfig;
pub use error::{PilotError, ProbeError};
pub use hardware::{HardwareDetector, HardwareSnapshot, SystemInfo};
pub use orchestrator::{Orchestrator, ProgressEvent};
pub use package_manager::{DriverVersion, VerbSet, detect_package_manager, verbs};
pub use process_guard::{CancelFlag, CommandProcessGroup};
pub use repo::{CountryCode, RepoOptimizer};
pub use transaction::{TransactionReport, TransactionResult, TransactionStage, TransactionStatus};
pub use types::{DriverOperation, GpuVendor, PackageManagerKind, SecureBootState, StepTag};
pub use worker::{TransactionWorker, WorkerHandle};

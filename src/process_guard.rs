//! Process isolation and cooperative cancellation
//!
//! A package manager transaction must not be interrupted half way: killing
//! `apt-get` or `dracut` mid-run can leave the system unbootable. Two things
//! protect an in-flight transaction:
//!
//! - Every spawned command runs in its own process group, so the SIGINT a
//!   terminal sends to the foreground group on Ctrl+C never reaches it.
//! - SIGINT/SIGTERM/SIGHUP only raise a `CancelFlag`. The orchestrator checks
//!   the flag before dispatching each chain, never between steps of a chain
//!   that is already running. A second signal while the flag is set exits the
//!   process; the detached transaction still runs to completion.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Exit code used for a forced exit on the second signal (128 + SIGINT)
const FORCED_EXIT_CODE: i32 = 130;

/// Shared cancellation request flag
///
/// Cloning is cheap; all clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    requested: Arc<AtomicBool>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Honored at the next chain-dispatch boundary.
    pub fn cancel(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Clear a previous request, e.g. before starting a new transaction.
    pub fn reset(&self) {
        self.requested.store(false, Ordering::SeqCst);
    }

    fn as_atomic(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.requested)
    }
}

/// Route SIGINT (Ctrl+C), SIGTERM and SIGHUP into `flag`.
///
/// The first signal sets the flag. A signal arriving while the flag is
/// already set terminates the process with exit code 130.
/// Call this once at program start.
pub fn init_signal_handlers(flag: &CancelFlag) -> Result<(), std::io::Error> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::flag;

    for sig in [SIGINT, SIGTERM, SIGHUP] {
        // Order matters: the conditional shutdown must be registered first so
        // it sees the flag as it was before this delivery set it.
        flag::register_conditional_shutdown(sig, FORCED_EXIT_CODE, flag.as_atomic())?;
        flag::register(sig, flag.as_atomic())?;
    }

    tracing::debug!("Cancellation signal handlers installed");
    Ok(())
}

/// Extension trait for std::process::Command to set up process groups
pub trait CommandProcessGroup {
    /// Run the command in its own process group so terminal-generated signals
    /// aimed at gpupilot do not reach it.
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for std::process::Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        // PGID = child PID
        self.process_group(0)
    }
}

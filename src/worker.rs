//! Background transaction worker
//!
//! Transactions run for minutes (downloads, DKMS builds), so they run on a
//! dedicated thread and report over an mpsc channel. A `TransactionWorker`
//! admits one transaction at a time: a second `submit` while one is in flight
//! is rejected with `PilotError::TransactionInFlight`, never queued or
//! interleaved.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::debug;

use crate::error::{PilotError, Result};
use crate::orchestrator::{Orchestrator, ProgressEvent};
use crate::transaction::TransactionReport;
use crate::types::DriverOperation;

/// Clears the busy flag when the worker thread ends
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Single-in-flight gate around the orchestrator
#[derive(Debug, Clone, Default)]
pub struct TransactionWorker {
    busy: Arc<AtomicBool>,
    current_task: Arc<Mutex<Option<String>>>,
}

/// A running transaction
pub struct WorkerHandle {
    events: Receiver<ProgressEvent>,
    thread: JoinHandle<(Orchestrator, Option<PilotError>)>,
}

impl TransactionWorker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Start `op` on a new thread. The orchestrator is handed back by
    /// `WorkerHandle::wait` so its cached hardware snapshot survives.
    pub fn submit(&self, mut orchestrator: Orchestrator, op: DriverOperation) -> Result<WorkerHandle> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            let running = self
                .current_task
                .lock()
                .map(|t| t.clone())
                .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
                .unwrap_or_else(|| "unknown".to_string());
            return Err(PilotError::TransactionInFlight(running));
        }

        let guard = BusyGuard(Arc::clone(&self.busy));
        self.set_current(Some(op.task_name().to_string()));

        let (tx, rx) = mpsc::channel();
        let current_task = Arc::clone(&self.current_task);
        let spawned = std::thread::Builder::new()
            .name("gpupilot-transaction".to_string())
            .spawn(move || {
                let _guard = guard;
                debug!("Transaction thread started: {}", op);
                orchestrator.set_event_sender(Some(tx.clone()));

                let refusal = match orchestrator.execute(&op) {
                    Ok(report) => {
                        let _ = tx.send(ProgressEvent::Finished(Box::new(report)));
                        None
                    }
                    Err(e) => {
                        let _ = tx.send(ProgressEvent::Log(format!("Refused: {}", e)));
                        Some(e)
                    }
                };

                orchestrator.set_event_sender(None);
                if let Ok(mut task) = current_task.lock() {
                    *task = None;
                }
                (orchestrator, refusal)
            });

        match spawned {
            Ok(thread) => Ok(WorkerHandle { events: rx, thread }),
            Err(e) => {
                // The closure (and the guard inside it) was dropped, clearing busy
                self.set_current(None);
                Err(PilotError::Io(e))
            }
        }
    }

    fn set_current(&self, task: Option<String>) {
        match self.current_task.lock() {
            Ok(mut current) => *current = task,
            Err(poisoned) => *poisoned.into_inner() = task,
        }
    }
}

impl WorkerHandle {
    /// Progress events in arrival order; ends when the thread finishes.
    pub fn events(&self) -> &Receiver<ProgressEvent> {
        &self.events
    }

    /// Drain events into `on_event` until the transaction ends, then return
    /// the report and the orchestrator.
    ///
    /// A refusal before elevation arrives as a final `Log` event and its
    /// original error is returned here.
    pub fn wait_with<F>(self, mut on_event: F) -> Result<(TransactionReport, Orchestrator)>
    where
        F: FnMut(&ProgressEvent),
    {
        let mut report = None;
        for event in self.events.iter() {
            on_event(&event);
            if let ProgressEvent::Finished(r) = event {
                report = Some(*r);
            }
        }

        let (orchestrator, refusal) = self
            .thread
            .join()
            .map_err(|_| PilotError::worker("transaction thread panicked"))?;

        match (report, refusal) {
            (Some(report), _) => Ok((report, orchestrator)),
            (None, Some(e)) => Err(e),
            (None, None) => Err(PilotError::worker("transaction ended without a report")),
        }
    }

    pub fn wait(self) -> Result<(TransactionReport, Orchestrator)> {
        self.wait_with(|_| {})
    }
}

//! Drives every output line low before the process exits.
//!
//! `Running -> Draining -> Halted`. Only the first trigger drains; later
//! ones are no-ops. The drain blocks on the line table for at most the
//! configured timeout, and a line that refuses to go low is logged and
//! skipped so the rest are still attempted. Once drained, the table stays
//! sealed and no output can be driven again before the process exits.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::watch;

use crate::broadcast::Broadcaster;
use crate::gpio::{LineBackend, PinManager};

pub use crate::gpio::DrainReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Draining,
    Halted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    Completed(DrainReport),
    /// The line table stayed locked past the timeout; outputs were left as is.
    LockTimeout,
    /// A drain was already started by an earlier trigger.
    AlreadyTriggered,
}

pub struct ShutdownCoordinator<B: LineBackend> {
    manager: Arc<PinManager<B>>,
    broadcaster: Option<Arc<Broadcaster>>,
    timeout: Duration,
    state: watch::Sender<ShutdownState>,
}

impl<B: LineBackend> ShutdownCoordinator<B> {
    pub fn new(manager: Arc<PinManager<B>>, timeout: Duration) -> Self {
        let (state, _) = watch::channel(ShutdownState::Running);
        Self {
            manager,
            broadcaster: None,
            timeout,
            state,
        }
    }

    /// Subscribers are closed once the outputs are safe.
    pub fn with_broadcaster(mut self, broadcaster: Arc<Broadcaster>) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    pub fn state(&self) -> ShutdownState {
        *self.state.borrow()
    }

    /// Runs the drain synchronously. Safe to call from several threads; only
    /// the first caller does the work.
    pub fn drain(&self) -> DrainOutcome {
        let entered = self.state.send_if_modified(|state| {
            if *state == ShutdownState::Running {
                *state = ShutdownState::Draining;
                true
            } else {
                false
            }
        });
        if !entered {
            info!("shutdown already in progress, ignoring trigger");
            return DrainOutcome::AlreadyTriggered;
        }

        info!("draining: driving output lines low");
        let outcome = match self.manager.drive_outputs_low(self.timeout) {
            Some(report) => {
                if report.failed.is_empty() {
                    info!("drain complete, {} output lines low", report.safed.len());
                } else {
                    warn!(
                        "drain complete, {} output lines low, {} failed",
                        report.safed.len(),
                        report.failed.len()
                    );
                }
                DrainOutcome::Completed(report)
            }
            None => {
                error!(
                    "line table not available within {:?}, exiting without safing outputs",
                    self.timeout
                );
                DrainOutcome::LockTimeout
            }
        };

        if let Some(broadcaster) = &self.broadcaster {
            broadcaster.close_all();
        }

        self.state.send_replace(ShutdownState::Halted);
        outcome
    }

    /// Resolves once a drain has finished.
    pub async fn halted(&self) {
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|s| *s == ShutdownState::Halted).await;
    }
}

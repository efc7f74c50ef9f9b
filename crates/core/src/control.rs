//! Cooperative turn control: cancel and pause.
//!
//! A [`TurnControl`] is shared between the session (which flips the flags in
//! response to client `control` events), the turn loop, and the tool
//! executor. The latter two observe it at their yield points; the executor
//! checks it before every dispatch. Cancellation is never preemptive.

use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ControlState {
    paused: bool,
    cancelled: bool,
}

/// Returned by a checkpoint once the turn has been cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

#[derive(Debug, Clone)]
pub struct TurnControl {
    tx: std::sync::Arc<watch::Sender<ControlState>>,
    rx: watch::Receiver<ControlState>,
}

impl Default for TurnControl {
    fn default() -> Self {
        Self::new(false)
    }
}

impl TurnControl {
    /// A fresh control for one turn, starting paused or running.
    pub fn new(paused: bool) -> Self {
        let (tx, rx) = watch::channel(ControlState {
            paused,
            cancelled: false,
        });
        Self {
            tx: std::sync::Arc::new(tx),
            rx,
        }
    }

    pub fn cancel(&self) {
        self.tx.send_modify(|s| s.cancelled = true);
    }

    pub fn pause(&self) {
        self.tx.send_modify(|s| s.paused = true);
    }

    pub fn resume(&self) {
        self.tx.send_modify(|s| s.paused = false);
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.borrow().cancelled
    }

    pub fn is_paused(&self) -> bool {
        self.rx.borrow().paused
    }

    /// Yield point. Waits while paused and fails once cancelled. Returns how
    /// long it waited, so deadlines can exclude paused time.
    pub async fn checkpoint(&self) -> Result<Duration, Cancelled> {
        let started = Instant::now();
        let mut rx = self.rx.clone();
        loop {
            let state = *rx.borrow_and_update();
            if state.cancelled {
                return Err(Cancelled);
            }
            if !state.paused {
                return Ok(started.elapsed());
            }
            // The sender lives as long as any clone of this control.
            if rx.changed().await.is_err() {
                return Err(Cancelled);
            }
        }
    }

    /// Resolves once the turn is cancelled. For racing against long waits.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|s| s.cancelled).await;
    }
}

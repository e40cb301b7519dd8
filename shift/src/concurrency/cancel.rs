use tokio::sync::watch;

use crate::concurrency::shutdown::ShutdownRx;

/// Requests the cooperative cancellation of one migration.
#[derive(Debug, Clone)]
pub struct CancelTx(watch::Sender<bool>);

impl CancelTx {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }
}

pub type CancelRx = watch::Receiver<bool>;

pub fn create_cancel_channel() -> (CancelTx, CancelRx) {
    let (tx, rx) = watch::channel(false);
    (CancelTx(tx), rx)
}

/// Why a worker stopped before finishing its current step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    Shutdown,
}

/// Cancellation and shutdown signals observed together at chunk and event boundaries.
///
/// Shutdown is latched once seen, since waiting on the watch channel marks it as seen.
#[derive(Debug, Clone)]
pub struct StopSignals {
    cancel_rx: CancelRx,
    shutdown_rx: ShutdownRx,
    shutdown: bool,
}

impl StopSignals {
    pub fn new(cancel_rx: CancelRx, shutdown_rx: ShutdownRx) -> Self {
        Self {
            cancel_rx,
            shutdown_rx,
            shutdown: false,
        }
    }

    pub fn shutdown_rx(&self) -> ShutdownRx {
        self.shutdown_rx.clone()
    }

    /// Returns the reason to stop, if any, without waiting. Shutdown wins over cancellation.
    pub fn check(&mut self) -> Option<StopReason> {
        if !self.shutdown && self.shutdown_rx.has_changed().unwrap_or(true) {
            self.shutdown = true;
        }

        if self.shutdown {
            Some(StopReason::Shutdown)
        } else if *self.cancel_rx.borrow() {
            Some(StopReason::Cancelled)
        } else {
            None
        }
    }

    /// Waits for shutdown, ignoring cancellation.
    pub async fn shutdown_requested(&mut self) {
        if !self.shutdown && !self.shutdown_rx.has_changed().unwrap_or(true) {
            // An error means the sender is gone, which is a shutdown as well.
            let _ = self.shutdown_rx.changed().await;
        }

        self.shutdown = true;
    }

    /// Waits until the worker should stop.
    pub async fn stopped(&mut self) -> StopReason {
        if let Some(reason) = self.check() {
            return reason;
        }

        tokio::select! {
            biased;

            _ = self.shutdown_rx.changed() => {
                self.shutdown = true;
                StopReason::Shutdown
            }

            cancelled = self.cancel_rx.wait_for(|cancelled| *cancelled) => {
                match cancelled {
                    Ok(_) => StopReason::Cancelled,
                    // The migration handle is gone, nobody can observe the worker anymore.
                    Err(_) => StopReason::Shutdown,
                }
            }
        }
    }
}

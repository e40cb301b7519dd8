use metrics::counter;
use shift_config::shared::ThrottleConfig;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::concurrency::cancel::{StopReason, StopSignals};
use crate::concurrency::shutdown::ShutdownRx;
use crate::metrics::SHIFT_THROTTLED_TOTAL;
use crate::storage::LagSource;

/// Last observation of the throttler. Process local, never persisted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThrottleState {
    pub current_lag_estimate: f64,
    pub threshold: f64,
    pub paused: bool,
}

impl ThrottleState {
    /// Computes the next state from a new lag sample.
    ///
    /// Work pauses once the lag exceeds the threshold and only resumes once the lag drops below
    /// the resume threshold, so a lag hovering around the threshold does not flap.
    fn observe(self, lag: f64, resume_threshold: f64) -> ThrottleState {
        let paused = if self.paused {
            lag >= resume_threshold
        } else {
            lag > self.threshold
        };

        ThrottleState {
            current_lag_estimate: lag,
            threshold: self.threshold,
            paused,
        }
    }
}

/// Flow control gate shared by the migrations of a shard.
///
/// The throttler only decides whether copy and replay work may proceed. It never touches the
/// state of a migration.
#[derive(Debug, Clone)]
pub struct Throttler {
    state_rx: watch::Receiver<ThrottleState>,
}

impl Throttler {
    /// Returns a throttler which never pauses.
    pub fn disabled() -> Self {
        let (_, state_rx) = watch::channel(ThrottleState {
            current_lag_estimate: 0.0,
            threshold: f64::INFINITY,
            paused: false,
        });

        Self { state_rx }
    }

    /// Starts sampling `source` every `config.sample_interval_ms` until shutdown.
    ///
    /// Returns a disabled throttler and no task when `config.enabled` is `false`.
    pub fn start<L>(
        config: ThrottleConfig,
        source: L,
        mut shutdown_rx: ShutdownRx,
    ) -> (Throttler, Option<JoinHandle<()>>)
    where
        L: LagSource + Send + Sync + 'static,
    {
        if !config.enabled {
            return (Throttler::disabled(), None);
        }

        let (state_tx, state_rx) = watch::channel(ThrottleState {
            current_lag_estimate: 0.0,
            threshold: config.threshold,
            paused: false,
        });

        let sampler = async move {
            let resume_threshold = config.resume_threshold();
            let mut interval = tokio::time::interval(config.sample_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.changed() => {
                        debug!("shutting down throttler");
                        return;
                    }

                    _ = state_tx.closed() => {
                        return;
                    }

                    _ = interval.tick() => {}
                }

                let lag = match source.current_lag_estimate().await {
                    Ok(lag) => lag,
                    Err(err) => {
                        warn!(error = %err, "failed to sample the lag estimate, keeping the last state");
                        continue;
                    }
                };

                let previous = *state_tx.borrow();
                let next = previous.observe(lag, resume_threshold);
                if next.paused && !previous.paused {
                    info!(lag, threshold = next.threshold, "lag above threshold, pausing migrations");
                    counter!(SHIFT_THROTTLED_TOTAL).increment(1);
                } else if !next.paused && previous.paused {
                    info!(lag, resume_threshold, "lag recovered, resuming migrations");
                }
                state_tx.send_replace(next);
            }
        };

        let handle = tokio::spawn(sampler);

        (Throttler { state_rx }, Some(handle))
    }

    pub fn state(&self) -> ThrottleState {
        *self.state_rx.borrow()
    }

    /// Waits until work is allowed to proceed.
    ///
    /// Returns the reason to stop if the worker is cancelled or shut down while paused.
    pub async fn wait_until_open(&self, stop: &mut StopSignals) -> Option<StopReason> {
        if !self.state_rx.borrow().paused {
            return None;
        }

        debug!("waiting for the throttler to resume");
        let mut state_rx = self.state_rx.clone();
        tokio::select! {
            biased;

            reason = stop.stopped() => Some(reason),

            _ = state_rx.wait_for(|state| !state.paused) => None,
        }
    }
}

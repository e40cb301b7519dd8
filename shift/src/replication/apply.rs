use futures::StreamExt;
use metrics::{counter, gauge};
use shift_config::shared::EngineConfig;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::concurrency::cancel::StopSignals;
use crate::concurrency::shutdown::{ShutdownResult, ShutdownRx};
use crate::concurrency::stream::{BatchLimits, TimeoutBatchStream};
use crate::error::{ErrorKind, ShiftError, ShiftResult};
use crate::metrics::{SHARD, SHIFT_EVENTS_APPLIED_TOTAL, SHIFT_SYNC_LAG};
use crate::replication::PhaseOutcome;
use crate::schema::RowTranslator;
use crate::state::RecordWriter;
use crate::storage::{ChangeFeed, FeedStream, SchemaEngine};
use crate::store::MigrationStore;
use crate::throttle::Throttler;
use crate::types::{ChangeOperation, FeedMessage, Position, PrimaryKey, TableRow};
use crate::{bail, shift_error};

type BatchedFeed = TimeoutBatchStream<ShiftResult<FeedMessage>, FeedStream>;

/// Number of consecutive observations within the bound required to consider the shadow table
/// caught up.
const CONVERGED_OBSERVATIONS: u32 = 2;

/// Tracks lag observations until the shadow table is considered caught up.
#[derive(Debug)]
struct Convergence {
    bound: u64,
    dwell: Duration,
    observations: u32,
    within_bound_since: Option<Instant>,
}

impl Convergence {
    fn new(bound: u64, dwell: Duration) -> Self {
        Self {
            bound,
            dwell,
            observations: 0,
            within_bound_since: None,
        }
    }

    /// Records a lag observation and returns `true` once the lag stayed within the bound for
    /// enough consecutive observations and for at least the dwell time.
    fn observe(&mut self, lag: u64, now: Instant) -> bool {
        if lag > self.bound {
            self.observations = 0;
            self.within_bound_since = None;
            return false;
        }

        self.observations += 1;
        let since = *self.within_bound_since.get_or_insert(now);

        self.observations >= CONVERGED_OBSERVATIONS && now.duration_since(since) >= self.dwell
    }

    fn reset(&mut self) {
        self.observations = 0;
        self.within_bound_since = None;
    }
}

/// Rows written to the shadow table by one run of same-kind events.
enum PendingWrite {
    Upserts(Vec<TableRow>),
    Deletes(Vec<PrimaryKey>),
}

/// Replays the change feed of the live table onto the shadow table.
///
/// The applier owns the feed subscription. A broken subscription is re-established from the
/// last applied position after a backoff, so events may be delivered twice. Events at or before
/// the applied position are skipped and every write is keyed by primary key, which makes
/// replaying them harmless.
pub struct ChangeApplier<D> {
    database: D,
    translator: RowTranslator,
    source_table: String,
    shadow_table: String,
    shard: String,
    config: Arc<EngineConfig>,
    shutdown_rx: ShutdownRx,
    feed: Option<Pin<Box<BatchedFeed>>>,
    failures: u32,
    unavailable_since: Option<Instant>,
    retry_at: Option<Instant>,
}

impl<D> ChangeApplier<D>
where
    D: SchemaEngine + ChangeFeed,
{
    pub fn new<S>(
        database: D,
        translator: RowTranslator,
        writer: &RecordWriter<S>,
        config: Arc<EngineConfig>,
        shutdown_rx: ShutdownRx,
    ) -> Self {
        let record = writer.record();

        Self {
            database,
            translator,
            source_table: record.request.table.clone(),
            shadow_table: record.shadow_table.clone(),
            shard: record.shard.to_string(),
            config,
            shutdown_rx,
            feed: None,
            failures: 0,
            unavailable_since: None,
            retry_at: None,
        }
    }

    /// Applies changes until the shadow table has converged with the live table.
    ///
    /// Fails with [`ErrorKind::ConvergenceTimeout`] when convergence is not reached within
    /// `sync.max_convergence_wait_ms`.
    pub async fn sync_until_converged<S>(
        &mut self,
        writer: &mut RecordWriter<S>,
        throttler: &Throttler,
        stop: &mut StopSignals,
    ) -> ShiftResult<PhaseOutcome>
    where
        S: MigrationStore,
    {
        let sync = self.config.sync.clone();
        let started = Instant::now();
        let mut convergence = Convergence::new(sync.convergence_bound, sync.convergence_dwell());
        let mut check_interval = tokio::time::interval(sync.check_interval());
        check_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            from = ?writer.record().progress.replay_position(),
            "replaying changes onto shadow table {}", self.shadow_table
        );

        loop {
            if let Some(reason) = throttler.wait_until_open(stop).await {
                return Ok(PhaseOutcome::Stopped(reason));
            }

            let from = replay_position(writer);
            let messages = tokio::select! {
                biased;

                reason = stop.stopped() => return Ok(PhaseOutcome::Stopped(reason)),

                _ = check_interval.tick() => {
                    let lag = self.current_lag(writer).await?;
                    // An idle table shows no lag even while its change feed cannot be read, so
                    // observations only count while the subscription is open.
                    if !self.is_subscribed() {
                        convergence.reset();
                    } else if convergence.observe(lag, Instant::now()) {
                        info!(lag, "shadow table caught up with the live table");
                        return Ok(PhaseOutcome::Finished);
                    }

                    if let Some(max_wait) = sync.max_convergence_wait()
                        && started.elapsed() >= max_wait
                    {
                        bail!(
                            ErrorKind::ConvergenceTimeout,
                            "Shadow table did not converge in time",
                            format!("lag of {lag} positions after {max_wait:?}")
                        );
                    }

                    continue;
                }

                messages = self.poll_feed(from) => messages?,
            };

            if let Some(messages) = messages {
                self.apply_messages(writer, messages).await?;
            }
        }
    }

    /// Applies changes until the applied position reaches `target`.
    ///
    /// Returns `false` if `deadline` passes first.
    pub async fn catch_up_to<S>(
        &mut self,
        writer: &mut RecordWriter<S>,
        target: Position,
        deadline: Instant,
    ) -> ShiftResult<bool>
    where
        S: MigrationStore,
    {
        loop {
            let from = replay_position(writer);
            if from >= target {
                return Ok(true);
            }

            match tokio::time::timeout_at(deadline, self.poll_feed(from)).await {
                Err(_) => {
                    warn!(%from, %target, "timed out draining the change feed");
                    return Ok(false);
                }
                Ok(messages) => {
                    if let Some(messages) = messages? {
                        self.apply_messages(writer, messages).await?;
                    }
                }
            }
        }
    }

    /// Returns `true` while a feed subscription is open. A failed read closes it until the
    /// next successful subscription.
    fn is_subscribed(&self) -> bool {
        self.feed.is_some()
    }

    async fn current_lag<S>(&mut self, writer: &RecordWriter<S>) -> ShiftResult<u64> {
        let live = self.database.live_position().await?;
        let lag = replay_position(writer).lag_to(live);
        gauge!(SHIFT_SYNC_LAG, SHARD => self.shard.clone()).set(lag as f64);

        Ok(lag)
    }

    /// Returns the next batch of messages, or `None` if the subscription broke and will be
    /// re-established on the next call.
    async fn poll_feed(&mut self, from: Position) -> ShiftResult<Option<Vec<FeedMessage>>> {
        if let Some(retry_at) = self.retry_at {
            tokio::time::sleep_until(retry_at).await;
            self.retry_at = None;
        }

        if self.feed.is_none() {
            match self.database.subscribe(&self.source_table, from).await {
                Ok(stream) => {
                    self.feed = Some(Box::pin(TimeoutBatchStream::wrap(
                        stream,
                        BatchLimits::from(&self.config.sync),
                        self.shutdown_rx.clone(),
                    )));
                }
                Err(err) => {
                    self.register_failure(err)?;
                    return Ok(None);
                }
            }
        }

        let Some(feed) = self.feed.as_mut() else {
            return Ok(None);
        };
        let items = match feed.next().await {
            Some(ShutdownResult::Ok(items)) => items,
            Some(ShutdownResult::Shutdown(_)) => {
                self.feed = None;
                return Ok(None);
            }
            None => {
                self.feed = None;
                self.register_failure(shift_error!(
                    ErrorKind::FeedTransientError,
                    "Change feed subscription ended",
                    format!("table `{}`", self.source_table)
                ))?;
                return Ok(None);
            }
        };

        let mut messages = Vec::with_capacity(items.len());
        for item in items {
            match item {
                Ok(message) => messages.push(message),
                Err(err) => {
                    // Messages after a failure are delivered again by the next subscription.
                    self.feed = None;
                    self.register_failure(err)?;
                    return Ok(Some(messages));
                }
            }
        }

        self.failures = 0;
        self.unavailable_since = None;

        Ok(Some(messages))
    }

    /// Schedules a new subscription after a transient feed failure.
    ///
    /// Fails with [`ErrorKind::FeedUnavailable`] once the retry budget or the unavailability
    /// deadline is exhausted, and returns non transient errors as is.
    fn register_failure(&mut self, err: ShiftError) -> ShiftResult<()> {
        if !err.is_transient() {
            return Err(err);
        }

        let retry = &self.config.feed_retry;
        self.failures += 1;
        let since = *self.unavailable_since.get_or_insert_with(Instant::now);
        if self.failures > retry.max_attempts
            || since.elapsed() >= self.config.sync.feed_unavailable_timeout()
        {
            bail!(
                ErrorKind::FeedUnavailable,
                "Change feed is unavailable",
                format!("{} failed attempts, last error: {err}", self.failures)
            );
        }

        let delay = retry.delay_for_attempt(self.failures - 1);
        warn!(
            error = %err,
            attempt = self.failures,
            ?delay,
            "change feed read failed, resubscribing"
        );
        self.retry_at = Some(Instant::now() + delay);

        Ok(())
    }

    /// Applies a batch of messages and checkpoints the new applied position.
    async fn apply_messages<S>(
        &mut self,
        writer: &mut RecordWriter<S>,
        messages: Vec<FeedMessage>,
    ) -> ShiftResult<()>
    where
        S: MigrationStore,
    {
        let applied = replay_position(writer);
        let mut pending: Option<PendingWrite> = None;
        let mut last_position = None;
        let mut events = 0u64;

        for message in messages {
            let position = message.position();
            if position <= applied {
                continue;
            }
            last_position = Some(position);

            let FeedMessage::Change(event) = message else {
                continue;
            };
            events += 1;

            match event.operation {
                ChangeOperation::Insert | ChangeOperation::Update => {
                    let row = self.translator.translate(&event.row_image)?;
                    match &mut pending {
                        Some(PendingWrite::Upserts(rows)) => rows.push(row),
                        _ => {
                            self.flush(pending.take()).await?;
                            pending = Some(PendingWrite::Upserts(vec![row]));
                        }
                    }
                }
                ChangeOperation::Delete => match &mut pending {
                    Some(PendingWrite::Deletes(keys)) => keys.push(event.primary_key),
                    _ => {
                        self.flush(pending.take()).await?;
                        pending = Some(PendingWrite::Deletes(vec![event.primary_key]));
                    }
                },
            }
        }
        self.flush(pending).await?;

        let Some(position) = last_position else {
            return Ok(());
        };

        let progress = writer.progress_mut();
        progress.applied_position = Some(position);
        progress.events_applied += events;
        writer.checkpoint().await?;

        if events > 0 {
            counter!(SHIFT_EVENTS_APPLIED_TOTAL, SHARD => self.shard.clone()).increment(events);
            debug!(events, %position, "applied changes");
        }

        Ok(())
    }

    async fn flush(&mut self, pending: Option<PendingWrite>) -> ShiftResult<()> {
        match pending {
            Some(PendingWrite::Upserts(rows)) => {
                self.database.upsert_rows(&self.shadow_table, rows).await
            }
            Some(PendingWrite::Deletes(keys)) => {
                self.database.delete_rows(&self.shadow_table, keys).await
            }
            None => Ok(()),
        }
    }
}

fn replay_position<S>(writer: &RecordWriter<S>) -> Position {
    writer
        .record()
        .progress
        .replay_position()
        .unwrap_or(Position::ZERO)
}

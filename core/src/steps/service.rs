//! Background step service.
//!
//! One task per user owns a [`StepReconciler`], feeds it sensor readings and
//! periodically persists the reconciled total together with a heartbeat.
//! The foreground talks to it through a [`StepServiceHandle`].

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};

use crate::clock::Clock;
use crate::error::{ReconciliationConflict, StepServiceError, StoreError};
use crate::models::{StepCycle, UserId};
use crate::steps::cache::StepCache;
use crate::steps::reconcile::{Observation, StepReconciler};
use crate::steps::source::StepSource;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepServiceConfig {
    pub persist_interval_ms: u64,
    /// Consecutive persistence failures tolerated before backing off.
    pub failure_threshold: u32,
    pub max_backoff_ms: u64,
    pub resubscribe_delay_ms: u64,
}

impl Default for StepServiceConfig {
    fn default() -> Self {
        Self {
            persist_interval_ms: 30_000,
            failure_threshold: 3,
            max_backoff_ms: 300_000,
            resubscribe_delay_ms: 5_000,
        }
    }
}

impl StepServiceConfig {
    /// Delay until the next persistence cycle after `failures` consecutive
    /// failures. Doubles per failure once the threshold is reached.
    #[must_use]
    pub fn persist_delay(&self, failures: u32) -> Duration {
        let base = self.persist_interval_ms;
        let ms = if failures < self.failure_threshold {
            base
        } else {
            let doublings = (failures - self.failure_threshold + 1).min(32);
            base.saturating_mul(1u64 << doublings)
                .min(self.max_backoff_ms.max(base))
        };
        Duration::from_millis(ms)
    }

    fn resubscribe_delay(&self) -> Duration {
        Duration::from_millis(self.resubscribe_delay_ms)
    }
}

pub struct StepService;

impl StepService {
    /// Start the background task. Must be called inside a tokio runtime.
    pub fn spawn(
        store: Store,
        source: Arc<dyn StepSource>,
        cache: Arc<dyn StepCache>,
        owner: UserId,
        clock: Arc<dyn Clock>,
        config: StepServiceConfig,
    ) -> StepServiceHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (resync_tx, resync_rx) = mpsc::channel(8);
        let (total_tx, total_rx) = watch::channel(0);

        let worker = Worker {
            reconciler: StepReconciler::new(clock.today()),
            store,
            source,
            cache,
            owner,
            clock,
            config,
            last_written: None,
            failures: 0,
            total_tx,
        };
        let task = tokio::spawn(worker.run(shutdown_rx, resync_rx));

        StepServiceHandle {
            shutdown: shutdown_tx,
            resync: resync_tx,
            total: total_rx,
            task,
        }
    }
}

/// Foreground handle. Dropping it also stops the service.
pub struct StepServiceHandle {
    shutdown: watch::Sender<bool>,
    resync: mpsc::Sender<oneshot::Sender<i64>>,
    total: watch::Receiver<i64>,
    task: JoinHandle<()>,
}

impl StepServiceHandle {
    /// Run a reconciliation cycle now, independent of the background cadence,
    /// and return the resulting total.
    pub async fn force_resync(&self) -> Result<i64, StepServiceError> {
        let (tx, rx) = oneshot::channel();
        self.resync
            .send(tx)
            .await
            .map_err(|_| StepServiceError::Stopped)?;
        rx.await.map_err(|_| StepServiceError::Stopped)
    }

    #[must_use]
    pub fn is_task_alive(&self) -> bool {
        !self.task.is_finished()
    }

    /// Latest running total published by the task.
    #[must_use]
    pub fn current_total(&self) -> i64 {
        *self.total.borrow()
    }

    /// Ask the task to stop and wait for its final persist. Returns the last
    /// published total.
    pub async fn stop(self) -> Result<i64, StepServiceError> {
        // Already gone if the receiver is dropped.
        let _ = self.shutdown.send(true);
        self.task
            .await
            .map_err(|err| StepServiceError::Task(err.to_string()))?;
        Ok(*self.total.borrow())
    }
}

enum Event {
    Shutdown,
    Resync(oneshot::Sender<i64>),
    Reading(i64),
    StreamClosed,
    PersistDue,
    Resubscribe,
}

struct Worker {
    store: Store,
    source: Arc<dyn StepSource>,
    cache: Arc<dyn StepCache>,
    owner: UserId,
    clock: Arc<dyn Clock>,
    config: StepServiceConfig,
    reconciler: StepReconciler,
    /// Count the store held for the reconciler's day after our last write.
    last_written: Option<i64>,
    failures: u32,
    total_tx: watch::Sender<i64>,
}

async fn next_reading(readings: &mut Option<mpsc::Receiver<i64>>) -> Option<i64> {
    match readings {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl Worker {
    async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
        mut resync: mpsc::Receiver<oneshot::Sender<i64>>,
    ) {
        tracing::info!(
            event = "step_service_started",
            user_id = %self.owner,
            source = self.source.name()
        );
        self.log_resume().await;
        self.cycle().await;

        let mut readings = self.subscribe();
        let mut resubscribe_at = readings
            .is_none()
            .then(|| Instant::now() + self.config.resubscribe_delay());
        let mut persist_at = Instant::now() + self.config.persist_delay(self.failures);

        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.changed() => Event::Shutdown,
                msg = resync.recv() => msg.map_or(Event::Shutdown, Event::Resync),
                reading = next_reading(&mut readings) => {
                    reading.map_or(Event::StreamClosed, Event::Reading)
                }
                () = sleep_until(persist_at) => Event::PersistDue,
                () = sleep_until_some(resubscribe_at) => Event::Resubscribe,
            };

            match event {
                Event::Shutdown => break,
                Event::Resync(reply) => {
                    self.cycle().await;
                    // The caller may have given up waiting.
                    let _ = reply.send(self.reconciler.running_total());
                    persist_at = Instant::now() + self.config.persist_delay(self.failures);
                }
                Event::Reading(reading) => self.observe(reading).await,
                Event::StreamClosed => {
                    tracing::info!(
                        event = "step_stream_closed",
                        user_id = %self.owner,
                        source = self.source.name()
                    );
                    readings = None;
                    resubscribe_at = Some(Instant::now() + self.config.resubscribe_delay());
                }
                Event::PersistDue => {
                    self.cycle().await;
                    persist_at = Instant::now() + self.config.persist_delay(self.failures);
                }
                Event::Resubscribe => {
                    readings = self.subscribe();
                    resubscribe_at = readings
                        .is_none()
                        .then(|| Instant::now() + self.config.resubscribe_delay());
                }
            }
        }

        self.cycle().await;
        tracing::info!(
            event = "step_service_stopped",
            user_id = %self.owner,
            total = self.reconciler.running_total()
        );
    }

    async fn log_resume(&self) {
        match self.store.get_step_sync_state(&self.owner).await {
            Ok(Some(state)) => tracing::info!(
                event = "step_service_resumed",
                user_id = %self.owner,
                last_sync_date = ?state.last_sync_date,
                last_heartbeat_at = ?state.last_heartbeat_at
            ),
            Ok(None) => {}
            Err(err) => tracing::warn!(
                event = "step_state_unreadable",
                user_id = %self.owner,
                error = %err
            ),
        }
    }

    fn subscribe(&mut self) -> Option<mpsc::Receiver<i64>> {
        match self.source.subscribe() {
            Ok(rx) => {
                self.reconciler.start_session();
                tracing::debug!(
                    event = "step_session_started",
                    user_id = %self.owner,
                    source = self.source.name()
                );
                Some(rx)
            }
            Err(err) => {
                tracing::warn!(
                    event = "step_subscribe_failed",
                    user_id = %self.owner,
                    error = %err
                );
                None
            }
        }
    }

    fn publish(&self) {
        self.total_tx.send_replace(self.reconciler.running_total());
    }

    async fn observe(&mut self, reading: i64) {
        self.roll_over(self.clock.today()).await;
        if self.reconciler.observe(reading) == Observation::Reset {
            tracing::debug!(
                event = "step_session_reset",
                user_id = %self.owner,
                reading,
                total = self.reconciler.running_total()
            );
        }
        self.publish();
    }

    /// Close out the previous day once the calendar date moves on.
    async fn roll_over(&mut self, today: NaiveDate) {
        let Some((day, total)) = self.reconciler.roll_over(today) else {
            return;
        };
        self.last_written = None;
        tracing::info!(
            event = "step_day_rolled_over",
            user_id = %self.owner,
            finished = %day,
            total
        );
        if let Err(err) = self.store.record_daily_steps(&self.owner, day, total).await {
            tracing::warn!(
                event = "step_final_persist_failed",
                user_id = %self.owner,
                date = %day,
                error = %err
            );
        }
        self.publish();
    }

    /// One reconciliation cycle: merge the cached total into the running
    /// total, then persist it with a heartbeat. The store compares against
    /// our last write in the same transaction, so a lowered row is adopted
    /// rather than raised back.
    async fn cycle(&mut self) {
        self.roll_over(self.clock.today()).await;
        let date = self.reconciler.date();

        let cached = self.cache_read(date).await;
        let conflicts = self.reconciler.merge(None, cached);
        self.log_conflicts(date, conflicts);

        let total = self.reconciler.running_total();
        match self
            .store
            .persist_step_cycle(&self.owner, date, total, self.last_written)
            .await
        {
            Ok(StepCycle::Written(write)) => {
                self.persisted();
                // Another writer may have raised the row in the meantime.
                let conflicts = self.reconciler.merge(Some(write.steps.count), None);
                self.log_conflicts(date, conflicts);
                self.last_written = Some(write.steps.count);
                self.cache_write(date, self.reconciler.running_total()).await;
            }
            Ok(StepCycle::Overridden(steps)) => {
                self.persisted();
                tracing::info!(
                    event = "step_override_adopted",
                    user_id = %self.owner,
                    %date,
                    from = total,
                    to = steps.count
                );
                self.reconciler.accept_correction(steps.count);
                self.last_written = Some(steps.count);
                self.cache_write(date, self.reconciler.running_total()).await;
            }
            Err(err) => self.record_failure(&err),
        }
        self.publish();
    }

    fn log_conflicts(&self, date: NaiveDate, conflicts: Vec<ReconciliationConflict>) {
        for conflict in conflicts {
            tracing::debug!(
                event = "step_conflict",
                user_id = %self.owner,
                %date,
                source = conflict.source_name,
                reported = conflict.reported,
                running_total = conflict.running_total
            );
        }
    }

    // The cache does blocking file IO, so it stays off the runtime threads.
    async fn cache_read(&self, date: NaiveDate) -> Option<i64> {
        let cache = Arc::clone(&self.cache);
        let owner = self.owner.clone();
        match tokio::task::spawn_blocking(move || cache.read(&owner, date)).await {
            Ok(total) => total,
            Err(err) => {
                tracing::warn!(
                    event = "step_cache_failed",
                    user_id = %self.owner,
                    op = "read",
                    error = %err
                );
                None
            }
        }
    }

    async fn cache_write(&self, date: NaiveDate, total: i64) {
        let cache = Arc::clone(&self.cache);
        let owner = self.owner.clone();
        if let Err(err) =
            tokio::task::spawn_blocking(move || cache.write(&owner, date, total)).await
        {
            tracing::warn!(
                event = "step_cache_failed",
                user_id = %self.owner,
                op = "write",
                error = %err
            );
        }
    }

    fn persisted(&mut self) {
        if self.failures > 0 {
            tracing::info!(
                event = "step_persist_recovered",
                user_id = %self.owner,
                after_failures = self.failures
            );
        }
        self.failures = 0;
    }

    fn record_failure(&mut self, err: &StoreError) {
        self.failures += 1;
        tracing::warn!(
            event = "step_persist_failed",
            user_id = %self.owner,
            failures = self.failures,
            transient = err.is_transient(),
            next_attempt_ms = self.config.persist_delay(self.failures).as_millis() as u64,
            error = %err
        );
    }
}

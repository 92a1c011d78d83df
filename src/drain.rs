use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::broker::DurableLog;
use crate::downstream::DownstreamApi;
use crate::error::{DeliveryFailure, LogError, RecordOutcome};
use crate::telemetry::metric_inc;
use crate::types::{DeadLetter, PartitionId, QueuedRecord};

/// How often and how patiently one queued record is retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total delivery attempts before the record is discarded.
    pub max_retries: u32,

    /// Pause after the first failure. Doubles per further failure.
    pub backoff: Duration,

    /// Upper bound for the doubled pause.
    pub backoff_max: Duration,

    /// Random extra pause in `0..=jitter`.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff: Duration::from_secs(5),
            backoff_max: Duration::from_secs(20),
            jitter: Duration::ZERO,
        }
    }
}

impl RetryPolicy {
    /// Same pause between every attempt.
    pub fn fixed(max_retries: u32, interval: Duration) -> Self {
        Self {
            max_retries,
            backoff: interval,
            backoff_max: interval,
            jitter: Duration::ZERO,
        }
    }

    /// Pause to take after `failures` consecutive failed attempts.
    pub fn delay_after(&self, failures: u32) -> Duration {
        let base = self.backoff.as_millis() as u64;
        let max = (self.backoff_max.as_millis() as u64).max(base);
        let pow = 2u64.saturating_pow(failures.saturating_sub(1));
        let exp = base.saturating_mul(pow).min(max);
        Duration::from_millis(exp) + jitter_delay(self.jitter)
    }
}

fn jitter_delay(jitter: Duration) -> Duration {
    let jitter_ms = jitter.as_millis() as u64;
    if jitter_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(fastrand::u64(0..=jitter_ms))
}

/// Drain loop settings.
#[derive(Debug, Clone)]
pub struct DrainConfig {
    pub retry: RetryPolicy,

    /// Bound on each downstream call.
    pub delivery_timeout: Duration,

    /// Idle wait after a fetch came back empty.
    pub poll_interval: Duration,

    /// Wait after a failed fetch, commit or dead-letter write.
    pub infra_backoff: Duration,

    /// Partitions owned by this process. `None` means all of them.
    pub partitions: Option<Vec<PartitionId>>,

    /// Write discarded records to the dead-letter store before committing.
    pub dead_letter: bool,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            delivery_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(500),
            infra_backoff: Duration::from_secs(1),
            partitions: None,
            dead_letter: false,
        }
    }
}

/// Lifecycle of one queued record inside a drain worker.
///
/// `Retrying { attempt }` carries the number of the attempt about to be
/// made. The counter never leaves the worker; a restart starts over at
/// `Fetched`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordState {
    Fetched,
    Retrying { attempt: u32 },
    Delivered { attempts: u32 },
    Discarded { attempts: u32, last_failure: DeliveryFailure },
}

impl RecordState {
    /// Number of the next delivery attempt, or `None` once terminal.
    pub fn pending_attempt(&self) -> Option<u32> {
        match self {
            RecordState::Fetched => Some(1),
            RecordState::Retrying { attempt } => Some(*attempt),
            RecordState::Delivered { .. } | RecordState::Discarded { .. } => None,
        }
    }

    /// Apply the result of the pending attempt.
    pub fn on_attempt(self, result: Result<(), DeliveryFailure>, max_retries: u32) -> Self {
        let Some(attempt) = self.pending_attempt() else {
            return self;
        };

        match result {
            Ok(()) => RecordState::Delivered { attempts: attempt },
            Err(_) if attempt < max_retries.max(1) => RecordState::Retrying { attempt: attempt + 1 },
            Err(last_failure) => RecordState::Discarded {
                attempts: attempt,
                last_failure,
            },
        }
    }

    pub fn outcome(&self) -> Option<RecordOutcome> {
        match self {
            RecordState::Delivered { attempts } => Some(RecordOutcome::Delivered { attempts: *attempts }),
            RecordState::Discarded { attempts, last_failure } => Some(RecordOutcome::Discarded {
                attempts: *attempts,
                last_failure: last_failure.clone(),
            }),
            RecordState::Fetched | RecordState::Retrying { .. } => None,
        }
    }
}

/// Redelivers queued records, one worker per owned partition.
///
/// A worker processes its partition strictly in order: a record is
/// either delivered or discarded, and its offset committed, before the
/// next one is fetched. Broker failures are retried until they clear
/// or shutdown is requested; they never cause a record to be skipped.
pub struct Drain {
    log: Arc<dyn DurableLog>,
    downstream: Arc<dyn DownstreamApi>,
    config: DrainConfig,
}

impl Drain {
    pub fn new(log: Arc<dyn DurableLog>, downstream: Arc<dyn DownstreamApi>, config: DrainConfig) -> Self {
        Self {
            log,
            downstream,
            config,
        }
    }

    pub fn config(&self) -> &DrainConfig {
        &self.config
    }

    /// Partitions this process drives, deduplicated and in range.
    pub fn owned_partitions(&self) -> Vec<PartitionId> {
        let count = self.log.partition_count();
        let mut owned: Vec<PartitionId> = match &self.config.partitions {
            Some(list) => list.iter().copied().filter(|p| p.0 < count).collect(),
            None => (0..count).map(PartitionId).collect(),
        };
        owned.sort();
        owned.dedup();
        owned
    }

    /// Start one worker task per owned partition.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        self.owned_partitions()
            .into_iter()
            .map(|partition| {
                let drain = Arc::clone(&self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { drain.run_partition(partition, &shutdown).await })
            })
            .collect()
    }

    /// Drive one partition until shutdown.
    #[instrument(skip_all, fields(partition = %partition))]
    pub async fn run_partition(&self, partition: PartitionId, shutdown: &CancellationToken) {
        info!("drain worker started");

        while let Some(record) = self.next_record(partition, shutdown).await {
            let Some(outcome) = self.process_record(&record, shutdown).await else {
                info!(offset = %record.offset, "shutdown before outcome, leaving record uncommitted");
                break;
            };
            if !self.settle(&record, &outcome, shutdown).await {
                info!(offset = %record.offset, "shutdown before commit, record will be redelivered");
                break;
            }
        }

        info!("drain worker stopped");
    }

    async fn next_record(&self, partition: PartitionId, shutdown: &CancellationToken) -> Option<QueuedRecord> {
        loop {
            if shutdown.is_cancelled() {
                return None;
            }

            // A broker that stops answering must not hold up shutdown.
            let fetched = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return None,
                fetched = self.log.fetch(partition) => fetched,
            };

            match fetched {
                Ok(Some(record)) => return Some(record),
                Ok(None) => {
                    if !pause(self.config.poll_interval, shutdown).await {
                        return None;
                    }
                }
                Err(err) => {
                    metric_inc("relay.drain.fetch_error");
                    warn!(error = %err, "fetch failed, retrying");
                    if !pause(self.config.infra_backoff, shutdown).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Run the retry state machine for one record.
    ///
    /// Returns `None` when shutdown interrupted a backoff pause; the
    /// record then has no outcome and must not be committed. An attempt
    /// already in flight is allowed to finish.
    pub async fn process_record(&self, record: &QueuedRecord, shutdown: &CancellationToken) -> Option<RecordOutcome> {
        let max_retries = self.config.retry.max_retries.max(1);
        let mut state = RecordState::Fetched;

        while let Some(attempt) = state.pending_attempt() {
            let result = self
                .downstream
                .deliver(&record.payload, self.config.delivery_timeout)
                .await;

            if let Err(failure) = &result {
                warn!(
                    key = %record.key,
                    offset = %record.offset,
                    attempt,
                    max_retries,
                    failure = %failure,
                    "queued delivery failed"
                );
            }

            state = state.on_attempt(result, max_retries);

            if let RecordState::Retrying { attempt: next } = state {
                metric_inc("relay.drain.retry");
                let delay = self.config.retry.delay_after(next - 1);
                debug!(offset = %record.offset, delay_ms = delay.as_millis() as u64, "backing off");
                if !pause(delay, shutdown).await {
                    return None;
                }
            }
        }

        state.outcome()
    }

    /// Record the terminal outcome and commit. Returns `false` if shutdown
    /// arrived while the broker was refusing the write.
    async fn settle(&self, record: &QueuedRecord, outcome: &RecordOutcome, shutdown: &CancellationToken) -> bool {
        match outcome {
            RecordOutcome::Delivered { attempts } => {
                metric_inc("relay.drain.delivered");
                info!(key = %record.key, offset = %record.offset, attempts, "queued event delivered");
            }
            RecordOutcome::Discarded { attempts, last_failure } => {
                metric_inc("relay.drain.discarded");
                error!(
                    key = %record.key,
                    offset = %record.offset,
                    attempts,
                    last_failure = %last_failure,
                    "discarding poison record"
                );

                if self.config.dead_letter {
                    let entry = DeadLetter::new(record, *attempts, last_failure.to_string());
                    let parked = self
                        .until_written(BrokerWrite::DeadLetter, record, shutdown, || self.log.dead_letter(&entry))
                        .await;
                    if !parked {
                        return false;
                    }
                }
            }
        }

        self.until_written(BrokerWrite::Commit, record, shutdown, || self.log.commit(record))
            .await
    }

    async fn until_written<F, Fut>(
        &self,
        operation: BrokerWrite,
        record: &QueuedRecord,
        shutdown: &CancellationToken,
        mut write: F,
    ) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), LogError>>,
    {
        loop {
            match write().await {
                Ok(()) => return true,
                Err(err) => {
                    metric_inc(operation.error_counter());
                    warn!(
                        operation = operation.as_str(),
                        offset = %record.offset,
                        error = %err,
                        "broker write failed, retrying"
                    );
                    if !pause(self.config.infra_backoff, shutdown).await {
                        return false;
                    }
                }
            }
        }
    }
}

/// Broker writes a worker retries until they succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BrokerWrite {
    Commit,
    DeadLetter,
}

impl BrokerWrite {
    fn as_str(self) -> &'static str {
        match self {
            BrokerWrite::Commit => "commit",
            BrokerWrite::DeadLetter => "dead-letter",
        }
    }

    fn error_counter(self) -> &'static str {
        match self {
            BrokerWrite::Commit => "relay.drain.commit_error",
            BrokerWrite::DeadLetter => "relay.drain.dead_letter_error",
        }
    }
}

/// Sleep for `duration` unless shutdown comes first. `false` means cancelled.
async fn pause(duration: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => false,
        _ = sleep(duration) => true,
    }
}

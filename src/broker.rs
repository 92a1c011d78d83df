use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::warn;

use crate::config::Config;
use crate::error::LogError;
use crate::routing::partition_for;
use crate::types::{DeadLetter, Offset, PartitionId, QueuedRecord, RecordPosition, RoutingKey};

#[cfg(feature = "redis")]
use crate::broker_redis::RedisStreamLog;

#[cfg(feature = "postgres")]
use crate::broker_postgres::PostgresLog;

/// Partitioned, ordered, append-only log with explicit offset commit.
///
/// `fetch` always returns the oldest *uncommitted* record of a partition,
/// so calling it twice without a `commit` in between yields the same
/// record. `commit` advances that cursor past the given record.
///
/// `append` must be safe to call concurrently from many ingress requests.
/// `fetch` and `commit` for a given partition are only ever driven by the
/// single worker that owns it.
#[async_trait]
pub trait DurableLog: Send + Sync {
    fn partition_count(&self) -> u32;

    fn partition_of(&self, key: &RoutingKey) -> PartitionId {
        partition_for(key, self.partition_count())
    }

    async fn append(&self, key: &RoutingKey, payload: &[u8]) -> Result<RecordPosition, LogError>;

    async fn fetch(&self, partition: PartitionId) -> Result<Option<QueuedRecord>, LogError>;

    async fn commit(&self, record: &QueuedRecord) -> Result<(), LogError>;

    /// Park a discarded record for later inspection.
    async fn dead_letter(&self, entry: &DeadLetter) -> Result<(), LogError>;
}

/// Open the backend named by the broker URL scheme.
///
/// Called once per process; the returned handle is shared by everything
/// that touches the log.
pub async fn open_log(config: &Config) -> Result<Arc<dyn DurableLog>, LogError> {
    let scheme = config
        .broker_url
        .split_once("://")
        .map(|(scheme, _)| scheme)
        .unwrap_or_default();

    match scheme {
        "memory" => {
            warn!("using in-memory log; queued events do not survive a restart");
            Ok(Arc::new(InMemoryLog::new(config.partitions)))
        }
        #[cfg(feature = "redis")]
        "redis" | "rediss" => {
            let log = RedisStreamLog::connect(config.into()).await?;
            Ok(Arc::new(log))
        }
        #[cfg(feature = "postgres")]
        "postgres" | "postgresql" => {
            let log = PostgresLog::connect(config.into()).await?;
            Ok(Arc::new(log))
        }
        other => Err(LogError::UnsupportedBroker(format!("{}://", other))),
    }
}

/// Transport-level append retry shared by the network backends.
///
/// At most `attempts` tries with `pause` in between; the last error is
/// returned unchanged.
#[cfg_attr(not(any(feature = "redis", feature = "postgres")), allow(dead_code))]
pub(crate) async fn append_with_retries<F, Fut>(
    attempts: u32,
    pause: Duration,
    mut op: F,
) -> Result<RecordPosition, LogError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<RecordPosition, LogError>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(position) => return Ok(position),
            Err(err) if attempt < attempts => {
                warn!(error = %err, attempt, attempts, "append failed, retrying");
                tokio::time::sleep(pause).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[derive(Default)]
struct PartitionState {
    records: Vec<(RoutingKey, Vec<u8>)>,
    committed: usize,
}

/// In-process log for tests and local runs.
///
/// Offsets are decimal indices into each partition. Nothing survives
/// the process.
pub struct InMemoryLog {
    partitions: Vec<Mutex<PartitionState>>,
    dead_letters: Mutex<Vec<DeadLetter>>,
}

impl InMemoryLog {
    pub fn new(partitions: u32) -> Self {
        let partitions = (0..partitions.max(1))
            .map(|_| Mutex::new(PartitionState::default()))
            .collect();
        Self {
            partitions,
            dead_letters: Mutex::new(Vec::new()),
        }
    }

    fn state(&self, partition: PartitionId) -> Result<&Mutex<PartitionState>, LogError> {
        self.partitions
            .get(partition.0 as usize)
            .ok_or(LogError::UnknownPartition(partition))
    }

    /// Records appended to `partition`, committed or not.
    pub async fn len(&self, partition: PartitionId) -> usize {
        match self.state(partition) {
            Ok(state) => state.lock().await.records.len(),
            Err(_) => 0,
        }
    }

    /// Records in `partition` not yet committed.
    pub async fn pending(&self, partition: PartitionId) -> usize {
        match self.state(partition) {
            Ok(state) => {
                let state = state.lock().await;
                state.records.len() - state.committed
            }
            Err(_) => 0,
        }
    }

    /// Uncommitted records across all partitions.
    pub async fn total_pending(&self) -> usize {
        let mut total = 0;
        for state in &self.partitions {
            let state = state.lock().await;
            total += state.records.len() - state.committed;
        }
        total
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.lock().await.clone()
    }
}

#[async_trait]
impl DurableLog for InMemoryLog {
    fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }

    async fn append(&self, key: &RoutingKey, payload: &[u8]) -> Result<RecordPosition, LogError> {
        let partition = self.partition_of(key);
        let mut state = self.state(partition)?.lock().await;
        state.records.push((key.clone(), payload.to_vec()));
        Ok(RecordPosition {
            partition,
            offset: Offset((state.records.len() - 1).to_string()),
        })
    }

    async fn fetch(&self, partition: PartitionId) -> Result<Option<QueuedRecord>, LogError> {
        let state = self.state(partition)?.lock().await;
        Ok(state.records.get(state.committed).map(|(key, payload)| QueuedRecord {
            partition,
            offset: Offset(state.committed.to_string()),
            key: key.clone(),
            payload: payload.clone(),
        }))
    }

    async fn commit(&self, record: &QueuedRecord) -> Result<(), LogError> {
        let index: usize = record
            .offset
            .0
            .parse()
            .map_err(|_| LogError::Codec(format!("bad offset {}", record.offset)))?;

        let mut state = self.state(record.partition)?.lock().await;
        if index < state.committed {
            // Already behind the cursor; a repeated commit is a no-op.
            return Ok(());
        }
        if index > state.committed || index >= state.records.len() {
            return Err(LogError::OutOfOrderCommit {
                partition: record.partition,
                offset: record.offset.clone(),
            });
        }
        state.committed = index + 1;
        Ok(())
    }

    async fn dead_letter(&self, entry: &DeadLetter) -> Result<(), LogError> {
        self.dead_letters.lock().await.push(entry.clone());
        Ok(())
    }
}

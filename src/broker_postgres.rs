use std::time::Duration;

use async_trait::async_trait;
use tokio_postgres::{Client, NoTls};
use tracing::error;

use crate::broker::{append_with_retries, DurableLog};
use crate::config::Config;
use crate::error::LogError;
use crate::types::{DeadLetter, Offset, PartitionId, QueuedRecord, RecordPosition, RoutingKey};

// A racing append that loses the unique index just takes the next slot.
const MAX_SEQ_CONFLICTS: u32 = 16;

/// Connection settings for [`PostgresLog`].
#[derive(Debug, Clone)]
pub struct PostgresLogConfig {
    pub url: String,
    pub partitions: u32,
    pub append_attempts: u32,
    pub append_pause: Duration,
}

impl From<&Config> for PostgresLogConfig {
    fn from(config: &Config) -> Self {
        Self {
            url: config.broker_url.clone(),
            partitions: config.partitions,
            append_attempts: config.append_attempts,
            append_pause: Duration::from_millis(100),
        }
    }
}

/// Durable log on three Postgres tables.
///
/// `relay_log` holds records keyed by `(partition, seq)` where `seq` is
/// dense per partition. `relay_cursor` holds the last committed `seq` per
/// partition. `relay_dead_letter` holds parked poison records.
pub struct PostgresLog {
    client: Client,
    config: PostgresLogConfig,
}

impl PostgresLog {
    pub async fn connect(config: PostgresLogConfig) -> Result<Self, LogError> {
        let (client, connection) = tokio_postgres::connect(&config.url, NoTls)
            .await
            .map_err(unavailable)?;

        tokio::spawn(async move {
            if let Err(err) = connection.await {
                error!(error = %err, "postgres connection closed");
            }
        });

        let log = Self { client, config };
        log.migrate().await?;
        Ok(log)
    }

    async fn migrate(&self) -> Result<(), LogError> {
        self.client
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS relay_log (
                    partition INTEGER NOT NULL,
                    seq BIGINT NOT NULL,
                    routing_key TEXT NOT NULL,
                    payload BYTEA NOT NULL,
                    appended_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                    PRIMARY KEY (partition, seq)
                );
                CREATE TABLE IF NOT EXISTS relay_cursor (
                    partition INTEGER PRIMARY KEY,
                    committed BIGINT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS relay_dead_letter (
                    id BIGSERIAL PRIMARY KEY,
                    payload JSONB NOT NULL
                );",
            )
            .await
            .map_err(unavailable)
    }

    fn check_partition(&self, partition: PartitionId) -> Result<(), LogError> {
        if partition.0 < self.config.partitions.max(1) {
            Ok(())
        } else {
            Err(LogError::UnknownPartition(partition))
        }
    }

    async fn insert_next(&self, partition: PartitionId, key: &RoutingKey, payload: &[u8]) -> Result<i64, LogError> {
        let partition_id = partition.0 as i32;
        for _ in 0..MAX_SEQ_CONFLICTS {
            let row = self
                .client
                .query_opt(
                    "INSERT INTO relay_log (partition, seq, routing_key, payload)
                     SELECT $1::INT, COALESCE(MAX(seq), -1) + 1, $2::TEXT, $3::BYTEA
                     FROM relay_log WHERE partition = $1::INT
                     ON CONFLICT (partition, seq) DO NOTHING
                     RETURNING seq",
                    &[&partition_id, &key.0, &payload],
                )
                .await
                .map_err(unavailable)?;

            if let Some(row) = row {
                return row.try_get::<_, i64>(0).map_err(|e| LogError::Codec(e.to_string()));
            }
        }
        Err(LogError::Unavailable(format!(
            "partition {} append lost {} sequence races",
            partition, MAX_SEQ_CONFLICTS
        )))
    }
}

#[async_trait]
impl DurableLog for PostgresLog {
    fn partition_count(&self) -> u32 {
        self.config.partitions.max(1)
    }

    async fn append(&self, key: &RoutingKey, payload: &[u8]) -> Result<RecordPosition, LogError> {
        let partition = self.partition_of(key);
        append_with_retries(self.config.append_attempts, self.config.append_pause, || async move {
            let seq = self.insert_next(partition, key, payload).await?;
            Ok(RecordPosition {
                partition,
                offset: Offset(seq.to_string()),
            })
        })
        .await
    }

    async fn fetch(&self, partition: PartitionId) -> Result<Option<QueuedRecord>, LogError> {
        self.check_partition(partition)?;
        let row = self
            .client
            .query_opt(
                "SELECT seq, routing_key, payload FROM relay_log
                 WHERE partition = $1::INT
                   AND seq > COALESCE((SELECT committed FROM relay_cursor WHERE partition = $1::INT), -1)
                 ORDER BY seq
                 LIMIT 1",
                &[&(partition.0 as i32)],
            )
            .await
            .map_err(unavailable)?;

        let Some(row) = row else { return Ok(None) };
        let codec = |e: tokio_postgres::Error| LogError::Codec(e.to_string());
        let seq: i64 = row.try_get(0).map_err(codec)?;
        let key: String = row.try_get(1).map_err(codec)?;
        let payload: Vec<u8> = row.try_get(2).map_err(codec)?;

        Ok(Some(QueuedRecord {
            partition,
            offset: Offset(seq.to_string()),
            key: RoutingKey(key),
            payload,
        }))
    }

    async fn commit(&self, record: &QueuedRecord) -> Result<(), LogError> {
        self.check_partition(record.partition)?;
        let seq: i64 = record
            .offset
            .0
            .parse()
            .map_err(|_| LogError::Codec(format!("bad offset {}", record.offset)))?;

        let partition_id = record.partition.0 as i32;

        // Moves the cursor by exactly one, and only onto a stored record.
        let advanced = self
            .client
            .execute(
                "INSERT INTO relay_cursor (partition, committed)
                 SELECT $1::INT, $2::BIGINT
                 WHERE EXISTS (SELECT 1 FROM relay_log WHERE partition = $1::INT AND seq = $2::BIGINT)
                   AND $2::BIGINT = COALESCE((SELECT committed FROM relay_cursor WHERE partition = $1::INT), -1) + 1
                 ON CONFLICT (partition)
                 DO UPDATE SET committed = EXCLUDED.committed
                 WHERE relay_cursor.committed + 1 = EXCLUDED.committed",
                &[&partition_id, &seq],
            )
            .await
            .map_err(unavailable)?;
        if advanced == 1 {
            return Ok(());
        }

        let committed = self
            .client
            .query_opt("SELECT committed FROM relay_cursor WHERE partition = $1::INT", &[&partition_id])
            .await
            .map_err(unavailable)?
            .map(|row| row.try_get::<_, i64>(0))
            .transpose()
            .map_err(|e| LogError::Codec(e.to_string()))?;

        if already_committed(seq, committed) {
            Ok(())
        } else {
            Err(LogError::OutOfOrderCommit {
                partition: record.partition,
                offset: record.offset.clone(),
            })
        }
    }

    async fn dead_letter(&self, entry: &DeadLetter) -> Result<(), LogError> {
        let payload = serde_json::to_value(entry).map_err(|e| LogError::Codec(e.to_string()))?;
        self.client
            .execute(
                "INSERT INTO relay_dead_letter (payload) VALUES ($1)",
                &[&payload],
            )
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}

/// A repeated commit at or behind the cursor is a no-op.
fn already_committed(seq: i64, committed: Option<i64>) -> bool {
    committed.is_some_and(|committed| seq <= committed)
}

fn unavailable(err: tokio_postgres::Error) -> LogError {
    LogError::Unavailable(err.to_string())
}

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tracing::{debug, warn};

use crate::broker::{append_with_retries, DurableLog};
use crate::config::Config;
use crate::error::LogError;
use crate::types::{DeadLetter, Offset, PartitionId, QueuedRecord, RecordPosition, RoutingKey};

const FIELD_KEY: &str = "key";
const FIELD_PAYLOAD: &str = "payload";

/// Connection settings for [`RedisStreamLog`].
#[derive(Debug, Clone)]
pub struct RedisLogConfig {
    pub url: String,
    pub stream: String,
    pub partitions: u32,
    pub group: String,
    pub append_attempts: u32,
    pub append_pause: Duration,

    /// Bound on each command round trip and on (re)connecting.
    pub response_timeout: Duration,
}

impl From<&Config> for RedisLogConfig {
    fn from(config: &Config) -> Self {
        Self {
            url: config.broker_url.clone(),
            stream: config.stream.clone(),
            partitions: config.partitions,
            group: config.consumer_group.clone(),
            append_attempts: config.append_attempts,
            append_pause: Duration::from_millis(100),
            response_timeout: config.broker_timeout,
        }
    }
}

/// Durable log on Redis Streams.
///
/// Each partition is its own stream, `<stream>:<partition>`, read through
/// one consumer group. The committed offset is the consumer group's
/// acknowledgement: a record is pending until `XACK`.
///
/// The consumer name depends on the partition alone, never on the
/// process. Whichever drain owns a partition next, after a restart or a
/// change of `RELAY_DRAIN_PARTITIONS`, reads the same pending list and
/// picks unacknowledged entries back up before anything new.
pub struct RedisStreamLog {
    conn: ConnectionManager,
    config: RedisLogConfig,
}

impl RedisStreamLog {
    /// Connect and make sure every partition stream and the consumer group exist.
    pub async fn connect(config: RedisLogConfig) -> Result<Self, LogError> {
        let client = redis::Client::open(config.url.as_str()).map_err(unavailable)?;
        let manager_config = ConnectionManagerConfig::new()
            .set_connection_timeout(config.response_timeout)
            .set_response_timeout(config.response_timeout);
        let conn = ConnectionManager::new_with_config(client, manager_config)
            .await
            .map_err(unavailable)?;
        let log = Self { conn, config };
        log.ensure_groups().await?;
        Ok(log)
    }

    async fn ensure_groups(&self) -> Result<(), LogError> {
        let mut conn = self.conn.clone();
        for partition in 0..self.config.partitions.max(1) {
            let key = self.stream_key(PartitionId(partition));
            let created: redis::RedisResult<()> = conn
                .xgroup_create_mkstream(&key, &self.config.group, "0")
                .await;
            match created {
                Ok(()) => debug!(stream = %key, group = %self.config.group, "created consumer group"),
                Err(err) if err.code() == Some("BUSYGROUP") => {}
                Err(err) => return Err(unavailable(err)),
            }
        }
        Ok(())
    }

    fn stream_key(&self, partition: PartitionId) -> String {
        format!("{}:{}", self.config.stream, partition.0)
    }

    fn dead_key(&self) -> String {
        format!("{}:dead", self.config.stream)
    }

    fn consumer_for(&self, partition: PartitionId) -> String {
        consumer_name(&self.config.group, partition)
    }

    fn check_partition(&self, partition: PartitionId) -> Result<(), LogError> {
        if partition.0 < self.config.partitions.max(1) {
            Ok(())
        } else {
            Err(LogError::UnknownPartition(partition))
        }
    }

    async fn read_one(&self, partition: PartitionId, from: &str) -> Result<Option<StreamId>, LogError> {
        let mut conn = self.conn.clone();
        let key = self.stream_key(partition);
        let options = StreamReadOptions::default()
            .group(&self.config.group, self.consumer_for(partition))
            .count(1);

        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&key], &[from], &options)
            .await
            .map_err(unavailable)?;

        Ok(reply
            .and_then(|reply| reply.keys.into_iter().next())
            .and_then(|stream| stream.ids.into_iter().next()))
    }

    async fn ack(&self, partition: PartitionId, id: &str) -> Result<(), LogError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .xack(self.stream_key(partition), &self.config.group, &[id])
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}

#[async_trait]
impl DurableLog for RedisStreamLog {
    fn partition_count(&self) -> u32 {
        self.config.partitions.max(1)
    }

    async fn append(&self, key: &RoutingKey, payload: &[u8]) -> Result<RecordPosition, LogError> {
        let partition = self.partition_of(key);
        let stream = self.stream_key(partition);

        append_with_retries(self.config.append_attempts, self.config.append_pause, || {
            let mut conn = self.conn.clone();
            let stream = stream.clone();
            async move {
                let id: String = conn
                    .xadd(
                        &stream,
                        "*",
                        &[(FIELD_KEY, key.as_bytes()), (FIELD_PAYLOAD, payload)],
                    )
                    .await
                    .map_err(unavailable)?;
                Ok(RecordPosition {
                    partition,
                    offset: Offset(id),
                })
            }
        })
        .await
    }

    async fn fetch(&self, partition: PartitionId) -> Result<Option<QueuedRecord>, LogError> {
        self.check_partition(partition)?;

        loop {
            // Entries handed out for this partition but never acked come first.
            let entry = match self.read_one(partition, "0").await? {
                Some(entry) => entry,
                None => match self.read_one(partition, ">").await? {
                    Some(entry) => entry,
                    None => return Ok(None),
                },
            };

            let key = entry.get::<String>(FIELD_KEY);
            let payload = entry.get::<Vec<u8>>(FIELD_PAYLOAD);
            match (key, payload) {
                (Some(key), Some(payload)) => {
                    return Ok(Some(QueuedRecord {
                        partition,
                        offset: Offset(entry.id),
                        key: RoutingKey(key),
                        payload,
                    }))
                }
                _ => {
                    // Trimmed by stream retention while pending: nothing left to deliver.
                    warn!(partition = %partition, offset = %entry.id, "pending entry has no body, acknowledging");
                    self.ack(partition, &entry.id).await?;
                }
            }
        }
    }

    async fn commit(&self, record: &QueuedRecord) -> Result<(), LogError> {
        self.check_partition(record.partition)?;
        self.ack(record.partition, &record.offset.0).await
    }

    async fn dead_letter(&self, entry: &DeadLetter) -> Result<(), LogError> {
        let payload = serde_json::to_string(entry).map_err(|e| LogError::Codec(e.to_string()))?;
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .rpush(self.dead_key(), payload)
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}

/// One consumer per partition, shared by every process that ever owns it.
fn consumer_name(group: &str, partition: PartitionId) -> String {
    format!("{}-p{}", group, partition.0)
}

fn unavailable(err: redis::RedisError) -> LogError {
    LogError::Unavailable(err.to_string())
}

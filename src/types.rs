use std::fmt;

use serde::{Deserialize, Serialize};

/// Key used when a payload carries no usable sender identifier.
pub const SENTINEL_ROUTING_KEY: &str = "system";

/// Sender identity used for partitioning.
///
/// All events sharing a routing key land in the same partition and are
/// delivered downstream in the order they were appended.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoutingKey(pub String);

impl RoutingKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The fallback key for payloads without a sender.
    pub fn sentinel() -> Self {
        Self(SENTINEL_ROUTING_KEY.to_string())
    }

    pub fn is_sentinel(&self) -> bool {
        self.0 == SENTINEL_ROUTING_KEY
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Index of an independently ordered sub-log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionId(pub u32);

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Backend-specific position of a record inside its partition.
///
/// In-memory and Postgres logs use decimal sequence numbers, Redis uses
/// stream entry IDs. Callers treat it as opaque and only hand it back
/// to the log that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Offset(pub String);

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where an appended record ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordPosition {
    pub partition: PartitionId,
    pub offset: Offset,
}

/// An inbound webhook event.
///
/// The payload is the untouched request body. It is forwarded byte for
/// byte; nothing in this crate re-encodes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub routing_key: RoutingKey,
    pub payload: Vec<u8>,
}

impl Event {
    pub fn new(routing_key: RoutingKey, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            routing_key,
            payload: payload.into(),
        }
    }
}

/// An event persisted in the durable log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedRecord {
    pub partition: PartitionId,
    pub offset: Offset,
    pub key: RoutingKey,
    pub payload: Vec<u8>,
}

impl QueuedRecord {
    pub fn position(&self) -> RecordPosition {
        RecordPosition {
            partition: self.partition,
            offset: self.offset.clone(),
        }
    }
}

/// A discarded record parked for manual inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub key: RoutingKey,
    pub partition: PartitionId,
    pub offset: Offset,
    pub payload: Vec<u8>,
    pub attempts: u32,
    pub last_failure: String,
    pub discarded_at_secs: u64,
}

impl DeadLetter {
    pub fn new(record: &QueuedRecord, attempts: u32, last_failure: impl Into<String>) -> Self {
        Self {
            key: record.key.clone(),
            partition: record.partition,
            offset: record.offset.clone(),
            payload: record.payload.clone(),
            attempts,
            last_failure: last_failure.into(),
            discarded_at_secs: now_secs(),
        }
    }
}

pub(crate) fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

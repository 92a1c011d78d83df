use std::fmt;

use crate::types::{Offset, PartitionId, RecordPosition, RoutingKey};

/// Why a single downstream delivery attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryFailure {
    /// The call exceeded its timeout.
    Timeout,

    /// Connection refused, reset, DNS failure and friends.
    Network,

    /// The API answered with something other than 200.
    Status(u16),
}

impl fmt::Display for DeliveryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryFailure::Timeout =>
                write!(f, "request timed out"),
            DeliveryFailure::Network =>
                write!(f, "network error"),
            DeliveryFailure::Status(code) =>
                write!(f, "downstream returned status {}", code),
        }
    }
}

impl std::error::Error for DeliveryFailure {}

/// Errors raised by a durable log backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogError {
    /// Broker unreachable or the operation failed in transport.
    Unavailable(String),

    /// A stored record could not be decoded.
    Codec(String),

    /// Commit for an offset beyond the partition cursor.
    OutOfOrderCommit {
        partition: PartitionId,
        offset: Offset,
    },

    /// Partition index outside the log's partition range.
    UnknownPartition(PartitionId),

    /// Broker URL scheme has no compiled-in backend.
    UnsupportedBroker(String),
}

impl fmt::Display for LogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogError::Unavailable(msg) =>
                write!(f, "broker unavailable: {}", msg),
            LogError::Codec(msg) =>
                write!(f, "undecodable record: {}", msg),
            LogError::OutOfOrderCommit { partition, offset } =>
                write!(f, "commit of offset {} skips ahead of partition {} cursor", offset, partition),
            LogError::UnknownPartition(partition) =>
                write!(f, "unknown partition: {}", partition),
            LogError::UnsupportedBroker(url) =>
                write!(f, "no backend for broker url: {}", url),
        }
    }
}

impl std::error::Error for LogError {}

/// Successful result of handling one inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngressOutcome {
    /// Downstream accepted the event directly. Nothing was queued.
    Delivered,

    /// Direct delivery failed; the event is durably queued.
    Queued(RecordPosition),
}

/// Hard failure of the ingress path.
///
/// Only returned when direct delivery *and* the fallback enqueue both
/// failed. The caller must surface this so the provider resends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngressError {
    EnqueueFailed {
        key: RoutingKey,
        delivery: DeliveryFailure,
        source: LogError,
    },
}

impl fmt::Display for IngressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngressError::EnqueueFailed { key, delivery, source } =>
                write!(
                    f,
                    "event for {} lost: direct delivery failed ({}) and enqueue failed ({})",
                    key, delivery, source
                ),
        }
    }
}

impl std::error::Error for IngressError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IngressError::EnqueueFailed { source, .. } => Some(source),
        }
    }
}

/// Terminal state of one queued record in the drain loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Delivered {
        attempts: u32,
    },

    /// Retry ceiling reached; committed anyway so the partition advances.
    Discarded {
        attempts: u32,
        last_failure: DeliveryFailure,
    },
}

/// Invalid configuration value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError(pub String);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "configuration error: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

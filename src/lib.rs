//! A webhook relay with a durable fallback queue.
//!
//! Inbound events are delivered straight to a downstream HTTP API. When
//! that fails, the raw body is appended to a partitioned log keyed by the
//! sender, and a separate drain process redelivers it with bounded retry.
//!
//! ## Guarantees
//! - An acknowledged event was either delivered or durably queued
//! - Per-sender order within the queued path
//! - At most `max_retries` queued delivery attempts per record
//! - A record is committed only after it was delivered or discarded
//!
//! ## Non-Guarantees
//! - Exactly-once delivery
//! - Order between the direct and the queued path
//! - Recovery of discarded records (dead-lettering is opt-in)
//!
//! Broker backends are selected by the URL scheme of `RELAY_BROKER_URL`
//! and gated behind the `redis` and `postgres` features.

mod types;
mod error;
mod routing;
mod telemetry;
mod downstream;
mod broker;
mod config;
mod drain;
mod ingress;
mod signing;
mod server;
mod shutdown;

#[cfg(feature = "redis")]
mod broker_redis;

#[cfg(feature = "postgres")]
mod broker_postgres;

pub use types::{DeadLetter, Event, Offset, PartitionId, QueuedRecord, RecordPosition, RoutingKey, SENTINEL_ROUTING_KEY};
pub use error::{
    ConfigError,
    DeliveryFailure,
    IngressError,
    IngressOutcome,
    LogError,
    RecordOutcome,
};
pub use routing::{extract_routing_key, extract_sender, partition_for, Sender};
pub use telemetry::init_tracing;
pub use downstream::{DownstreamApi, HttpDownstream};
pub use broker::{open_log, DurableLog, InMemoryLog};
pub use config::{Config, LogFormat};
pub use drain::{Drain, DrainConfig, RecordState, RetryPolicy};
pub use ingress::IngressRouter;
pub use signing::{
    compute_signature,
    format_signature_header,
    verify_signature_header,
    verify_subscription,
    SubscriptionQuery,
    VerificationError,
    SIGNATURE_HEADER,
};
pub use server::{build_router, AppState};
pub use shutdown::shutdown_signal;

#[cfg(feature = "redis")]
pub use broker_redis::{RedisLogConfig, RedisStreamLog};

#[cfg(feature = "postgres")]
pub use broker_postgres::{PostgresLog, PostgresLogConfig};

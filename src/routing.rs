//! Routing-key extraction and the stable partitioner.
//!
//! Only the handful of fields needed to find the sender are decoded.
//! Everything else in the provider payload is ignored, and the raw bytes
//! are what gets forwarded regardless of what happens here.

use serde::Deserialize;

use crate::types::{PartitionId, RoutingKey};

#[derive(Debug, Deserialize)]
struct Envelope {
    entry: Option<Vec<Entry>>,
}

#[derive(Debug, Deserialize)]
struct Entry {
    changes: Option<Vec<Change>>,
}

#[derive(Debug, Deserialize)]
struct Change {
    value: Option<ChangeValue>,
}

#[derive(Debug, Deserialize)]
struct ChangeValue {
    messages: Option<Vec<Message>>,
    contacts: Option<Vec<Contact>>,
}

#[derive(Debug, Deserialize)]
struct Message {
    from: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Contact {
    profile: Option<Profile>,
}

#[derive(Debug, Deserialize)]
struct Profile {
    name: Option<String>,
}

/// Who sent an inbound event, as far as the payload tells us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sender {
    pub key: RoutingKey,

    /// Display name of the first contact. Only used for log lines.
    pub name: Option<String>,
}

/// Best-effort sender lookup.
///
/// Reads `entry[0].changes[0].value.messages[0].from` for the key and
/// `...contacts[0].profile.name` for the display name. Any decode error,
/// missing field or empty sender yields the sentinel key.
pub fn extract_sender(raw: &[u8]) -> Sender {
    let value = serde_json::from_slice::<Envelope>(raw)
        .ok()
        .and_then(|envelope| envelope.entry)
        .and_then(|entries| entries.into_iter().next())
        .and_then(|entry| entry.changes)
        .and_then(|changes| changes.into_iter().next())
        .and_then(|change| change.value);

    let Some(value) = value else {
        return Sender {
            key: RoutingKey::sentinel(),
            name: None,
        };
    };

    let key = value
        .messages
        .and_then(|messages| messages.into_iter().next())
        .and_then(|message| message.from)
        .filter(|from| !from.trim().is_empty())
        .map(RoutingKey)
        .unwrap_or_else(RoutingKey::sentinel);

    let name = value
        .contacts
        .and_then(|contacts| contacts.into_iter().next())
        .and_then(|contact| contact.profile)
        .and_then(|profile| profile.name);

    Sender { key, name }
}

/// Routing key for a raw payload. See [`extract_sender`].
pub fn extract_routing_key(raw: &[u8]) -> RoutingKey {
    extract_sender(raw).key
}

/// Map a routing key onto one of `partitions` partitions.
///
/// FNV-1a over the key bytes, read as a signed 32-bit value, reduced
/// modulo the partition count and made non-negative. Same key, same
/// partition, on every process and every restart.
pub fn partition_for(key: &RoutingKey, partitions: u32) -> PartitionId {
    let partitions = partitions.max(1) as i64;
    let hash = fnv1a_32(key.as_bytes()) as i32 as i64;
    PartitionId((hash % partitions).unsigned_abs() as u32)
}

fn fnv1a_32(bytes: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;

    bytes.iter().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(PRIME)
    })
}

#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use webhook_relay::{
    DeadLetter, DeliveryFailure, DownstreamApi, DurableLog, InMemoryLog, LogError, PartitionId, QueuedRecord,
    RecordPosition, RoutingKey,
};

/// Downstream fake that replays scripted results, then a default.
pub struct ScriptedDownstream {
    script: Mutex<VecDeque<Result<(), DeliveryFailure>>>,
    fallback: Result<(), DeliveryFailure>,
    calls: Mutex<Vec<(Instant, Vec<u8>)>>,
}

impl ScriptedDownstream {
    pub fn always(result: Result<(), DeliveryFailure>) -> Arc<Self> {
        Self::scripted(Vec::new(), result)
    }

    pub fn scripted(script: Vec<Result<(), DeliveryFailure>>, fallback: Result<(), DeliveryFailure>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.calls.lock().unwrap().iter().map(|(_, p)| p.clone()).collect()
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().iter().map(|(t, _)| *t).collect()
    }
}

#[async_trait]
impl DownstreamApi for ScriptedDownstream {
    async fn deliver(&self, payload: &[u8], _timeout: Duration) -> Result<(), DeliveryFailure> {
        self.calls.lock().unwrap().push((Instant::now(), payload.to_vec()));
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

/// In-memory log that fails the next N calls of selected operations.
pub struct FlakyLog {
    pub inner: InMemoryLog,
    fetch_failures: AtomicU32,
    commit_failures: AtomicU32,
    append_failures: AtomicU32,
    hang_fetches: AtomicBool,
    commits: AtomicU32,
}

impl FlakyLog {
    pub fn new(partitions: u32) -> Self {
        Self {
            inner: InMemoryLog::new(partitions),
            fetch_failures: AtomicU32::new(0),
            commit_failures: AtomicU32::new(0),
            append_failures: AtomicU32::new(0),
            hang_fetches: AtomicBool::new(false),
            commits: AtomicU32::new(0),
        }
    }

    pub fn fail_fetches(self, n: u32) -> Self {
        self.fetch_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn fail_commits(self, n: u32) -> Self {
        self.commit_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn fail_appends(self, n: u32) -> Self {
        self.append_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Every fetch waits forever, like a broker that accepted the
    /// connection and stopped answering.
    pub fn hang_fetches(self) -> Self {
        self.hang_fetches.store(true, Ordering::SeqCst);
        self
    }

    /// Successful commits so far.
    pub fn commits(&self) -> u32 {
        self.commits.load(Ordering::SeqCst)
    }

    fn should_fail(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl DurableLog for FlakyLog {
    fn partition_count(&self) -> u32 {
        self.inner.partition_count()
    }

    async fn append(&self, key: &RoutingKey, payload: &[u8]) -> Result<RecordPosition, LogError> {
        if Self::should_fail(&self.append_failures) {
            return Err(LogError::Unavailable("injected append failure".into()));
        }
        self.inner.append(key, payload).await
    }

    async fn fetch(&self, partition: PartitionId) -> Result<Option<QueuedRecord>, LogError> {
        if self.hang_fetches.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if Self::should_fail(&self.fetch_failures) {
            return Err(LogError::Unavailable("injected fetch failure".into()));
        }
        self.inner.fetch(partition).await
    }

    async fn commit(&self, record: &QueuedRecord) -> Result<(), LogError> {
        if Self::should_fail(&self.commit_failures) {
            return Err(LogError::Unavailable("injected commit failure".into()));
        }
        self.inner.commit(record).await?;
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn dead_letter(&self, entry: &DeadLetter) -> Result<(), LogError> {
        self.inner.dead_letter(entry).await
    }
}

/// Poll `check` every 50ms until it holds, for at most ~10 virtual minutes.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..12_000 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Provider-shaped payload from `sender`.
pub fn payload_from(sender: &str, text: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "object": "whatsapp_business_account",
        "entry": [{
            "id": "1",
            "changes": [{
                "field": "messages",
                "value": {
                    "contacts": [{ "profile": { "name": "Test User" }, "wa_id": sender }],
                    "messages": [{ "from": sender, "id": "wamid.1", "type": "text", "text": { "body": text } }]
                }
            }]
        }]
    }))
    .unwrap()
}

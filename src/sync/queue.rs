use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::SaveError;
use crate::model::{EditableRecord, FieldPatch, RecordId};
use crate::sync::conflict::ConflictDescriptor;
use crate::sync::coordinator::SaveCoordinator;
use crate::sync::network::NetworkSignal;
use crate::sync::KeyValueStore;

pub const QUEUE_KEY: &str = "triage.offline_queue";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum QueueReason {
    Offline,
    NetworkError,
}

/// A write waiting for connectivity. At most one per record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOperation {
    pub id: Uuid,
    pub record_id: RecordId,
    pub payload: FieldPatch,
    pub expected_version: i64,
    pub reason: QueueReason,
    #[serde(with = "time::serde::timestamp")]
    pub created_at: OffsetDateTime,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSettings {
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub poll_interval: Duration,
}

impl From<&QueueConfig> for QueueSettings {
    fn from(config: &QueueConfig) -> Self {
        Self {
            base_backoff: config.base_backoff,
            max_backoff: config.max_backoff,
            poll_interval: config.poll_interval,
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

impl QueueSettings {
    /// `min(base * 2^(failures - 1), max)`.
    pub fn backoff_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.base_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

/// Callbacks fired as queued operations leave the queue.
pub trait QueueListener: Send + Sync {
    fn on_applied(&self, _op: &PendingOperation, _record: &EditableRecord) {}

    /// The server moved on while the operation waited. The operation is
    /// discarded, never retried.
    fn on_conflict(&self, _op: &PendingOperation, _conflict: &ConflictDescriptor) {}

    fn on_dropped(&self, _op: &PendingOperation, _error: &SaveError) {}
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueReport {
    pub applied: usize,
    pub conflicts: usize,
    pub dropped: usize,
    pub remaining: usize,
    /// Set when the walk stopped on a transient failure.
    pub retry_in: Option<Duration>,
}

#[derive(Debug, Default)]
struct QueueState {
    ops: Vec<PendingOperation>,
    failures: u32,
    backoff: Option<Duration>,
    next_retry: Option<Instant>,
}

impl QueueState {
    fn position(&self, id: Uuid) -> Option<usize> {
        self.ops.iter().position(|op| op.id == id)
    }

    fn remove(&mut self, id: Uuid) {
        if let Some(idx) = self.position(id) {
            self.ops.remove(idx);
        }
    }
}

enum Step {
    Applied(EditableRecord),
    Conflict(ConflictDescriptor),
    Dropped(SaveError),
    Deferred,
    Retry(Duration),
}

/// Persistent FIFO of writes that could not reach the store.
pub struct OfflineQueue {
    coordinator: Arc<SaveCoordinator>,
    kv: Arc<dyn KeyValueStore>,
    settings: QueueSettings,
    listener: Option<Arc<dyn QueueListener>>,
    state: Mutex<QueueState>,
    processing: AtomicBool,
}

struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl OfflineQueue {
    /// Restores the persisted queue. Entries that no longer decode are
    /// dropped with a warning.
    pub fn load(
        coordinator: Arc<SaveCoordinator>,
        kv: Arc<dyn KeyValueStore>,
        settings: QueueSettings,
    ) -> Result<Self> {
        let raw = kv.get(QUEUE_KEY).context("reading offline queue")?;
        let (ops, discarded) = raw.as_deref().map(decode_queue).unwrap_or_default();
        let queue = Self {
            coordinator,
            kv,
            settings,
            listener: None,
            state: Mutex::new(QueueState {
                ops,
                ..QueueState::default()
            }),
            processing: AtomicBool::new(false),
        };
        if discarded > 0 {
            let state = queue.state.lock();
            queue.persist(&state.ops)?;
        }
        Ok(queue)
    }

    pub fn with_listener(mut self, listener: Arc<dyn QueueListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Queues `payload` for `record_id`, merging into an existing operation
    /// for the same record. The earliest expected version is kept.
    pub fn enqueue(
        &self,
        record_id: RecordId,
        payload: FieldPatch,
        expected_version: i64,
        reason: QueueReason,
    ) -> Result<PendingOperation> {
        let mut state = self.state.lock();
        let op = match state.ops.iter_mut().find(|op| op.record_id == record_id) {
            Some(existing) => {
                existing.payload.merge(&payload);
                tracing::debug!(
                    record_id,
                    payload = %existing.payload,
                    expected_version = existing.expected_version,
                    "merged into queued operation"
                );
                existing.clone()
            }
            None => {
                let op = PendingOperation {
                    id: Uuid::new_v4(),
                    record_id,
                    payload,
                    expected_version,
                    reason,
                    created_at: OffsetDateTime::now_utc(),
                    attempts: 0,
                };
                state.ops.push(op.clone());
                tracing::info!(record_id, %reason, payload = %op.payload, "write queued");
                op
            }
        };
        self.persist(&state.ops)?;
        Ok(op)
    }

    pub fn pending(&self) -> Vec<PendingOperation> {
        self.state.lock().ops.clone()
    }

    pub fn queue_size(&self) -> usize {
        self.state.lock().ops.len()
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    /// Delay chosen after the most recent transient failure.
    pub fn current_backoff(&self) -> Option<Duration> {
        self.state.lock().backoff
    }

    pub fn next_retry_in(&self) -> Option<Duration> {
        self.state
            .lock()
            .next_retry
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Replays queued operations in order. Returns `None` if a drain is
    /// already running.
    pub async fn process_queue(&self) -> Option<QueueReport> {
        if self
            .processing
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            tracing::debug!("queue drain already running");
            return None;
        }
        let _guard = ProcessingGuard(&self.processing);

        let mut report = QueueReport::default();
        loop {
            let next = self.state.lock().ops.first().cloned();
            let Some(op) = next else {
                break;
            };

            let result = self
                .coordinator
                .replay(op.record_id, &op.payload, op.expected_version)
                .await;
            let step = self.settle(&op, result);

            match step {
                Step::Applied(record) => {
                    report.applied += 1;
                    if let Some(listener) = &self.listener {
                        listener.on_applied(&op, &record);
                    }
                }
                Step::Conflict(conflict) => {
                    report.conflicts += 1;
                    if let Some(listener) = &self.listener {
                        listener.on_conflict(&op, &conflict);
                    }
                }
                Step::Dropped(error) => {
                    report.dropped += 1;
                    if let Some(listener) = &self.listener {
                        listener.on_dropped(&op, &error);
                    }
                }
                Step::Deferred => break,
                Step::Retry(delay) => {
                    report.retry_in = Some(delay);
                    break;
                }
            }
        }

        report.remaining = self.queue_size();
        if report.applied + report.conflicts + report.dropped > 0 || report.retry_in.is_some() {
            tracing::info!(
                applied = report.applied,
                conflicts = report.conflicts,
                dropped = report.dropped,
                remaining = report.remaining,
                "offline queue processed"
            );
        }
        Some(report)
    }

    /// Applies the outcome of one replay to the queue and persists it.
    fn settle(&self, sent: &PendingOperation, result: Result<EditableRecord, SaveError>) -> Step {
        let mut state = self.state.lock();
        let step = match result {
            Ok(record) => {
                state.failures = 0;
                state.backoff = None;
                state.next_retry = None;
                match state.position(sent.id) {
                    Some(idx) if state.ops[idx].payload != sent.payload => {
                        // Fields merged in while the replay was in flight.
                        let op = &mut state.ops[idx];
                        let mut remaining = op.payload;
                        for value in sent.payload.values() {
                            if remaining.get(value.field()) == Some(value) {
                                remaining.remove(value.field());
                            }
                        }
                        if remaining.is_empty() {
                            state.ops.remove(idx);
                        } else {
                            op.payload = remaining;
                            op.expected_version = record.version;
                            tracing::debug!(
                                record_id = op.record_id,
                                payload = %op.payload,
                                "kept fields queued during replay"
                            );
                        }
                    }
                    Some(idx) => {
                        state.ops.remove(idx);
                    }
                    None => {}
                }
                Step::Applied(record)
            }
            Err(SaveError::Conflict(conflict)) => {
                state.remove(sent.id);
                tracing::warn!(
                    record_id = sent.record_id,
                    expected = sent.expected_version,
                    server = conflict.server.version,
                    "queued write conflicts with server, discarding"
                );
                Step::Conflict(*conflict)
            }
            Err(SaveError::Busy(record_id)) => {
                tracing::debug!(record_id, "record busy, leaving queued write for later");
                return Step::Deferred;
            }
            Err(error) if error.is_queueable() => {
                state.failures = state.failures.saturating_add(1);
                let delay = self.settings.backoff_for(state.failures);
                state.backoff = Some(delay);
                state.next_retry = Some(Instant::now() + delay);
                if let Some(idx) = state.position(sent.id) {
                    state.ops[idx].attempts += 1;
                }
                tracing::warn!(
                    record_id = sent.record_id,
                    failures = state.failures,
                    retry_in_ms = delay.as_millis() as u64,
                    %error,
                    "queued write failed, backing off"
                );
                Step::Retry(delay)
            }
            Err(error) => {
                state.remove(sent.id);
                tracing::warn!(record_id = sent.record_id, %error, "queued write rejected, discarding");
                Step::Dropped(error)
            }
        };
        if let Err(err) = self.persist(&state.ops) {
            tracing::warn!(error = %format!("{err:#}"), "failed to persist offline queue");
        }
        step
    }

    /// Drains on reconnect and on the poll interval or backoff deadline
    /// while online. Returns once `shutdown` turns true or its sender drops.
    pub async fn run(
        &self,
        network: Arc<dyn NetworkSignal>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut online = network.subscribe();
        loop {
            if *shutdown.borrow() {
                break;
            }
            if network.is_online() && self.queue_size() > 0 && self.retry_due() {
                self.process_queue().await;
            }
            let wait = self
                .next_retry_in()
                .unwrap_or(self.settings.poll_interval)
                .min(self.settings.poll_interval);

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                changed = online.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if *online.borrow_and_update() {
                        tracing::info!(pending = self.queue_size(), "back online, draining queue");
                        self.state.lock().next_retry = None;
                    }
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
        tracing::debug!("offline queue driver stopped");
    }

    fn retry_due(&self) -> bool {
        self.state
            .lock()
            .next_retry
            .map_or(true, |at| at <= Instant::now())
    }

    fn persist(&self, ops: &[PendingOperation]) -> Result<()> {
        if ops.is_empty() {
            return self.kv.remove(QUEUE_KEY).context("clearing offline queue");
        }
        let encoded = serde_json::to_string(ops).context("encoding offline queue")?;
        self.kv
            .set(QUEUE_KEY, &encoded)
            .context("writing offline queue")
    }
}

/// Decodes each element on its own so one bad entry cannot sink the rest.
fn decode_queue(raw: &str) -> (Vec<PendingOperation>, usize) {
    let elements = match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Array(elements)) => elements,
        Ok(_) => {
            tracing::warn!("persisted offline queue is not an array, discarding");
            return (Vec::new(), 1);
        }
        Err(err) => {
            tracing::warn!(%err, "persisted offline queue is unreadable, discarding");
            return (Vec::new(), 1);
        }
    };

    let mut ops: Vec<PendingOperation> = Vec::with_capacity(elements.len());
    let mut discarded = 0;
    for (idx, element) in elements.into_iter().enumerate() {
        match serde_json::from_value::<PendingOperation>(element) {
            Ok(op) => match ops.iter_mut().find(|known| known.record_id == op.record_id) {
                Some(known) => {
                    known.payload.merge(&op.payload);
                    discarded += 1;
                }
                None => ops.push(op),
            },
            Err(err) => {
                tracing::warn!(index = idx, %err, "dropping corrupted queue entry");
                discarded += 1;
            }
        }
    }
    (ops, discarded)
}

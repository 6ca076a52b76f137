use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::StoreError;
use crate::model::{EditableRecord, FieldPatch, RecordId};

pub mod conflict;
pub mod coordinator;
pub mod network;
pub mod queue;
pub mod undo;

#[cfg(test)]
pub(crate) mod testing;

pub use conflict::{ConflictDescriptor, ConflictRow, Resolution, ResolutionOutcome};
pub use coordinator::{
    CoordinatorSnapshot, EditSession, Handoff, SaveCoordinator, SaveOutcome, SaveStatus, SkipReason,
};
pub use network::{NetworkSignal, NetworkStatus};
pub use queue::{
    OfflineQueue, PendingOperation, QueueListener, QueueReason, QueueReport, QueueSettings,
};
pub use undo::{UndoManager, UndoOutcome};

/// Authoritative record source and version counter.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Applies `patch` if the record is still at `expected_version`, returning
    /// the record at its new version.
    async fn update(
        &self,
        id: RecordId,
        patch: &FieldPatch,
        expected_version: i64,
    ) -> Result<EditableRecord, StoreError>;

    async fn get(&self, id: RecordId) -> Result<EditableRecord, StoreError>;
}

/// Synchronous string key/value persistence that survives restarts.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

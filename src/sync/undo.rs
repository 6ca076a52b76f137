use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::SaveError;
use crate::model::{ChangeRecord, FieldChange};
use crate::sync::coordinator::SaveCoordinator;

#[derive(Debug, Clone)]
pub enum UndoOutcome {
    Nothing,
    /// Another undo is still replaying.
    Busy,
    Applied(ChangeRecord),
    /// Replay stopped at the first failure. `applied` lists the inverses that
    /// did reach the store; the entry is not pushed back.
    Failed {
        entry: ChangeRecord,
        applied: Vec<FieldChange>,
        error: SaveError,
    },
}

/// Bounded stack of applied changes, undone by replaying their inverses
/// through [`SaveCoordinator::instant_save`].
pub struct UndoManager {
    coordinator: Arc<SaveCoordinator>,
    entries: Mutex<VecDeque<ChangeRecord>>,
    max_entries: usize,
    busy: AtomicBool,
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl UndoManager {
    pub fn new(coordinator: Arc<SaveCoordinator>, max_entries: usize) -> Self {
        Self {
            coordinator,
            entries: Mutex::new(VecDeque::new()),
            max_entries: max_entries.max(1),
            busy: AtomicBool::new(false),
        }
    }

    pub fn record_change(&self, entry: ChangeRecord) {
        let mut entries = self.entries.lock();
        entries.push_back(entry);
        while entries.len() > self.max_entries {
            if let Some(evicted) = entries.pop_front() {
                tracing::debug!(description = evicted.description(), "undo history full, dropping oldest");
            }
        }
    }

    pub fn can_undo(&self) -> bool {
        !self.entries.lock().is_empty()
    }

    pub fn depth(&self) -> usize {
        self.entries.lock().len()
    }

    /// Description of the entry the next undo would revert.
    pub fn peek(&self) -> Option<String> {
        self.entries
            .lock()
            .back()
            .map(|entry| entry.description().to_string())
    }

    /// Entries newest first.
    pub fn history(&self) -> Vec<ChangeRecord> {
        self.entries.lock().iter().rev().cloned().collect()
    }

    pub async fn execute_undo(&self) -> UndoOutcome {
        if self
            .busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            tracing::debug!("undo already running");
            return UndoOutcome::Busy;
        }
        let _guard = BusyGuard(&self.busy);

        let top = self.entries.lock().pop_back();
        let Some(entry) = top else {
            return UndoOutcome::Nothing;
        };

        let mut applied = Vec::with_capacity(entry.changes().len());
        for change in entry.changes().iter().rev() {
            let result = self
                .coordinator
                .instant_save(
                    change.record_id,
                    change.field,
                    change.previous_value,
                    change.new_value,
                )
                .await;
            match result {
                Ok(_) => applied.push(*change),
                Err(error) => {
                    tracing::warn!(
                        description = entry.description(),
                        applied = applied.len(),
                        %error,
                        "undo stopped part way"
                    );
                    return UndoOutcome::Failed {
                        entry,
                        applied,
                        error,
                    };
                }
            }
        }

        tracing::info!(description = entry.description(), "change undone");
        UndoOutcome::Applied(entry)
    }
}

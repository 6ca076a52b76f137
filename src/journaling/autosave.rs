use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::config::AutoSaveConfig;
use crate::model::{EditableRecord, Fields, RecordId};
use crate::sync::KeyValueStore;

pub const DRAFT_KEY: &str = "triage.draft";

/// Unsaved working copy of the record being edited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftSnapshot {
    pub record_id: RecordId,
    pub fields: Fields,
    pub base_version: i64,
    #[serde(with = "time::serde::timestamp")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryNotice {
    pub record_id: RecordId,
    pub saved_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutoSaveStatus {
    Disabled,
    Inactive,
    Idle {
        record_id: RecordId,
        last_saved_at: Option<OffsetDateTime>,
    },
    Pending {
        record_id: RecordId,
        since: OffsetDateTime,
    },
    Error {
        record_id: RecordId,
        message: String,
        occurred_at: OffsetDateTime,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutoSaveEvent {
    Saved {
        record_id: RecordId,
        timestamp: OffsetDateTime,
    },
    Error {
        record_id: RecordId,
        message: String,
    },
}

#[derive(Debug, Clone)]
struct AutoSaveFailure {
    message: String,
    occurred_at: OffsetDateTime,
}

#[derive(Debug)]
struct PendingDraft {
    draft: DraftSnapshot,
    dirty_since: Instant,
}

/// Debounced single-slot draft journal kept in the key/value store.
pub struct AutoSaveRecovery {
    enabled: bool,
    debounce: Duration,
    kv: Arc<dyn KeyValueStore>,
    record_id: Option<RecordId>,
    pending: Option<PendingDraft>,
    last_saved_at: Option<OffsetDateTime>,
    last_error: Option<AutoSaveFailure>,
}

impl AutoSaveRecovery {
    pub fn new(kv: Arc<dyn KeyValueStore>, config: &AutoSaveConfig) -> Self {
        Self {
            enabled: config.enabled,
            debounce: config.debounce_duration(),
            kv,
            record_id: None,
            pending: None,
            last_saved_at: None,
            last_error: None,
        }
    }

    pub fn status(&self) -> AutoSaveStatus {
        if !self.enabled {
            return AutoSaveStatus::Disabled;
        }
        let Some(record_id) = self.record_id else {
            return AutoSaveStatus::Inactive;
        };
        if let Some(failure) = &self.last_error {
            return AutoSaveStatus::Error {
                record_id,
                message: failure.message.clone(),
                occurred_at: failure.occurred_at,
            };
        }
        if let Some(pending) = &self.pending {
            return AutoSaveStatus::Pending {
                record_id,
                since: pending.draft.timestamp,
            };
        }
        AutoSaveStatus::Idle {
            record_id,
            last_saved_at: self.last_saved_at,
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Records the latest working copy. Writes through at once when the
    /// debounce interval is zero, otherwise waits for [`poll`](Self::poll).
    pub fn observe(
        &mut self,
        record_id: RecordId,
        fields: Fields,
        base_version: i64,
    ) -> Result<Option<AutoSaveEvent>> {
        if !self.enabled {
            return Ok(None);
        }
        self.record_id = Some(record_id);
        self.pending = Some(PendingDraft {
            draft: DraftSnapshot {
                record_id,
                fields,
                base_version,
                timestamp: OffsetDateTime::now_utc(),
            },
            dirty_since: Instant::now(),
        });
        if self.debounce.is_zero() {
            return self.flush_internal(FlushKind::Immediate);
        }
        Ok(None)
    }

    pub fn poll(&mut self) -> Result<Option<AutoSaveEvent>> {
        if !self.enabled {
            return Ok(None);
        }
        self.flush_internal(FlushKind::Debounced)
    }

    pub fn flush_now(&mut self) -> Result<Option<AutoSaveEvent>> {
        self.flush_internal(FlushKind::Immediate)
    }

    /// Reports a stored draft without touching it.
    pub fn recovery_notice(&self) -> Result<Option<RecoveryNotice>> {
        Ok(self.load_draft()?.map(|draft| RecoveryNotice {
            record_id: draft.record_id,
            saved_at: draft.timestamp,
        }))
    }

    pub fn load_draft(&self) -> Result<Option<DraftSnapshot>> {
        let Some(raw) = self.kv.get(DRAFT_KEY).context("reading draft slot")? else {
            return Ok(None);
        };
        match serde_json::from_str::<DraftSnapshot>(&raw) {
            Ok(draft) => Ok(Some(draft)),
            Err(err) => {
                tracing::warn!(%err, "ignoring unreadable draft snapshot");
                Ok(None)
            }
        }
    }

    /// Drops the pending draft and empties the slot.
    pub fn clear_saved_state(&mut self) -> Result<()> {
        self.pending = None;
        self.last_error = None;
        self.record_id = None;
        self.kv.remove(DRAFT_KEY).context("clearing draft slot")
    }

    /// Clears the slot once `record` holds everything the draft carries.
    /// A draft for another record, or one with edits the write did not
    /// include, is kept. Returns whether the slot was cleared.
    pub fn clear_if_saved(&mut self, record: &EditableRecord) -> Result<bool> {
        if let Some(pending) = &self.pending {
            if pending.draft.record_id != record.id || pending.draft.fields != record.fields {
                return Ok(false);
            }
        }
        let covered = self.pending.is_some()
            || self
                .load_draft()?
                .is_some_and(|draft| draft.record_id == record.id && draft.fields == record.fields);
        if covered {
            tracing::debug!(
                record_id = record.id,
                version = record.version,
                "draft saved, clearing slot"
            );
            self.clear_saved_state()?;
        }
        Ok(covered)
    }

    fn flush_internal(&mut self, mode: FlushKind) -> Result<Option<AutoSaveEvent>> {
        let Some(pending) = self.pending.as_ref() else {
            return Ok(None);
        };
        if mode == FlushKind::Debounced && pending.dirty_since.elapsed() < self.debounce {
            return Ok(None);
        }
        let record_id = pending.draft.record_id;
        let json = serde_json::to_string(&pending.draft).context("serialising draft snapshot")?;
        let timestamp = OffsetDateTime::now_utc();
        match self.kv.set(DRAFT_KEY, &json) {
            Ok(()) => {
                self.pending = None;
                self.last_saved_at = Some(timestamp);
                self.last_error = None;
                Ok(Some(AutoSaveEvent::Saved {
                    record_id,
                    timestamp,
                }))
            }
            Err(err) => {
                let message = format!("{err:#}");
                tracing::warn!(record_id, error = %message, "draft write failed");
                self.last_error = Some(AutoSaveFailure {
                    message: message.clone(),
                    occurred_at: timestamp,
                });
                Ok(Some(AutoSaveEvent::Error { record_id, message }))
            }
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum FlushKind {
    Debounced,
    Immediate,
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::model::{Category, Urgency};
    use crate::sync::testing::{setup_storage, work_low};
    use crate::sync::MemoryKv;

    fn config(debounce_ms: u64) -> AutoSaveConfig {
        AutoSaveConfig {
            enabled: true,
            debounce_ms,
        }
    }

    struct BrokenKv;

    impl KeyValueStore for BrokenKv {
        fn get(&self, _key: &str) -> Result<Option<String>> {
            Ok(None)
        }

        fn set(&self, _key: &str, _value: &str) -> Result<()> {
            anyhow::bail!("disk full")
        }

        fn remove(&self, _key: &str) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn zero_debounce_writes_immediately() -> anyhow::Result<()> {
        let (_temp, storage) = setup_storage()?;
        let mut autosave = AutoSaveRecovery::new(Arc::new(storage.clone()), &config(0));
        assert_eq!(autosave.status(), AutoSaveStatus::Inactive);

        let mut fields = work_low();
        fields.category = Category::Financial;
        let event = autosave.observe(42, fields, 3)?;
        assert_matches!(event, Some(AutoSaveEvent::Saved { record_id: 42, .. }));
        assert_matches!(autosave.status(), AutoSaveStatus::Idle { record_id: 42, last_saved_at: Some(_) });

        // A fresh instance sees the same draft, as after a restart.
        let restarted = AutoSaveRecovery::new(Arc::new(storage), &config(0));
        let draft = restarted.load_draft()?.expect("draft stored");
        assert_eq!(draft.record_id, 42);
        assert_eq!(draft.fields, fields);
        assert_eq!(draft.base_version, 3);
        let notice = restarted.recovery_notice()?.expect("notice");
        assert_eq!(notice.saved_at, draft.timestamp);
        Ok(())
    }

    #[test]
    fn debounced_changes_coalesce_until_poll() -> anyhow::Result<()> {
        let kv = Arc::new(MemoryKv::new());
        let mut autosave = AutoSaveRecovery::new(kv.clone(), &config(20));

        let mut fields = work_low();
        autosave.observe(42, fields, 3)?;
        fields.urgency = Urgency::High;
        autosave.observe(42, fields, 3)?;
        assert_matches!(autosave.status(), AutoSaveStatus::Pending { record_id: 42, .. });
        assert_eq!(autosave.poll()?, None);
        assert_eq!(kv.get(DRAFT_KEY)?, None);

        std::thread::sleep(Duration::from_millis(40));
        assert_matches!(autosave.poll()?, Some(AutoSaveEvent::Saved { .. }));
        assert_eq!(autosave.poll()?, None);
        let draft = autosave.load_draft()?.expect("draft");
        assert_eq!(draft.fields.urgency, Urgency::High);
        Ok(())
    }

    #[test]
    fn draft_survives_until_cleared() -> anyhow::Result<()> {
        let kv = Arc::new(MemoryKv::new());
        let mut autosave = AutoSaveRecovery::new(kv.clone(), &config(500));
        autosave.observe(42, work_low(), 3)?;
        autosave.flush_now()?;

        for _ in 0..3 {
            assert!(autosave.recovery_notice()?.is_some());
        }
        autosave.clear_saved_state()?;
        assert_eq!(autosave.recovery_notice()?, None);
        assert_eq!(autosave.status(), AutoSaveStatus::Inactive);
        assert_eq!(kv.get(DRAFT_KEY)?, None);
        Ok(())
    }

    #[test]
    fn draft_is_cleared_only_by_a_matching_write() -> anyhow::Result<()> {
        let kv = Arc::new(MemoryKv::new());
        let mut autosave = AutoSaveRecovery::new(kv.clone(), &config(0));
        let mut fields = work_low();
        fields.category = Category::Spam;
        autosave.observe(42, fields, 3)?;

        let record = |id, fields, version| EditableRecord {
            id,
            fields,
            version,
            corrected_by: Some("admin".to_string()),
            corrected_at: None,
        };
        assert!(!autosave.clear_if_saved(&record(7, fields, 2))?);
        assert!(!autosave.clear_if_saved(&record(42, work_low(), 4))?);
        assert!(autosave.recovery_notice()?.is_some());

        let applied = record(42, fields, 4);
        assert!(autosave.clear_if_saved(&applied)?);
        assert_eq!(kv.get(DRAFT_KEY)?, None);
        assert!(!autosave.clear_if_saved(&applied)?);
        Ok(())
    }

    #[test]
    fn unreadable_draft_is_ignored() -> anyhow::Result<()> {
        let kv = Arc::new(MemoryKv::new());
        kv.set(DRAFT_KEY, "{\"record_id\": 42")?;
        let autosave = AutoSaveRecovery::new(kv, &config(0));
        assert_eq!(autosave.load_draft()?, None);
        Ok(())
    }

    #[test]
    fn write_failure_is_reported_and_retried() -> anyhow::Result<()> {
        let mut autosave = AutoSaveRecovery::new(Arc::new(BrokenKv), &config(0));
        let event = autosave.observe(42, work_low(), 3)?;
        assert_matches!(event, Some(AutoSaveEvent::Error { record_id: 42, message }) if message == "disk full");
        assert_matches!(autosave.status(), AutoSaveStatus::Error { record_id: 42, .. });
        assert!(autosave.has_pending(), "draft kept for the next flush");
        Ok(())
    }

    #[test]
    fn disabled_runtime_ignores_changes() -> anyhow::Result<()> {
        let kv = Arc::new(MemoryKv::new());
        let mut autosave = AutoSaveRecovery::new(
            kv.clone(),
            &AutoSaveConfig {
                enabled: false,
                debounce_ms: 0,
            },
        );
        assert_eq!(autosave.observe(42, work_low(), 3)?, None);
        assert_eq!(autosave.status(), AutoSaveStatus::Disabled);
        assert_eq!(kv.get(DRAFT_KEY)?, None);
        Ok(())
    }
}

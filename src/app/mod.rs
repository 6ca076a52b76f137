use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use strum::IntoEnumIterator;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::AppConfig;
use crate::error::SaveError;
use crate::journaling::{
    AutoSaveEvent, AutoSaveRecovery, AutoSaveStatus, DraftSnapshot, RecoveryNotice,
};
use crate::model::{
    ChangeRecord, EditableRecord, Field, FieldChange, FieldPatch, FieldValue, Fields, RecordId,
};
use crate::sync::coordinator::check_field;
use crate::sync::{
    conflict, ConflictDescriptor, EditSession, KeyValueStore, NetworkSignal, OfflineQueue,
    Handoff, PendingOperation, QueueListener, QueueReason, QueueReport, QueueSettings, RecordStore,
    Resolution, ResolutionOutcome, SaveCoordinator, SaveOutcome, SaveStatus, SkipReason,
    UndoManager, UndoOutcome,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOutcome {
    Saved(EditableRecord),
    /// The write could not reach the store and now waits in the offline queue.
    Queued(PendingOperation),
    Skipped(SkipReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstantOutcome {
    Applied(FieldChange),
    Unchanged,
    Queued(PendingOperation),
}

/// What happened to a queued write, kept until the caller collects it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueNotice {
    Applied {
        record_id: RecordId,
        version: i64,
    },
    Conflict(Box<ConflictDescriptor>),
    Dropped {
        record_id: RecordId,
        message: String,
    },
}

/// Collects queue outcomes and clears the draft once a queued write that
/// carried it is applied.
struct QueueNotices {
    notices: Mutex<Vec<QueueNotice>>,
    drafts: Arc<Mutex<AutoSaveRecovery>>,
}

impl QueueListener for QueueNotices {
    fn on_applied(&self, op: &PendingOperation, record: &EditableRecord) {
        if let Err(err) = self.drafts.lock().clear_if_saved(record) {
            tracing::warn!(
                record_id = op.record_id,
                error = %format!("{err:#}"),
                "failed to clear draft"
            );
        }
        self.notices.lock().push(QueueNotice::Applied {
            record_id: op.record_id,
            version: record.version,
        });
    }

    fn on_conflict(&self, _op: &PendingOperation, conflict: &ConflictDescriptor) {
        self.notices
            .lock()
            .push(QueueNotice::Conflict(Box::new(conflict.clone())));
    }

    fn on_dropped(&self, op: &PendingOperation, error: &SaveError) {
        self.notices.lock().push(QueueNotice::Dropped {
            record_id: op.record_id,
            message: error.to_string(),
        });
    }
}

/// Wires the coordinator, undo history, offline queue and draft journal
/// together behind the operations a UI calls.
pub struct App {
    pub config: Arc<AppConfig>,
    coordinator: Arc<SaveCoordinator>,
    undo: UndoManager,
    queue: Arc<OfflineQueue>,
    queue_notices: Arc<QueueNotices>,
    auto_save: Arc<Mutex<AutoSaveRecovery>>,
    network: Arc<dyn NetworkSignal>,
}

impl App {
    pub fn new(
        config: Arc<AppConfig>,
        store: Arc<dyn RecordStore>,
        kv: Arc<dyn KeyValueStore>,
        network: Arc<dyn NetworkSignal>,
    ) -> Result<Self> {
        let coordinator = Arc::new(SaveCoordinator::new(store));
        let undo = UndoManager::new(coordinator.clone(), config.undo.max_entries);
        let auto_save = Arc::new(Mutex::new(AutoSaveRecovery::new(
            kv.clone(),
            &config.auto_save,
        )));
        let queue_notices = Arc::new(QueueNotices {
            notices: Mutex::new(Vec::new()),
            drafts: auto_save.clone(),
        });
        let queue = OfflineQueue::load(
            coordinator.clone(),
            kv,
            QueueSettings::from(&config.offline_queue),
        )
        .context("initialising offline queue")?
        .with_listener(queue_notices.clone());
        Ok(Self {
            config,
            coordinator,
            undo,
            queue: Arc::new(queue),
            queue_notices,
            auto_save,
            network,
        })
    }

    pub fn coordinator(&self) -> &Arc<SaveCoordinator> {
        &self.coordinator
    }

    pub fn show_records<I>(&self, records: I)
    where
        I: IntoIterator<Item = EditableRecord>,
    {
        self.coordinator.refresh_displayed(records);
    }

    pub fn editing_id(&self) -> Option<RecordId> {
        self.coordinator.editing_id()
    }

    pub fn current_data(&self) -> Option<Fields> {
        self.coordinator.session().map(|session| session.current())
    }

    pub fn save_status(&self) -> SaveStatus {
        self.coordinator.save_status()
    }

    pub fn conflict_data(&self) -> Option<ConflictDescriptor> {
        self.coordinator.snapshot().conflict
    }

    pub fn start_editing(&self, record_id: RecordId) -> Result<EditSession, SaveError> {
        self.coordinator.start_edit(record_id)
    }

    pub fn update_field(&self, field: Field, value: FieldValue) -> Result<EditSession, SaveError> {
        let session = self.coordinator.update_field(field, value)?;
        let observed = self.auto_save.lock().observe(
            session.record_id(),
            session.current(),
            session.baseline().version,
        );
        if let Err(err) = observed {
            tracing::warn!(error = %format!("{err:#}"), "draft journal update failed");
        }
        Ok(session)
    }

    /// Saves the active session. While offline, or when the store is
    /// unreachable, the change is queued and the session closed. The draft
    /// stays until a write containing it is confirmed.
    pub async fn save_edit(&self) -> Result<EditOutcome, SaveError> {
        if !self.network.is_online() {
            return self.queue_session(QueueReason::Offline);
        }
        match self.coordinator.save().await {
            Ok(SaveOutcome::Saved(record)) => {
                self.journal_after_save(&record);
                Ok(EditOutcome::Saved(record))
            }
            Ok(SaveOutcome::Skipped(reason)) => Ok(EditOutcome::Skipped(reason)),
            Err(err) if err.is_queueable() => self.queue_session(QueueReason::NetworkError),
            Err(err) => Err(err),
        }
    }

    /// Saves one field without a session and records it for undo.
    pub async fn instant_save(
        &self,
        record_id: RecordId,
        field: Field,
        new_value: FieldValue,
        previous_value: FieldValue,
    ) -> Result<InstantOutcome, SaveError> {
        check_field(field, new_value)?;
        let shown = self
            .coordinator
            .displayed(record_id)
            .ok_or(SaveError::UnknownRecord(record_id))?;
        if !self.network.is_online() {
            return self.queue_write(
                record_id,
                FieldPatch::single(new_value),
                shown.version,
                QueueReason::Offline,
            );
        }
        match self
            .coordinator
            .instant_save(record_id, field, new_value, previous_value)
            .await
        {
            Ok(Some(change)) => {
                self.undo.record_change(ChangeRecord::single(change));
                Ok(InstantOutcome::Applied(change))
            }
            Ok(None) => Ok(InstantOutcome::Unchanged),
            Err(err) if err.is_queueable() => self.queue_write(
                record_id,
                FieldPatch::single(new_value),
                shown.version,
                QueueReason::NetworkError,
            ),
            Err(err) => Err(err),
        }
    }

    /// Closes the session and drops its draft.
    pub fn cancel_edit(&self) -> Result<(), SaveError> {
        self.coordinator.cancel_edit()?;
        self.discard_draft_quietly();
        Ok(())
    }

    pub async fn force_overwrite(&self) -> Result<EditableRecord, SaveError> {
        let record = self.coordinator.force_overwrite().await?;
        self.discard_draft_quietly();
        Ok(record)
    }

    pub fn accept_server_version(&self) -> Result<EditableRecord, SaveError> {
        let record = self.coordinator.accept_server_version()?;
        self.discard_draft_quietly();
        Ok(record)
    }

    pub async fn resolve_conflict(
        &self,
        resolution: Resolution,
    ) -> Result<ResolutionOutcome, SaveError> {
        let outcome = conflict::resolve(&self.coordinator, resolution).await?;
        if !matches!(outcome, ResolutionOutcome::ManualReview(_)) {
            self.discard_draft_quietly();
        }
        Ok(outcome)
    }

    pub fn can_undo(&self) -> bool {
        self.undo.can_undo()
    }

    pub fn undo_description(&self) -> Option<String> {
        self.undo.peek()
    }

    pub async fn execute_undo(&self) -> UndoOutcome {
        self.undo.execute_undo().await
    }

    pub fn queue_size(&self) -> usize {
        self.queue.queue_size()
    }

    pub fn is_processing(&self) -> bool {
        self.queue.is_processing()
    }

    pub fn pending_operations(&self) -> Vec<PendingOperation> {
        self.queue.pending()
    }

    pub fn enqueue(
        &self,
        record_id: RecordId,
        payload: FieldPatch,
        expected_version: i64,
        reason: QueueReason,
    ) -> Result<PendingOperation> {
        self.queue
            .enqueue(record_id, payload, expected_version, reason)
    }

    pub async fn process_queue(&self) -> Option<QueueReport> {
        self.queue.process_queue().await
    }

    pub fn take_queue_notices(&self) -> Vec<QueueNotice> {
        std::mem::take(&mut *self.queue_notices.notices.lock())
    }

    /// Starts the background queue driver. It stops when `shutdown` turns
    /// true.
    pub fn spawn_queue_driver(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let network = self.network.clone();
        tokio::spawn(async move { queue.run(network, shutdown).await })
    }

    pub fn recovery_notice(&self) -> Result<Option<RecoveryNotice>> {
        self.auto_save.lock().recovery_notice()
    }

    pub fn load_draft(&self) -> Result<Option<DraftSnapshot>> {
        self.auto_save.lock().load_draft()
    }

    /// Reopens the stored draft as the active session. The draft stays in
    /// its slot until the edit is saved, resolved or discarded.
    pub fn recover_draft(&self) -> Result<Option<EditSession>> {
        let Some(draft) = self.auto_save.lock().load_draft()? else {
            return Ok(None);
        };
        let session = self
            .coordinator
            .resume(draft.record_id, draft.base_version, draft.fields)
            .with_context(|| format!("restoring draft for record {}", draft.record_id))?;
        tracing::info!(
            record_id = draft.record_id,
            base_version = draft.base_version,
            "draft recovered"
        );
        Ok(Some(session))
    }

    pub fn discard_draft(&self) -> Result<()> {
        self.auto_save.lock().clear_saved_state()
    }

    pub fn poll_autosave(&self) -> Result<Option<AutoSaveEvent>> {
        self.auto_save.lock().poll()
    }

    pub fn autosave_status(&self) -> AutoSaveStatus {
        self.auto_save.lock().status()
    }

    fn queue_session(&self, reason: QueueReason) -> Result<EditOutcome, SaveError> {
        let session = match self.coordinator.detach_for_queue()? {
            Handoff::Taken(session) => session,
            Handoff::Skipped(skip) => return Ok(EditOutcome::Skipped(skip)),
        };
        let baseline = session.baseline();
        let payload = session.current().changes_from(&baseline.fields);
        let op = match self
            .queue
            .enqueue(session.record_id(), payload, baseline.version, reason)
        {
            Ok(op) => op,
            Err(err) => {
                self.coordinator.reattach(session);
                return Err(SaveError::Server(format!("{err:#}")));
            }
        };
        // Kept until the queued write lands.
        let mut drafts = self.auto_save.lock();
        if drafts.has_pending() {
            if let Err(err) = drafts.flush_now() {
                tracing::warn!(error = %format!("{err:#}"), "draft flush before queueing failed");
            }
        }
        Ok(EditOutcome::Queued(op))
    }

    /// Clears the draft after a save unless the session picked up newer
    /// edits while the write was in flight.
    fn journal_after_save(&self, record: &EditableRecord) {
        match self.coordinator.session() {
            Some(session) if session.record_id() == record.id && session.is_dirty() => {
                let observed = self.auto_save.lock().observe(
                    session.record_id(),
                    session.current(),
                    session.baseline().version,
                );
                if let Err(err) = observed {
                    tracing::warn!(error = %format!("{err:#}"), "draft journal update failed");
                }
            }
            _ => self.discard_draft_quietly(),
        }
    }

    fn queue_write(
        &self,
        record_id: RecordId,
        payload: FieldPatch,
        expected_version: i64,
        reason: QueueReason,
    ) -> Result<InstantOutcome, SaveError> {
        self.queue
            .enqueue(record_id, payload, expected_version, reason)
            .map(InstantOutcome::Queued)
            .map_err(|err| SaveError::Server(format!("{err:#}")))
    }

    fn discard_draft_quietly(&self) {
        if let Err(err) = self.auto_save.lock().clear_saved_state() {
            tracing::warn!(error = %format!("{err:#}"), "failed to clear draft");
        }
    }
}

/// Field values of `fields` in display order.
pub fn field_values(fields: &Fields) -> Vec<(Field, FieldValue)> {
    Field::iter().map(|field| (field, fields.get(field))).collect()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    use super::*;
    use crate::model::{Action, Category, Urgency};
    use crate::storage::StorageHandle;
    use crate::sync::testing::{setup_storage, work_low, FlakyStore, RECORD_ID};
    use crate::sync::NetworkStatus;

    struct Harness {
        _temp: TempDir,
        storage: StorageHandle,
        store: Arc<FlakyStore>,
        network: Arc<NetworkStatus>,
        app: App,
    }

    fn config() -> Arc<AppConfig> {
        let mut config = AppConfig::default();
        config.auto_save.debounce_ms = 0;
        Arc::new(config)
    }

    fn harness() -> anyhow::Result<Harness> {
        let (temp, storage) = setup_storage()?;
        storage.insert_record(RECORD_ID, work_low(), 3)?;
        let store = Arc::new(FlakyStore::new(storage.clone()));
        let network = Arc::new(NetworkStatus::new(true));
        let app = App::new(
            config(),
            store.clone(),
            Arc::new(storage.clone()),
            network.clone(),
        )?;
        app.show_records(storage.fetch_records(100)?);
        Ok(Harness {
            _temp: temp,
            storage,
            store,
            network,
            app,
        })
    }

    /// A second app over the same database, as after a restart.
    fn restart(h: &Harness) -> anyhow::Result<App> {
        let app = App::new(
            config(),
            h.store.clone(),
            Arc::new(h.storage.clone()),
            h.network.clone(),
        )?;
        app.show_records(h.storage.fetch_records(100)?);
        Ok(app)
    }

    #[tokio::test]
    async fn edit_and_save_clears_draft() -> anyhow::Result<()> {
        let h = harness()?;
        h.app.start_editing(RECORD_ID)?;
        h.app
            .update_field(Field::Category, Category::Financial.into())?;
        assert!(h.app.recovery_notice()?.is_some());

        let outcome = h.app.save_edit().await?;
        let record = assert_matches!(outcome, EditOutcome::Saved(record) => record);
        assert_eq!(record.version, 4);
        assert_eq!(h.app.save_status(), SaveStatus::Idle);
        assert_eq!(h.app.recovery_notice()?, None);
        Ok(())
    }

    #[tokio::test]
    async fn offline_save_during_inflight_save_is_skipped() -> anyhow::Result<()> {
        let h = harness()?;
        h.app.start_editing(RECORD_ID)?;
        h.app
            .update_field(Field::Category, Category::Financial.into())?;

        let (first, second) = tokio::join!(h.app.save_edit(), async {
            h.network.set_online(false);
            h.app.save_edit().await
        });
        let record = assert_matches!(first, Ok(EditOutcome::Saved(record)) => record);
        assert_eq!(record.version, 4);
        assert_matches!(second, Ok(EditOutcome::Skipped(SkipReason::AlreadySaving)));
        assert_eq!(h.app.queue_size(), 0);
        assert_eq!(h.store.update_calls(), 1);
        assert_eq!(h.app.editing_id(), Some(RECORD_ID));
        assert_eq!(h.app.recovery_notice()?, None);
        Ok(())
    }

    #[tokio::test]
    async fn edits_made_during_save_stay_in_the_draft() -> anyhow::Result<()> {
        let h = harness()?;
        h.app.start_editing(RECORD_ID)?;
        h.app
            .update_field(Field::Category, Category::Financial.into())?;

        let (saved, updated) = tokio::join!(h.app.save_edit(), async {
            h.app.update_field(Field::Urgency, Urgency::Critical.into())
        });
        assert_matches!(saved, Ok(EditOutcome::Saved(record)) if record.version == 4);
        updated?;
        assert_eq!(h.app.save_status(), SaveStatus::Editing);

        let draft = h.app.load_draft()?.expect("newer edits journaled");
        assert_eq!(draft.fields.category, Category::Financial);
        assert_eq!(draft.fields.urgency, Urgency::Critical);
        assert_eq!(draft.base_version, 4);
        Ok(())
    }

    #[tokio::test]
    async fn queued_session_keeps_draft_until_applied() -> anyhow::Result<()> {
        let h = harness()?;
        h.app.start_editing(RECORD_ID)?;
        h.app
            .update_field(Field::Category, Category::Financial.into())?;
        h.network.set_online(false);

        let op = assert_matches!(h.app.save_edit().await?, EditOutcome::Queued(op) => op);
        assert_eq!(op.reason, QueueReason::Offline);
        assert_eq!(h.app.editing_id(), None);
        let notice = h.app.recovery_notice()?.expect("draft kept while queued");
        assert_eq!(notice.record_id, RECORD_ID);

        h.network.set_online(true);
        let report = h.app.process_queue().await.expect("report");
        assert_eq!(report.applied, 1);
        assert_eq!(h.app.recovery_notice()?, None);
        Ok(())
    }

    #[tokio::test]
    async fn conflicting_queued_session_leaves_draft_to_recover() -> anyhow::Result<()> {
        let h = harness()?;
        h.app.start_editing(RECORD_ID)?;
        h.app.update_field(Field::Action, Action::Archive.into())?;
        h.network.set_online(false);
        assert_matches!(h.app.save_edit().await?, EditOutcome::Queued(_));

        h.storage
            .update_blocking(RECORD_ID, &FieldPatch::single(Urgency::Medium.into()), 3)?;
        h.network.set_online(true);
        let report = h.app.process_queue().await.expect("report");
        assert_eq!(report.conflicts, 1);
        assert_eq!(h.app.queue_size(), 0);

        let session = h.app.recover_draft()?.expect("draft survives the conflict");
        assert_eq!(session.current().action, Action::Archive);
        let err = h.app.save_edit().await.unwrap_err();
        assert!(err.conflict().is_some());
        Ok(())
    }

    #[tokio::test]
    async fn draft_is_recovered_after_restart() -> anyhow::Result<()> {
        let h = harness()?;
        h.app.start_editing(RECORD_ID)?;
        h.app.update_field(Field::Urgency, Urgency::Critical.into())?;

        let app = restart(&h)?;
        let notice = app.recovery_notice()?.expect("draft notice");
        assert_eq!(notice.record_id, RECORD_ID);
        assert_eq!(app.editing_id(), None, "notice alone opens nothing");

        let session = app.recover_draft()?.expect("session");
        assert!(session.is_dirty());
        assert_eq!(app.current_data().map(|f| f.urgency), Some(Urgency::Critical));

        assert_matches!(app.save_edit().await?, EditOutcome::Saved(_));
        assert_eq!(h.storage.fetch_record(RECORD_ID)?.map(|r| r.fields.urgency), Some(Urgency::Critical));
        Ok(())
    }

    #[tokio::test]
    async fn offline_instant_save_is_queued_without_network_call() -> anyhow::Result<()> {
        let h = harness()?;
        h.network.set_online(false);
        let outcome = h
            .app
            .instant_save(RECORD_ID, Field::Urgency, Urgency::High.into(), Urgency::Low.into())
            .await?;
        let op = assert_matches!(outcome, InstantOutcome::Queued(op) => op);
        assert_eq!(op.reason, QueueReason::Offline);
        assert_eq!(op.expected_version, 3);
        assert_eq!(h.app.queue_size(), 1);
        assert_eq!(h.store.update_calls(), 0);

        h.network.set_online(true);
        let report = h.app.process_queue().await.expect("report");
        assert_eq!(report.applied, 1);
        assert_eq!(h.app.queue_size(), 0);
        assert_eq!(
            h.app.take_queue_notices(),
            vec![QueueNotice::Applied {
                record_id: RECORD_ID,
                version: 4
            }]
        );
        Ok(())
    }

    #[tokio::test]
    async fn transport_failure_queues_session_change() -> anyhow::Result<()> {
        let h = harness()?;
        h.app.start_editing(RECORD_ID)?;
        h.app.update_field(Field::Category, Category::Social.into())?;
        h.store.go_offline();

        let outcome = h.app.save_edit().await?;
        let op = assert_matches!(outcome, EditOutcome::Queued(op) => op);
        assert_eq!(op.reason, QueueReason::NetworkError);
        assert_eq!(op.payload, FieldPatch::single(Category::Social.into()));
        assert_eq!(h.app.editing_id(), None);
        assert_eq!(h.store.update_calls(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn instant_save_feeds_undo_history() -> anyhow::Result<()> {
        let h = harness()?;
        let outcome = h
            .app
            .instant_save(RECORD_ID, Field::Urgency, Urgency::High.into(), Urgency::Low.into())
            .await?;
        assert_matches!(outcome, InstantOutcome::Applied(_));
        assert!(h.app.can_undo());
        assert_eq!(h.app.undo_description().as_deref(), Some("#42 urgency: LOW -> HIGH"));

        assert_matches!(h.app.execute_undo().await, UndoOutcome::Applied(_));
        assert!(!h.app.can_undo());
        let stored = h.storage.fetch_record(RECORD_ID)?.expect("record");
        assert_eq!(stored.fields.urgency, Urgency::Low);
        assert_eq!(stored.version, 5);
        Ok(())
    }

    #[tokio::test]
    async fn server_error_is_not_queued() -> anyhow::Result<()> {
        let h = harness()?;
        h.store.fail_with_server("row level security violation");
        let err = h
            .app
            .instant_save(RECORD_ID, Field::Urgency, Urgency::High.into(), Urgency::Low.into())
            .await
            .unwrap_err();
        assert_matches!(err, SaveError::Server(_));
        assert_eq!(h.app.queue_size(), 0);
        assert!(!h.app.can_undo());
        Ok(())
    }

    #[tokio::test]
    async fn conflict_resolution_clears_draft() -> anyhow::Result<()> {
        let h = harness()?;
        h.app.start_editing(RECORD_ID)?;
        h.app.update_field(Field::Category, Category::Spam.into())?;
        h.storage
            .update_blocking(RECORD_ID, &FieldPatch::single(Urgency::Medium.into()), 3)?;

        let err = h.app.save_edit().await.unwrap_err();
        assert!(err.conflict().is_some());
        assert_eq!(h.app.save_status(), SaveStatus::Conflict);
        assert!(h.app.conflict_data().is_some());

        let review = h.app.resolve_conflict(Resolution::Merge).await?;
        let rows = assert_matches!(review, ResolutionOutcome::ManualReview(rows) => rows);
        assert_eq!(rows.len(), 2);
        assert!(h.app.recovery_notice()?.is_some(), "review keeps the draft");

        let saved = h.app.resolve_conflict(Resolution::KeepMine).await?;
        let record = assert_matches!(saved, ResolutionOutcome::Saved(record) => record);
        assert_eq!(record.version, 5);
        assert_eq!(record.fields.category, Category::Spam);
        assert_eq!(h.app.recovery_notice()?, None);
        assert_eq!(h.app.conflict_data(), None);
        Ok(())
    }

    #[tokio::test]
    async fn stale_queued_write_surfaces_conflict_notice() -> anyhow::Result<()> {
        let h = harness()?;
        h.app.enqueue(
            RECORD_ID,
            FieldPatch::single(Category::Spam.into()),
            2,
            QueueReason::Offline,
        )?;
        let report = h.app.process_queue().await.expect("report");
        assert_eq!(report.conflicts, 1);
        let notices = h.app.take_queue_notices();
        let conflict = assert_matches!(notices.as_slice(), [QueueNotice::Conflict(conflict)] => conflict);
        assert_eq!(conflict.server.version, 3);
        assert!(h.app.take_queue_notices().is_empty());
        Ok(())
    }

    #[test]
    fn field_values_follow_field_order() {
        let values = field_values(&work_low());
        let fields: Vec<Field> = values.iter().map(|(field, _)| *field).collect();
        assert_eq!(fields, vec![Field::Category, Field::Urgency, Field::Action]);
    }
}

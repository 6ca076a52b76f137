use std::collections::HashSet;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::error::{SaveError, StoreError};
use crate::model::{
    EditableRecord, Field, FieldChange, FieldPatch, FieldValue, Fields, RecordId, VersionedFields,
};
use crate::sync::conflict::ConflictDescriptor;
use crate::sync::RecordStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveStatus {
    Idle,
    Editing,
    Saving,
    Conflict,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved(EditableRecord),
    Skipped(SkipReason),
}

/// Result of taking the active session off the coordinator for queueing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handoff {
    Taken(EditSession),
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoSession,
    NotDirty,
    AlreadySaving,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditSession {
    generation: u64,
    record_id: RecordId,
    baseline: VersionedFields,
    current: Fields,
    status: SaveStatus,
    conflict: Option<ConflictDescriptor>,
    last_error: Option<String>,
}

impl EditSession {
    fn new(generation: u64, record: &EditableRecord) -> Self {
        Self {
            generation,
            record_id: record.id,
            baseline: VersionedFields::from(record),
            current: record.fields,
            status: SaveStatus::Editing,
            conflict: None,
            last_error: None,
        }
    }

    pub fn record_id(&self) -> RecordId {
        self.record_id
    }

    pub fn baseline(&self) -> VersionedFields {
        self.baseline
    }

    pub fn current(&self) -> Fields {
        self.current
    }

    pub fn status(&self) -> SaveStatus {
        self.status
    }

    pub fn is_dirty(&self) -> bool {
        self.current != self.baseline.fields
    }

    pub fn conflict(&self) -> Option<&ConflictDescriptor> {
        self.conflict.as_ref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}

/// Read-only view of the coordinator for rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorSnapshot {
    pub editing_id: Option<RecordId>,
    pub current: Option<Fields>,
    pub status: SaveStatus,
    pub dirty: bool,
    pub conflict: Option<ConflictDescriptor>,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct CoordinatorState {
    displayed: IndexMap<RecordId, EditableRecord>,
    session: Option<EditSession>,
    in_flight: HashSet<RecordId>,
    generation: u64,
}

impl CoordinatorState {
    /// Drops a session whose record left the displayed set. In-flight saves
    /// are left to finish.
    fn close_hidden_session(&mut self) -> Option<RecordId> {
        let hidden = self
            .session
            .as_ref()
            .filter(|session| {
                session.status != SaveStatus::Saving
                    && !self.displayed.contains_key(&session.record_id)
            })
            .map(|session| session.record_id);
        if let Some(record_id) = hidden {
            tracing::debug!(record_id, "closing edit session for hidden record");
            self.session = None;
        }
        hidden
    }

    fn active_session(&mut self) -> Result<&mut EditSession, SaveError> {
        if let Some(record_id) = self.close_hidden_session() {
            return Err(SaveError::SessionClosed(record_id));
        }
        self.session.as_mut().ok_or(SaveError::NoSession)
    }

    fn open_session(&mut self, record: &EditableRecord) -> &mut EditSession {
        self.generation += 1;
        self.session.insert(EditSession::new(self.generation, record))
    }

    fn session_for(&mut self, generation: u64) -> Option<&mut EditSession> {
        self.session
            .as_mut()
            .filter(|session| session.generation == generation)
    }

    /// Updates the displayed copy if the record is still shown and not newer.
    fn refresh_record(&mut self, record: &EditableRecord) {
        if let Some(slot) = self.displayed.get_mut(&record.id) {
            if slot.version <= record.version {
                *slot = record.clone();
            }
        }
    }

    /// Moves an untouched session onto a version written by another path.
    fn rebase_clean_session(&mut self, record: &EditableRecord) {
        if let Some(session) = self.session.as_mut() {
            if session.record_id == record.id
                && session.status != SaveStatus::Saving
                && session.conflict.is_none()
                && !session.is_dirty()
            {
                session.baseline = VersionedFields::from(record);
                session.current = record.fields;
            }
        }
    }
}

enum SubmitError {
    Conflict(EditableRecord),
    Failed(SaveError),
}

/// Owns the active edit session and performs optimistic-locked saves.
pub struct SaveCoordinator {
    store: Arc<dyn RecordStore>,
    state: Mutex<CoordinatorState>,
}

impl SaveCoordinator {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            state: Mutex::new(CoordinatorState::default()),
        }
    }

    /// Replaces the displayed record set.
    pub fn refresh_displayed<I>(&self, records: I)
    where
        I: IntoIterator<Item = EditableRecord>,
    {
        let mut guard = self.state.lock();
        guard.displayed = records
            .into_iter()
            .map(|record| (record.id, record))
            .collect();
    }

    /// Adds or replaces a single displayed record.
    pub fn display(&self, record: EditableRecord) {
        self.state.lock().displayed.insert(record.id, record);
    }

    pub fn displayed(&self, record_id: RecordId) -> Option<EditableRecord> {
        self.state.lock().displayed.get(&record_id).cloned()
    }

    pub fn session(&self) -> Option<EditSession> {
        self.state.lock().session.clone()
    }

    pub fn editing_id(&self) -> Option<RecordId> {
        self.state.lock().session.as_ref().map(EditSession::record_id)
    }

    pub fn save_status(&self) -> SaveStatus {
        self.state
            .lock()
            .session
            .as_ref()
            .map_or(SaveStatus::Idle, EditSession::status)
    }

    pub fn is_dirty(&self) -> bool {
        self.state
            .lock()
            .session
            .as_ref()
            .is_some_and(EditSession::is_dirty)
    }

    pub fn snapshot(&self) -> CoordinatorSnapshot {
        let guard = self.state.lock();
        match guard.session.as_ref() {
            Some(session) => CoordinatorSnapshot {
                editing_id: Some(session.record_id),
                current: Some(session.current),
                status: session.status,
                dirty: session.is_dirty(),
                conflict: session.conflict.clone(),
                last_error: session.last_error.clone(),
            },
            None => CoordinatorSnapshot {
                editing_id: None,
                current: None,
                status: SaveStatus::Idle,
                dirty: false,
                conflict: None,
                last_error: None,
            },
        }
    }

    pub fn start_edit(&self, record_id: RecordId) -> Result<EditSession, SaveError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.close_hidden_session();
        if let Some(session) = state.session.as_ref() {
            if session.record_id == record_id {
                return Ok(session.clone());
            }
            tracing::debug!(
                closed = session.record_id,
                opened = record_id,
                "switching edit session"
            );
        }
        let record = state
            .displayed
            .get(&record_id)
            .cloned()
            .ok_or(SaveError::UnknownRecord(record_id))?;
        Ok(state.open_session(&record).clone())
    }

    /// Reopens a session from a recovered working copy. The baseline keeps
    /// `base_version`, so saving conflicts if the record moved on since.
    pub fn resume(
        &self,
        record_id: RecordId,
        base_version: i64,
        current: Fields,
    ) -> Result<EditSession, SaveError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.close_hidden_session();
        if let Some(session) = state.session.as_ref() {
            if session.status == SaveStatus::Saving {
                return Err(SaveError::Busy(session.record_id));
            }
        }
        let shown = state
            .displayed
            .get(&record_id)
            .cloned()
            .ok_or(SaveError::UnknownRecord(record_id))?;
        if shown.version != base_version {
            tracing::warn!(
                record_id,
                base_version,
                shown = shown.version,
                "recovered draft predates the displayed record"
            );
        }
        let session = state.open_session(&shown);
        session.baseline.version = base_version;
        session.current = current;
        Ok(session.clone())
    }

    pub fn update_field(&self, field: Field, value: FieldValue) -> Result<EditSession, SaveError> {
        check_field(field, value)?;
        let mut guard = self.state.lock();
        let session = guard.active_session()?;
        session.current.set(value);
        match session.status {
            SaveStatus::Saving | SaveStatus::Conflict => {}
            SaveStatus::Idle | SaveStatus::Editing | SaveStatus::Error => {
                session.status = SaveStatus::Editing;
                if session.conflict.is_none() {
                    session.last_error = None;
                }
            }
        }
        Ok(session.clone())
    }

    pub fn update_field_str(&self, field: Field, raw: &str) -> Result<EditSession, SaveError> {
        let value = FieldValue::parse(field, raw)
            .map_err(|message| SaveError::Validation { field, message })?;
        self.update_field(field, value)
    }

    /// Updates a field, opening a session on `record_id` first if needed.
    pub fn edit_field(
        &self,
        record_id: RecordId,
        field: Field,
        value: FieldValue,
    ) -> Result<EditSession, SaveError> {
        check_field(field, value)?;
        self.start_edit(record_id)?;
        self.update_field(field, value)
    }

    pub async fn save(&self) -> Result<SaveOutcome, SaveError> {
        let (generation, record_id, baseline, current) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if let Some(record_id) = state.close_hidden_session() {
                return Err(SaveError::SessionClosed(record_id));
            }
            let Some(session) = state.session.as_mut() else {
                return Ok(SaveOutcome::Skipped(SkipReason::NoSession));
            };
            if session.status == SaveStatus::Saving || state.in_flight.contains(&session.record_id)
            {
                tracing::debug!(record_id = session.record_id, "save already in flight");
                return Ok(SaveOutcome::Skipped(SkipReason::AlreadySaving));
            }
            if session.status == SaveStatus::Conflict {
                return Err(SaveError::InvalidState(
                    "resolve the pending conflict before saving",
                ));
            }
            if !session.is_dirty() {
                return Ok(SaveOutcome::Skipped(SkipReason::NotDirty));
            }
            session.status = SaveStatus::Saving;
            state.in_flight.insert(session.record_id);
            (
                session.generation,
                session.record_id,
                session.baseline,
                session.current,
            )
        };

        let patch = current.changes_from(&baseline.fields);
        let result = self.submit(record_id, &patch, baseline.version).await;

        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.in_flight.remove(&record_id);
        match result {
            Ok(record) => {
                state.refresh_record(&record);
                if let Some(session) = state.session_for(generation) {
                    session.baseline = VersionedFields::from(&record);
                    session.status = if session.is_dirty() {
                        SaveStatus::Editing
                    } else {
                        SaveStatus::Idle
                    };
                    session.last_error = None;
                }
                tracing::info!(record_id, version = record.version, "record saved");
                Ok(SaveOutcome::Saved(record))
            }
            Err(SubmitError::Conflict(server)) => {
                let descriptor = ConflictDescriptor {
                    record_id,
                    baseline,
                    server,
                    mine: current,
                };
                if let Some(session) = state.session_for(generation) {
                    session.status = SaveStatus::Conflict;
                    session.conflict = Some(descriptor.clone());
                }
                tracing::info!(
                    record_id,
                    expected = baseline.version,
                    server = descriptor.server.version,
                    "save rejected by version check"
                );
                Err(SaveError::Conflict(Box::new(descriptor)))
            }
            Err(SubmitError::Failed(error)) => {
                if let Some(session) = state.session_for(generation) {
                    session.status = SaveStatus::Error;
                    session.last_error = Some(error.to_string());
                }
                tracing::warn!(record_id, %error, "save failed");
                Err(error)
            }
        }
    }

    /// Saves one field of a displayed record without an edit session.
    ///
    /// Returns the applied change so the caller can record it for undo, or
    /// `None` when the record already holds `new_value`.
    pub async fn instant_save(
        &self,
        record_id: RecordId,
        field: Field,
        new_value: FieldValue,
        previous_value: FieldValue,
    ) -> Result<Option<FieldChange>, SaveError> {
        check_field(field, new_value)?;
        check_field(field, previous_value)?;
        let shown = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let shown = state
                .displayed
                .get(&record_id)
                .cloned()
                .ok_or(SaveError::UnknownRecord(record_id))?;
            if state.in_flight.contains(&record_id) {
                return Err(SaveError::Busy(record_id));
            }
            if shown.fields.get(field) == new_value {
                return Ok(None);
            }
            state.in_flight.insert(record_id);
            shown
        };

        let patch = FieldPatch::single(new_value);
        let result = self.submit(record_id, &patch, shown.version).await;

        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.in_flight.remove(&record_id);
        match result {
            Ok(record) => {
                state.refresh_record(&record);
                state.rebase_clean_session(&record);
                tracing::info!(record_id, %field, version = record.version, "field saved");
                Ok(Some(FieldChange {
                    record_id,
                    field,
                    previous_value,
                    new_value,
                }))
            }
            Err(SubmitError::Conflict(server)) => {
                let descriptor = ConflictDescriptor {
                    record_id,
                    baseline: VersionedFields::from(&shown),
                    server,
                    mine: shown.fields.with(&patch),
                };
                let attach = match state.session.as_ref() {
                    None => true,
                    Some(session) => {
                        session.record_id == record_id
                            && session.status != SaveStatus::Saving
                            && !session.is_dirty()
                    }
                };
                if attach {
                    let session = state.open_session(&shown);
                    session.current = descriptor.mine;
                    session.status = SaveStatus::Conflict;
                    session.conflict = Some(descriptor.clone());
                }
                tracing::info!(
                    record_id,
                    %field,
                    server = descriptor.server.version,
                    "instant save rejected by version check"
                );
                Err(SaveError::Conflict(Box::new(descriptor)))
            }
            Err(SubmitError::Failed(error)) => {
                tracing::warn!(record_id, %field, %error, "instant save failed");
                Err(error)
            }
        }
    }

    pub fn cancel_edit(&self) -> Result<(), SaveError> {
        let mut guard = self.state.lock();
        match guard.session.as_ref() {
            None => Ok(()),
            Some(session) if session.status == SaveStatus::Saving => Err(
                SaveError::InvalidState("cannot cancel while a save is in flight"),
            ),
            Some(session) => {
                tracing::debug!(record_id = session.record_id, "edit cancelled");
                guard.session = None;
                Ok(())
            }
        }
    }

    /// Closes the active session so its change can wait in the offline
    /// queue. Applies the same guards as [`save`](Self::save) under one lock,
    /// so a session with a save in flight is never taken.
    pub fn detach_for_queue(&self) -> Result<Handoff, SaveError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let Some(record_id) = state.close_hidden_session() {
            return Err(SaveError::SessionClosed(record_id));
        }
        let Some(session) = state.session.as_ref() else {
            return Ok(Handoff::Skipped(SkipReason::NoSession));
        };
        if session.status == SaveStatus::Saving || state.in_flight.contains(&session.record_id) {
            tracing::debug!(
                record_id = session.record_id,
                "save already in flight, not queueing"
            );
            return Ok(Handoff::Skipped(SkipReason::AlreadySaving));
        }
        if session.status == SaveStatus::Conflict {
            return Err(SaveError::InvalidState(
                "resolve the pending conflict before saving",
            ));
        }
        if !session.is_dirty() {
            return Ok(Handoff::Skipped(SkipReason::NotDirty));
        }
        Ok(state
            .session
            .take()
            .map_or(Handoff::Skipped(SkipReason::NoSession), Handoff::Taken))
    }

    /// Puts back a session taken by [`detach_for_queue`](Self::detach_for_queue).
    /// A session opened in the meantime is kept instead.
    pub fn reattach(&self, session: EditSession) {
        let mut guard = self.state.lock();
        if guard.session.is_none() {
            guard.session = Some(session);
        }
    }

    /// "Keep mine": resubmits the working copy against the server version
    /// captured with the conflict.
    pub async fn force_overwrite(&self) -> Result<EditableRecord, SaveError> {
        let (generation, record_id, original_baseline, current, server) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let session = state.active_session()?;
            if session.status == SaveStatus::Saving {
                return Err(SaveError::Busy(session.record_id));
            }
            let Some(conflict) = session.conflict.clone() else {
                return Err(SaveError::InvalidState("no conflict to resolve"));
            };
            let record_id = session.record_id;
            if session.current == conflict.server.fields {
                session.baseline = VersionedFields::from(&conflict.server);
                session.status = SaveStatus::Idle;
                session.conflict = None;
                session.last_error = None;
                state.refresh_record(&conflict.server);
                return Ok(conflict.server);
            }
            session.status = SaveStatus::Saving;
            let captured = (
                session.generation,
                record_id,
                conflict.baseline,
                session.current,
                conflict.server,
            );
            state.in_flight.insert(record_id);
            captured
        };

        let patch = current.changes_from(&server.fields);
        let result = self.submit(record_id, &patch, server.version).await;

        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.in_flight.remove(&record_id);
        match result {
            Ok(record) => {
                state.refresh_record(&record);
                if let Some(session) = state.session_for(generation) {
                    session.baseline = VersionedFields::from(&record);
                    session.conflict = None;
                    session.last_error = None;
                    session.status = if session.is_dirty() {
                        SaveStatus::Editing
                    } else {
                        SaveStatus::Idle
                    };
                }
                tracing::info!(record_id, version = record.version, "conflict resolved by overwrite");
                Ok(record)
            }
            Err(SubmitError::Conflict(server)) => {
                let descriptor = ConflictDescriptor {
                    record_id,
                    baseline: original_baseline,
                    server,
                    mine: current,
                };
                if let Some(session) = state.session_for(generation) {
                    session.status = SaveStatus::Conflict;
                    session.conflict = Some(descriptor.clone());
                }
                tracing::info!(record_id, "server moved again during overwrite");
                Err(SaveError::Conflict(Box::new(descriptor)))
            }
            Err(SubmitError::Failed(error)) => {
                if let Some(session) = state.session_for(generation) {
                    session.status = SaveStatus::Error;
                    session.last_error = Some(error.to_string());
                }
                tracing::warn!(record_id, %error, "overwrite failed");
                Err(error)
            }
        }
    }

    /// "Use server": discards the working copy and adopts the server record.
    pub fn accept_server_version(&self) -> Result<EditableRecord, SaveError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let session = state.active_session()?;
        if session.status == SaveStatus::Saving {
            return Err(SaveError::Busy(session.record_id));
        }
        let Some(conflict) = session.conflict.take() else {
            return Err(SaveError::InvalidState("no conflict to resolve"));
        };
        session.baseline = VersionedFields::from(&conflict.server);
        session.current = conflict.server.fields;
        session.status = SaveStatus::Idle;
        session.last_error = None;
        state.refresh_record(&conflict.server);
        tracing::info!(
            record_id = conflict.record_id,
            version = conflict.server.version,
            "adopted server version"
        );
        Ok(conflict.server)
    }

    /// Version-checked write of a queued payload. Shares the per-record
    /// in-flight guard with interactive saves.
    pub async fn replay(
        &self,
        record_id: RecordId,
        payload: &FieldPatch,
        expected_version: i64,
    ) -> Result<EditableRecord, SaveError> {
        let baseline_fields = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.in_flight.contains(&record_id) {
                return Err(SaveError::Busy(record_id));
            }
            state.in_flight.insert(record_id);
            state
                .displayed
                .get(&record_id)
                .filter(|record| record.version == expected_version)
                .map(|record| record.fields)
        };

        let result = self.submit(record_id, payload, expected_version).await;

        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.in_flight.remove(&record_id);
        match result {
            Ok(record) => {
                state.refresh_record(&record);
                state.rebase_clean_session(&record);
                Ok(record)
            }
            Err(SubmitError::Conflict(server)) => {
                let fields = baseline_fields.unwrap_or(server.fields);
                Err(SaveError::Conflict(Box::new(ConflictDescriptor {
                    record_id,
                    baseline: VersionedFields {
                        version: expected_version,
                        fields,
                    },
                    mine: fields.with(payload),
                    server,
                })))
            }
            Err(SubmitError::Failed(error)) => Err(error),
        }
    }

    async fn submit(
        &self,
        record_id: RecordId,
        patch: &FieldPatch,
        expected_version: i64,
    ) -> Result<EditableRecord, SubmitError> {
        match self.store.update(record_id, patch, expected_version).await {
            Ok(record) => {
                if record.version != expected_version + 1 {
                    tracing::warn!(
                        record_id,
                        expected_version,
                        returned = record.version,
                        "store returned an unexpected version"
                    );
                }
                Ok(record)
            }
            Err(StoreError::Conflict { current, .. }) => match self.store.get(record_id).await {
                Ok(server) => Err(SubmitError::Conflict(server)),
                Err(err) => {
                    tracing::warn!(record_id, %err, "conflict snapshot fetch failed; using record from the rejection");
                    Err(SubmitError::Conflict(*current))
                }
            },
            Err(other) => Err(SubmitError::Failed(other.into())),
        }
    }
}

pub(crate) fn check_field(field: Field, value: FieldValue) -> Result<(), SaveError> {
    if value.field() == field {
        Ok(())
    } else {
        Err(SaveError::Validation {
            field,
            message: format!("{} value '{value}' given for {field}", value.field()),
        })
    }
}

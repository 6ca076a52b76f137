use std::fmt::Write as _;

use strum::IntoEnumIterator;

use crate::error::SaveError;
use crate::model::{EditableRecord, Field, FieldValue, Fields, RecordId, VersionedFields};
use crate::sync::coordinator::SaveCoordinator;

/// Baseline, server and client state captured when a save hit a version
/// mismatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictDescriptor {
    pub record_id: RecordId,
    pub baseline: VersionedFields,
    pub server: EditableRecord,
    pub mine: Fields,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictRow {
    pub field: Field,
    pub baseline: FieldValue,
    pub mine: FieldValue,
    pub server: FieldValue,
}

impl ConflictRow {
    pub fn changed_by_me(&self) -> bool {
        self.mine != self.baseline
    }

    pub fn changed_on_server(&self) -> bool {
        self.server != self.baseline
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    KeepMine,
    UseServer,
    /// Hand the diff back for manual re-editing. No fields are merged.
    Merge,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionOutcome {
    Saved(EditableRecord),
    Adopted(EditableRecord),
    ManualReview(Vec<ConflictRow>),
}

/// Rows for every tracked field where the client value differs from the
/// server value, including fields only the server touched.
pub fn diff(conflict: &ConflictDescriptor) -> Vec<ConflictRow> {
    Field::iter()
        .filter_map(|field| {
            let mine = conflict.mine.get(field);
            let server = conflict.server.fields.get(field);
            (mine != server).then(|| ConflictRow {
                field,
                baseline: conflict.baseline.fields.get(field),
                mine,
                server,
            })
        })
        .collect()
}

pub async fn resolve(
    coordinator: &SaveCoordinator,
    resolution: Resolution,
) -> Result<ResolutionOutcome, SaveError> {
    match resolution {
        Resolution::KeepMine => coordinator
            .force_overwrite()
            .await
            .map(ResolutionOutcome::Saved),
        Resolution::UseServer => coordinator
            .accept_server_version()
            .map(ResolutionOutcome::Adopted),
        Resolution::Merge => {
            let conflict = coordinator
                .snapshot()
                .conflict
                .ok_or(SaveError::InvalidState("no conflict to resolve"))?;
            tracing::info!(
                record_id = conflict.record_id,
                "conflict left for manual review"
            );
            Ok(ResolutionOutcome::ManualReview(diff(&conflict)))
        }
    }
}

pub fn format_rows(rows: &[ConflictRow]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        &mut out,
        "{:<10} {:<12} {:<12} {}",
        "FIELD", "BASELINE", "MINE", "SERVER"
    );
    for row in rows {
        let _ = writeln!(
            &mut out,
            "{:<10} {:<12} {:<12} {}",
            row.field.to_string(),
            row.baseline.to_string(),
            row.mine.to_string(),
            row.server.to_string()
        );
    }
    out
}

use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};
use time::OffsetDateTime;
use uuid::Uuid;

pub type RecordId = i64;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum Category {
    Work,
    Personal,
    Financial,
    Social,
    Promotional,
    Newsletter,
    Spam,
    Other,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum Urgency {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum Action {
    Reply,
    Read,
    Archive,
    Delete,
    FollowUp,
    #[serde(rename = "NONE")]
    #[strum(serialize = "NONE")]
    NoAction,
}

/// A tracked classification field.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Field {
    Category,
    Urgency,
    Action,
}

/// A field value tagged with the field it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldValue {
    Category(Category),
    Urgency(Urgency),
    Action(Action),
}

impl FieldValue {
    pub fn field(&self) -> Field {
        match self {
            FieldValue::Category(_) => Field::Category,
            FieldValue::Urgency(_) => Field::Urgency,
            FieldValue::Action(_) => Field::Action,
        }
    }

    /// Parses raw text into the enum of `field`.
    pub fn parse(field: Field, raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        let parsed = match field {
            Field::Category => raw.parse().map(FieldValue::Category).ok(),
            Field::Urgency => raw.parse().map(FieldValue::Urgency).ok(),
            Field::Action => raw.parse().map(FieldValue::Action).ok(),
        };
        parsed.ok_or_else(|| {
            format!(
                "'{raw}' is not a valid {field} (expected one of: {})",
                allowed_values(field).join(", ")
            )
        })
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Category(value) => write!(f, "{value}"),
            FieldValue::Urgency(value) => write!(f, "{value}"),
            FieldValue::Action(value) => write!(f, "{value}"),
        }
    }
}

impl From<Category> for FieldValue {
    fn from(value: Category) -> Self {
        FieldValue::Category(value)
    }
}

impl From<Urgency> for FieldValue {
    fn from(value: Urgency) -> Self {
        FieldValue::Urgency(value)
    }
}

impl From<Action> for FieldValue {
    fn from(value: Action) -> Self {
        FieldValue::Action(value)
    }
}

pub fn allowed_values(field: Field) -> Vec<String> {
    match field {
        Field::Category => Category::iter().map(|v| v.to_string()).collect(),
        Field::Urgency => Urgency::iter().map(|v| v.to_string()).collect(),
        Field::Action => Action::iter().map(|v| v.to_string()).collect(),
    }
}

/// The full set of editable classification fields on a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fields {
    pub category: Category,
    pub urgency: Urgency,
    pub action: Action,
}

impl Fields {
    pub fn get(&self, field: Field) -> FieldValue {
        match field {
            Field::Category => FieldValue::Category(self.category),
            Field::Urgency => FieldValue::Urgency(self.urgency),
            Field::Action => FieldValue::Action(self.action),
        }
    }

    pub fn set(&mut self, value: FieldValue) {
        match value {
            FieldValue::Category(v) => self.category = v,
            FieldValue::Urgency(v) => self.urgency = v,
            FieldValue::Action(v) => self.action = v,
        }
    }

    pub fn apply(&mut self, patch: &FieldPatch) {
        for value in patch.values() {
            self.set(value);
        }
    }

    pub fn with(mut self, patch: &FieldPatch) -> Self {
        self.apply(patch);
        self
    }

    /// Fields of `self` that differ from `other`, as a patch over `other`.
    pub fn changes_from(&self, other: &Fields) -> FieldPatch {
        let mut patch = FieldPatch::default();
        for field in Field::iter() {
            let value = self.get(field);
            if value != other.get(field) {
                patch.set(value);
            }
        }
        patch
    }
}

/// A partial set of field writes. Later writes to the same field win.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urgency: Option<Urgency>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
}

impl FieldPatch {
    pub fn single(value: FieldValue) -> Self {
        let mut patch = Self::default();
        patch.set(value);
        patch
    }

    pub fn set(&mut self, value: FieldValue) {
        match value {
            FieldValue::Category(v) => self.category = Some(v),
            FieldValue::Urgency(v) => self.urgency = Some(v),
            FieldValue::Action(v) => self.action = Some(v),
        }
    }

    pub fn get(&self, field: Field) -> Option<FieldValue> {
        match field {
            Field::Category => self.category.map(FieldValue::Category),
            Field::Urgency => self.urgency.map(FieldValue::Urgency),
            Field::Action => self.action.map(FieldValue::Action),
        }
    }

    pub fn remove(&mut self, field: Field) {
        match field {
            Field::Category => self.category = None,
            Field::Urgency => self.urgency = None,
            Field::Action => self.action = None,
        }
    }

    /// Overlays `later` on top of `self`.
    pub fn merge(&mut self, later: &FieldPatch) {
        for value in later.values() {
            self.set(value);
        }
    }

    pub fn values(&self) -> impl Iterator<Item = FieldValue> + '_ {
        Field::iter().filter_map(|field| self.get(field))
    }

    pub fn is_empty(&self) -> bool {
        self.category.is_none() && self.urgency.is_none() && self.action.is_none()
    }

    pub fn len(&self) -> usize {
        self.values().count()
    }
}

impl fmt::Display for FieldPatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = self
            .values()
            .map(|value| format!("{}={}", value.field(), value))
            .collect::<Vec<_>>();
        write!(f, "{}", parts.join(", "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditableRecord {
    pub id: RecordId,
    #[serde(flatten)]
    pub fields: Fields,
    pub version: i64,
    pub corrected_by: Option<String>,
    pub corrected_at: Option<i64>,
}

/// Version and field values captured at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedFields {
    pub version: i64,
    pub fields: Fields,
}

impl From<&EditableRecord> for VersionedFields {
    fn from(record: &EditableRecord) -> Self {
        Self {
            version: record.version,
            fields: record.fields,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldChange {
    pub record_id: RecordId,
    pub field: Field,
    pub previous_value: FieldValue,
    pub new_value: FieldValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Single,
    Bulk,
}

/// An undoable change. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    id: Uuid,
    timestamp: OffsetDateTime,
    kind: ChangeKind,
    changes: Vec<FieldChange>,
    description: String,
}

impl ChangeRecord {
    pub fn single(change: FieldChange) -> Self {
        let description = format!(
            "#{} {}: {} -> {}",
            change.record_id, change.field, change.previous_value, change.new_value
        );
        Self {
            id: Uuid::new_v4(),
            timestamp: OffsetDateTime::now_utc(),
            kind: ChangeKind::Single,
            changes: vec![change],
            description,
        }
    }

    pub fn bulk(changes: Vec<FieldChange>, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: OffsetDateTime::now_utc(),
            kind: ChangeKind::Bulk,
            changes,
            description: description.into(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn timestamp(&self) -> OffsetDateTime {
        self.timestamp
    }

    pub fn kind(&self) -> ChangeKind {
        self.kind
    }

    pub fn changes(&self) -> &[FieldChange] {
        &self.changes
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Fields {
        Fields {
            category: Category::Work,
            urgency: Urgency::Low,
            action: Action::Read,
        }
    }

    #[test]
    fn field_values_parse_case_insensitively() {
        assert_eq!(
            FieldValue::parse(Field::Category, "financial"),
            Ok(FieldValue::Category(Category::Financial))
        );
        assert_eq!(
            FieldValue::parse(Field::Action, "FOLLOW_UP"),
            Ok(FieldValue::Action(Action::FollowUp))
        );
    }

    #[test]
    fn field_value_parse_rejects_values_outside_enum() {
        let err = FieldValue::parse(Field::Urgency, "WORK").unwrap_err();
        assert!(err.contains("not a valid urgency"), "got {err}");
        assert!(err.contains("CRITICAL"));
    }

    #[test]
    fn patch_merge_prefers_later_writes() {
        let mut first = FieldPatch::single(Urgency::High.into());
        first.set(Category::Spam.into());
        let later = FieldPatch::single(Urgency::Low.into());
        first.merge(&later);
        assert_eq!(first.urgency, Some(Urgency::Low));
        assert_eq!(first.category, Some(Category::Spam));
        assert_eq!(first.action, None);
    }

    #[test]
    fn changes_from_reports_only_differing_fields() {
        let base = sample();
        let mut edited = base;
        edited.set(Category::Financial.into());
        let patch = edited.changes_from(&base);
        assert_eq!(patch.len(), 1);
        assert_eq!(patch.category, Some(Category::Financial));
        assert_eq!(base.with(&patch), edited);
    }

    #[test]
    fn patch_serializes_only_present_fields() -> anyhow::Result<()> {
        let patch = FieldPatch::single(Urgency::High.into());
        let json = serde_json::to_string(&patch)?;
        assert_eq!(json, r#"{"urgency":"HIGH"}"#);
        let back: FieldPatch = serde_json::from_str(&json)?;
        assert_eq!(back, patch);
        Ok(())
    }
}

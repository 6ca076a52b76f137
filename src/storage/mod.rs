use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use time::OffsetDateTime;

use crate::config::{ConfigPaths, StorageOptions};
use crate::error::StoreError;
use crate::model::{Action, Category, EditableRecord, FieldPatch, Fields, RecordId, Urgency};
use crate::sync::{KeyValueStore, RecordStore};

mod schema;

const DEFAULT_EDITOR: &str = "admin";
const RECORD_COLUMNS: &str = "id, category, urgency, action, version, corrected_by, corrected_at";

#[derive(Clone)]
pub struct StorageHandle {
    db_path: Arc<PathBuf>,
    options: Arc<StorageOptions>,
    editor: Arc<str>,
}

impl StorageHandle {
    pub fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&*self.db_path)
            .with_context(|| format!("opening database {}", self.db_path.display()))?;
        prepare_connection(&conn, &self.options)?;
        Ok(conn)
    }

    pub fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.connect()?;
        f(&conn)
    }

    pub fn database_path(&self) -> &Path {
        &self.db_path
    }

    /// Name written to `corrected_by` on every accepted update.
    pub fn with_editor(mut self, editor: &str) -> Self {
        let trimmed = editor.trim();
        self.editor = Arc::from(if trimmed.is_empty() {
            DEFAULT_EDITOR
        } else {
            trimmed
        });
        self
    }

    pub fn fetch_records(&self, limit: usize) -> Result<Vec<EditableRecord>> {
        self.with_connection(|conn| {
            let sql = format!("SELECT {RECORD_COLUMNS} FROM records ORDER BY id LIMIT ?1");
            let mut stmt = conn.prepare(&sql)?;
            let records = stmt
                .query_map([limit as i64], map_record)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .context("fetching records")?;
            Ok(records)
        })
    }

    pub fn fetch_record(&self, id: RecordId) -> Result<Option<EditableRecord>> {
        self.with_connection(|conn| fetch_record_in(conn, id))
    }

    pub fn insert_record(&self, id: RecordId, fields: Fields, version: i64) -> Result<EditableRecord> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO records (id, category, urgency, action, version)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    id,
                    fields.category.as_ref(),
                    fields.urgency.as_ref(),
                    fields.action.as_ref(),
                    version
                ],
            )
            .with_context(|| format!("inserting record {id}"))?;
            fetch_record_in(conn, id)?
                .with_context(|| format!("record {id} missing after insert"))
        })
    }

    /// Applies `patch` if the stored version still equals `expected_version`.
    pub fn update_blocking(
        &self,
        id: RecordId,
        patch: &FieldPatch,
        expected_version: i64,
    ) -> std::result::Result<EditableRecord, StoreError> {
        let mut conn = self.connect().map_err(server_error)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(server_error)?;
        let current = fetch_record_in(&tx, id)
            .map_err(server_error)?
            .ok_or(StoreError::NotFound(id))?;
        if current.version != expected_version {
            return Err(StoreError::Conflict {
                id,
                expected: expected_version,
                current: Box::new(current),
            });
        }
        let fields = current.fields.with(patch);
        let now = OffsetDateTime::now_utc().unix_timestamp();
        tx.execute(
            "UPDATE records
             SET category = ?1, urgency = ?2, action = ?3,
                 version = version + 1, corrected_by = ?4, corrected_at = ?5
             WHERE id = ?6 AND version = ?7",
            params![
                fields.category.as_ref(),
                fields.urgency.as_ref(),
                fields.action.as_ref(),
                &*self.editor,
                now,
                id,
                expected_version
            ],
        )
        .map_err(server_error)?;
        let updated = fetch_record_in(&tx, id)
            .map_err(server_error)?
            .ok_or(StoreError::NotFound(id))?;
        tx.commit().map_err(server_error)?;
        Ok(updated)
    }
}

#[async_trait]
impl RecordStore for StorageHandle {
    async fn update(
        &self,
        id: RecordId,
        patch: &FieldPatch,
        expected_version: i64,
    ) -> std::result::Result<EditableRecord, StoreError> {
        let handle = self.clone();
        let patch = *patch;
        tokio::task::spawn_blocking(move || handle.update_blocking(id, &patch, expected_version))
            .await
            .map_err(|err| StoreError::Server(format!("storage task failed: {err}")))?
    }

    async fn get(&self, id: RecordId) -> std::result::Result<EditableRecord, StoreError> {
        let handle = self.clone();
        tokio::task::spawn_blocking(move || handle.fetch_record(id))
            .await
            .map_err(|err| StoreError::Server(format!("storage task failed: {err}")))?
            .map_err(server_error)?
            .ok_or(StoreError::NotFound(id))
    }
}

impl KeyValueStore for StorageHandle {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_connection(|conn| {
            conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get::<_, String>(0)
            })
            .optional()
            .with_context(|| format!("reading kv entry {key}"))
        })
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.with_connection(|conn| {
            let now = OffsetDateTime::now_utc().unix_timestamp();
            conn.execute(
                "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value, now],
            )
            .with_context(|| format!("writing kv entry {key}"))?;
            Ok(())
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute("DELETE FROM kv WHERE key = ?1", params![key])
                .with_context(|| format!("removing kv entry {key}"))?;
            Ok(())
        })
    }
}

fn fetch_record_in(conn: &Connection, id: RecordId) -> Result<Option<EditableRecord>> {
    let sql = format!("SELECT {RECORD_COLUMNS} FROM records WHERE id = ?1");
    conn.query_row(&sql, params![id], map_record)
        .optional()
        .with_context(|| format!("fetching record {id}"))
}

fn map_record(row: &Row<'_>) -> rusqlite::Result<EditableRecord> {
    Ok(EditableRecord {
        id: row.get(0)?,
        fields: Fields {
            category: parse_column::<Category>(row, 1)?,
            urgency: parse_column::<Urgency>(row, 2)?,
            action: parse_column::<Action>(row, 3)?,
        },
        version: row.get(4)?,
        corrected_by: row.get(5)?,
        corrected_at: row.get(6)?,
    })
}

fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

fn server_error(err: impl Into<anyhow::Error>) -> StoreError {
    StoreError::Server(format!("{:#}", err.into()))
}

pub fn init(paths: &ConfigPaths, storage: &StorageOptions) -> Result<StorageHandle> {
    let db_path = &paths.database_path;
    let existed = db_path.exists();
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating data directory {}", parent.display()))?;
    }
    let conn = Connection::open(db_path)
        .with_context(|| format!("opening database {}", db_path.display()))?;
    prepare_connection(&conn, storage)?;
    schema::apply(&conn)?;
    if !existed {
        seed_initial_records(&conn)?;
    }
    Ok(StorageHandle {
        db_path: Arc::new(db_path.clone()),
        options: Arc::new(storage.clone()),
        editor: Arc::from(DEFAULT_EDITOR),
    })
}

fn prepare_connection(conn: &Connection, storage: &StorageOptions) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")
        .context("setting journal_mode=WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .context("setting synchronous=NORMAL")?;
    conn.pragma_update(
        None,
        "wal_autocheckpoint",
        storage.wal_autocheckpoint.to_string(),
    )
    .context("setting wal_autocheckpoint")?;
    conn.busy_timeout(std::time::Duration::from_millis(storage.busy_timeout_ms))
        .context("setting busy timeout")?;
    Ok(())
}

fn seed_initial_records(conn: &Connection) -> Result<()> {
    let existing: Option<i64> = conn
        .query_row("SELECT id FROM records LIMIT 1", [], |row| row.get(0))
        .optional()
        .context("checking for existing records")?;
    if existing.is_some() {
        return Ok(());
    }

    tracing::info!("seeding first-run records");
    let records = [
        (Category::Work, Urgency::Medium, Action::Reply),
        (Category::Financial, Urgency::High, Action::Read),
        (Category::Newsletter, Urgency::Low, Action::Archive),
        (Category::Promotional, Urgency::Low, Action::Delete),
        (Category::Personal, Urgency::Medium, Action::FollowUp),
        (Category::Spam, Urgency::Low, Action::NoAction),
    ];

    for (idx, (category, urgency, action)) in records.into_iter().enumerate() {
        conn.execute(
            "INSERT INTO records (id, category, urgency, action, version)
             VALUES (?1, ?2, ?3, ?4, 1)",
            params![
                idx as i64 + 1,
                category.as_ref(),
                urgency.as_ref(),
                action.as_ref()
            ],
        )
        .context("inserting seed record")?;
    }

    Ok(())
}

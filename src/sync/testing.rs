use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;

use crate::config::{ConfigPaths, StorageOptions};
use crate::error::StoreError;
use crate::model::{Action, Category, EditableRecord, FieldPatch, Fields, RecordId, Urgency};
use crate::storage::{self, StorageHandle};
use crate::sync::{RecordStore, SaveCoordinator};

pub const RECORD_ID: RecordId = 42;

pub fn work_low() -> Fields {
    Fields {
        category: Category::Work,
        urgency: Urgency::Low,
        action: Action::Read,
    }
}

pub fn setup_storage() -> Result<(TempDir, StorageHandle)> {
    let temp = TempDir::new()?;
    let paths = ConfigPaths::rooted_at(temp.path());
    let storage = storage::init(&paths, &StorageOptions::default())?;
    Ok((temp, storage))
}

#[derive(Debug, Clone)]
enum Mode {
    Online,
    Offline,
    Server(String),
}

/// SQLite-backed store that can be switched offline or made to fail.
pub struct FlakyStore {
    inner: StorageHandle,
    mode: Mutex<Mode>,
    update_calls: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: StorageHandle) -> Self {
        Self {
            inner,
            mode: Mutex::new(Mode::Online),
            update_calls: AtomicUsize::new(0),
        }
    }

    pub fn go_offline(&self) {
        *self.mode.lock() = Mode::Offline;
    }

    pub fn fail_with_server(&self, message: &str) {
        *self.mode.lock() = Mode::Server(message.to_string());
    }

    pub fn recover(&self) {
        *self.mode.lock() = Mode::Online;
    }

    /// Update attempts seen, including failed ones.
    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), StoreError> {
        match &*self.mode.lock() {
            Mode::Online => Ok(()),
            Mode::Offline => Err(StoreError::Network("connection refused".into())),
            Mode::Server(message) => Err(StoreError::Server(message.clone())),
        }
    }
}

#[async_trait]
impl RecordStore for FlakyStore {
    async fn update(
        &self,
        id: RecordId,
        patch: &FieldPatch,
        expected_version: i64,
    ) -> Result<EditableRecord, StoreError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.inner.update(id, patch, expected_version).await
    }

    async fn get(&self, id: RecordId) -> Result<EditableRecord, StoreError> {
        self.check()?;
        RecordStore::get(&self.inner, id).await
    }
}

pub struct Fixture {
    pub _temp: TempDir,
    pub storage: StorageHandle,
    pub store: Arc<FlakyStore>,
    pub coordinator: Arc<SaveCoordinator>,
}

/// Record 42 at version 3 (WORK / LOW / READ), already displayed.
pub fn fixture() -> Result<Fixture> {
    let (temp, storage) = setup_storage()?;
    let record = storage.insert_record(RECORD_ID, work_low(), 3)?;
    let store = Arc::new(FlakyStore::new(storage.clone()));
    let coordinator = Arc::new(SaveCoordinator::new(store.clone()));
    coordinator.display(record);
    Ok(Fixture {
        _temp: temp,
        storage,
        store,
        coordinator,
    })
}

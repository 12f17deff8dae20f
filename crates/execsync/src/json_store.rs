//! Record store persisted as a single JSON file.
//!
//! The whole [`StoreState`] is loaded at open and rewritten atomically after
//! every successful mutation. A failed save leaves both the file and the
//! in-memory state as they were.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use execsync_core::fingerprint::Fingerprint;
use execsync_core::record::{Record, RecordKey, StoredRecord};
use execsync_core::store::{ListFilter, RecordStore, Result, StoreError, StoreState};
use rand::Rng;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub struct JsonFileStore {
    path: PathBuf,
    state: Mutex<StoreState>,
}

fn unavailable(path: &Path, e: io::Error) -> StoreError {
    StoreError::Unavailable(format!("{}: {}", path.display(), e))
}

impl JsonFileStore {
    /// Open the store at `path`. A missing file is an empty store.
    pub async fn open(path: PathBuf) -> Result<Self> {
        let state = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                StoreError::Corrupt(format!("{}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Store file not found, starting empty");
                StoreState::default()
            }
            Err(e) => return Err(unavailable(&path, e)),
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Register a principal. Returns `false` if it already existed.
    pub async fn add_principal(&self, principal: &str) -> Result<bool> {
        let added = self
            .mutate(|state| Ok(state.add_principal(principal)))
            .await?;
        if added {
            info!(principal, path = %self.path.display(), "Added principal");
        }
        Ok(added)
    }

    /// Soft-delete a record.
    pub async fn delete(&self, principal: &str, key: &RecordKey) -> Result<()> {
        self.mutate(|state| state.delete(principal, key, Utc::now()))
            .await
    }

    /// Apply `f` to a copy of the state, persist it, then commit it.
    async fn mutate<T>(&self, f: impl FnOnce(&mut StoreState) -> Result<T>) -> Result<T> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let value = f(&mut next)?;
        if next != *state {
            self.save(&next).await?;
            *state = next;
        }
        Ok(value)
    }

    async fn save(&self, state: &StoreState) -> Result<()> {
        let contents = serde_json::to_vec_pretty(state)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| unavailable(parent, e))?;
        }

        let suffix: u64 = rand::rng().random();
        let temp = self.path.with_extension(format!("{:016x}.tmp", suffix));
        if let Err(e) = fs::write(&temp, &contents).await {
            let _ = fs::remove_file(&temp).await;
            return Err(unavailable(&temp, e));
        }
        if let Err(e) = fs::rename(&temp, &self.path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(unavailable(&self.path, e));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for JsonFileStore {
    async fn principal_exists(&self, principal: &str) -> Result<bool> {
        Ok(self.state.lock().await.has_principal(principal))
    }

    async fn get(&self, principal: &str, key: &RecordKey) -> Result<Option<StoredRecord>> {
        self.state.lock().await.get(principal, key)
    }

    async fn list(&self, principal: &str, filter: &ListFilter) -> Result<Vec<StoredRecord>> {
        self.state.lock().await.list(principal, filter)
    }

    async fn create(&self, principal: &str, record: &Record) -> Result<DateTime<Utc>> {
        self.mutate(|state| state.create(principal, record, Utc::now()))
            .await
    }

    async fn update(
        &self,
        principal: &str,
        key: &RecordKey,
        record: &Record,
    ) -> Result<DateTime<Utc>> {
        self.mutate(|state| state.update(principal, key, record, Utc::now()))
            .await
    }

    async fn save_fingerprint(
        &self,
        principal: &str,
        key: &RecordKey,
        fingerprint: &Fingerprint,
    ) -> Result<()> {
        self.mutate(|state| state.save_fingerprint(principal, key, fingerprint))
            .await
    }
}

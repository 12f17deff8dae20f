//! Applying classified outcomes to the filesystem and the store.
//!
//! The fingerprint is saved last, after every write for the record has
//! succeeded, so a failure part-way leaves the previous agreement in place.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::plan::{FileState, PlanEntry};
use super::{Reconciler, Result, SyncError};
use crate::codec::{self, ParseError, task_list};
use crate::detect::Outcome;
use crate::fingerprint::{ContentHash, Fingerprint, truncate_millis};
use crate::fs::{FileSystem, FsError};
use crate::layout::{document_path, folder_of, list_path};
use crate::record::{Record, RecordKey, RecordKind, StoredRecord};
use crate::retry::RetryPolicy;
use crate::store::RecordStore;

/// One async lock per file path, so writes to a file never interleave.
#[derive(Default)]
pub(crate) struct PathLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl PathLocks {
    pub fn get(&self, path: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(path.to_string()).or_default().clone()
    }
}

fn fingerprint(path: &str, mtime: DateTime<Utc>, hash: String, revision: DateTime<Utc>) -> Fingerprint {
    Fingerprint {
        file_path: path.to_string(),
        file_mtime: mtime,
        file_hash: hash,
        store_revision_time: truncate_millis(revision),
    }
}

fn unapplicable(outcome: Outcome, key: &RecordKey) -> SyncError {
    SyncError::Conflict(format!("cannot apply {} to {}", outcome, key))
}

impl<F: FileSystem, S: RecordStore> Reconciler<F, S> {
    pub(super) async fn apply(
        &self,
        entry: &PlanEntry,
        outcome: Outcome,
        retry: &RetryPolicy,
    ) -> Result<()> {
        match entry.key.collection.kind() {
            RecordKind::Document => self.apply_document(entry, outcome, retry).await,
            RecordKind::ListItem => self.apply_item(entry, outcome, retry).await,
        }
    }

    async fn apply_document(
        &self,
        entry: &PlanEntry,
        outcome: Outcome,
        retry: &RetryPolicy,
    ) -> Result<()> {
        let key = &entry.key;
        match (outcome, entry.file.as_ref(), entry.stored.as_ref()) {
            (Outcome::CreateInStore, Some(file), _) => {
                let revision = self.store_create(&file.record, retry).await?;
                let fp = fingerprint(&file.path, file.mtime, file.hash.clone(), revision);
                self.store_fingerprint(key, &fp, retry).await
            }
            (Outcome::FileWinsUpdateStore, Some(file), Some(_)) => {
                let revision = self.store_update(key, &file.record, retry).await?;
                let fp = fingerprint(&file.path, file.mtime, file.hash.clone(), revision);
                self.store_fingerprint(key, &fp, retry).await
            }
            (Outcome::StoreWinsUpdateFile, Some(file), Some(stored)) => {
                let target = self.document_target(stored, Some(&file.path), retry).await?;
                self.write_document(key, stored, &target, Some(&file.path), retry)
                    .await
            }
            (Outcome::CreateAsFile, None, Some(stored)) => {
                let target = match entry.target_path.clone() {
                    Some(path) => path,
                    None => self.document_target(stored, None, retry).await?,
                };
                self.write_document(key, stored, &target, None, retry).await
            }
            (Outcome::SkipInSync, Some(file), Some(stored)) => {
                if stored.fingerprint.is_none() {
                    let fp = fingerprint(&file.path, file.mtime, file.hash.clone(), stored.revision_time);
                    self.store_fingerprint(key, &fp, retry).await?;
                }
                Ok(())
            }
            (outcome, _, _) => Err(unapplicable(outcome, key)),
        }
    }

    /// Where a stored document belongs: its current file if the folder still
    /// matches, otherwise a free `<key>.md` in the folder for its status.
    async fn document_target(
        &self,
        stored: &StoredRecord,
        current: Option<&str>,
        retry: &RetryPolicy,
    ) -> Result<String> {
        let record = &stored.record;
        let folder = record
            .as_document()
            .map(|doc| doc.folder)
            .ok_or_else(|| SyncError::Conflict(format!("{} is not a document", record.record_key())))?;

        if let Some(current) = current {
            if folder_of(current) == Some(folder) {
                return Ok(current.to_string());
            }
        }

        let fs = self.fs.as_ref();
        let mut suffix = 1;
        loop {
            let stem = if suffix == 1 {
                record.key.clone()
            } else {
                format!("{}-{}", record.key, suffix)
            };
            let path = document_path(record.collection, folder, &stem);
            let candidate = path.as_str();
            if !retry.run("exists", move || fs.exists(candidate)).await? {
                return Ok(path);
            }
            suffix += 1;
        }
    }

    async fn write_document(
        &self,
        key: &RecordKey,
        stored: &StoredRecord,
        target: &str,
        previous: Option<&str>,
        retry: &RetryPolicy,
    ) -> Result<()> {
        let encoded = codec::encode(&stored.record)?;

        // The old path goes first so an interrupted move never leaves two copies.
        if let Some(previous) = previous.filter(|p| *p != target) {
            let lock = self.locks.get(previous);
            let _guard = lock.lock().await;
            self.remove_file(previous, retry).await?;
        }

        let mtime = {
            let lock = self.locks.get(target);
            let _guard = lock.lock().await;
            self.write_text(target, &encoded, retry).await?
        };

        let hash = ContentHash::from_content(&encoded).into_string();
        let fp = fingerprint(target, mtime, hash, stored.revision_time);
        self.store_fingerprint(key, &fp, retry).await
    }

    async fn apply_item(&self, entry: &PlanEntry, outcome: Outcome, retry: &RetryPolicy) -> Result<()> {
        let key = &entry.key;
        match (outcome, entry.file.as_ref(), entry.stored.as_ref()) {
            (Outcome::CreateInStore, Some(file), _) => {
                let revision = self.store_create(&file.record, retry).await?;
                let (hash, mtime) = self.write_minted_id(key, file, retry).await?;
                let fp = fingerprint(&file.path, mtime, hash, revision);
                self.store_fingerprint(key, &fp, retry).await
            }
            (Outcome::FileWinsUpdateStore, Some(file), Some(_)) => {
                let revision = self.store_update(key, &file.record, retry).await?;
                let (hash, mtime) = self.write_minted_id(key, file, retry).await?;
                let fp = fingerprint(&file.path, mtime, hash, revision);
                self.store_fingerprint(key, &fp, retry).await
            }
            (Outcome::StoreWinsUpdateFile, Some(file), Some(stored)) => {
                self.write_item(key, stored, Some(file), retry).await
            }
            (Outcome::CreateAsFile, None, Some(stored)) => {
                self.write_item(key, stored, None, retry).await
            }
            (Outcome::SkipInSync, Some(file), Some(stored)) => {
                // Baseline only; a minted id reaches the line with the next write.
                if stored.fingerprint.is_none() {
                    let fp = fingerprint(&file.path, file.mtime, file.hash.clone(), stored.revision_time);
                    self.store_fingerprint(key, &fp, retry).await?;
                }
                Ok(())
            }
            (outcome, _, _) => Err(unapplicable(outcome, key)),
        }
    }

    /// Make a minted id permanent by writing `id:<key>` into the item's line.
    ///
    /// Returns the line hash and file mtime the fingerprint should carry.
    async fn write_minted_id(
        &self,
        key: &RecordKey,
        file: &FileState,
        retry: &RetryPolicy,
    ) -> Result<(String, DateTime<Utc>)> {
        if !file.minted {
            return Ok((file.hash.clone(), file.mtime));
        }
        let raw_line = file.raw_line.as_deref().unwrap_or_default();
        let line = task_list::with_id(raw_line, &key.key);

        let lock = self.locks.get(&file.path);
        let _guard = lock.lock().await;
        let current = self
            .read_text(&file.path, retry)
            .await?
            .ok_or_else(|| FsError::NotFound(file.path.clone()))?;
        let updated = task_list::replace_line(&current, &file.path, &key.key, Some(&line))
            .or_else(|| task_list::replace_unkeyed_line(&current, raw_line, Some(&line)))
            .ok_or_else(|| {
                SyncError::Conflict(format!("line for {} changed during the run", key))
            })?;
        let mtime = self.write_text(&file.path, &updated, retry).await?;
        Ok((ContentHash::from_content(&line).into_string(), mtime))
    }

    /// Write a stored list item into the list its record names, taking it
    /// out of its previous list first if that differs.
    async fn write_item(
        &self,
        key: &RecordKey,
        stored: &StoredRecord,
        file: Option<&FileState>,
        retry: &RetryPolicy,
    ) -> Result<()> {
        let task = stored
            .record
            .as_task()
            .ok_or_else(|| SyncError::Conflict(format!("{} is not a list item", key)))?;
        let line = codec::encode(&stored.record)?;
        let target = list_path(&task.list);

        // Leave the old list first so the id is never in two lists at once.
        if let Some(previous) = file.filter(|f| f.path != target) {
            let lock = self.locks.get(&previous.path);
            let _guard = lock.lock().await;
            if let Some(current) = self.read_text(&previous.path, retry).await? {
                if let Some(updated) = replace_item(&current, previous, &key.key, None) {
                    self.write_text(&previous.path, &updated, retry).await?;
                }
            }
        }

        let mtime = {
            let lock = self.locks.get(&target);
            let _guard = lock.lock().await;
            let current = self.read_text(&target, retry).await?.unwrap_or_default();
            let in_place = file
                .filter(|f| f.path == target)
                .and_then(|f| replace_item(&current, f, &key.key, Some(&line)));
            let updated = in_place.unwrap_or_else(|| task_list::append_line(&current, &line));
            self.write_text(&target, &updated, retry).await?
        };

        let hash = ContentHash::from_content(&line).into_string();
        let fp = fingerprint(&target, mtime, hash, stored.revision_time);
        self.store_fingerprint(key, &fp, retry).await
    }

    async fn read_text(&self, path: &str, retry: &RetryPolicy) -> Result<Option<String>> {
        let fs = self.fs.as_ref();
        match retry.run("read", move || fs.read(path)).await {
            Ok(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|_| SyncError::Parse(ParseError::InvalidUtf8)),
            Err(FsError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write a file and return its new modification time.
    async fn write_text(&self, path: &str, content: &str, retry: &RetryPolicy) -> Result<DateTime<Utc>> {
        let fs = self.fs.as_ref();
        let bytes = content.as_bytes();
        retry.run("write", move || fs.write(path, bytes)).await?;
        let stat = retry.run("stat", move || fs.stat(path)).await?;
        Ok(truncate_millis(stat.modified()))
    }

    async fn remove_file(&self, path: &str, retry: &RetryPolicy) -> Result<()> {
        let fs = self.fs.as_ref();
        match retry.run("delete", move || fs.delete(path)).await {
            Ok(()) | Err(FsError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn store_create(&self, record: &Record, retry: &RetryPolicy) -> Result<DateTime<Utc>> {
        let store = self.store.as_ref();
        let principal = self.principal.as_str();
        Ok(retry
            .run("create", move || store.create(principal, record))
            .await?)
    }

    async fn store_update(
        &self,
        key: &RecordKey,
        record: &Record,
        retry: &RetryPolicy,
    ) -> Result<DateTime<Utc>> {
        let store = self.store.as_ref();
        let principal = self.principal.as_str();
        Ok(retry
            .run("update", move || store.update(principal, key, record))
            .await?)
    }

    async fn store_fingerprint(
        &self,
        key: &RecordKey,
        fp: &Fingerprint,
        retry: &RetryPolicy,
    ) -> Result<()> {
        let store = self.store.as_ref();
        let principal = self.principal.as_str();
        Ok(retry
            .run("save fingerprint", move || {
                store.save_fingerprint(principal, key, fp)
            })
            .await?)
    }
}

/// Rewrite an item's line in `raw`, falling back to a twin line for minted ids.
fn replace_item(raw: &str, file: &FileState, id: &str, replacement: Option<&str>) -> Option<String> {
    task_list::replace_line(raw, &file.path, id, replacement).or_else(|| {
        let raw_line = file.raw_line.as_deref().filter(|_| file.minted)?;
        task_list::replace_unkeyed_line(raw, raw_line, replacement)
    })
}

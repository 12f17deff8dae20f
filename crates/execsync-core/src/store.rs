//! Record store client boundary.
//!
//! The store is a key-addressable document store scoped per principal.
//! [`StoreState`] holds the bookkeeping every implementation shares
//! (revision clock, link checks, soft deletes); [`InMemoryStore`] wraps it for
//! tests and the `execsync` crate persists it as JSON.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;
use tracing::debug;

use crate::fingerprint::{Fingerprint, truncate_millis};
use crate::record::{Collection, Payload, Record, RecordKey, StoredRecord};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Rejected: {0}")]
    Rejected(String),

    #[error("Unknown principal: {0}")]
    UnknownPrincipal(String),

    #[error("Corrupt store: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Narrows a listing.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub collection: Option<Collection>,
    pub include_deleted: bool,
}

impl ListFilter {
    pub fn collection(collection: Collection) -> Self {
        Self {
            collection: Some(collection),
            include_deleted: false,
        }
    }
}

/// Operations the reconciler needs from the record store.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn principal_exists(&self, principal: &str) -> Result<bool>;

    async fn get(&self, principal: &str, key: &RecordKey) -> Result<Option<StoredRecord>>;

    async fn list(&self, principal: &str, filter: &ListFilter) -> Result<Vec<StoredRecord>>;

    /// Create a record; returns its revision time.
    async fn create(&self, principal: &str, record: &Record) -> Result<DateTime<Utc>>;

    /// Replace a record's payload; returns the new revision time.
    async fn update(&self, principal: &str, key: &RecordKey, record: &Record)
    -> Result<DateTime<Utc>>;

    /// Attach sync metadata. Does not change the revision time.
    async fn save_fingerprint(
        &self,
        principal: &str,
        key: &RecordKey,
        fingerprint: &Fingerprint,
    ) -> Result<()>;
}

#[async_trait]
impl<T: RecordStore + ?Sized> RecordStore for std::sync::Arc<T> {
    async fn principal_exists(&self, principal: &str) -> Result<bool> {
        (**self).principal_exists(principal).await
    }

    async fn get(&self, principal: &str, key: &RecordKey) -> Result<Option<StoredRecord>> {
        (**self).get(principal, key).await
    }

    async fn list(&self, principal: &str, filter: &ListFilter) -> Result<Vec<StoredRecord>> {
        (**self).list(principal, filter).await
    }

    async fn create(&self, principal: &str, record: &Record) -> Result<DateTime<Utc>> {
        (**self).create(principal, record).await
    }

    async fn update(
        &self,
        principal: &str,
        key: &RecordKey,
        record: &Record,
    ) -> Result<DateTime<Utc>> {
        (**self).update(principal, key, record).await
    }

    async fn save_fingerprint(
        &self,
        principal: &str,
        key: &RecordKey,
        fingerprint: &Fingerprint,
    ) -> Result<()> {
        (**self).save_fingerprint(principal, key, fingerprint).await
    }
}

/// Serializable contents of a store: principal -> `collection/key` -> record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreState {
    #[serde(default)]
    pub principals: BTreeMap<String, BTreeMap<String, StoredRecord>>,
    /// Last revision handed out; revisions are strictly increasing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_revision: Option<DateTime<Utc>>,
}

impl StoreState {
    pub fn add_principal(&mut self, principal: &str) -> bool {
        if self.principals.contains_key(principal) {
            return false;
        }
        self.principals.insert(principal.to_string(), BTreeMap::new());
        true
    }

    pub fn has_principal(&self, principal: &str) -> bool {
        self.principals.contains_key(principal)
    }

    fn records(&self, principal: &str) -> Result<&BTreeMap<String, StoredRecord>> {
        self.principals
            .get(principal)
            .ok_or_else(|| StoreError::UnknownPrincipal(principal.to_string()))
    }

    fn records_mut(&mut self, principal: &str) -> Result<&mut BTreeMap<String, StoredRecord>> {
        self.principals
            .get_mut(principal)
            .ok_or_else(|| StoreError::UnknownPrincipal(principal.to_string()))
    }

    /// Next revision time: `now` to the millisecond, bumped past the last one.
    fn next_revision(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        let now = truncate_millis(now);
        let revision = match self.last_revision {
            Some(last) if now <= last => last + chrono::Duration::milliseconds(1),
            _ => now,
        };
        self.last_revision = Some(revision);
        revision
    }

    pub fn get(&self, principal: &str, key: &RecordKey) -> Result<Option<StoredRecord>> {
        Ok(self
            .records(principal)?
            .get(&key.to_string())
            .filter(|stored| !stored.deleted)
            .cloned())
    }

    pub fn list(&self, principal: &str, filter: &ListFilter) -> Result<Vec<StoredRecord>> {
        Ok(self
            .records(principal)?
            .values()
            .filter(|stored| filter.include_deleted || !stored.deleted)
            .filter(|stored| {
                filter
                    .collection
                    .is_none_or(|collection| stored.record.collection == collection)
            })
            .cloned()
            .collect())
    }

    /// Checks a record must pass before it is written.
    fn validate(&self, principal: &str, record: &Record) -> Result<()> {
        match &record.payload {
            Payload::Document(doc) => {
                if !record.collection.folders().contains(&doc.folder) {
                    return Err(StoreError::Rejected(format!(
                        "{} cannot have status {}",
                        record.record_key(),
                        doc.folder
                    )));
                }
            }
            Payload::Task(task) => {
                if let Some(project) = task.project_slug() {
                    let project_key = RecordKey::new(Collection::Projects, project);
                    if self.get(principal, &project_key)?.is_none() {
                        return Err(StoreError::NotFound(format!(
                            "Project not found: {}",
                            project
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn create(
        &mut self,
        principal: &str,
        record: &Record,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let key = record.record_key();
        let id = key.to_string();
        if self
            .records(principal)?
            .get(&id)
            .is_some_and(|stored| !stored.deleted)
        {
            return Err(StoreError::AlreadyExists(id));
        }
        self.validate(principal, record)?;

        let revision = self.next_revision(now);
        let stored = StoredRecord {
            record: record.clone(),
            revision_time: revision,
            created_at: revision,
            deleted: false,
            fingerprint: None,
        };
        self.records_mut(principal)?.insert(id, stored);
        debug!(key = %key, "Created record");
        Ok(revision)
    }

    pub fn update(
        &mut self,
        principal: &str,
        key: &RecordKey,
        record: &Record,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        if self.get(principal, key)?.is_none() {
            return Err(StoreError::NotFound(key.to_string()));
        }
        if record.record_key() != *key {
            return Err(StoreError::Rejected(format!(
                "record key {} does not match {}",
                record.record_key(),
                key
            )));
        }
        self.validate(principal, record)?;

        let revision = self.next_revision(now);
        let records = self.records_mut(principal)?;
        if let Some(stored) = records.get_mut(&key.to_string()) {
            stored.record = record.clone();
            stored.revision_time = revision;
        }
        debug!(key = %key, "Updated record");
        Ok(revision)
    }

    pub fn save_fingerprint(
        &mut self,
        principal: &str,
        key: &RecordKey,
        fingerprint: &Fingerprint,
    ) -> Result<()> {
        let stored = self
            .records_mut(principal)?
            .get_mut(&key.to_string())
            .filter(|stored| !stored.deleted)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        stored.fingerprint = Some(fingerprint.clone());
        Ok(())
    }

    /// Soft delete. The record disappears from listings.
    pub fn delete(&mut self, principal: &str, key: &RecordKey, now: DateTime<Utc>) -> Result<()> {
        let revision = self.next_revision(now);
        let stored = self
            .records_mut(principal)?
            .get_mut(&key.to_string())
            .filter(|stored| !stored.deleted)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        stored.deleted = true;
        stored.revision_time = revision;
        Ok(())
    }
}

/// In-memory record store for testing.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
    /// Keys whose writes are rejected.
    rejecting: Mutex<HashSet<String>>,
    /// Number of upcoming calls that fail as unavailable.
    outages: AtomicU32,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_principal(principal: &str) -> Self {
        let store = Self::new();
        store.add_principal(principal);
        store
    }

    pub fn add_principal(&self, principal: &str) {
        self.lock().add_principal(principal);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(&self) -> Result<()> {
        let remaining = self.outages.load(Ordering::SeqCst);
        if remaining > 0 {
            self.outages.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("injected outage".to_string()));
        }
        Ok(())
    }

    fn check_writable(&self, key: &RecordKey) -> Result<()> {
        let rejecting = self.rejecting.lock().unwrap_or_else(|e| e.into_inner());
        if rejecting.contains(&key.to_string()) {
            return Err(StoreError::Rejected(format!("writes to {} are blocked", key)));
        }
        Ok(())
    }

    /// Set a record's revision time directly, for "latest wins" scenarios.
    pub fn set_revision_time(&self, principal: &str, key: &RecordKey, revision: DateTime<Utc>) {
        let mut state = self.lock();
        if let Some(stored) = state
            .principals
            .get_mut(principal)
            .and_then(|records| records.get_mut(&key.to_string()))
        {
            stored.revision_time = revision;
        }
    }

    /// Reject every subsequent write to `key`.
    pub fn reject_writes(&self, key: &RecordKey) {
        self.rejecting
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string());
    }

    /// Make the next `calls` operations fail with [`StoreError::Unavailable`].
    pub fn fail_next(&self, calls: u32) {
        self.outages.store(calls, Ordering::SeqCst);
    }

    pub fn delete(&self, principal: &str, key: &RecordKey) -> Result<()> {
        self.lock().delete(principal, key, Utc::now())
    }

    /// Copy of the full state, for before/after comparisons.
    pub fn snapshot(&self) -> StoreState {
        self.lock().clone()
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn principal_exists(&self, principal: &str) -> Result<bool> {
        self.check_available()?;
        Ok(self.lock().has_principal(principal))
    }

    async fn get(&self, principal: &str, key: &RecordKey) -> Result<Option<StoredRecord>> {
        self.check_available()?;
        self.lock().get(principal, key)
    }

    async fn list(&self, principal: &str, filter: &ListFilter) -> Result<Vec<StoredRecord>> {
        self.check_available()?;
        self.lock().list(principal, filter)
    }

    async fn create(&self, principal: &str, record: &Record) -> Result<DateTime<Utc>> {
        self.check_available()?;
        self.check_writable(&record.record_key())?;
        self.lock().create(principal, record, Utc::now())
    }

    async fn update(
        &self,
        principal: &str,
        key: &RecordKey,
        record: &Record,
    ) -> Result<DateTime<Utc>> {
        self.check_available()?;
        self.check_writable(key)?;
        self.lock().update(principal, key, record, Utc::now())
    }

    async fn save_fingerprint(
        &self,
        principal: &str,
        key: &RecordKey,
        fingerprint: &Fingerprint,
    ) -> Result<()> {
        self.check_available()?;
        self.lock().save_fingerprint(principal, key, fingerprint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Document, DocumentDates, Folder, TaskItem};
    use chrono::TimeZone;

    const ME: &str = "me";

    fn project(key: &str, folder: Folder) -> Record {
        Record {
            collection: Collection::Projects,
            key: key.to_string(),
            payload: Payload::Document(Document {
                title: key.to_string(),
                area: None,
                project_type: None,
                folder,
                dates: DocumentDates::default(),
                extra: serde_yaml::Mapping::new(),
                body: String::new(),
            }),
        }
    }

    fn action(key: &str, project: &str) -> Record {
        Record {
            collection: Collection::Actions,
            key: key.to_string(),
            payload: Payload::Task(TaskItem {
                list: "@home".to_string(),
                done: false,
                done_on: None,
                priority: None,
                created: None,
                text: "do it".to_string(),
                contexts: Vec::new(),
                projects: vec![project.to_string()],
                due: None,
                defer: None,
                extra: Vec::new(),
            }),
        }
    }

    #[tokio::test]
    async fn test_create_get_update() {
        let store = InMemoryStore::with_principal(ME);
        let record = project("learn-rust", Folder::Active);
        let key = record.record_key();

        let rev1 = store.create(ME, &record).await.unwrap();
        let stored = store.get(ME, &key).await.unwrap().unwrap();
        assert_eq!(stored.revision_time, rev1);

        let rev2 = store.update(ME, &key, &record).await.unwrap();
        assert!(rev2 > rev1);

        assert!(matches!(
            store.create(ME, &record).await,
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_fingerprint_does_not_bump_revision() {
        let store = InMemoryStore::with_principal(ME);
        let record = project("p", Folder::Active);
        let key = record.record_key();
        let rev = store.create(ME, &record).await.unwrap();

        let fp = Fingerprint {
            file_path: "10k-projects/active/p.md".to_string(),
            file_mtime: rev,
            file_hash: "abc".to_string(),
            store_revision_time: rev,
        };
        store.save_fingerprint(ME, &key, &fp).await.unwrap();

        let stored = store.get(ME, &key).await.unwrap().unwrap();
        assert_eq!(stored.revision_time, rev);
        assert_eq!(stored.fingerprint, Some(fp));
    }

    #[test]
    fn test_revisions_strictly_increase() {
        let mut state = StoreState::default();
        state.add_principal(ME);
        let now = Utc.timestamp_millis_opt(1_000).unwrap();
        let a = state.create(ME, &project("a", Folder::Active), now).unwrap();
        let b = state.create(ME, &project("b", Folder::Active), now).unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_action_requires_existing_project() {
        let store = InMemoryStore::with_principal(ME);
        let err = store.create(ME, &action("t1", "ghost")).await.unwrap_err();
        assert_eq!(err, StoreError::NotFound("Project not found: ghost".to_string()));

        store.create(ME, &project("ghost", Folder::Active)).await.unwrap();
        store.create(ME, &action("t1", "ghost")).await.unwrap();
    }

    #[tokio::test]
    async fn test_goal_folder_validation() {
        let store = InMemoryStore::with_principal(ME);
        let mut goal = project("g", Folder::Completed);
        goal.collection = Collection::Goals;
        assert!(matches!(
            store.create(ME, &goal).await,
            Err(StoreError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_soft_delete_hides_from_listing() {
        let store = InMemoryStore::with_principal(ME);
        let record = project("old", Folder::Active);
        store.create(ME, &record).await.unwrap();
        store.delete(ME, &record.record_key()).unwrap();

        let listed = store.list(ME, &ListFilter::default()).await.unwrap();
        assert!(listed.is_empty());
        let all = store
            .list(
                ME,
                &ListFilter {
                    collection: None,
                    include_deleted: true,
                },
            )
            .await
            .unwrap();
        assert_eq!(all.len(), 1);

        // The key can be reused after deletion.
        store.create(ME, &record).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_principal_and_injected_failures() {
        let store = InMemoryStore::with_principal(ME);
        assert!(!store.principal_exists("stranger").await.unwrap());
        assert!(matches!(
            store.list("stranger", &ListFilter::default()).await,
            Err(StoreError::UnknownPrincipal(_))
        ));

        store.fail_next(1);
        let err = store.list(ME, &ListFilter::default()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(store.list(ME, &ListFilter::default()).await.is_ok());

        let record = project("blocked", Folder::Active);
        store.reject_writes(&record.record_key());
        assert!(matches!(
            store.create(ME, &record).await,
            Err(StoreError::Rejected(_))
        ));
    }
}

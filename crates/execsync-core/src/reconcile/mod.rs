//! The reconciler: one pass over every record of a principal, bringing the
//! source tree and the record store back into agreement.
//!
//! A run enumerates both sides completely, resolves each file to a record
//! key, classifies every key with [`classify`](crate::detect::classify) and
//! applies the outcome. Documents are applied before list items so that
//! projects exist before the actions linking to them.

mod apply;
mod plan;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::codec::{DecodeError, ParseError};
use crate::detect::{Direction, Outcome, classify};
use crate::fingerprint::truncate_millis;
use crate::fs::{FileSystem, FsError};
use crate::layout;
use crate::record::{Collection, RecordKey, RecordKind, StoredRecord};
use crate::retry::RetryPolicy;
use crate::store::{ListFilter, RecordStore, StoreError};

use apply::PathLocks;
use plan::{LoadedFile, Plan, PlanEntry};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Store rejected write: {0}")]
    Rejected(String),

    #[error("Filesystem error: {0}")]
    Filesystem(#[from] FsError),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(msg) => SyncError::NotFound(msg),
            StoreError::AlreadyExists(key) => {
                SyncError::Conflict(format!("{} already exists in the store", key))
            }
            StoreError::Unavailable(msg) => SyncError::StoreUnavailable(msg),
            StoreError::Rejected(msg) => SyncError::Rejected(msg),
            StoreError::UnknownPrincipal(p) => {
                SyncError::Configuration(format!("unknown principal {}", p))
            }
            StoreError::Corrupt(msg) => SyncError::Configuration(msg),
        }
    }
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Parse(_) => ErrorKind::Parse,
            SyncError::NotFound(_) => ErrorKind::NotFound,
            SyncError::Conflict(_) => ErrorKind::Conflict,
            SyncError::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            SyncError::Rejected(_) => ErrorKind::Rejected,
            SyncError::Filesystem(_) => ErrorKind::Filesystem,
            SyncError::Configuration(_) => ErrorKind::Configuration,
        }
    }

    /// I/O failures that a later run may get past.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::StoreUnavailable(_) => true,
            SyncError::Filesystem(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Errors that stop a run before any record is touched.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Configuration(_))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Parse,
    NotFound,
    Conflict,
    StoreUnavailable,
    Rejected,
    Filesystem,
    Configuration,
}

/// A per-record failure, as reported in the run summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordError {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    pub kind: ErrorKind,
    pub message: String,
}

impl RecordError {
    pub fn new(key: Option<String>, path: Option<String>, error: &SyncError) -> Self {
        Self {
            key,
            path,
            line: None,
            kind: error.kind(),
            message: error.to_string(),
        }
    }

    pub fn from_decode(error: &DecodeError, key: Option<String>) -> Self {
        Self {
            key,
            path: Some(error.path.clone()),
            line: error.line,
            kind: ErrorKind::Parse,
            message: error.error.to_string(),
        }
    }
}

/// Per-outcome counters for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub file_to_store_count: usize,
    pub store_to_file_count: usize,
    pub created_in_store: usize,
    pub created_as_file: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl Summary {
    pub fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::CreateInStore => self.created_in_store += 1,
            Outcome::CreateAsFile => self.created_as_file += 1,
            Outcome::FileWinsUpdateStore => self.file_to_store_count += 1,
            Outcome::StoreWinsUpdateFile => self.store_to_file_count += 1,
            Outcome::SkipInSync => self.skipped += 1,
            Outcome::ConflictUnresolved => self.errors += 1,
        }
    }

    pub fn merge(&mut self, other: &Summary) {
        self.file_to_store_count += other.file_to_store_count;
        self.store_to_file_count += other.store_to_file_count;
        self.created_in_store += other.created_in_store;
        self.created_as_file += other.created_as_file;
        self.skipped += other.skipped;
        self.errors += other.errors;
    }

    /// Records that were (or in a dry run, would be) written somewhere.
    pub fn changes(&self) -> usize {
        self.file_to_store_count + self.store_to_file_count + self.created_in_store + self.created_as_file
    }
}

/// One classified record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeEntry {
    pub key: String,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Everything a run has to say about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub summary: Summary,
    /// The timeout expired before every record was scheduled.
    pub timed_out: bool,
    /// Records left for the next run because of the timeout.
    pub unprocessed: usize,
    pub outcomes: Vec<OutcomeEntry>,
    pub errors: Vec<RecordError>,
}

impl RunReport {
    pub fn is_clean(&self) -> bool {
        self.summary.errors == 0
    }
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Classify and report without writing anything.
    pub dry_run: bool,
    /// Direction imposed on every record present on both sides.
    pub force: Option<Direction>,
    /// Per-record directions; take precedence over `force`.
    pub overrides: HashMap<RecordKey, Direction>,
    /// Records processed concurrently.
    pub workers: usize,
    /// Stop scheduling new records after this long.
    pub timeout: Option<Duration>,
    pub retry: RetryPolicy,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            force: None,
            overrides: HashMap::new(),
            workers: 4,
            timeout: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl SyncOptions {
    fn direction_for(&self, key: &RecordKey) -> Option<Direction> {
        self.overrides.get(key).copied().or(self.force)
    }
}

/// What happened to one plan entry.
enum Processed {
    /// Neither side had the record.
    Nothing,
    /// Not started because the run timed out.
    Unscheduled,
    Done(OutcomeEntry),
    Failed(OutcomeEntry, RecordError),
}

/// Drives reconciliation between a source tree and a record store.
///
/// `fs` must be rooted at the source tree; every path the reconciler touches
/// is relative to it.
pub struct Reconciler<F, S> {
    fs: Arc<F>,
    store: Arc<S>,
    principal: String,
    locks: PathLocks,
}

impl<F: FileSystem, S: RecordStore> Reconciler<F, S> {
    pub fn new(fs: Arc<F>, store: Arc<S>, principal: impl Into<String>) -> Self {
        Self {
            fs,
            store,
            principal: principal.into(),
            locks: PathLocks::default(),
        }
    }

    /// Run one reconciliation pass.
    ///
    /// Only configuration problems and failures to enumerate either side
    /// return `Err`. Per-record failures are reported in the [`RunReport`].
    pub async fn run(&self, options: &SyncOptions) -> Result<RunReport> {
        info!(
            principal = %self.principal,
            dry_run = options.dry_run,
            force = ?options.force,
            "Starting reconciliation"
        );
        let deadline = options.timeout.map(|t| Instant::now() + t);

        self.check_configuration(&options.retry).await?;

        let mut plan = Plan::default();
        for collection in Collection::ALL {
            let (files, stored) = self.load(collection, &options.retry).await?;
            debug!(
                collection = %collection,
                files = files.len(),
                stored = stored.len(),
                "Enumerated collection"
            );
            plan::build(collection, files, stored, &mut plan);
        }

        let mut report = RunReport::default();
        for error in plan.errors.drain(..) {
            warn!(key = ?error.key, path = ?error.path, line = ?error.line, "{}", error.message);
            report.summary.errors += 1;
            report.errors.push(error);
        }

        let phases = [
            (RecordKind::Document, std::mem::take(&mut plan.documents)),
            (RecordKind::ListItem, std::mem::take(&mut plan.items)),
        ];
        for (kind, entries) in phases {
            debug!(?kind, records = entries.len(), "Processing phase");
            let workers = options.workers.max(1);
            let results: Vec<Processed> = stream::iter(entries)
                .map(|entry| self.process(entry, options, deadline))
                .buffer_unordered(workers)
                .collect()
                .await;

            let mut phase = Summary::default();
            for result in results {
                match result {
                    Processed::Nothing => {}
                    Processed::Unscheduled => {
                        report.timed_out = true;
                        report.unprocessed += 1;
                    }
                    Processed::Done(entry) => {
                        phase.record(entry.outcome);
                        report.outcomes.push(entry);
                    }
                    Processed::Failed(entry, error) => {
                        phase.errors += 1;
                        report.outcomes.push(entry);
                        report.errors.push(error);
                    }
                }
            }
            report.summary.merge(&phase);
        }

        report.outcomes.sort_by(|a, b| a.key.cmp(&b.key));
        let summary = &report.summary;
        info!(
            created_in_store = summary.created_in_store,
            created_as_file = summary.created_as_file,
            file_to_store = summary.file_to_store_count,
            store_to_file = summary.store_to_file_count,
            skipped = summary.skipped,
            errors = summary.errors,
            timed_out = report.timed_out,
            "Reconciliation finished"
        );
        Ok(report)
    }

    async fn check_configuration(&self, retry: &RetryPolicy) -> Result<()> {
        let fs = self.fs.as_ref();
        if !retry.run("check root", move || fs.exists("")).await? {
            return Err(SyncError::Configuration(
                "source root does not exist".to_string(),
            ));
        }

        let store = self.store.as_ref();
        let principal = self.principal.as_str();
        if !retry
            .run("check principal", move || store.principal_exists(principal))
            .await?
        {
            return Err(SyncError::Configuration(format!(
                "unknown principal {}",
                principal
            )));
        }
        Ok(())
    }

    /// Read every file of a collection and list its stored records.
    async fn load(
        &self,
        collection: Collection,
        retry: &RetryPolicy,
    ) -> Result<(Vec<LoadedFile>, Vec<StoredRecord>)> {
        let fs = self.fs.as_ref();
        let scanned = retry
            .run("scan", move || layout::scan(fs, collection))
            .await?;

        let mut files = Vec::with_capacity(scanned.len());
        for file in scanned {
            let path = file.source.path.as_str();
            let content = retry.run("read", move || fs.read(path)).await;
            files.push(LoadedFile {
                mtime: truncate_millis(file.stat.modified()),
                source: file.source,
                content,
            });
        }

        let store = self.store.as_ref();
        let principal = self.principal.as_str();
        let filter = ListFilter::collection(collection);
        let filter = &filter;
        let stored = retry
            .run("list", move || store.list(principal, filter))
            .await?;
        Ok((files, stored))
    }

    async fn process(
        &self,
        entry: PlanEntry,
        options: &SyncOptions,
        deadline: Option<Instant>,
    ) -> Processed {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Processed::Unscheduled;
        }

        let key = entry.key.clone();
        let file_side = entry.file_side();
        let store_side = entry.store_side();
        let Some(outcome) = classify(
            file_side.as_ref(),
            store_side.as_ref(),
            entry.fingerprint(),
            options.direction_for(&key),
        ) else {
            return Processed::Nothing;
        };
        debug!(key = %key, outcome = %outcome, "Classified record");

        let report_entry = OutcomeEntry {
            key: key.to_string(),
            outcome,
            path: entry.display_path(),
        };
        if options.dry_run {
            return Processed::Done(report_entry);
        }

        match self.apply(&entry, outcome, &options.retry).await {
            Ok(()) => {
                if outcome != Outcome::SkipInSync {
                    info!(key = %key, outcome = %outcome, "Applied");
                }
                Processed::Done(report_entry)
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to reconcile record");
                let error = RecordError::new(Some(key.to_string()), entry.display_path(), &e);
                Processed::Failed(report_entry, error)
            }
        }
    }
}

//! execsync-core: reconciliation between an execution-system file tree and a
//! record store.
//!
//! This crate provides:
//! - Codecs for front-matter documents (projects, goals) and todo.txt-style context lists
//! - Content fingerprints and six-outcome change detection (last write wins, store takes ties)
//! - A reconciler that pairs files with stored records and applies outcomes
//! - FileSystem and RecordStore trait abstractions, with in-memory implementations

pub mod codec;
pub mod detect;
pub mod fingerprint;
pub mod fs;
pub mod layout;
pub mod reconcile;
pub mod record;
pub mod retry;
pub mod store;

pub use codec::ParseError;
pub use detect::{Direction, Outcome, classify};
pub use fingerprint::{ContentHash, Fingerprint};
pub use fs::{FileEntry, FileStat, FileSystem, FsError, InMemoryFs};
pub use reconcile::{
    ErrorKind, Reconciler, RecordError, RunReport, Summary, SyncError, SyncOptions,
};
pub use record::{Collection, Document, Folder, Payload, Record, RecordKey, StoredRecord, TaskItem};
pub use retry::RetryPolicy;
pub use store::{InMemoryStore, ListFilter, RecordStore, StoreError, StoreState};

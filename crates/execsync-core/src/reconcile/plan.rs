//! Key resolution: pairing files with stored records.
//!
//! Documents are matched in three passes, files in path order:
//! 1. the file sits at a stored record's fingerprinted path;
//! 2. the file's hash matches a stored record whose fingerprinted path is gone (a move);
//! 3. the derived key, suffixed `-2`, `-3`, … while taken.
//!
//! List items carry their key in the line (`id:`), so they only need
//! duplicate detection. Stored records no file claims become file creations.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};

use super::{RecordError, SyncError};
use crate::codec::{self, DecodedRecord, ParseError, unique_slug};
use crate::detect::{FileSide, StoreSide};
use crate::fingerprint::{ContentHash, Fingerprint, truncate_millis};
use crate::fs::FsError;
use crate::layout::{SourceFile, document_path, list_path};
use crate::record::{Collection, Record, RecordKey, RecordKind, StoredRecord};

/// A file read during enumeration.
pub(crate) struct LoadedFile {
    pub source: SourceFile,
    pub mtime: DateTime<Utc>,
    pub content: Result<Vec<u8>, FsError>,
}

/// The file side of a planned record.
#[derive(Debug, Clone)]
pub(crate) struct FileState {
    pub path: String,
    pub mtime: DateTime<Utc>,
    /// Hash of the whole file for documents, of the item line for list items.
    pub hash: String,
    /// Decoded record, keyed by the resolved key.
    pub record: Record,
    /// List item whose id is not yet written into its line.
    pub minted: bool,
    pub raw_line: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct PlanEntry {
    pub key: RecordKey,
    pub file: Option<FileState>,
    pub stored: Option<StoredRecord>,
    /// Where a file creation writes to.
    pub target_path: Option<String>,
}

impl PlanEntry {
    pub fn file_side(&self) -> Option<FileSide> {
        self.file.as_ref().map(|file| FileSide {
            path: file.path.clone(),
            mtime: file.mtime,
            hash: file.hash.clone(),
        })
    }

    pub fn store_side(&self) -> Option<StoreSide> {
        self.stored.as_ref().map(|stored| StoreSide {
            revision_time: truncate_millis(stored.revision_time),
        })
    }

    pub fn fingerprint(&self) -> Option<&Fingerprint> {
        self.stored.as_ref()?.fingerprint.as_ref()
    }

    /// Path to show in reports.
    pub fn display_path(&self) -> Option<String> {
        self.file
            .as_ref()
            .map(|file| file.path.clone())
            .or_else(|| self.target_path.clone())
    }
}

#[derive(Default)]
pub(crate) struct Plan {
    pub documents: Vec<PlanEntry>,
    pub items: Vec<PlanEntry>,
    pub errors: Vec<RecordError>,
}

/// Add one collection's files and stored records to the plan.
pub(crate) fn build(
    collection: Collection,
    files: Vec<LoadedFile>,
    stored: Vec<StoredRecord>,
    plan: &mut Plan,
) {
    match collection.kind() {
        RecordKind::Document => plan_documents(collection, files, stored, plan),
        RecordKind::ListItem => plan_items(files, stored, plan),
    }
}

/// A document file before its key is settled.
struct Candidate {
    path: String,
    mtime: DateTime<Utc>,
    hash: Option<String>,
    derived: String,
    decoded: Result<DecodedRecord, RecordError>,
}

fn load_candidate(file: LoadedFile) -> Candidate {
    let path = file.source.path.clone();
    let fallback_key = codec::document_key(&file.source.stem, None);

    let bytes = match file.content {
        Ok(bytes) => bytes,
        Err(e) => {
            return Candidate {
                decoded: Err(RecordError::new(None, Some(path.clone()), &SyncError::from(e))),
                path,
                mtime: file.mtime,
                hash: None,
                derived: fallback_key,
            };
        }
    };

    let hash = ContentHash::from_bytes(&bytes).into_string();
    let mut decoded = codec::decode_bytes(&bytes, &file.source);
    let (derived, decoded) = match (decoded.records.pop(), decoded.errors.pop()) {
        (Some(record), _) => (record.record.key.clone(), Ok(record)),
        (None, Some(error)) => (
            error.claimed_key.clone().unwrap_or_else(|| fallback_key.clone()),
            Err(RecordError::from_decode(&error, None)),
        ),
        (None, None) => (
            fallback_key,
            Err(RecordError::new(
                None,
                Some(path.clone()),
                &SyncError::Parse(ParseError::UnknownLayout),
            )),
        ),
    };

    Candidate {
        path,
        mtime: file.mtime,
        hash: Some(hash),
        derived,
        decoded,
    }
}

fn plan_documents(
    collection: Collection,
    files: Vec<LoadedFile>,
    stored: Vec<StoredRecord>,
    plan: &mut Plan,
) {
    let candidates: Vec<Candidate> = files.into_iter().map(load_candidate).collect();
    let existing: HashSet<String> = candidates.iter().map(|c| c.path.clone()).collect();

    let mut stored_by_key: BTreeMap<String, StoredRecord> = stored
        .into_iter()
        .map(|s| (s.record.key.clone(), s))
        .collect();
    let by_fingerprint_path: HashMap<String, String> = stored_by_key
        .values()
        .filter_map(|s| {
            s.fingerprint
                .as_ref()
                .map(|fp| (fp.file_path.clone(), s.record.key.clone()))
        })
        .collect();

    let mut keys: Vec<Option<String>> = vec![None; candidates.len()];
    let mut claimed: HashSet<String> = HashSet::new();

    for (i, candidate) in candidates.iter().enumerate() {
        if let Some(key) = by_fingerprint_path.get(&candidate.path) {
            if claimed.insert(key.clone()) {
                keys[i] = Some(key.clone());
            }
        }
    }

    for (i, candidate) in candidates.iter().enumerate() {
        let Some(hash) = candidate.hash.as_deref() else {
            continue;
        };
        if keys[i].is_some() {
            continue;
        }
        let moved = stored_by_key
            .values()
            .find(|s| {
                !claimed.contains(&s.record.key)
                    && s.fingerprint
                        .as_ref()
                        .is_some_and(|fp| fp.file_hash == hash && !existing.contains(&fp.file_path))
            })
            .map(|s| s.record.key.clone());
        if let Some(key) = moved {
            claimed.insert(key.clone());
            keys[i] = Some(key);
        }
    }

    for (i, candidate) in candidates.iter().enumerate() {
        if keys[i].is_some() {
            continue;
        }
        let key = unique_slug(&candidate.derived, |slug| {
            claimed.contains(slug)
                || stored_by_key
                    .get(slug)
                    .and_then(|s| s.fingerprint.as_ref())
                    .is_some_and(|fp| fp.file_path != candidate.path && existing.contains(&fp.file_path))
        });
        claimed.insert(key.clone());
        keys[i] = Some(key);
    }

    for (candidate, key) in candidates.into_iter().zip(keys) {
        let Some(key) = key else { continue };
        let record_key = RecordKey::new(collection, key.clone());
        let stored = stored_by_key.remove(&key);
        match candidate.decoded {
            Ok(decoded) => {
                let mut record = decoded.record;
                record.key = key;
                plan.documents.push(PlanEntry {
                    key: record_key,
                    file: Some(FileState {
                        path: candidate.path,
                        mtime: candidate.mtime,
                        hash: candidate.hash.unwrap_or_default(),
                        record,
                        minted: false,
                        raw_line: None,
                    }),
                    stored,
                    target_path: None,
                });
            }
            Err(mut error) => {
                error.key = Some(record_key.to_string());
                plan.errors.push(error);
            }
        }
    }

    let mut targets = existing;
    for (key, stored) in stored_by_key {
        let record_key = RecordKey::new(collection, key.clone());
        let Some(folder) = stored.record.as_document().map(|doc| doc.folder) else {
            continue;
        };
        if !collection.folders().contains(&folder) {
            let error = SyncError::Rejected(format!("{} has no {} folder", collection, folder));
            plan.errors.push(RecordError::new(Some(record_key.to_string()), None, &error));
            continue;
        }
        let stem = unique_slug(&key, |slug| {
            targets.contains(&document_path(collection, folder, slug))
        });
        let path = document_path(collection, folder, &stem);
        targets.insert(path.clone());
        plan.documents.push(PlanEntry {
            key: record_key,
            file: None,
            stored: Some(stored),
            target_path: Some(path),
        });
    }
}

fn is_valid_list_name(list: &str) -> bool {
    list.len() > 1 && list.starts_with('@') && !list.contains(['/', '\\'])
}

fn plan_items(files: Vec<LoadedFile>, stored: Vec<StoredRecord>, plan: &mut Plan) {
    let mut stored_by_key: BTreeMap<String, StoredRecord> = stored
        .into_iter()
        .map(|s| (s.record.key.clone(), s))
        .collect();
    let mut claimed: HashSet<String> = HashSet::new();
    // Files whose items could not be read at all; their stored items stay put.
    let mut unreadable: HashSet<String> = HashSet::new();

    for file in files {
        let path = file.source.path.clone();
        let bytes = match file.content {
            Ok(bytes) => bytes,
            Err(e) => {
                unreadable.insert(path.clone());
                plan.errors
                    .push(RecordError::new(None, Some(path), &SyncError::from(e)));
                continue;
            }
        };

        let decoded = codec::decode_bytes(&bytes, &file.source);
        for error in decoded.errors {
            let key = error.claimed_key.as_ref().map(|id| {
                claimed.insert(id.clone());
                stored_by_key.remove(id);
                RecordKey::new(Collection::Actions, id.clone()).to_string()
            });
            if error.line.is_none() {
                unreadable.insert(path.clone());
            }
            plan.errors.push(RecordError::from_decode(&error, key));
        }

        for decoded in decoded.records {
            let record_key = decoded.record.record_key();
            if !claimed.insert(decoded.record.key.clone()) {
                plan.errors.push(RecordError {
                    key: Some(record_key.to_string()),
                    path: Some(path.clone()),
                    line: decoded.line,
                    kind: super::ErrorKind::Parse,
                    message: ParseError::DuplicateId(decoded.record.key).to_string(),
                });
                continue;
            }
            let hash = ContentHash::from_content(decoded.raw_line.as_deref().unwrap_or_default())
                .into_string();
            plan.items.push(PlanEntry {
                stored: stored_by_key.remove(&record_key.key),
                key: record_key,
                file: Some(FileState {
                    path: path.clone(),
                    mtime: file.mtime,
                    hash,
                    record: decoded.record,
                    minted: decoded.minted,
                    raw_line: decoded.raw_line,
                }),
                target_path: None,
            });
        }
    }

    for (key, stored) in stored_by_key {
        let record_key = RecordKey::new(Collection::Actions, key);
        if stored
            .fingerprint
            .as_ref()
            .is_some_and(|fp| unreadable.contains(&fp.file_path))
        {
            continue;
        }
        let Some(list) = stored.record.as_task().map(|task| task.list.clone()) else {
            continue;
        };
        if !is_valid_list_name(&list) {
            let error = SyncError::Rejected(format!("invalid list name {:?}", list));
            plan.errors.push(RecordError::new(Some(record_key.to_string()), None, &error));
            continue;
        }
        plan.items.push(PlanEntry {
            key: record_key,
            file: None,
            stored: Some(stored),
            target_path: Some(list_path(&list)),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Document, DocumentDates, Folder, Payload};
    use chrono::TimeZone;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    fn loaded(path: &str, content: &str) -> LoadedFile {
        LoadedFile {
            source: SourceFile::from_path(path).unwrap(),
            mtime: at(1_000),
            content: Ok(content.as_bytes().to_vec()),
        }
    }

    fn stored_project(key: &str, fp: Option<(&str, &str)>) -> StoredRecord {
        StoredRecord {
            record: Record {
                collection: Collection::Projects,
                key: key.to_string(),
                payload: Payload::Document(Document {
                    title: key.to_string(),
                    area: None,
                    project_type: None,
                    folder: Folder::Active,
                    dates: DocumentDates::default(),
                    extra: serde_yaml::Mapping::new(),
                    body: String::new(),
                }),
            },
            revision_time: at(500),
            created_at: at(500),
            deleted: false,
            fingerprint: fp.map(|(path, hash)| Fingerprint {
                file_path: path.to_string(),
                file_mtime: at(500),
                file_hash: hash.to_string(),
                store_revision_time: at(500),
            }),
        }
    }

    fn keys(entries: &[PlanEntry]) -> Vec<(String, Option<String>)> {
        entries
            .iter()
            .map(|e| (e.key.key.clone(), e.display_path()))
            .collect()
    }

    #[test]
    fn test_colliding_slugs_get_suffixes() {
        let mut plan = Plan::default();
        build(
            Collection::Projects,
            vec![
                loaded("10k-projects/active/Learn Rust.md", "---\ntitle: Learn Rust\n---\n"),
                loaded("10k-projects/incubator/learn_rust.md", "---\ntitle: learn rust\n---\n"),
            ],
            Vec::new(),
            &mut plan,
        );
        assert_eq!(
            keys(&plan.documents),
            vec![
                ("learn-rust".to_string(), Some("10k-projects/active/Learn Rust.md".to_string())),
                ("learn-rust-2".to_string(), Some("10k-projects/incubator/learn_rust.md".to_string())),
            ]
        );
        assert_eq!(plan.documents[1].file.as_ref().unwrap().record.key, "learn-rust-2");
    }

    #[test]
    fn test_fingerprint_path_keeps_suffixed_key() {
        let mut plan = Plan::default();
        build(
            Collection::Projects,
            vec![
                loaded("10k-projects/active/Learn Rust.md", "a"),
                loaded("10k-projects/incubator/learn_rust.md", "b"),
            ],
            vec![
                stored_project("learn-rust", Some(("10k-projects/active/Learn Rust.md", "x"))),
                stored_project("learn-rust-2", Some(("10k-projects/incubator/learn_rust.md", "y"))),
            ],
            &mut plan,
        );
        let resolved = keys(&plan.documents);
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[1].0, "learn-rust-2");
        assert!(plan.documents.iter().all(|e| e.stored.is_some()));
    }

    #[test]
    fn test_moved_file_keeps_key_by_hash() {
        let content = "---\ntitle: Renamed Thing\n---\n";
        let hash = ContentHash::from_content(content).into_string();
        let mut plan = Plan::default();
        build(
            Collection::Projects,
            vec![loaded("10k-projects/completed/renamed-thing.md", content)],
            vec![stored_project("original", Some(("10k-projects/active/original.md", &hash)))],
            &mut plan,
        );
        assert_eq!(plan.documents.len(), 1);
        assert_eq!(plan.documents[0].key.key, "original");
        assert!(plan.documents[0].stored.is_some());
    }

    #[test]
    fn test_unclaimed_stored_record_becomes_file_creation() {
        let mut plan = Plan::default();
        build(
            Collection::Projects,
            vec![loaded("10k-projects/active/other.md", "x")],
            vec![
                stored_project("other", Some(("10k-projects/active/other.md", "h"))),
                stored_project("from-api", None),
            ],
            &mut plan,
        );
        let creation = plan
            .documents
            .iter()
            .find(|e| e.file.is_none())
            .unwrap();
        assert_eq!(creation.key.key, "from-api");
        assert_eq!(
            creation.target_path.as_deref(),
            Some("10k-projects/active/from-api.md")
        );
    }

    #[test]
    fn test_broken_document_protects_stored_record() {
        let mut plan = Plan::default();
        build(
            Collection::Projects,
            vec![loaded("10k-projects/active/broken.md", "---\ndue: whenever\n---\n")],
            vec![stored_project("broken", Some(("10k-projects/active/broken.md", "h")))],
            &mut plan,
        );
        assert!(plan.documents.is_empty());
        assert_eq!(plan.errors.len(), 1);
        assert_eq!(plan.errors[0].key.as_deref(), Some("projects/broken"));
    }

    #[test]
    fn test_duplicate_ids_across_lists() {
        let mut plan = Plan::default();
        build(
            Collection::Actions,
            vec![
                loaded("00k-next-actions/contexts/@home.md", "Fix tap id:t1\n"),
                loaded("00k-next-actions/contexts/@work.md", "Fix tap id:t1\nFile report id:t2\n"),
            ],
            Vec::new(),
            &mut plan,
        );
        assert_eq!(plan.items.len(), 2);
        assert_eq!(plan.errors.len(), 1);
        assert_eq!(plan.errors[0].path.as_deref(), Some("00k-next-actions/contexts/@work.md"));
        assert_eq!(plan.errors[0].line, Some(1));
    }

    #[test]
    fn test_unreadable_list_keeps_its_stored_items() {
        let mut plan = Plan::default();
        let mut stored = stored_project("t1", Some(("00k-next-actions/contexts/@home.md", "h")));
        stored.record = Record {
            collection: Collection::Actions,
            key: "t1".to_string(),
            payload: Payload::Task(codec::task_list::decode_line("Fix tap", "@home").unwrap().0),
        };
        build(
            Collection::Actions,
            vec![LoadedFile {
                source: SourceFile::from_path("00k-next-actions/contexts/@home.md").unwrap(),
                mtime: at(1_000),
                content: Err(FsError::Io("denied".to_string())),
            }],
            vec![stored],
            &mut plan,
        );
        assert!(plan.items.is_empty());
        assert_eq!(plan.errors.len(), 1);
    }
}

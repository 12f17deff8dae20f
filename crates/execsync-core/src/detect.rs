//! Change detection: which side of a record moves, if any.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::fingerprint::Fingerprint;

/// Result of classifying one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    CreateInStore,
    CreateAsFile,
    FileWinsUpdateStore,
    StoreWinsUpdateFile,
    SkipInSync,
    /// Reserved. The last-write-wins policy never produces it.
    ConflictUnresolved,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::CreateInStore => "create-in-store",
            Outcome::CreateAsFile => "create-as-file",
            Outcome::FileWinsUpdateStore => "file-wins-update-store",
            Outcome::StoreWinsUpdateFile => "store-wins-update-file",
            Outcome::SkipInSync => "skip-in-sync",
            Outcome::ConflictUnresolved => "conflict-unresolved",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side a forced reconciliation copies from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    FileToStore,
    StoreToFile,
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file-to-store" => Ok(Direction::FileToStore),
            "store-to-file" => Ok(Direction::StoreToFile),
            other => Err(format!(
                "unknown direction {:?} (expected file-to-store or store-to-file)",
                other
            )),
        }
    }
}

/// What the filesystem currently says about a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSide {
    pub path: String,
    pub mtime: DateTime<Utc>,
    pub hash: String,
}

/// What the store currently says about a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreSide {
    pub revision_time: DateTime<Utc>,
}

/// Last-write-wins; the store takes exact ties.
fn later_wins(file_mtime: DateTime<Utc>, revision_time: DateTime<Utc>) -> Outcome {
    if file_mtime > revision_time {
        Outcome::FileWinsUpdateStore
    } else {
        Outcome::StoreWinsUpdateFile
    }
}

/// Classify a record. Returns `None` when neither side has it.
///
/// The result depends only on the arguments. `force` overrides the comparison
/// when both sides exist; creation outcomes are never forced away.
pub fn classify(
    file: Option<&FileSide>,
    store: Option<&StoreSide>,
    fingerprint: Option<&Fingerprint>,
    force: Option<Direction>,
) -> Option<Outcome> {
    let (file, store) = match (file, store) {
        (None, None) => return None,
        (Some(_), None) => return Some(Outcome::CreateInStore),
        (None, Some(_)) => return Some(Outcome::CreateAsFile),
        (Some(file), Some(store)) => (file, store),
    };

    match force {
        Some(Direction::FileToStore) => return Some(Outcome::FileWinsUpdateStore),
        Some(Direction::StoreToFile) => return Some(Outcome::StoreWinsUpdateFile),
        None => {}
    }

    let Some(fp) = fingerprint else {
        if file.mtime == store.revision_time {
            return Some(Outcome::SkipInSync);
        }
        return Some(later_wins(file.mtime, store.revision_time));
    };

    let file_changed = file.hash != fp.file_hash || file.path != fp.file_path;
    let store_changed = store.revision_time != fp.store_revision_time;

    Some(match (file_changed, store_changed) {
        (false, false) => Outcome::SkipInSync,
        (true, false) => Outcome::FileWinsUpdateStore,
        (false, true) => Outcome::StoreWinsUpdateFile,
        (true, true) => later_wins(file.mtime, store.revision_time),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    fn file(mtime: i64, hash: &str) -> FileSide {
        FileSide {
            path: "10k-projects/active/x.md".to_string(),
            mtime: at(mtime),
            hash: hash.to_string(),
        }
    }

    fn store(rev: i64) -> StoreSide {
        StoreSide {
            revision_time: at(rev),
        }
    }

    fn fp(mtime: i64, hash: &str, rev: i64) -> Fingerprint {
        Fingerprint {
            file_path: "10k-projects/active/x.md".to_string(),
            file_mtime: at(mtime),
            file_hash: hash.to_string(),
            store_revision_time: at(rev),
        }
    }

    #[test]
    fn test_presence_cases() {
        assert_eq!(classify(None, None, None, None), None);
        assert_eq!(
            classify(Some(&file(1, "h")), None, None, None),
            Some(Outcome::CreateInStore)
        );
        assert_eq!(
            classify(None, Some(&store(1)), Some(&fp(1, "h", 1)), None),
            Some(Outcome::CreateAsFile)
        );
    }

    #[test]
    fn test_no_fingerprint_later_wins_tie_skips() {
        let f = file(2_000, "h");
        assert_eq!(
            classify(Some(&f), Some(&store(1_000)), None, None),
            Some(Outcome::FileWinsUpdateStore)
        );
        assert_eq!(
            classify(Some(&f), Some(&store(3_000)), None, None),
            Some(Outcome::StoreWinsUpdateFile)
        );
        assert_eq!(
            classify(Some(&f), Some(&store(2_000)), None, None),
            Some(Outcome::SkipInSync)
        );
    }

    #[test]
    fn test_fingerprint_truth_table() {
        let base = fp(1_000, "h", 1_000);
        let cases = [
            (file(1_000, "h"), store(1_000), Outcome::SkipInSync),
            (file(5_000, "h"), store(1_000), Outcome::SkipInSync),
            (file(5_000, "h2"), store(1_000), Outcome::FileWinsUpdateStore),
            (file(1_000, "h"), store(5_000), Outcome::StoreWinsUpdateFile),
            (file(6_000, "h2"), store(5_000), Outcome::FileWinsUpdateStore),
            (file(4_000, "h2"), store(5_000), Outcome::StoreWinsUpdateFile),
            (file(5_000, "h2"), store(5_000), Outcome::StoreWinsUpdateFile),
        ];
        for (f, s, expected) in cases {
            assert_eq!(
                classify(Some(&f), Some(&s), Some(&base), None),
                Some(expected),
                "file={:?} store={:?}",
                f,
                s
            );
        }
    }

    #[test]
    fn test_path_change_counts_as_file_change() {
        let mut moved = file(1_000, "h");
        moved.path = "10k-projects/completed/x.md".to_string();
        assert_eq!(
            classify(Some(&moved), Some(&store(1_000)), Some(&fp(1_000, "h", 1_000)), None),
            Some(Outcome::FileWinsUpdateStore)
        );
    }

    #[test]
    fn test_force_applies_only_when_both_exist() {
        let f = file(1_000, "h");
        let s = store(1_000);
        let base = fp(1_000, "h", 1_000);
        assert_eq!(
            classify(Some(&f), Some(&s), Some(&base), Some(Direction::FileToStore)),
            Some(Outcome::FileWinsUpdateStore)
        );
        assert_eq!(
            classify(Some(&f), Some(&s), None, Some(Direction::StoreToFile)),
            Some(Outcome::StoreWinsUpdateFile)
        );
        assert_eq!(
            classify(Some(&f), None, None, Some(Direction::StoreToFile)),
            Some(Outcome::CreateInStore)
        );
    }

    #[test]
    fn test_outcome_is_pure() {
        let f = file(7_000, "h2");
        let s = store(7_000);
        let base = fp(1_000, "h", 1_000);
        let first = classify(Some(&f), Some(&s), Some(&base), None);
        for _ in 0..10 {
            assert_eq!(classify(Some(&f), Some(&s), Some(&base), None), first);
        }
    }

    #[test]
    fn test_outcome_serializes_kebab_case() {
        let json = serde_json::to_string(&Outcome::FileWinsUpdateStore).unwrap();
        assert_eq!(json, "\"file-wins-update-store\"");
        assert_eq!("store-to-file".parse::<Direction>(), Ok(Direction::StoreToFile));
    }
}

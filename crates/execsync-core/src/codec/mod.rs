//! Text codec: front-matter documents and line-oriented task lists to and
//! from the neutral [`Record`] representation.
//!
//! Decoding never fails as a whole. Records that parse come back alongside
//! per-record [`DecodeError`]s for the ones that don't.

pub mod document;
pub mod slug;
pub mod task_list;

pub use slug::{slugify, unique_slug};

use thiserror::Error;

use crate::layout::SourceFile;
use crate::record::{Collection, Payload, Record};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ParseError {
    #[error("invalid {field} date: {value:?}")]
    InvalidDate { field: String, value: String },

    #[error("unknown project type: {0:?}")]
    UnknownType(String),

    #[error("malformed header line: {0:?}")]
    MalformedHeader(String),

    #[error("header field {0} must be a single value")]
    NonScalar(String),

    #[error("task line has no text")]
    EmptyText,

    #[error("invalid id: {0:?}")]
    InvalidId(String),

    #[error("id {0} appears more than once")]
    DuplicateId(String),

    #[error("file is not valid UTF-8")]
    InvalidUtf8,

    #[error("file is outside the known layout")]
    UnknownLayout,

    #[error("encode failed: {0}")]
    Encode(String),
}

pub type Result<T> = std::result::Result<T, ParseError>;

/// A record decoded from a file.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedRecord {
    /// Record keyed by its derived key (slug or list-item id).
    pub record: Record,
    /// 1-based line number, for list items.
    pub line: Option<usize>,
    /// Trimmed source line, for list items.
    pub raw_line: Option<String>,
    /// The list item had no `id:` token and was given a minted one.
    pub minted: bool,
}

/// A record that failed to decode.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeError {
    pub path: String,
    pub line: Option<usize>,
    /// Key the broken record still occupies, so nothing overwrites it.
    pub claimed_key: Option<String>,
    pub error: ParseError,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decoded {
    pub records: Vec<DecodedRecord>,
    pub errors: Vec<DecodeError>,
}

/// Key derived from a document's header or file name.
pub fn document_key(stem: &str, doc: Option<&crate::record::Document>) -> String {
    doc.and_then(document::slug_override)
        .map(|slug| slugify(&slug))
        .unwrap_or_else(|| slugify(stem))
}

/// Decode raw file bytes found at `source`.
pub fn decode_bytes(raw: &[u8], source: &SourceFile) -> Decoded {
    match std::str::from_utf8(raw) {
        Ok(text) => decode(text, source),
        Err(_) => Decoded {
            records: Vec::new(),
            errors: vec![DecodeError {
                path: source.path.clone(),
                line: None,
                claimed_key: match source.collection {
                    Collection::Actions => None,
                    _ => Some(document_key(&source.stem, None)),
                },
                error: ParseError::InvalidUtf8,
            }],
        },
    }
}

/// Decode the text of one file.
pub fn decode(raw: &str, source: &SourceFile) -> Decoded {
    match source.collection {
        Collection::Projects | Collection::Goals => decode_document(raw, source),
        Collection::Actions => decode_list(raw, source),
    }
}

fn decode_document(raw: &str, source: &SourceFile) -> Decoded {
    let error = |error| Decoded {
        records: Vec::new(),
        errors: vec![DecodeError {
            path: source.path.clone(),
            line: None,
            claimed_key: Some(document_key(&source.stem, None)),
            error,
        }],
    };

    let Some(folder) = source.folder else {
        return error(ParseError::UnknownLayout);
    };
    match document::decode(raw, &source.stem, folder) {
        Ok(doc) => Decoded {
            records: vec![DecodedRecord {
                record: Record {
                    collection: source.collection,
                    key: document_key(&source.stem, Some(&doc)),
                    payload: Payload::Document(doc),
                },
                line: None,
                raw_line: None,
                minted: false,
            }],
            errors: Vec::new(),
        },
        Err(e) => error(e),
    }
}

fn decode_list(raw: &str, source: &SourceFile) -> Decoded {
    let (lines, errors) = task_list::decode(raw, &source.path, &source.stem);
    Decoded {
        records: lines
            .into_iter()
            .map(|line| DecodedRecord {
                record: Record {
                    collection: Collection::Actions,
                    key: line.id,
                    payload: Payload::Task(line.task),
                },
                line: Some(line.line_no),
                raw_line: Some(line.raw),
                minted: line.minted,
            })
            .collect(),
        errors: errors
            .into_iter()
            .map(|e| DecodeError {
                path: source.path.clone(),
                line: Some(e.line_no),
                claimed_key: e.id,
                error: e.error,
            })
            .collect(),
    }
}

/// Encode a record to the text stored for it: a whole document, or one list line.
pub fn encode(record: &Record) -> Result<String> {
    match &record.payload {
        Payload::Document(doc) => document::encode(doc),
        Payload::Task(task) => Ok(task_list::encode_line(task, &record.key)),
    }
}

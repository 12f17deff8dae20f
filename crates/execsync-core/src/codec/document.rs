//! Front-matter documents (projects and goals).
//!
//! ```markdown
//! ---
//! area: Career
//! title: Learn Rust
//! type: standard
//! created: 2025-01-05
//! ---
//!
//! Body text, kept byte-for-byte.
//! ```

use chrono::NaiveDate;
use serde_yaml::{Mapping, Value};

use super::ParseError;
use crate::record::{Document, DocumentDates, Folder, ProjectType};

/// Known header keys, in the order they are written back.
pub const CANONICAL_ORDER: [&str; 9] = [
    "area",
    "title",
    "type",
    "created",
    "started",
    "last_reviewed",
    "due",
    "completed",
    "descoped",
];

/// Header key that overrides the file-stem-derived key.
pub const SLUG_KEY: &str = "slug";

/// Split a document into header YAML and body, without parsing the YAML.
///
/// Returns `(None, raw)` when there is no complete `---` block at the start.
pub fn split_frontmatter(raw: &str) -> (Option<&str>, &str) {
    if !raw.starts_with("---") {
        return (None, raw);
    }

    let after_opening = &raw[3..];
    let header_start = if let Some(rest) = after_opening.strip_prefix('\n') {
        rest
    } else if let Some(rest) = after_opening.strip_prefix("\r\n") {
        rest
    } else {
        return (None, raw);
    };

    match find_closing_delimiter(header_start) {
        Some(close_pos) => {
            let header = &header_start[..close_pos];
            let after_close = &header_start[close_pos + 3..];
            let body = after_close
                .strip_prefix("\r\n")
                .or_else(|| after_close.strip_prefix('\n'))
                .unwrap_or(after_close);
            (Some(header), body)
        }
        None => (None, raw),
    }
}

/// Byte offset of the closing `---` line.
fn find_closing_delimiter(s: &str) -> Option<usize> {
    let mut pos = 0;
    for line in s.split_inclusive('\n') {
        let trimmed = line.trim_end_matches(['\n', '\r']);
        if trimmed == "---" {
            return Some(pos);
        }
        pos += line.len();
    }
    None
}

/// Number of lines taken by a leading front-matter block, including both delimiters.
pub fn header_line_count(raw: &str) -> usize {
    match split_frontmatter(raw) {
        (Some(header), _) => header.lines().count() + 2,
        (None, _) => 0,
    }
}

/// Parse header text into an ordered mapping.
///
/// Falls back to one `key: value` per line when the header is not valid YAML.
fn parse_header(header: &str) -> Result<Mapping, ParseError> {
    match serde_yaml::from_str::<Value>(header) {
        Ok(Value::Mapping(map)) => return Ok(map),
        Ok(Value::Null) => return Ok(Mapping::new()),
        _ => {}
    }

    let mut map = Mapping::new();
    for line in header.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| ParseError::MalformedHeader(line.to_string()))?;
        let value = value.trim();
        let value = if value.is_empty() {
            Value::Null
        } else {
            Value::String(value.to_string())
        };
        map.insert(Value::String(key.trim().to_string()), value);
    }
    Ok(map)
}

fn scalar(field: &str, value: Value) -> Result<Option<String>, ParseError> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => Ok(Some(s.trim().to_string())),
        Value::Bool(b) => Ok(Some(b.to_string())),
        Value::Number(n) => Ok(Some(n.to_string())),
        Value::Tagged(tagged) => scalar(field, tagged.value),
        Value::Sequence(_) | Value::Mapping(_) => Err(ParseError::NonScalar(field.to_string())),
    }
}

/// Parse `YYYY-MM-DD`, tolerating a trailing time component.
pub fn parse_date(field: &str, value: &str) -> Result<NaiveDate, ParseError> {
    let invalid = || ParseError::InvalidDate {
        field: field.to_string(),
        value: value.to_string(),
    };
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Ok(date);
    }
    match (value.get(..10), value.get(10..11)) {
        (Some(prefix), Some("T" | " ")) => {
            NaiveDate::parse_from_str(prefix, "%Y-%m-%d").map_err(|_| invalid())
        }
        _ => Err(invalid()),
    }
}

fn take_date(map: &mut Mapping, field: &str) -> Result<Option<NaiveDate>, ParseError> {
    match map.remove(field) {
        Some(value) => match scalar(field, value)? {
            Some(s) => parse_date(field, &s).map(Some),
            None => Ok(None),
        },
        None => Ok(None),
    }
}

fn take_string(map: &mut Mapping, field: &str) -> Result<Option<String>, ParseError> {
    match map.remove(field) {
        Some(value) => scalar(field, value),
        None => Ok(None),
    }
}

/// Decode a document. `stem` supplies the default title, `folder` the status.
pub fn decode(raw: &str, stem: &str, folder: Folder) -> Result<Document, ParseError> {
    let (header, body) = split_frontmatter(raw);
    let mut map = match header {
        Some(header) => parse_header(header)?,
        None => Mapping::new(),
    };

    let title = take_string(&mut map, "title")?.unwrap_or_else(|| stem.to_string());
    let area = take_string(&mut map, "area")?;
    let project_type = match take_string(&mut map, "type")? {
        Some(value) => Some(ProjectType::parse(&value).ok_or(ParseError::UnknownType(value))?),
        None => None,
    };
    let dates = DocumentDates {
        created: take_date(&mut map, "created")?,
        started: take_date(&mut map, "started")?,
        last_reviewed: take_date(&mut map, "last_reviewed")?,
        due: take_date(&mut map, "due")?,
        completed: take_date(&mut map, "completed")?,
        descoped: take_date(&mut map, "descoped")?,
    };

    Ok(Document {
        title,
        area,
        project_type,
        folder,
        dates,
        extra: map,
        body: body.to_string(),
    })
}

/// Header `slug:` value, if the document carries one.
pub fn slug_override(doc: &Document) -> Option<String> {
    doc.extra
        .get(SLUG_KEY)
        .and_then(|value| scalar(SLUG_KEY, value.clone()).ok().flatten())
}

fn date_value(date: NaiveDate) -> Value {
    Value::String(date.format("%Y-%m-%d").to_string())
}

/// Encode a document as front matter plus body.
pub fn encode(doc: &Document) -> Result<String, ParseError> {
    let mut map = Mapping::new();
    let dates = &doc.dates;
    for key in CANONICAL_ORDER {
        let value = match key {
            "area" => doc.area.clone().map(Value::String),
            "title" => Some(Value::String(doc.title.clone())),
            "type" => doc.project_type.map(|t| Value::String(t.as_str().to_string())),
            "created" => dates.created.map(date_value),
            "started" => dates.started.map(date_value),
            "last_reviewed" => dates.last_reviewed.map(date_value),
            "due" => dates.due.map(date_value),
            "completed" => dates.completed.map(date_value),
            "descoped" => dates.descoped.map(date_value),
            _ => None,
        };
        if let Some(value) = value {
            map.insert(Value::String(key.to_string()), value);
        }
    }
    for (key, value) in &doc.extra {
        if !map.contains_key(key) {
            map.insert(key.clone(), value.clone());
        }
    }

    let yaml = serde_yaml::to_string(&map).map_err(|e| ParseError::Encode(e.to_string()))?;
    Ok(format!("---\n{}---\n{}", yaml, doc.body))
}

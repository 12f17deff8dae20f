//! Line-oriented context lists (next actions).
//!
//! One task per line, todo.txt style:
//!
//! ```text
//! x 2025-02-01 (A) 2025-01-20 Call the bank @phone +refinance due:2025-02-03 id:9f2c01ab44de
//! ```
//!
//! Blank lines, `#` lines and a leading front-matter block are not items and
//! are left untouched when a file is rewritten.

use chrono::NaiveDate;

use super::ParseError;
use super::document::{header_line_count, parse_date};
use crate::fingerprint::ContentHash;
use crate::record::TaskItem;

const ID_PREFIX: &str = "id:";
const MINTED_ID_LEN: usize = 12;

/// A decoded item line.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskLine {
    /// 1-based line number in the file.
    pub line_no: usize,
    /// Trimmed line text as found in the file.
    pub raw: String,
    /// Explicit `id:` token, or a minted id when the line has none.
    pub id: String,
    pub minted: bool,
    pub task: TaskItem,
}

/// A line that could not be decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct LineError {
    pub line_no: usize,
    /// Id the line still claims, when its `id:` token is readable.
    pub id: Option<String>,
    pub error: ParseError,
}

/// An item-bearing line with its resolved identity.
struct ItemLine<'a> {
    index: usize,
    text: &'a str,
    id: Result<String, ParseError>,
    minted: bool,
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// The line's `id:` token, validated.
fn explicit_id(line: &str) -> Option<Result<String, ParseError>> {
    let token = line
        .split_whitespace()
        .find_map(|token| token.strip_prefix(ID_PREFIX))?;
    if is_valid_id(token) {
        Some(Ok(token.to_string()))
    } else {
        Some(Err(ParseError::InvalidId(token.to_string())))
    }
}

/// Deterministic id for a line that has none yet.
///
/// `occurrence` counts earlier id-less lines in the same file with identical text.
pub fn mint_id(path: &str, line: &str, occurrence: usize) -> String {
    let hash = ContentHash::from_content(&format!("{}\n{}\n{}", path, line, occurrence));
    hash.as_str()[..MINTED_ID_LEN].to_string()
}

/// Every item-bearing line of `raw`, with explicit or minted ids.
fn item_lines<'a>(raw: &'a str, path: &str) -> Vec<ItemLine<'a>> {
    let skip = header_line_count(raw);
    let mut seen: Vec<&str> = Vec::new();
    let mut items = Vec::new();

    for (index, line) in raw.lines().enumerate().skip(skip) {
        let text = line.trim();
        if text.is_empty() || text.starts_with('#') {
            continue;
        }
        let (id, minted) = match explicit_id(text) {
            Some(id) => (id, false),
            None => {
                let occurrence = seen.iter().filter(|s| **s == text).count();
                seen.push(text);
                (Ok(mint_id(path, text, occurrence)), true)
            }
        };
        items.push(ItemLine {
            index,
            text,
            id,
            minted,
        });
    }
    items
}

fn parse_priority(token: &str) -> Option<char> {
    let inner = token.strip_prefix('(')?.strip_suffix(')')?;
    let mut chars = inner.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii_uppercase() => Some(c),
        _ => None,
    }
}

fn leading_date(token: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(token, "%Y-%m-%d").ok()
}

/// Split a `key:value` annotation. URLs and clock times are plain words.
fn annotation(token: &str) -> Option<(&str, &str)> {
    let (key, value) = token.split_once(':')?;
    let mut key_chars = key.chars();
    let key_ok = key_chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && key_chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if key_ok && !value.is_empty() && !value.starts_with('/') {
        Some((key, value))
    } else {
        None
    }
}

/// Decode one line. Returns the task and its explicit id, if any.
pub fn decode_line(line: &str, list: &str) -> Result<(TaskItem, Option<String>), ParseError> {
    let mut tokens = line.split_whitespace().peekable();
    let mut task = TaskItem {
        list: list.to_string(),
        done: false,
        done_on: None,
        priority: None,
        created: None,
        text: String::new(),
        contexts: Vec::new(),
        projects: Vec::new(),
        due: None,
        defer: None,
        extra: Vec::new(),
    };

    if tokens.peek() == Some(&"x") {
        tokens.next();
        task.done = true;
        if let Some(date) = tokens.peek().and_then(|t| leading_date(t)) {
            task.done_on = Some(date);
            tokens.next();
        }
    }
    if let Some(priority) = tokens.peek().and_then(|t| parse_priority(t)) {
        task.priority = Some(priority);
        tokens.next();
    }
    if let Some(date) = tokens.peek().and_then(|t| leading_date(t)) {
        task.created = Some(date);
        tokens.next();
    }

    let mut id = None;
    let mut words = Vec::new();
    for token in tokens {
        if token.len() > 1 && token.starts_with('@') {
            task.contexts.push(token.to_string());
        } else if token.len() > 1 && token.starts_with('+') {
            task.projects.push(token[1..].to_string());
        } else if let Some((key, value)) = annotation(token) {
            match key {
                "due" => task.due = Some(parse_date("due", value)?),
                "defer" => task.defer = Some(parse_date("defer", value)?),
                "created" => task.created = Some(parse_date("created", value)?),
                "id" => {
                    if id.is_some() || !is_valid_id(value) {
                        return Err(ParseError::InvalidId(value.to_string()));
                    }
                    id = Some(value.to_string());
                }
                _ => task.extra.push((key.to_string(), value.to_string())),
            }
        } else if token == ID_PREFIX {
            return Err(ParseError::InvalidId(String::new()));
        } else {
            words.push(token);
        }
    }

    if words.is_empty() {
        return Err(ParseError::EmptyText);
    }
    task.text = words.join(" ");
    Ok((task, id))
}

/// Encode a task as one line carrying `id:<id>`.
pub fn encode_line(task: &TaskItem, id: &str) -> String {
    let mut parts: Vec<String> = Vec::new();
    if task.done {
        parts.push("x".to_string());
        if let Some(date) = task.done_on {
            parts.push(date.to_string());
        }
    }
    if let Some(priority) = task.priority {
        parts.push(format!("({})", priority));
    }
    // A lone date after `x` reads back as the completion date.
    let created_inline = !(task.done && task.done_on.is_none());
    if let (Some(date), true) = (task.created, created_inline) {
        parts.push(date.to_string());
    }
    parts.push(task.text.clone());
    parts.extend(task.contexts.iter().cloned());
    parts.extend(task.projects.iter().map(|p| format!("+{}", p)));
    if let Some(date) = task.due {
        parts.push(format!("due:{}", date));
    }
    if let Some(date) = task.defer {
        parts.push(format!("defer:{}", date));
    }
    if let (Some(date), false) = (task.created, created_inline) {
        parts.push(format!("created:{}", date));
    }
    parts.extend(task.extra.iter().map(|(k, v)| format!("{}:{}", k, v)));
    parts.push(format!("{}{}", ID_PREFIX, id));
    parts.join(" ")
}

/// Append `id:<id>` to a line that has none.
pub fn with_id(line: &str, id: &str) -> String {
    format!("{} {}{}", line.trim_end(), ID_PREFIX, id)
}

/// Decode every item line of a list file.
pub fn decode(raw: &str, path: &str, list: &str) -> (Vec<TaskLine>, Vec<LineError>) {
    let mut lines: Vec<TaskLine> = Vec::new();
    let mut errors = Vec::new();

    for item in item_lines(raw, path) {
        let line_no = item.index + 1;
        let id = match item.id {
            Ok(id) => id,
            Err(error) => {
                errors.push(LineError {
                    line_no,
                    id: None,
                    error,
                });
                continue;
            }
        };
        if lines.iter().any(|l| l.id == id) {
            errors.push(LineError {
                line_no,
                id: None,
                error: ParseError::DuplicateId(id),
            });
            continue;
        }
        match decode_line(item.text, list) {
            Ok((task, _)) => lines.push(TaskLine {
                line_no,
                raw: item.text.to_string(),
                id,
                minted: item.minted,
                task,
            }),
            Err(error) => errors.push(LineError {
                line_no,
                id: (!item.minted).then_some(id),
                error,
            }),
        }
    }
    (lines, errors)
}

/// Replace (or remove, when `replacement` is `None`) the line holding `id`.
///
/// Returns `None` when no line carries that id. Line endings and all other
/// lines are preserved.
pub fn replace_line(raw: &str, path: &str, id: &str, replacement: Option<&str>) -> Option<String> {
    let target = item_lines(raw, path)
        .into_iter()
        .find(|item| item.id.as_deref().is_ok_and(|item_id| item_id == id))?
        .index;

    Some(rewrite_at(raw, target, replacement))
}

fn rewrite_at(raw: &str, target: usize, replacement: Option<&str>) -> String {
    let mut out = String::with_capacity(raw.len());
    for (index, line) in raw.split_inclusive('\n').enumerate() {
        if index != target {
            out.push_str(line);
            continue;
        }
        if let Some(replacement) = replacement {
            let ending = if line.ends_with("\r\n") {
                "\r\n"
            } else if line.ends_with('\n') {
                "\n"
            } else {
                ""
            };
            out.push_str(replacement);
            out.push_str(ending);
        }
    }
    out
}

/// Replace (or remove) the first line without an `id:` token whose text is `text`.
///
/// Lines with identical text are interchangeable, so any of them will do when
/// a minted id no longer resolves because an earlier twin was rewritten.
pub fn replace_unkeyed_line(raw: &str, text: &str, replacement: Option<&str>) -> Option<String> {
    let skip = header_line_count(raw);
    let target = raw
        .lines()
        .enumerate()
        .skip(skip)
        .find(|(_, line)| line.trim() == text && explicit_id(line).is_none())?
        .0;
    Some(rewrite_at(raw, target, replacement))
}

/// Append a line, adding a newline to the previous last line if it lacks one.
pub fn append_line(raw: &str, line: &str) -> String {
    let mut out = raw.to_string();
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(line);
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const PATH: &str = "00k-next-actions/contexts/@macbook.md";

    #[test]
    fn test_decode_line_components() {
        let (task, id) = decode_line(
            "(A) 2025-01-20 Call the bank @phone +refinance due:2025-02-03 energy:low id:abc123",
            "@macbook",
        )
        .unwrap();
        assert_eq!(task.priority, Some('A'));
        assert_eq!(task.created, NaiveDate::from_ymd_opt(2025, 1, 20));
        assert_eq!(task.text, "Call the bank");
        assert_eq!(task.contexts, vec!["@phone"]);
        assert_eq!(task.project_slug(), Some("refinance"));
        assert_eq!(task.due, NaiveDate::from_ymd_opt(2025, 2, 3));
        assert_eq!(task.extra, vec![("energy".to_string(), "low".to_string())]);
        assert_eq!(id.as_deref(), Some("abc123"));
        assert!(!task.done);
    }

    #[test]
    fn test_decode_done_line() {
        let (task, _) = decode_line("x 2025-02-01 2025-01-20 Renew passport", "@errands").unwrap();
        assert!(task.done);
        assert_eq!(task.done_on, NaiveDate::from_ymd_opt(2025, 2, 1));
        assert_eq!(task.created, NaiveDate::from_ymd_opt(2025, 1, 20));
    }

    #[test]
    fn test_urls_and_times_stay_in_text() {
        let (task, _) = decode_line("Read https://example.com at 10:30", "@home").unwrap();
        assert_eq!(task.text, "Read https://example.com at 10:30");
        assert!(task.extra.is_empty());
    }

    #[test]
    fn test_malformed_lines() {
        assert!(matches!(
            decode_line("Pay rent due:someday", "@home"),
            Err(ParseError::InvalidDate { .. })
        ));
        assert!(matches!(
            decode_line("@home +proj", "@home"),
            Err(ParseError::EmptyText)
        ));
        assert!(matches!(
            decode_line("Thing id:has/slash", "@home"),
            Err(ParseError::InvalidId(_))
        ));
    }

    #[test]
    fn test_line_round_trip() {
        for line in [
            "(B) 2025-01-01 Draft outline @macbook +book due:2025-03-01 defer:2025-02-01 id:a1",
            "x 2025-02-01 (A) 2025-01-20 Done thing id:a2",
            "Plain text only id:a3",
        ] {
            let (task, id) = decode_line(line, "@macbook").unwrap();
            let encoded = encode_line(&task, id.as_deref().unwrap());
            assert_eq!(encoded, line);
        }
    }

    #[test]
    fn test_done_without_completion_date_keeps_created() {
        let (mut task, _) = decode_line("2025-01-20 Finish report", "@work").unwrap();
        task.done = true;
        let encoded = encode_line(&task, "r1");
        let (back, _) = decode_line(&encoded, "@work").unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn test_decode_file_skips_non_items() {
        let raw = "---\ntitle: Macbook\n---\n# Next actions\n\nWrite tests id:t1\nbad due:nope\nWrite tests\n";
        let (lines, errors) = decode(raw, PATH, "@macbook");
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].id, "t1");
        assert_eq!(lines[0].line_no, 6);
        assert!(!lines[0].minted);
        assert!(lines[1].minted);
        assert_eq!(lines[1].line_no, 8);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].line_no, 7);
    }

    #[test]
    fn test_minted_ids_distinguish_duplicates() {
        let raw = "Water plants\nWater plants\n";
        let (lines, errors) = decode(raw, PATH, "@home");
        assert!(errors.is_empty());
        assert_eq!(lines.len(), 2);
        assert_ne!(lines[0].id, lines[1].id);

        let (again, _) = decode(raw, PATH, "@home");
        assert_eq!(again[0].id, lines[0].id);
    }

    #[test]
    fn test_duplicate_explicit_id_is_error() {
        let (lines, errors) = decode("One id:dup\nTwo id:dup\n", PATH, "@home");
        assert_eq!(lines.len(), 1);
        assert_eq!(errors[0].error, ParseError::DuplicateId("dup".to_string()));
    }

    #[test]
    fn test_replace_line_by_minted_and_explicit_id() {
        let raw = "# list\r\nFirst\r\nSecond id:s2\r\n";
        let (lines, _) = decode(raw, PATH, "@home");
        let minted = lines[0].id.clone();

        let rewritten = replace_line(raw, PATH, &minted, Some(&with_id("First", &minted))).unwrap();
        assert_eq!(rewritten, format!("# list\r\nFirst id:{}\r\nSecond id:s2\r\n", minted));

        let removed = replace_line(&rewritten, PATH, "s2", None).unwrap();
        assert_eq!(removed, format!("# list\r\nFirst id:{}\r\n", minted));

        assert!(replace_line(raw, PATH, "missing", None).is_none());
    }

    #[test]
    fn test_replace_unkeyed_line_picks_first_twin() {
        let raw = "Water plants id:w1\nWater plants\nWater plants\n";
        let out = replace_unkeyed_line(raw, "Water plants", Some("Water plants id:w2")).unwrap();
        assert_eq!(out, "Water plants id:w1\nWater plants id:w2\nWater plants\n");
        assert!(replace_unkeyed_line(raw, "Feed cat", None).is_none());
    }

    #[test]
    fn test_append_line() {
        assert_eq!(append_line("", "a id:1"), "a id:1\n");
        assert_eq!(append_line("x", "a id:1"), "x\na id:1\n");
        assert_eq!(append_line("x\n", "a id:1"), "x\na id:1\n");
    }
}

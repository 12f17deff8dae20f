//! Neutral record representation shared by the codec, the store and the reconciler.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::fingerprint::Fingerprint;

/// Which of the two text encodings a record lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// One record per file: front-matter header plus markdown body.
    Document,
    /// Many records per file: one task per line.
    ListItem,
}

/// Top-level record collections of an execution-system tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Projects,
    Goals,
    Actions,
}

impl Collection {
    pub const ALL: [Collection; 3] = [Collection::Projects, Collection::Goals, Collection::Actions];

    pub fn kind(self) -> RecordKind {
        match self {
            Collection::Projects | Collection::Goals => RecordKind::Document,
            Collection::Actions => RecordKind::ListItem,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Collection::Projects => "projects",
            Collection::Goals => "goals",
            Collection::Actions => "actions",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Collection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "projects" => Ok(Collection::Projects),
            "goals" => Ok(Collection::Goals),
            "actions" => Ok(Collection::Actions),
            other => Err(format!("unknown collection: {}", other)),
        }
    }
}

/// Fully-qualified record key: collection plus slug or list-item id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub collection: Collection,
    pub key: String,
}

impl RecordKey {
    pub fn new(collection: Collection, key: impl Into<String>) -> Self {
        Self {
            collection,
            key: key.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.key)
    }
}

impl FromStr for RecordKey {
    type Err = String;

    /// Parses `projects/learn-rust`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (collection, key) = s
            .split_once('/')
            .ok_or_else(|| format!("expected <collection>/<key>, got {}", s))?;
        if key.is_empty() {
            return Err(format!("empty key in {}", s));
        }
        Ok(Self::new(collection.parse()?, key))
    }
}

/// Folder a document lives in; doubles as its status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Folder {
    Active,
    Incubator,
    Completed,
    Descoped,
}

impl Folder {
    pub fn as_str(self) -> &'static str {
        match self {
            Folder::Active => "active",
            Folder::Incubator => "incubator",
            Folder::Completed => "completed",
            Folder::Descoped => "descoped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Folder::Active),
            "incubator" => Some(Folder::Incubator),
            "completed" => Some(Folder::Completed),
            "descoped" => Some(Folder::Descoped),
            _ => None,
        }
    }
}

impl fmt::Display for Folder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Project type from the `type:` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectType {
    Standard,
    Coordination,
    Habit,
    Goal,
}

impl ProjectType {
    pub fn as_str(self) -> &'static str {
        match self {
            ProjectType::Standard => "standard",
            ProjectType::Coordination => "coordination",
            ProjectType::Habit => "habit",
            ProjectType::Goal => "goal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" => Some(ProjectType::Standard),
            "coordination" => Some(ProjectType::Coordination),
            "habit" => Some(ProjectType::Habit),
            "goal" => Some(ProjectType::Goal),
            _ => None,
        }
    }
}

/// Calendar dates carried in a document header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentDates {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reviewed: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descoped: Option<NaiveDate>,
}

/// A project or goal: header fields plus markdown body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub project_type: Option<ProjectType>,
    pub folder: Folder,
    #[serde(default)]
    pub dates: DocumentDates,
    /// Header keys outside the schema, verbatim and in file order.
    #[serde(default, skip_serializing_if = "serde_yaml::Mapping::is_empty")]
    pub extra: serde_yaml::Mapping,
    #[serde(default)]
    pub body: String,
}

/// One line of a context list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskItem {
    /// Name of the list file the task belongs to, e.g. `@macbook`.
    pub list: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done_on: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<char>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<NaiveDate>,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contexts: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub projects: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defer: Option<NaiveDate>,
    /// Unrecognised `key:value` annotations, in line order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra: Vec<(String, String)>,
}

impl TaskItem {
    /// Slug of the linked project (first `+tag`), if any.
    pub fn project_slug(&self) -> Option<&str> {
        self.projects.first().map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    Document(Document),
    Task(TaskItem),
}

/// A record as seen by the engine, independent of where it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub collection: Collection,
    pub key: String,
    pub payload: Payload,
}

impl Record {
    pub fn record_key(&self) -> RecordKey {
        RecordKey::new(self.collection, self.key.clone())
    }

    pub fn kind(&self) -> RecordKind {
        self.collection.kind()
    }

    pub fn as_document(&self) -> Option<&Document> {
        match &self.payload {
            Payload::Document(doc) => Some(doc),
            Payload::Task(_) => None,
        }
    }

    pub fn as_task(&self) -> Option<&TaskItem> {
        match &self.payload {
            Payload::Task(task) => Some(task),
            Payload::Document(_) => None,
        }
    }
}

/// A record as held by the store, with its revision time and sync metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub record: Record,
    pub revision_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<Fingerprint>,
}

impl StoredRecord {
    pub fn record_key(&self) -> RecordKey {
        self.record.record_key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_key_parse_and_display() {
        let key: RecordKey = "projects/learn-rust".parse().unwrap();
        assert_eq!(key.collection, Collection::Projects);
        assert_eq!(key.key, "learn-rust");
        assert_eq!(key.to_string(), "projects/learn-rust");

        assert!("learn-rust".parse::<RecordKey>().is_err());
        assert!("widgets/x".parse::<RecordKey>().is_err());
        assert!("goals/".parse::<RecordKey>().is_err());
    }

    #[test]
    fn test_collection_kinds() {
        assert_eq!(Collection::Projects.kind(), RecordKind::Document);
        assert_eq!(Collection::Goals.kind(), RecordKind::Document);
        assert_eq!(Collection::Actions.kind(), RecordKind::ListItem);
    }

    #[test]
    fn test_project_type_parse_is_case_insensitive() {
        assert_eq!(ProjectType::parse("Habit"), Some(ProjectType::Habit));
        assert_eq!(ProjectType::parse("side-quest"), None);
    }
}

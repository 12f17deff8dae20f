//! Directory layout of an execution-system tree and the walker that enumerates it.
//!
//! ```text
//! 00k-next-actions/contexts/@<list>.md      one task per line
//! 10k-projects/<folder>/**/<slug>.md        one project per file
//! 30k-goals/<folder>/<slug>.md              one goal per file
//! ```

use tracing::debug;

use crate::fs::{FileStat, FileSystem, FsError, Result};
use crate::record::{Collection, Folder};

pub const PROJECTS_DIR: &str = "10k-projects";
pub const GOALS_DIR: &str = "30k-goals";
pub const ACTIONS_DIR: &str = "00k-next-actions/contexts";

const MARKDOWN_EXT: &str = ".md";

impl Collection {
    /// Directory holding this collection, relative to the source root.
    pub fn dir(self) -> &'static str {
        match self {
            Collection::Projects => PROJECTS_DIR,
            Collection::Goals => GOALS_DIR,
            Collection::Actions => ACTIONS_DIR,
        }
    }

    /// Status folders a document collection may use. Empty for list collections.
    pub fn folders(self) -> &'static [Folder] {
        match self {
            Collection::Projects => &[
                Folder::Active,
                Folder::Incubator,
                Folder::Completed,
                Folder::Descoped,
            ],
            Collection::Goals => &[Folder::Active, Folder::Incubator],
            Collection::Actions => &[],
        }
    }

    fn recursive(self) -> bool {
        matches!(self, Collection::Projects)
    }
}

/// Where a candidate file sits in the layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Path relative to the source root, `/`-separated.
    pub path: String,
    pub collection: Collection,
    /// Status folder, for documents.
    pub folder: Option<Folder>,
    /// File name without the `.md` extension.
    pub stem: String,
}

impl SourceFile {
    /// Classify a relative path. Returns `None` for paths outside the layout.
    pub fn from_path(path: &str) -> Option<Self> {
        let path = path.trim_matches('/');
        let file_name = path.rsplit('/').next()?;
        let stem = file_name.strip_suffix(MARKDOWN_EXT)?;
        if stem.is_empty() {
            return None;
        }

        if let Some(rest) = path.strip_prefix(ACTIONS_DIR).and_then(|r| r.strip_prefix('/')) {
            if rest.contains('/') || !stem.starts_with('@') {
                return None;
            }
            return Some(Self {
                path: path.to_string(),
                collection: Collection::Actions,
                folder: None,
                stem: stem.to_string(),
            });
        }

        for collection in [Collection::Projects, Collection::Goals] {
            let Some(rest) = path
                .strip_prefix(collection.dir())
                .and_then(|r| r.strip_prefix('/'))
            else {
                continue;
            };
            let (folder_name, inner) = rest.split_once('/')?;
            let folder = Folder::parse(folder_name)?;
            if !collection.folders().contains(&folder) {
                return None;
            }
            if inner.contains('/') && !collection.recursive() {
                return None;
            }
            return Some(Self {
                path: path.to_string(),
                collection,
                folder: Some(folder),
                stem: stem.to_string(),
            });
        }
        None
    }
}

/// Deterministic path for a document record.
pub fn document_path(collection: Collection, folder: Folder, key: &str) -> String {
    format!("{}/{}/{}{}", collection.dir(), folder, key, MARKDOWN_EXT)
}

/// Deterministic path for a context list such as `@macbook`.
pub fn list_path(list: &str) -> String {
    format!("{}/{}{}", ACTIONS_DIR, list, MARKDOWN_EXT)
}

/// Folder component of a document path, if it has one.
pub fn folder_of(path: &str) -> Option<Folder> {
    SourceFile::from_path(path).and_then(|source| source.folder)
}

/// A file found by the walker, with its stat metadata.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub source: SourceFile,
    pub stat: FileStat,
}

/// Enumerate every candidate file of `collection`, sorted by path.
///
/// Missing collection or folder directories are treated as empty.
pub async fn scan<F: FileSystem + ?Sized>(fs: &F, collection: Collection) -> Result<Vec<ScannedFile>> {
    let roots: Vec<String> = if collection.folders().is_empty() {
        vec![collection.dir().to_string()]
    } else {
        collection
            .folders()
            .iter()
            .map(|folder| format!("{}/{}", collection.dir(), folder))
            .collect()
    };

    let mut found = Vec::new();
    for root in roots {
        walk(fs, &root, collection.recursive(), &mut found).await?;
    }

    let mut scanned = Vec::with_capacity(found.len());
    for path in found {
        let Some(source) = SourceFile::from_path(&path) else {
            debug!(path = %path, "Ignoring file outside layout");
            continue;
        };
        let stat = fs.stat(&path).await?;
        scanned.push(ScannedFile { source, stat });
    }
    scanned.sort_by(|a, b| a.source.path.cmp(&b.source.path));
    Ok(scanned)
}

async fn walk<F: FileSystem + ?Sized>(
    fs: &F,
    dir: &str,
    recursive: bool,
    out: &mut Vec<String>,
) -> Result<()> {
    let entries = match fs.list(dir).await {
        Ok(entries) => entries,
        Err(FsError::NotFound(_)) => return Ok(()),
        Err(e) => return Err(e),
    };

    for entry in entries {
        if entry.name.starts_with('.') {
            continue;
        }
        let path = format!("{}/{}", dir, entry.name);
        if entry.is_dir {
            if recursive {
                Box::pin(walk(fs, &path, recursive, out)).await?;
            }
        } else if entry.name.ends_with(MARKDOWN_EXT) {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFs;

    #[test]
    fn test_source_file_classification() {
        let project = SourceFile::from_path("10k-projects/active/learn-rust.md").unwrap();
        assert_eq!(project.collection, Collection::Projects);
        assert_eq!(project.folder, Some(Folder::Active));
        assert_eq!(project.stem, "learn-rust");

        let nested = SourceFile::from_path("10k-projects/completed/2024/old.md").unwrap();
        assert_eq!(nested.folder, Some(Folder::Completed));

        let list = SourceFile::from_path("00k-next-actions/contexts/@macbook.md").unwrap();
        assert_eq!(list.collection, Collection::Actions);
        assert_eq!(list.stem, "@macbook");

        assert!(SourceFile::from_path("30k-goals/completed/x.md").is_none());
        assert!(SourceFile::from_path("30k-goals/active/sub/x.md").is_none());
        assert!(SourceFile::from_path("00k-next-actions/contexts/readme.md").is_none());
        assert!(SourceFile::from_path("10k-projects/active/notes.txt").is_none());
        assert!(SourceFile::from_path("README.md").is_none());
    }

    #[test]
    fn test_deterministic_paths_classify_back() {
        let path = document_path(Collection::Goals, Folder::Incubator, "run-marathon");
        assert_eq!(path, "30k-goals/incubator/run-marathon.md");
        assert_eq!(folder_of(&path), Some(Folder::Incubator));

        assert_eq!(list_path("@errands"), "00k-next-actions/contexts/@errands.md");
    }

    #[tokio::test]
    async fn test_scan_walks_layout() {
        let fs = InMemoryFs::new();
        fs.write("10k-projects/active/a.md", b"a").await.unwrap();
        fs.write("10k-projects/active/deep/b.md", b"b").await.unwrap();
        fs.write("10k-projects/descoped/c.md", b"c").await.unwrap();
        fs.write("10k-projects/active/.hidden.md", b"h").await.unwrap();
        fs.write("10k-projects/active/image.png", b"p").await.unwrap();
        fs.write("30k-goals/active/g.md", b"g").await.unwrap();
        fs.write("00k-next-actions/contexts/@home.md", b"t").await.unwrap();

        let projects = scan(&fs, Collection::Projects).await.unwrap();
        let paths: Vec<_> = projects.iter().map(|f| f.source.path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "10k-projects/active/a.md",
                "10k-projects/active/deep/b.md",
                "10k-projects/descoped/c.md",
            ]
        );

        assert_eq!(scan(&fs, Collection::Goals).await.unwrap().len(), 1);
        assert_eq!(scan(&fs, Collection::Actions).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_scan_missing_directories_is_empty() {
        let fs = InMemoryFs::new();
        assert!(scan(&fs, Collection::Projects).await.unwrap().is_empty());
    }
}

//! FileSystem trait abstraction for the source tree.
//!
//! Implementations:
//! - `InMemoryFs` - For testing (controllable mtimes and write failures)
//! - `NativeFs` (in the `execsync` crate) - Uses tokio::fs rooted at the source directory
//!
//! Paths are always relative to the source root and use `/` separators.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Is a directory: {0}")]
    IsDirectory(String),

    #[error("Path escapes source root: {0}")]
    OutsideRoot(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl FsError {
    /// Transient failures worth an immediate retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FsError::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, FsError>;

/// File metadata
#[derive(Debug, Clone)]
pub struct FileStat {
    /// Modification time in milliseconds since epoch
    pub mtime_millis: u64,
    /// File size in bytes
    pub size: u64,
    /// Whether this is a directory
    pub is_dir: bool,
}

impl FileStat {
    /// Modification time as a UTC timestamp (millisecond precision).
    pub fn modified(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.mtime_millis as i64)
            .single()
            .unwrap_or_default()
    }
}

/// Directory entry
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// File or directory name (not full path)
    pub name: String,
    /// Whether this is a directory
    pub is_dir: bool,
}

/// Platform-independent filesystem abstraction rooted at the source tree.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Read file contents
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Write file contents (creates parent directories if needed)
    async fn write(&self, path: &str, content: &[u8]) -> Result<()>;

    /// List directory contents
    async fn list(&self, path: &str) -> Result<Vec<FileEntry>>;

    /// Delete file or empty directory
    async fn delete(&self, path: &str) -> Result<()>;

    /// Check if path exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Get file metadata
    async fn stat(&self, path: &str) -> Result<FileStat>;

    /// Create directory (and parents if needed)
    async fn mkdir(&self, path: &str) -> Result<()>;
}

/// In-memory filesystem for testing
pub struct InMemoryFs {
    files: RwLock<HashMap<String, Vec<u8>>>,
    dirs: RwLock<HashSet<String>>,
    /// Tracks file modification times (path -> mtime in ms)
    mtimes: RwLock<HashMap<String, u64>>,
    /// Paths whose writes and deletes fail with an I/O error
    failing: RwLock<HashSet<String>>,
}

impl InMemoryFs {
    pub fn new() -> Self {
        let mut dirs = HashSet::new();
        dirs.insert(String::new()); // Root directory
        Self {
            files: RwLock::new(HashMap::new()),
            dirs: RwLock::new(dirs),
            mtimes: RwLock::new(HashMap::new()),
            failing: RwLock::new(HashSet::new()),
        }
    }

    /// Set a specific mtime for testing "latest wins" scenarios
    pub fn set_mtime(&self, path: &str, mtime: u64) {
        let path = Self::normalize_path(path);
        let mut mtimes = self.mtimes.write().unwrap_or_else(|e| e.into_inner());
        mtimes.insert(path, mtime);
    }

    /// Make every subsequent write or delete of `path` fail with an I/O error.
    pub fn fail_writes(&self, path: &str) {
        let path = Self::normalize_path(path);
        self.failing
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path);
    }

    /// Undo `fail_writes`.
    pub fn restore_writes(&self, path: &str) {
        let path = Self::normalize_path(path);
        self.failing
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&path);
    }

    /// Snapshot of every file, for before/after comparisons in tests.
    pub fn snapshot(&self) -> HashMap<String, Vec<u8>> {
        self.files.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn check_writable(&self, path: &str) -> Result<()> {
        if self
            .failing
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(path)
        {
            return Err(FsError::Io(format!("injected write failure: {}", path)));
        }
        Ok(())
    }

    fn current_time_ms() -> u64 {
        Utc::now().timestamp_millis().max(0) as u64
    }

    fn normalize_path(path: &str) -> String {
        path.trim_matches('/').to_string()
    }

    fn parent_path(path: &str) -> Option<String> {
        let normalized = Self::normalize_path(path);
        if normalized.is_empty() {
            None
        } else {
            match normalized.rfind('/') {
                Some(pos) => Some(normalized[..pos].to_string()),
                None => Some(String::new()),
            }
        }
    }
}

impl Default for InMemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileSystem for InMemoryFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let path = Self::normalize_path(path);
        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        files.get(&path).cloned().ok_or(FsError::NotFound(path))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let path = Self::normalize_path(path);

        self.check_writable(&path)?;
        if self
            .dirs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&path)
        {
            return Err(FsError::IsDirectory(path));
        }

        if let Some(parent) = Self::parent_path(&path) {
            self.mkdir(&parent).await?;
        }

        self.files
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.clone(), content.to_vec());

        let mut mtimes = self.mtimes.write().unwrap_or_else(|e| e.into_inner());
        mtimes.insert(path, Self::current_time_ms());
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let path = Self::normalize_path(path);
        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{}/", path)
        };

        let dirs = self.dirs.read().unwrap_or_else(|e| e.into_inner());
        if !dirs.contains(&path) {
            return Err(FsError::NotFound(path));
        }

        let mut entries = Vec::new();
        let mut seen = HashSet::new();

        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        for file_path in files.keys() {
            if let Some(rest) = file_path.strip_prefix(&prefix) {
                if !rest.contains('/') && seen.insert(rest.to_string()) {
                    entries.push(FileEntry {
                        name: rest.to_string(),
                        is_dir: false,
                    });
                }
            }
        }

        for dir_path in dirs.iter() {
            if let Some(rest) = dir_path.strip_prefix(&prefix) {
                if !rest.is_empty() && !rest.contains('/') && seen.insert(rest.to_string()) {
                    entries.push(FileEntry {
                        name: rest.to_string(),
                        is_dir: true,
                    });
                }
            }
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let path = Self::normalize_path(path);
        self.check_writable(&path)?;

        {
            let mut files = self.files.write().unwrap_or_else(|e| e.into_inner());
            if files.remove(&path).is_some() {
                self.mtimes
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&path);
                return Ok(());
            }
        }

        {
            let mut dirs = self.dirs.write().unwrap_or_else(|e| e.into_inner());
            if !path.is_empty() && dirs.remove(&path) {
                return Ok(());
            }
        }

        Err(FsError::NotFound(path))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let path = Self::normalize_path(path);
        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        let dirs = self.dirs.read().unwrap_or_else(|e| e.into_inner());
        Ok(files.contains_key(&path) || dirs.contains(&path))
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        let path = Self::normalize_path(path);

        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        if let Some(content) = files.get(&path) {
            let mtimes = self.mtimes.read().unwrap_or_else(|e| e.into_inner());
            let mtime = mtimes.get(&path).copied().unwrap_or(0);
            return Ok(FileStat {
                mtime_millis: mtime,
                size: content.len() as u64,
                is_dir: false,
            });
        }

        let dirs = self.dirs.read().unwrap_or_else(|e| e.into_inner());
        if dirs.contains(&path) {
            return Ok(FileStat {
                mtime_millis: 0,
                size: 0,
                is_dir: true,
            });
        }

        Err(FsError::NotFound(path))
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let path = Self::normalize_path(path);
        if path.is_empty() {
            return Ok(()); // Root always exists
        }

        if let Some(parent) = Self::parent_path(&path) {
            Box::pin(self.mkdir(&parent)).await?;
        }

        let mut dirs = self.dirs.write().unwrap_or_else(|e| e.into_inner());
        dirs.insert(path);
        Ok(())
    }
}

// Lets the reconciler and a test share one filesystem.
#[async_trait]
impl<T: FileSystem + ?Sized> FileSystem for std::sync::Arc<T> {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        (**self).read(path).await
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        (**self).write(path, content).await
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        (**self).list(path).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        (**self).delete(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        (**self).exists(path).await
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        (**self).stat(path).await
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        (**self).mkdir(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inmemory_fs_basic_operations() {
        let fs = InMemoryFs::new();

        fs.write("test.md", b"hello world").await.unwrap();

        let content = fs.read("test.md").await.unwrap();
        assert_eq!(content, b"hello world");

        assert!(fs.exists("test.md").await.unwrap());
        assert!(!fs.exists("nonexistent.md").await.unwrap());

        fs.delete("test.md").await.unwrap();
        assert!(!fs.exists("test.md").await.unwrap());
    }

    #[tokio::test]
    async fn test_inmemory_fs_directories() {
        let fs = InMemoryFs::new();

        fs.write("a/b/c.md", b"content").await.unwrap();

        assert!(fs.exists("a").await.unwrap());
        assert!(fs.exists("a/b").await.unwrap());

        let entries = fs.list("a").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "b");
        assert!(entries[0].is_dir);

        let entries = fs.list("a/b").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "c.md");
        assert!(!entries[0].is_dir);
    }

    #[tokio::test]
    async fn test_set_mtime_is_reported_by_stat() {
        let fs = InMemoryFs::new();
        fs.write("note.md", b"x").await.unwrap();
        fs.set_mtime("note.md", 1_700_000_000_123);

        let stat = fs.stat("note.md").await.unwrap();
        assert_eq!(stat.mtime_millis, 1_700_000_000_123);
        assert_eq!(stat.modified().timestamp_millis(), 1_700_000_000_123);
    }

    #[tokio::test]
    async fn test_injected_write_failure() {
        let fs = InMemoryFs::new();
        fs.fail_writes("locked.md");

        let err = fs.write("locked.md", b"x").await.unwrap_err();
        assert!(err.is_retryable());
        assert!(!fs.exists("locked.md").await.unwrap());

        fs.restore_writes("locked.md");
        fs.write("locked.md", b"x").await.unwrap();

        fs.fail_writes("locked.md");
        assert!(fs.delete("locked.md").await.unwrap_err().is_retryable());
        assert!(fs.exists("locked.md").await.unwrap());
    }
}

//! Native filesystem implementation using tokio::fs, rooted at the source tree.

use async_trait::async_trait;
use execsync_core::fs::{FileEntry, FileStat, FileSystem, FsError, Result};
use rand::Rng;
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs;

/// Native filesystem for the CLI. Every path is relative to `base_path`.
pub struct NativeFs {
    base_path: PathBuf,
}

fn io_error(path: &str, e: io::Error) -> FsError {
    match e.kind() {
        io::ErrorKind::NotFound => FsError::NotFound(path.to_string()),
        io::ErrorKind::AlreadyExists => FsError::AlreadyExists(path.to_string()),
        _ => FsError::Io(format!("{}: {}", path, e)),
    }
}

impl NativeFs {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn full_path(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(FsError::OutsideRoot(path.to_string()));
        }
        if path.is_empty() {
            Ok(self.base_path.clone())
        } else {
            Ok(self.base_path.join(relative))
        }
    }

    /// Sibling temp file for an atomic write.
    fn temp_path(full_path: &Path) -> PathBuf {
        let suffix: u64 = rand::rng().random();
        let name = full_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        full_path.with_file_name(format!(".{}.{:016x}.tmp", name, suffix))
    }
}

#[async_trait]
impl FileSystem for NativeFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full_path = self.full_path(path)?;
        fs::read(&full_path).await.map_err(|e| io_error(path, e))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let full_path = self.full_path(path)?;

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(path, e))?;
        }

        // Write beside the target and rename over it so readers never see a partial file
        let temp = Self::temp_path(&full_path);
        if let Err(e) = fs::write(&temp, content).await {
            let _ = fs::remove_file(&temp).await;
            return Err(io_error(path, e));
        }
        if let Err(e) = fs::rename(&temp, &full_path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(io_error(path, e));
        }
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let full_path = self.full_path(path)?;
        let mut entries = Vec::new();

        let mut dir = fs::read_dir(&full_path)
            .await
            .map_err(|e| io_error(path, e))?;

        while let Some(entry) = dir.next_entry().await.map_err(|e| io_error(path, e))? {
            let name = entry.file_name().to_string_lossy().to_string();
            let metadata = entry.metadata().await.map_err(|e| io_error(path, e))?;

            entries.push(FileEntry {
                name,
                is_dir: metadata.is_dir(),
            });
        }

        Ok(entries)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path)?;
        let metadata = fs::metadata(&full_path)
            .await
            .map_err(|e| io_error(path, e))?;

        let result = if metadata.is_dir() {
            fs::remove_dir(&full_path).await
        } else {
            fs::remove_file(&full_path).await
        };
        result.map_err(|e| io_error(path, e))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let full_path = self.full_path(path)?;
        fs::try_exists(&full_path)
            .await
            .map_err(|e| io_error(path, e))
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        let full_path = self.full_path(path)?;
        let metadata = fs::metadata(&full_path)
            .await
            .map_err(|e| io_error(path, e))?;

        let mtime_millis = metadata
            .modified()
            .map(|t| {
                t.duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0)
            })
            .unwrap_or(0);

        Ok(FileStat {
            mtime_millis,
            size: metadata.len(),
            is_dir: metadata.is_dir(),
        })
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path)?;
        fs::create_dir_all(&full_path)
            .await
            .map_err(|e| io_error(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_read_and_list() {
        let dir = TempDir::new().unwrap();
        let fs = NativeFs::new(dir.path().to_path_buf());

        fs.write("10k-projects/active/a.md", b"hello").await.unwrap();
        assert_eq!(fs.read("10k-projects/active/a.md").await.unwrap(), b"hello");
        assert!(fs.exists("10k-projects/active").await.unwrap());

        let entries = fs.list("10k-projects/active").await.unwrap();
        assert_eq!(entries.len(), 1, "temp files must not be left behind");
        assert_eq!(entries[0].name, "a.md");

        let stat = fs.stat("10k-projects/active/a.md").await.unwrap();
        assert_eq!(stat.size, 5);
        assert!(!stat.is_dir);
    }

    #[tokio::test]
    async fn test_missing_paths_are_not_found() {
        let dir = TempDir::new().unwrap();
        let fs = NativeFs::new(dir.path().to_path_buf());

        assert!(matches!(fs.read("nope.md").await, Err(FsError::NotFound(_))));
        assert!(matches!(fs.list("nope").await, Err(FsError::NotFound(_))));
        assert!(matches!(fs.delete("nope.md").await, Err(FsError::NotFound(_))));
        assert!(!fs.exists("nope.md").await.unwrap());
    }

    #[tokio::test]
    async fn test_paths_cannot_escape_root() {
        let dir = TempDir::new().unwrap();
        let fs = NativeFs::new(dir.path().join("root"));

        let result = fs.write("../outside.md", b"x").await;
        assert!(matches!(result, Err(FsError::OutsideRoot(_))));
        assert!(!dir.path().join("outside.md").exists());
    }
}

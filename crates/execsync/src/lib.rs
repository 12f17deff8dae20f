//! execsync library: the native side of the engine.
//!
//! A thin layer over execsync-core that adds the native filesystem, the JSON
//! file store and configuration, so the binary and integration tests share
//! one entry point.

pub mod config;
pub mod json_store;
pub mod native_fs;

pub use config::{Config, ConfigError};
pub use json_store::JsonFileStore;
pub use native_fs::NativeFs;

use execsync_core::detect::Direction;
use execsync_core::record::RecordKey;
use execsync_core::reconcile::{Reconciler, RunReport, SyncError, SyncOptions};
use execsync_core::store::RecordStore;
use std::path::Path;
use std::sync::Arc;

/// Parse a per-record override of the form `<collection>/<key>=<direction>`.
pub fn parse_override(s: &str) -> Result<(RecordKey, Direction), String> {
    let (key, direction) = s
        .split_once('=')
        .ok_or_else(|| format!("expected <collection>/<key>=<direction>, got {:?}", s))?;
    Ok((key.parse()?, direction.parse()?))
}

/// Reconcile the tree at `source` with `store` for one principal.
pub async fn sync_tree<S: RecordStore>(
    source: &Path,
    store: Arc<S>,
    principal: &str,
    options: &SyncOptions,
) -> Result<RunReport, SyncError> {
    if !source.is_dir() {
        return Err(SyncError::Configuration(format!(
            "source root {} is not a directory",
            source.display()
        )));
    }
    let fs = Arc::new(NativeFs::new(source.to_path_buf()));
    Reconciler::new(fs, store, principal).run(options).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use execsync_core::record::Collection;

    #[test]
    fn test_parse_override() {
        let (key, direction) = parse_override("projects/learn-rust=store-to-file").unwrap();
        assert_eq!(key, RecordKey::new(Collection::Projects, "learn-rust"));
        assert_eq!(direction, Direction::StoreToFile);

        assert!(parse_override("projects/learn-rust").is_err());
        assert!(parse_override("projects/learn-rust=sideways").is_err());
        assert!(parse_override("people/bob=file-to-store").is_err());
    }
}

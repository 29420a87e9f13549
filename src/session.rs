// SPDX-License-Identifier: MIT
//! Session-scoped cache directories.
//!
//! Every supervisor session gets its own subtree under the cache root so
//! concurrent sessions never share compilation caches or log directories.
//! Layout: `<cache_root>/<session_id>/{compilation-cache,logs,query-cache}`.

use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;
use uuid::Uuid;

/// Subdirectories created for every session.
const CACHE_SUBDIRS: [&str; 3] = ["compilation-cache", "logs", "query-cache"];

/// A session's identity and on-disk cache layout.
#[derive(Debug, Clone)]
pub struct Session {
    id: String,
    root: PathBuf,
}

impl Session {
    /// Create a session under `cache_root`, generating a UUID id when none
    /// is given, and create its cache subdirectories.
    pub fn new(cache_root: &Path, id: Option<String>) -> io::Result<Self> {
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let root = cache_root.join(&id);
        for subdir in CACHE_SUBDIRS {
            std::fs::create_dir_all(root.join(subdir))?;
        }
        debug!(session_id = %id, root = %root.display(), "session cache prepared");
        Ok(Self { id, root })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The session root, for `--common-caches`. Workers derive their
    /// compilation and query caches from subdirectories below it.
    pub fn cache_dir(&self) -> PathBuf {
        self.root.clone()
    }

    /// The log directory, for `--logdir`.
    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// The query result cache directory, for `--max-disk-cache` layouts.
    pub fn query_cache_dir(&self) -> PathBuf {
        self.root.join("query-cache")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_id_shapes_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let session = Session::new(tmp.path(), Some("s1".to_string())).unwrap();
        assert_eq!(session.id(), "s1");
        assert_eq!(session.cache_dir(), tmp.path().join("s1"));
        assert_eq!(session.log_dir(), tmp.path().join("s1/logs"));
        assert_eq!(session.query_cache_dir(), tmp.path().join("s1/query-cache"));
        for subdir in CACHE_SUBDIRS {
            assert!(session.cache_dir().join(subdir).is_dir());
        }
    }

    #[test]
    fn generated_ids_are_unique() {
        let tmp = tempfile::tempdir().unwrap();
        let a = Session::new(tmp.path(), None).unwrap();
        let b = Session::new(tmp.path(), None).unwrap();
        assert_ne!(a.id(), b.id());
        assert!(a.cache_dir().is_dir());
        assert!(b.cache_dir().is_dir());
    }

    #[test]
    fn same_id_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        Session::new(tmp.path(), Some("repeat".to_string())).unwrap();
        // Re-creating over existing directories must not fail.
        let again = Session::new(tmp.path(), Some("repeat".to_string())).unwrap();
        assert_eq!(again.id(), "repeat");
    }
}

//! Pixel data blob storage.
//!
//! The index stores metadata only;
//! the encoded data sets live in a blob store
//! addressed by paths relative to a configured root.
//! The filesystem implementation writes to a temporary file
//! and renames it into place, so readers never observe
//! a partially written instance.

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use snafu::{ensure, ResultExt};
use tracing::debug;

use crate::{BlobPathSnafu, BlobReadSnafu, BlobWriteSnafu, Result};

/// The blob location of one stored instance,
/// relative to the blob root.
pub fn instance_blob_path(study_uid: &str, series_uid: &str, sop_uid: &str) -> String {
    format!("{study_uid}/{series_uid}/{sop_uid}.dcm")
}

/// Storage of encoded data sets by relative path.
pub trait BlobStore: Send + Sync {
    /// Store a blob, replacing any previous content atomically.
    fn put(&self, path: &str, bytes: &[u8]) -> Result<()>;

    /// Read a blob back.
    fn get(&self, path: &str) -> Result<Vec<u8>>;

    /// Remove a blob; removing a missing blob is not an error.
    fn remove(&self, path: &str) -> Result<()>;
}

/// Filesystem-backed blob store.
#[derive(Debug)]
pub struct FileBlobStore {
    root: PathBuf,
    tmp_counter: AtomicU64,
}

impl FileBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> FileBlobStore {
        FileBlobStore {
            root: root.into(),
            tmp_counter: AtomicU64::new(0),
        }
    }

    /// The configured blob root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative blob path,
    /// refusing anything that would escape the root.
    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        let sane = !path.is_empty()
            && relative.is_relative()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        ensure!(sane, BlobPathSnafu { path });
        Ok(self.root.join(relative))
    }
}

impl BlobStore for FileBlobStore {
    fn put(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).context(BlobWriteSnafu { path })?;
        }

        // write-then-rename keeps the final path atomic
        let tmp = target.with_extension(format!(
            "tmp.{}",
            self.tmp_counter.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::write(&tmp, bytes).context(BlobWriteSnafu { path })?;
        std::fs::rename(&tmp, &target).context(BlobWriteSnafu { path })?;

        debug!("stored blob `{}` ({} bytes)", path, bytes.len());
        Ok(())
    }

    fn get(&self, path: &str) -> Result<Vec<u8>> {
        let target = self.resolve(path)?;
        std::fs::read(&target).context(BlobReadSnafu { path })
    }

    fn remove(&self, path: &str) -> Result<()> {
        let target = self.resolve(path)?;
        match std::fs::remove_file(&target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context(BlobWriteSnafu { path }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matches::matches;

    #[test]
    fn put_get_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::new(dir.path());

        let path = instance_blob_path("1.2.3", "1.2.3.1", "1.2.3.1.1");
        assert_eq!(path, "1.2.3/1.2.3.1/1.2.3.1.1.dcm");

        store.put(&path, b"dataset bytes").unwrap();
        assert_eq!(store.get(&path).unwrap(), b"dataset bytes");

        // no temporary files are left behind
        let entries: Vec<_> = std::fs::read_dir(dir.path().join("1.2.3/1.2.3.1"))
            .unwrap()
            .collect();
        assert_eq!(entries.len(), 1);

        store.remove(&path).unwrap();
        assert!(matches!(
            store.get(&path).unwrap_err(),
            crate::Error::BlobRead { .. }
        ));
        // idempotent
        store.remove(&path).unwrap();
    }

    #[test]
    fn put_replaces_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::new(dir.path());

        store.put("a/b.dcm", b"one").unwrap();
        store.put("a/b.dcm", b"two").unwrap();
        assert_eq!(store.get("a/b.dcm").unwrap(), b"two");
    }

    #[test]
    fn escaping_paths_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::new(dir.path());

        for path in ["../evil.dcm", "/etc/passwd", "a/../../evil", ""] {
            assert!(matches!(
                store.put(path, b"x").unwrap_err(),
                crate::Error::BlobPath { .. }
            ));
        }
    }
}

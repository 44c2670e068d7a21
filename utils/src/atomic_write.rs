//! Atomic file write helpers.
//!
//! Writes go to a temp file in the destination directory which is then
//! renamed over the target. Readers see either the old bytes or the new ones,
//! never a torn file. On Windows, rename-over-existing fails, so an existing
//! target is moved to `.bak` first and restored if the second rename fails.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use tempfile::NamedTempFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileSyncPolicy {
    SyncAll,
    SkipSync,
}

#[derive(Debug, Clone, Copy)]
pub struct AtomicWriteOptions {
    /// File sync policy for the temp file before persisting.
    pub file_sync: FileSyncPolicy,
    /// Create missing parent directories.
    pub create_parent: bool,
}

impl Default for AtomicWriteOptions {
    fn default() -> Self {
        Self {
            file_sync: FileSyncPolicy::SyncAll,
            create_parent: true,
        }
    }
}

/// Restore `path` from `path.bak` left behind by an interrupted write.
pub fn recover_bak_file(path: &Path) {
    let backup = path.with_extension("bak");
    if !path.exists() && backup.exists() {
        match fs::rename(&backup, path) {
            Ok(()) => {
                tracing::warn!(
                    path = %path.display(),
                    "Recovered .bak file from interrupted atomic write"
                );
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), "Failed to recover .bak file: {e}");
            }
        }
    }
}

pub fn atomic_write(path: impl AsRef<Path>, bytes: &[u8]) -> io::Result<()> {
    atomic_write_with_options(path, bytes, AtomicWriteOptions::default())
}

pub fn atomic_write_with_options(
    path: impl AsRef<Path>,
    bytes: &[u8],
    options: AtomicWriteOptions,
) -> io::Result<()> {
    let path = path.as_ref();
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    if options.create_parent {
        fs::create_dir_all(parent)?;
    }

    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    if options.file_sync == FileSyncPolicy::SyncAll {
        tmp.as_file().sync_all()?;
    }

    let Err(err) = tmp.persist(path) else {
        return Ok(());
    };
    if !path.exists() {
        return Err(err.error);
    }

    let backup = path.with_extension("bak");
    let _ = fs::remove_file(&backup);
    fs::rename(path, &backup)?;
    if let Err(retry) = err.file.persist(path) {
        let _ = fs::rename(&backup, path);
        return Err(retry.error);
    }
    if let Err(e) = fs::remove_file(&backup) {
        tracing::warn!(path = %backup.display(), "Failed to remove .bak after atomic write: {e}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    const FAST: AtomicWriteOptions = AtomicWriteOptions {
        file_sync: FileSyncPolicy::SkipSync,
        create_parent: true,
    };

    #[test]
    fn overwrites_existing_and_cleans_backup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("hover-cache-v1.json");

        atomic_write_with_options(&path, b"one", FAST).expect("write one");
        atomic_write_with_options(&path, b"two", FAST).expect("write two");

        assert_eq!(fs::read_to_string(&path).expect("read"), "two");
        assert!(!path.with_extension("bak").exists());
    }

    #[test]
    fn creates_missing_parent_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("lsp").join("nested").join("cache.json");
        atomic_write(&path, b"{}").expect("write");
        assert_eq!(fs::read(&path).expect("read"), b"{}");
    }

    #[test]
    fn missing_parent_is_an_error_when_not_created() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("absent").join("cache.json");
        let options = AtomicWriteOptions {
            create_parent: false,
            ..FAST
        };
        assert!(atomic_write_with_options(&path, b"{}", options).is_err());
    }

    #[test]
    fn recovers_interrupted_backup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cache.json");
        fs::write(path.with_extension("bak"), b"saved").expect("seed backup");

        recover_bak_file(&path);
        assert_eq!(fs::read(&path).expect("read"), b"saved");
        assert!(!path.with_extension("bak").exists());
    }
}

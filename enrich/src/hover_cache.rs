//! Disk-backed hover cache.
//!
//! One JSON file per cache root: `<cache_root>/lsp/hover-cache-v1.json`.
//! Loaded once at pipeline start, persisted once at the end when dirty.
//! Retention is by recency: the most recently written entries survive the cap.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use typelift_types::{Position, SignatureInfo};
use typelift_utils::{atomic_write, recover_bak_file};

pub const HOVER_CACHE_VERSION: u32 = 1;
pub const HOVER_CACHE_DIR: &str = "lsp";
pub const HOVER_CACHE_FILE: &str = "hover-cache-v1.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HoverCacheEntry {
    pub info: SignatureInfo,
    /// Unix millis of the last write or hit.
    pub at: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    key: String,
    value: HoverCacheEntry,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheFile {
    version: u32,
    #[serde(default)]
    generated_at: String,
    #[serde(default)]
    entries: Vec<StoredEntry>,
}

/// Cache key for one hover lookup. `None` without a document hash, since
/// the position would then be meaningless across runs.
#[must_use]
pub fn hover_cache_key(
    cmd: &str,
    language_id: &str,
    doc_hash: Option<&str>,
    symbol_name: &str,
    position: Position,
) -> Option<String> {
    let doc_hash = doc_hash.filter(|h| !h.is_empty())?;
    Some(format!(
        "{cmd}|{language_id}|{doc_hash}|{symbol_name}|{}",
        position.key()
    ))
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Default)]
pub struct HoverCache {
    path: Option<PathBuf>,
    max_entries: usize,
    entries: HashMap<String, HoverCacheEntry>,
    dirty: bool,
}

impl HoverCache {
    /// A cache that never touches disk.
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn path_for(cache_root: &Path) -> PathBuf {
        cache_root.join(HOVER_CACHE_DIR).join(HOVER_CACHE_FILE)
    }

    /// Load from `cache_root`. Missing, unreadable or foreign-version files
    /// start empty.
    pub async fn load(cache_root: Option<&Path>, max_entries: usize) -> Self {
        let Some(root) = cache_root else {
            return Self::disabled();
        };
        let path = Self::path_for(root);
        let mut cache = Self {
            path: Some(path.clone()),
            max_entries,
            entries: HashMap::new(),
            dirty: false,
        };
        let recover = path.clone();
        if let Err(err) = tokio::task::spawn_blocking(move || recover_bak_file(&recover)).await {
            tracing::warn!("hover cache recovery task failed: {err}");
        }
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return cache,
            Err(err) => {
                tracing::warn!(path = %path.display(), "hover cache unreadable: {err}");
                return cache;
            }
        };
        match serde_json::from_str::<CacheFile>(&raw) {
            Ok(file) if file.version == HOVER_CACHE_VERSION => {
                cache.entries = file
                    .entries
                    .into_iter()
                    .map(|entry| (entry.key, entry.value))
                    .collect();
                tracing::debug!(path = %path.display(), entries = cache.entries.len(), "hover cache loaded");
            }
            Ok(file) => {
                tracing::debug!(path = %path.display(), version = file.version, "ignoring hover cache from another version");
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), "hover cache is corrupt, starting empty: {err}");
            }
        }
        cache
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.path.is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Look up `key`, refreshing its recency on a hit.
    pub fn get(&mut self, key: &str) -> Option<SignatureInfo> {
        if !self.is_enabled() {
            return None;
        }
        let entry = self.entries.get_mut(key)?;
        entry.at = now_millis();
        self.dirty = true;
        Some(entry.info.clone())
    }

    pub fn insert(&mut self, key: String, info: SignatureInfo) {
        if !self.is_enabled() || info.is_empty() {
            return;
        }
        self.entries.insert(key, HoverCacheEntry { info, at: now_millis() });
        self.dirty = true;
    }

    /// Entries that survive the cap, most recent first.
    fn retained(&self) -> Vec<StoredEntry> {
        let mut entries: Vec<(&String, &HoverCacheEntry)> = self.entries.iter().collect();
        entries.sort_by(|a, b| b.1.at.cmp(&a.1.at).then_with(|| a.0.cmp(b.0)));
        entries
            .into_iter()
            .take(self.max_entries)
            .map(|(key, value)| StoredEntry {
                key: key.clone(),
                value: value.clone(),
            })
            .collect()
    }

    /// Write the cache when dirty. Returns whether a write happened.
    pub async fn persist(&mut self) -> io::Result<bool> {
        let Some(path) = self.path.clone() else {
            return Ok(false);
        };
        if !self.dirty {
            return Ok(false);
        }
        let file = CacheFile {
            version: HOVER_CACHE_VERSION,
            generated_at: chrono::Utc::now().to_rfc3339(),
            entries: self.retained(),
        };
        let count = file.entries.len();
        let bytes = serde_json::to_vec(&file).map_err(io::Error::other)?;
        let target = path.clone();
        tokio::task::spawn_blocking(move || atomic_write(&target, &bytes))
            .await
            .map_err(io::Error::other)??;
        self.dirty = false;
        tracing::debug!(path = %path.display(), entries = count, "hover cache persisted");
        Ok(true)
    }
}

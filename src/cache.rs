//! Shared file metadata cache.
//!
//! Reads go through an `RwLock` so concurrent lookups never wait on each
//! other. A refresh (miss or stale entry) first takes a per-key slot, so a
//! burst of requests for the same cold path costs a single `stat`: the
//! first caller refreshes, the rest wake up and reuse its entry. The cache
//! performs every `stat` the resolver needs, directories included.

use crate::response::get_mime_type;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use log::{debug, trace};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fs::{self, Metadata};
use std::hash::{Hash, Hasher};
use std::io;
use std::path::{Path, PathBuf};
#[cfg(test)]
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
    /// Sockets, FIFOs, devices: never served.
    Other,
}

impl FileKind {
    fn of(metadata: &Metadata) -> Self {
        if metadata.is_file() {
            FileKind::File
        } else if metadata.is_dir() {
            FileKind::Directory
        } else {
            FileKind::Other
        }
    }
}

/// A validated, stat'ed entry beneath the document root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFile {
    /// Canonical location, always inside the document root.
    pub path: PathBuf,
    pub kind: FileKind,
    pub len: u64,
    pub modified: SystemTime,
    pub content_type: &'static str,
    /// Quoted strong validator derived from path, size and mtime.
    pub etag: String,
}

impl ResolvedFile {
    pub fn from_metadata(path: PathBuf, metadata: &Metadata) -> io::Result<Self> {
        let modified = metadata.modified()?;
        let len = metadata.len();
        let etag = compute_etag(&path, len, modified);
        Ok(Self {
            content_type: get_mime_type(&path),
            kind: FileKind::of(metadata),
            path,
            len,
            modified,
            etag,
        })
    }

    /// Whether a fresh `stat` still describes this entry.
    pub fn matches(&self, metadata: &Metadata) -> bool {
        FileKind::of(metadata) == self.kind
            && metadata.len() == self.len
            && metadata.modified().ok() == Some(self.modified)
    }
}

/// Hashes path, size and modification time. Cheap, and changes whenever
/// either the size or the mtime does; file contents are never read.
pub fn compute_etag(path: &Path, len: u64, modified: SystemTime) -> String {
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    len.hash(&mut hasher);
    modified.hash(&mut hasher);
    format!("\"{}\"", URL_SAFE_NO_PAD.encode(hasher.finish().to_be_bytes()))
}

struct CacheEntry {
    file: Arc<ResolvedFile>,
    last_used: AtomicU64,
}

pub struct MetadataCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    refresh_slots: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    capacity: usize,
    clock: AtomicU64,
    #[cfg(test)]
    stat_calls: AtomicUsize,
    #[cfg(test)]
    refreshes: AtomicUsize,
}

impl MetadataCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            refresh_slots: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            clock: AtomicU64::new(0),
            #[cfg(test)]
            stat_calls: AtomicUsize::new(0),
            #[cfg(test)]
            refreshes: AtomicUsize::new(0),
        }
    }

    /// Returns metadata for `path`, cached under `key`.
    ///
    /// A hit is confirmed with a re-`stat`; if size and mtime are unchanged
    /// the cached entry (content type, ETag) is returned as is. Otherwise the
    /// entry is rebuilt under the key's refresh slot.
    pub fn get_or_refresh(&self, key: &str, path: &Path) -> io::Result<Arc<ResolvedFile>> {
        let cached = self.lookup(key);

        if let Some(file) = &cached {
            if file.path == path {
                let metadata = match self.stat(path) {
                    Ok(metadata) => metadata,
                    Err(e) => {
                        self.invalidate(key);
                        return Err(e);
                    }
                };
                if file.matches(&metadata) {
                    trace!("Metadata cache hit for '{key}'");
                    return Ok(Arc::clone(file));
                }
                debug!("Metadata for '{key}' is stale, refreshing");
            }
        }

        self.refresh(key, path, cached.as_ref())
    }

    /// Drops the entry for `key`, forcing the next lookup to re-stat.
    pub fn invalidate(&self, key: &str) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub(crate) fn stat_calls(&self) -> usize {
        self.stat_calls.load(Ordering::SeqCst)
    }

    fn stat(&self, path: &Path) -> io::Result<Metadata> {
        #[cfg(test)]
        self.stat_calls.fetch_add(1, Ordering::SeqCst);
        fs::metadata(path)
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn lookup(&self, key: &str) -> Option<Arc<ResolvedFile>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(key).map(|entry| {
            entry.last_used.store(self.tick(), Ordering::Relaxed);
            Arc::clone(&entry.file)
        })
    }

    fn refresh(
        &self,
        key: &str,
        path: &Path,
        seen: Option<&Arc<ResolvedFile>>,
    ) -> io::Result<Arc<ResolvedFile>> {
        let slot = self.slot_for(key);
        let result = {
            let _guard = slot.lock().unwrap_or_else(PoisonError::into_inner);

            // Someone else refreshed while we waited for the slot.
            match self.lookup(key) {
                Some(current)
                    if current.path == path
                        && seen.map_or(true, |seen| !Arc::ptr_eq(seen, &current)) =>
                {
                    trace!("Coalesced metadata refresh for '{key}'");
                    Ok(current)
                }
                _ => self.stat_and_store(key, path),
            }
        };
        self.release_slot(key, slot);
        result
    }

    fn stat_and_store(&self, key: &str, path: &Path) -> io::Result<Arc<ResolvedFile>> {
        #[cfg(test)]
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        let metadata = match self.stat(path) {
            Ok(metadata) => metadata,
            Err(e) => {
                self.invalidate(key);
                return Err(e);
            }
        };
        let file = Arc::new(ResolvedFile::from_metadata(path.to_path_buf(), &metadata)?);

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            key.to_string(),
            CacheEntry {
                file: Arc::clone(&file),
                last_used: AtomicU64::new(self.tick()),
            },
        );
        if entries.len() > self.capacity {
            self.evict(&mut entries);
        }
        Ok(file)
    }

    /// Evicts least recently used entries down to roughly 90% of capacity so
    /// eviction work is amortized over many inserts.
    fn evict(&self, entries: &mut HashMap<String, CacheEntry>) {
        let target = self.capacity - self.capacity / 10;
        let excess = entries.len().saturating_sub(target);
        if excess == 0 {
            return;
        }

        let mut by_age: Vec<(u64, String)> = entries
            .iter()
            .map(|(key, entry)| (entry.last_used.load(Ordering::Relaxed), key.clone()))
            .collect();
        by_age.sort_unstable_by_key(|(used, _)| *used);
        for (_, key) in by_age.into_iter().take(excess) {
            entries.remove(&key);
        }
        debug!("Evicted {excess} metadata cache entries");
    }

    fn slot_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut slots = self
            .refresh_slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(key.to_string()).or_default())
    }

    fn release_slot(&self, key: &str, slot: Arc<Mutex<()>>) {
        let mut slots = self
            .refresh_slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        drop(slot);
        // Clones are only made under this lock, so a count of one means nobody is waiting.
        if slots.get(key).is_some_and(|s| Arc::strong_count(s) == 1) {
            slots.remove(key);
        }
    }
}

use std::collections::HashMap;
use std::fs;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

/// Key/value cache for rendered reports. Implementations must be safe to
/// share between request handlers; correctness never depends on a hit.
pub trait Cache: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    /// Stores `value`; `ttl` of `None` uses the backend default.
    fn set(&self, key: &str, value: String, ttl: Option<Duration>);
    fn delete(&self, key: &str) -> bool;
    fn clear(&self);
    /// Drops expired entries and returns how many were removed.
    fn sweep(&self) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CacheBackend {
    /// Entries live as files under the cache directory and are shared by
    /// every run pointed at it.
    File,
    /// Entries live for the current process only.
    Memory,
}

pub fn open_cache(backend: CacheBackend, dir: &Path, default_ttl: Duration) -> io::Result<Box<dyn Cache>> {
    Ok(match backend {
        CacheBackend::File => Box::new(FileCache::open(dir, default_ttl)?),
        CacheBackend::Memory => Box::new(InMemoryCache::new(default_ttl)),
    })
}

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Instant,
}

/// Single-process backend with per-entry expiry. Expired entries are never
/// returned; `sweep` reclaims their memory.
#[derive(Debug)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
    default_ttl: Duration,
}

impl InMemoryCache {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            default_ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Cache for InMemoryCache {
    fn get(&self, key: &str) -> Option<String> {
        let entries = self.lock();
        entries
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.value.clone())
    }

    fn set(&self, key: &str, value: String, ttl: Option<Duration>) {
        let expires_at = Instant::now() + ttl.unwrap_or(self.default_ttl);
        self.lock().insert(key.to_string(), Entry { value, expires_at });
    }

    fn delete(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    fn clear(&self) {
        self.lock().clear();
    }

    fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "swept expired cache entries");
        }
        removed
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    key: String,
    /// Unix seconds.
    expires_at: i64,
    value: String,
}

/// One JSON file per key under `dir`. Entries outlive the process, so
/// repeated runs within the TTL reuse what an earlier run computed.
#[derive(Debug)]
pub struct FileCache {
    dir: PathBuf,
    default_ttl: Duration,
}

impl FileCache {
    pub fn open(dir: impl Into<PathBuf>, default_ttl: Duration) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, default_ttl })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let stem: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '@') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{stem}.json"))
    }

    fn read(path: &Path) -> Option<StoredEntry> {
        let raw = fs::read_to_string(path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(entry) => Some(entry),
            Err(err) => {
                debug!(path = %path.display(), error = %err, "unreadable cache entry");
                None
            }
        }
    }

    fn entry_paths(&self) -> Vec<PathBuf> {
        let Ok(listing) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        listing
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect()
    }

    fn write(&self, path: &Path, entry: &StoredEntry) -> io::Result<()> {
        let raw = serde_json::to_string(entry)?;
        // Readers in other processes must never see a half-written file.
        let staging = self.dir.join(format!("{}.tmp", Uuid::new_v4()));
        fs::write(&staging, raw)?;
        fs::rename(&staging, path)
    }
}

fn unix_now() -> i64 {
    Utc::now().timestamp()
}

impl Cache for FileCache {
    fn get(&self, key: &str) -> Option<String> {
        let entry = Self::read(&self.path_for(key))?;
        (entry.key == key && entry.expires_at > unix_now()).then_some(entry.value)
    }

    fn set(&self, key: &str, value: String, ttl: Option<Duration>) {
        let ttl_secs = i64::try_from(ttl.unwrap_or(self.default_ttl).as_secs()).unwrap_or(i64::MAX);
        let entry = StoredEntry {
            key: key.to_string(),
            expires_at: unix_now().saturating_add(ttl_secs),
            value,
        };
        if let Err(err) = self.write(&self.path_for(key), &entry) {
            warn!(key, error = %err, "failed to store cache entry");
        }
    }

    fn delete(&self, key: &str) -> bool {
        let path = self.path_for(key);
        Self::read(&path).is_some_and(|entry| entry.key == key) && fs::remove_file(&path).is_ok()
    }

    fn clear(&self) {
        for path in self.entry_paths() {
            if let Err(err) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %err, "failed to remove cache entry");
            }
        }
    }

    fn sweep(&self) -> usize {
        let now = unix_now();
        let removed = self
            .entry_paths()
            .into_iter()
            .filter(|path| Self::read(path).map_or(true, |entry| entry.expires_at <= now))
            .filter(|path| fs::remove_file(path).is_ok())
            .count();
        if removed > 0 {
            debug!(removed, dir = %self.dir.display(), "swept expired cache entries");
        }
        removed
    }
}

/// Returns the cached value for `key`, computing and storing it on a miss.
/// Failed computations are not cached.
pub async fn get_or_compute<F, Fut, E>(cache: &dyn Cache, key: &str, compute: F) -> Result<String, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<String, E>>,
{
    if let Some(hit) = cache.get(key) {
        debug!(key, "cache hit");
        return Ok(hit);
    }
    let value = compute().await?;
    cache.set(key, value.clone(), None);
    Ok(value)
}

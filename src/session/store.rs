//! Session Stores
//!
//! Persistence for pause snapshots behind the [`SessionStore`] trait.
//!
//! Stores treat expired snapshots as absent. [`SessionStore::take`] must be
//! atomic per token: of two concurrent resumes of the same token, at most one
//! receives the snapshot.
//!
//! # Implementations
//!
//! - [`InMemorySessionStore`]: a mutex-guarded map, for tests and
//!   single-process hosts
//! - [`FileSessionStore`]: one JSON file per token; claims use an atomic
//!   rename

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::error::{EngineError, Result};

use super::snapshot::{expiry, PauseSnapshot};

/// Key-value persistence for pause snapshots.
pub trait SessionStore: Send + Sync {
    fn get(&self, token: &str) -> Result<Option<PauseSnapshot>>;

    /// Stores a snapshot; with a TTL the stored copy expires at `now + ttl`.
    fn set(&self, token: &str, snapshot: &PauseSnapshot, ttl: Option<Duration>) -> Result<()>;

    /// Returns true if a snapshot was removed.
    fn delete(&self, token: &str) -> Result<bool>;

    /// Refreshes the access time and, with a TTL, the expiry.
    fn touch(&self, _token: &str, _ttl: Option<Duration>) -> Result<bool> {
        Ok(false)
    }

    /// Removes expired snapshots and returns how many were removed.
    fn sweep(&self) -> Result<usize> {
        Ok(0)
    }

    /// Removes and returns a snapshot.
    ///
    /// The default is `get` followed by `delete`, which is not atomic;
    /// stores shared between concurrent resumers must override it.
    fn take(&self, token: &str) -> Result<Option<PauseSnapshot>> {
        let snapshot = self.get(token)?;
        if snapshot.is_some() {
            self.delete(token)?;
        }
        Ok(snapshot)
    }

    /// Finds the token of the most recent live snapshot with this resume key.
    fn lookup_resume_key(&self, _key: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

fn stamped(snapshot: &PauseSnapshot, ttl: Option<Duration>) -> PauseSnapshot {
    let mut stored = snapshot.clone();
    if let Some(ttl) = ttl {
        stored.expires_at = expiry(Utc::now(), ttl);
    }
    stored
}

/// Picks the newest live snapshot carrying `key`.
fn newest_with_key<'a>(snapshots: impl Iterator<Item = &'a PauseSnapshot>, key: &str) -> Option<String> {
    let now = Utc::now();
    snapshots
        .filter(|s| s.resume_key.as_deref() == Some(key) && !s.is_expired_at(now))
        .max_by_key(|s| s.created_at)
        .map(|s| s.token.clone())
}

/// Snapshots held in process memory.
#[derive(Default)]
pub struct InMemorySessionStore {
    snapshots: Mutex<HashMap<String, PauseSnapshot>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.lock().is_empty()
    }
}

impl SessionStore for InMemorySessionStore {
    fn get(&self, token: &str) -> Result<Option<PauseSnapshot>> {
        let mut snapshots = self.snapshots.lock();
        match snapshots.get(token) {
            Some(s) if s.is_expired() => {
                debug!("Snapshot '{}' expired", token);
                snapshots.remove(token);
                Ok(None)
            }
            other => Ok(other.cloned()),
        }
    }

    fn set(&self, token: &str, snapshot: &PauseSnapshot, ttl: Option<Duration>) -> Result<()> {
        self.snapshots
            .lock()
            .insert(token.to_string(), stamped(snapshot, ttl));
        debug!("Stored snapshot '{}'", token);
        Ok(())
    }

    fn delete(&self, token: &str) -> Result<bool> {
        Ok(self.snapshots.lock().remove(token).is_some())
    }

    fn touch(&self, token: &str, ttl: Option<Duration>) -> Result<bool> {
        let mut snapshots = self.snapshots.lock();
        match snapshots.get_mut(token) {
            Some(s) if !s.is_expired() => {
                s.touch(ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn sweep(&self) -> Result<usize> {
        let now = Utc::now();
        let mut snapshots = self.snapshots.lock();
        let before = snapshots.len();
        snapshots.retain(|_, s| !s.is_expired_at(now));
        let removed = before - snapshots.len();
        if removed > 0 {
            info!("Swept {} expired snapshots", removed);
        }
        Ok(removed)
    }

    fn take(&self, token: &str) -> Result<Option<PauseSnapshot>> {
        let taken = self.snapshots.lock().remove(token);
        Ok(taken.filter(|s| !s.is_expired()))
    }

    fn lookup_resume_key(&self, key: &str) -> Result<Option<String>> {
        Ok(newest_with_key(self.snapshots.lock().values(), key))
    }
}

/// One `<token>.json` file per snapshot under a directory.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    /// Opens a store, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        info!("Opened session store at {}", dir.display());
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File name for a token. Tokens outside `[A-Za-z0-9_-]` are hex encoded.
    fn path_for(&self, token: &str) -> PathBuf {
        let safe = !token.is_empty()
            && token
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        let name = if safe {
            token.to_string()
        } else {
            let hex: String = token.bytes().map(|b| format!("{:02x}", b)).collect();
            format!("x_{}", hex)
        };
        self.dir.join(format!("{}.json", name))
    }

    fn read(path: &Path) -> Result<Option<PauseSnapshot>> {
        match fs::read_to_string(path) {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, path: &Path, snapshot: &PauseSnapshot) -> Result<()> {
        let tmp = self
            .dir
            .join(format!(".{}.tmp", uuid::Uuid::new_v4()));
        let text = serde_json::to_string_pretty(snapshot)?;
        fs::write(&tmp, text)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn remove(path: &Path) -> Result<bool> {
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn snapshot_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                files.push(path);
            }
        }
        Ok(files)
    }
}

impl SessionStore for FileSessionStore {
    fn get(&self, token: &str) -> Result<Option<PauseSnapshot>> {
        let path = self.path_for(token);
        match Self::read(&path)? {
            Some(s) if s.is_expired() => {
                debug!("Snapshot '{}' expired", token);
                Self::remove(&path)?;
                Ok(None)
            }
            other => Ok(other),
        }
    }

    fn set(&self, token: &str, snapshot: &PauseSnapshot, ttl: Option<Duration>) -> Result<()> {
        let path = self.path_for(token);
        self.write(&path, &stamped(snapshot, ttl))?;
        debug!("Stored snapshot '{}' at {}", token, path.display());
        Ok(())
    }

    fn delete(&self, token: &str) -> Result<bool> {
        Self::remove(&self.path_for(token))
    }

    fn touch(&self, token: &str, ttl: Option<Duration>) -> Result<bool> {
        let path = self.path_for(token);
        match Self::read(&path)? {
            Some(mut s) if !s.is_expired() => {
                s.touch(ttl);
                self.write(&path, &s)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn sweep(&self) -> Result<usize> {
        let now = Utc::now();
        let mut removed = 0;
        for path in self.snapshot_files()? {
            match Self::read(&path) {
                Ok(Some(s)) if s.is_expired_at(now) => {
                    if Self::remove(&path)? {
                        removed += 1;
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("Skipping unreadable snapshot {}: {}", path.display(), e),
            }
        }
        if removed > 0 {
            info!("Swept {} expired snapshots from {}", removed, self.dir.display());
        }
        Ok(removed)
    }

    fn take(&self, token: &str) -> Result<Option<PauseSnapshot>> {
        let path = self.path_for(token);
        let claimed = self
            .dir
            .join(format!(".{}.claimed", uuid::Uuid::new_v4()));
        match fs::rename(&path, &claimed) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(EngineError::Store(format!("Failed to claim '{}': {}", token, e))),
        }
        let read = Self::read(&claimed);
        Self::remove(&claimed)?;
        let snapshot = read.map_err(|e| {
            warn!("Discarded unreadable snapshot '{}': {}", token, e);
            e
        })?;
        Ok(snapshot.filter(|s| !s.is_expired()))
    }

    fn lookup_resume_key(&self, key: &str) -> Result<Option<String>> {
        let mut snapshots = Vec::new();
        for path in self.snapshot_files()? {
            if let Ok(Some(s)) = Self::read(&path) {
                snapshots.push(s);
            }
        }
        Ok(newest_with_key(snapshots.iter(), key))
    }
}

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use tokio::time::Instant;
use tracing::debug;
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedFile {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub created_at: Instant,
    pub last_touched_at: Instant,
    /// Pinned files are still being delivered and are never swept.
    pub pinned: bool,
}

impl TrackedFile {
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }
}

/// Every file the gateway has produced and not yet deleted.
///
/// All mutations go through one mutex that is never held across an await, so
/// sweeps and job registrations interleave safely.
#[derive(Debug, Clone, Default)]
pub struct FileRegistry {
    files: Arc<Mutex<HashMap<PathBuf, TrackedFile>>>,
}

impl FileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PathBuf, TrackedFile>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Tracks `path`. Re-registering an existing path updates its size and pin
    /// but keeps its original creation time.
    pub fn register(&self, path: impl Into<PathBuf>, size_bytes: u64, pinned: bool) -> TrackedFile {
        let now = Instant::now();
        let path = path.into();
        let mut files = self.lock();
        let entry = files
            .entry(path.clone())
            .and_modify(|file| {
                file.size_bytes = size_bytes;
                file.pinned = pinned;
                file.last_touched_at = now;
            })
            .or_insert_with(|| TrackedFile {
                path,
                size_bytes,
                created_at: now,
                last_touched_at: now,
                pinned,
            });
        entry.clone()
    }

    pub(crate) fn restore(&self, file: TrackedFile) {
        self.lock().entry(file.path.clone()).or_insert(file);
    }

    pub fn pin(&self, path: &Path) -> bool {
        self.set_pinned(path, true)
    }

    pub fn unpin(&self, path: &Path) -> bool {
        self.set_pinned(path, false)
    }

    fn set_pinned(&self, path: &Path, pinned: bool) -> bool {
        match self.lock().get_mut(path) {
            Some(file) => {
                file.pinned = pinned;
                file.last_touched_at = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn touch(&self, path: &Path) -> bool {
        match self.lock().get_mut(path) {
            Some(file) => {
                file.last_touched_at = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, path: &Path) -> Option<TrackedFile> {
        self.lock().remove(path)
    }

    /// Removes the entry only if it is still unpinned; sweeps use this so a
    /// file pinned after candidate selection survives.
    pub(crate) fn take_unpinned(&self, path: &Path) -> Option<TrackedFile> {
        let mut files = self.lock();
        match files.get(path) {
            Some(file) if !file.pinned => files.remove(path),
            _ => None,
        }
    }

    pub fn get(&self, path: &Path) -> Option<TrackedFile> {
        self.lock().get(path).cloned()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.lock().contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn entries(&self) -> Vec<TrackedFile> {
        self.lock().values().cloned().collect()
    }

    pub fn total_bytes(&self) -> u64 {
        self.lock()
            .values()
            .fold(0u64, |acc, file| acc.saturating_add(file.size_bytes))
    }

    /// Registers files left in `dir` by an earlier run, dating them from their
    /// modification time so the age sweep picks them up.
    pub fn adopt_directory(&self, dir: &Path) -> io::Result<usize> {
        let now = Instant::now();
        let wall_now = SystemTime::now();
        let mut adopted = 0;
        for entry in WalkDir::new(dir).min_depth(1).follow_links(false) {
            let entry = entry.map_err(io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let metadata = entry.metadata().map_err(io::Error::from)?;
            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| wall_now.duration_since(modified).ok())
                .unwrap_or_default();
            let created_at = now.checked_sub(age).unwrap_or(now);
            let path = entry.into_path();
            let mut files = self.lock();
            if files.contains_key(&path) {
                continue;
            }
            debug!(path = %path.display(), age_secs = age.as_secs(), "adopting leftover file");
            files.insert(
                path.clone(),
                TrackedFile {
                    path,
                    size_bytes: metadata.len(),
                    created_at,
                    last_touched_at: created_at,
                    pinned: false,
                },
            );
            adopted += 1;
        }
        Ok(adopted)
    }
}

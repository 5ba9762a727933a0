use std::cmp::Ordering;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::SharedMetrics;

use super::probe::DiskProbe;
use super::registry::{FileRegistry, TrackedFile};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepKind {
    Scheduled,
    Emergency,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepReport {
    pub kind: SweepKind,
    pub evicted: Vec<PathBuf>,
    pub bytes_freed: u64,
    pub skipped_pinned: usize,
    pub failures: usize,
    pub disk_before: Option<f64>,
    pub disk_after: Option<f64>,
    pub reached_target: bool,
}

impl SweepReport {
    fn new(kind: SweepKind) -> Self {
        Self {
            kind,
            evicted: Vec::new(),
            bytes_freed: 0,
            skipped_pinned: 0,
            failures: 0,
            disk_before: None,
            disk_after: None,
            reached_target: false,
        }
    }
}

enum Eviction {
    Deleted(u64),
    AlreadyGone,
    Pinned,
    Failed,
}

/// Deletes tracked files, on a timer by age or on demand by disk pressure.
///
/// Both sweep kinds share one async lock, so an emergency sweep always runs
/// to completion before a scheduled one may start and vice versa.
pub struct Reclaimer {
    registry: FileRegistry,
    probe: Arc<dyn DiskProbe>,
    max_file_age: Duration,
    metrics: SharedMetrics,
    sweep_lock: AsyncMutex<()>,
}

impl std::fmt::Debug for Reclaimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reclaimer")
            .field("tracked", &self.registry.len())
            .field("max_file_age", &self.max_file_age)
            .finish()
    }
}

impl Reclaimer {
    pub fn new(
        registry: FileRegistry,
        probe: Arc<dyn DiskProbe>,
        max_file_age: Duration,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            registry,
            probe,
            max_file_age,
            metrics,
            sweep_lock: AsyncMutex::new(()),
        }
    }

    pub fn registry(&self) -> &FileRegistry {
        &self.registry
    }

    pub fn max_file_age(&self) -> Duration {
        self.max_file_age
    }

    /// Files the next scheduled sweep would delete.
    pub fn expired(&self) -> Vec<TrackedFile> {
        let now = Instant::now();
        let mut files: Vec<_> = self
            .registry
            .entries()
            .into_iter()
            .filter(|file| !file.pinned && file.age(now) > self.max_file_age)
            .collect();
        files.sort_by_key(|file| file.created_at);
        files
    }

    pub async fn scheduled_sweep(&self) -> SweepReport {
        let _guard = self.sweep_lock.lock().await;
        let mut report = SweepReport::new(SweepKind::Scheduled);
        for file in self.expired() {
            self.apply(&file, &mut report).await;
        }
        report.reached_target = report.failures == 0;
        self.metrics.update(|m| m.record_sweep(false));
        if !report.evicted.is_empty() || report.failures > 0 {
            info!(
                evicted = report.evicted.len(),
                bytes_freed = report.bytes_freed,
                failures = report.failures,
                "scheduled sweep finished"
            );
        }
        report
    }

    /// Deletes oldest files first (larger first on ties) until real disk usage
    /// drops to `threshold - margin`, sampling the volume after every delete.
    pub async fn emergency_sweep(&self, threshold: f64, margin: f64) -> SweepReport {
        let _guard = self.sweep_lock.lock().await;
        let mut report = SweepReport::new(SweepKind::Emergency);
        self.metrics.update(|m| m.record_sweep(true));
        let target = (threshold - margin).max(0.0);

        let mut usage = match self.probe.disk_percent() {
            Ok(usage) => usage,
            Err(err) => {
                warn!(error = %err, "emergency sweep could not sample disk usage");
                return report;
            }
        };
        report.disk_before = Some(usage);

        let mut candidates = self.registry.entries();
        candidates.sort_by(emergency_order);
        for file in candidates {
            if usage <= target {
                break;
            }
            if !self.apply(&file, &mut report).await {
                continue;
            }
            usage = match self.probe.disk_percent() {
                Ok(usage) => usage,
                Err(err) => {
                    warn!(error = %err, "disk usage unavailable mid-sweep; stopping");
                    break;
                }
            };
        }

        report.disk_after = Some(usage);
        report.reached_target = usage <= target;
        let level = if report.reached_target { "reached" } else { "missed" };
        info!(
            before = report.disk_before,
            after = usage,
            target,
            evicted = report.evicted.len(),
            skipped_pinned = report.skipped_pinned,
            outcome = level,
            "emergency sweep finished"
        );
        report
    }

    /// Deletes one file regardless of its pin. Returns the bytes freed, or
    /// `None` when the file was already gone.
    pub async fn evict(&self, path: &Path) -> io::Result<Option<u64>> {
        let entry = self.registry.remove(path);
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                let bytes = entry.map(|file| file.size_bytes).unwrap_or(0);
                self.metrics.update(|m| m.record_eviction(bytes));
                debug!(path = %path.display(), bytes, "file evicted");
                Ok(Some(bytes))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => {
                if let Some(file) = entry {
                    self.registry.restore(file);
                }
                Err(err)
            }
        }
    }

    /// Runs the age sweep every `interval` until cancelled. A sweep already in
    /// progress when cancellation arrives is allowed to finish.
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        info!(interval_secs = interval.as_secs(), "storage reclaimer started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = sleep(interval) => {}
            }
            self.scheduled_sweep().await;
        }
        info!("storage reclaimer stopped");
    }

    /// Returns true when something was removed from the registry.
    async fn apply(&self, file: &TrackedFile, report: &mut SweepReport) -> bool {
        match self.evict_unpinned(file).await {
            Eviction::Deleted(bytes) => {
                report.evicted.push(file.path.clone());
                report.bytes_freed = report.bytes_freed.saturating_add(bytes);
                true
            }
            Eviction::AlreadyGone => true,
            Eviction::Pinned => {
                report.skipped_pinned += 1;
                false
            }
            Eviction::Failed => {
                report.failures += 1;
                false
            }
        }
    }

    async fn evict_unpinned(&self, file: &TrackedFile) -> Eviction {
        let Some(entry) = self.registry.take_unpinned(&file.path) else {
            debug!(path = %file.path.display(), "skipping pinned or untracked file");
            return Eviction::Pinned;
        };
        match tokio::fs::remove_file(&entry.path).await {
            Ok(()) => {
                self.metrics.update(|m| m.record_eviction(entry.size_bytes));
                debug!(path = %entry.path.display(), bytes = entry.size_bytes, "file evicted");
                Eviction::Deleted(entry.size_bytes)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %entry.path.display(), "file already gone; dropping entry");
                Eviction::AlreadyGone
            }
            Err(err) => {
                warn!(path = %entry.path.display(), error = %err, "eviction failed; continuing");
                self.registry.restore(entry);
                Eviction::Failed
            }
        }
    }
}

fn emergency_order(a: &TrackedFile, b: &TrackedFile) -> Ordering {
    a.created_at
        .cmp(&b.created_at)
        .then_with(|| b.size_bytes.cmp(&a.size_bytes))
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    struct FixedDisk(f64);

    impl DiskProbe for FixedDisk {
        fn disk_percent(&self) -> io::Result<f64> {
            Ok(self.0)
        }
    }

    fn reclaimer(disk: f64) -> Reclaimer {
        Reclaimer::new(
            FileRegistry::new(),
            Arc::new(FixedDisk(disk)),
            Duration::from_secs(3600),
            SharedMetrics::new(),
        )
    }

    #[test]
    fn ties_prefer_larger_files() {
        let now = Instant::now();
        let file = |name: &str, size| TrackedFile {
            path: PathBuf::from(name),
            size_bytes: size,
            created_at: now,
            last_touched_at: now,
            pinned: false,
        };
        let mut files = vec![file("small", 1), file("large", 9)];
        files.sort_by(emergency_order);
        assert_eq!(files[0].path, PathBuf::from("large"));
    }

    #[tokio::test]
    async fn missing_files_are_dropped_from_the_registry() {
        let dir = tempdir().unwrap();
        let reclaimer = reclaimer(99.0);
        reclaimer
            .registry()
            .register(dir.path().join("vanished.mp4"), 100, false);
        let report = reclaimer.emergency_sweep(80.0, 10.0).await;
        assert!(report.evicted.is_empty());
        assert_eq!(report.failures, 0);
        assert!(reclaimer.registry().is_empty());
    }

    #[tokio::test]
    async fn explicit_evict_ignores_pins() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        std::fs::write(&path, vec![0u8; 32]).unwrap();
        let reclaimer = reclaimer(10.0);
        reclaimer.registry().register(&path, 32, true);
        assert_eq!(reclaimer.evict(&path).await.unwrap(), Some(32));
        assert!(!path.exists());
        assert!(reclaimer.registry().is_empty());
        assert_eq!(reclaimer.evict(&path).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_cancel() {
        let reclaimer = Arc::new(reclaimer(10.0));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let reclaimer = Arc::clone(&reclaimer);
            let cancel = cancel.clone();
            async move { reclaimer.run(Duration::from_secs(300), cancel).await }
        });
        tokio::time::sleep(Duration::from_secs(650)).await;
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(reclaimer.metrics.snapshot().scheduled_sweeps, 2);
    }
}

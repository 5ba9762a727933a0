//! Host pressure sampling and the reactions it drives.
//!
//! The monitor never trusts the file registry to detect disk pressure: every
//! decision is taken on a fresh filesystem reading, the registry only supplies
//! eviction victims.

mod sampler;

pub use sampler::{ProcSampler, SystemSampler};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::admission::AdmissionController;
use crate::config::GatewayConfig;
use crate::metrics::{GatewayMetrics, SharedMetrics};
use crate::storage::{Reclaimer, SweepReport};

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
    #[error("disk usage unavailable: {0}")]
    Disk(#[source] std::io::Error),
}

impl MonitorError {
    pub(crate) fn parse(path: &Path, reason: impl Into<String>) -> Self {
        MonitorError::Parse {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PressureSnapshot {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub sampled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonitorSettings {
    pub max_disk_percent: f64,
    pub max_memory_percent: f64,
    pub emergency_margin_percent: f64,
    pub error_backoff: Duration,
}

impl MonitorSettings {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            max_disk_percent: config.monitor.max_disk_percent,
            max_memory_percent: config.monitor.max_memory_percent,
            emergency_margin_percent: config.storage.emergency_margin_percent,
            error_backoff: config.monitor.error_backoff(),
        }
    }
}

/// Outcome of one monitor tick.
#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub snapshot: PressureSnapshot,
    pub emergency: Option<SweepReport>,
    pub server_busy: bool,
    /// Counters as they stood at the end of the tick.
    pub metrics: GatewayMetrics,
}

pub struct ResourceMonitor {
    sampler: Arc<dyn SystemSampler>,
    reclaimer: Arc<Reclaimer>,
    admission: Arc<AdmissionController>,
    metrics: SharedMetrics,
    settings: MonitorSettings,
    pressure: watch::Sender<Option<PressureSnapshot>>,
}

impl std::fmt::Debug for ResourceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceMonitor")
            .field("settings", &self.settings)
            .field("latest", &*self.pressure.borrow())
            .finish()
    }
}

impl ResourceMonitor {
    pub fn new(
        sampler: Arc<dyn SystemSampler>,
        reclaimer: Arc<Reclaimer>,
        admission: Arc<AdmissionController>,
        metrics: SharedMetrics,
        settings: MonitorSettings,
    ) -> Self {
        let (pressure, _) = watch::channel(None);
        Self {
            sampler,
            reclaimer,
            admission,
            metrics,
            settings,
            pressure,
        }
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    /// Receiver that always holds the most recent snapshot, `None` until the
    /// first successful tick.
    pub fn pressure(&self) -> watch::Receiver<Option<PressureSnapshot>> {
        self.pressure.subscribe()
    }

    pub fn latest(&self) -> Option<PressureSnapshot> {
        self.pressure.borrow().clone()
    }

    /// Samples once and reacts. An emergency sweep started here finishes
    /// before this returns.
    pub async fn tick(&self) -> Result<TickReport, MonitorError> {
        let mut snapshot = self.sampler.sample()?;
        debug!(
            cpu = snapshot.cpu_percent,
            memory = snapshot.memory_percent,
            disk = snapshot.disk_percent,
            "pressure sampled"
        );

        if snapshot.memory_percent > self.settings.max_memory_percent {
            warn!(
                memory = snapshot.memory_percent,
                limit = self.settings.max_memory_percent,
                "memory pressure high; transcodes will be downsized"
            );
        }

        let mut emergency = None;
        if snapshot.disk_percent >= self.settings.max_disk_percent {
            warn!(
                disk = snapshot.disk_percent,
                limit = self.settings.max_disk_percent,
                "disk usage over threshold; starting emergency sweep"
            );
            let report = self
                .reclaimer
                .emergency_sweep(
                    self.settings.max_disk_percent,
                    self.settings.emergency_margin_percent,
                )
                .await;
            if let Some(after) = report.disk_after {
                snapshot.disk_percent = after;
            }
            emergency = Some(report);
        }

        let server_busy = snapshot.disk_percent >= self.settings.max_disk_percent;
        self.admission.set_server_busy(server_busy);
        self.pressure.send_replace(Some(snapshot.clone()));
        Ok(TickReport {
            snapshot,
            emergency,
            server_busy,
            metrics: self.metrics.snapshot(),
        })
    }

    /// Ticks every `interval` until `cancel` fires. Sampling failures are
    /// logged and retried after the configured backoff.
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        info!(interval_secs = interval.as_secs(), "resource monitor started");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let delay = match self.tick().await {
                Ok(report) => {
                    report.metrics.log_summary();
                    interval
                }
                Err(err) => {
                    self.metrics.update(|m| m.record_monitor_error());
                    let delay = jittered(self.settings.error_backoff);
                    warn!(error = %err, backoff_ms = delay.as_millis() as u64, "monitor tick failed");
                    delay
                }
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }
        info!("resource monitor stopped");
    }
}

/// Adds up to 10% random jitter so restarts do not sample in lockstep.
fn jittered(base: Duration) -> Duration {
    let spread = (base.as_millis() / 10) as u64;
    if spread == 0 {
        return base;
    }
    base + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io;
    use std::sync::Mutex;

    use tempfile::tempdir;

    use super::*;
    use crate::config::QuotasSection;
    use crate::storage::{DiskProbe, FileRegistry};

    struct ScriptedSampler(Mutex<VecDeque<Result<PressureSnapshot, MonitorError>>>);

    impl ScriptedSampler {
        fn new(items: Vec<Result<PressureSnapshot, MonitorError>>) -> Self {
            Self(Mutex::new(items.into()))
        }
    }

    impl SystemSampler for ScriptedSampler {
        fn sample(&self) -> Result<PressureSnapshot, MonitorError> {
            self.0
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(reading(10.0, 10.0)))
        }
    }

    struct FixedDisk(f64);

    impl DiskProbe for FixedDisk {
        fn disk_percent(&self) -> io::Result<f64> {
            Ok(self.0)
        }
    }

    fn reading(memory: f64, disk: f64) -> PressureSnapshot {
        PressureSnapshot {
            cpu_percent: 5.0,
            memory_percent: memory,
            disk_percent: disk,
            sampled_at: Utc::now(),
        }
    }

    fn monitor(
        sampler: ScriptedSampler,
        disk: f64,
    ) -> (ResourceMonitor, Arc<AdmissionController>, SharedMetrics) {
        let metrics = SharedMetrics::new();
        let reclaimer = Arc::new(Reclaimer::new(
            FileRegistry::new(),
            Arc::new(FixedDisk(disk)),
            Duration::from_secs(3600),
            metrics.clone(),
        ));
        let admission = Arc::new(AdmissionController::from_config(
            &QuotasSection::default(),
            metrics.clone(),
        ));
        let monitor = ResourceMonitor::new(
            Arc::new(sampler),
            reclaimer,
            Arc::clone(&admission),
            metrics.clone(),
            MonitorSettings::from_config(&GatewayConfig::default()),
        );
        (monitor, admission, metrics)
    }

    #[tokio::test]
    async fn tick_publishes_latest_snapshot() {
        let (monitor, admission, _) = monitor(ScriptedSampler::new(vec![Ok(reading(40.0, 30.0))]), 30.0);
        let receiver = monitor.pressure();
        assert!(receiver.borrow().is_none());
        admission.admit(&"viewer".into(), crate::orchestrator::JobKind::Video, 0);
        let report = monitor.tick().await.unwrap();
        assert!(report.emergency.is_none());
        assert!(!report.server_busy);
        assert_eq!(report.metrics.admitted, 1);
        assert_eq!(receiver.borrow().as_ref().map(|s| s.memory_percent), Some(40.0));
        assert!(!admission.is_server_busy());
    }

    #[tokio::test]
    async fn unrelieved_disk_pressure_marks_server_busy() {
        let (monitor, admission, metrics) =
            monitor(ScriptedSampler::new(vec![Ok(reading(10.0, 95.0))]), 95.0);
        let report = monitor.tick().await.unwrap();
        let sweep = report.emergency.expect("emergency sweep should run");
        assert!(!sweep.reached_target);
        assert!(report.server_busy);
        assert!(admission.is_server_busy());
        assert_eq!(metrics.snapshot().emergency_sweeps, 1);
        assert_eq!(report.metrics.emergency_sweeps, 1);

        // A later tick observing relief reopens admission.
        let (relieved, admission, _) = self::monitor(ScriptedSampler::new(vec![Ok(reading(10.0, 20.0))]), 20.0);
        admission.set_server_busy(true);
        relieved.tick().await.unwrap();
        assert!(!admission.is_server_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn sampling_errors_do_not_stop_the_loop() {
        let dir = tempdir().unwrap();
        let failure = MonitorError::Io {
            path: dir.path().join("stat"),
            source: io::Error::new(io::ErrorKind::NotFound, "gone"),
        };
        let (monitor, _, metrics) = monitor(
            ScriptedSampler::new(vec![Err(failure), Ok(reading(12.0, 10.0))]),
            10.0,
        );
        let monitor = Arc::new(monitor);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let monitor = Arc::clone(&monitor);
            let cancel = cancel.clone();
            async move { monitor.run(Duration::from_secs(300), cancel).await }
        });

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(metrics.snapshot().monitor_errors, 1);
        assert_eq!(monitor.latest().map(|s| s.memory_percent), Some(12.0));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let base = Duration::from_secs(60);
        for _ in 0..32 {
            let delay = jittered(base);
            assert!(delay >= base && delay <= base + Duration::from_secs(6));
        }
    }
}

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayMetrics {
    pub started_at: DateTime<Utc>,
    pub admitted: u64,
    pub rejected: u64,
    pub delivered: u64,
    pub failed: u64,
    pub compressed: u64,
    pub fetches: u64,
    pub fetched_bytes: u64,
    pub fetch_millis: u64,
    pub files_evicted: u64,
    pub bytes_reclaimed: u64,
    pub scheduled_sweeps: u64,
    pub emergency_sweeps: u64,
    pub monitor_errors: u64,
    pub rejections: BTreeMap<String, u64>,
    pub errors: BTreeMap<String, u64>,
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            admitted: 0,
            rejected: 0,
            delivered: 0,
            failed: 0,
            compressed: 0,
            fetches: 0,
            fetched_bytes: 0,
            fetch_millis: 0,
            files_evicted: 0,
            bytes_reclaimed: 0,
            scheduled_sweeps: 0,
            emergency_sweeps: 0,
            monitor_errors: 0,
            rejections: BTreeMap::new(),
            errors: BTreeMap::new(),
        }
    }
}

impl GatewayMetrics {
    pub fn record_admission(&mut self) {
        self.admitted = self.admitted.saturating_add(1);
    }

    pub fn record_rejection(&mut self, reason: &str) {
        self.rejected = self.rejected.saturating_add(1);
        bump(&mut self.rejections, reason);
    }

    pub fn record_delivery(&mut self) {
        self.delivered = self.delivered.saturating_add(1);
    }

    pub fn record_failure(&mut self, kind: &str) {
        self.failed = self.failed.saturating_add(1);
        bump(&mut self.errors, kind);
    }

    pub fn record_compression(&mut self) {
        self.compressed = self.compressed.saturating_add(1);
    }

    pub fn record_fetch(&mut self, elapsed: Duration, bytes: u64) {
        self.fetches = self.fetches.saturating_add(1);
        self.fetched_bytes = self.fetched_bytes.saturating_add(bytes);
        self.fetch_millis = self
            .fetch_millis
            .saturating_add(elapsed.as_millis().min(u64::MAX as u128) as u64);
    }

    pub fn record_eviction(&mut self, bytes: u64) {
        self.files_evicted = self.files_evicted.saturating_add(1);
        self.bytes_reclaimed = self.bytes_reclaimed.saturating_add(bytes);
    }

    pub fn record_sweep(&mut self, emergency: bool) {
        if emergency {
            self.emergency_sweeps = self.emergency_sweeps.saturating_add(1);
        } else {
            self.scheduled_sweeps = self.scheduled_sweeps.saturating_add(1);
        }
    }

    pub fn record_monitor_error(&mut self) {
        self.monitor_errors = self.monitor_errors.saturating_add(1);
        bump(&mut self.errors, "monitor");
    }

    pub fn average_fetch_seconds(&self) -> f64 {
        if self.fetches == 0 {
            0.0
        } else {
            (self.fetch_millis as f64 / self.fetches as f64) / 1000.0
        }
    }

    pub fn uptime_seconds(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds().max(0)
    }

    /// Emits the counters as one structured event.
    pub fn log_summary(&self) {
        info!(
            uptime_secs = self.uptime_seconds(),
            admitted = self.admitted,
            rejected = self.rejected,
            delivered = self.delivered,
            failed = self.failed,
            compressed = self.compressed,
            avg_fetch_secs = self.average_fetch_seconds(),
            files_evicted = self.files_evicted,
            bytes_reclaimed = self.bytes_reclaimed,
            scheduled_sweeps = self.scheduled_sweeps,
            emergency_sweeps = self.emergency_sweeps,
            monitor_errors = self.monitor_errors,
            "gateway metrics"
        );
    }
}

fn bump(map: &mut BTreeMap<String, u64>, key: &str) {
    let entry = map.entry(key.to_string()).or_insert(0);
    *entry = entry.saturating_add(1);
}

/// Cloneable handle shared by every component that records outcomes.
#[derive(Debug, Clone, Default)]
pub struct SharedMetrics(Arc<Mutex<GatewayMetrics>>);

impl SharedMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update<F>(&self, record: F)
    where
        F: FnOnce(&mut GatewayMetrics),
    {
        let mut guard = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        record(&mut guard);
    }

    pub fn snapshot(&self) -> GatewayMetrics {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

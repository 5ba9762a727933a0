use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;

use crate::storage::DiskProbe;

use super::{MonitorError, PressureSnapshot};

/// Source of host pressure readings.
pub trait SystemSampler: Send + Sync {
    fn sample(&self) -> Result<PressureSnapshot, MonitorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CpuTimes {
    busy: u64,
    total: u64,
}

/// Reads CPU and memory from procfs and disk usage from the probe backing the
/// downloads volume.
pub struct ProcSampler {
    proc_root: PathBuf,
    disk: Arc<dyn DiskProbe>,
    last_cpu: Mutex<Option<CpuTimes>>,
}

impl ProcSampler {
    pub fn new(disk: Arc<dyn DiskProbe>) -> Self {
        Self::with_proc_root("/proc", disk)
    }

    pub fn with_proc_root(proc_root: impl Into<PathBuf>, disk: Arc<dyn DiskProbe>) -> Self {
        Self {
            proc_root: proc_root.into(),
            disk,
            last_cpu: Mutex::new(None),
        }
    }

    fn read(&self, name: &str) -> Result<String, MonitorError> {
        let path = self.proc_root.join(name);
        std::fs::read_to_string(&path).map_err(|source| MonitorError::Io { path, source })
    }

    fn cpu_percent(&self) -> Result<f64, MonitorError> {
        let path = self.proc_root.join("stat");
        let current = parse_cpu_times(&self.read("stat")?, &path)?;
        let mut last = self.last_cpu.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = last.replace(current);
        // First reading has no baseline, so it reports the average since boot.
        let (busy, total) = match previous {
            Some(prev) if current.total > prev.total => (
                current.busy.saturating_sub(prev.busy),
                current.total - prev.total,
            ),
            _ => (current.busy, current.total),
        };
        Ok(percent(busy, total))
    }

    fn memory_percent(&self) -> Result<f64, MonitorError> {
        let path = self.proc_root.join("meminfo");
        parse_memory_percent(&self.read("meminfo")?, &path)
    }
}

impl std::fmt::Debug for ProcSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcSampler")
            .field("proc_root", &self.proc_root)
            .finish()
    }
}

impl SystemSampler for ProcSampler {
    fn sample(&self) -> Result<PressureSnapshot, MonitorError> {
        Ok(PressureSnapshot {
            cpu_percent: self.cpu_percent()?,
            memory_percent: self.memory_percent()?,
            disk_percent: self.disk.disk_percent().map_err(MonitorError::Disk)?,
            sampled_at: Utc::now(),
        })
    }
}

pub(crate) fn parse_cpu_times(stat: &str, path: &Path) -> Result<CpuTimes, MonitorError> {
    let line = stat
        .lines()
        .find(|line| line.starts_with("cpu "))
        .ok_or_else(|| MonitorError::parse(path, "missing aggregate cpu line"))?;
    let fields = line
        .split_whitespace()
        .skip(1)
        .map(|field| field.parse::<u64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| MonitorError::parse(path, err.to_string()))?;
    if fields.len() < 4 {
        return Err(MonitorError::parse(path, "cpu line has too few fields"));
    }
    // user nice system idle iowait irq softirq steal; guest time is already
    // folded into user and nice.
    let total: u64 = fields.iter().take(8).sum();
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Ok(CpuTimes {
        busy: total.saturating_sub(idle),
        total,
    })
}

pub(crate) fn parse_memory_percent(meminfo: &str, path: &Path) -> Result<f64, MonitorError> {
    let field = |name: &str| -> Option<u64> {
        meminfo.lines().find_map(|line| {
            let rest = line.strip_prefix(name)?.strip_prefix(':')?;
            rest.split_whitespace().next()?.parse().ok()
        })
    };
    let total = field("MemTotal").ok_or_else(|| MonitorError::parse(path, "missing MemTotal"))?;
    let available = match field("MemAvailable") {
        Some(value) => value,
        None => {
            let free = field("MemFree")
                .ok_or_else(|| MonitorError::parse(path, "missing MemAvailable and MemFree"))?;
            free + field("Buffers").unwrap_or(0) + field("Cached").unwrap_or(0)
        }
    };
    Ok(percent(total.saturating_sub(available), total))
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        (part as f64 / whole as f64 * 100.0).clamp(0.0, 100.0)
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use tempfile::tempdir;

    use super::*;

    struct FixedDisk(f64);

    impl DiskProbe for FixedDisk {
        fn disk_percent(&self) -> io::Result<f64> {
            Ok(self.0)
        }
    }

    const STAT: &str = "cpu  100 0 100 700 100 0 0 0 0 0\ncpu0 50 0 50 350 50 0 0 0 0 0\nintr 1\n";

    #[test]
    fn cpu_line_splits_busy_and_idle() {
        let times = parse_cpu_times(STAT, Path::new("stat")).unwrap();
        assert_eq!(times, CpuTimes { busy: 200, total: 1000 });
    }

    #[test]
    fn meminfo_prefers_available() {
        let meminfo = "MemTotal: 1000 kB\nMemFree: 100 kB\nMemAvailable: 250 kB\n";
        let value = parse_memory_percent(meminfo, Path::new("meminfo")).unwrap();
        assert!((value - 75.0).abs() < 1e-9);

        let legacy = "MemTotal: 1000 kB\nMemFree: 100 kB\nBuffers: 50 kB\nCached: 350 kB\n";
        let value = parse_memory_percent(legacy, Path::new("meminfo")).unwrap();
        assert!((value - 50.0).abs() < 1e-9);
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let err = parse_cpu_times("cpu  a b c d\n", Path::new("stat")).unwrap_err();
        assert!(matches!(err, MonitorError::Parse { .. }));
        let err = parse_memory_percent("Nothing: 1\n", Path::new("meminfo")).unwrap_err();
        assert!(matches!(err, MonitorError::Parse { .. }));
    }

    #[test]
    fn second_sample_uses_the_delta() {
        let root = tempdir().unwrap();
        std::fs::write(root.path().join("stat"), STAT).unwrap();
        std::fs::write(
            root.path().join("meminfo"),
            "MemTotal: 1000 kB\nMemAvailable: 500 kB\n",
        )
        .unwrap();
        let sampler = ProcSampler::with_proc_root(root.path(), Arc::new(FixedDisk(42.0)));
        let first = sampler.sample().unwrap();
        assert!((first.cpu_percent - 20.0).abs() < 1e-9);
        assert_eq!(first.disk_percent, 42.0);

        std::fs::write(root.path().join("stat"), "cpu  190 0 110 800 100 0 0 0\n").unwrap();
        let second = sampler.sample().unwrap();
        // 100 busy of 200 elapsed ticks.
        assert!((second.cpu_percent - 50.0).abs() < 1e-9);
        assert!((second.memory_percent - 50.0).abs() < 1e-9);
    }

    #[test]
    fn missing_procfs_is_reported() {
        let root = tempdir().unwrap();
        let sampler =
            ProcSampler::with_proc_root(root.path().join("absent"), Arc::new(FixedDisk(1.0)));
        assert!(matches!(sampler.sample(), Err(MonitorError::Io { .. })));
    }
}

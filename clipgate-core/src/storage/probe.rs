use std::io;
use std::path::PathBuf;

/// Real usage of the volume holding job files, as a percentage.
pub trait DiskProbe: Send + Sync {
    fn disk_percent(&self) -> io::Result<f64>;
}

#[derive(Debug, Clone)]
pub struct FsDiskProbe {
    path: PathBuf,
}

impl FsDiskProbe {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl DiskProbe for FsDiskProbe {
    fn disk_percent(&self) -> io::Result<f64> {
        let total = fs2::total_space(&self.path)?;
        if total == 0 {
            return Ok(0.0);
        }
        let available = fs2::available_space(&self.path)?.min(total);
        Ok((total - available) as f64 / total as f64 * 100.0)
    }
}

//! Transcode sizing policy.
//!
//! Everything here is pure: the planner never touches the filesystem or the
//! clock, it only turns a duration, a size budget and the current pressure
//! level into encoder parameters.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::GatewayConfig;
use crate::monitor::PressureSnapshot;

pub const MIN_VIDEO_BITRATE_BPS: u64 = 100_000;

const BITS_PER_MB: f64 = 8.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureLevel {
    Normal,
    Moderate,
    Severe,
}

impl PressureLevel {
    pub fn max_height(self) -> u32 {
        match self {
            PressureLevel::Normal => 720,
            PressureLevel::Moderate => 480,
            PressureLevel::Severe => 360,
        }
    }
}

impl fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PressureLevel::Normal => "normal",
            PressureLevel::Moderate => "moderate",
            PressureLevel::Severe => "severe",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PressureThresholds {
    pub memory_moderate: f64,
    pub memory_severe: f64,
    pub disk_moderate: f64,
    pub disk_severe: f64,
}

impl PressureThresholds {
    pub fn from_config(config: &GatewayConfig) -> Self {
        let disk = config.monitor.max_disk_percent;
        Self {
            memory_moderate: config.monitor.max_memory_percent,
            memory_severe: config.monitor.severe_memory_percent,
            disk_moderate: (disk - config.storage.emergency_margin_percent).max(0.0),
            disk_severe: disk,
        }
    }

    pub fn classify(&self, snapshot: &PressureSnapshot) -> PressureLevel {
        if snapshot.memory_percent > self.memory_severe || snapshot.disk_percent >= self.disk_severe
        {
            PressureLevel::Severe
        } else if snapshot.memory_percent > self.memory_moderate
            || snapshot.disk_percent > self.disk_moderate
        {
            PressureLevel::Moderate
        } else {
            PressureLevel::Normal
        }
    }
}

impl Default for PressureThresholds {
    fn default() -> Self {
        Self::from_config(&GatewayConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BitratePlan {
    pub video_bitrate_bps: u64,
    pub max_height: u32,
    pub target_size_mb: f64,
    pub pressure: PressureLevel,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BitratePlanner {
    pressure_scale: f64,
    emergency_target_size_mb: f64,
    thresholds: PressureThresholds,
}

impl Default for BitratePlanner {
    fn default() -> Self {
        Self::from_config(&GatewayConfig::default())
    }
}

impl BitratePlanner {
    pub fn new(
        pressure_scale: f64,
        emergency_target_size_mb: f64,
        thresholds: PressureThresholds,
    ) -> Self {
        Self {
            pressure_scale,
            emergency_target_size_mb,
            thresholds,
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(
            config.transcode.pressure_scale,
            config.transcode.emergency_target_size_mb as f64,
            PressureThresholds::from_config(config),
        )
    }

    pub fn thresholds(&self) -> &PressureThresholds {
        &self.thresholds
    }

    pub fn classify(&self, snapshot: &PressureSnapshot) -> PressureLevel {
        self.thresholds.classify(snapshot)
    }

    /// Under pressure the size budget shrinks and the height ceiling drops:
    /// a smaller, faster encode is preferred over rejecting the job.
    pub fn plan(
        &self,
        duration_seconds: f64,
        target_size_mb: f64,
        audio_bitrate_bps: u64,
        pressure: PressureLevel,
    ) -> BitratePlan {
        let target_size_mb = match pressure {
            PressureLevel::Normal => target_size_mb,
            PressureLevel::Moderate => target_size_mb * self.pressure_scale,
            PressureLevel::Severe => {
                (target_size_mb * self.pressure_scale).min(self.emergency_target_size_mb)
            }
        };
        BitratePlan {
            video_bitrate_bps: video_bitrate(duration_seconds, target_size_mb, audio_bitrate_bps),
            max_height: pressure.max_height(),
            target_size_mb,
            pressure,
        }
    }

    pub fn plan_for_snapshot(
        &self,
        duration_seconds: f64,
        target_size_mb: f64,
        audio_bitrate_bps: u64,
        snapshot: &PressureSnapshot,
    ) -> BitratePlan {
        self.plan(
            duration_seconds,
            target_size_mb,
            audio_bitrate_bps,
            self.classify(snapshot),
        )
    }
}

/// Video bitrate that fits `target_size_mb` after the audio track, floored at
/// [`MIN_VIDEO_BITRATE_BPS`].
pub fn video_bitrate(duration_seconds: f64, target_size_mb: f64, audio_bitrate_bps: u64) -> u64 {
    if !duration_seconds.is_finite() || duration_seconds <= 0.0 {
        return MIN_VIDEO_BITRATE_BPS;
    }
    let target_bits = target_size_mb * BITS_PER_MB;
    let audio_bits = audio_bitrate_bps as f64 * duration_seconds;
    let bitrate = ((target_bits - audio_bits) / duration_seconds).floor();
    if bitrate.is_finite() && bitrate > MIN_VIDEO_BITRATE_BPS as f64 {
        bitrate as u64
    } else {
        MIN_VIDEO_BITRATE_BPS
    }
}

/// Output frame size for a source, clamped to `max_height` and rounded down
/// to even numbers.
pub fn scale_dimensions(width: u32, height: u32, max_height: u32) -> (u32, u32) {
    let (mut width, mut height) = (width.max(2), height.max(2));
    if height > max_height {
        let ratio = max_height as f64 / height as f64;
        width = (width as f64 * ratio).round() as u32;
        height = max_height;
    }
    (even(width), even(height))
}

fn even(value: u32) -> u32 {
    (value - value % 2).max(2)
}

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

pub const BYTES_PER_MB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "snake_case")]
pub struct GatewayConfig {
    pub paths: PathsSection,
    pub bot: BotSection,
    pub quota: QuotasSection,
    pub delivery: DeliverySection,
    pub storage: StorageSection,
    pub monitor: MonitorSection,
    pub transcode: TranscodeSection,
}

impl GatewayConfig {
    pub fn downloads_dir(&self) -> PathBuf {
        PathBuf::from(&self.paths.downloads_dir)
    }

    /// Reads the chat transport credential. A missing token is the one
    /// startup failure the gateway treats as fatal.
    pub fn bot_token(&self) -> Result<String> {
        self.bot_token_with(|key| std::env::var(key).ok())
    }

    pub fn bot_token_with<F>(&self, lookup: F) -> Result<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        match lookup(&self.bot.token_env) {
            Some(token) if !token.trim().is_empty() => Ok(token),
            _ => Err(ConfigError::MissingCredential(self.bot.token_env.clone())),
        }
    }

    /// Applies the legacy environment variables on top of the file values.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = parse_override::<f64, _>(&lookup, "MAX_DISK_PERCENT")? {
            self.monitor.max_disk_percent = value;
        }
        if let Some(value) = parse_override::<f64, _>(&lookup, "MAX_MEMORY_PERCENT")? {
            self.monitor.max_memory_percent = value;
        }
        if let Some(value) = parse_override::<u64, _>(&lookup, "CLEANUP_INTERVAL_SECONDS")? {
            self.storage.cleanup_interval_seconds = value;
        }
        if let Some(hours) = parse_override::<u64, _>(&lookup, "MAX_FILE_AGE_HOURS")? {
            self.storage.max_file_age_seconds = hours.saturating_mul(3600);
        }
        if let Some(value) = parse_override::<u64, _>(&lookup, "MAX_VIDEO_SIZE_MB")? {
            self.delivery.platform_ceiling_mb = value;
        }
        if let Some(value) = parse_override::<u64, _>(&lookup, "TARGET_VIDEO_SIZE_MB")? {
            self.delivery.target_size_mb = value;
        }
        if let Some(value) = parse_override::<u32, _>(&lookup, "MAX_REQUESTS_PER_MINUTE")? {
            self.quota.video.max_requests = value;
        }
        if let Some(value) = parse_override::<u32, _>(&lookup, "MAX_AUDIO_REQUESTS_PER_MINUTE")? {
            self.quota.audio.max_requests = value;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let delivery = &self.delivery;
        if delivery.target_size_mb == 0 {
            return Err(ConfigError::Invalid(
                "delivery.target_size_mb must be greater than zero".into(),
            ));
        }
        if delivery.target_size_mb > delivery.delivery_ceiling_mb {
            return Err(ConfigError::Invalid(format!(
                "delivery.target_size_mb ({}) exceeds delivery_ceiling_mb ({})",
                delivery.target_size_mb, delivery.delivery_ceiling_mb
            )));
        }
        if delivery.delivery_ceiling_mb > delivery.platform_ceiling_mb {
            return Err(ConfigError::Invalid(format!(
                "delivery.delivery_ceiling_mb ({}) exceeds platform_ceiling_mb ({})",
                delivery.delivery_ceiling_mb, delivery.platform_ceiling_mb
            )));
        }
        if let OversizePolicy::Document { ceiling_mb } = delivery.oversize_policy {
            if ceiling_mb < delivery.delivery_ceiling_mb {
                return Err(ConfigError::Invalid(
                    "document ceiling must not be below the delivery ceiling".into(),
                ));
            }
        }
        let monitor = &self.monitor;
        for (name, value) in [
            ("monitor.max_disk_percent", monitor.max_disk_percent),
            ("monitor.max_memory_percent", monitor.max_memory_percent),
            ("monitor.severe_memory_percent", monitor.severe_memory_percent),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be within 0..=100, got {value}"
                )));
            }
        }
        if monitor.severe_memory_percent < monitor.max_memory_percent {
            return Err(ConfigError::Invalid(
                "monitor.severe_memory_percent must not be below max_memory_percent".into(),
            ));
        }
        let margin = self.storage.emergency_margin_percent;
        if margin < 0.0 || margin >= monitor.max_disk_percent {
            return Err(ConfigError::Invalid(format!(
                "storage.emergency_margin_percent ({margin}) must be within 0..max_disk_percent"
            )));
        }
        if self.storage.cleanup_interval_seconds == 0 {
            return Err(ConfigError::Invalid(
                "storage.cleanup_interval_seconds must be greater than zero".into(),
            ));
        }
        if monitor.error_backoff_seconds == 0 {
            return Err(ConfigError::Invalid(
                "monitor.error_backoff_seconds must be greater than zero".into(),
            ));
        }
        let scale = self.transcode.pressure_scale;
        if scale <= 0.0 || scale > 1.0 {
            return Err(ConfigError::Invalid(
                "transcode.pressure_scale must be within (0, 1]".into(),
            ));
        }
        self.quota.video.validate("quota.video")?;
        self.quota.audio.validate("quota.audio")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PathsSection {
    pub downloads_dir: String,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            downloads_dir: "downloads".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BotSection {
    /// Name of the environment variable holding the transport token.
    pub token_env: String,
}

impl Default for BotSection {
    fn default() -> Self {
        Self {
            token_env: "TELEGRAM_BOT_TOKEN".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QuotaSection {
    pub window_seconds: u64,
    pub max_requests: u32,
    pub max_window_mb: u64,
    pub max_single_file_mb: u64,
}

impl QuotaSection {
    pub fn video_defaults() -> Self {
        Self {
            window_seconds: 60,
            max_requests: 30,
            max_window_mb: 2048,
            max_single_file_mb: 450,
        }
    }

    pub fn audio_defaults() -> Self {
        Self {
            window_seconds: 60,
            max_requests: 20,
            max_window_mb: 1024,
            max_single_file_mb: 100,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }

    pub fn max_window_bytes(&self) -> u64 {
        self.max_window_mb.saturating_mul(BYTES_PER_MB)
    }

    pub fn max_single_file_bytes(&self) -> u64 {
        self.max_single_file_mb.saturating_mul(BYTES_PER_MB)
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.window_seconds == 0 {
            return Err(ConfigError::Invalid(format!(
                "{name}.window_seconds must be greater than zero"
            )));
        }
        if self.max_single_file_mb > self.max_window_mb {
            return Err(ConfigError::Invalid(format!(
                "{name}.max_single_file_mb exceeds max_window_mb"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QuotasSection {
    #[serde(default = "QuotaSection::video_defaults")]
    pub video: QuotaSection,
    #[serde(default = "QuotaSection::audio_defaults")]
    pub audio: QuotaSection,
}

impl Default for QuotasSection {
    fn default() -> Self {
        Self {
            video: QuotaSection::video_defaults(),
            audio: QuotaSection::audio_defaults(),
        }
    }
}

/// What to do with an artifact that is still over the delivery ceiling after
/// compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum OversizePolicy {
    Reject,
    Document { ceiling_mb: u64 },
    ExternalLink,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DeliverySection {
    pub target_size_mb: u64,
    pub delivery_ceiling_mb: u64,
    pub platform_ceiling_mb: u64,
    pub oversize_policy: OversizePolicy,
    pub delete_after_delivery: bool,
}

impl DeliverySection {
    pub fn delivery_ceiling_bytes(&self) -> u64 {
        self.delivery_ceiling_mb.saturating_mul(BYTES_PER_MB)
    }

    pub fn platform_ceiling_bytes(&self) -> u64 {
        self.platform_ceiling_mb.saturating_mul(BYTES_PER_MB)
    }
}

impl Default for DeliverySection {
    fn default() -> Self {
        Self {
            target_size_mb: 45,
            delivery_ceiling_mb: 49,
            platform_ceiling_mb: 450,
            oversize_policy: OversizePolicy::Reject,
            delete_after_delivery: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageSection {
    pub max_file_age_seconds: u64,
    pub cleanup_interval_seconds: u64,
    /// Hysteresis band below `max_disk_percent` an emergency sweep aims for.
    pub emergency_margin_percent: f64,
}

impl StorageSection {
    pub fn max_file_age(&self) -> Duration {
        Duration::from_secs(self.max_file_age_seconds)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            max_file_age_seconds: 3600,
            cleanup_interval_seconds: 300,
            emergency_margin_percent: 10.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitorSection {
    pub max_disk_percent: f64,
    pub max_memory_percent: f64,
    pub severe_memory_percent: f64,
    pub error_backoff_seconds: u64,
}

impl MonitorSection {
    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_seconds)
    }
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            max_disk_percent: 80.0,
            max_memory_percent: 85.0,
            severe_memory_percent: 90.0,
            error_backoff_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TranscodeSection {
    pub audio_bitrate_bps: u64,
    pub emergency_target_size_mb: u64,
    pub pressure_scale: f64,
    pub ffmpeg_path: String,
    pub preset: String,
}

impl Default for TranscodeSection {
    fn default() -> Self {
        Self {
            audio_bitrate_bps: 128_000,
            emergency_target_size_mb: 20,
            pressure_scale: 0.8,
            ffmpeg_path: "ffmpeg".into(),
            preset: "medium".into(),
        }
    }
}

/// Loads the file, applies environment overrides and validates the result.
pub fn load_gateway_config<P: AsRef<Path>>(path: P) -> Result<GatewayConfig> {
    let mut config: GatewayConfig = load_toml(path)?;
    config.apply_env_overrides(|key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

fn parse_override<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|err| ConfigError::Override {
            key: key.to_string(),
            value: raw.clone(),
            reason: err.to_string(),
        })
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

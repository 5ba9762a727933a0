use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::BYTES_PER_MB;
use crate::planner::BitratePlan;
use crate::quota::Identity;

use super::error::{DeliveryError, FetchError};
use super::job::{Job, JobKind, JobState};

/// The few fetch metadata fields the pipeline actually reads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchMetadata {
    pub duration_seconds: Option<f64>,
    pub title: Option<String>,
    pub uploader: Option<String>,
    pub size_hint: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl FetchMetadata {
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        match (self.width, self.height) {
            (Some(width), Some(height)) if width > 0 && height > 0 => Some((width, height)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchedMedia {
    pub path: PathBuf,
    pub metadata: FetchMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub release_date: Option<String>,
    #[serde(default)]
    pub external_links: Vec<String>,
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Downloads `url` into `dest_dir`. Video jobs produce a container file,
    /// audio jobs an extracted audio track.
    async fn fetch(&self, url: &Url, dest_dir: &Path, kind: JobKind) -> Result<FetchedMedia, FetchError>;
}

#[async_trait]
pub trait Recognizer: Send + Sync {
    async fn identify(&self, audio_path: &Path) -> Option<TrackInfo>;
}

#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn deliver(&self, job: &Job, artifact: &Artifact) -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub identity: Identity,
    pub source_url: String,
    pub kind: JobKind,
    pub size_hint: Option<u64>,
}

impl JobRequest {
    pub fn video(identity: impl Into<Identity>, source_url: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            source_url: source_url.into(),
            kind: JobKind::Video,
            size_hint: None,
        }
    }

    pub fn audio(identity: impl Into<Identity>, source_url: impl Into<String>) -> Self {
        Self {
            kind: JobKind::Audio,
            ..Self::video(identity, source_url)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Sent as regular media within the delivery ceiling.
    Inline,
    /// Sent as a generic document under the larger document ceiling.
    Document,
    /// Too large for the transport; handed off for out-of-band delivery.
    ExternalLink,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub mode: DeliveryMode,
    pub caption: String,
    pub compression: Option<BitratePlan>,
}

#[derive(Debug, Clone)]
pub struct JobReport {
    pub job: Job,
    pub artifact: Option<Artifact>,
}

impl JobReport {
    pub fn state(&self) -> &JobState {
        self.job.state()
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self.job.state(), JobState::Delivered)
    }

    /// Text for the requesting user when the job did not succeed.
    pub fn user_message(&self) -> Option<String> {
        match self.job.state() {
            JobState::Rejected(reason) => Some(super::error::deny_message(*reason)),
            JobState::Failed(error) => Some(error.user_message()),
            _ => None,
        }
    }
}

pub fn format_caption(metadata: &FetchMetadata, size_bytes: u64) -> String {
    let mut lines = Vec::with_capacity(3);
    if let Some(title) = metadata.title.as_deref().filter(|t| !t.trim().is_empty()) {
        lines.push(title.trim().to_string());
    }
    if let Some(uploader) = metadata.uploader.as_deref().filter(|u| !u.trim().is_empty()) {
        lines.push(format!("by {}", uploader.trim()));
    }
    let size = format_size(size_bytes);
    match metadata.duration_seconds {
        Some(duration) => lines.push(format!("{} | {size}", format_duration(duration))),
        None => lines.push(size),
    }
    lines.join("\n")
}

pub fn format_duration(seconds: f64) -> String {
    let total = if seconds.is_finite() && seconds > 0.0 {
        seconds.round() as u64
    } else {
        0
    };
    let (hours, minutes, secs) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{hours}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes}:{secs:02}")
    }
}

pub fn format_size(bytes: u64) -> String {
    if bytes >= BYTES_PER_MB {
        format!("{:.1} MB", bytes as f64 / BYTES_PER_MB as f64)
    } else {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    }
}

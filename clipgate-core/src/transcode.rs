//! Transcoder seam and the ffmpeg-backed implementation.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::TranscodeSection;
use crate::planner::{scale_dimensions, BitratePlan};

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("failed to launch transcoder: {0}")]
    Io(#[from] std::io::Error),
    #[error("transcoder exited with {status:?}: {stderr}")]
    Failed { status: Option<i32>, stderr: String },
}

/// Encoder parameters for one job, derived from a [`BitratePlan`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscodePlan {
    pub video_bitrate_bps: u64,
    pub audio_bitrate_bps: u64,
    pub max_height: u32,
    /// Exact output size when the source dimensions are known.
    pub frame: Option<(u32, u32)>,
}

impl TranscodePlan {
    pub fn new(plan: &BitratePlan, audio_bitrate_bps: u64, source: Option<(u32, u32)>) -> Self {
        Self {
            video_bitrate_bps: plan.video_bitrate_bps,
            audio_bitrate_bps,
            max_height: plan.max_height,
            frame: source.map(|(width, height)| scale_dimensions(width, height, plan.max_height)),
        }
    }

    fn scale_filter(&self) -> String {
        match self.frame {
            Some((width, height)) => format!("scale={width}:{height}"),
            None => format!("scale=-2:'min(ih,{})'", self.max_height),
        }
    }
}

#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn encode(&self, src: &Path, dst: &Path, plan: &TranscodePlan) -> Result<(), TranscodeError>;
}

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, program: &Path, args: &[String]) -> std::io::Result<Output>;
}

#[derive(Debug, Default)]
pub struct SystemCommandExecutor;

#[async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(&self, program: &Path, args: &[String]) -> std::io::Result<Output> {
        Command::new(program).args(args).kill_on_drop(true).output().await
    }
}

pub struct FfmpegTranscoder {
    binary: PathBuf,
    preset: String,
    executor: Arc<dyn CommandExecutor>,
}

impl fmt::Debug for FfmpegTranscoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FfmpegTranscoder")
            .field("binary", &self.binary)
            .field("preset", &self.preset)
            .finish()
    }
}

impl FfmpegTranscoder {
    pub fn new(section: &TranscodeSection) -> Self {
        Self {
            binary: PathBuf::from(&section.ffmpeg_path),
            preset: section.preset.clone(),
            executor: Arc::new(SystemCommandExecutor),
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn arguments(&self, src: &Path, dst: &Path, plan: &TranscodePlan) -> Vec<String> {
        let bitrate = plan.video_bitrate_bps;
        vec![
            "-y".into(),
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-i".into(),
            src.display().to_string(),
            "-c:v".into(),
            "libx264".into(),
            "-preset".into(),
            self.preset.clone(),
            "-b:v".into(),
            bitrate.to_string(),
            "-maxrate".into(),
            (bitrate + bitrate / 2).to_string(),
            "-bufsize".into(),
            (bitrate * 2).to_string(),
            "-vf".into(),
            plan.scale_filter(),
            "-c:a".into(),
            "aac".into(),
            "-b:a".into(),
            plan.audio_bitrate_bps.to_string(),
            "-ar".into(),
            "44100".into(),
            "-movflags".into(),
            "+faststart".into(),
            dst.display().to_string(),
        ]
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn encode(&self, src: &Path, dst: &Path, plan: &TranscodePlan) -> Result<(), TranscodeError> {
        let args = self.arguments(src, dst, plan);
        debug!(program = %self.binary.display(), ?args, "running transcoder");
        let output = self.executor.run(&self.binary, &args).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        warn!(status = ?output.status.code(), %stderr, "transcoder failed");
        Err(TranscodeError::Failed {
            status: output.status.code(),
            stderr,
        })
    }
}

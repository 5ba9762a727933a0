//! Per-job pipeline: admission, fetch, size check, optional compression and
//! delivery, with quota refunds and file cleanup on every failure path.

mod error;
mod job;
mod types;

pub use error::{deny_message, DeliveryError, FetchError, FetchErrorKind, JobError, JobResult};
pub use job::{Job, JobKind, JobState};
pub use types::{
    format_caption, format_duration, format_size, Artifact, DeliveryMode, DeliverySink,
    FetchMetadata, FetchedMedia, Fetcher, JobReport, JobRequest, Recognizer, TrackInfo,
};

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::time::Instant;
use tracing::{info, warn};
use url::Url;

use crate::admission::{AdmissionController, AdmissionDecision, AdmissionTicket, DenyReason};
use crate::config::{DeliverySection, GatewayConfig, OversizePolicy, BYTES_PER_MB};
use crate::metrics::SharedMetrics;
use crate::monitor::PressureSnapshot;
use crate::planner::{BitratePlan, BitratePlanner, PressureLevel};
use crate::quota::Identity;
use crate::storage::{FileRegistry, Reclaimer};
use crate::transcode::{TranscodePlan, Transcoder};

/// External services the pipeline drives.
#[derive(Clone)]
pub struct Collaborators {
    pub fetcher: Arc<dyn Fetcher>,
    pub transcoder: Arc<dyn Transcoder>,
    pub sink: Arc<dyn DeliverySink>,
    pub recognizer: Option<Arc<dyn Recognizer>>,
}

/// What a running job still owns and must give back if it fails.
#[derive(Default)]
struct Holdings {
    ticket: Option<AdmissionTicket>,
    files: Vec<PathBuf>,
}

pub struct JobOrchestrator {
    admission: Arc<AdmissionController>,
    reclaimer: Arc<Reclaimer>,
    planner: BitratePlanner,
    pressure: watch::Receiver<Option<PressureSnapshot>>,
    metrics: SharedMetrics,
    collaborators: Collaborators,
    delivery: DeliverySection,
    audio_bitrate_bps: u64,
    downloads_dir: PathBuf,
    single_flight: Arc<AsyncMutex<()>>,
}

impl fmt::Debug for JobOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobOrchestrator")
            .field("planner", &self.planner)
            .field("delivery", &self.delivery)
            .field("downloads_dir", &self.downloads_dir)
            .finish()
    }
}

impl JobOrchestrator {
    pub fn new(
        config: &GatewayConfig,
        admission: Arc<AdmissionController>,
        reclaimer: Arc<Reclaimer>,
        pressure: watch::Receiver<Option<PressureSnapshot>>,
        metrics: SharedMetrics,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            admission,
            reclaimer,
            planner: BitratePlanner::from_config(config),
            pressure,
            metrics,
            collaborators,
            delivery: config.delivery.clone(),
            audio_bitrate_bps: config.transcode.audio_bitrate_bps,
            downloads_dir: config.downloads_dir(),
            single_flight: Arc::new(AsyncMutex::new(())),
        }
    }

    /// Shares a fetch-and-transcode lock with other orchestrators so only
    /// one pipeline runs at a time across all of them.
    pub fn with_single_flight(mut self, lock: Arc<AsyncMutex<()>>) -> Self {
        self.single_flight = lock;
        self
    }

    pub fn registry(&self) -> &FileRegistry {
        self.reclaimer.registry()
    }

    /// Runs one request to a terminal state. Admission happens before the
    /// single-flight lock is taken, so quota checks never queue behind a
    /// running fetch.
    pub async fn process(&self, request: JobRequest) -> JobReport {
        let JobRequest {
            identity,
            source_url,
            kind,
            size_hint,
        } = request;
        let mut job = Job::new(identity, source_url, kind);

        let Some(url) = parse_source(&job.source_url) else {
            self.metrics
                .update(|m| m.record_rejection(DenyReason::InvalidSource.label()));
            return self.reject(job, DenyReason::InvalidSource);
        };
        let ticket = match self
            .admission
            .admit(&job.identity, kind, size_hint.unwrap_or(0))
        {
            AdmissionDecision::Admitted(ticket) => ticket,
            AdmissionDecision::Denied(reason) => return self.reject(job, reason),
        };
        if let Err(err) = job.advance(JobState::Admitted) {
            self.admission.release(ticket);
            return self.fail(job, err);
        }

        let _flight = self.single_flight.lock().await;
        let mut holdings = Holdings {
            ticket: Some(ticket),
            files: Vec::new(),
        };
        match self.run_pipeline(&mut job, &url, &mut holdings).await {
            Ok(artifact) => {
                self.finish_delivery(&artifact.path).await;
                self.metrics.update(|m| m.record_delivery());
                info!(
                    job_id = %job.id,
                    identity = %job.identity,
                    bytes = artifact.size_bytes,
                    mode = ?artifact.mode,
                    compressed = artifact.compression.is_some(),
                    "job delivered"
                );
                JobReport {
                    job,
                    artifact: Some(artifact),
                }
            }
            Err(err) => {
                if let Some(ticket) = holdings.ticket.take() {
                    self.admission.release(ticket);
                }
                for path in holdings.files.drain(..) {
                    self.discard(&path).await;
                }
                self.fail(job, err)
            }
        }
    }

    /// Looks up an audio file the user sent directly. The working file is
    /// charged to the audio ledger and deleted once recognition finishes.
    pub async fn identify_audio(
        &self,
        identity: &Identity,
        path: &Path,
    ) -> JobResult<Option<TrackInfo>> {
        let Some(recognizer) = self.collaborators.recognizer.clone() else {
            return Err(JobError::Internal("no recognizer configured".into()));
        };
        let size = file_size(path).await?;
        if let AdmissionDecision::Denied(reason) = self.admission.admit(identity, JobKind::Audio, size) {
            self.discard(path).await;
            return Err(JobError::AdmissionDenied(reason));
        }
        self.registry().register(path, size, true);
        let track = recognizer.identify(path).await;
        self.discard(path).await;
        match &track {
            Some(track) => info!(identity = %identity, title = %track.title, artist = %track.artist, "track identified"),
            None => info!(identity = %identity, "no track match"),
        }
        Ok(track)
    }

    async fn run_pipeline(
        &self,
        job: &mut Job,
        url: &Url,
        holdings: &mut Holdings,
    ) -> JobResult<Artifact> {
        job.advance(JobState::Fetching)?;
        let started = Instant::now();
        let fetched = self
            .collaborators
            .fetcher
            .fetch(url, &self.downloads_dir, job.kind)
            .await?;
        holdings.files.push(fetched.path.clone());
        let size = file_size(&fetched.path).await?;
        self.metrics
            .update(|m| m.record_fetch(started.elapsed(), size));
        self.registry().register(&fetched.path, size, true);
        job.advance(JobState::SizeChecked)?;

        let platform_ceiling = self.delivery.platform_ceiling_bytes();
        if size > platform_ceiling {
            warn!(job_id = %job.id, size, ceiling = platform_ceiling, "fetched media over platform ceiling");
            return Err(JobError::TooLarge {
                size_bytes: size,
                ceiling_bytes: platform_ceiling,
            });
        }
        if let Some(ticket) = holdings.ticket.take() {
            let confirmed = self
                .admission
                .confirm_actual_size(ticket, size)
                .map_err(JobError::AdmissionDenied)?;
            holdings.ticket = Some(confirmed);
        }

        let (path, size_bytes, mode, compression) =
            if size <= self.delivery.delivery_ceiling_bytes() {
                (fetched.path.clone(), size, DeliveryMode::Inline, None)
            } else if job.kind == JobKind::Audio {
                (fetched.path.clone(), size, self.oversize_mode(size, false)?, None)
            } else {
                job.advance(JobState::Compressing)?;
                let (output, output_size, plan) = self.compress(job, &fetched, holdings).await?;
                job.advance(JobState::Compressed)?;
                (output, output_size, self.oversize_mode(output_size, true)?, Some(plan))
            };

        job.advance(JobState::Delivering)?;
        let artifact = Artifact {
            caption: format_caption(&fetched.metadata, size_bytes),
            path,
            size_bytes,
            mode,
            compression,
        };
        self.collaborators
            .sink
            .deliver(job, &artifact)
            .await
            .map_err(|err| JobError::Delivery(err.0))?;
        job.advance(JobState::Delivered)?;
        holdings.ticket = None;
        holdings.files.clear();
        Ok(artifact)
    }

    async fn compress(
        &self,
        job: &Job,
        fetched: &FetchedMedia,
        holdings: &mut Holdings,
    ) -> JobResult<(PathBuf, u64, BitratePlan)> {
        let duration = fetched
            .metadata
            .duration_seconds
            .filter(|duration| duration.is_finite() && *duration > 0.0)
            .ok_or_else(|| JobError::Compression("source duration unknown".into()))?;
        let target_mb = self.delivery.target_size_mb as f64;
        let snapshot = self.pressure.borrow().clone();
        let plan = match &snapshot {
            Some(snapshot) => {
                self.planner
                    .plan_for_snapshot(duration, target_mb, self.audio_bitrate_bps, snapshot)
            }
            None => self
                .planner
                .plan(duration, target_mb, self.audio_bitrate_bps, PressureLevel::Normal),
        };
        info!(
            job_id = %job.id,
            duration,
            video_bitrate = plan.video_bitrate_bps,
            max_height = plan.max_height,
            target_mb = plan.target_size_mb,
            pressure = %plan.pressure,
            "compressing media"
        );

        let output = compressed_path(&fetched.path);
        holdings.files.push(output.clone());
        let transcode = TranscodePlan::new(&plan, self.audio_bitrate_bps, fetched.metadata.dimensions());
        self.collaborators
            .transcoder
            .encode(&fetched.path, &output, &transcode)
            .await
            .map_err(JobError::from_transcode)?;
        let output_size = tokio::fs::metadata(&output)
            .await
            .map(|metadata| metadata.len())
            .map_err(|err| JobError::Compression(format!("no output produced: {err}")))?;
        self.registry().register(&output, output_size, true);

        self.discard(&fetched.path).await;
        holdings.files.retain(|path| path != &fetched.path);
        self.metrics.update(|m| m.record_compression());
        Ok((output, output_size, plan))
    }

    fn oversize_mode(&self, size: u64, compressed: bool) -> JobResult<DeliveryMode> {
        let ceiling = self.delivery.delivery_ceiling_bytes();
        if size <= ceiling {
            return Ok(DeliveryMode::Inline);
        }
        let too_large = |ceiling_bytes| {
            if compressed {
                JobError::OversizeAfterCompression {
                    size_bytes: size,
                    ceiling_bytes,
                }
            } else {
                JobError::TooLarge {
                    size_bytes: size,
                    ceiling_bytes,
                }
            }
        };
        match self.delivery.oversize_policy {
            OversizePolicy::Reject => Err(too_large(ceiling)),
            OversizePolicy::Document { ceiling_mb } => {
                let document_ceiling = ceiling_mb.saturating_mul(BYTES_PER_MB);
                if size <= document_ceiling {
                    Ok(DeliveryMode::Document)
                } else {
                    Err(too_large(document_ceiling))
                }
            }
            OversizePolicy::ExternalLink => Ok(DeliveryMode::ExternalLink),
        }
    }

    async fn finish_delivery(&self, path: &Path) {
        if self.delivery.delete_after_delivery {
            self.discard(path).await;
        } else {
            self.registry().unpin(path);
        }
    }

    async fn discard(&self, path: &Path) {
        if let Err(err) = self.reclaimer.evict(path).await {
            warn!(path = %path.display(), error = %err, "failed to delete job file");
        }
    }

    fn reject(&self, mut job: Job, reason: DenyReason) -> JobReport {
        if let Err(err) = job.advance(JobState::Rejected(reason)) {
            warn!(job_id = %job.id, error = %err, "could not record rejection");
        }
        JobReport {
            job,
            artifact: None,
        }
    }

    fn fail(&self, mut job: Job, error: JobError) -> JobReport {
        self.metrics.update(|m| m.record_failure(error.kind_label()));
        warn!(
            job_id = %job.id,
            identity = %job.identity,
            state = job.state().label(),
            error = %error,
            "job failed"
        );
        if let Err(err) = job.advance(JobState::Failed(error)) {
            warn!(job_id = %job.id, error = %err, "could not record failure");
        }
        JobReport {
            job,
            artifact: None,
        }
    }
}

fn parse_source(raw: &str) -> Option<Url> {
    let url = Url::parse(raw.trim()).ok()?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Some(url),
        _ => None,
    }
}

fn compressed_path(source: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "media".into());
    source.with_file_name(format!("{stem}.compressed.mp4"))
}

async fn file_size(path: &Path) -> JobResult<u64> {
    tokio::fs::metadata(path)
        .await
        .map(|metadata| metadata.len())
        .map_err(|err| JobError::io(path, err))
}

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;
use url::Url;

use clipgate_core::{
    Artifact, Collaborators, DeliveryError, DeliveryMode, DeliverySink, DiskProbe, FetchError,
    FetchErrorKind, FetchMetadata, FetchedMedia, Fetcher, GatewayConfig, Identity, Job, JobError,
    JobKind, JobRequest, JobState, MonitorError, OversizePolicy, PressureLevel, PressureSnapshot,
    Recognizer,
    Supervisor, SystemSampler, TrackInfo, TranscodeError, TranscodePlan, Transcoder,
    BYTES_PER_MB, MIN_VIDEO_BITRATE_BPS,
};

struct CalmHost;

impl SystemSampler for CalmHost {
    fn sample(&self) -> Result<PressureSnapshot, MonitorError> {
        Ok(PressureSnapshot {
            cpu_percent: 5.0,
            memory_percent: 30.0,
            disk_percent: 20.0,
            sampled_at: Utc::now(),
        })
    }
}

impl DiskProbe for CalmHost {
    fn disk_percent(&self) -> io::Result<f64> {
        Ok(20.0)
    }
}

/// Plenty of disk, but memory past the severe threshold.
struct SwappingHost;

impl SystemSampler for SwappingHost {
    fn sample(&self) -> Result<PressureSnapshot, MonitorError> {
        Ok(PressureSnapshot {
            cpu_percent: 60.0,
            memory_percent: 95.0,
            disk_percent: 20.0,
            sampled_at: Utc::now(),
        })
    }
}

fn sparse_file(path: &Path, size: u64) {
    std::fs::File::create(path).unwrap().set_len(size).unwrap();
}

struct FakeFetcher {
    size: u64,
    outcome: Option<FetchError>,
    fetched: Mutex<Vec<PathBuf>>,
}

impl FakeFetcher {
    fn sized(size: u64) -> Self {
        Self {
            size,
            outcome: None,
            fetched: Mutex::new(Vec::new()),
        }
    }

    fn failing(diagnostic: &str) -> Self {
        Self {
            size: 0,
            outcome: Some(FetchError::classify(diagnostic)),
            fetched: Mutex::new(Vec::new()),
        }
    }

    fn last_path(&self) -> PathBuf {
        self.fetched.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl Fetcher for FakeFetcher {
    async fn fetch(&self, _url: &Url, dest_dir: &Path, kind: JobKind) -> Result<FetchedMedia, FetchError> {
        if let Some(error) = &self.outcome {
            return Err(error.clone());
        }
        let extension = match kind {
            JobKind::Video => "mp4",
            JobKind::Audio => "mp3",
        };
        let path = dest_dir.join(format!("clip-{}.{extension}", self.fetched.lock().unwrap().len()));
        sparse_file(&path, self.size);
        self.fetched.lock().unwrap().push(path.clone());
        Ok(FetchedMedia {
            path,
            metadata: FetchMetadata {
                duration_seconds: Some(120.0),
                title: Some("Harbour at dusk".into()),
                uploader: Some("sailor".into()),
                size_hint: Some(self.size),
                width: Some(1920),
                height: Some(1080),
            },
        })
    }
}

struct FakeTranscoder {
    output_size: Option<u64>,
    plans: Mutex<Vec<TranscodePlan>>,
}

impl FakeTranscoder {
    fn producing(output_size: u64) -> Self {
        Self {
            output_size: Some(output_size),
            plans: Mutex::new(Vec::new()),
        }
    }

    fn broken() -> Self {
        Self {
            output_size: None,
            plans: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Transcoder for FakeTranscoder {
    async fn encode(&self, src: &Path, dst: &Path, plan: &TranscodePlan) -> Result<(), TranscodeError> {
        assert!(src.exists(), "source must still exist while encoding");
        self.plans.lock().unwrap().push(plan.clone());
        match self.output_size {
            Some(size) => {
                sparse_file(dst, size);
                Ok(())
            }
            None => {
                // Leave a partial file behind like a crashed encoder would.
                sparse_file(dst, 1024);
                Err(TranscodeError::Failed {
                    status: Some(1),
                    stderr: "Conversion failed!".into(),
                })
            }
        }
    }
}

/// Fetcher that takes a while and records how many fetches overlap.
#[derive(Default)]
struct SlowFetcher {
    calls: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl Fetcher for SlowFetcher {
    async fn fetch(&self, _url: &Url, dest_dir: &Path, _kind: JobKind) -> Result<FetchedMedia, FetchError> {
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        let path = dest_dir.join(format!("slow-{index}.mp4"));
        sparse_file(&path, BYTES_PER_MB);
        Ok(FetchedMedia {
            path,
            metadata: FetchMetadata {
                duration_seconds: Some(30.0),
                ..FetchMetadata::default()
            },
        })
    }
}

#[derive(Default)]
struct RecordingSink {
    delivered: Mutex<Vec<Artifact>>,
    refusing: AtomicBool,
}

#[async_trait]
impl DeliverySink for RecordingSink {
    async fn deliver(&self, job: &Job, artifact: &Artifact) -> Result<(), DeliveryError> {
        assert_eq!(job.state().label(), "delivering");
        assert!(artifact.path.exists(), "artifact must exist while delivering");
        if self.refusing.load(Ordering::SeqCst) {
            return Err(DeliveryError("chat not found".into()));
        }
        self.delivered.lock().unwrap().push(artifact.clone());
        Ok(())
    }
}

struct FixedRecognizer;

#[async_trait]
impl Recognizer for FixedRecognizer {
    async fn identify(&self, audio_path: &Path) -> Option<TrackInfo> {
        assert!(audio_path.exists());
        Some(TrackInfo {
            title: "Blue in Green".into(),
            artist: "Miles Davis".into(),
            album: Some("Kind of Blue".into()),
            release_date: Some("1959".into()),
            external_links: Vec::new(),
        })
    }
}

struct Harness {
    _dir: TempDir,
    supervisor: Supervisor,
    fetcher: Arc<FakeFetcher>,
    transcoder: Arc<FakeTranscoder>,
    sink: Arc<RecordingSink>,
}

impl Harness {
    fn new(fetcher: FakeFetcher, transcoder: FakeTranscoder) -> Self {
        Self::with_config(fetcher, transcoder, |_| {})
    }

    fn with_config(
        fetcher: FakeFetcher,
        transcoder: FakeTranscoder,
        adjust: impl FnOnce(&mut GatewayConfig),
    ) -> Self {
        Self::build(fetcher, transcoder, Arc::new(CalmHost), adjust)
    }

    fn on_host(
        fetcher: FakeFetcher,
        transcoder: FakeTranscoder,
        sampler: Arc<dyn SystemSampler>,
    ) -> Self {
        Self::build(fetcher, transcoder, sampler, |_| {})
    }

    fn build(
        fetcher: FakeFetcher,
        transcoder: FakeTranscoder,
        sampler: Arc<dyn SystemSampler>,
        adjust: impl FnOnce(&mut GatewayConfig),
    ) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = GatewayConfig::default();
        config.paths.downloads_dir = dir.path().to_string_lossy().into_owned();
        adjust(&mut config);
        config.validate().unwrap();
        let supervisor = Supervisor::with_parts(config, sampler, Arc::new(CalmHost));
        Self {
            _dir: dir,
            supervisor,
            fetcher: Arc::new(fetcher),
            transcoder: Arc::new(transcoder),
            sink: Arc::new(RecordingSink::default()),
        }
    }

    fn orchestrator(&self) -> clipgate_core::JobOrchestrator {
        self.supervisor.orchestrator(Collaborators {
            fetcher: self.fetcher.clone(),
            transcoder: self.transcoder.clone(),
            sink: self.sink.clone(),
            recognizer: Some(Arc::new(FixedRecognizer)),
        })
    }

    fn video_usage(&self, identity: &Identity) -> (u32, u64) {
        let state = self
            .supervisor
            .admission()
            .ledger(JobKind::Video)
            .snapshot(identity)
            .unwrap();
        (state.request_count, state.cumulative_bytes)
    }
}

#[tokio::test]
async fn oversize_fetch_fails_and_leaves_nothing_behind() {
    let harness = Harness::new(FakeFetcher::sized(500 * BYTES_PER_MB), FakeTranscoder::producing(0));
    let orchestrator = harness.orchestrator();
    let user = Identity::from(7_i64);

    let report = orchestrator
        .process(JobRequest::video(user.clone(), "https://video.example/watch?v=big"))
        .await;

    match report.state() {
        JobState::Failed(JobError::TooLarge {
            size_bytes,
            ceiling_bytes,
        }) => {
            assert_eq!(*size_bytes, 500 * BYTES_PER_MB);
            assert_eq!(*ceiling_bytes, 450 * BYTES_PER_MB);
        }
        other => panic!("unexpected state {other}"),
    }
    assert!(report.user_message().unwrap().contains("450 MB"));
    assert!(!harness.fetcher.last_path().exists());
    assert!(orchestrator.registry().is_empty());
    assert_eq!(harness.video_usage(&user), (0, 0));
    assert!(harness.transcoder.plans.lock().unwrap().is_empty());
    assert_eq!(harness.supervisor.metrics().snapshot().errors.get("too_large"), Some(&1));
}

#[tokio::test]
async fn mid_size_fetch_is_compressed_then_delivered() {
    let harness = Harness::new(
        FakeFetcher::sized(80 * BYTES_PER_MB),
        FakeTranscoder::producing(30 * BYTES_PER_MB),
    );
    let orchestrator = harness.orchestrator();
    let user = Identity::from("viewer");

    let report = orchestrator
        .process(JobRequest::video(user.clone(), "https://video.example/watch?v=mid"))
        .await;

    assert!(report.is_delivered(), "state: {}", report.state());
    assert_eq!(
        report.job.history(),
        [
            "queued",
            "admitted",
            "fetching",
            "size_checked",
            "compressing",
            "compressed",
            "delivering",
            "delivered"
        ]
    );

    let plans = harness.transcoder.plans.lock().unwrap();
    assert_eq!(plans.len(), 1);
    assert!(plans[0].video_bitrate_bps >= MIN_VIDEO_BITRATE_BPS);
    assert_eq!(plans[0].frame, Some((1280, 720)));

    let artifact = report.artifact.as_ref().unwrap();
    assert!(artifact.size_bytes <= 49 * BYTES_PER_MB);
    assert_eq!(artifact.mode, DeliveryMode::Inline);
    assert!(artifact.caption.starts_with("Harbour at dusk\nby sailor\n2:00"));
    assert_eq!(harness.sink.delivered.lock().unwrap().len(), 1);

    // Delivered files are deleted by default, the original right after encoding.
    assert!(!artifact.path.exists());
    assert!(!harness.fetcher.last_path().exists());
    assert!(orchestrator.registry().is_empty());
    assert_eq!(harness.video_usage(&user), (1, 80 * BYTES_PER_MB));

    let metrics = harness.supervisor.metrics().snapshot();
    assert_eq!(metrics.delivered, 1);
    assert_eq!(metrics.compressed, 1);
}

#[tokio::test]
async fn small_fetch_skips_compression_and_stays_tracked_when_kept() {
    let harness = Harness::with_config(
        FakeFetcher::sized(10 * BYTES_PER_MB),
        FakeTranscoder::producing(0),
        |config| config.delivery.delete_after_delivery = false,
    );
    let orchestrator = harness.orchestrator();

    let report = orchestrator
        .process(JobRequest::video("u", "https://video.example/small"))
        .await;

    assert!(report.is_delivered());
    assert!(!report.job.history().contains(&"compressing"));
    let artifact = report.artifact.unwrap();
    assert!(artifact.path.exists());
    let tracked = orchestrator.registry().get(&artifact.path).unwrap();
    assert!(!tracked.pinned, "delivered files become eligible for sweeps");
}

#[tokio::test]
async fn failed_compression_cleans_up_and_refunds() {
    let harness = Harness::new(FakeFetcher::sized(80 * BYTES_PER_MB), FakeTranscoder::broken());
    let orchestrator = harness.orchestrator();
    let user = Identity::from("u");

    let report = orchestrator
        .process(JobRequest::video(user.clone(), "https://video.example/x"))
        .await;

    assert!(matches!(report.state(), JobState::Failed(JobError::Compression(_))));
    assert!(!harness.fetcher.last_path().exists());
    let leftovers = std::fs::read_dir(harness.supervisor.config().downloads_dir())
        .unwrap()
        .count();
    assert_eq!(leftovers, 0, "partial encoder output must be removed");
    assert!(orchestrator.registry().is_empty());
    assert_eq!(harness.video_usage(&user), (0, 0));
}

#[tokio::test]
async fn oversize_after_compression_follows_policy() {
    let rejecting = Harness::new(
        FakeFetcher::sized(200 * BYTES_PER_MB),
        FakeTranscoder::producing(60 * BYTES_PER_MB),
    );
    let report = rejecting
        .orchestrator()
        .process(JobRequest::video("u", "https://video.example/long"))
        .await;
    assert!(matches!(
        report.state(),
        JobState::Failed(JobError::OversizeAfterCompression { .. })
    ));

    let documenting = Harness::with_config(
        FakeFetcher::sized(200 * BYTES_PER_MB),
        FakeTranscoder::producing(60 * BYTES_PER_MB),
        |config| config.delivery.oversize_policy = OversizePolicy::Document { ceiling_mb: 2000 },
    );
    let report = documenting
        .orchestrator()
        .process(JobRequest::video("u", "https://video.example/long"))
        .await;
    assert!(report.is_delivered());
    assert_eq!(report.artifact.unwrap().mode, DeliveryMode::Document);
}

#[tokio::test]
async fn fetch_errors_are_classified_and_refunded() {
    let harness = Harness::new(
        FakeFetcher::failing("ERROR: [youtube] abc: Private video. Sign in if you've been granted access"),
        FakeTranscoder::producing(0),
    );
    let user = Identity::from("u");
    let report = harness
        .orchestrator()
        .process(JobRequest::video(user.clone(), "https://video.example/private"))
        .await;

    match report.state() {
        JobState::Failed(JobError::Fetch(error)) => {
            assert_eq!(error.kind, FetchErrorKind::PrivateOrAuthRequired)
        }
        other => panic!("unexpected state {other}"),
    }
    assert_eq!(harness.video_usage(&user), (0, 0));
}

#[tokio::test]
async fn invalid_sources_are_rejected_before_admission() {
    let harness = Harness::new(FakeFetcher::sized(1), FakeTranscoder::producing(0));
    let user = Identity::from("u");
    let report = harness
        .orchestrator()
        .process(JobRequest::video(user.clone(), "ftp://files.example/clip"))
        .await;

    assert_eq!(report.state().label(), "rejected");
    assert!(harness
        .supervisor
        .admission()
        .ledger(JobKind::Video)
        .snapshot(&user)
        .is_none());
    assert!(harness.fetcher.fetched.lock().unwrap().is_empty());
}

#[tokio::test]
async fn recognised_audio_file_is_removed_afterwards() {
    let harness = Harness::new(FakeFetcher::sized(1), FakeTranscoder::producing(0));
    let orchestrator = harness.orchestrator();
    let path = harness.supervisor.config().downloads_dir().join("voice.ogg");
    sparse_file(&path, 4 * BYTES_PER_MB);

    let track = orchestrator
        .identify_audio(&Identity::from("u"), &path)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(track.artist, "Miles Davis");
    assert!(!path.exists());
    assert!(orchestrator.registry().is_empty());
    let audio = harness
        .supervisor
        .admission()
        .ledger(JobKind::Audio)
        .snapshot(&Identity::from("u"))
        .unwrap();
    assert_eq!(audio.cumulative_bytes, 4 * BYTES_PER_MB);
}

#[tokio::test]
async fn memory_pressure_shrinks_the_compression_plan() {
    let harness = Harness::on_host(
        FakeFetcher::sized(80 * BYTES_PER_MB),
        FakeTranscoder::producing(15 * BYTES_PER_MB),
        Arc::new(SwappingHost),
    );
    let orchestrator = harness.orchestrator();
    let tick = harness.supervisor.monitor().tick().await.unwrap();
    assert!(!tick.server_busy);

    let report = orchestrator
        .process(JobRequest::video("u", "https://video.example/watch?v=pressure"))
        .await;
    assert!(report.is_delivered(), "state: {}", report.state());

    let plan = report.artifact.unwrap().compression.unwrap();
    assert_eq!(plan.pressure, PressureLevel::Severe);
    assert_eq!(plan.max_height, 360);
    // 45 MB scaled by 0.8 is capped at the 20 MB emergency target.
    assert!((plan.target_size_mb - 20.0).abs() < 1e-9);
    assert_eq!(plan.video_bitrate_bps, 1_270_101);

    let encoded = harness.transcoder.plans.lock().unwrap();
    assert_eq!(encoded[0].frame, Some((640, 360)));
    assert_eq!(encoded[0].video_bitrate_bps, 1_270_101);
}

#[tokio::test]
async fn failed_delivery_refunds_quota_and_removes_the_artifact() {
    let harness = Harness::new(
        FakeFetcher::sized(80 * BYTES_PER_MB),
        FakeTranscoder::producing(30 * BYTES_PER_MB),
    );
    harness.sink.refusing.store(true, Ordering::SeqCst);
    let orchestrator = harness.orchestrator();
    let user = Identity::from("gone-away");

    let report = orchestrator
        .process(JobRequest::video(user.clone(), "https://video.example/watch?v=lost"))
        .await;

    match report.state() {
        JobState::Failed(JobError::Delivery(reason)) => assert_eq!(reason, "chat not found"),
        other => panic!("unexpected state {other}"),
    }
    assert!(report.artifact.is_none());
    assert!(!report.user_message().unwrap().contains("chat not found"));
    let leftovers = std::fs::read_dir(harness.supervisor.config().downloads_dir())
        .unwrap()
        .count();
    assert_eq!(leftovers, 0, "compressed artifact must be evicted");
    assert!(orchestrator.registry().is_empty());
    assert_eq!(harness.video_usage(&user), (0, 0));
    assert_eq!(harness.supervisor.metrics().snapshot().errors.get("delivery"), Some(&1));
}

#[tokio::test(start_paused = true)]
async fn one_pipeline_runs_at_a_time_across_orchestrators() {
    let harness = Harness::new(FakeFetcher::sized(1), FakeTranscoder::producing(0));
    let fetcher = Arc::new(SlowFetcher::default());
    let collaborators = || Collaborators {
        fetcher: fetcher.clone(),
        transcoder: harness.transcoder.clone(),
        sink: harness.sink.clone(),
        recognizer: None,
    };
    let first = harness.supervisor.orchestrator(collaborators());
    let second = harness.supervisor.orchestrator(collaborators());

    let (a, b) = tokio::join!(
        first.process(JobRequest::video("a", "https://video.example/watch?v=a")),
        second.process(JobRequest::video("b", "https://video.example/watch?v=b")),
    );

    assert!(a.is_delivered(), "state: {}", a.state());
    assert!(b.is_delivered(), "state: {}", b.state());
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    assert_eq!(fetcher.peak.load(Ordering::SeqCst), 1);
    assert_eq!(harness.sink.delivered.lock().unwrap().len(), 2);
}

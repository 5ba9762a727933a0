pub mod admission;
pub mod config;
pub mod error;
pub mod metrics;
pub mod monitor;
pub mod orchestrator;
pub mod planner;
pub mod quota;
pub mod storage;
pub mod supervisor;
pub mod transcode;

pub use admission::{AdmissionController, AdmissionDecision, AdmissionTicket, DenyReason};
pub use config::{
    load_gateway_config, DeliverySection, GatewayConfig, MonitorSection, OversizePolicy,
    QuotaSection, QuotasSection, StorageSection, TranscodeSection, BYTES_PER_MB,
};
pub use error::{ConfigError, Result};
pub use metrics::{GatewayMetrics, SharedMetrics};
pub use monitor::{
    MonitorError, MonitorSettings, PressureSnapshot, ProcSampler, ResourceMonitor,
    SystemSampler, TickReport,
};
pub use orchestrator::{
    Artifact, Collaborators, DeliveryError, DeliveryMode, DeliverySink, FetchError,
    FetchErrorKind, FetchMetadata, FetchedMedia, Fetcher, Job, JobError, JobKind,
    JobOrchestrator, JobReport, JobRequest, JobResult, JobState, Recognizer, TrackInfo,
};
pub use planner::{
    BitratePlan, BitratePlanner, PressureLevel, PressureThresholds, MIN_VIDEO_BITRATE_BPS,
};
pub use quota::{Identity, QuotaDecision, QuotaDenial, QuotaLedger, QuotaLimits, QuotaState};
pub use storage::{
    DiskProbe, FileRegistry, FsDiskProbe, Reclaimer, SweepKind, SweepReport, TrackedFile,
};
pub use supervisor::{Supervisor, SupervisorError};
pub use transcode::{
    CommandExecutor, FfmpegTranscoder, SystemCommandExecutor, TranscodeError, TranscodePlan,
    Transcoder,
};

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use clipgate_core::monitor::MonitorError;
use clipgate_core::{
    load_gateway_config, BitratePlan, BitratePlanner, FileRegistry, FsDiskProbe, GatewayConfig,
    GatewayMetrics, PressureLevel, PressureSnapshot, ProcSampler, Reclaimer, SharedMetrics, Supervisor,
    SupervisorError, SystemSampler, TranscodePlan, BYTES_PER_MB,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] clipgate_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("monitor error: {0}")]
    Monitor(#[from] MonitorError),
    #[error("supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("required resource missing: {0}")]
    MissingResource(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "clipgate operator console", long_about = None)]
pub struct Cli {
    /// Path to clipgate.toml
    #[arg(long, default_value = "configs/clipgate.toml")]
    pub config: PathBuf,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validates the configuration and the runtime prerequisites
    CheckConfig,
    /// Samples host pressure once and reports it against the thresholds
    Status,
    /// Computes the transcode plan for a clip
    Plan(PlanArgs),
    /// Adopts a directory and runs the age sweep over it
    Sweep(SweepArgs),
    /// Runs the monitor and reclaimer loops until interrupted
    Daemon,
    /// Prints shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args, Debug)]
pub struct PlanArgs {
    /// Clip duration in seconds
    #[arg(long)]
    pub duration: f64,
    /// Size budget in MB (defaults to delivery.target_size_mb)
    #[arg(long)]
    pub target_mb: Option<f64>,
    #[arg(long)]
    pub width: Option<u32>,
    #[arg(long)]
    pub height: Option<u32>,
    /// Pressure tier to plan for; sampled from the host when omitted
    #[arg(long, value_enum)]
    pub pressure: Option<PressureArg>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum PressureArg {
    Normal,
    Moderate,
    Severe,
}

impl From<PressureArg> for PressureLevel {
    fn from(value: PressureArg) -> Self {
        match value {
            PressureArg::Normal => PressureLevel::Normal,
            PressureArg::Moderate => PressureLevel::Moderate,
            PressureArg::Severe => PressureLevel::Severe,
        }
    }
}

#[derive(Args, Debug)]
pub struct SweepArgs {
    /// Directory to sweep (defaults to paths.downloads_dir)
    #[arg(long)]
    pub dir: Option<PathBuf>,
    /// Override storage.max_file_age_seconds
    #[arg(long)]
    pub max_age_secs: Option<u64>,
    /// Lists what would be deleted without deleting
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
}

pub fn run(cli: Cli) -> Result<()> {
    if let Commands::Completions { shell } = &cli.command {
        let mut command = Cli::command();
        clap_complete::generate(*shell, &mut command, "clipgatectl", &mut io::stdout());
        return Ok(());
    }

    let context = AppContext::new(&cli)?;
    match &cli.command {
        Commands::CheckConfig => {
            let report = context.check_config(|key| std::env::var(key).ok());
            render(&report, cli.format)?;
            if report
                .iter()
                .any(|entry| matches!(entry.status, CheckStatus::Error))
            {
                return Err(AppError::MissingResource(
                    "one or more checks failed".to_string(),
                ));
            }
        }
        Commands::Status => {
            let sampler = ProcSampler::new(Arc::new(FsDiskProbe::new(context.existing_downloads()?)));
            let status = context.status(&sampler)?;
            render(&status, cli.format)?;
        }
        Commands::Plan(args) => {
            let pressure = match args.pressure {
                Some(level) => level.into(),
                None => {
                    let probe = FsDiskProbe::new(context.existing_downloads()?);
                    let snapshot = ProcSampler::new(Arc::new(probe)).sample()?;
                    context.planner().classify(&snapshot)
                }
            };
            let plan = context.plan(args, pressure)?;
            render(&plan, cli.format)?;
        }
        Commands::Sweep(args) => {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            let summary = runtime.block_on(context.sweep(args))?;
            render(&summary, cli.format)?;
        }
        Commands::Daemon => {
            context.config.bot_token()?;
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            let metrics = runtime.block_on(context.daemon())?;
            render(&metrics, cli.format)?;
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config_path: PathBuf,
    config: GatewayConfig,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config = load_gateway_config(&cli.config)?;
        Ok(Self {
            config_path: cli.config.clone(),
            config,
        })
    }

    fn planner(&self) -> BitratePlanner {
        BitratePlanner::from_config(&self.config)
    }

    fn existing_downloads(&self) -> Result<PathBuf> {
        let dir = self.config.downloads_dir();
        if dir.is_dir() {
            Ok(dir)
        } else {
            Err(AppError::MissingResource(format!(
                "downloads directory {} does not exist",
                dir.display()
            )))
        }
    }

    fn check_config<F>(&self, lookup: F) -> Vec<HealthEntry>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut entries = vec![HealthEntry::ok(
            "config",
            format!("{} loaded and validated", self.config_path.display()),
        )];

        entries.push(match self.config.bot_token_with(&lookup) {
            Ok(_) => HealthEntry::ok("credential", format!("{} is set", self.config.bot.token_env)),
            Err(err) => HealthEntry::error("credential", err.to_string()),
        });

        let downloads = self.config.downloads_dir();
        entries.push(if downloads.is_dir() {
            HealthEntry::ok("downloads_dir", downloads.display().to_string())
        } else {
            HealthEntry::warn(
                "downloads_dir",
                format!("{} missing; created on daemon start", downloads.display()),
            )
        });

        let ffmpeg = &self.config.transcode.ffmpeg_path;
        entries.push(match find_executable(ffmpeg, lookup("PATH").as_deref()) {
            Some(path) => HealthEntry::ok("ffmpeg", path.display().to_string()),
            None => HealthEntry::warn("ffmpeg", format!("{ffmpeg} not found; compression will fail")),
        });

        let delivery = &self.config.delivery;
        entries.push(HealthEntry::ok(
            "ceilings",
            format!(
                "target {} MB, delivery {} MB, platform {} MB",
                delivery.target_size_mb, delivery.delivery_ceiling_mb, delivery.platform_ceiling_mb
            ),
        ));
        entries
    }

    fn status(&self, sampler: &dyn SystemSampler) -> Result<StatusReport> {
        let snapshot = sampler.sample()?;
        let planner = self.planner();
        let registry = FileRegistry::new();
        let downloads = self.config.downloads_dir();
        if downloads.is_dir() {
            registry.adopt_directory(&downloads)?;
        }
        Ok(StatusReport {
            pressure: planner.classify(&snapshot),
            over_disk_threshold: snapshot.disk_percent >= self.config.monitor.max_disk_percent,
            over_memory_threshold: snapshot.memory_percent > self.config.monitor.max_memory_percent,
            snapshot,
            thresholds: Thresholds {
                max_disk_percent: self.config.monitor.max_disk_percent,
                max_memory_percent: self.config.monitor.max_memory_percent,
                severe_memory_percent: self.config.monitor.severe_memory_percent,
                emergency_margin_percent: self.config.storage.emergency_margin_percent,
            },
            downloads_dir: downloads,
            tracked_files: registry.len(),
            tracked_bytes: registry.total_bytes(),
        })
    }

    fn plan(&self, args: &PlanArgs, pressure: PressureLevel) -> Result<PlanReport> {
        if !args.duration.is_finite() || args.duration <= 0.0 {
            return Err(AppError::InvalidArgument(
                "duration must be a positive number of seconds".into(),
            ));
        }
        let target_mb = args
            .target_mb
            .unwrap_or(self.config.delivery.target_size_mb as f64);
        let audio_bitrate_bps = self.config.transcode.audio_bitrate_bps;
        let plan = self
            .planner()
            .plan(args.duration, target_mb, audio_bitrate_bps, pressure);
        let source = args.width.zip(args.height);
        let transcode = TranscodePlan::new(&plan, audio_bitrate_bps, source);
        Ok(PlanReport {
            duration_seconds: args.duration,
            plan,
            frame: transcode.frame,
        })
    }

    async fn sweep(&self, args: &SweepArgs) -> Result<SweepSummary> {
        let dir = args
            .dir
            .clone()
            .unwrap_or_else(|| self.config.downloads_dir());
        if !dir.is_dir() {
            return Err(AppError::MissingResource(format!(
                "{} is not a directory",
                dir.display()
            )));
        }
        let max_age = args
            .max_age_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.config.storage.max_file_age());
        let reclaimer = Reclaimer::new(
            FileRegistry::new(),
            Arc::new(FsDiskProbe::new(&dir)),
            max_age,
            SharedMetrics::new(),
        );
        let tracked = reclaimer.registry().adopt_directory(&dir)?;

        if args.dry_run {
            let candidates = reclaimer.expired();
            return Ok(SweepSummary {
                dir,
                tracked,
                dry_run: true,
                bytes_freed: candidates.iter().map(|file| file.size_bytes).sum(),
                files: candidates.into_iter().map(|file| file.path).collect(),
                failures: 0,
            });
        }

        let report = reclaimer.scheduled_sweep().await;
        Ok(SweepSummary {
            dir,
            tracked,
            dry_run: false,
            files: report.evicted,
            bytes_freed: report.bytes_freed,
            failures: report.failures,
        })
    }

    async fn daemon(&self) -> Result<MetricsReport> {
        let supervisor = Supervisor::new(self.config.clone())?;
        supervisor.start()?;
        info!(config = %self.config_path.display(), "clipgate daemon running; press Ctrl-C to stop");
        tokio::signal::ctrl_c().await?;
        info!("interrupt received; shutting down");
        let metrics = supervisor.shutdown().await;
        Ok(MetricsReport::from(metrics))
    }
}

fn find_executable(name: &str, search_path: Option<&str>) -> Option<PathBuf> {
    let candidate = Path::new(name);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    std::env::split_paths(search_path?)
        .map(|dir| dir.join(name))
        .find(|path| path.is_file())
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub snapshot: PressureSnapshot,
    pub pressure: PressureLevel,
    pub over_disk_threshold: bool,
    pub over_memory_threshold: bool,
    pub thresholds: Thresholds,
    pub downloads_dir: PathBuf,
    pub tracked_files: usize,
    pub tracked_bytes: u64,
}

#[derive(Debug, Serialize)]
pub struct Thresholds {
    pub max_disk_percent: f64,
    pub max_memory_percent: f64,
    pub severe_memory_percent: f64,
    pub emergency_margin_percent: f64,
}

impl DisplayFallback for StatusReport {
    fn display(&self) -> String {
        let flag = |over: bool| if over { " (over threshold)" } else { "" };
        let lines = [
            format!("Pressure: {}", self.pressure),
            format!("  - CPU: {:.1}%", self.snapshot.cpu_percent),
            format!(
                "  - Memory: {:.1}% / {:.0}%{}",
                self.snapshot.memory_percent,
                self.thresholds.max_memory_percent,
                flag(self.over_memory_threshold)
            ),
            format!(
                "  - Disk: {:.1}% / {:.0}%{}",
                self.snapshot.disk_percent,
                self.thresholds.max_disk_percent,
                flag(self.over_disk_threshold)
            ),
            format!(
                "Downloads: {} ({} files, {:.1} MB)",
                self.downloads_dir.display(),
                self.tracked_files,
                self.tracked_bytes as f64 / BYTES_PER_MB as f64
            ),
        ];
        lines.join("\n")
    }
}

/// Final counters printed when the daemon stops.
#[derive(Debug, Serialize)]
pub struct MetricsReport {
    pub uptime_seconds: i64,
    pub average_fetch_seconds: f64,
    #[serde(flatten)]
    pub metrics: GatewayMetrics,
}

impl From<GatewayMetrics> for MetricsReport {
    fn from(metrics: GatewayMetrics) -> Self {
        Self {
            uptime_seconds: metrics.uptime_seconds(),
            average_fetch_seconds: metrics.average_fetch_seconds(),
            metrics,
        }
    }
}

impl DisplayFallback for MetricsReport {
    fn display(&self) -> String {
        let m = &self.metrics;
        let mut lines = vec![
            format!("Uptime: {} s", self.uptime_seconds),
            format!(
                "Jobs: {} admitted, {} rejected, {} delivered, {} failed, {} compressed",
                m.admitted, m.rejected, m.delivered, m.failed, m.compressed
            ),
            format!(
                "Fetches: {} ({:.1} MB, avg {:.2} s)",
                m.fetches,
                m.fetched_bytes as f64 / BYTES_PER_MB as f64,
                self.average_fetch_seconds
            ),
            format!(
                "Reclaimed: {} files, {:.1} MB ({} scheduled / {} emergency sweeps)",
                m.files_evicted,
                m.bytes_reclaimed as f64 / BYTES_PER_MB as f64,
                m.scheduled_sweeps,
                m.emergency_sweeps
            ),
        ];
        lines.extend(m.rejections.iter().map(|(reason, count)| format!("  - rejected {reason}: {count}")));
        lines.extend(m.errors.iter().map(|(kind, count)| format!("  - error {kind}: {count}")));
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct PlanReport {
    pub duration_seconds: f64,
    pub plan: BitratePlan,
    pub frame: Option<(u32, u32)>,
}

impl DisplayFallback for PlanReport {
    fn display(&self) -> String {
        let mut lines = vec![
            format!("Pressure: {}", self.plan.pressure),
            format!("Target: {:.1} MB over {:.0} s", self.plan.target_size_mb, self.duration_seconds),
            format!("Video bitrate: {} bps", self.plan.video_bitrate_bps),
            format!("Max height: {}p", self.plan.max_height),
        ];
        if let Some((width, height)) = self.frame {
            lines.push(format!("Frame: {width}x{height}"));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct SweepSummary {
    pub dir: PathBuf,
    pub tracked: usize,
    pub dry_run: bool,
    pub files: Vec<PathBuf>,
    pub bytes_freed: u64,
    pub failures: usize,
}

impl DisplayFallback for SweepSummary {
    fn display(&self) -> String {
        let verb = if self.dry_run { "Would delete" } else { "Deleted" };
        let mut lines = vec![format!(
            "{verb} {} of {} files in {} ({:.1} MB)",
            self.files.len(),
            self.tracked,
            self.dir.display(),
            self.bytes_freed as f64 / BYTES_PER_MB as f64
        )];
        lines.extend(self.files.iter().map(|path| format!("  - {}", path.display())));
        if self.failures > 0 {
            lines.push(format!("{} deletions failed", self.failures));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for Vec<HealthEntry> {
    fn display(&self) -> String {
        self.iter()
            .map(DisplayFallback::display)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct HealthEntry {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub enum CheckStatus {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "error")]
    Error,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckStatus::Ok => "OK",
            CheckStatus::Warn => "WARN",
            CheckStatus::Error => "ERROR",
        };
        write!(f, "{}", label)
    }
}

impl HealthEntry {
    fn ok(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::with_status(name, CheckStatus::Ok, detail)
    }

    fn warn(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::with_status(name, CheckStatus::Warn, detail)
    }

    fn error(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::with_status(name, CheckStatus::Error, detail)
    }

    fn with_status(name: impl Into<String>, status: CheckStatus, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status,
            detail: detail.into(),
        }
    }
}

impl DisplayFallback for HealthEntry {
    fn display(&self) -> String {
        format!("[{}] {}: {}", self.status, self.name, self.detail)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::SystemTime;

    use chrono::Utc;
    use tempfile::TempDir;

    use super::*;

    struct FixedSampler(f64);

    impl SystemSampler for FixedSampler {
        fn sample(&self) -> std::result::Result<PressureSnapshot, MonitorError> {
            Ok(PressureSnapshot {
                cpu_percent: 12.0,
                memory_percent: 50.0,
                disk_percent: self.0,
                sampled_at: Utc::now(),
            })
        }
    }

    fn prepare_test_context() -> (TempDir, AppContext) {
        let temp = TempDir::new().unwrap();
        let downloads = temp.path().join("downloads");
        fs::create_dir_all(&downloads).unwrap();
        let mut config = load_gateway_config("../configs/clipgate.toml").unwrap();
        config.paths.downloads_dir = downloads.to_string_lossy().into_owned();
        let context = AppContext {
            config_path: PathBuf::from("../configs/clipgate.toml"),
            config,
        };
        (temp, context)
    }

    fn backdate(path: &Path, age: Duration) {
        let file = fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
    }

    #[test]
    fn fixture_loads_through_cli_context() {
        let cli = Cli {
            config: PathBuf::from("../configs/clipgate.toml"),
            format: OutputFormat::Json,
            command: Commands::CheckConfig,
        };
        let context = AppContext::new(&cli).unwrap();
        assert_eq!(context.config.delivery.delivery_ceiling_mb, 49);
    }

    #[test]
    fn check_config_flags_missing_credential() {
        let (_temp, context) = prepare_test_context();
        let report = context.check_config(|_| None);
        let credential = report.iter().find(|entry| entry.name == "credential").unwrap();
        assert!(matches!(credential.status, CheckStatus::Error));
        let downloads = report.iter().find(|entry| entry.name == "downloads_dir").unwrap();
        assert!(matches!(downloads.status, CheckStatus::Ok));

        let report = context.check_config(|key| (key == "TELEGRAM_BOT_TOKEN").then(|| "1:x".into()));
        assert!(!report
            .iter()
            .any(|entry| matches!(entry.status, CheckStatus::Error)));
    }

    #[test]
    fn status_reports_pressure_and_tracked_files() {
        let (_temp, context) = prepare_test_context();
        let downloads = context.config.downloads_dir();
        fs::write(downloads.join("a.mp4"), vec![0u8; 2048]).unwrap();

        let status = context.status(&FixedSampler(85.0)).unwrap();
        assert_eq!(status.pressure, PressureLevel::Severe);
        assert!(status.over_disk_threshold);
        assert!(!status.over_memory_threshold);
        assert_eq!(status.tracked_files, 1);
        assert_eq!(status.tracked_bytes, 2048);
        assert!(status.display().contains("(over threshold)"));
    }

    #[test]
    fn plan_applies_requested_pressure() {
        let (_temp, context) = prepare_test_context();
        let args = PlanArgs {
            duration: 60.0,
            target_mb: None,
            width: Some(1920),
            height: Some(1080),
            pressure: Some(PressureArg::Moderate),
        };
        let report = context.plan(&args, PressureArg::Moderate.into()).unwrap();
        assert_eq!(report.plan.max_height, 480);
        assert_eq!(report.frame, Some((852, 480)));
        assert!((report.plan.target_size_mb - 36.0).abs() < 1e-9);

        let invalid = PlanArgs { duration: 0.0, ..args };
        assert!(matches!(
            context.plan(&invalid, PressureLevel::Normal),
            Err(AppError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn sweep_dry_run_lists_without_deleting() {
        let (_temp, context) = prepare_test_context();
        let downloads = context.config.downloads_dir();
        let stale = downloads.join("stale.mp4");
        let fresh = downloads.join("fresh.mp4");
        fs::write(&stale, vec![0u8; 100]).unwrap();
        fs::write(&fresh, vec![0u8; 100]).unwrap();
        backdate(&stale, Duration::from_secs(30));

        let args = SweepArgs {
            dir: None,
            max_age_secs: Some(10),
            dry_run: true,
        };
        let summary = context.sweep(&args).await.unwrap();
        assert_eq!(summary.tracked, 2);
        assert_eq!(summary.files, vec![stale.clone()]);
        assert!(stale.exists());

        let summary = context
            .sweep(&SweepArgs {
                dry_run: false,
                ..args
            })
            .await
            .unwrap();
        assert_eq!(summary.files, vec![stale.clone()]);
        assert_eq!(summary.bytes_freed, 100);
        assert!(!stale.exists());
        assert!(fresh.exists());
    }

    #[test]
    fn metrics_report_surfaces_counters_and_derived_values() {
        let mut metrics = GatewayMetrics::default();
        metrics.record_admission();
        metrics.record_admission();
        metrics.record_rejection("server_busy");
        metrics.record_fetch(Duration::from_millis(3000), BYTES_PER_MB);
        metrics.record_fetch(Duration::from_millis(1000), BYTES_PER_MB);
        metrics.record_failure("fetch");
        metrics.record_eviction(2 * BYTES_PER_MB);

        let report = MetricsReport::from(metrics);
        assert!((report.average_fetch_seconds - 2.0).abs() < 1e-9);
        let text = report.display();
        assert!(text.contains("2 admitted, 1 rejected"));
        assert!(text.contains("avg 2.00 s"));
        assert!(text.contains("rejected server_busy: 1"));
        assert!(text.contains("error fetch: 1"));

        let json: serde_json::Value = serde_json::to_value(&report).unwrap();
        assert_eq!(json["admitted"], 2);
        assert_eq!(json["files_evicted"], 1);
        assert_eq!(json["average_fetch_seconds"], 2.0);
    }

    #[test]
    fn find_executable_searches_the_given_path() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("ffmpeg"), b"").unwrap();
        let search = temp.path().to_string_lossy().into_owned();
        assert_eq!(
            find_executable("ffmpeg", Some(&search)),
            Some(temp.path().join("ffmpeg"))
        );
        assert_eq!(find_executable("ffmpeg", None), None);
    }
}

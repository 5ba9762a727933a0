//! Owns the shared components and the background loops that keep the host
//! within its disk and memory budget.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::join_all;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::admission::AdmissionController;
use crate::config::GatewayConfig;
use crate::metrics::{GatewayMetrics, SharedMetrics};
use crate::monitor::{MonitorSettings, ProcSampler, ResourceMonitor, SystemSampler};
use crate::orchestrator::{Collaborators, JobOrchestrator};
use crate::storage::{DiskProbe, FileRegistry, FsDiskProbe, Reclaimer};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to prepare downloads directory {path}: {source}")]
    Downloads {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("background tasks already started")]
    AlreadyStarted,
}

pub struct Supervisor {
    config: GatewayConfig,
    metrics: SharedMetrics,
    admission: Arc<AdmissionController>,
    reclaimer: Arc<Reclaimer>,
    monitor: Arc<ResourceMonitor>,
    single_flight: Arc<AsyncMutex<()>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("downloads_dir", &self.config.paths.downloads_dir)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl Supervisor {
    /// Prepares the downloads directory, adopts files a previous run left
    /// behind, and samples the host through procfs.
    pub fn new(config: GatewayConfig) -> Result<Self, SupervisorError> {
        let dir = config.downloads_dir();
        std::fs::create_dir_all(&dir).map_err(|source| SupervisorError::Downloads {
            path: dir.clone(),
            source,
        })?;
        let probe: Arc<dyn DiskProbe> = Arc::new(FsDiskProbe::new(&dir));
        let sampler: Arc<dyn SystemSampler> = Arc::new(ProcSampler::new(Arc::clone(&probe)));
        let supervisor = Self::with_parts(config, sampler, probe);
        match supervisor.reclaimer.registry().adopt_directory(&dir) {
            Ok(0) => {}
            Ok(adopted) => info!(adopted, dir = %dir.display(), "adopted leftover files"),
            Err(err) => warn!(error = %err, dir = %dir.display(), "could not scan downloads directory"),
        }
        Ok(supervisor)
    }

    pub fn with_parts(
        config: GatewayConfig,
        sampler: Arc<dyn SystemSampler>,
        probe: Arc<dyn DiskProbe>,
    ) -> Self {
        let metrics = SharedMetrics::new();
        let admission = Arc::new(AdmissionController::from_config(
            &config.quota,
            metrics.clone(),
        ));
        let reclaimer = Arc::new(Reclaimer::new(
            FileRegistry::new(),
            probe,
            config.storage.max_file_age(),
            metrics.clone(),
        ));
        let monitor = Arc::new(ResourceMonitor::new(
            sampler,
            Arc::clone(&reclaimer),
            Arc::clone(&admission),
            metrics.clone(),
            MonitorSettings::from_config(&config),
        ));
        Self {
            config,
            metrics,
            admission,
            reclaimer,
            monitor,
            single_flight: Arc::new(AsyncMutex::new(())),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    pub fn reclaimer(&self) -> &Arc<Reclaimer> {
        &self.reclaimer
    }

    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.monitor
    }

    /// Builds a job pipeline sharing this supervisor's quota, registry,
    /// pressure signal and single-flight lock. Every orchestrator handed out
    /// here waits on the same lock.
    pub fn orchestrator(&self, collaborators: Collaborators) -> JobOrchestrator {
        JobOrchestrator::new(
            &self.config,
            Arc::clone(&self.admission),
            Arc::clone(&self.reclaimer),
            self.monitor.pressure(),
            self.metrics.clone(),
            collaborators,
        )
        .with_single_flight(Arc::clone(&self.single_flight))
    }

    /// Spawns the monitor and scheduled-sweep loops on the current runtime.
    pub fn start(&self) -> Result<(), SupervisorError> {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if !tasks.is_empty() || self.cancel.is_cancelled() {
            return Err(SupervisorError::AlreadyStarted);
        }
        let interval = self.config.storage.cleanup_interval();

        let monitor = Arc::clone(&self.monitor);
        let cancel = self.cancel.child_token();
        tasks.push(tokio::spawn(async move {
            monitor.run(interval, cancel).await;
        }));

        let reclaimer = Arc::clone(&self.reclaimer);
        let cancel = self.cancel.child_token();
        tasks.push(tokio::spawn(async move {
            reclaimer.run(interval, cancel).await;
        }));

        info!(interval_secs = interval.as_secs(), "supervisor started");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
            && !self
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_empty()
    }

    /// Closes admission, stops both loops and waits for them to exit. Jobs
    /// already in flight are left to finish on their own. Returns the final
    /// counters.
    pub async fn shutdown(&self) -> GatewayMetrics {
        self.admission.close();
        self.cancel.cancel();
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for result in join_all(tasks).await {
            if let Err(err) = result {
                warn!(error = %err, "background task ended abnormally");
            }
        }
        let metrics = self.metrics.snapshot();
        metrics.log_summary();
        info!("supervisor stopped");
        metrics
    }
}

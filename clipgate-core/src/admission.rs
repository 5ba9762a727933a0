use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::QuotasSection;
use crate::metrics::SharedMetrics;
use crate::orchestrator::JobKind;
use crate::quota::{Identity, QuotaDecision, QuotaDenial, QuotaLedger};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    Quota(QuotaDenial),
    ServerBusy,
    ShuttingDown,
    InvalidSource,
}

impl DenyReason {
    pub fn label(&self) -> &'static str {
        match self {
            DenyReason::Quota(QuotaDenial::Blocked) => "blocked",
            DenyReason::Quota(QuotaDenial::RequestLimitExceeded) => "request_limit",
            DenyReason::Quota(QuotaDenial::ByteLimitExceeded) => "byte_limit",
            DenyReason::Quota(QuotaDenial::SingleFileTooLarge) => "single_file_too_large",
            DenyReason::ServerBusy => "server_busy",
            DenyReason::ShuttingDown => "shutting_down",
            DenyReason::InvalidSource => "invalid_source",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::Quota(denial) => write!(f, "{denial}"),
            DenyReason::ServerBusy => f.write_str("server busy"),
            DenyReason::ShuttingDown => f.write_str("shutting down"),
            DenyReason::InvalidSource => f.write_str("invalid source url"),
        }
    }
}

impl From<QuotaDenial> for DenyReason {
    fn from(denial: QuotaDenial) -> Self {
        DenyReason::Quota(denial)
    }
}

/// Proof of a provisional quota charge. It must be handed back through
/// [`AdmissionController::release`] when the job produces nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionTicket {
    identity: Identity,
    kind: JobKind,
    charged_bytes: u64,
    window_start: Instant,
}

impl AdmissionTicket {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn charged_bytes(&self) -> u64 {
        self.charged_bytes
    }

    /// Start of the quota window the charge was made in.
    pub fn window_start(&self) -> Instant {
        self.window_start
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionDecision {
    Admitted(AdmissionTicket),
    Denied(DenyReason),
}

#[derive(Debug)]
pub struct AdmissionController {
    video: QuotaLedger,
    audio: QuotaLedger,
    accepting: AtomicBool,
    server_busy: AtomicBool,
    metrics: SharedMetrics,
}

impl AdmissionController {
    pub fn new(video: QuotaLedger, audio: QuotaLedger, metrics: SharedMetrics) -> Self {
        Self {
            video,
            audio,
            accepting: AtomicBool::new(true),
            server_busy: AtomicBool::new(false),
            metrics,
        }
    }

    pub fn from_config(quota: &QuotasSection, metrics: SharedMetrics) -> Self {
        Self::new(
            QuotaLedger::from_section("video", &quota.video),
            QuotaLedger::from_section("audio", &quota.audio),
            metrics,
        )
    }

    pub fn ledger(&self, kind: JobKind) -> &QuotaLedger {
        match kind {
            JobKind::Video => &self.video,
            JobKind::Audio => &self.audio,
        }
    }

    /// Decides whether a job may start. Runs before any fetch so a rejected
    /// identity never costs bandwidth or disk. `estimated_cost` may be 0.
    pub fn admit(&self, identity: &Identity, kind: JobKind, estimated_cost: u64) -> AdmissionDecision {
        if !self.accepting.load(Ordering::Acquire) {
            return self.deny(identity, kind, DenyReason::ShuttingDown);
        }
        if self.server_busy.load(Ordering::Acquire) {
            return self.deny(identity, kind, DenyReason::ServerBusy);
        }
        match self.ledger(kind).charge(identity, estimated_cost) {
            Ok(window_start) => {
                self.metrics.update(|m| m.record_admission());
                debug!(identity = %identity, kind = %kind, estimated_cost, "job admitted");
                AdmissionDecision::Admitted(AdmissionTicket {
                    identity: identity.clone(),
                    kind,
                    charged_bytes: estimated_cost,
                    window_start,
                })
            }
            Err(denial) => self.deny(identity, kind, denial.into()),
        }
    }

    /// Charges the real size once the fetch is done. A denial has already
    /// refunded the provisional charge, so the ticket is consumed either way.
    pub fn confirm_actual_size(
        &self,
        ticket: AdmissionTicket,
        actual_bytes: u64,
    ) -> Result<AdmissionTicket, DenyReason> {
        let ledger = self.ledger(ticket.kind);
        match ledger.settle_charge(
            &ticket.identity,
            ticket.charged_bytes,
            actual_bytes,
            Some(ticket.window_start),
        ) {
            QuotaDecision::Allowed => Ok(AdmissionTicket {
                charged_bytes: actual_bytes,
                ..ticket
            }),
            QuotaDecision::Denied(denial) => {
                warn!(
                    identity = %ticket.identity,
                    kind = %ticket.kind,
                    actual_bytes,
                    reason = %denial,
                    "post-fetch size check rejected job"
                );
                Err(denial.into())
            }
        }
    }

    /// Refunds the ticket's charge, unless the window it was made in has
    /// already rolled over.
    pub fn release(&self, ticket: AdmissionTicket) {
        self.ledger(ticket.kind)
            .release_charge(&ticket.identity, ticket.charged_bytes, ticket.window_start);
    }

    /// Stops admitting new jobs. In-flight jobs are left alone.
    pub fn close(&self) {
        if self.accepting.swap(false, Ordering::AcqRel) {
            info!("admission closed");
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub fn set_server_busy(&self, busy: bool) {
        let previous = self.server_busy.swap(busy, Ordering::AcqRel);
        if previous != busy {
            if busy {
                warn!("disk pressure unresolved; denying new admissions");
            } else {
                info!("disk pressure relieved; admissions resumed");
            }
        }
    }

    pub fn is_server_busy(&self) -> bool {
        self.server_busy.load(Ordering::Acquire)
    }

    fn deny(&self, identity: &Identity, kind: JobKind, reason: DenyReason) -> AdmissionDecision {
        self.metrics.update(|m| m.record_rejection(reason.label()));
        info!(identity = %identity, kind = %kind, reason = %reason, "job rejected");
        AdmissionDecision::Denied(reason)
    }
}

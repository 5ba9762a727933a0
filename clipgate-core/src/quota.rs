use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::config::QuotaSection;

/// Opaque key identifying the user a job is charged to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Identity {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<i64> for Identity {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}

impl From<u64> for Identity {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaDenial {
    Blocked,
    RequestLimitExceeded,
    ByteLimitExceeded,
    SingleFileTooLarge,
}

impl fmt::Display for QuotaDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            QuotaDenial::Blocked => "blocked",
            QuotaDenial::RequestLimitExceeded => "request limit exceeded",
            QuotaDenial::ByteLimitExceeded => "byte quota exceeded",
            QuotaDenial::SingleFileTooLarge => "single file too large",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    Allowed,
    Denied(QuotaDenial),
}

impl QuotaDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, QuotaDecision::Allowed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaLimits {
    pub window: Duration,
    pub max_requests: u32,
    pub max_window_bytes: u64,
    pub max_single_file_bytes: u64,
}

impl From<&QuotaSection> for QuotaLimits {
    fn from(section: &QuotaSection) -> Self {
        Self {
            window: section.window(),
            max_requests: section.max_requests,
            max_window_bytes: section.max_window_bytes(),
            max_single_file_bytes: section.max_single_file_bytes(),
        }
    }
}

/// Per-identity counters. Only the ledger mutates these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaState {
    pub request_count: u32,
    pub window_start: Instant,
    pub cumulative_bytes: u64,
    pub blocked_until: Option<Instant>,
    pub blocked_permanently: bool,
}

impl QuotaState {
    fn new(now: Instant) -> Self {
        Self {
            request_count: 0,
            window_start: now,
            cumulative_bytes: 0,
            blocked_until: None,
            blocked_permanently: false,
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked_permanently || self.blocked_until.is_some()
    }

    fn expire_block(&mut self, now: Instant) -> bool {
        match self.blocked_until {
            Some(deadline) if !self.blocked_permanently && now >= deadline => {
                self.blocked_until = None;
                true
            }
            _ => false,
        }
    }

    fn roll_window(&mut self, now: Instant, window: Duration) {
        if now.duration_since(self.window_start) >= window {
            self.request_count = 0;
            self.cumulative_bytes = 0;
            self.window_start = now;
        }
    }

    fn refund(&mut self, byte_cost: u64) {
        self.request_count = self.request_count.saturating_sub(1);
        self.cumulative_bytes = self.cumulative_bytes.saturating_sub(byte_cost);
    }
}

struct ScheduledUnblock {
    deadline: Instant,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct LedgerInner {
    states: Mutex<HashMap<Identity, QuotaState>>,
    unblocks: Mutex<HashMap<Identity, ScheduledUnblock>>,
}

impl LedgerInner {
    fn states(&self) -> MutexGuard<'_, HashMap<Identity, QuotaState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn unblocks(&self) -> MutexGuard<'_, HashMap<Identity, ScheduledUnblock>> {
        self.unblocks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel_unblock(&self, identity: &Identity) {
        if let Some(scheduled) = self.unblocks().remove(identity) {
            scheduled.handle.abort();
        }
    }

    fn lift_block(&self, identity: &Identity, deadline: Instant) {
        let lifted = {
            let mut states = self.states();
            match states.get_mut(identity) {
                Some(state)
                    if !state.blocked_permanently && state.blocked_until == Some(deadline) =>
                {
                    state.blocked_until = None;
                    true
                }
                _ => false,
            }
        };
        let mut unblocks = self.unblocks();
        if unblocks
            .get(identity)
            .is_some_and(|scheduled| scheduled.deadline == deadline)
        {
            unblocks.remove(identity);
        }
        if lifted {
            info!(identity = %identity, "scheduled unblock fired");
        }
    }
}

impl Drop for LedgerInner {
    fn drop(&mut self) {
        let unblocks = self.unblocks.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, scheduled) in unblocks.drain() {
            scheduled.handle.abort();
        }
    }
}

/// Sliding-window request and byte accounting per identity.
///
/// All state sits behind one mutex that is never held across an await, so
/// checks for different identities stay cheap and never wait on fetch work.
/// Timed blocks are lifted by a deferred task that `unblock`/`reset` cancel.
#[derive(Clone)]
pub struct QuotaLedger {
    name: Arc<str>,
    limits: QuotaLimits,
    inner: Arc<LedgerInner>,
}

impl fmt::Debug for QuotaLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuotaLedger")
            .field("name", &self.name)
            .field("limits", &self.limits)
            .field("identities", &self.inner.states().len())
            .finish()
    }
}

impl QuotaLedger {
    pub fn new(name: impl Into<Arc<str>>, limits: QuotaLimits) -> Self {
        Self {
            name: name.into(),
            limits,
            inner: Arc::new(LedgerInner::default()),
        }
    }

    pub fn from_section(name: impl Into<Arc<str>>, section: &QuotaSection) -> Self {
        Self::new(name, QuotaLimits::from(section))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limits(&self) -> QuotaLimits {
        self.limits
    }

    pub fn try_consume(&self, identity: &Identity, byte_cost: u64) -> QuotaDecision {
        match self.charge(identity, byte_cost) {
            Ok(_) => QuotaDecision::Allowed,
            Err(denial) => QuotaDecision::Denied(denial),
        }
    }

    /// Same check as [`try_consume`](Self::try_consume), returning the start
    /// of the window the charge landed in so a later refund can target it.
    pub fn charge(&self, identity: &Identity, byte_cost: u64) -> Result<Instant, QuotaDenial> {
        let now = Instant::now();
        let mut states = self.inner.states();
        let state = states
            .entry(identity.clone())
            .or_insert_with(|| QuotaState::new(now));

        if state.expire_block(now) {
            debug!(ledger = %self.name, identity = %identity, "block deadline passed");
        }
        if state.is_blocked() {
            return Err(QuotaDenial::Blocked);
        }
        if byte_cost > self.limits.max_single_file_bytes {
            warn!(
                ledger = %self.name,
                identity = %identity,
                byte_cost,
                limit = self.limits.max_single_file_bytes,
                "single item exceeds size ceiling"
            );
            return Err(QuotaDenial::SingleFileTooLarge);
        }

        state.roll_window(now, self.limits.window);

        if state.request_count >= self.limits.max_requests {
            warn!(ledger = %self.name, identity = %identity, "request limit exceeded");
            return Err(QuotaDenial::RequestLimitExceeded);
        }
        if state.cumulative_bytes.saturating_add(byte_cost) > self.limits.max_window_bytes {
            warn!(
                ledger = %self.name,
                identity = %identity,
                used = state.cumulative_bytes,
                byte_cost,
                "byte quota exceeded"
            );
            return Err(QuotaDenial::ByteLimitExceeded);
        }

        state.request_count += 1;
        state.cumulative_bytes = state.cumulative_bytes.saturating_add(byte_cost);
        Ok(state.window_start)
    }

    /// Refunds a previous `try_consume`. Counters never drop below zero.
    pub fn release(&self, identity: &Identity, byte_cost: u64) {
        if let Some(state) = self.inner.states().get_mut(identity) {
            state.refund(byte_cost);
            debug!(ledger = %self.name, identity = %identity, byte_cost, "quota released");
        }
    }

    /// Refunds a charge made by [`charge`](Self::charge). Once the window has
    /// rolled the charge is already gone, and the current window is left
    /// untouched. Returns whether anything was refunded.
    pub fn release_charge(&self, identity: &Identity, byte_cost: u64, window_start: Instant) -> bool {
        let mut states = self.inner.states();
        match states.get_mut(identity) {
            Some(state) if state.window_start == window_start => {
                state.refund(byte_cost);
                debug!(ledger = %self.name, identity = %identity, byte_cost, "quota released");
                true
            }
            _ => {
                debug!(ledger = %self.name, identity = %identity, "window rolled; nothing to refund");
                false
            }
        }
    }

    /// Replaces a provisional charge with the real size once it is known.
    /// On denial the provisional consumption is refunded in full.
    pub fn settle(&self, identity: &Identity, provisional: u64, actual: u64) -> QuotaDecision {
        self.settle_charge(identity, provisional, actual, None)
    }

    /// [`settle`](Self::settle) for a charge from a known window. If that
    /// window has rolled, only the single-file ceiling still applies and the
    /// current window's counters are not touched.
    pub fn settle_charge(
        &self,
        identity: &Identity,
        provisional: u64,
        actual: u64,
        window_start: Option<Instant>,
    ) -> QuotaDecision {
        let now = Instant::now();
        let mut states = self.inner.states();
        let state = states
            .entry(identity.clone())
            .or_insert_with(|| QuotaState::new(now));
        let same_window = window_start.map_or(true, |start| state.window_start == start);

        if actual > self.limits.max_single_file_bytes {
            if same_window {
                state.refund(provisional);
            }
            warn!(
                ledger = %self.name,
                identity = %identity,
                actual,
                "fetched item exceeds size ceiling"
            );
            return QuotaDecision::Denied(QuotaDenial::SingleFileTooLarge);
        }
        if !same_window {
            return QuotaDecision::Allowed;
        }
        let settled = state
            .cumulative_bytes
            .saturating_sub(provisional)
            .saturating_add(actual);
        if settled > self.limits.max_window_bytes {
            state.refund(provisional);
            warn!(ledger = %self.name, identity = %identity, actual, "byte quota exceeded after fetch");
            return QuotaDecision::Denied(QuotaDenial::ByteLimitExceeded);
        }
        state.cumulative_bytes = settled;
        QuotaDecision::Allowed
    }

    /// Blocks an identity. `None` blocks until `unblock`/`reset`; a duration
    /// schedules an automatic unblock without waiting for another request.
    pub fn block(&self, identity: &Identity, duration: Option<Duration>) {
        self.inner.cancel_unblock(identity);
        let now = Instant::now();
        let deadline = duration.map(|duration| now + duration);
        {
            let mut states = self.inner.states();
            let state = states
                .entry(identity.clone())
                .or_insert_with(|| QuotaState::new(now));
            state.blocked_permanently = deadline.is_none();
            state.blocked_until = deadline;
        }
        info!(ledger = %self.name, identity = %identity, duration = ?duration, "identity blocked");

        let Some(deadline) = deadline else {
            return;
        };
        match Handle::try_current() {
            Ok(runtime) => {
                let weak: Weak<LedgerInner> = Arc::downgrade(&self.inner);
                let target = identity.clone();
                let handle = runtime.spawn(async move {
                    sleep_until(deadline).await;
                    if let Some(inner) = weak.upgrade() {
                        inner.lift_block(&target, deadline);
                    }
                });
                self.inner
                    .unblocks()
                    .insert(identity.clone(), ScheduledUnblock { deadline, handle });
            }
            Err(_) => {
                debug!(
                    ledger = %self.name,
                    identity = %identity,
                    "no runtime for scheduled unblock; deadline checked on next request"
                );
            }
        }
    }

    pub fn unblock(&self, identity: &Identity) {
        self.inner.cancel_unblock(identity);
        if let Some(state) = self.inner.states().get_mut(identity) {
            state.blocked_until = None;
            state.blocked_permanently = false;
        }
        info!(ledger = %self.name, identity = %identity, "identity unblocked");
    }

    /// Forgets everything about an identity, including any block.
    pub fn reset(&self, identity: &Identity) {
        self.inner.cancel_unblock(identity);
        self.inner.states().remove(identity);
        info!(ledger = %self.name, identity = %identity, "quota reset");
    }

    pub fn reset_all(&self) {
        for (_, scheduled) in self.inner.unblocks().drain() {
            scheduled.handle.abort();
        }
        self.inner.states().clear();
        info!(ledger = %self.name, "all quotas reset");
    }

    pub fn is_blocked(&self, identity: &Identity) -> bool {
        self.inner
            .states()
            .get(identity)
            .is_some_and(QuotaState::is_blocked)
    }

    pub fn snapshot(&self, identity: &Identity) -> Option<QuotaState> {
        self.inner.states().get(identity).cloned()
    }

    pub fn scheduled_unblocks(&self) -> usize {
        self.inner.unblocks().len()
    }
}

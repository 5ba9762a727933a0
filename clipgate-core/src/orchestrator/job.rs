use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::admission::DenyReason;
use crate::quota::Identity;

use super::error::JobError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Video,
    Audio,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Video => f.write_str("video"),
            JobKind::Audio => f.write_str("audio"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum JobState {
    Queued,
    Admitted,
    Fetching,
    SizeChecked,
    Compressing,
    Compressed,
    Delivering,
    Delivered,
    Rejected(DenyReason),
    Failed(JobError),
}

impl JobState {
    pub fn label(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Admitted => "admitted",
            JobState::Fetching => "fetching",
            JobState::SizeChecked => "size_checked",
            JobState::Compressing => "compressing",
            JobState::Compressed => "compressed",
            JobState::Delivering => "delivering",
            JobState::Delivered => "delivered",
            JobState::Rejected(_) => "rejected",
            JobState::Failed(_) => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Delivered | JobState::Rejected(_) | JobState::Failed(_)
        )
    }

    fn permits(&self, next: &JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Queued, Admitted | Rejected(_)) => true,
            (Admitted, Fetching) => true,
            (Fetching, SizeChecked) => true,
            (SizeChecked, Delivering | Compressing) => true,
            (Compressing, Compressed) => true,
            (Compressed, Delivering) => true,
            (Delivering, Delivered) => true,
            (current, Failed(_)) => !current.is_terminal() && !matches!(current, Queued),
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Rejected(reason) => write!(f, "rejected ({reason})"),
            JobState::Failed(error) => write!(f, "failed ({error})"),
            other => f.write_str(other.label()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub identity: Identity,
    pub source_url: String,
    pub kind: JobKind,
    pub created_at: DateTime<Utc>,
    state: JobState,
    history: Vec<&'static str>,
}

impl Job {
    pub fn new(identity: Identity, source_url: impl Into<String>, kind: JobKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity,
            source_url: source_url.into(),
            kind,
            created_at: Utc::now(),
            state: JobState::Queued,
            history: vec![JobState::Queued.label()],
        }
    }

    pub fn state(&self) -> &JobState {
        &self.state
    }

    /// Labels of every state the job has passed through, oldest first.
    pub fn history(&self) -> &[&'static str] {
        &self.history
    }

    /// Moves the job along its state machine. Illegal moves leave the state
    /// untouched and surface as an internal error.
    pub fn advance(&mut self, next: JobState) -> Result<(), JobError> {
        if !self.state.permits(&next) {
            return Err(JobError::Internal(format!(
                "illegal job transition {} -> {}",
                self.state.label(),
                next.label()
            )));
        }
        debug!(job_id = %self.id, from = self.state.label(), to = next.label(), "job transition");
        self.history.push(next.label());
        self.state = next;
        Ok(())
    }
}

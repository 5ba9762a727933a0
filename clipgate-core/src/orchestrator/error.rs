use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::admission::DenyReason;
use crate::config::BYTES_PER_MB;
use crate::transcode::TranscodeError;

const ENOSPC: i32 = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    PrivateOrAuthRequired,
    NotAvailable,
    AgeRestricted,
    Other,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("fetch failed ({kind:?}): {message}")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub message: String,
}

impl FetchError {
    pub fn new(kind: FetchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Maps a downloader diagnostic onto a cause the user can act on.
    pub fn classify(diagnostic: impl Into<String>) -> Self {
        static PATTERNS: OnceLock<[(FetchErrorKind, Regex); 3]> = OnceLock::new();
        let patterns = PATTERNS.get_or_init(|| {
            [
                (
                    FetchErrorKind::PrivateOrAuthRequired,
                    Regex::new(r"(?i)HTTP Error 40[13]|private video|requires authentication|login required")
                        .expect("static pattern"),
                ),
                (
                    FetchErrorKind::AgeRestricted,
                    Regex::new(r"(?i)confirm your age|age[- ]restricted").expect("static pattern"),
                ),
                (
                    FetchErrorKind::NotAvailable,
                    Regex::new(r"(?i)not available|unavailable|HTTP Error 404|has been removed")
                        .expect("static pattern"),
                ),
            ]
        });
        let message = diagnostic.into();
        let kind = patterns
            .iter()
            .find(|(_, pattern)| pattern.is_match(&message))
            .map(|(kind, _)| *kind)
            .unwrap_or(FetchErrorKind::Other);
        Self { kind, message }
    }
}

/// Failure reported by the chat transport while handing over an artifact.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct DeliveryError(pub String);

#[derive(Debug, Clone, Error)]
pub enum JobError {
    #[error("admission denied: {0}")]
    AdmissionDenied(DenyReason),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("media too large: {size_bytes} bytes exceeds {ceiling_bytes}")]
    TooLarge { size_bytes: u64, ceiling_bytes: u64 },
    #[error("compression failed: {0}")]
    Compression(String),
    #[error("compressed media still too large: {size_bytes} bytes exceeds {ceiling_bytes}")]
    OversizeAfterCompression { size_bytes: u64, ceiling_bytes: u64 },
    #[error("resources exhausted: {0}")]
    ResourceExhaustion(String),
    #[error("delivery failed: {0}")]
    Delivery(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl JobError {
    pub fn io(path: &Path, error: std::io::Error) -> Self {
        JobError::Internal(format!("io error at {}: {error}", path.display()))
    }

    /// Out-of-space failures are reported as resource exhaustion so the
    /// caller can tell them apart from a broken source.
    pub fn from_transcode(error: TranscodeError) -> Self {
        let out_of_space = match &error {
            TranscodeError::Io(io) => io.raw_os_error() == Some(ENOSPC),
            TranscodeError::Failed { stderr, .. } => stderr.contains("No space left on device"),
        };
        if out_of_space {
            JobError::ResourceExhaustion(error.to_string())
        } else {
            JobError::Compression(error.to_string())
        }
    }

    pub fn kind_label(&self) -> &'static str {
        match self {
            JobError::AdmissionDenied(_) => "admission",
            JobError::Fetch(_) => "fetch",
            JobError::TooLarge { .. } => "too_large",
            JobError::Compression(_) => "compression",
            JobError::OversizeAfterCompression { .. } => "oversize",
            JobError::ResourceExhaustion(_) => "resource_exhaustion",
            JobError::Delivery(_) => "delivery",
            JobError::Internal(_) => "internal",
        }
    }

    /// Text shown to the requesting user. Internal details stay in the logs.
    pub fn user_message(&self) -> String {
        match self {
            JobError::AdmissionDenied(reason) => deny_message(*reason),
            JobError::Fetch(error) => match error.kind {
                FetchErrorKind::PrivateOrAuthRequired => {
                    "This media is private or requires signing in.".to_string()
                }
                FetchErrorKind::NotAvailable => "This media is not available.".to_string(),
                FetchErrorKind::AgeRestricted => {
                    "This media is age-restricted and cannot be fetched.".to_string()
                }
                FetchErrorKind::Other => {
                    "The media could not be downloaded. Check the link and try again.".to_string()
                }
            },
            JobError::TooLarge { ceiling_bytes, .. } => format!(
                "The media is too large (limit {} MB).",
                ceiling_bytes / BYTES_PER_MB
            ),
            JobError::Compression(_) => "The media could not be compressed.".to_string(),
            JobError::OversizeAfterCompression { ceiling_bytes, .. } => format!(
                "The media is still larger than {} MB after compression.",
                ceiling_bytes / BYTES_PER_MB
            ),
            JobError::ResourceExhaustion(_) => {
                "The server is short on resources. Please try again later.".to_string()
            }
            JobError::Delivery(_) | JobError::Internal(_) => {
                "Something went wrong. Please try again later.".to_string()
            }
        }
    }
}

pub fn deny_message(reason: DenyReason) -> String {
    use crate::quota::QuotaDenial;
    match reason {
        DenyReason::Quota(QuotaDenial::Blocked) => "You are blocked from making requests.".into(),
        DenyReason::Quota(QuotaDenial::RequestLimitExceeded) => {
            "Too many requests. Please wait a minute.".into()
        }
        DenyReason::Quota(QuotaDenial::ByteLimitExceeded) => {
            "Download volume limit reached. Please wait a while.".into()
        }
        DenyReason::Quota(QuotaDenial::SingleFileTooLarge) => "The file is too large.".into(),
        DenyReason::ServerBusy => "The server is busy. Please try again later.".into(),
        DenyReason::ShuttingDown => "The service is restarting. Please try again shortly.".into(),
        DenyReason::InvalidSource => "That does not look like a valid link.".into(),
    }
}

pub type JobResult<T> = Result<T, JobError>;

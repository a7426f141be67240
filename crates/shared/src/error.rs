use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::RequestId;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ChannelUnavailable,
    MalformedPayload,
    DialogBusy,
    StaleResponse,
    GapDetected,
}

/// Faults of the synchronization layer. None of them is fatal: each one
/// degrades to stale or missing data the console can render.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("channel unavailable: {0}")]
    ChannelUnavailable(String),
    #[error("malformed payload on topic '{topic}': {reason}")]
    MalformedPayload { topic: String, reason: String },
    #[error("dialog busy: request {pending} is still awaiting a decision")]
    DialogBusy { pending: RequestId },
    #[error("stale dialog response for request {request_id}")]
    StaleResponse { request_id: RequestId },
    #[error("terminal gap: expected sequence {expected}, stream resumed at {resumed_at}")]
    GapDetected { expected: u64, resumed_at: u64 },
}

impl SyncError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::ChannelUnavailable(reason.into())
    }

    pub fn malformed(topic: impl Into<String>, reason: impl ToString) -> Self {
        Self::MalformedPayload {
            topic: topic.into(),
            reason: reason.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::ChannelUnavailable(_) => ErrorKind::ChannelUnavailable,
            SyncError::MalformedPayload { .. } => ErrorKind::MalformedPayload,
            SyncError::DialogBusy { .. } => ErrorKind::DialogBusy,
            SyncError::StaleResponse { .. } => ErrorKind::StaleResponse,
            SyncError::GapDetected { .. } => ErrorKind::GapDetected,
        }
    }

    /// Whether repeating the same call later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::ChannelUnavailable(_) | SyncError::DialogBusy { .. }
        )
    }
}

//! Submission state types using the typestate pattern.
//!
//! Each submission progresses through distinct states, enforced at compile
//! time. The runtime-readable mirror of those states is [`SubmissionStatus`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Marker trait for valid submission states.
pub trait SubmissionState: Send + Sync {}

/// One run of the engine over a list of records.
///
/// The generic parameter `T` represents the current state of the submission.
#[derive(Debug, Clone, Serialize)]
pub struct Submission<T: SubmissionState> {
    pub state: T,
    pub data: SubmissionData,
}

/// Facts about a submission fixed once it starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmissionData {
    pub id: SubmissionId,
    pub total_records: usize,
    /// Known once records have been partitioned
    pub total_batches: usize,
    pub mode: SubmissionMode,
}

/// How records reach the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionMode {
    /// One multipart `$batch` request per batch
    #[default]
    Batch,
    /// One `POST` per record
    Individual,
}

/// Unique identifier for a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SubmissionId(pub Uuid);

impl std::fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl From<Uuid> for SubmissionId {
    fn from(uuid: Uuid) -> Self {
        SubmissionId(uuid)
    }
}

// ============================================================================
// Submission States
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct Idle {
    pub created_at: DateTime<Utc>,
}

impl SubmissionState for Idle {}

/// Waiting for the token probe.
#[derive(Debug, Clone, Serialize)]
pub struct TokenFetch {
    pub started_at: DateTime<Utc>,
}

impl SubmissionState for TokenFetch {}

/// Working through batches; `batch_index` is the next batch to dispatch.
#[derive(Debug, Clone, Serialize)]
pub struct Submitting {
    pub started_at: DateTime<Utc>,
    pub batch_index: usize,
}

impl SubmissionState for Submitting {}

/// All batches processed (terminal state).
#[derive(Debug, Clone, Serialize)]
pub struct Completed {
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl SubmissionState for Completed {}

/// Stopped at a batch boundary on request (terminal state).
#[derive(Debug, Clone, Serialize)]
pub struct Cancelled {
    pub started_at: DateTime<Utc>,
    pub cancelled_at: DateTime<Utc>,
    /// First batch that was not dispatched
    pub at_batch: usize,
}

impl SubmissionState for Cancelled {}

/// Rejected before any network activity (terminal state).
#[derive(Debug, Clone, Serialize)]
pub struct Failed {
    pub failed_at: DateTime<Utc>,
    pub reason: String,
}

impl SubmissionState for Failed {}

// ============================================================================
// Runtime status
// ============================================================================

/// The coordinator's current state, readable from outside while it runs.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubmissionStatus {
    #[default]
    Idle,
    TokenFetch {
        submission_id: SubmissionId,
    },
    Submitting {
        submission_id: SubmissionId,
        batch_index: usize,
        total_batches: usize,
    },
    Completed {
        submission_id: SubmissionId,
    },
    Cancelled {
        submission_id: SubmissionId,
        at_batch: usize,
    },
    Failed {
        reason: String,
    },
}

impl SubmissionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubmissionStatus::Completed { .. }
                | SubmissionStatus::Cancelled { .. }
                | SubmissionStatus::Failed { .. }
        )
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self,
            SubmissionStatus::TokenFetch { .. } | SubmissionStatus::Submitting { .. }
        )
    }
}

/// Shared slot the transitions publish into.
pub type StatusCell = Arc<RwLock<SubmissionStatus>>;

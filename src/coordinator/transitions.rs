//! State transitions for submissions using the typestate pattern.
//!
//! ```text
//! Submission<Idle> ──begin()──> Submission<TokenFetch> ──token_ready()──> Submission<Submitting>
//!       │                                                                   │   ▲
//!       └──fail()──> Submission<Failed>                                     │   └──advance()
//!                                                                           ├──complete()──> Submission<Completed>
//!                                                                           └──cancel()────> Submission<Cancelled>
//! ```
//!
//! Every transition publishes the new state to the coordinator's
//! [`StatusCell`] so UI code can poll it while a submission runs.

use chrono::Utc;
use uuid::Uuid;

use crate::error::BroadsideError;
use crate::token::Token;

use super::types::{
    Cancelled, Completed, Failed, Idle, StatusCell, Submission, SubmissionData, SubmissionId,
    SubmissionMode, SubmissionStatus, Submitting, TokenFetch,
};

impl Submission<Idle> {
    pub fn new(total_records: usize, mode: SubmissionMode) -> Self {
        Submission {
            state: Idle {
                created_at: Utc::now(),
            },
            data: SubmissionData {
                id: SubmissionId::from(Uuid::new_v4()),
                total_records,
                total_batches: 0,
                mode,
            },
        }
    }

    pub fn begin(self, total_batches: usize, status: &StatusCell) -> Submission<TokenFetch> {
        let submission = Submission {
            data: SubmissionData {
                total_batches,
                ..self.data
            },
            state: TokenFetch {
                started_at: Utc::now(),
            },
        };
        *status.write() = SubmissionStatus::TokenFetch {
            submission_id: submission.data.id,
        };
        tracing::debug!(
            submission_id = %submission.data.id,
            total_records = submission.data.total_records,
            total_batches,
            "Submission started, fetching token"
        );
        submission
    }

    pub fn fail(self, error: &BroadsideError, status: &StatusCell) -> Submission<Failed> {
        let reason = error.to_string();
        tracing::warn!(
            submission_id = %self.data.id,
            error = %reason,
            "Submission rejected before dispatch"
        );
        *status.write() = SubmissionStatus::Failed {
            reason: reason.clone(),
        };
        Submission {
            data: self.data,
            state: Failed {
                failed_at: Utc::now(),
                reason,
            },
        }
    }
}

impl Submission<TokenFetch> {
    /// The probe always resolves; an absent token does not block submission.
    pub fn token_ready(self, token: &Token, status: &StatusCell) -> Submission<Submitting> {
        tracing::debug!(
            submission_id = %self.data.id,
            freshness = ?token.freshness(),
            "Token fetch finished"
        );
        publish_submitting(&self.data, 0, status);
        Submission {
            data: self.data,
            state: Submitting {
                started_at: self.state.started_at,
                batch_index: 0,
            },
        }
    }
}

impl Submission<Submitting> {
    pub fn batch_index(&self) -> usize {
        self.state.batch_index
    }

    /// Move on after the current batch has been scored.
    pub fn advance(self, status: &StatusCell) -> Submission<Submitting> {
        let batch_index = self.state.batch_index + 1;
        if batch_index < self.data.total_batches {
            publish_submitting(&self.data, batch_index, status);
        }
        Submission {
            data: self.data,
            state: Submitting {
                started_at: self.state.started_at,
                batch_index,
            },
        }
    }

    pub fn complete(self, status: &StatusCell) -> Submission<Completed> {
        *status.write() = SubmissionStatus::Completed {
            submission_id: self.data.id,
        };
        Submission {
            data: self.data,
            state: Completed {
                started_at: self.state.started_at,
                completed_at: Utc::now(),
            },
        }
    }

    pub fn cancel(self, status: &StatusCell) -> Submission<Cancelled> {
        tracing::info!(
            submission_id = %self.data.id,
            at_batch = self.state.batch_index,
            total_batches = self.data.total_batches,
            "Submission cancelled at batch boundary"
        );
        *status.write() = SubmissionStatus::Cancelled {
            submission_id: self.data.id,
            at_batch: self.state.batch_index,
        };
        Submission {
            data: self.data,
            state: Cancelled {
                started_at: self.state.started_at,
                cancelled_at: Utc::now(),
                at_batch: self.state.batch_index,
            },
        }
    }
}

fn publish_submitting(data: &SubmissionData, batch_index: usize, status: &StatusCell) {
    *status.write() = SubmissionStatus::Submitting {
        submission_id: data.id,
        batch_index,
        total_batches: data.total_batches,
    };
}

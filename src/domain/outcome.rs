//! Per-record outcomes, progress snapshots and the aggregated result.

use serde::Serialize;

use super::message::StandardMessage;

/// What happened to one record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordOutcome<R> {
    pub record: R,
    pub success: bool,
    /// Status of the part or request that answered for this record, if any
    pub http_status: Option<u16>,
    pub message: String,
    pub code: Option<String>,
    /// Parsed response or error body, or the raw text if it was not JSON
    pub raw_details: Option<serde_json::Value>,
    pub batch_index: usize,
}

/// Final, caller-visible summary of one submission run.
///
/// `success_count + failure_count == total_records` unless `cancelled`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateResult<R> {
    pub total_records: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub success_entries: Vec<RecordOutcome<R>>,
    pub failed_records: Vec<RecordOutcome<R>>,
    pub all_messages: Vec<StandardMessage>,
    pub cancelled: bool,
    pub duration_ms: u64,
}

impl<R> AggregateResult<R> {
    pub fn processed(&self) -> usize {
        self.success_count + self.failure_count
    }

    pub fn is_complete_success(&self) -> bool {
        !self.cancelled && self.failure_count == 0 && self.success_count == self.total_records
    }

    /// Some records went through and some did not.
    pub fn is_partial(&self) -> bool {
        self.success_count > 0 && self.failure_count > 0
    }
}

/// Reported once per batch, after it has been scored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchProgress {
    pub batch_index: usize,
    pub total_batches: usize,
    pub processed_records: usize,
    pub total_records: usize,
    pub success_count: usize,
    pub failure_count: usize,
}

impl BatchProgress {
    /// Completion ratio in percent, 0-100.
    pub fn percent(&self) -> u8 {
        if self.total_records == 0 {
            return 100;
        }
        ((self.processed_records * 100) / self.total_records).min(100) as u8
    }
}

/// Reported right before a batch is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStart {
    pub batch_index: usize,
    pub total_batches: usize,
    pub batch_size: usize,
}

//! Accumulation of per-record outcomes into an [`AggregateResult`].
//!
//! One aggregator lives for exactly one submission. It is owned by the
//! running submission and only ever handed out as an immutable snapshot.

use std::time::Instant;

use chrono::Utc;
use metrics::counter;
use serde_json::Value;

use crate::codec::PartOutcome;
use crate::domain::message::{
    NormalizedError, normalize_engine_error, normalize_error_body, normalize_error_value,
    parse_backend_message_header,
};
use crate::domain::{AggregateResult, Batch, MessageType, Record, RecordOutcome, StandardMessage};
use crate::error::BroadsideError;
use crate::http::HttpResponse;

/// Header some backends use to attach a business message to a success.
const BACKEND_MESSAGE_HEADER: &str = "sap-message";

/// Longest raw body quoted in a parse-failure message.
const MAX_QUOTED_BODY: usize = 200;

/// The parts of a backend answer the aggregator cares about.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendReply {
    pub status: u16,
    pub body: Option<Value>,
    pub raw_body: String,
    pub parse_failed: bool,
    pub backend_message: Option<String>,
}

impl From<&PartOutcome> for BackendReply {
    fn from(part: &PartOutcome) -> Self {
        BackendReply {
            status: part.status,
            body: part.body.clone(),
            raw_body: part.raw_body.clone(),
            parse_failed: part.parse_failed,
            backend_message: part.header(BACKEND_MESSAGE_HEADER).map(str::to_string),
        }
    }
}

impl From<&HttpResponse> for BackendReply {
    fn from(response: &HttpResponse) -> Self {
        let raw_body = response.body.trim().to_string();
        let (body, parse_failed) = if raw_body.is_empty() {
            (None, false)
        } else {
            match serde_json::from_str::<Value>(&raw_body) {
                Ok(v) => (Some(v), false),
                Err(_) => (None, true),
            }
        };
        BackendReply {
            status: response.status,
            body,
            raw_body,
            parse_failed,
            backend_message: response.header(BACKEND_MESSAGE_HEADER).map(str::to_string),
        }
    }
}

/// Why a record (or a whole batch) failed.
#[derive(Debug)]
pub enum FailureCause {
    /// The backend answered, but not with a usable success
    Response(BackendReply),
    /// The engine could not get an answer at all
    Engine(BroadsideError),
}

impl FailureCause {
    fn http_status(&self) -> Option<u16> {
        match self {
            FailureCause::Response(reply) => Some(reply.status),
            FailureCause::Engine(BroadsideError::HttpStatus { status, .. }) => Some(*status),
            FailureCause::Engine(_) => None,
        }
    }

    fn normalize(&self) -> (NormalizedError, Option<Value>) {
        match self {
            // A 2xx whose body is not JSON cannot be trusted as a success
            FailureCause::Response(reply) if reply.parse_failed && is_success(reply.status) => {
                let quoted: String = reply.raw_body.chars().take(MAX_QUOTED_BODY).collect();
                (
                    NormalizedError {
                        message: format!("Response body is not valid JSON: {}", quoted),
                        code: Some("PARSE_ERROR".to_string()),
                    },
                    Some(Value::String(reply.raw_body.clone())),
                )
            }
            // Error statuses with a text body keep that text as the message
            FailureCause::Response(reply) => {
                let mut normalized = match &reply.body {
                    Some(body) => normalize_error_value(body),
                    None => normalize_error_body(&reply.raw_body),
                };
                if normalized.code.is_none() {
                    normalized.code = Some(format!("HTTP_{}", reply.status));
                }
                let details = reply
                    .body
                    .clone()
                    .or_else(|| (!reply.raw_body.is_empty()).then(|| Value::String(reply.raw_body.clone())));
                (normalized, details)
            }
            FailureCause::Engine(error) => (normalize_engine_error(error), None),
        }
    }
}

fn is_success(status: u16) -> bool {
    (200..300).contains(&status)
}

/// Counters, outcomes and messages for one submission.
pub struct ResultAggregator<R> {
    source: String,
    total_records: usize,
    success_count: usize,
    failure_count: usize,
    success_entries: Vec<RecordOutcome<R>>,
    failed_records: Vec<RecordOutcome<R>>,
    messages: Vec<StandardMessage>,
    cancelled: bool,
    started_at: Instant,
}

impl<R: Record> ResultAggregator<R> {
    pub fn new(total_records: usize, source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            total_records,
            success_count: 0,
            failure_count: 0,
            success_entries: Vec::with_capacity(total_records),
            failed_records: Vec::new(),
            messages: Vec::with_capacity(total_records),
            cancelled: false,
            started_at: Instant::now(),
        }
    }

    pub fn total_records(&self) -> usize {
        self.total_records
    }

    pub fn success_count(&self) -> usize {
        self.success_count
    }

    pub fn failure_count(&self) -> usize {
        self.failure_count
    }

    pub fn processed(&self) -> usize {
        self.success_count + self.failure_count
    }

    pub fn record_success(&mut self, record: R, reply: &BackendReply, batch_index: usize) {
        let entity_id = record.record_id();

        let (message_type, message, code) = match reply
            .backend_message
            .as_deref()
            .and_then(parse_backend_message_header)
        {
            // An accepted record is never reported as an error
            Some((MessageType::Error, message, code)) => (MessageType::Warning, message, code),
            Some(parsed) => parsed,
            None => (
                MessageType::Success,
                format!("Record {} submitted successfully", entity_id),
                Some(reply.status.to_string()),
            ),
        };

        self.messages.push(StandardMessage {
            message_type,
            code: code.clone(),
            message: message.clone(),
            details: reply.body.clone(),
            timestamp: Utc::now(),
            source: self.source.clone(),
            entity_id: Some(entity_id),
            batch_index: Some(batch_index),
        });
        self.success_entries.push(RecordOutcome {
            record,
            success: true,
            http_status: Some(reply.status),
            message,
            code,
            raw_details: reply.body.clone(),
            batch_index,
        });
        self.success_count += 1;
        counter!("broadside_records_total", "outcome" => "success").increment(1);
    }

    pub fn record_failure(&mut self, record: R, cause: &FailureCause, batch_index: usize) {
        let (normalized, details) = cause.normalize();
        self.push_failure(record, &normalized, details, cause.http_status(), batch_index);
        self.failure_count += 1;
        counter!("broadside_records_total", "outcome" => "failure").increment(1);
    }

    /// Fail every record of a batch with the same cause.
    pub fn record_batch_failure(&mut self, batch: Batch<R>, cause: &FailureCause) {
        let (normalized, details) = cause.normalize();
        let status = cause.http_status();
        let count = batch.records.len();

        tracing::warn!(
            batch_index = batch.index,
            batch_id = %batch.id,
            records = count,
            error = %normalized.message,
            "Batch failed as a whole"
        );

        for record in batch.records {
            self.push_failure(record, &normalized, details.clone(), status, batch.index);
        }
        self.failure_count += count;
        counter!("broadside_records_total", "outcome" => "failure").increment(count as u64);
    }

    pub fn mark_cancelled(&mut self) {
        self.cancelled = true;
    }

    /// Immutable copy of the current state.
    pub fn snapshot(&self) -> AggregateResult<R> {
        AggregateResult {
            total_records: self.total_records,
            success_count: self.success_count,
            failure_count: self.failure_count,
            success_entries: self.success_entries.clone(),
            failed_records: self.failed_records.clone(),
            all_messages: self.messages.clone(),
            cancelled: self.cancelled,
            duration_ms: self.started_at.elapsed().as_millis() as u64,
        }
    }

    /// Consume the aggregator into the final result.
    pub fn finish(self) -> AggregateResult<R> {
        AggregateResult {
            total_records: self.total_records,
            success_count: self.success_count,
            failure_count: self.failure_count,
            success_entries: self.success_entries,
            failed_records: self.failed_records,
            all_messages: self.messages,
            cancelled: self.cancelled,
            duration_ms: self.started_at.elapsed().as_millis() as u64,
        }
    }

    fn push_failure(
        &mut self,
        record: R,
        normalized: &NormalizedError,
        details: Option<Value>,
        http_status: Option<u16>,
        batch_index: usize,
    ) {
        self.messages.push(StandardMessage {
            message_type: MessageType::Error,
            code: normalized.code.clone(),
            message: normalized.message.clone(),
            details: details.clone(),
            timestamp: Utc::now(),
            source: self.source.clone(),
            entity_id: Some(record.record_id()),
            batch_index: Some(batch_index),
        });
        self.failed_records.push(RecordOutcome {
            record,
            success: false,
            http_status,
            message: normalized.message.clone(),
            code: normalized.code.clone(),
            raw_details: details,
            batch_index,
        });
    }
}

//! Coordinator that drives a submission end to end.
//!
//! The coordinator partitions records, makes sure a CSRF token is at hand,
//! and then works through the batches strictly in order. Each batch is
//! dispatched, scored into the aggregator and reported through the progress
//! callback before the next one starts. Batch-level failures never stop the
//! loop; only setup errors reject a submission.
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use metrics::counter;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::aggregator::{BackendReply, FailureCause, ResultAggregator};
use crate::codec::{MultipartCodec, PartOutcome, boundary_from_content_type};
use crate::domain::{
    AggregateResult, Batch, BatchProgress, BatchStart, Grouping, KeyFn, Record, partition,
};
use crate::error::{BroadsideError, Result};
use crate::http::{HttpClient, HttpRequest, HttpResponse};
use crate::token::{SessionTokenManager, Token};

pub mod transitions;
pub mod types;

pub use types::{
    Cancelled, Completed, Failed, Idle, StatusCell, Submission, SubmissionData, SubmissionId,
    SubmissionMode, SubmissionState, SubmissionStatus, Submitting, TokenFetch,
};

/// Called with a progress snapshot after each batch has been scored.
pub type ProgressFn = Arc<dyn Fn(&BatchProgress) + Send + Sync>;

/// Called right before a batch is dispatched.
pub type BatchStartFn = Arc<dyn Fn(&BatchStart) + Send + Sync>;

/// Called with the partial result after each batch has been scored.
pub type SnapshotFn<R> = Arc<dyn Fn(&AggregateResult<R>) + Send + Sync>;

/// Configuration for the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Base URL of the OData service (e.g., <https://host/sap/opu/odata/sap/API_FIXEDASSET_SRV>)
    pub service_root: String,

    /// Entity set records are created in (e.g., "A_FixedAsset")
    pub entity_set: String,

    /// Batch (`$batch` multipart) or individual (`POST` per record) submission
    pub mode: SubmissionMode,

    /// Records per batch when the caller does not pass a size or a grouping key
    pub default_batch_size: usize,

    /// Timeout for each submission request in milliseconds
    pub timeout_ms: u64,

    /// Timeout for the token probe in milliseconds
    pub token_probe_timeout_ms: u64,

    /// Individual mode only: send a batch's records one at a time with this pause
    /// between them instead of concurrently
    pub inter_record_delay_ms: Option<u64>,

    /// Name of the anti-forgery token header
    pub token_header: String,

    /// `source` stamped on every message (the business module submitting)
    pub message_source: String,

    /// Static headers sent with every request (e.g., `sap-client`)
    pub extra_headers: BTreeMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            service_root: String::new(),
            entity_set: String::new(),
            mode: SubmissionMode::Batch,
            default_batch_size: 50,
            timeout_ms: 120_000,
            token_probe_timeout_ms: 30_000,
            inter_record_delay_ms: None,
            token_header: "X-CSRF-Token".to_string(),
            message_source: "broadside".to_string(),
            extra_headers: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn new(service_root: impl Into<String>, entity_set: impl Into<String>) -> Self {
        Self {
            service_root: service_root.into(),
            entity_set: entity_set.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.service_root.trim().is_empty() {
            return Err(BroadsideError::InvalidConfig(
                "service_root must not be empty".to_string(),
            ));
        }
        if self.entity_set.trim().trim_matches('/').is_empty() {
            return Err(BroadsideError::InvalidConfig(
                "entity_set must not be empty".to_string(),
            ));
        }
        if self.default_batch_size == 0 {
            return Err(BroadsideError::InvalidBatchSize(0));
        }
        if self.token_header.trim().is_empty() {
            return Err(BroadsideError::InvalidConfig(
                "token_header must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-call options for [`SubmissionCoordinator::submit`].
pub struct SubmitOptions<R> {
    /// Fixed batch size; falls back to the configured default
    pub batch_size: Option<usize>,
    /// Group records by key instead of by size; wins over `batch_size`
    pub group_by: Option<KeyFn<R>>,
    pub on_batch_start: Option<BatchStartFn>,
    pub on_progress: Option<ProgressFn>,
    /// Mid-flight view of outcomes and messages so far; clones the result
    /// on every batch, so leave unset unless a UI needs it
    pub on_snapshot: Option<SnapshotFn<R>>,
}

impl<R> Default for SubmitOptions<R> {
    fn default() -> Self {
        Self {
            batch_size: None,
            group_by: None,
            on_batch_start: None,
            on_progress: None,
            on_snapshot: None,
        }
    }
}

impl<R> SubmitOptions<R> {
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    pub fn group_by(mut self, key_fn: impl Fn(&R) -> String + Send + Sync + 'static) -> Self {
        self.group_by = Some(Arc::new(key_fn));
        self
    }

    pub fn on_batch_start(mut self, f: impl Fn(&BatchStart) + Send + Sync + 'static) -> Self {
        self.on_batch_start = Some(Arc::new(f));
        self
    }

    pub fn on_progress(mut self, f: impl Fn(&BatchProgress) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(f));
        self
    }

    pub fn on_snapshot(
        mut self,
        f: impl Fn(&AggregateResult<R>) + Send + Sync + 'static,
    ) -> Self {
        self.on_snapshot = Some(Arc::new(f));
        self
    }
}

/// Cloneable handle for cancelling whatever submission is currently running.
#[derive(Clone)]
pub struct CancelHandle {
    current: Arc<Mutex<CancellationToken>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.current.lock().cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.current.lock().is_cancelled()
    }
}

/// Drives submissions against one service.
///
/// Runs at most one submission at a time. The CSRF token survives between
/// submissions; counters, results and the cancellation flag do not.
pub struct SubmissionCoordinator<H: HttpClient> {
    http_client: Arc<H>,
    tokens: SessionTokenManager<H>,
    codec: MultipartCodec,
    config: EngineConfig,
    extra_headers: Vec<(String, String)>,
    cancel: CancelHandle,
    status: StatusCell,
    running: AtomicBool,
}

impl<H: HttpClient> SubmissionCoordinator<H> {
    /// Create a coordinator. Fails if the configuration is unusable.
    pub fn new(http_client: Arc<H>, config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let extra_headers: Vec<(String, String)> = config
            .extra_headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let tokens = SessionTokenManager::new(http_client.clone(), config.service_root.clone())
            .with_header_name(config.token_header.clone())
            .with_timeout_ms(config.token_probe_timeout_ms)
            .with_extra_headers(extra_headers.clone());

        Ok(Self {
            http_client,
            tokens,
            codec: MultipartCodec::new(),
            config,
            extra_headers,
            cancel: CancelHandle {
                current: Arc::new(Mutex::new(CancellationToken::new())),
            },
            status: Arc::new(RwLock::new(SubmissionStatus::Idle)),
            running: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn tokens(&self) -> &SessionTokenManager<H> {
        &self.tokens
    }

    pub fn status(&self) -> SubmissionStatus {
        self.status.read().clone()
    }

    /// Request cancellation of the running submission.
    ///
    /// Takes effect at the next batch boundary; the batch in flight completes
    /// and is scored first.
    pub fn cancel(&self) {
        tracing::info!("Cancellation requested");
        self.cancel.cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Submit records and return the aggregated result.
    ///
    /// Only setup errors (no records, zero batch size, a submission already
    /// running) are returned as `Err`. Transport and backend failures end up
    /// in the result, as does cancellation.
    #[tracing::instrument(skip(self, records, options), fields(records = records.len(), mode = ?self.config.mode))]
    pub async fn submit<R: Record>(
        &self,
        records: Vec<R>,
        options: SubmitOptions<R>,
    ) -> Result<AggregateResult<R>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::warn!("Rejected submit while another submission is running");
            return Err(BroadsideError::AlreadyRunning);
        }
        let _running = RunningGuard {
            running: &self.running,
        };

        let cancellation = {
            let mut current = self.cancel.current.lock();
            *current = CancellationToken::new();
            current.clone()
        };

        let idle = Submission::<Idle>::new(records.len(), self.config.mode);

        let grouping = match options.group_by.clone() {
            Some(key_fn) => Grouping::ByKey(key_fn),
            None => Grouping::FixedSize(options.batch_size.unwrap_or(self.config.default_batch_size)),
        };

        if records.is_empty() {
            let error = BroadsideError::NoRecords;
            idle.fail(&error, &self.status);
            return Err(error);
        }

        let total_records = records.len();
        let batches = match partition(records, &grouping) {
            Ok(batches) => batches,
            Err(error) => {
                idle.fail(&error, &self.status);
                return Err(error);
            }
        };
        let total_batches = batches.len();

        let mut aggregator = ResultAggregator::new(total_records, self.config.message_source.clone());
        let fetching = idle.begin(total_batches, &self.status);

        self.tokens.clear_retried().await;
        let token = self.tokens.ensure_token().await;
        let mut submission = fetching.token_ready(&token, &self.status);

        tracing::info!(
            submission_id = %submission.data.id,
            total_records,
            total_batches,
            grouping = ?grouping,
            "Submitting records"
        );

        for batch in batches {
            if cancellation.is_cancelled() {
                submission.cancel(&self.status);
                aggregator.mark_cancelled();
                let result = aggregator.finish();
                tracing::info!(
                    success_count = result.success_count,
                    failure_count = result.failure_count,
                    total_records,
                    "Submission cancelled"
                );
                return Ok(result);
            }

            let batch_index = batch.index;
            debug_assert_eq!(batch_index, submission.batch_index());

            if let Some(on_batch_start) = &options.on_batch_start {
                on_batch_start(&BatchStart {
                    batch_index,
                    total_batches,
                    batch_size: batch.len(),
                });
            }

            self.process_batch(batch, &mut aggregator).await;

            if let Some(on_progress) = &options.on_progress {
                on_progress(&BatchProgress {
                    batch_index,
                    total_batches,
                    processed_records: aggregator.processed(),
                    total_records,
                    success_count: aggregator.success_count(),
                    failure_count: aggregator.failure_count(),
                });
            }

            if let Some(on_snapshot) = &options.on_snapshot {
                on_snapshot(&aggregator.snapshot());
            }

            submission = submission.advance(&self.status);
        }

        let completed = submission.complete(&self.status);
        let result = aggregator.finish();

        tracing::info!(
            submission_id = %completed.data.id,
            success_count = result.success_count,
            failure_count = result.failure_count,
            total_records,
            duration_ms = result.duration_ms,
            "Submission completed"
        );

        Ok(result)
    }

    /// Dispatch one batch and score every record in it.
    async fn process_batch<R: Record>(&self, batch: Batch<R>, aggregator: &mut ResultAggregator<R>) {
        let batch_index = batch.index;
        let batch_len = batch.len();
        let failures_before = aggregator.failure_count();

        tracing::debug!(
            batch_index,
            batch_id = %batch.id,
            records = batch_len,
            "Dispatching batch"
        );

        match self.config.mode {
            SubmissionMode::Batch => self.submit_changeset(batch, aggregator).await,
            SubmissionMode::Individual => self.submit_individually(batch, aggregator).await,
        }

        let failed = aggregator.failure_count() - failures_before;
        let outcome = match failed {
            0 => "success",
            n if n == batch_len => "failed",
            _ => "partial",
        };
        counter!("broadside_batches_total", "outcome" => outcome).increment(1);
        tracing::debug!(batch_index, failed, outcome, "Batch scored");
    }

    async fn submit_changeset<R: Record>(
        &self,
        batch: Batch<R>,
        aggregator: &mut ResultAggregator<R>,
    ) {
        let encoded = match self.codec.encode(&batch.records, &self.config.entity_set) {
            Ok(encoded) => encoded,
            Err(e) => {
                aggregator.record_batch_failure(batch, &FailureCause::Engine(e));
                return;
            }
        };
        let content_type = encoded.content_type();

        let response = self
            .execute_with_token_retry(|token| {
                self.request("POST", "/$batch", token)
                    .header("Content-Type", content_type.as_str())
                    .header("Accept", "multipart/mixed")
                    .body(encoded.body.as_str())
            })
            .await;

        match response {
            Ok(response) => self.score_batch_response(batch, response, aggregator),
            Err(e) => aggregator.record_batch_failure(batch, &FailureCause::Engine(e)),
        }
    }

    fn score_batch_response<R: Record>(
        &self,
        batch: Batch<R>,
        response: HttpResponse,
        aggregator: &mut ResultAggregator<R>,
    ) {
        let boundary = response
            .header("content-type")
            .and_then(boundary_from_content_type);

        let Some(boundary) = boundary else {
            // Rejected as a whole before any part was evaluated
            let cause = if response.is_success() {
                FailureCause::Engine(BroadsideError::MalformedResponse(
                    "batch response carries no multipart boundary".to_string(),
                ))
            } else {
                FailureCause::Response(BackendReply::from(&response))
            };
            aggregator.record_batch_failure(batch, &cause);
            return;
        };

        let parts = self.codec.decode(&response.body, &boundary);
        if parts.is_empty() {
            let reply = BackendReply::from(&response);
            let cause = if !response.is_success() || reply.body.is_some() {
                FailureCause::Response(reply)
            } else {
                FailureCause::Engine(BroadsideError::MalformedResponse(
                    "batch response contains no parts".to_string(),
                ))
            };
            aggregator.record_batch_failure(batch, &cause);
            return;
        }

        self.correlate(batch, parts, aggregator);
    }

    /// Match decoded parts to the records that were sent, in order.
    fn correlate<R: Record>(
        &self,
        batch: Batch<R>,
        parts: Vec<PartOutcome>,
        aggregator: &mut ResultAggregator<R>,
    ) {
        let record_count = batch.len();

        // A failed changeset is answered with a single error part for all records
        if parts.len() == 1 && record_count > 1 && !parts[0].is_success() {
            let cause = FailureCause::Response(BackendReply::from(&parts[0]));
            aggregator.record_batch_failure(batch, &cause);
            return;
        }

        if parts.len() != record_count {
            tracing::warn!(
                batch_index = batch.index,
                parts = parts.len(),
                records = record_count,
                "Part count does not match record count"
            );
        }

        let slots = assign_parts(parts, record_count);
        let batch_index = batch.index;

        for (record, slot) in batch.records.into_iter().zip(slots) {
            match slot {
                Some(part) if part.is_success() => {
                    aggregator.record_success(record, &BackendReply::from(&part), batch_index)
                }
                Some(part) => aggregator.record_failure(
                    record,
                    &FailureCause::Response(BackendReply::from(&part)),
                    batch_index,
                ),
                None => {
                    let error = BroadsideError::MalformedResponse(format!(
                        "no response part for record {}",
                        record.record_id()
                    ));
                    aggregator.record_failure(record, &FailureCause::Engine(error), batch_index)
                }
            }
        }
    }

    async fn submit_individually<R: Record>(
        &self,
        batch: Batch<R>,
        aggregator: &mut ResultAggregator<R>,
    ) {
        let batch_index = batch.index;

        match self.config.inter_record_delay_ms {
            Some(delay_ms) => {
                for (position, record) in batch.records.into_iter().enumerate() {
                    if position > 0 && delay_ms > 0 {
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    }
                    let outcome = self.submit_record(&record).await;
                    score_record(record, outcome, batch_index, aggregator);
                }
            }
            None => {
                let outcomes = futures::future::join_all(
                    batch.records.iter().map(|record| self.submit_record(record)),
                )
                .await;
                for (record, outcome) in batch.records.into_iter().zip(outcomes) {
                    score_record(record, outcome, batch_index, aggregator);
                }
            }
        }
    }

    async fn submit_record<R: Record>(&self, record: &R) -> Result<HttpResponse> {
        let payload = serde_json::to_string(&record.to_payload()?)?;
        let path = format!("/{}", self.config.entity_set.trim_start_matches('/'));

        self.execute_with_token_retry(|token| {
            self.request("POST", &path, token)
                .header("Content-Type", "application/json")
                .header("Accept", "application/json")
                .body(payload.as_str())
        })
        .await
    }

    /// Send a request, refreshing the token and retrying exactly once on 403.
    ///
    /// A second 403 is returned as-is and scored like any other failure.
    async fn execute_with_token_retry<F>(&self, build: F) -> Result<HttpResponse>
    where
        F: Fn(&Token) -> HttpRequest,
    {
        let token = self.tokens.ensure_token().await;
        let response = self
            .http_client
            .execute(&build(&token), self.config.timeout_ms)
            .await?;

        if response.status != 403 {
            return Ok(response);
        }

        tracing::info!("Request rejected with 403, refreshing token and retrying once");
        let fresh = self.tokens.refresh_after_rejection(&token).await;
        let retried = self
            .http_client
            .execute(&build(&fresh), self.config.timeout_ms)
            .await?;

        if retried.status == 403 {
            tracing::warn!("Request rejected again after token refresh");
        }
        Ok(retried)
    }

    fn request(&self, method: &str, path: &str, token: &Token) -> HttpRequest {
        let mut request = HttpRequest::new(method, &self.config.service_root, path);
        if let Some(value) = &token.value {
            request = request.header(self.tokens.header_name(), value.as_str());
        }
        for (name, value) in &self.extra_headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request
    }
}

fn score_record<R: Record>(
    record: R,
    outcome: Result<HttpResponse>,
    batch_index: usize,
    aggregator: &mut ResultAggregator<R>,
) {
    match outcome {
        Ok(response) => {
            let reply = BackendReply::from(&response);
            if response.is_success() && !reply.parse_failed {
                aggregator.record_success(record, &reply, batch_index);
            } else {
                aggregator.record_failure(record, &FailureCause::Response(reply), batch_index);
            }
        }
        Err(e) => aggregator.record_failure(record, &FailureCause::Engine(e), batch_index),
    }
}

/// Slot `i` holds the part answering record `i`.
///
/// Parts are looked up by `Content-ID` when every part carries a distinct id
/// in `1..=record_count`. Otherwise they are taken in encountered order.
fn assign_parts(parts: Vec<PartOutcome>, record_count: usize) -> Vec<Option<PartOutcome>> {
    let ids: Option<Vec<usize>> = parts
        .iter()
        .map(|p| {
            p.content_id
                .as_deref()
                .and_then(|id| id.trim().parse::<usize>().ok())
                .filter(|id| (1..=record_count).contains(id))
        })
        .collect();

    let mut slots: Vec<Option<PartOutcome>> = Vec::with_capacity(record_count);
    slots.resize_with(record_count, || None);

    if let Some(ids) = ids {
        let mut seen = ids.clone();
        seen.sort_unstable();
        seen.dedup();
        if seen.len() == ids.len() {
            for (id, part) in ids.into_iter().zip(parts) {
                slots[id - 1] = Some(part);
            }
            return slots;
        }
    }

    for (slot, part) in slots.iter_mut().zip(parts) {
        *slot = Some(part);
    }
    slots
}

/// Clears the running flag when a submission ends, however it ends.
struct RunningGuard<'a> {
    running: &'a AtomicBool,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

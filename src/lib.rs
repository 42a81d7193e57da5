//! Batch submission engine for OData-style transactional APIs.
//!
//! Records are partitioned into ordered batches and sent either as multipart
//! `$batch` changesets or as one `POST` per record. The engine keeps a CSRF
//! session token alive across requests (refreshing and retrying exactly once
//! on a 403), decodes multipart responses back into per-record outcomes, and
//! aggregates everything into a single result with normalised messages.
//!
//! Batch-level failures never abort a submission. Only setup errors such as an
//! empty record list are returned as `Err`.

pub mod aggregator;
pub mod codec;
pub mod coordinator;
pub mod domain;
pub mod error;
pub mod http;
pub mod token;

// Re-export commonly used types
pub use aggregator::{BackendReply, FailureCause, ResultAggregator};
pub use codec::{EncodedBatch, MultipartCodec, PartOutcome};
pub use coordinator::{
    BatchStartFn, CancelHandle, EngineConfig, ProgressFn, SnapshotFn, SubmissionCoordinator,
    SubmissionMode, SubmissionStatus, SubmitOptions,
};
pub use domain::*;
pub use error::{BroadsideError, Result};
pub use http::{HttpClient, HttpRequest, HttpResponse, MockHttpClient, ReqwestHttpClient};
pub use token::{SessionTokenManager, Token, TokenFreshness};

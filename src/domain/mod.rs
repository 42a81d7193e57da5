//! Core domain types for the submission engine.
//!
//! This module contains pure domain types with no transport dependencies:
//! - Records and the `Record` trait
//! - Batches and batch grouping
//! - Outcomes, progress and the aggregated result
//! - Standard messages and error normalisation

pub mod batch;
pub mod message;
pub mod outcome;
pub mod record;

pub use batch::{Batch, BatchId, Grouping, KeyFn, partition};
pub use message::{MessageType, NormalizedError, StandardMessage};
pub use outcome::{AggregateResult, BatchProgress, BatchStart, RecordOutcome};
pub use record::{JsonRecord, Record};

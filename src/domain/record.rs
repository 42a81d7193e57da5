//! Records: the caller-supplied business lines the engine submits.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A single pre-validated business line to submit.
///
/// The engine never inspects or mutates a record beyond these two methods.
/// `record_id` is used for correlation in results and messages; `to_payload`
/// produces the JSON body in the shape the backend expects.
pub trait Record: Clone + Send + Sync + 'static {
    /// Identity used to correlate outcomes back to the caller (e.g., a sequence number).
    fn record_id(&self) -> String;

    /// The backend representation of this record.
    fn to_payload(&self) -> Result<serde_json::Value>;
}

/// A record that already is its backend payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRecord {
    pub id: String,
    pub body: serde_json::Value,
}

impl JsonRecord {
    pub fn new(id: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            body,
        }
    }
}

impl Record for JsonRecord {
    fn record_id(&self) -> String {
        self.id.clone()
    }

    fn to_payload(&self) -> Result<serde_json::Value> {
        Ok(self.body.clone())
    }
}

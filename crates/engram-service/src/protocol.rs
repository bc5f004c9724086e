//! Request/response envelopes.
//!
//! Every request carries a correlation id; every response echoes it with
//! either a `result` or an `error` object `{kind, message, retryable}`.
//! Unknown operations are an error; unknown notifications (requests
//! without an id) are dropped silently without touching core state.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use engram_core::MemoryError;

// ============================================================================
// REQUEST / RESPONSE
// ============================================================================

/// An incoming operation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Correlation id, echoed verbatim in the response. Requests without
    /// one are notifications and get no response.
    pub id: Option<Value>,
    /// Operation name, e.g. `store`, `retrieve`, `recall`.
    pub op: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// The outcome of a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl Response {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: ErrorObject) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }
}

// ============================================================================
// ERROR OBJECT
// ============================================================================

/// Wire form of an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorObject {
    /// Stable kind: `invalid`, `not_found`, `retryable`, `embedding`,
    /// `corruption`, `timeout`, `cancelled`, `consolidation`.
    pub kind: String,
    pub message: String,
    pub retryable: bool,
}

impl ErrorObject {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            kind: "invalid".to_string(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn unknown_op(op: &str) -> Self {
        Self::invalid(format!("unknown operation '{op}'"))
    }
}

impl From<&MemoryError> for ErrorObject {
    fn from(e: &MemoryError) -> Self {
        Self {
            kind: e.kind().to_string(),
            message: e.to_string(),
            retryable: e.retryable(),
        }
    }
}

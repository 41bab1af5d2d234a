//! RPC request, response and live notification types.
//!
//! Requests are plain method-plus-params records. The socket engine tags
//! them with a [`CorrelationId`] on the way out; the HTTP engine sends them
//! without an id.

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::{Error, Result};
use crate::identifiers::{CorrelationId, LiveId};

// ============================================================================
// Method Names
// ============================================================================

/// Method names with session side effects.
pub mod method {
    /// Selects namespace and database.
    pub const USE: &str = "use";
    /// Defines a session variable.
    pub const LET: &str = "let";
    /// Removes a session variable.
    pub const UNSET: &str = "unset";
    /// Runs a query.
    pub const QUERY: &str = "query";
    /// Signs in and returns a token.
    pub const SIGNIN: &str = "signin";
    /// Signs up and returns a token.
    pub const SIGNUP: &str = "signup";
    /// Authenticates with an existing token.
    pub const AUTHENTICATE: &str = "authenticate";
    /// Drops the session token.
    pub const INVALIDATE: &str = "invalidate";
}

// ============================================================================
// RpcRequest
// ============================================================================

/// An RPC call: method name plus positional parameters.
///
/// # Format
///
/// ```json
/// { "id": "query/3", "method": "query", "params": ["RETURN $x", { "x": 1 }] }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Method name.
    pub method: String,

    /// Positional parameters.
    #[serde(default)]
    pub params: Vec<Value>,
}

impl RpcRequest {
    /// Creates a new request.
    #[inline]
    #[must_use]
    pub fn new(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    /// Returns the parameter at `index`, or `Null` when absent.
    #[inline]
    #[must_use]
    pub fn param(&self, index: usize) -> &Value {
        self.params.get(index).unwrap_or(&Value::Null)
    }

    /// Returns the parameter at `index` as a string slice.
    #[inline]
    #[must_use]
    pub fn param_str(&self, index: usize) -> Option<&str> {
        self.param(index).as_str()
    }

    /// Builds the wire value, optionally tagged with a correlation id.
    #[must_use]
    pub fn to_value(&self, id: Option<&CorrelationId>) -> Value {
        let mut object = Map::with_capacity(3);
        if let Some(id) = id {
            object.insert("id".into(), Value::String(id.to_string()));
        }
        object.insert("method".into(), Value::String(self.method.clone()));
        object.insert("params".into(), Value::Array(self.params.clone()));
        Value::Object(object)
    }
}

// ============================================================================
// RpcResponse
// ============================================================================

/// RPC-level error returned by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Error code.
    pub code: i64,

    /// Error message.
    pub message: String,
}

/// Result-or-error body of an [`RpcResponse`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RpcOutcome {
    /// Successful call.
    Result(Value),
    /// Failed call.
    Error(RpcError),
}

/// A response to an [`RpcRequest`].
///
/// # Format
///
/// Success:
/// ```json
/// { "id": "query/3", "result": [ ... ] }
/// ```
///
/// Error:
/// ```json
/// { "id": "query/3", "error": { "code": -32000, "message": "..." } }
/// ```
///
/// HTTP responses carry no id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RpcResponse {
    /// Correlation id (socket transport only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<CorrelationId>,

    /// Result or error.
    #[serde(flatten)]
    pub outcome: RpcOutcome,
}

impl RpcResponse {
    /// Creates a successful id-less response.
    #[inline]
    #[must_use]
    pub fn ok(result: Value) -> Self {
        Self {
            id: None,
            outcome: RpcOutcome::Result(result),
        }
    }

    /// Creates an id-less error response.
    #[inline]
    #[must_use]
    pub fn err(code: i64, message: impl Into<String>) -> Self {
        Self {
            id: None,
            outcome: RpcOutcome::Error(RpcError {
                code,
                message: message.into(),
            }),
        }
    }

    /// Returns `true` if this is an error response.
    #[inline]
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self.outcome, RpcOutcome::Error(_))
    }

    /// Returns the result value of a successful response.
    #[inline]
    #[must_use]
    pub fn result(&self) -> Option<&Value> {
        match &self.outcome {
            RpcOutcome::Result(value) => Some(value),
            RpcOutcome::Error(_) => None,
        }
    }

    /// Returns the error code of an error response.
    #[inline]
    #[must_use]
    pub fn error_code(&self) -> Option<i64> {
        match &self.outcome {
            RpcOutcome::Error(e) => Some(e.code),
            RpcOutcome::Result(_) => None,
        }
    }

    /// Returns the error message of an error response.
    #[inline]
    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        match &self.outcome {
            RpcOutcome::Error(e) => Some(&e.message),
            RpcOutcome::Result(_) => None,
        }
    }

    /// Drops the correlation id.
    #[inline]
    #[must_use]
    pub fn without_id(mut self) -> Self {
        self.id = None;
        self
    }

    /// Extracts the result value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RpcResponse`] carrying the whole response if the
    /// server answered with an error.
    pub fn into_result(self) -> Result<Value> {
        match self.outcome {
            RpcOutcome::Result(value) => Ok(value),
            RpcOutcome::Error(_) => Err(Error::rpc_response(self)),
        }
    }

    /// Builds the wire value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut value = match &self.outcome {
            RpcOutcome::Result(result) => json!({ "result": result }),
            RpcOutcome::Error(e) => json!({ "error": { "code": e.code, "message": e.message } }),
        };
        if let (Some(id), Value::Object(object)) = (&self.id, &mut value) {
            object.insert("id".into(), Value::String(id.to_string()));
        }
        value
    }
}

// ============================================================================
// LiveNotification
// ============================================================================

/// A server-pushed live query notification.
///
/// # Format
///
/// ```json
/// { "result": { "id": "<uuid>", "action": "CREATE", "result": { ... } } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveNotification {
    /// Live query subscription id.
    pub id: LiveId,

    /// Action that triggered the notification (`CREATE`, `UPDATE`, ...).
    pub action: String,

    /// Affected record or diff.
    #[serde(default)]
    pub result: Value,
}

// ============================================================================
// Tests
// ============================================================================

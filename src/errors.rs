//! Server error model with JSON-RPC error mapping
//!
//! Defines the closed failure taxonomy using `thiserror` and maps each kind
//! to its stable JSON-RPC error code and structured `data` payload. Adapter
//! failures are translated into this taxonomy at the handler boundary; router
//! and protocol failures are produced at their own boundaries.

use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::adapter::AdapterError;

/// Server error type
///
/// The complete, closed set of failures a request can surface. Each variant
/// maps to exactly one JSON-RPC error code and `data.type` tag.
#[derive(Debug, Clone, Error)]
pub enum ServerError {
    /// Malformed JSON-RPC envelope (bad JSON, batch array, missing fields)
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Unknown method name
    #[error("method '{0}' not found")]
    MethodNotFound(String),
    /// Parameter shape, range, or syntax violation
    #[error("invalid params: {message}")]
    InvalidParams {
        message: String,
        field: Option<String>,
    },
    /// Unexpected internal failure
    #[error("internal error: {0}")]
    Internal(String),
    /// Request arrived before the session handshake completed
    #[error("session is not initialized; call 'initialize' first")]
    SessionUninitialized,
    /// The mail store is unreachable
    #[error("outlook is unavailable: {0}")]
    Unavailable(String),
    /// Email id did not resolve
    #[error("email '{0}' not found")]
    EmailNotFound(String),
    /// Folder id did not resolve
    #[error("folder '{0}' not found")]
    FolderNotFound(String),
    /// The store refused access to a resource
    #[error("access denied to {0}")]
    PermissionDenied(String),
    /// The store reported a search failure
    #[error("search failed: {message}")]
    SearchFailed { query: String, message: String },
    /// Per-call deadline exceeded
    #[error("operation '{operation}' timed out after {timeout_ms} ms")]
    Timeout { operation: String, timeout_ms: u64 },
    /// Rate limiter denied admission
    #[error("rate limit exceeded; retry after {retry_after_secs} second(s)")]
    RateLimited { retry_after_secs: u64 },
    /// Concurrent-request gate is full or the server is draining
    #[error("server is overloaded: {0}")]
    Overloaded(String),
}

/// Type alias for fallible return values throughout the crate
pub type ServerResult<T> = Result<T, ServerError>;

/// JSON-RPC error object (`error` member of a response)
#[derive(Debug, Clone, Serialize)]
pub struct RpcErrorBody {
    pub code: i64,
    pub message: String,
    pub data: RpcErrorData,
}

/// Structured `error.data` payload: always `type` + `details`, plus
/// `retry_after` seconds for rate-limit denials
#[derive(Debug, Clone, Serialize)]
pub struct RpcErrorData {
    #[serde(rename = "type")]
    pub error_type: &'static str,
    pub details: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl ServerError {
    /// Stable JSON-RPC error code for this failure kind
    pub fn code(&self) -> i64 {
        match self {
            Self::InvalidRequest(_) => -32600,
            Self::MethodNotFound(_) => -32601,
            Self::InvalidParams { .. } => -32602,
            Self::Internal(_) => -32603,
            Self::SessionUninitialized => -32000,
            Self::Unavailable(_) => -32001,
            Self::EmailNotFound(_) | Self::FolderNotFound(_) => -32002,
            Self::PermissionDenied(_) => -32004,
            Self::SearchFailed { .. } => -32005,
            Self::Timeout { .. } => -32006,
            Self::RateLimited { .. } => -32007,
            Self::Overloaded(_) => -32000,
        }
    }

    /// `data.type` tag for this failure kind
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) | Self::MethodNotFound(_) => "ProtocolError",
            Self::InvalidParams { .. } => "ValidationError",
            Self::Internal(_) => "InternalError",
            Self::SessionUninitialized => "SessionError",
            Self::Unavailable(_) => "OutlookConnectionError",
            Self::EmailNotFound(_) => "EmailNotFoundError",
            Self::FolderNotFound(_) => "FolderNotFoundError",
            Self::PermissionDenied(_) => "PermissionError",
            Self::SearchFailed { .. } => "SearchError",
            Self::Timeout { .. } => "TimeoutError",
            Self::RateLimited { .. } => "RateLimitError",
            Self::Overloaded(_) => "Overloaded",
        }
    }

    /// Convert to the JSON-RPC error object
    ///
    /// Error messages never include mail content or file paths beyond what
    /// the caller already supplied.
    pub fn to_rpc_error(&self) -> RpcErrorBody {
        let details = match self {
            Self::InvalidParams { field, .. } => match field {
                Some(f) => json!({ "field": f }),
                None => json!({}),
            },
            Self::MethodNotFound(method) => json!({ "method": method }),
            Self::EmailNotFound(id) => json!({ "email_id": id }),
            Self::FolderNotFound(id) => json!({ "folder_id": id }),
            Self::PermissionDenied(resource) => json!({ "resource": resource }),
            Self::SearchFailed { query, .. } => json!({ "query": query }),
            Self::Timeout {
                operation,
                timeout_ms,
            } => json!({ "operation": operation, "timeout_ms": timeout_ms }),
            _ => json!({}),
        };
        let retry_after = match self {
            Self::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        };
        RpcErrorBody {
            code: self.code(),
            message: self.to_string(),
            data: RpcErrorData {
                error_type: self.error_type(),
                details,
                retry_after,
            },
        }
    }
}

impl From<serde_json::Error> for ServerError {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(format!("serialization failure: {e}"))
    }
}

/// Convenience constructor for `InvalidParams` without a field reference
pub fn invalid_params(message: impl Into<String>) -> ServerError {
    ServerError::InvalidParams {
        message: message.into(),
        field: None,
    }
}

/// Convenience constructor for `InvalidParams` tied to a named field
pub fn invalid_field(field: &str, message: impl Into<String>) -> ServerError {
    ServerError::InvalidParams {
        message: message.into(),
        field: Some(field.to_owned()),
    }
}

/// Translate an adapter failure raised while operating on a specific email
pub fn adapter_error_for_email(error: AdapterError, email_id: &str) -> ServerError {
    match error {
        AdapterError::NotFound(_) => ServerError::EmailNotFound(email_id.to_owned()),
        other => adapter_error_for_store(other),
    }
}

/// Translate an adapter failure raised while operating on a specific folder
pub fn adapter_error_for_folder(error: AdapterError, folder_id: &str) -> ServerError {
    match error {
        AdapterError::NotFound(_) => ServerError::FolderNotFound(folder_id.to_owned()),
        other => adapter_error_for_store(other),
    }
}

/// Translate an adapter failure raised during a search
///
/// Resource and timeout failures keep their own codes; everything else the
/// store reports during a search maps to `SearchError`.
pub fn adapter_error_for_search(error: AdapterError, query: &str) -> ServerError {
    match error {
        AdapterError::NotFound(message) => ServerError::FolderNotFound(message),
        AdapterError::PermissionDenied(resource) => ServerError::PermissionDenied(resource),
        AdapterError::Unavailable(message) => ServerError::Unavailable(message),
        AdapterError::Timeout(operation) => ServerError::Timeout {
            operation,
            timeout_ms: 0,
        },
        AdapterError::InvalidArgument(message) => invalid_params(message),
        AdapterError::Transient(message) | AdapterError::Permanent(message) => {
            ServerError::SearchFailed {
                query: query.to_owned(),
                message,
            }
        }
    }
}

/// Translate an adapter failure with no resource context
pub fn adapter_error_for_store(error: AdapterError) -> ServerError {
    match error {
        AdapterError::Unavailable(message) => ServerError::Unavailable(message),
        AdapterError::NotFound(message) => ServerError::Internal(message),
        AdapterError::PermissionDenied(resource) => ServerError::PermissionDenied(resource),
        AdapterError::InvalidArgument(message) => invalid_params(message),
        AdapterError::Timeout(operation) => ServerError::Timeout {
            operation,
            timeout_ms: 0,
        },
        // Transient failures reach here only after the retry budget is
        // exhausted; the client decides whether to retry.
        AdapterError::Transient(message) => ServerError::Unavailable(message),
        AdapterError::Permanent(message) => ServerError::Internal(message),
    }
}

#[cfg(test)]
mod tests {
    use super::{adapter_error_for_email, adapter_error_for_folder, ServerError};
    use crate::adapter::AdapterError;

    #[test]
    fn codes_match_the_wire_contract() {
        assert_eq!(ServerError::SessionUninitialized.code(), -32000);
        assert_eq!(ServerError::Unavailable("down".to_owned()).code(), -32001);
        assert_eq!(ServerError::EmailNotFound("x".to_owned()).code(), -32002);
        assert_eq!(
            ServerError::PermissionDenied("inbox".to_owned()).code(),
            -32004
        );
        assert_eq!(
            ServerError::Timeout {
                operation: "get_email".to_owned(),
                timeout_ms: 100
            }
            .code(),
            -32006
        );
        assert_eq!(
            ServerError::RateLimited {
                retry_after_secs: 1
            }
            .code(),
            -32007
        );
    }

    #[test]
    fn rate_limit_error_carries_retry_after() {
        let body = ServerError::RateLimited {
            retry_after_secs: 3,
        }
        .to_rpc_error();
        assert_eq!(body.code, -32007);
        assert_eq!(body.data.error_type, "RateLimitError");
        assert_eq!(body.data.retry_after, Some(3));
    }

    #[test]
    fn not_found_maps_by_resource_kind() {
        let email = adapter_error_for_email(AdapterError::NotFound("gone".to_owned()), "id-1");
        assert!(matches!(email, ServerError::EmailNotFound(id) if id == "id-1"));

        let folder = adapter_error_for_folder(AdapterError::NotFound("gone".to_owned()), "f-9");
        assert_eq!(folder.error_type(), "FolderNotFoundError");
        assert_eq!(folder.code(), -32002);
    }
}

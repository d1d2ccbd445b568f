//! JSON-RPC 2.0 protocol layer
//!
//! Frame decoding/encoding and the per-connection session state machine.
//! One JSON object per line on the line transport, one per body over HTTP;
//! batch arrays are rejected. Request ids are echoed exactly as received,
//! and requests without an id are notifications that never produce a
//! response.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::errors::{ServerError, ServerResult};

/// Protocol version tag required on every frame
pub const JSONRPC_VERSION: &str = "2.0";

/// Request id: string or integer, echoed verbatim
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    Text(String),
}

/// A decoded request frame
#[derive(Debug, Clone)]
pub struct RpcRequest {
    /// Absent for notifications
    pub id: Option<RequestId>,
    pub method: String,
    /// Always an object; absent params decode as `{}`
    pub params: Value,
}

impl RpcRequest {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// Decode one frame from its textual form
pub fn parse_frame(raw: &str) -> ServerResult<RpcRequest> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|_| ServerError::InvalidRequest("frame is not valid JSON".to_owned()))?;
    parse_value(value)
}

/// Decode one frame from an already-parsed JSON value
pub fn parse_value(value: Value) -> ServerResult<RpcRequest> {
    if value.is_array() {
        return Err(ServerError::InvalidRequest(
            "batch requests are not supported".to_owned(),
        ));
    }
    let Value::Object(frame) = value else {
        return Err(ServerError::InvalidRequest(
            "frame must be a JSON object".to_owned(),
        ));
    };

    match frame.get("jsonrpc").and_then(Value::as_str) {
        Some(JSONRPC_VERSION) => {}
        _ => {
            return Err(ServerError::InvalidRequest(
                "frame must declare jsonrpc \"2.0\"".to_owned(),
            ));
        }
    }

    let method = match frame.get("method").and_then(Value::as_str) {
        Some(m) if !m.is_empty() => m.to_owned(),
        _ => {
            return Err(ServerError::InvalidRequest(
                "method must be a non-empty string".to_owned(),
            ));
        }
    };

    let id = match frame.get("id") {
        None => None,
        Some(Value::String(s)) => Some(RequestId::Text(s.clone())),
        Some(Value::Number(n)) => match n.as_i64() {
            Some(i) => Some(RequestId::Number(i)),
            None => {
                return Err(ServerError::InvalidRequest(
                    "id must be a string or integer".to_owned(),
                ));
            }
        },
        Some(_) => {
            return Err(ServerError::InvalidRequest(
                "id must be a string or integer".to_owned(),
            ));
        }
    };

    let params = match frame.get("params") {
        None | Some(Value::Null) => json!({}),
        Some(p @ Value::Object(_)) => p.clone(),
        Some(_) => {
            return Err(ServerError::InvalidRequest(
                "params must be an object".to_owned(),
            ));
        }
    };

    Ok(RpcRequest { id, method, params })
}

/// Build a success response envelope
pub fn success_response(id: &RequestId, result: Value) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "result": result,
    })
}

/// Build an error response envelope
///
/// `id` is `null` when the failure happened before an id could be read
/// (malformed frames).
pub fn error_response(id: Option<&RequestId>, error: &ServerError) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": error.to_rpc_error(),
    })
}

/// Encode a response for the line transport: one compact object, one line
pub fn encode_frame(response: &Value) -> String {
    response.to_string()
}

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Initializing,
    Ready,
    Closing,
    Closed,
}

#[derive(Debug)]
struct SessionInner {
    state: SessionState,
    peer_name: Option<String>,
    peer_version: Option<String>,
    negotiated_capabilities: Option<Value>,
}

/// Per-connection session
///
/// Any request other than the handshake fails until the session reaches
/// `Ready`. HTTP connections use [`Session::pre_initialized`]; the line
/// transport starts at `New` and requires `initialize` first.
#[derive(Debug)]
pub struct Session {
    inner: Mutex<SessionInner>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SessionInner {
                state: SessionState::New,
                peer_name: None,
                peer_version: None,
                negotiated_capabilities: None,
            }),
        }
    }

    /// Session that skips the handshake (HTTP transport)
    pub fn pre_initialized(peer_name: &str) -> Self {
        Self {
            inner: Mutex::new(SessionInner {
                state: SessionState::Ready,
                peer_name: Some(peer_name.to_owned()),
                peer_version: None,
                negotiated_capabilities: None,
            }),
        }
    }

    /// Record the handshake and move `New → Initializing`
    ///
    /// # Errors
    ///
    /// `InvalidRequest` when called twice or after close.
    pub fn begin_initialize(
        &self,
        peer_name: &str,
        peer_version: &str,
        capabilities: Option<Value>,
    ) -> ServerResult<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            SessionState::New => {
                inner.state = SessionState::Initializing;
                inner.peer_name = Some(peer_name.to_owned());
                inner.peer_version = Some(peer_version.to_owned());
                inner.negotiated_capabilities = capabilities;
                Ok(())
            }
            SessionState::Initializing | SessionState::Ready => Err(ServerError::InvalidRequest(
                "session is already initialized".to_owned(),
            )),
            SessionState::Closing | SessionState::Closed => Err(ServerError::InvalidRequest(
                "session is closing".to_owned(),
            )),
        }
    }

    /// Move `Initializing → Ready` once the handshake response is emitted
    pub fn mark_ready(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.state == SessionState::Initializing {
            inner.state = SessionState::Ready;
        }
    }

    /// Gate for every non-handshake method
    pub fn require_ready(&self) -> ServerResult<()> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            SessionState::Ready => Ok(()),
            SessionState::New | SessionState::Initializing => {
                Err(ServerError::SessionUninitialized)
            }
            SessionState::Closing | SessionState::Closed => Err(ServerError::InvalidRequest(
                "session is closing".to_owned(),
            )),
        }
    }

    /// Move to `Closing`; the transport closes after the final flush
    pub fn begin_close(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(inner.state, SessionState::New | SessionState::Initializing | SessionState::Ready) {
            inner.state = SessionState::Closing;
        }
    }

    pub fn mark_closed(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.state = SessionState::Closed;
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).state
    }

    pub fn is_closing(&self) -> bool {
        matches!(self.state(), SessionState::Closing | SessionState::Closed)
    }

    /// Peer name recorded at handshake, for observability
    pub fn peer_name(&self) -> Option<String> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .peer_name
            .clone()
    }
}

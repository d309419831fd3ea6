//! Error taxonomy for the client engine.
//!
//! Transport and decode failures are recovered where they happen, request
//! failures only reach the caller awaiting that request, and connection loss
//! becomes visible to the process once reconnecting has given up.

use std::io;
use std::time::Duration;

use rmpv::Value;
use thiserror::Error;

/// A complete message that could not be understood, or one we failed to encode.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("encode failed: {0}")]
    Encode(#[from] rmpv::encode::Error),
}

/// A failure reported by the server for one request.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("rpc error: {message}")]
pub struct RpcError {
    pub message: String,
    pub data: Value,
}

impl RpcError {
    /// Build from the `error` slot of a Response. Servers send a bare string,
    /// a `[code, message]` pair or a map carrying `message`.
    pub fn from_value(v: Value) -> Self {
        let message = match &v {
            Value::String(s) => s.as_str().unwrap_or("<invalid utf-8>").to_string(),
            Value::Array(items) => items.iter()
                .find_map(|i| i.as_str().map(str::to_string))
                .unwrap_or_else(|| v.to_string()),
            Value::Map(entries) => entries.iter()
                .find(|(k, _)| k.as_str() == Some("message"))
                .and_then(|(_, m)| m.as_str().map(str::to_string))
                .unwrap_or_else(|| v.to_string()),
            other => other.to_string(),
        };
        RpcError { message, data: v }
    }

    /// True when the server does not know the method at all.
    pub fn is_unsupported_method(&self) -> bool {
        let m = self.message.to_ascii_lowercase();
        m.contains("unknown method") || m.contains("not supported") || m.contains("no such method")
            || m.contains("method not found")
    }
}

/// Outcome of a single request that did not produce a result.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("request {id} ({method}) timed out after {after:?}")]
    Timeout { method: String, id: u64, after: Duration },
    #[error("connection reset before a response arrived")]
    Disconnected,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("unexpected result for {method}: {reason}")]
    InvalidResult { method: String, reason: String },
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("invalid server address '{0}'")]
    InvalidAddress(String),
    #[error("failed to connect to {address}: {source}")]
    Io { address: String, #[source] source: io::Error },
    #[error("unix sockets are not supported on this platform")]
    Unsupported,
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("server unreachable after {attempts} reconnect attempts: {last}")]
    Exhausted { attempts: u32, #[source] last: ConnectError },
}

/// Reported only by `LayoutState::validate`; layout operations that name a
/// missing pane or tab are no-ops instead.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LayoutInvariantViolation {
    #[error("layout has no tabs")]
    NoTabs,
    #[error("active tab {0} does not exist")]
    ActiveTabMissing(u64),
    #[error("tab {tab} focuses pane {pane} which is not in its tree")]
    FocusMissing { tab: u64, pane: u64 },
    #[error("pane {0} appears more than once")]
    DuplicatePane(u64),
    #[error("tab {tab} has split ratio {ratio} outside (0, 1)")]
    BadRatio { tab: u64, ratio: f32 },
}

/// Process-level failure.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_error_from_string() {
        let e = RpcError::from_value(Value::from("boom"));
        assert_eq!(e.message, "boom");
        assert_eq!(e.data, Value::from("boom"));
    }

    #[test]
    fn rpc_error_from_code_pair() {
        let e = RpcError::from_value(Value::Array(vec![Value::from(-32601), Value::from("unknown method: list_sessions")]));
        assert_eq!(e.message, "unknown method: list_sessions");
        assert!(e.is_unsupported_method());
    }

    #[test]
    fn rpc_error_from_map() {
        let v = Value::Map(vec![
            (Value::from("code"), Value::from(1)),
            (Value::from("message"), Value::from("pty not found")),
        ]);
        let e = RpcError::from_value(v);
        assert_eq!(e.message, "pty not found");
        assert!(!e.is_unsupported_method());
    }
}

//! getWork JSON-RPC message definitions
//!
//! Miners speak line-delimited JSON-RPC 1.0/2.0 style requests. The gateway
//! answers every request carrying an id with exactly one response line.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Size of the per-connection request buffer in bytes
pub const MAX_REQUEST_SIZE: usize = 1024;

/// Longest accepted line, excluding its newline. A line and its terminator
/// must fit the request buffer, so a line of `MAX_REQUEST_SIZE` bytes or more
/// is a flood.
pub const MAX_LINE_LENGTH: usize = MAX_REQUEST_SIZE - 1;

/// Methods the gateway understands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    /// Miner asks for work
    GetWork,
    /// Miner submits a solution
    SubmitWork,
    /// Miner reports its local hashrate
    SubmitHashrate,
    /// Anything else
    Unknown(String),
}

impl Method {
    /// Parse a wire method name. `eth_` and `aqua_` prefixes are aliases.
    pub fn parse_method(s: &str) -> Self {
        let bare = s
            .strip_prefix("eth_")
            .or_else(|| s.strip_prefix("aqua_"));
        match bare {
            Some("getWork") => Self::GetWork,
            Some("submitWork") => Self::SubmitWork,
            Some("submitHashrate") => Self::SubmitHashrate,
            _ => Self::Unknown(s.to_string()),
        }
    }

    /// Method name without namespace
    pub fn as_str(&self) -> &str {
        match self {
            Self::GetWork => "getWork",
            Self::SubmitWork => "submitWork",
            Self::SubmitHashrate => "submitHashrate",
            Self::Unknown(s) => s,
        }
    }

    /// Fully qualified name in the given namespace, as sent upstream
    pub fn in_namespace(&self, namespace: &str) -> String {
        format!("{}_{}", namespace, self.as_str())
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Incoming request line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Request id, echoed back verbatim
    #[serde(default)]
    pub id: Option<Value>,
    /// Method name
    #[serde(default)]
    pub method: String,
    /// Method parameters
    #[serde(default)]
    pub params: Value,
}

impl Request {
    /// Decode one line.
    ///
    /// Invalid JSON and a missing or null id are framing violations: the
    /// connection cannot be answered and is dropped.
    pub fn decode(line: &str) -> Result<Self> {
        let request: Request = serde_json::from_str(line)
            .map_err(|e| Error::framing(format!("malformed request: {}", e)))?;
        match &request.id {
            None | Some(Value::Null) => Err(Error::framing("missing RPC id")),
            Some(_) => Ok(request),
        }
    }

    /// Get the method as enum
    pub fn method_enum(&self) -> Method {
        Method::parse_method(&self.method)
    }

    /// Parameters as a list of strings, if they are exactly that
    pub fn string_params(&self) -> Option<Vec<String>> {
        let items = self.params.as_array()?;
        items
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect()
    }
}

/// Error object carried in a response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub code: i64,
    pub message: String,
}

impl ErrorReply {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// No template has been fetched yet
    pub fn work_not_ready() -> Self {
        Self::new(-1, "Work not ready")
    }

    /// Parameters failed validation
    pub fn invalid_params(detail: impl fmt::Display) -> Self {
        Self::new(-32602, format!("Invalid params: {}", detail))
    }

    /// The method is not part of the getWork protocol
    pub fn method_not_supported(method: &str) -> Self {
        Self::new(-32601, format!("Method not supported: {}", method))
    }

    /// The upstream call failed
    pub fn upstream_failure() -> Self {
        Self::new(-32000, "Upstream error")
    }
}

/// Outgoing response line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: Value,
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReply>,
}

impl Response {
    /// Create a successful response
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            id,
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response
    pub fn error(id: Value, error: ErrorReply) -> Self {
        Self {
            id,
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(error),
        }
    }

    /// Build from a dispatch outcome
    pub fn from_outcome(id: Value, outcome: std::result::Result<Value, ErrorReply>) -> Self {
        match outcome {
            Ok(result) => Self::success(id, result),
            Err(error) => Self::error(id, error),
        }
    }

    /// Encode as one newline-terminated line
    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

//! JSON‑RPC 2.0 core types for pipeline plugins, one object per line.
//!
//! These structs mirror the [JSON‑RPC 2.0 spec](https://www.jsonrpc.org/specification)
//! with one addition: requests may carry a `meta` map of call-scoped headers
//! (see [`SESSION_HEADER`]).
//!
//! Usage example (with `serde_json`):
//! ```ignore
//! use serde_json::json;
//! use pipeline_plugin::jsonrpc::{Id, Method, Request};
//!
//! let req = Request::call(Id::Number(1), Method::CreateSession, Some(json!({"tenant_id": "t1"})));
//! let s = serde_json::to_string(&req).unwrap();
//! ```

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumString};

use crate::error::RuntimeError;

pub const JSONRPC_VERSION: &str = "2.0";

/// Metadata key that names the session a streaming call belongs to.
pub const SESSION_HEADER: &str = "x-session-id";

/// `id` MAY be a string, number or null. We support all forms.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    Number(i64),
    String(String),
    Null,
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Id::Number(n) => write!(f, "{n}"),
            Id::String(s) => f.write_str(s),
            Id::Null => f.write_str("null"),
        }
    }
}

/// Every method a host and a plugin exchange.
///
/// `Batch` and `WriteAck` travel plugin → host as stream notifications; the
/// rest are host → plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, Display, Serialize, Deserialize)]
#[strum(serialize_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub enum Method {
    CreateSession,
    OpenStream,
    Batch,
    Ack,
    OpenWrite,
    WriteBatch,
    WriteAck,
    CloseWrite,
    Write,
    Process,
    CloseSession,
    Cancel,
}

/// JSON‑RPC 2.0 Request object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Call-scoped headers.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub meta: HashMap<String, String>,
    /// Omitted for *notifications*.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Id>,
}

fn default_version() -> String {
    JSONRPC_VERSION.to_owned()
}

/// JSON‑RPC 2.0 Error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Error {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// JSON‑RPC 2.0 Response object.
/// Exactly one of `result` or `error` **must** be present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Error>,
    pub id: Id,
}

/// Convenience enum so callers can `serde_json::from_str::<Message>()` without inspecting the type first.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Request {
    /// Create a *notification* (no response expected).
    pub fn notification(method: Method, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            method: method.to_string(),
            params,
            meta: HashMap::new(),
            id: None,
        }
    }

    /// Create a *call* expecting a response.
    pub fn call(id: Id, method: Method, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            method: method.to_string(),
            params,
            meta: HashMap::new(),
            id: Some(id),
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    /// The session named by the `x-session-id` header, if any.
    pub fn session_header(&self) -> Option<&str> {
        self.meta.get(SESSION_HEADER).map(String::as_str)
    }
}

impl Response {
    /// Convenience helper for a successful result.
    pub fn success(id: Id, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            result: Some(result),
            error: None,
            id,
        }
    }

    /// Convenience helper for an error result.
    pub fn fail(id: Id, code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            result: None,
            error: Some(Error {
                code,
                message: message.into(),
                data,
            }),
            id,
        }
    }

    /// Maps a runtime error onto its wire code; the error kind goes in `data`.
    pub fn from_error(id: Id, err: &RuntimeError) -> Self {
        Self::fail(id, err.code(), err.to_string(), Some(Value::String(err.kind().to_owned())))
    }
}

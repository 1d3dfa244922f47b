//! Params and results of every transport method, plus the bootstrap handshake.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::jsonrpc::Id;
use crate::plugin::Role;
use crate::sink::WriteAck;

/// Version tag written into the handshake line.
pub const PROTOCOL_VERSION: &str = "v1";

/// Byte fields travel as standard base64 strings.
pub mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64_STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64_STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(|err| serde::de::Error::custom(format!("invalid base64 data: {err}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSessionParams {
    pub tenant_id: String,
    #[serde(default, with = "base64_bytes")]
    pub config: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSessionResult {
    pub session_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenStreamParams {
    /// Falls back to the `x-session-id` header when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_window: Option<u64>,
}

/// One source batch, sent as a `batch` notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchNotification {
    pub stream: Id,
    #[serde(with = "base64_bytes")]
    pub frame: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckParams {
    pub session_id: String,
    pub window_delta: u64,
}

/// Shared result shape of `ack` and unary `write`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AckResult {
    pub fn ok() -> Self {
        Self { success: true, error: None }
    }
}

impl From<WriteAck> for AckResult {
    fn from(ack: WriteAck) -> Self {
        Self { success: ack.success, error: ack.error }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenWriteParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// One batch pushed into an open write stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteBatchParams {
    pub stream: Id,
    #[serde(with = "base64_bytes")]
    pub frame: Bytes,
}

/// Sent as a `writeAck` notification for every batch of a write stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteAckNotification {
    pub stream: Id,
    #[serde(flatten)]
    pub ack: WriteAck,
}

/// Final result of `openWrite`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteEndResult {
    pub acked: u64,
}

/// Params of `closeWrite` and `cancel`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamParams {
    pub stream: Id,
}

/// Params of unary `write` and `process`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(with = "base64_bytes")]
    pub frame: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameResult {
    #[serde(with = "base64_bytes")]
    pub frame: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseSessionParams {
    pub session_id: String,
}

/// First and only line a plugin process writes to standard output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub protocol: String,
    pub address: String,
    pub role: Role,
}

impl Handshake {
    pub fn new(address: impl Into<String>, role: Role) -> Self {
        Self { protocol: PROTOCOL_VERSION.to_string(), address: address.into(), role }
    }
}

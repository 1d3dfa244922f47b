//! Runtime error taxonomy and its mapping onto JSON-RPC error codes.

use thiserror::Error;

use crate::codec::FormatError;
use crate::plugin::{PluginError, Role};

pub type Result<T, E = RuntimeError> = std::result::Result<T, E>;

pub const CODE_CONFIG: i64 = -32001;
pub const CODE_NOT_FOUND: i64 = -32002;
pub const CODE_CLOSED: i64 = -32003;
pub const CODE_FORMAT: i64 = -32004;
pub const CODE_USER: i64 = -32005;
pub const CODE_TRANSPORT: i64 = -32006;
pub const CODE_ROLE_MISMATCH: i64 = -32007;
pub const CODE_INVALID_PARAMS: i64 = -32602;
pub const CODE_METHOD_NOT_FOUND: i64 = -32601;
pub const CODE_PARSE_ERROR: i64 = -32700;

#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The callback's init hook rejected the session configuration.
    #[error("session init failed: {0}")]
    Config(PluginError),

    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session is closed: {0}")]
    Closed(String),

    /// A wire frame could not be decoded (or a batch could not be encoded).
    #[error("malformed frame: {0}")]
    Format(#[from] FormatError),

    /// The callback failed during a data operation.
    #[error(transparent)]
    User(#[from] PluginError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("session is bound to a {actual} plugin, this call needs a {expected} plugin")]
    RoleMismatch { expected: Role, actual: Role },

    #[error("invalid params: {0}")]
    InvalidParams(String),
}

impl RuntimeError {
    /// JSON-RPC error code reported to the host.
    pub fn code(&self) -> i64 {
        match self {
            RuntimeError::Config(_) => CODE_CONFIG,
            RuntimeError::NotFound(_) => CODE_NOT_FOUND,
            RuntimeError::Closed(_) => CODE_CLOSED,
            RuntimeError::Format(_) => CODE_FORMAT,
            RuntimeError::User(_) => CODE_USER,
            RuntimeError::Transport(_) => CODE_TRANSPORT,
            RuntimeError::RoleMismatch { .. } => CODE_ROLE_MISMATCH,
            RuntimeError::InvalidParams(_) => CODE_INVALID_PARAMS,
        }
    }

    /// Short machine-readable kind, sent as the error's `data`.
    pub fn kind(&self) -> &'static str {
        match self {
            RuntimeError::Config(_) => "config",
            RuntimeError::NotFound(_) => "not_found",
            RuntimeError::Closed(_) => "closed",
            RuntimeError::Format(_) => "format",
            RuntimeError::User(_) => "user",
            RuntimeError::Transport(_) => "transport",
            RuntimeError::RoleMismatch { .. } => "role_mismatch",
            RuntimeError::InvalidParams(_) => "invalid_params",
        }
    }

    pub fn is_session_gone(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_) | RuntimeError::Closed(_))
    }
}

impl From<serde_json::Error> for RuntimeError {
    fn from(err: serde_json::Error) -> Self {
        RuntimeError::InvalidParams(err.to_string())
    }
}

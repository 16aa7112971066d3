use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Stable, wire-visible classification of a [`DbError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Io,
    Storage,
    Serialization,
    InvalidConfig,
    Connection,
    Protocol,
    InvalidKey,
    InvalidBin,
    InvalidCommand,
    IndexAlreadyExists,
    IndexNotFound,
    IndexNotReadable,
    IndexBuildFailed,
    UdfNotFound,
    UdfNotReady,
    UdfCompile,
    UdfArity,
    UdfRuntime,
    CursorNotFound,
    CursorClosed,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Io => "io",
            ErrorCode::Storage => "storage",
            ErrorCode::Serialization => "serialization",
            ErrorCode::InvalidConfig => "invalid_config",
            ErrorCode::Connection => "connection",
            ErrorCode::Protocol => "protocol",
            ErrorCode::InvalidKey => "invalid_key",
            ErrorCode::InvalidBin => "invalid_bin",
            ErrorCode::InvalidCommand => "invalid_command",
            ErrorCode::IndexAlreadyExists => "index_already_exists",
            ErrorCode::IndexNotFound => "index_not_found",
            ErrorCode::IndexNotReadable => "index_not_readable",
            ErrorCode::IndexBuildFailed => "index_build_failed",
            ErrorCode::UdfNotFound => "udf_not_found",
            ErrorCode::UdfNotReady => "udf_not_ready",
            ErrorCode::UdfCompile => "udf_compile",
            ErrorCode::UdfArity => "udf_arity",
            ErrorCode::UdfRuntime => "udf_runtime",
            ErrorCode::CursorNotFound => "cursor_not_found",
            ErrorCode::CursorClosed => "cursor_closed",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("invalid bin: {0}")]
    InvalidBin(String),
    #[error("invalid info command: {0}")]
    InvalidCommand(String),
    #[error("index already exists: {0}")]
    IndexAlreadyExists(String),
    #[error("index not found: {0}")]
    IndexNotFound(String),
    #[error("index not readable (still building): {0}")]
    IndexNotReadable(String),
    #[error("index {name} build failed: {reason}")]
    IndexBuildFailed { name: String, reason: String },
    #[error("udf module not registered: {0}")]
    UdfNotFound(String),
    #[error("udf module not ready: {0}")]
    UdfNotReady(String),
    #[error("udf module {module} failed to compile: {reason}")]
    UdfCompile { module: String, reason: String },
    #[error("udf function {function} expects {expected} argument(s), got {got}")]
    UdfArity {
        function: String,
        expected: usize,
        got: usize,
    },
    #[error("udf runtime error: {0}")]
    UdfRuntime(String),
    #[error("cursor not found: {0}")]
    CursorNotFound(Uuid),
    #[error("cursor already closed")]
    CursorClosed,
    #[error("server error ({code}): {message}")]
    Remote { code: ErrorCode, message: String },
}

impl DbError {
    pub fn code(&self) -> ErrorCode {
        match self {
            DbError::Io(_) => ErrorCode::Io,
            DbError::Storage(_) => ErrorCode::Storage,
            DbError::Serialization(_) => ErrorCode::Serialization,
            DbError::InvalidConfig(_) => ErrorCode::InvalidConfig,
            DbError::Connection(_) => ErrorCode::Connection,
            DbError::Protocol(_) => ErrorCode::Protocol,
            DbError::InvalidKey(_) => ErrorCode::InvalidKey,
            DbError::InvalidBin(_) => ErrorCode::InvalidBin,
            DbError::InvalidCommand(_) => ErrorCode::InvalidCommand,
            DbError::IndexAlreadyExists(_) => ErrorCode::IndexAlreadyExists,
            DbError::IndexNotFound(_) => ErrorCode::IndexNotFound,
            DbError::IndexNotReadable(_) => ErrorCode::IndexNotReadable,
            DbError::IndexBuildFailed { .. } => ErrorCode::IndexBuildFailed,
            DbError::UdfNotFound(_) => ErrorCode::UdfNotFound,
            DbError::UdfNotReady(_) => ErrorCode::UdfNotReady,
            DbError::UdfCompile { .. } => ErrorCode::UdfCompile,
            DbError::UdfArity { .. } => ErrorCode::UdfArity,
            DbError::UdfRuntime(_) => ErrorCode::UdfRuntime,
            DbError::CursorNotFound(_) => ErrorCode::CursorNotFound,
            DbError::CursorClosed => ErrorCode::CursorClosed,
            DbError::Remote { code, .. } => *code,
        }
    }
}

impl From<reqwest::Error> for DbError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() {
            DbError::Connection(err.to_string())
        } else {
            DbError::Protocol(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

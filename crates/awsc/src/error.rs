//! 💀 Errors — the taxonomy of everything that can go sideways between a CSV and Redshift.
//!
//! 🧠 Knowledge graph:
//! - `ConfigError`: the job was doomed before it started (zero chunk size, KMS without a key).
//! - `AuthError`: SSO said no, or said "try again later" too many times.
//! - `StorageError`: S3 hiccups (`Transient`, retried) or S3 slams the door (`Permanent`).
//! - `WarehouseError`: something in BEGIN/ENSURE_TABLE/COPY/COMMIT broke. Always rolled back.
//! - `PayloadError`: the file wasn't there, or the table couldn't become CSV.
//! - `ErrorDetail`: the flattened, serializable shape every one of these collapses into
//!   when it lands in a `TransferResult` or an `OperationReport`.
//!
//! The library speaks `thiserror`. The glue code and the CLI speak `anyhow`.
//! Both are fluent in disappointment. 🦆

use serde::Serialize;
use thiserror::Error;

/// 🏷️ Coarse classification of a failure, used in results and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Auth,
    Storage,
    Warehouse,
    Config,
    Payload,
    Cancelled,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let the_name = match self {
            ErrorKind::Auth => "auth",
            ErrorKind::Storage => "storage",
            ErrorKind::Warehouse => "warehouse",
            ErrorKind::Config => "config",
            ErrorKind::Payload => "payload",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        };
        f.write_str(the_name)
    }
}

/// 📋 One error, flattened for reporting: what kind, what happened, and which chunk (if any).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub message: String,
    /// 🔢 Sequence index of the chunk that failed, when the failure belongs to one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk: Option<usize>,
}

impl ErrorDetail {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            chunk: None,
        }
    }

    pub fn for_chunk(mut self, index: usize) -> Self {
        self.chunk = Some(index);
        self
    }
}

impl std::fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.chunk {
            Some(index) => write!(f, "[{}] chunk {}: {}", self.kind, index, self.message),
            None => write!(f, "[{}] {}", self.kind, self.message),
        }
    }
}

/// 🔧 Invalid construction input. Raised before any network call is made.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("chunk size must be greater than zero")]
    ZeroChunkSize,
    #[error("KMS encryption requires a non-empty key id")]
    MissingKmsKeyId,
    #[error("parallelism must be at least 1")]
    ZeroParallelism,
    #[error("{field} cannot be empty")]
    Empty { field: &'static str },
    #[error("{field} is invalid: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// 🔐 Identity acquisition failed for good.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// The provider rejected the credentials (revoked, invalid, CLI missing). Never retried.
    #[error("identity provider rejected the request: {message}")]
    Rejected { message: String },
    /// Every attempt hit a transient failure and the retry budget ran out.
    #[error("identity provider still failing after {attempts} attempt(s): {message}")]
    Exhausted { attempts: u32, message: String },
    /// The provider handed back a session that breaks the expiry invariant.
    #[error("session is invalid: {message}")]
    InvalidSession { message: String },
}

/// 🪣 Object storage failures, split by whether a retry has any hope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// Timeout, throttling, 5xx, dropped connection. Worth another go.
    #[error("transient storage failure: {message}")]
    Transient { message: String },
    /// Permission denied, bucket missing, malformed key. Retrying is just rude.
    #[error("permanent storage failure: {message}")]
    Permanent { message: String },
}

impl StorageError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// 🐘 What the warehouse driver said when it said no.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct DriverError {
    pub message: String,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// 🏗️ The step of the load protocol a warehouse failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStep {
    Begin,
    EnsureTable,
    Truncate,
    Copy,
    Commit,
}

impl std::fmt::Display for LoadStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let the_step = match self {
            LoadStep::Begin => "BEGIN",
            LoadStep::EnsureTable => "ENSURE_TABLE",
            LoadStep::Truncate => "TRUNCATE",
            LoadStep::Copy => "COPY",
            LoadStep::Commit => "COMMIT",
        };
        f.write_str(the_step)
    }
}

/// 🐘 A load step failed. If the transaction was open, it has been rolled back.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("warehouse load failed at {step}{}: {source}", statement_suffix(.statement))]
pub struct WarehouseError {
    pub step: LoadStep,
    /// The statement that triggered the failure, with credentials redacted.
    pub statement: Option<String>,
    #[source]
    pub source: DriverError,
    /// False only when the rollback itself also failed (or there was nothing to roll back).
    pub rolled_back: bool,
}

fn statement_suffix(statement: &Option<String>) -> String {
    match statement {
        Some(sql) => format!(" (statement: {})", sql.trim()),
        None => String::new(),
    }
}

/// 📂 The payload could not be turned into bytes.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("failed to read source file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to compress chunk body: {0}")]
    Compress(#[source] std::io::Error),
}

/// ☂️ Umbrella error for the `Connector` facade.
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Warehouse(#[from] WarehouseError),
    #[error(transparent)]
    Payload(#[from] PayloadError),
}

impl From<&ConfigError> for ErrorDetail {
    fn from(err: &ConfigError) -> Self {
        ErrorDetail::new(ErrorKind::Config, err.to_string())
    }
}

impl From<&AuthError> for ErrorDetail {
    fn from(err: &AuthError) -> Self {
        ErrorDetail::new(ErrorKind::Auth, err.to_string())
    }
}

impl From<&StorageError> for ErrorDetail {
    fn from(err: &StorageError) -> Self {
        ErrorDetail::new(ErrorKind::Storage, err.to_string())
    }
}

impl From<&WarehouseError> for ErrorDetail {
    fn from(err: &WarehouseError) -> Self {
        ErrorDetail::new(ErrorKind::Warehouse, err.to_string())
    }
}

impl From<&PayloadError> for ErrorDetail {
    fn from(err: &PayloadError) -> Self {
        ErrorDetail::new(ErrorKind::Payload, err.to_string())
    }
}

impl From<&ConnectorError> for ErrorDetail {
    fn from(err: &ConnectorError) -> Self {
        match err {
            ConnectorError::Config(e) => e.into(),
            ConnectorError::Auth(e) => e.into(),
            ConnectorError::Storage(e) => e.into(),
            ConnectorError::Warehouse(e) => e.into(),
            ConnectorError::Payload(e) => e.into(),
        }
    }
}

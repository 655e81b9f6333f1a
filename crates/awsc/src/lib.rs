//! 🪣 awsc — S3, Redshift and SSO, bound into one client that survives bad days.
//!
//! 🧠 Knowledge graph:
//! - `identity`: sessions, the credential store, the single-flight refresher, the refresh ledger.
//! - `transfer`: jobs, the chunker, tables-as-CSV, the resilient uploader.
//! - `warehouse`: the transactional loader and its COPY statement.
//! - `backends`: the three client traits, their AWS implementations, and in-memory understudies.
//! - `connector`: the facade most callers want.
//! - `app_config`, `error`, `progress`, `retry`: the plumbing everyone shares.

pub mod app_config;
pub mod backends;
pub mod connector;
pub mod error;
pub mod identity;
pub mod progress;
pub mod retry;
pub mod transfer;
pub mod warehouse;

pub use app_config::{AppConfig, load_config};
pub use connector::{Connector, ConnectorParts, ConnectorSettings, OperationReport, PushOutcome, WarehouseUpload};
pub use error::{
    AuthError, ConfigError, ConnectorError, DriverError, ErrorDetail, ErrorKind, LoadStep, PayloadError, StorageError,
    WarehouseError,
};
pub use identity::{CredentialStore, Credentials, IdentityRefresher, RefreshHandle, Session, SessionState};
pub use retry::BackoffPolicy;
pub use transfer::{
    Compression, EncryptionMode, Payload, StorageDestination, StorageLocation, Table, TransferJob, TransferOptions,
    TransferResult,
};
pub use warehouse::{CopyManifest, CopyOptions, LoadResult, TableRef, WarehouseLoader};

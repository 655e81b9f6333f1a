//! 🔌 Backends — where the real I/O happens.
//!
//! 🚰 Three collaborators, three traits. The core never talks to AWS directly; it talks
//! to whatever implements these. Production gets the SDK, tests get the in-memory
//! doubles, and nobody has to subclass anything to swap them.
//!
//! 🎭 The casting agency:
//! - `ObjectStoreClient` → `s3::S3ObjectStore` (aws-sdk-s3) or `in_mem::InMemoryObjectStore`
//! - `WarehouseClient`   → `redshift::RedshiftWarehouse` (tokio-postgres) or `in_mem::InMemoryWarehouse`
//! - `IdentityClient`    → `sso_cli::AwsCliSso` (the `aws` binary) or `in_mem::ScriptedIdentity`
//!
//! 🦆 The duck is here because every file must have one. This is law. Do not question the duck.

pub mod in_mem;
pub mod redshift;
pub mod s3;
pub mod sso_cli;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{DriverError, StorageError};
use crate::identity::{RefreshHandle, Session};
use crate::transfer::EncryptionMode;
use crate::warehouse::BulkLoad;

// ===== Object storage =====

/// 📦 One put-object call: where it goes, what it carries, how it's encrypted.
#[derive(Debug, Clone)]
pub struct PutObject {
    pub bucket: String,
    pub key: String,
    pub body: Bytes,
    pub encryption: EncryptionMode,
}

/// 🪣 The object-storage collaborator.
///
/// # Contract
/// - `put_object` either lands the whole body under `key` or returns an error.
/// - Errors must say whether a retry could help (`StorageError::Transient`) or not.
/// - The session is the one the caller just validated; implementations sign with it.
#[async_trait]
pub trait ObjectStoreClient: Send + Sync + std::fmt::Debug {
    async fn put_object(&self, session: &Session, request: PutObject) -> Result<(), StorageError>;

    /// 🔍 HEAD the key. `Ok(false)` for "not there", `Err` for "couldn't tell".
    async fn object_exists(&self, session: &Session, bucket: &str, key: &str) -> Result<bool, StorageError>;
}

// ===== Warehouse =====

/// 🐘 The warehouse collaborator: one connection, explicit transaction control.
///
/// # Contract
/// - `begin` opens a transaction; `commit`/`rollback` close it.
/// - `execute` and `bulk_load` run inside whatever transaction is open.
/// - Callers serialize access; implementations do not need to juggle concurrent transactions.
#[async_trait]
pub trait WarehouseClient: Send + Sync + std::fmt::Debug {
    async fn begin(&self) -> Result<(), DriverError>;
    async fn execute(&self, statement: &str) -> Result<(), DriverError>;
    async fn bulk_load(&self, load: &BulkLoad) -> Result<(), DriverError>;
    async fn commit(&self) -> Result<(), DriverError>;
    async fn rollback(&self) -> Result<(), DriverError>;
}

// ===== Identity =====

/// 🔐 Why the identity provider said no.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityFailure {
    /// Throttled, network blip, timeout. Try again later.
    #[error("transient identity failure: {0}")]
    Transient(String),
    /// The refresh handle is stale or unknown. A full login can still work.
    #[error("refresh handle rejected: {0}")]
    HandleRejected(String),
    /// The principal or its credentials were rejected. Nothing we retry will fix it.
    #[error("credentials rejected: {0}")]
    CredentialsRejected(String),
}

impl crate::retry::Retryable for IdentityFailure {
    fn is_transient(&self) -> bool {
        matches!(self, IdentityFailure::Transient(_))
    }
}

/// 🔐 The SSO identity provider.
#[async_trait]
pub trait IdentityClient: Send + Sync + std::fmt::Debug {
    /// Full login flow. May be interactive (browser device-code flow) in production.
    async fn login(&self) -> Result<Session, IdentityFailure>;
    /// Cheap, non-interactive renewal using a handle from a previous session.
    async fn refresh(&self, handle: &RefreshHandle) -> Result<Session, IdentityFailure>;
}

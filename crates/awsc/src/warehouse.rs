// ai
//! 🐘 Warehouse — "load this staged object into that table" as one transaction.
//!
//! 🎬 *[COPY fails halfway. The table that CREATE just made? Never existed. Nobody saw a thing.]*
//!
//! The state machine:
//!
//! ```text
//! BEGIN → [ENSURE_TABLE] → [TRUNCATE] → COPY → COMMIT
//!    ╰──────────── any failure after BEGIN ────────────→ ROLLBACK
//! ```
//!
//! 🧠 Knowledge graph:
//! - `Transaction`: the guard. Holds the connection lock from BEGIN until COMMIT/ROLLBACK.
//!   Dropped without either (panic, cancelled future), it spawns a ROLLBACK and keeps
//!   the lock until that ROLLBACK has run, so the next transaction starts on a clean connection.
//! - `CopyAuthorizer`: IAM role, or the caller's SSO session credentials (fetched right before COPY).
//! - `copy_command.rs`: `CopyOptions`, `CopyAuthorization`, `CopyManifest`, `BulkLoad` and the COPY rendering.
//! - The loader never uploads. COPY points at what the uploader already staged: a bare
//!   prefix when the caller asks for one, a manifest when the request says `manifest`.

mod copy_command;

pub use copy_command::{BulkLoad, CopyAuthorization, CopyManifest, CopyOptions, ManifestEntry};

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use crate::backends::WarehouseClient;
use crate::error::{ConfigError, DriverError, LoadStep, WarehouseError};
use crate::identity::IdentityRefresher;
use crate::transfer::StorageLocation;

/// 🏷️ `[database.][schema.]name`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TableRef {
    pub database: Option<String>,
    pub schema: Option<String>,
    pub name: String,
}

impl TableRef {
    pub fn new(database: Option<String>, schema: Option<String>, name: impl Into<String>) -> Self {
        Self {
            database,
            schema,
            name: name.into(),
        }
    }

    /// 🔍 Parses `name`, `schema.name` or `database.schema.name`.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let the_parts: Vec<&str> = raw.trim().split('.').map(str::trim).collect();
        if the_parts.iter().any(|part| part.is_empty()) {
            return Err(ConfigError::Invalid {
                field: "table",
                reason: format!("'{raw}' has an empty name segment"),
            });
        }
        match the_parts.as_slice() {
            [name] => Ok(Self::new(None, None, *name)),
            [schema, name] => Ok(Self::new(None, Some(schema.to_string()), *name)),
            [database, schema, name] => Ok(Self::new(Some(database.to_string()), Some(schema.to_string()), *name)),
            _ => Err(ConfigError::Invalid {
                field: "table",
                reason: format!("'{raw}' has more than three segments"),
            }),
        }
    }

    /// Fills in the database when the reference doesn't name one.
    pub fn in_database(mut self, database: Option<&str>) -> Self {
        if self.database.is_none() && self.schema.is_some() {
            self.database = database.map(str::to_string);
        }
        self
    }

    pub fn qualified(&self) -> String {
        [self.database.as_deref(), self.schema.as_deref(), Some(self.name.as_str())]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(".")
    }
}

impl std::fmt::Display for TableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.qualified())
    }
}

/// 🔑 Where COPY's bucket permissions come from.
#[derive(Debug, Clone)]
pub enum CopyAuthorizer {
    IamRole(String),
    /// Inline credentials from the current SSO session.
    Session(Arc<IdentityRefresher>),
}

impl CopyAuthorizer {
    async fn resolve(&self) -> Result<CopyAuthorization, DriverError> {
        match self {
            CopyAuthorizer::IamRole(arn) => Ok(CopyAuthorization::IamRole(arn.clone())),
            CopyAuthorizer::Session(refresher) => refresher
                .ensure_valid()
                .await
                .map(|session| CopyAuthorization::SessionCredentials(session.credentials().clone()))
                .map_err(|err| DriverError::new(format!("could not obtain credentials for COPY: {err}"))),
        }
    }
}

/// 🔧 Loader-wide defaults.
#[derive(Debug, Clone)]
pub struct LoaderSettings {
    pub copy: CopyOptions,
    pub authorizer: CopyAuthorizer,
    /// Log every COPY (redacted) at info before running it.
    pub echo: bool,
}

/// 📋 One load, fully described.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub table: TableRef,
    pub source: StorageLocation,
    /// `source` is a manifest listing the objects, not a key prefix.
    pub manifest: bool,
    pub create_table_statement: Option<String>,
    pub truncate_statement: Option<String>,
    /// Skip ENSURE_TABLE even when a create statement is given.
    pub table_known_to_exist: bool,
    /// Overrides the loader's default COPY options.
    pub copy: Option<CopyOptions>,
}

impl LoadRequest {
    pub fn new(table: TableRef, source: StorageLocation) -> Self {
        Self {
            table,
            source,
            manifest: false,
            create_table_statement: None,
            truncate_statement: None,
            table_known_to_exist: false,
            copy: None,
        }
    }

    /// 📒 COPY reads exactly the objects the manifest at `manifest` lists.
    pub fn from_manifest(table: TableRef, manifest: StorageLocation) -> Self {
        Self {
            manifest: true,
            ..Self::new(table, manifest)
        }
    }

    pub fn create_with(mut self, statement: impl Into<String>) -> Self {
        self.create_table_statement = Some(statement.into());
        self
    }

    pub fn truncate_with(mut self, statement: impl Into<String>) -> Self {
        self.truncate_statement = Some(statement.into());
        self
    }

    pub fn copy_with(mut self, options: CopyOptions) -> Self {
        self.copy = Some(options);
        self
    }
}

/// ✅ A committed load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadResult {
    pub success: bool,
    pub table: TableRef,
    pub source: StorageLocation,
    pub steps: Vec<LoadStep>,
    pub message: String,
}

/// 🔒 An open transaction. Finish it with `commit` or `rollback`; dropping it rolls back in the background.
struct Transaction {
    client: Arc<dyn WarehouseClient>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Transaction {
    async fn begin(client: Arc<dyn WarehouseClient>, lock: Arc<Mutex<()>>) -> Result<Self, DriverError> {
        let the_guard = lock.lock_owned().await;
        client.begin().await?;
        Ok(Self {
            client,
            guard: Some(the_guard),
        })
    }

    async fn execute(&self, statement: &str) -> Result<(), DriverError> {
        self.client.execute(statement).await
    }

    async fn bulk_load(&self, load: &BulkLoad) -> Result<(), DriverError> {
        self.client.bulk_load(load).await
    }

    /// On failure the transaction is rolled back; the flag says whether that worked.
    async fn commit(mut self) -> Result<(), (DriverError, bool)> {
        let the_result = self.client.commit().await;
        let the_outcome = match the_result {
            Ok(()) => Ok(()),
            Err(err) => Err((err, rollback_logged(self.client.as_ref()).await)),
        };
        self.guard.take();
        the_outcome
    }

    /// Returns whether the rollback succeeded.
    async fn rollback(mut self) -> bool {
        let the_rolled_back = rollback_logged(self.client.as_ref()).await;
        self.guard.take();
        the_rolled_back
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        let Some(the_guard) = self.guard.take() else {
            return;
        };
        let the_client = Arc::clone(&self.client);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("🧹 transaction dropped mid-flight, rolling back in the background");
                handle.spawn(async move {
                    rollback_logged(the_client.as_ref()).await;
                    drop(the_guard);
                });
            }
            Err(_) => error!("💀 transaction dropped outside a runtime; the connection may still hold it open"),
        }
    }
}

async fn rollback_logged(client: &dyn WarehouseClient) -> bool {
    match client.rollback().await {
        Ok(()) => {
            debug!("↩️ transaction rolled back");
            true
        }
        Err(err) => {
            error!("💀 ROLLBACK failed too: {err}");
            false
        }
    }
}

/// 🐘 Runs load requests against one warehouse connection, one transaction at a time.
#[derive(Debug, Clone)]
pub struct WarehouseLoader {
    client: Arc<dyn WarehouseClient>,
    connection: Arc<Mutex<()>>,
    settings: LoaderSettings,
}

impl WarehouseLoader {
    pub fn new(client: Arc<dyn WarehouseClient>, settings: LoaderSettings) -> Self {
        Self {
            client,
            connection: Arc::new(Mutex::new(())),
            settings,
        }
    }

    pub fn settings(&self) -> &LoaderSettings {
        &self.settings
    }

    /// 🎯 The short form: COPY `source` into `table`, creating it first if a statement is given.
    pub async fn load(
        &self,
        table: &TableRef,
        source: &StorageLocation,
        create_table_statement: Option<&str>,
    ) -> Result<LoadResult, WarehouseError> {
        let mut the_request = LoadRequest::new(table.clone(), source.clone());
        the_request.create_table_statement = create_table_statement.map(str::to_string);
        self.load_request(the_request).await
    }

    pub async fn load_request(&self, request: LoadRequest) -> Result<LoadResult, WarehouseError> {
        info!(table = %request.table, source = %request.source, "🐘 load starting");
        let mut the_steps = Vec::with_capacity(5);
        let the_tx = Transaction::begin(Arc::clone(&self.client), Arc::clone(&self.connection))
            .await
            .map_err(|source| WarehouseError {
                step: LoadStep::Begin,
                statement: None,
                source,
                rolled_back: false,
            })?;
        the_steps.push(LoadStep::Begin);

        if let Some(create) = request.create_table_statement.as_deref()
            && !request.table_known_to_exist
        {
            if let Err(source) = the_tx.execute(create).await {
                return Err(abort(the_tx, LoadStep::EnsureTable, Some(create.to_string()), source).await);
            }
            the_steps.push(LoadStep::EnsureTable);
        }

        if let Some(truncate) = request.truncate_statement.as_deref() {
            if let Err(source) = the_tx.execute(truncate).await {
                return Err(abort(the_tx, LoadStep::Truncate, Some(truncate.to_string()), source).await);
            }
            the_steps.push(LoadStep::Truncate);
        }

        let the_authorization = match self.settings.authorizer.resolve().await {
            Ok(authorization) => authorization,
            Err(source) => return Err(abort(the_tx, LoadStep::Copy, None, source).await),
        };
        let the_load = BulkLoad {
            table: request.table.clone(),
            source: request.source.clone(),
            manifest: request.manifest,
            options: request.copy.clone().unwrap_or_else(|| self.settings.copy.clone()),
            authorization: the_authorization,
        };
        let the_redacted = the_load.redacted_statement();
        if self.settings.echo {
            info!("📜 COPY command that will be executed:\n{the_redacted}");
        }
        if let Err(source) = the_tx.bulk_load(&the_load).await {
            return Err(abort(the_tx, LoadStep::Copy, Some(the_redacted), source).await);
        }
        the_steps.push(LoadStep::Copy);

        if let Err((source, rolled_back)) = the_tx.commit().await {
            error!(table = %request.table, "💀 COMMIT failed: {source}");
            return Err(WarehouseError {
                step: LoadStep::Commit,
                statement: Some("COMMIT".to_string()),
                source,
                rolled_back,
            });
        }
        the_steps.push(LoadStep::Commit);

        let the_message = format!("loaded {} into {}", request.source, request.table);
        info!(table = %request.table, "✅ {the_message}");
        Ok(LoadResult {
            success: true,
            table: request.table,
            source: request.source,
            steps: the_steps,
            message: the_message,
        })
    }
}

async fn abort(tx: Transaction, step: LoadStep, statement: Option<String>, source: DriverError) -> WarehouseError {
    error!(%step, "💀 load step failed, rolling back: {source}");
    let the_rolled_back = tx.rollback().await;
    WarehouseError {
        step,
        statement,
        source,
        rolled_back: the_rolled_back,
    }
}

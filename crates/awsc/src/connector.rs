// ai
//! 🎛️ Connector — one client, three AWS surfaces, zero ceremony for the caller.
//!
//! 🎬 *[A DataFrame walks into a bar. Forty seconds later it's a Redshift table.
//! The bartender never learned about SSO tokens, chunk sizes, or transactions.]*
//!
//! 🧠 Knowledge graph:
//! - Built from `ConnectorParts` (any trait objects, tests use the in-memory ones) or from
//!   an `AppConfig` (production: S3 + Redshift + the AWS CLI).
//! - Owns one `IdentityRefresher`; the uploader and the COPY authorizer share it.
//! - Every finished upload stages `<name>.manifest` next to its objects, naming exactly
//!   the keys it wrote. Loads COPY from that manifest, never from the bare prefix, so
//!   leftovers from an older upload of the same name stay out of the table.
//! - `push` = upload, then load, and the load only runs when every chunk made it.
//! - `push_many` keeps input order in its results no matter how many run at once.
//! - IGNOREHEADER follows the payload: tables always carry a header, bytes and files
//!   only when `header_row` says so. Every part repeats it, so loads refuse to run
//!   with `repeat_header` switched off.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use bytes::Bytes;
use chrono::Utc;
use futures::{StreamExt, stream};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::app_config::AppConfig;
use crate::backends::redshift::RedshiftWarehouse;
use crate::backends::s3::S3ObjectStore;
use crate::backends::sso_cli::AwsCliSso;
use crate::backends::{IdentityClient, ObjectStoreClient, PutObject, WarehouseClient};
use crate::error::{AuthError, ConfigError, ConnectorError, ErrorDetail, StorageError};
use crate::identity::{CredentialStore, IdentityRefresher, RefreshLedger, RefresherSettings, Session};
use crate::retry::retry_transient;
use crate::transfer::{
    Payload, ResilientUploader, StorageDestination, StorageLocation, Table, TransferJob, TransferOptions,
    TransferResult, UploaderSettings, normalize_prefix,
};
use crate::warehouse::{
    CopyAuthorizer, CopyManifest, CopyOptions, LoadRequest, LoadResult, LoaderSettings, TableRef, WarehouseLoader,
};

/// 🔧 Everything the connector needs that isn't a client.
#[derive(Debug, Clone)]
pub struct ConnectorSettings {
    pub bucket: String,
    /// Key prefix every object lands under.
    pub directory: String,
    pub transfer: TransferOptions,
    pub uploader: UploaderSettings,
    pub refresher: RefresherSettings,
    pub copy: CopyOptions,
    /// COPY authorizes with this role ARN; without one it uses the SSO session's credentials.
    pub iam_role: Option<String>,
    pub echo: bool,
}

/// 🧩 The collaborators, bring your own.
#[derive(Debug)]
pub struct ConnectorParts {
    pub object_store: Arc<dyn ObjectStoreClient>,
    /// `None` ⇒ upload-only connector; loads fail with a `ConfigError`.
    pub warehouse: Option<Arc<dyn WarehouseClient>>,
    pub identity: Arc<dyn IdentityClient>,
    pub ledger: Option<RefreshLedger>,
    pub settings: ConnectorSettings,
}

/// 📋 One item for `push`: what to upload and where it ends up.
#[derive(Debug, Clone)]
pub struct WarehouseUpload {
    pub payload: Payload,
    pub table: TableRef,
    /// Defaults to the file name (files) or `<table>_<timestamp>.csv` (tables). Required for bytes.
    pub object_name: Option<String>,
    pub create_table_statement: Option<String>,
    pub truncate_statement: Option<String>,
}

impl WarehouseUpload {
    pub fn new(payload: Payload, table: TableRef) -> Self {
        Self {
            payload,
            table,
            object_name: None,
            create_table_statement: None,
            truncate_statement: None,
        }
    }

    pub fn named(mut self, object_name: impl Into<String>) -> Self {
        self.object_name = Some(object_name.into());
        self
    }

    pub fn create_with(mut self, statement: impl Into<String>) -> Self {
        self.create_table_statement = Some(statement.into());
        self
    }

    pub fn truncate_with(mut self, statement: impl Into<String>) -> Self {
        self.truncate_statement = Some(statement.into());
        self
    }
}

/// 📦 What `push` did. `load` is `None` when the upload failed or there was nothing to load.
#[derive(Debug, Clone)]
pub struct PushOutcome {
    pub transfer: TransferResult,
    pub load: Option<LoadResult>,
}

impl PushOutcome {
    pub fn success(&self) -> bool {
        self.transfer.success && (self.load.is_some() || self.transfer.location.is_none())
    }
}

/// 🧾 The flat "did it work" shape: success, a message, and the error if there was one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationReport {
    pub success: bool,
    pub message: String,
    pub error: Option<ErrorDetail>,
}

impl From<&TransferResult> for OperationReport {
    fn from(result: &TransferResult) -> Self {
        Self {
            success: result.success,
            message: result.message(),
            error: result.error.clone(),
        }
    }
}

impl From<&LoadResult> for OperationReport {
    fn from(result: &LoadResult) -> Self {
        Self {
            success: result.success,
            message: result.message.clone(),
            error: None,
        }
    }
}

impl From<&PushOutcome> for OperationReport {
    fn from(outcome: &PushOutcome) -> Self {
        match &outcome.load {
            Some(load) => load.into(),
            None if !outcome.transfer.success => (&outcome.transfer).into(),
            None => Self {
                success: true,
                message: "payload was empty, nothing to load".to_string(),
                error: None,
            },
        }
    }
}

impl From<&ConnectorError> for OperationReport {
    fn from(err: &ConnectorError) -> Self {
        Self {
            success: false,
            message: err.to_string(),
            error: Some(err.into()),
        }
    }
}

impl From<&Result<LoadResult, ConnectorError>> for OperationReport {
    fn from(result: &Result<LoadResult, ConnectorError>) -> Self {
        match result {
            Ok(load) => load.into(),
            Err(err) => err.into(),
        }
    }
}

impl From<&Result<PushOutcome, ConnectorError>> for OperationReport {
    fn from(result: &Result<PushOutcome, ConnectorError>) -> Self {
        match result {
            Ok(outcome) => outcome.into(),
            Err(err) => err.into(),
        }
    }
}

/// 🎛️ The facade.
#[derive(Debug)]
pub struct Connector {
    settings: ConnectorSettings,
    object_store: Arc<dyn ObjectStoreClient>,
    refresher: Arc<IdentityRefresher>,
    uploader: ResilientUploader,
    loader: Option<WarehouseLoader>,
    /// Keeps generated object names unique within one process.
    sequence: AtomicU64,
}

impl Connector {
    /// 🏗️ Wires the parts together. Validates the destination, touches no network.
    pub fn new(parts: ConnectorParts) -> Result<Self, ConfigError> {
        let ConnectorParts {
            object_store,
            warehouse,
            identity,
            ledger,
            mut settings,
        } = parts;
        if settings.bucket.trim().is_empty() {
            return Err(ConfigError::Empty { field: "bucket" });
        }
        if settings.directory.trim().is_empty() {
            return Err(ConfigError::Empty { field: "directory" });
        }
        settings.directory = normalize_prefix(&settings.directory);
        if warehouse.is_some() && !settings.transfer.repeat_header {
            return Err(ConfigError::Invalid {
                field: "transfer.repeat_header",
                reason: "must stay on when loading: COPY skips the first line of every part".to_string(),
            });
        }

        let mut the_refresher = IdentityRefresher::new(identity, CredentialStore::new(), settings.refresher.clone());
        if let Some(ledger) = ledger {
            the_refresher = the_refresher.with_ledger(ledger);
        }
        let the_refresher = Arc::new(the_refresher);
        let the_uploader = ResilientUploader::new(
            Arc::clone(&object_store),
            Arc::clone(&the_refresher),
            settings.uploader.clone(),
        );
        let the_loader = warehouse.map(|client| {
            let the_authorizer = match &settings.iam_role {
                Some(arn) => CopyAuthorizer::IamRole(arn.clone()),
                None => CopyAuthorizer::Session(Arc::clone(&the_refresher)),
            };
            WarehouseLoader::new(
                client,
                LoaderSettings {
                    copy: settings.copy.clone(),
                    authorizer: the_authorizer,
                    echo: settings.echo,
                },
            )
        });

        Ok(Self {
            settings,
            object_store,
            refresher: the_refresher,
            uploader: the_uploader,
            loader: the_loader,
            sequence: AtomicU64::new(0),
        })
    }

    /// 🚀 Production wiring: S3, Redshift (when configured) and SSO through the AWS CLI.
    pub async fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        config.validate().context("💀 configuration is invalid")?;
        let the_object_store = S3ObjectStore::new(
            config.storage.region.clone(),
            std::time::Duration::from_secs(config.storage.timeout_secs),
        )
        .await;
        let the_warehouse: Option<Arc<dyn WarehouseClient>> = match config.redshift_settings() {
            Some(settings) => Some(Arc::new(
                RedshiftWarehouse::connect(&settings)
                    .await
                    .context("💀 could not open the warehouse connection")?,
            )),
            None => None,
        };
        let the_settings = ConnectorSettings {
            bucket: config.storage.bucket.clone(),
            directory: config.storage.directory.clone(),
            transfer: config.transfer_options(),
            uploader: UploaderSettings {
                backoff: config.upload_backoff(),
                show_progress: config.transfer.show_progress,
            },
            refresher: config.refresher_settings(),
            copy: config.copy_options(),
            iam_role: config.storage.iam_role.clone(),
            echo: config.warehouse.as_ref().is_some_and(|w| w.echo),
        };
        let the_connector = Self::new(ConnectorParts {
            object_store: Arc::new(the_object_store),
            warehouse: the_warehouse,
            identity: Arc::new(AwsCliSso::new(config.sso_settings())),
            ledger: Some(RefreshLedger::new(config.sso.ledger_path.clone())),
            settings: the_settings,
        })
        .context("💀 could not assemble the connector")?;
        info!(bucket = %config.storage.bucket, "🎛️ connector ready");
        Ok(the_connector)
    }

    pub fn settings(&self) -> &ConnectorSettings {
        &self.settings
    }

    pub fn refresher(&self) -> &Arc<IdentityRefresher> {
        &self.refresher
    }

    /// 🔐 A valid session, refreshed or logged in as needed.
    pub async fn ensure_session(&self) -> Result<Arc<Session>, AuthError> {
        self.refresher.ensure_valid().await
    }

    /// 📋 A job with the configured defaults, under the configured directory.
    pub fn job(&self, payload: Payload, object_name: &str) -> Result<TransferJob, ConfigError> {
        TransferJob::new(
            payload,
            StorageDestination::new(&self.settings.bucket, &self.settings.directory, object_name),
            self.settings.transfer.clone(),
        )
    }

    /// 🚚 Uploads the job, then stages its manifest. A manifest that can't be written
    /// fails the result: without it nothing can load exactly these objects.
    pub async fn upload(&self, job: &TransferJob) -> TransferResult {
        self.upload_with_cancel(job, &CancellationToken::new()).await
    }

    pub async fn upload_with_cancel(&self, job: &TransferJob, cancel: &CancellationToken) -> TransferResult {
        let mut the_result = self.uploader.upload_with_cancel(job, cancel).await;
        if !the_result.success || the_result.location.is_none() {
            return the_result;
        }
        let the_keys: Vec<String> = the_result.stored_keys().into_iter().map(str::to_string).collect();
        match self.stage_manifest(job.destination(), &the_keys).await {
            Ok(manifest) => the_result.manifest = Some(manifest),
            Err(err) => {
                error!(object = %job.destination().object_key(), "💀 objects are up but the manifest is not: {err}");
                the_result.success = false;
                the_result.location = None;
                the_result.error = Some(ErrorDetail::from(&err));
            }
        }
        the_result
    }

    /// 📂 Uploads a file under its own name.
    pub async fn upload_file(&self, path: &Path) -> Result<TransferResult, ConnectorError> {
        let the_name = file_object_name(path)?;
        let the_job = self.job(Payload::File(path.to_path_buf()), &the_name)?;
        Ok(self.upload(&the_job).await)
    }

    /// 📊 Uploads a table as `<table_name>_<timestamp>.csv`.
    pub async fn upload_table(&self, table: &Table, table_name: &str) -> Result<TransferResult, ConnectorError> {
        if table.is_empty() {
            return Err(ConfigError::Empty { field: "table rows" }.into());
        }
        let the_job = self.job(Payload::Table(table.clone()), &self.generated_name(table_name))?;
        Ok(self.upload(&the_job).await)
    }

    pub async fn upload_bytes(&self, bytes: impl Into<Bytes>, object_name: &str) -> Result<TransferResult, ConnectorError> {
        let the_job = self.job(Payload::Bytes(bytes.into()), object_name)?;
        Ok(self.upload(&the_job).await)
    }

    /// 🐘 Loads an object that's already in the bucket. Checks it's there first.
    ///
    /// `object_name` is relative to the configured directory and names what was uploaded,
    /// without part or `.gz` suffixes. The objects are found in this order:
    /// 1. `<name>.manifest`, staged by the upload itself: exactly what that upload wrote.
    /// 2. the single object (`<name>`, or `<name>.gz` with gzip on).
    /// 3. `<name>.part00000`, `.part00001`, ... up to the first gap, for parts that
    ///    reached the bucket some other way.
    ///
    /// Cases 2 and 3 stage a fresh manifest before loading, so COPY still reads a list
    /// and not a prefix. The header is assumed to follow `transfer.header_row`.
    pub async fn load_from_storage(
        &self,
        object_name: &str,
        table: &TableRef,
        create_table_statement: Option<&str>,
        truncate_statement: Option<&str>,
    ) -> Result<LoadResult, ConnectorError> {
        let the_loader = self.loader()?;
        let the_destination = StorageDestination::new(&self.settings.bucket, &self.settings.directory, object_name);
        let the_manifest = self.find_or_stage_manifest(&the_destination).await?;

        let mut the_request = LoadRequest::from_manifest(table.clone(), the_manifest)
            .copy_with(self.copy_options(self.settings.transfer.header_row));
        the_request.create_table_statement = create_table_statement.map(str::to_string);
        the_request.truncate_statement = truncate_statement.map(str::to_string);
        Ok(the_loader.load_request(the_request).await?)
    }

    /// 🚚➡️🐘 Upload, then load. The load is skipped unless every chunk made it.
    pub async fn push(&self, item: WarehouseUpload) -> Result<PushOutcome, ConnectorError> {
        let the_loader = self.loader()?;
        let the_name = match (&item.object_name, &item.payload) {
            (Some(name), _) => name.clone(),
            (None, Payload::File(path)) => file_object_name(path)?,
            (None, Payload::Table(_)) => self.generated_name(&item.table.name),
            (None, Payload::Bytes(_)) => return Err(ConfigError::Empty { field: "object name" }.into()),
        };
        let the_has_header = matches!(item.payload, Payload::Table(_)) || self.settings.transfer.header_row;
        let the_job = self.job(item.payload, &the_name)?;
        let the_transfer = self.upload(&the_job).await;

        let the_manifest = match (the_transfer.success, &the_transfer.manifest) {
            (true, Some(manifest)) => manifest.clone(),
            (true, None) => {
                info!(table = %item.table, "🕳️ nothing was uploaded, so nothing gets loaded");
                return Ok(PushOutcome {
                    transfer: the_transfer,
                    load: None,
                });
            }
            (false, _) => {
                warn!(table = %item.table, "⏭️ upload incomplete, skipping the load: {}", the_transfer.message());
                return Ok(PushOutcome {
                    transfer: the_transfer,
                    load: None,
                });
            }
        };

        let mut the_request =
            LoadRequest::from_manifest(item.table, the_manifest).copy_with(self.copy_options(the_has_header));
        the_request.create_table_statement = item.create_table_statement;
        the_request.truncate_statement = item.truncate_statement;
        let the_load = the_loader.load_request(the_request).await?;
        Ok(PushOutcome {
            transfer: the_transfer,
            load: Some(the_load),
        })
    }

    /// 📦📦📦 Many pushes. One worker runs them in order; more run them concurrently.
    /// Results always line up with `items`.
    pub async fn push_many(
        &self,
        items: Vec<WarehouseUpload>,
        max_workers: usize,
    ) -> Vec<Result<PushOutcome, ConnectorError>> {
        let the_workers = max_workers.max(1);
        if the_workers == 1 {
            let mut the_results = Vec::with_capacity(items.len());
            for item in items {
                the_results.push(self.push(item).await);
            }
            return the_results;
        }
        stream::iter(items)
            .map(|item| self.push(item))
            .buffered(the_workers)
            .collect()
            .await
    }

    /// 📜 The configured COPY options, with IGNOREHEADER matching what the parts carry.
    fn copy_options(&self, has_header: bool) -> CopyOptions {
        CopyOptions {
            ignore_header: u32::from(has_header),
            ..self.settings.copy.clone()
        }
    }

    /// 📒 Writes a manifest naming `keys` to `destination.manifest_key()`.
    async fn stage_manifest(
        &self,
        destination: &StorageDestination,
        keys: &[String],
    ) -> Result<StorageLocation, ConnectorError> {
        let the_body = CopyManifest::new(&destination.bucket, keys.iter().map(String::as_str))
            .to_bytes()
            .map_err(|err| StorageError::permanent(format!("could not encode the COPY manifest: {err}")))?;
        let the_request = PutObject {
            bucket: destination.bucket.clone(),
            key: destination.manifest_key(),
            body: the_body,
            encryption: self.settings.transfer.encryption.clone(),
        };
        let the_session = self.ensure_session().await?;
        let the_policy = self
            .settings
            .uploader
            .backoff
            .clone()
            .with_max_retries(self.settings.transfer.max_retries);
        let the_outcome = retry_transient(&the_policy, "COPY manifest", |_| {
            let (the_session, the_request) = (&the_session, the_request.clone());
            async move { self.object_store.put_object(the_session, the_request).await }
        })
        .await;
        the_outcome.result?;
        debug!(key = %the_request.key, objects = keys.len(), "📒 manifest staged");
        Ok(StorageLocation::new(&destination.bucket, the_request.key))
    }

    /// 🔍 The manifest an earlier upload left behind, or a fresh one for what's there.
    async fn find_or_stage_manifest(&self, destination: &StorageDestination) -> Result<StorageLocation, ConnectorError> {
        let the_session = self.ensure_session().await?;
        let the_bucket = &destination.bucket;
        let the_compression = self.settings.transfer.compression;
        let the_exists = |key: String| {
            let the_session = &the_session;
            async move {
                let the_found = self.object_store.object_exists(the_session, the_bucket, &key).await?;
                Ok::<_, StorageError>(the_found.then_some(key))
            }
        };

        if let Some(manifest) = the_exists(destination.manifest_key()).await? {
            debug!(key = %manifest, "📒 using the manifest staged at upload time");
            return Ok(StorageLocation::new(the_bucket, manifest));
        }
        let the_keys = match the_exists(destination.chunk_key(0, 1, the_compression)).await? {
            Some(single) => vec![single],
            None => {
                let mut the_parts = Vec::new();
                while let Some(part) = the_exists(destination.chunk_key(the_parts.len(), 2, the_compression)).await? {
                    the_parts.push(part);
                }
                the_parts
            }
        };
        if the_keys.is_empty() {
            return Err(StorageError::permanent(format!(
                "object not found: {}",
                StorageLocation::new(the_bucket, destination.object_key())
            ))
            .into());
        }
        info!(objects = the_keys.len(), "📒 no manifest from the upload, staging one for what's there");
        self.stage_manifest(destination, &the_keys).await
    }

    fn loader(&self) -> Result<&WarehouseLoader, ConfigError> {
        self.loader.as_ref().ok_or(ConfigError::Empty { field: "warehouse" })
    }

    fn generated_name(&self, table_name: &str) -> String {
        let the_sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!(
            "{table_name}_{}_{the_sequence}.csv",
            Utc::now().format("%Y%m%dT%H%M%S%3f")
        )
    }
}

fn file_object_name(path: &Path) -> Result<String, ConfigError> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| ConfigError::Invalid {
            field: "file path",
            reason: format!("'{}' has no usable file name", path.display()),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::in_mem::{InMemoryObjectStore, InMemoryWarehouse, ScriptedIdentity};
    use crate::error::{ErrorKind, LoadStep};
    use crate::retry::BackoffPolicy;
    use crate::transfer::{Cell, Compression};
    use std::io::Write;

    struct Rig {
        store: InMemoryObjectStore,
        warehouse: InMemoryWarehouse,
        connector: Connector,
    }

    fn the_settings() -> ConnectorSettings {
        ConnectorSettings {
            bucket: "lake".into(),
            directory: "stage".into(),
            transfer: TransferOptions {
                header_row: true,
                ..TransferOptions::default()
            },
            uploader: UploaderSettings {
                backoff: BackoffPolicy::immediate(3),
                show_progress: false,
            },
            refresher: RefresherSettings {
                backoff: BackoffPolicy::immediate(1),
                ..RefresherSettings::default()
            },
            copy: CopyOptions::default(),
            iam_role: Some("arn:aws:iam::123:role/loader".into()),
            echo: false,
        }
    }

    fn the_connector(store: &InMemoryObjectStore, warehouse: &InMemoryWarehouse, settings: ConnectorSettings) -> Connector {
        Connector::new(ConnectorParts {
            object_store: Arc::new(store.clone()),
            warehouse: Some(Arc::new(warehouse.clone())),
            identity: Arc::new(ScriptedIdentity::new()),
            ledger: None,
            settings,
        })
        .expect("💀 connector")
    }

    /// 🔗 The warehouse reads from the same fake bucket the connector writes to.
    fn the_rig_with(store: InMemoryObjectStore, warehouse: InMemoryWarehouse, settings: ConnectorSettings) -> Rig {
        let the_warehouse = warehouse.with_store(store.clone());
        let the_connector = the_connector(&store, &the_warehouse, settings);
        Rig {
            store,
            warehouse: the_warehouse,
            connector: the_connector,
        }
    }

    fn the_rig(store: InMemoryObjectStore, warehouse: InMemoryWarehouse) -> Rig {
        the_rig_with(store, warehouse, the_settings())
    }

    fn the_copy_statement(warehouse: &InMemoryWarehouse) -> String {
        warehouse
            .statements()
            .into_iter()
            .rfind(|statement| statement.starts_with("COPY"))
            .expect("💀 a COPY ran")
    }

    fn the_table(rows: i64) -> Table {
        let mut the_table = Table::new(["id", "name"]).expect("💀 columns");
        for id in 0..rows {
            the_table
                .push_row(vec![Cell::Int(id), Cell::from(format!("row-{id}"))])
                .expect("💀 row");
        }
        the_table
    }

    fn the_events() -> TableRef {
        TableRef::new(None, Some("public".into()), "events")
    }

    #[tokio::test]
    async fn the_one_where_an_empty_table_is_turned_away() {
        let the_rig = the_rig(InMemoryObjectStore::new(), InMemoryWarehouse::new());
        let the_err = the_rig
            .connector
            .upload_table(&the_table(0), "events")
            .await
            .expect_err("💀 empty table should be rejected");
        assert!(matches!(the_err, ConnectorError::Config(ConfigError::Empty { .. })));
        assert!(the_rig.store.put_calls().is_empty());
    }

    #[tokio::test]
    async fn the_one_where_bytes_land_under_the_directory() {
        let the_rig = the_rig(InMemoryObjectStore::new(), InMemoryWarehouse::new());
        let the_result = the_rig
            .connector
            .upload_bytes(&b"a,b\n1,2\n"[..], "tiny.csv")
            .await
            .expect("💀 valid job");
        assert!(the_result.success);
        assert_eq!(
            the_rig.store.keys("lake"),
            vec!["stage/tiny.csv".to_string(), "stage/tiny.csv.manifest".to_string()]
        );
        assert_eq!(
            the_result.location,
            Some(StorageLocation::new("lake", "stage/tiny.csv"))
        );
        assert_eq!(
            the_result.manifest,
            Some(StorageLocation::new("lake", "stage/tiny.csv.manifest"))
        );
    }

    #[tokio::test]
    async fn the_one_where_a_file_keeps_its_name() {
        let the_rig = the_rig(InMemoryObjectStore::new(), InMemoryWarehouse::new());
        let the_dir = tempfile::tempdir().expect("💀 tempdir");
        let the_path = the_dir.path().join("orders.csv");
        let mut the_file = std::fs::File::create(&the_path).expect("💀 create");
        the_file.write_all(b"id\n1\n2\n").expect("💀 write");
        let the_result = the_rig.connector.upload_file(&the_path).await.expect("💀 valid job");
        assert!(the_result.success);
        assert!(the_rig.store.object("lake", "stage/orders.csv").is_some());
    }

    #[tokio::test]
    async fn the_one_where_push_goes_all_the_way_to_the_table() {
        let the_rig = the_rig(InMemoryObjectStore::new(), InMemoryWarehouse::new());
        let the_outcome = the_rig
            .connector
            .push(
                WarehouseUpload::new(Payload::Table(the_table(3)), the_events())
                    .named("events.csv")
                    .create_with("CREATE TABLE IF NOT EXISTS public.events (id INT, name VARCHAR(32))"),
            )
            .await
            .expect("💀 push");
        assert!(the_outcome.success());
        let the_load = the_outcome.load.as_ref().expect("💀 load ran");
        assert_eq!(the_load.steps.last(), Some(&LoadStep::Commit));
        assert_eq!(
            the_rig.warehouse.loaded_sources("public.events"),
            vec!["s3://lake/stage/events.csv".to_string()]
        );
        let the_report = OperationReport::from(&the_outcome);
        assert!(the_report.success);
        assert!(the_report.message.contains("public.events"));
    }

    #[tokio::test]
    async fn the_one_where_a_failed_upload_never_reaches_the_warehouse() {
        let the_store = InMemoryObjectStore::new().with_failure("events", StorageError::permanent("AccessDenied"), None);
        let the_rig = the_rig(the_store, InMemoryWarehouse::new().with_table("public.events"));
        let the_outcome = the_rig
            .connector
            .push(WarehouseUpload::new(Payload::Table(the_table(2)), the_events()).named("events.csv"))
            .await
            .expect("💀 push returns the transfer result");
        assert!(!the_outcome.success());
        assert!(the_outcome.load.is_none());
        assert!(the_rig.warehouse.statements().is_empty());
        let the_report = OperationReport::from(&the_outcome);
        assert_eq!(the_report.error.map(|e| e.kind), Some(ErrorKind::Storage));
    }

    #[tokio::test]
    async fn the_one_where_loading_a_ghost_object_fails_fast() {
        let the_rig = the_rig(InMemoryObjectStore::new(), InMemoryWarehouse::new().with_table("public.events"));
        let the_err = the_rig
            .connector
            .load_from_storage("missing.csv", &the_events(), None, None)
            .await
            .expect_err("💀 nothing there to load");
        assert!(matches!(the_err, ConnectorError::Storage(StorageError::Permanent { .. })));
        assert!(the_rig.warehouse.statements().is_empty());

        the_rig.store.insert("lake", "stage/present.csv", &b"id\n1\n"[..]);
        let the_load = the_rig
            .connector
            .load_from_storage("present.csv", &the_events(), None, Some("TRUNCATE public.events"))
            .await
            .expect("💀 seeded object loads");
        assert_eq!(
            the_load.steps,
            vec![LoadStep::Begin, LoadStep::Truncate, LoadStep::Copy, LoadStep::Commit]
        );
    }

    #[tokio::test]
    async fn the_one_where_multi_part_uploads_are_found_by_their_first_part() {
        let the_rig = the_rig(InMemoryObjectStore::new(), InMemoryWarehouse::new().with_table("public.events"));
        the_rig.store.insert("lake", "stage/big.csv.part00000", &b"id\n1\n"[..]);
        the_rig.store.insert("lake", "stage/big.csv.part00001", &b"id\n2\n"[..]);
        the_rig.store.insert("lake", "stage/big.csv.part00003", &b"id\n4\n"[..]);
        let the_load = the_rig
            .connector
            .load_from_storage("big.csv", &the_events(), None, None)
            .await
            .expect("💀 parts load");
        assert_eq!(the_load.source, StorageLocation::new("lake", "stage/big.csv.manifest"));
        // 🕳️ part00002 is missing, so part00003 is not part of this upload
        assert_eq!(
            the_rig.warehouse.loaded_sources("public.events"),
            vec![
                "s3://lake/stage/big.csv.part00000".to_string(),
                "s3://lake/stage/big.csv.part00001".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn the_one_where_a_re_push_leaves_yesterdays_parts_behind() {
        let the_store = InMemoryObjectStore::new();
        let the_warehouse = InMemoryWarehouse::new().with_store(the_store.clone());
        let the_yesterday = the_connector(
            &the_store,
            &the_warehouse,
            ConnectorSettings {
                transfer: TransferOptions {
                    chunk_size: 6,
                    header_row: true,
                    ..TransferOptions::default()
                },
                ..the_settings()
            },
        );
        let the_outcome = the_yesterday
            .push(
                WarehouseUpload::new(Payload::Bytes(Bytes::from_static(b"id\n10\n20\n30\n40\n")), the_events())
                    .named("events.csv")
                    .create_with("CREATE TABLE IF NOT EXISTS public.events (id INT)"),
            )
            .await
            .expect("💀 day one push");
        assert!(the_outcome.success());
        assert_eq!(the_warehouse.loaded_sources("public.events").len(), 3);

        let the_today = the_connector(&the_store, &the_warehouse, the_settings());
        let the_outcome = the_today
            .push(
                WarehouseUpload::new(Payload::Bytes(Bytes::from_static(b"id\n50\n")), the_events())
                    .named("events.csv")
                    .truncate_with("TRUNCATE public.events"),
            )
            .await
            .expect("💀 day two push");
        assert!(the_outcome.success());
        assert!(the_store.object("lake", "stage/events.csv.part00002").is_some(), "yesterday's parts are still there");
        assert_eq!(
            the_warehouse.loaded_sources("public.events"),
            vec!["s3://lake/stage/events.csv".to_string()]
        );
        let the_copy = the_copy_statement(&the_warehouse);
        assert!(the_copy.starts_with("COPY public.events FROM 's3://lake/stage/events.csv.manifest'"));
        assert!(the_copy.contains("\nMANIFEST\n"));

        // 📒 loading by name later picks up today's manifest, not the parts
        let the_load = the_today
            .load_from_storage("events.csv", &the_events(), None, Some("TRUNCATE public.events"))
            .await
            .expect("💀 reload");
        assert!(the_load.success);
        assert_eq!(
            the_warehouse.loaded_sources("public.events"),
            vec!["s3://lake/stage/events.csv".to_string()]
        );
    }

    #[tokio::test]
    async fn the_one_where_a_multi_part_upload_loads_by_name() {
        let the_rig = the_rig_with(
            InMemoryObjectStore::new(),
            InMemoryWarehouse::new().with_table("public.events"),
            ConnectorSettings {
                transfer: TransferOptions {
                    chunk_size: 6,
                    header_row: true,
                    ..TransferOptions::default()
                },
                ..the_settings()
            },
        );
        let the_upload = the_rig
            .connector
            .upload_bytes(&b"id\n10\n20\n30\n40\n"[..], "big.csv")
            .await
            .expect("💀 valid job");
        assert!(the_upload.success);
        assert_eq!(the_upload.outcomes.len(), 3);

        the_rig.connector
            .load_from_storage("big.csv", &the_events(), None, None)
            .await
            .expect("💀 load by name");
        assert_eq!(
            the_rig.warehouse.loaded_sources("public.events"),
            vec![
                "s3://lake/stage/big.csv.part00000".to_string(),
                "s3://lake/stage/big.csv.part00001".to_string(),
                "s3://lake/stage/big.csv.part00002".to_string(),
            ]
        );
        assert!(the_copy_statement(&the_rig.warehouse).contains("IGNOREHEADER 1"));
    }

    #[tokio::test]
    async fn the_one_where_gzip_objects_are_found_and_loaded() {
        let the_rig = the_rig_with(
            InMemoryObjectStore::new(),
            InMemoryWarehouse::new().with_table("public.events"),
            ConnectorSettings {
                transfer: TransferOptions {
                    header_row: true,
                    compression: Compression::Gzip,
                    ..TransferOptions::default()
                },
                copy: CopyOptions {
                    gzip: true,
                    ..CopyOptions::default()
                },
                ..the_settings()
            },
        );
        let the_upload = the_rig
            .connector
            .upload_bytes(&b"id\n1\n"[..], "zipped.csv")
            .await
            .expect("💀 valid job");
        assert_eq!(the_upload.stored_keys(), vec!["stage/zipped.csv.gz"]);
        the_rig
            .connector
            .load_from_storage("zipped.csv", &the_events(), None, None)
            .await
            .expect("💀 gzip load through the upload's manifest");

        // 🗜️ no manifest around: the single .gz object is found on its own
        the_rig.store.insert("lake", "stage/legacy.csv.gz", &b"not really gzip"[..]);
        the_rig
            .connector
            .load_from_storage("legacy.csv", &the_events(), None, None)
            .await
            .expect("💀 gzip load of a lone object");

        assert_eq!(
            the_rig.warehouse.loaded_sources("public.events"),
            vec![
                "s3://lake/stage/zipped.csv.gz".to_string(),
                "s3://lake/stage/legacy.csv.gz".to_string(),
            ]
        );
        let the_copy = the_copy_statement(&the_rig.warehouse);
        assert!(the_copy.contains("'s3://lake/stage/legacy.csv.manifest'"));
        assert!(the_copy.ends_with("\nGZIP"));
    }

    #[tokio::test]
    async fn the_one_where_ignoreheader_follows_the_payload() {
        let the_rig = the_rig_with(
            InMemoryObjectStore::new(),
            InMemoryWarehouse::new().with_table("public.events"),
            ConnectorSettings {
                transfer: TransferOptions {
                    header_row: false,
                    ..TransferOptions::default()
                },
                ..the_settings()
            },
        );
        the_rig
            .connector
            .push(WarehouseUpload::new(Payload::Bytes(Bytes::from_static(b"1\n2\n")), the_events()).named("raw.csv"))
            .await
            .expect("💀 headerless push");
        assert!(!the_copy_statement(&the_rig.warehouse).contains("IGNOREHEADER"));

        the_rig
            .connector
            .push(WarehouseUpload::new(Payload::Table(the_table(2)), the_events()).named("table.csv"))
            .await
            .expect("💀 table push");
        assert!(the_copy_statement(&the_rig.warehouse).contains("IGNOREHEADER 1"));
    }

    #[test]
    fn the_one_where_loads_refuse_headerless_parts() {
        let the_settings = || ConnectorSettings {
            transfer: TransferOptions {
                header_row: true,
                repeat_header: false,
                ..TransferOptions::default()
            },
            ..the_settings()
        };
        let the_result = Connector::new(ConnectorParts {
            object_store: Arc::new(InMemoryObjectStore::new()),
            warehouse: Some(Arc::new(InMemoryWarehouse::new())),
            identity: Arc::new(ScriptedIdentity::new()),
            ledger: None,
            settings: the_settings(),
        });
        assert!(matches!(
            the_result,
            Err(ConfigError::Invalid {
                field: "transfer.repeat_header",
                ..
            })
        ));

        let the_upload_only = Connector::new(ConnectorParts {
            object_store: Arc::new(InMemoryObjectStore::new()),
            warehouse: None,
            identity: Arc::new(ScriptedIdentity::new()),
            ledger: None,
            settings: the_settings(),
        });
        assert!(the_upload_only.is_ok());
    }

    #[tokio::test]
    async fn the_one_where_a_lost_manifest_fails_the_upload() {
        let the_store =
            InMemoryObjectStore::new().with_failure(".manifest", StorageError::permanent("AccessDenied"), None);
        let the_rig = the_rig(the_store, InMemoryWarehouse::new().with_table("public.events"));
        let the_outcome = the_rig
            .connector
            .push(WarehouseUpload::new(Payload::Bytes(Bytes::from_static(b"id\n1\n")), the_events()).named("e.csv"))
            .await
            .expect("💀 push returns the transfer result");
        assert!(!the_outcome.transfer.success);
        assert!(the_outcome.transfer.manifest.is_none());
        assert_eq!(the_outcome.transfer.error.as_ref().map(|e| e.kind), Some(ErrorKind::Storage));
        assert!(the_outcome.load.is_none());
        assert!(the_rig.warehouse.statements().is_empty());
    }

    #[tokio::test]
    async fn the_one_where_push_many_keeps_the_line_in_order() {
        let the_store = InMemoryObjectStore::new().with_failure("second", StorageError::permanent("AccessDenied"), None);
        let the_rig = the_rig(the_store, InMemoryWarehouse::new().with_table("public.events"));
        let the_items = ["first", "second", "third", "fourth"]
            .into_iter()
            .map(|name| {
                WarehouseUpload::new(Payload::Bytes(Bytes::from_static(b"id\n1\n")), the_events())
                    .named(format!("{name}.csv"))
            })
            .collect::<Vec<_>>();

        let the_results = the_rig.connector.push_many(the_items, 3).await;
        assert_eq!(the_results.len(), 4);
        let the_keys: Vec<Option<String>> = the_results
            .iter()
            .map(|result| {
                result
                    .as_ref()
                    .ok()
                    .and_then(|outcome| outcome.transfer.outcomes.get(&0).map(|o| o.key.clone()))
            })
            .collect();
        assert_eq!(
            the_keys,
            vec![
                Some("stage/first.csv".to_string()),
                Some("stage/second.csv".to_string()),
                Some("stage/third.csv".to_string()),
                Some("stage/fourth.csv".to_string()),
            ]
        );
        let the_successes: Vec<bool> = the_results
            .iter()
            .map(|result| result.as_ref().is_ok_and(PushOutcome::success))
            .collect();
        assert_eq!(the_successes, vec![true, false, true, true]);
        assert_eq!(the_rig.warehouse.loaded_sources("public.events").len(), 3);
    }

    #[tokio::test]
    async fn the_one_where_bytes_without_a_name_are_a_config_problem() {
        let the_rig = the_rig(InMemoryObjectStore::new(), InMemoryWarehouse::new());
        let the_result = the_rig
            .connector
            .push(WarehouseUpload::new(Payload::Bytes(Bytes::from_static(b"x\n")), the_events()))
            .await;
        let the_report = OperationReport::from(&the_result);
        assert!(!the_report.success);
        assert_eq!(the_report.error.map(|e| e.kind), Some(ErrorKind::Config));
    }

    #[tokio::test]
    async fn the_one_where_an_upload_only_connector_refuses_to_load() {
        let the_connector = Connector::new(ConnectorParts {
            object_store: Arc::new(InMemoryObjectStore::new()),
            warehouse: None,
            identity: Arc::new(ScriptedIdentity::new()),
            ledger: None,
            settings: the_settings(),
        })
        .expect("💀 connector");
        let the_err = the_connector
            .load_from_storage("x.csv", &the_events(), None, None)
            .await
            .expect_err("💀 no warehouse configured");
        assert!(matches!(
            the_err,
            ConnectorError::Config(ConfigError::Empty { field: "warehouse" })
        ));
    }

    #[test]
    fn the_one_where_a_blank_bucket_is_a_non_starter() {
        let the_result = Connector::new(ConnectorParts {
            object_store: Arc::new(InMemoryObjectStore::new()),
            warehouse: None,
            identity: Arc::new(ScriptedIdentity::new()),
            ledger: None,
            settings: ConnectorSettings {
                bucket: "  ".into(),
                ..the_settings()
            },
        });
        assert!(matches!(the_result, Err(ConfigError::Empty { field: "bucket" })));
    }
}

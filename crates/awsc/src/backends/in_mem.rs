// ai
//! # Previously, on awsc...
//!
//! 🎬 The cloud was expensive. The cloud was slow. The cloud, frankly, did not
//! want to be in our unit tests. So we built three understudies who live
//! entirely in RAM, know all the lines, and never send an invoice.
//!
//! - [`InMemoryObjectStore`]: a bucket-shaped `BTreeMap` with programmable tantrums.
//! - [`InMemoryWarehouse`]: tables, a transaction overlay, a statement log, and failure injection.
//!   Hand it the fake bucket and COPY reads from it the way Redshift reads S3: a bare
//!   path is a key prefix, a manifest is an exact list.
//! - [`ScriptedIdentity`]: an SSO provider that says exactly what you told it to say.
//!
//! All three are `Clone` and share their state between clones, so a test can hand
//! one copy to the code under test and keep another to poke at afterwards.
//!
//! ⚠️ This is NOT for production. If you're deploying this to prod, your data
//! will be very safe and also gone the moment the process exits. 🦆

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration, Utc};
use parking_lot::Mutex;

use crate::backends::{IdentityClient, IdentityFailure, ObjectStoreClient, PutObject, WarehouseClient};
use crate::error::{AuthError, DriverError, StorageError};
use crate::identity::{Credentials, RefreshHandle, Session};
use crate::transfer::{EncryptionMode, StorageLocation};
use crate::warehouse::{BulkLoad, CopyManifest};

// ============================================================
//  🪣 InMemoryObjectStore
// ============================================================

/// 📦 What landed in the fake bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub body: Bytes,
    pub encryption: EncryptionMode,
    pub principal: String,
}

/// 📞 One `put_object` call, as the store saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutCall {
    pub bucket: String,
    pub key: String,
    pub encryption: EncryptionMode,
    pub succeeded: bool,
}

#[derive(Debug)]
struct FailureRule {
    key_contains: String,
    error: StorageError,
    /// `None` ⇒ fail forever.
    remaining: Option<u32>,
}

#[derive(Debug, Default)]
struct ObjectStoreState {
    objects: BTreeMap<(String, String), StoredObject>,
    rules: Vec<FailureRule>,
    calls: Vec<PutCall>,
}

/// 🪣 A bucket that lives and dies with the test.
#[derive(Debug, Clone, Default)]
pub struct InMemoryObjectStore {
    state: Arc<Mutex<ObjectStoreState>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 💣 Puts whose key contains `key_contains` fail with `error`, `times` times (or forever).
    pub fn with_failure(self, key_contains: impl Into<String>, error: StorageError, times: Option<u32>) -> Self {
        self.state.lock().rules.push(FailureRule {
            key_contains: key_contains.into(),
            error,
            remaining: times,
        });
        self
    }

    /// 🌱 Seeds an object, as if someone uploaded it earlier.
    pub fn insert(&self, bucket: &str, key: &str, body: impl Into<Bytes>) {
        self.state.lock().objects.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                body: body.into(),
                encryption: EncryptionMode::None,
                principal: "seeded".to_string(),
            },
        );
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.state
            .lock()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// Keys stored in `bucket`, sorted.
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.state
            .lock()
            .objects
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }

    pub fn put_calls(&self) -> Vec<PutCall> {
        self.state.lock().calls.clone()
    }

    /// How many times a key containing `key_contains` was attempted.
    pub fn attempts_for(&self, key_contains: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| call.key.contains(key_contains))
            .count()
    }
}

#[async_trait]
impl ObjectStoreClient for InMemoryObjectStore {
    async fn put_object(&self, session: &Session, request: PutObject) -> Result<(), StorageError> {
        let mut the_state = self.state.lock();
        let the_failure = the_state
            .rules
            .iter_mut()
            .find(|rule| request.key.contains(&rule.key_contains) && rule.remaining != Some(0))
            .map(|rule| {
                if let Some(left) = rule.remaining.as_mut() {
                    *left -= 1;
                }
                rule.error.clone()
            });
        the_state.calls.push(PutCall {
            bucket: request.bucket.clone(),
            key: request.key.clone(),
            encryption: request.encryption.clone(),
            succeeded: the_failure.is_none(),
        });
        if let Some(err) = the_failure {
            return Err(err);
        }
        the_state.objects.insert(
            (request.bucket, request.key),
            StoredObject {
                body: request.body,
                encryption: request.encryption,
                principal: session.principal().to_string(),
            },
        );
        Ok(())
    }

    async fn object_exists(&self, _session: &Session, bucket: &str, key: &str) -> Result<bool, StorageError> {
        Ok(self
            .state
            .lock()
            .objects
            .contains_key(&(bucket.to_string(), key.to_string())))
    }
}

// ============================================================
//  🐘 InMemoryWarehouse
// ============================================================

/// table name → objects loaded into it (in COPY order)
type Tables = BTreeMap<String, Vec<String>>;

#[derive(Debug)]
struct StatementFailure {
    contains: String,
    error: DriverError,
    remaining: Option<u32>,
}

#[derive(Debug, Default)]
struct WarehouseState {
    committed: Tables,
    /// `Some` while a transaction is open: a private copy that COMMIT publishes.
    pending: Option<Tables>,
    statements: Vec<String>,
    failures: Vec<StatementFailure>,
    /// The bucket COPY reads from. Without one, COPY records its source URI as-is.
    storage: Option<InMemoryObjectStore>,
}

impl WarehouseState {
    fn record_and_check(&mut self, statement: &str) -> Result<(), DriverError> {
        self.statements.push(statement.trim().to_string());
        let the_failure = self
            .failures
            .iter_mut()
            .find(|rule| statement.contains(&rule.contains) && rule.remaining != Some(0));
        match the_failure {
            Some(rule) => {
                if let Some(left) = rule.remaining.as_mut() {
                    *left -= 1;
                }
                Err(rule.error.clone())
            }
            None => Ok(()),
        }
    }

    /// The table set statements currently act on: the overlay inside a transaction, else committed.
    fn working_tables(&mut self) -> &mut Tables {
        match self.pending.as_mut() {
            Some(tables) => tables,
            None => &mut self.committed,
        }
    }
}

/// 🐘 A warehouse with real transaction semantics and no actual data.
///
/// Understands just enough SQL to be useful: `CREATE TABLE [IF NOT EXISTS] name`,
/// `TRUNCATE [TABLE] name`, and COPY via `bulk_load`. Everything else is logged and nodded at.
#[derive(Debug, Clone, Default)]
pub struct InMemoryWarehouse {
    state: Arc<Mutex<WarehouseState>>,
}

impl InMemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// 🌱 A table that already exists before the test starts.
    pub fn with_table(self, name: &str) -> Self {
        self.state.lock().committed.insert(normalize_table_name(name), Vec::new());
        self
    }

    /// 🔗 COPY resolves its source against `store`, so tests see exactly which objects a load picked up.
    pub fn with_store(self, store: InMemoryObjectStore) -> Self {
        self.state.lock().storage = Some(store);
        self
    }

    /// 💣 Any statement containing `contains` fails with `message`, `times` times (or forever).
    /// `BEGIN`, `COMMIT`, `ROLLBACK` and the redacted COPY text are all matched too.
    pub fn with_failure(self, contains: impl Into<String>, message: impl Into<String>, times: Option<u32>) -> Self {
        self.state.lock().failures.push(StatementFailure {
            contains: contains.into(),
            error: DriverError::new(message),
            remaining: times,
        });
        self
    }

    pub fn table_exists(&self, name: &str) -> bool {
        self.state.lock().committed.contains_key(&normalize_table_name(name))
    }

    /// Objects (or source URIs, without a store) committed into `name`, in load order.
    pub fn loaded_sources(&self, name: &str) -> Vec<String> {
        self.state
            .lock()
            .committed
            .get(&normalize_table_name(name))
            .cloned()
            .unwrap_or_default()
    }

    /// Every statement seen, trimmed, COPY redacted.
    pub fn statements(&self) -> Vec<String> {
        self.state.lock().statements.clone()
    }

    pub fn in_transaction(&self) -> bool {
        self.state.lock().pending.is_some()
    }
}

/// 🔍 What a COPY would actually read from the fake bucket.
fn staged_objects(store: &InMemoryObjectStore, load: &BulkLoad) -> Result<Vec<String>, DriverError> {
    let the_source = &load.source;
    if !load.manifest {
        let the_matches: Vec<String> = store
            .keys(&the_source.bucket)
            .into_iter()
            .filter(|key| key.starts_with(&the_source.key))
            .map(|key| StorageLocation::new(&the_source.bucket, key).uri())
            .collect();
        if the_matches.is_empty() {
            return Err(DriverError::new(format!("The specified S3 prefix '{the_source}' does not exist")));
        }
        return Ok(the_matches);
    }

    let the_object = store
        .object(&the_source.bucket, &the_source.key)
        .ok_or_else(|| DriverError::new(format!("manifest file '{the_source}' does not exist")))?;
    let the_manifest = CopyManifest::from_slice(&the_object.body)
        .map_err(|err| DriverError::new(format!("manifest file '{the_source}' is not valid JSON: {err}")))?;
    let mut the_urls = Vec::with_capacity(the_manifest.entries.len());
    for entry in the_manifest.entries {
        let the_present = entry
            .url
            .strip_prefix("s3://")
            .and_then(|rest| rest.split_once('/'))
            .is_some_and(|(bucket, key)| store.object(bucket, key).is_some());
        match (the_present, entry.mandatory) {
            (true, _) => the_urls.push(entry.url),
            (false, true) => {
                return Err(DriverError::new(format!("manifest entry '{}' is mandatory but missing", entry.url)));
            }
            (false, false) => {}
        }
    }
    Ok(the_urls)
}

fn normalize_table_name(name: &str) -> String {
    name.trim().trim_matches('"').replace('"', "").to_lowercase()
}

/// Pulls the table name out of `CREATE TABLE [IF NOT EXISTS] name (...)` / `TRUNCATE [TABLE] name`.
fn table_after<'a>(statement: &'a str, words: &[&str]) -> Option<(&'a str, bool)> {
    let mut the_tokens = statement.split_whitespace().peekable();
    for word in words {
        let the_token = the_tokens.next()?;
        if !the_token.eq_ignore_ascii_case(word) {
            return None;
        }
    }
    let mut the_if_not_exists = false;
    // TRUNCATE allows an optional TABLE keyword
    if the_tokens.peek().is_some_and(|t| t.eq_ignore_ascii_case("table")) {
        the_tokens.next();
    }
    if the_tokens.peek().is_some_and(|t| t.eq_ignore_ascii_case("if")) {
        the_tokens.next();
        the_tokens.next();
        the_tokens.next();
        the_if_not_exists = true;
    }
    let the_name = the_tokens.next()?;
    let the_name = the_name.split('(').next().unwrap_or(the_name).trim_end_matches(';');
    Some((the_name, the_if_not_exists))
}

#[async_trait]
impl WarehouseClient for InMemoryWarehouse {
    async fn begin(&self) -> Result<(), DriverError> {
        let mut the_state = self.state.lock();
        the_state.record_and_check("BEGIN")?;
        if the_state.pending.is_some() {
            return Err(DriverError::new("there is already a transaction in progress"));
        }
        the_state.pending = Some(the_state.committed.clone());
        Ok(())
    }

    async fn execute(&self, statement: &str) -> Result<(), DriverError> {
        let mut the_state = self.state.lock();
        the_state.record_and_check(statement)?;
        if let Some((name, if_not_exists)) = table_after(statement, &["create", "table"]) {
            let the_name = normalize_table_name(name);
            let the_tables = the_state.working_tables();
            if the_tables.contains_key(&the_name) {
                if !if_not_exists {
                    return Err(DriverError::new(format!("relation \"{the_name}\" already exists")));
                }
            } else {
                the_tables.insert(the_name, Vec::new());
            }
        } else if let Some((name, _)) = table_after(statement, &["truncate"]) {
            let the_name = normalize_table_name(name);
            match the_state.working_tables().get_mut(&the_name) {
                Some(rows) => rows.clear(),
                None => return Err(DriverError::new(format!("relation \"{the_name}\" does not exist"))),
            }
        }
        Ok(())
    }

    async fn bulk_load(&self, load: &BulkLoad) -> Result<(), DriverError> {
        let mut the_state = self.state.lock();
        the_state.record_and_check(&load.redacted_statement())?;
        let the_objects = match &the_state.storage {
            Some(store) => staged_objects(store, load)?,
            None => vec![load.source.uri()],
        };
        let the_name = normalize_table_name(&load.table.qualified());
        match the_state.working_tables().get_mut(&the_name) {
            Some(rows) => {
                rows.extend(the_objects);
                Ok(())
            }
            None => Err(DriverError::new(format!("relation \"{the_name}\" does not exist"))),
        }
    }

    async fn commit(&self) -> Result<(), DriverError> {
        let mut the_state = self.state.lock();
        the_state.record_and_check("COMMIT")?;
        match the_state.pending.take() {
            Some(tables) => {
                the_state.committed = tables;
                Ok(())
            }
            None => Err(DriverError::new("there is no transaction in progress")),
        }
    }

    async fn rollback(&self) -> Result<(), DriverError> {
        let mut the_state = self.state.lock();
        // 🧹 the overlay goes away even if the injected failure fires, same as a dropped connection
        the_state.pending = None;
        the_state.record_and_check("ROLLBACK")
    }
}

// ============================================================
//  🔐 ScriptedIdentity
// ============================================================

/// 🎫 A session issued just now, living for `lifetime` (at least a second).
pub fn fresh_session(principal: &str, lifetime: Duration, handle: Option<&str>) -> Result<Session, AuthError> {
    let the_now = Utc::now();
    Session::new(
        principal,
        the_now - Duration::seconds(1),
        the_now + lifetime.max(Duration::seconds(1)),
        Credentials::new("AKIASCRIPTED", "scripted-secret", Some("scripted-token".to_string())),
        handle.map(RefreshHandle::new),
    )
}

#[derive(Debug, Default)]
struct ScriptState {
    logins: VecDeque<Result<Session, IdentityFailure>>,
    refreshes: VecDeque<Result<Session, IdentityFailure>>,
    login_calls: u32,
    refresh_calls: u32,
    handles_seen: Vec<RefreshHandle>,
}

/// 🎭 An identity provider reading from a script.
///
/// Each call pops the next queued response. An empty queue answers with a fresh
/// one-hour session (handle `scripted-handle`), so tests only script the interesting bits.
#[derive(Debug, Clone, Default)]
pub struct ScriptedIdentity {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_login(&self, response: Result<Session, IdentityFailure>) -> &Self {
        self.state.lock().logins.push_back(response);
        self
    }

    pub fn push_refresh(&self, response: Result<Session, IdentityFailure>) -> &Self {
        self.state.lock().refreshes.push_back(response);
        self
    }

    pub fn login_calls(&self) -> u32 {
        self.state.lock().login_calls
    }

    pub fn refresh_calls(&self) -> u32 {
        self.state.lock().refresh_calls
    }

    pub fn handles_seen(&self) -> Vec<RefreshHandle> {
        self.state.lock().handles_seen.clone()
    }

    fn unscripted(principal: &str) -> Result<Session, IdentityFailure> {
        fresh_session(principal, Duration::hours(1), Some("scripted-handle"))
            .map_err(|err| IdentityFailure::Transient(err.to_string()))
    }
}

#[async_trait]
impl IdentityClient for ScriptedIdentity {
    async fn login(&self) -> Result<Session, IdentityFailure> {
        let mut the_state = self.state.lock();
        the_state.login_calls += 1;
        the_state
            .logins
            .pop_front()
            .unwrap_or_else(|| Self::unscripted("scripted@example.com"))
    }

    async fn refresh(&self, handle: &RefreshHandle) -> Result<Session, IdentityFailure> {
        let mut the_state = self.state.lock();
        the_state.refresh_calls += 1;
        the_state.handles_seen.push(handle.clone());
        the_state
            .refreshes
            .pop_front()
            .unwrap_or_else(|| Self::unscripted("scripted@example.com"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::{CopyAuthorization, CopyOptions, TableRef};

    fn the_session() -> Session {
        fresh_session("tester", Duration::hours(1), None).expect("💀 fresh session")
    }

    #[tokio::test]
    async fn the_one_where_the_fake_bucket_throws_exactly_two_tantrums() {
        let the_store = InMemoryObjectStore::new().with_failure("part", StorageError::transient("SlowDown"), Some(2));
        let the_put = || PutObject {
            bucket: "b".into(),
            key: "data.csv.part00000".into(),
            body: Bytes::from_static(b"a,b\n"),
            encryption: EncryptionMode::ServerSide,
        };
        assert!(the_store.put_object(&the_session(), the_put()).await.is_err());
        assert!(the_store.put_object(&the_session(), the_put()).await.is_err());
        assert!(the_store.put_object(&the_session(), the_put()).await.is_ok());
        assert_eq!(the_store.attempts_for("part00000"), 3);
        let the_stored = the_store.object("b", "data.csv.part00000").expect("💀 landed");
        assert_eq!(the_stored.encryption, EncryptionMode::ServerSide);
        assert_eq!(the_stored.principal, "tester");
    }

    #[tokio::test]
    async fn the_one_where_rollback_makes_the_table_never_have_existed() {
        let the_warehouse = InMemoryWarehouse::new();
        the_warehouse.begin().await.expect("💀 begin");
        the_warehouse
            .execute("CREATE TABLE IF NOT EXISTS public.events (id int)")
            .await
            .expect("💀 create");
        assert!(!the_warehouse.table_exists("public.events"), "uncommitted DDL must stay private");
        the_warehouse.rollback().await.expect("💀 rollback");
        assert!(!the_warehouse.table_exists("public.events"));
        assert!(!the_warehouse.in_transaction());
    }

    #[tokio::test]
    async fn the_one_where_copy_lands_only_after_commit() {
        let the_warehouse = InMemoryWarehouse::new().with_table("public.events");
        let the_load = BulkLoad {
            table: TableRef::new(None, Some("public".into()), "events"),
            source: StorageLocation::new("bucket", "stage/events.csv"),
            manifest: false,
            options: CopyOptions::default(),
            authorization: CopyAuthorization::IamRole("arn:aws:iam::123:role/r".into()),
        };
        the_warehouse.begin().await.expect("💀 begin");
        the_warehouse.bulk_load(&the_load).await.expect("💀 copy");
        assert!(the_warehouse.loaded_sources("public.events").is_empty());
        the_warehouse.commit().await.expect("💀 commit");
        assert_eq!(
            the_warehouse.loaded_sources("public.events"),
            vec!["s3://bucket/stage/events.csv".to_string()]
        );
    }

    #[tokio::test]
    async fn the_one_where_a_bare_prefix_drags_in_the_neighbours() {
        let the_store = InMemoryObjectStore::new();
        the_store.insert("lake", "stage/events.csv", &b"id\n1\n"[..]);
        the_store.insert("lake", "stage/events.csv.bak", &b"id\n0\n"[..]);
        let the_manifest = CopyManifest::new("lake", ["stage/events.csv"])
            .to_bytes()
            .expect("💀 manifest encodes");
        the_store.insert("lake", "stage/events.csv.manifest", the_manifest);
        let the_warehouse = InMemoryWarehouse::new()
            .with_table("public.events")
            .with_store(the_store);
        let the_load = |key: &str, manifest: bool| BulkLoad {
            table: TableRef::new(None, Some("public".into()), "events"),
            source: StorageLocation::new("lake", key),
            manifest,
            options: CopyOptions::default(),
            authorization: CopyAuthorization::IamRole("arn:aws:iam::123:role/r".into()),
        };

        the_warehouse.begin().await.expect("💀 begin");
        the_warehouse
            .bulk_load(&the_load("stage/events.csv", false))
            .await
            .expect("💀 prefix copy");
        the_warehouse.commit().await.expect("💀 commit");
        assert_eq!(
            the_warehouse.loaded_sources("public.events"),
            vec![
                "s3://lake/stage/events.csv".to_string(),
                "s3://lake/stage/events.csv.bak".to_string(),
                "s3://lake/stage/events.csv.manifest".to_string(),
            ]
        );

        the_warehouse.begin().await.expect("💀 begin");
        the_warehouse.execute("TRUNCATE public.events").await.expect("💀 truncate");
        the_warehouse
            .bulk_load(&the_load("stage/events.csv.manifest", true))
            .await
            .expect("💀 manifest copy");
        the_warehouse.commit().await.expect("💀 commit");
        assert_eq!(
            the_warehouse.loaded_sources("public.events"),
            vec!["s3://lake/stage/events.csv".to_string()]
        );

        the_warehouse.begin().await.expect("💀 begin");
        let the_err = the_warehouse
            .bulk_load(&the_load("stage/nothing-here.csv", false))
            .await
            .expect_err("💀 empty prefix");
        assert!(the_err.to_string().contains("does not exist"));
        the_warehouse.rollback().await.expect("💀 rollback");
    }

    #[tokio::test]
    async fn the_one_where_a_manifest_points_at_a_ghost() {
        let the_store = InMemoryObjectStore::new();
        let the_manifest = CopyManifest::new("lake", ["stage/gone.csv"])
            .to_bytes()
            .expect("💀 manifest encodes");
        the_store.insert("lake", "stage/gone.csv.manifest", the_manifest);
        let the_warehouse = InMemoryWarehouse::new()
            .with_table("public.events")
            .with_store(the_store);
        the_warehouse.begin().await.expect("💀 begin");
        let the_err = the_warehouse
            .bulk_load(&BulkLoad {
                table: TableRef::new(None, Some("public".into()), "events"),
                source: StorageLocation::new("lake", "stage/gone.csv.manifest"),
                manifest: true,
                options: CopyOptions::default(),
                authorization: CopyAuthorization::IamRole("arn:aws:iam::123:role/r".into()),
            })
            .await
            .expect_err("💀 mandatory entry is missing");
        assert!(the_err.to_string().contains("mandatory"));
    }

    #[tokio::test]
    async fn the_one_where_the_script_runs_out_and_improvises() {
        let the_identity = ScriptedIdentity::new();
        the_identity.push_refresh(Err(IdentityFailure::HandleRejected("stale".into())));
        let the_handle = RefreshHandle::new("h1");
        assert!(the_identity.refresh(&the_handle).await.is_err());
        assert!(the_identity.refresh(&the_handle).await.is_ok());
        assert!(the_identity.login().await.is_ok());
        assert_eq!(the_identity.refresh_calls(), 2);
        assert_eq!(the_identity.login_calls(), 1);
        assert_eq!(the_identity.handles_seen(), vec![the_handle.clone(), the_handle]);
    }
}

//! 🐘 RedshiftWarehouse — the `WarehouseClient` over the Postgres wire protocol.
//!
//! Redshift speaks (an old dialect of) PG, so `tokio-postgres` does the talking.
//! One connection per warehouse; the loader serializes transactions on top of it.
//! Statements go through the simple query protocol (`batch_execute`) because
//! COPY and DDL have no parameters to bind and Redshift's extended protocol is moody.
//!
//! ⚠️ TLS: connections use `NoTls`. `ssl = true` maps to `sslmode=prefer`, which
//! falls back to plaintext. Put the cluster behind a VPC endpoint or tunnel.
//!
//! 🎬 *[the cluster is paused for the weekend. Monday, 08:59. the first connect times out,
//! the second is refused, the third finds a warm leader node and says hello.]*
//!
//! 🧠 Knowledge graph:
//! - `connect` retries with `connect_backoff`. Statements themselves are never retried
//!   here, the loader owns that call (and the rollback that goes with it).
//! - The connection task is spawned on the runtime. When it dies, the next statement
//!   gets a `DriverError` and the loader rolls back like it would for any other failure.
//! - Every statement runs under `statement_timeout`.
//! - COPY text reaches the driver unredacted. Only logs see the redacted form.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio_postgres::NoTls;
use tokio_postgres::config::SslMode;
use tracing::{debug, error, info, trace};

use crate::backends::WarehouseClient;
use crate::error::DriverError;
use crate::retry::{BackoffPolicy, Retryable, retry_transient, with_timeout};
use crate::warehouse::BulkLoad;

/// 🔧 Everything needed to open a connection.
#[derive(Clone)]
pub struct RedshiftSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub ssl: bool,
    /// Per-statement and per-connect timeout.
    pub timeout: Duration,
    /// Budget for the initial connect only. Statements are never blindly retried.
    pub connect_backoff: BackoffPolicy,
}

impl std::fmt::Debug for RedshiftSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedshiftSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("ssl", &self.ssl)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RedshiftSettings {
    fn pg_config(&self) -> tokio_postgres::Config {
        let mut the_config = tokio_postgres::Config::new();
        the_config
            .host(&self.host)
            .port(self.port)
            .user(&self.user)
            .password(&self.password)
            .dbname(&self.database)
            .application_name("awsc")
            .ssl_mode(if self.ssl { SslMode::Prefer } else { SslMode::Disable });
        if !self.timeout.is_zero() {
            the_config.connect_timeout(self.timeout);
        }
        the_config
    }
}

/// Connect failures are all worth another try: DNS blips, cluster resuming, etc.
#[derive(Debug)]
struct ConnectFailure(String);

impl std::fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Retryable for ConnectFailure {
    fn is_transient(&self) -> bool {
        true
    }
}

/// 🐘 Production warehouse client.
pub struct RedshiftWarehouse {
    client: tokio_postgres::Client,
    statement_timeout: Duration,
}

impl std::fmt::Debug for RedshiftWarehouse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedshiftWarehouse")
            .field("closed", &self.client.is_closed())
            .field("statement_timeout", &self.statement_timeout)
            .finish()
    }
}

impl RedshiftWarehouse {
    /// 🚀 Connects (with retries) and spawns the connection driver task.
    pub async fn connect(settings: &RedshiftSettings) -> anyhow::Result<Self> {
        let the_pg_config = settings.pg_config();
        let the_attempt = retry_transient(&settings.connect_backoff, "redshift connect", |_| {
            let the_pg_config = the_pg_config.clone();
            async move {
                the_pg_config
                    .connect(NoTls)
                    .await
                    .map_err(|err| ConnectFailure(err.to_string()))
            }
        })
        .await;
        let the_attempts = the_attempt.attempts;
        let (the_client, the_connection) = the_attempt
            .result
            .map_err(|err| anyhow::anyhow!(err.0))
            .with_context(|| {
                format!(
                    "💀 could not reach Redshift at {}:{}/{} after {the_attempts} attempt(s)",
                    settings.host, settings.port, settings.database
                )
            })?;

        // 🧵 The connection object does the actual I/O; it lives until the client drops.
        tokio::spawn(async move {
            if let Err(err) = the_connection.await {
                error!("💀 redshift connection closed with an error: {err}");
            }
        });
        info!(host = %settings.host, database = %settings.database, "🐘 connected to Redshift");
        Ok(Self {
            client: the_client,
            statement_timeout: settings.timeout,
        })
    }

    async fn run(&self, statement: &str, label: &str) -> Result<(), DriverError> {
        trace!(statement = label, "🐘 executing");
        with_timeout(self.statement_timeout, self.client.batch_execute(statement))
            .await
            .map_err(|timed_out| DriverError::new(format!("{label}: {timed_out}")))?
            .map_err(driver_error)
    }
}

fn driver_error(err: tokio_postgres::Error) -> DriverError {
    match err.as_db_error() {
        Some(db) => DriverError::new(format!("{} ({})", db.message(), db.code().code())),
        None => DriverError::new(err.to_string()),
    }
}

#[async_trait]
impl WarehouseClient for RedshiftWarehouse {
    async fn begin(&self) -> Result<(), DriverError> {
        self.run("BEGIN", "BEGIN").await
    }

    async fn execute(&self, statement: &str) -> Result<(), DriverError> {
        self.run(statement, statement).await
    }

    async fn bulk_load(&self, load: &BulkLoad) -> Result<(), DriverError> {
        let the_redacted = load.redacted_statement();
        debug!(table = %load.table, source = %load.source, "🐘 COPY starting");
        self.run(&load.statement(), &the_redacted).await
    }

    async fn commit(&self) -> Result<(), DriverError> {
        self.run("COMMIT", "COMMIT").await
    }

    async fn rollback(&self) -> Result<(), DriverError> {
        self.run("ROLLBACK", "ROLLBACK").await
    }
}

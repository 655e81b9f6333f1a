//! 🔧 App Configuration — the sacred TOML-to-struct pipeline.
//!
//! 📡 "Config not found: We looked everywhere. Under the couch. Behind the fridge.
//! In the junk drawer. Nothing." — every developer at 3am 🦆
//!
//! 🏗️ Three layers, later ones win:
//! 1. an optional TOML file
//! 2. `AWSC_`-prefixed env vars, `__` for nesting (`AWSC_STORAGE__BUCKET`)
//! 3. the classic named vars (`AWS_S3_BUCKET`, `REDSHIFT_HOST`, ...) that every
//!    deployment script already exports
//!
//! 🔤 Named vars that hold text are taken verbatim. `REDSHIFT_PASSWORD=123456` stays the
//! string `"123456"` instead of turning into a number that no `String` field accepts.
//! Only the numeric and boolean named vars go through figment's value parsing.
//! `AWSC_` vars are always parsed, so quote them (`AWSC_WAREHOUSE__PASSWORD='"123456"'`)
//! to force a string.
//!
//! Loading only parses. `AppConfig::validate` is where the rules live, and it speaks
//! `ConfigError` so callers can match on what's wrong.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
    value::Uncased,
};
use serde::Deserialize;
use tracing::info;

use crate::backends::redshift::RedshiftSettings;
use crate::backends::sso_cli::AwsCliSsoSettings;
use crate::error::ConfigError;
use crate::identity::RefresherSettings;
use crate::retry::BackoffPolicy;
use crate::transfer::{Compression, EncryptionMode, TransferOptions};
use crate::warehouse::CopyOptions;

/// 🗺️ Named env var → config path, for values that are text no matter what they look like.
/// These beat everything else.
const NAMED_TEXT_VARS: &[(&str, &str)] = &[
    ("AWS_S3_BUCKET", "storage.bucket"),
    ("AWS_S3_DIRECTORY", "storage.directory"),
    ("AWS_IAM_ROLE", "storage.iam_role"),
    ("AWS_REGION", "storage.region"),
    ("AWS_KMS_KEY_ID", "storage.kms_key_id"),
    ("AWS_EXEC_FILE_PATH", "sso.exec_path"),
    ("AWS_SSO_PROFILE", "sso.profile"),
    ("AWS_CREDENTIALS_DB_PATH", "sso.ledger_path"),
    ("REDSHIFT_HOST", "warehouse.host"),
    ("REDSHIFT_USERNAME", "warehouse.username"),
    ("REDSHIFT_PASSWORD", "warehouse.password"),
    ("REDSHIFT_DATABASE", "warehouse.database"),
];

/// 🔢 Named env vars whose values are parsed (numbers, booleans).
const NAMED_PARSED_VARS: &[(&str, &str)] = &[
    ("AWS_MAX_RETRIES", "storage.max_retries"),
    ("AWS_TIMEOUT", "storage.timeout_secs"),
    ("AWS_SSO_REFRESH_WINDOW", "sso.refresh_window_hours"),
    ("AWS_SSO_MAX_RETRIES", "sso.max_retries"),
    ("AWS_SSO_RETRY_DELAY", "sso.retry_delay_secs"),
    ("REDSHIFT_PORT", "warehouse.port"),
    ("REDSHIFT_TIMEOUT", "warehouse.timeout_secs"),
    ("REDSHIFT_SSL", "warehouse.ssl"),
    ("REDSHIFT_MAX_RETRIES", "warehouse.max_retries"),
    ("REDSHIFT_RETRY_DELAY", "warehouse.retry_delay_secs"),
];

/// 📦 The AppConfig: one struct to rule them all, one struct to find them,
/// one struct to bring them all, and in the Figment bind them.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub storage: StorageConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub sso: SsoConfig,
    /// Only needed for `load` / `push`. Upload-only setups can leave it out.
    #[serde(default)]
    pub warehouse: Option<WarehouseConfig>,
    #[serde(default)]
    pub copy: CopyOptions,
}

/// 🪣 Where objects go and how they're protected.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default)]
    pub bucket: String,
    /// Key prefix. A trailing `/` is added when missing.
    #[serde(default)]
    pub directory: String,
    /// Full role ARN used by COPY. Without it, COPY borrows the SSO session's credentials.
    #[serde(default)]
    pub iam_role: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub kms_key_id: Option<String>,
    /// AES256 server-side encryption when no KMS key is configured.
    #[serde(default)]
    pub server_side_encryption: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_storage_timeout_secs")]
    pub timeout_secs: u64,
}

/// 🚚 How jobs are cut up and pushed.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct TransferConfig {
    pub chunk_size: usize,
    pub parallelism: usize,
    pub compression: Compression,
    /// Files and raw bytes start with a header line. Tables always do.
    pub header_row: bool,
    pub repeat_header: bool,
    pub show_progress: bool,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        let the_defaults = TransferOptions::default();
        let the_backoff = BackoffPolicy::default();
        Self {
            chunk_size: the_defaults.chunk_size,
            parallelism: the_defaults.parallelism,
            compression: the_defaults.compression,
            header_row: true,
            repeat_header: the_defaults.repeat_header,
            show_progress: false,
            retry_base_delay_ms: the_backoff.base_delay.as_millis() as u64,
            retry_max_delay_ms: the_backoff.max_delay.as_millis() as u64,
        }
    }
}

/// 🔐 SSO via the AWS CLI.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SsoConfig {
    pub exec_path: PathBuf,
    pub profile: Option<String>,
    /// Where the refresh ledger lives. Holds no secrets.
    pub ledger_path: PathBuf,
    /// Session lifetime assumed when the CLI doesn't report one.
    pub refresh_window_hours: i64,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub safety_margin_secs: i64,
    pub call_timeout_secs: u64,
    pub login_timeout_secs: u64,
}

impl Default for SsoConfig {
    fn default() -> Self {
        Self {
            exec_path: PathBuf::from("aws"),
            profile: None,
            ledger_path: PathBuf::from("./data/aws_credentials.json"),
            refresh_window_hours: 6,
            max_retries: 3,
            retry_delay_secs: 5,
            safety_margin_secs: 300,
            call_timeout_secs: 60,
            login_timeout_secs: 300,
        }
    }
}

/// 🐘 Redshift connection.
#[derive(Debug, Deserialize, Clone)]
pub struct WarehouseConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub database: String,
    #[serde(default = "default_redshift_port")]
    pub port: u16,
    #[serde(default = "default_storage_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub ssl: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    /// Log each COPY (redacted) before running it.
    #[serde(default)]
    pub echo: bool,
}

fn default_max_retries() -> u32 {
    3
}

fn default_storage_timeout_secs() -> u64 {
    30
}

fn default_redshift_port() -> u16 {
    5439
}

fn default_retry_delay_secs() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

fn require(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Empty { field });
    }
    Ok(())
}

/// `Some("  ")` is a mistake, `None` is a choice.
fn require_if_present(field: &'static str, value: &Option<String>) -> Result<(), ConfigError> {
    match value {
        Some(inner) => require(field, inner),
        None => Ok(()),
    }
}

fn require_positive(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            field,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}

impl AppConfig {
    /// ✅ The rules a config must follow before anything gets built from it.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let the_storage = &self.storage;
        require("storage.bucket", &the_storage.bucket)?;
        require("storage.directory", &the_storage.directory)?;
        require_positive("storage.timeout_secs", the_storage.timeout_secs)?;
        require_if_present("storage.region", &the_storage.region)?;
        require_if_present("storage.iam_role", &the_storage.iam_role)?;
        if the_storage.kms_key_id.as_deref().is_some_and(|key| key.trim().is_empty()) {
            return Err(ConfigError::MissingKmsKeyId);
        }
        if let Some(role) = &the_storage.iam_role
            && !role.trim().starts_with("arn:")
        {
            return Err(ConfigError::Invalid {
                field: "storage.iam_role",
                reason: format!("'{role}' is not a role ARN"),
            });
        }

        if self.transfer.chunk_size == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }
        if self.transfer.parallelism == 0 {
            return Err(ConfigError::ZeroParallelism);
        }

        let the_sso = &self.sso;
        if the_sso.exec_path.as_os_str().is_empty() {
            return Err(ConfigError::Empty { field: "sso.exec_path" });
        }
        if the_sso.ledger_path.as_os_str().is_empty() {
            return Err(ConfigError::Empty { field: "sso.ledger_path" });
        }
        require_if_present("sso.profile", &the_sso.profile)?;
        if the_sso.refresh_window_hours <= 0 {
            return Err(ConfigError::Invalid {
                field: "sso.refresh_window_hours",
                reason: "must be greater than zero".to_string(),
            });
        }
        if the_sso.safety_margin_secs < 0 {
            return Err(ConfigError::Invalid {
                field: "sso.safety_margin_secs",
                reason: "cannot be negative".to_string(),
            });
        }
        require_positive("sso.call_timeout_secs", the_sso.call_timeout_secs)?;
        require_positive("sso.login_timeout_secs", the_sso.login_timeout_secs)?;

        if let Some(warehouse) = &self.warehouse {
            // every part is loaded with the same IGNOREHEADER, so every part needs the header
            if !self.transfer.repeat_header {
                return Err(ConfigError::Invalid {
                    field: "transfer.repeat_header",
                    reason: "must stay on when a warehouse is configured: COPY skips the first line of every part"
                        .to_string(),
                });
            }
            require("warehouse.host", &warehouse.host)?;
            require("warehouse.username", &warehouse.username)?;
            require("warehouse.password", &warehouse.password)?;
            require("warehouse.database", &warehouse.database)?;
            require_positive("warehouse.port", u64::from(warehouse.port))?;
            require_positive("warehouse.timeout_secs", warehouse.timeout_secs)?;
        }
        Ok(())
    }

    /// 🔒 KMS wins, then AES256, then nothing.
    pub fn encryption(&self) -> EncryptionMode {
        match &self.storage.kms_key_id {
            Some(key_id) => EncryptionMode::Kms { key_id: key_id.clone() },
            None if self.storage.server_side_encryption => EncryptionMode::ServerSide,
            None => EncryptionMode::None,
        }
    }

    /// 🎛️ Defaults for every job the connector builds.
    pub fn transfer_options(&self) -> TransferOptions {
        TransferOptions {
            chunk_size: self.transfer.chunk_size,
            max_retries: self.storage.max_retries,
            encryption: self.encryption(),
            compression: self.transfer.compression,
            parallelism: self.transfer.parallelism,
            header_row: self.transfer.header_row,
            repeat_header: self.transfer.repeat_header,
        }
    }

    /// ⏳ Pacing for chunk retries. The budget itself rides on each job.
    pub fn upload_backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(self.transfer.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.transfer.retry_max_delay_ms),
            max_retries: self.storage.max_retries,
            ..BackoffPolicy::default()
        }
    }

    pub fn refresher_settings(&self) -> RefresherSettings {
        let the_delay = Duration::from_secs(self.sso.retry_delay_secs);
        RefresherSettings {
            backoff: BackoffPolicy {
                base_delay: the_delay,
                max_delay: the_delay.saturating_mul(8),
                max_retries: self.sso.max_retries,
                ..BackoffPolicy::default()
            },
            safety_margin: chrono::Duration::seconds(self.sso.safety_margin_secs),
            call_timeout: Duration::from_secs(self.sso.call_timeout_secs),
            login_timeout: Duration::from_secs(self.sso.login_timeout_secs),
        }
    }

    pub fn sso_settings(&self) -> AwsCliSsoSettings {
        AwsCliSsoSettings {
            exec_path: self.sso.exec_path.clone(),
            profile: self.sso.profile.clone(),
            refresh_window: chrono::Duration::hours(self.sso.refresh_window_hours),
            call_timeout: Duration::from_secs(self.sso.call_timeout_secs),
            login_timeout: Duration::from_secs(self.sso.login_timeout_secs),
        }
    }

    pub fn redshift_settings(&self) -> Option<RedshiftSettings> {
        self.warehouse.as_ref().map(|warehouse| {
            let the_delay = Duration::from_secs(warehouse.retry_delay_secs);
            RedshiftSettings {
                host: warehouse.host.clone(),
                port: warehouse.port,
                user: warehouse.username.clone(),
                password: warehouse.password.clone(),
                database: warehouse.database.clone(),
                ssl: warehouse.ssl,
                timeout: Duration::from_secs(warehouse.timeout_secs),
                connect_backoff: BackoffPolicy {
                    base_delay: the_delay,
                    max_delay: the_delay.saturating_mul(8),
                    max_retries: warehouse.max_retries,
                    ..BackoffPolicy::default()
                },
            }
        })
    }

    /// 📜 COPY options with the storage region, compression and header folded in.
    ///
    /// `ignore_header` follows `transfer.header_row`. The connector overrides it for
    /// tables, which always carry a header.
    pub fn copy_options(&self) -> CopyOptions {
        let mut the_copy = self.copy.clone();
        the_copy.ignore_header = u32::from(self.transfer.header_row);
        if the_copy.region.is_none() {
            the_copy.region = self.storage.region.clone();
        }
        if self.transfer.compression == Compression::Gzip {
            the_copy.gzip = true;
        }
        the_copy
    }
}

/// 🚀 Load the config — from a file, from env vars, or from the sheer power of hoping.
///
/// 📐 `None` ⇒ env only. `Some(path)` ⇒ TOML underneath the env layers.
/// Parsing only; call [`AppConfig::validate`] before building anything.
pub fn load_config(config_file_name: Option<&Path>) -> anyhow::Result<AppConfig> {
    info!(
        "🔧 Loading configuration: {}",
        config_file_name.map(|p| p.display().to_string()).unwrap_or_else(|| "<env only>".to_string())
    );

    let mut the_figment = Figment::new();
    if let Some(file_name) = config_file_name {
        the_figment = the_figment.merge(Toml::file(file_name));
    }
    let mut the_figment = the_figment
        .merge(Env::prefixed("AWSC_").split("__"))
        .merge(Env::raw().filter_map(|key| {
            NAMED_PARSED_VARS
                .iter()
                .find(|(var, _)| key.as_str().eq_ignore_ascii_case(var))
                .map(|(_, path)| Uncased::from(*path))
        }));
    for &(var, path) in NAMED_TEXT_VARS {
        if let Ok(value) = std::env::var(var) {
            the_figment = the_figment.merge(Serialized::default(path, value));
        }
    }

    // 🕵️ figment's error names the key and the source that broke it, so don't guess here
    let the_context = match config_file_name {
        Some(path) => format!(
            "💀 Failed to load configuration from file '{}' and environment variables. \
             Either one could be the culprit, the cause below names the key and where it came from.",
            path.display()
        ),
        None => "💀 Failed to load configuration from environment variables. \
                 No file was provided, so the cause below is all on the environment."
            .to_string(),
    };

    the_figment.extract().context(the_context)
}

// ai
//! 🔐 AwsCliSso — the `IdentityClient` that shells out to the `aws` binary.
//!
//! 🎬 *[a browser tab opens. a device code appears. somewhere, a developer sighs.]*
//!
//! 🧠 Knowledge graph:
//! - `login()` runs `aws sso login [--profile P]` with inherited stdio (it may open a
//!   browser and print a device code), then exports credentials.
//! - `refresh(handle)` runs `aws configure export-credentials --format process [--profile P]`.
//!   That call is non-interactive: it works while the cached SSO token is alive and fails
//!   with "token has expired" once it isn't, which is exactly a rejected refresh handle.
//! - The refresh handle is the profile the credentials came from (`profile:<name>` or `default`).
//! - When the export carries no `Expiration`, the session lives for `refresh_window`.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info};

use crate::backends::{IdentityClient, IdentityFailure};
use crate::identity::{Credentials, RefreshHandle, Session};
use crate::retry::with_timeout;

const DEFAULT_PROFILE_HANDLE: &str = "default";
const PROFILE_HANDLE_PREFIX: &str = "profile:";

/// 🔧 How to find and drive the CLI.
#[derive(Debug, Clone)]
pub struct AwsCliSsoSettings {
    pub exec_path: PathBuf,
    pub profile: Option<String>,
    /// Lifetime assumed when the CLI does not report an expiration.
    pub refresh_window: chrono::Duration,
    /// Timeout for the non-interactive export call.
    pub call_timeout: Duration,
    /// Timeout for the interactive login (a human is clicking things).
    pub login_timeout: Duration,
}

/// 🔐 Production identity client.
#[derive(Debug, Clone)]
pub struct AwsCliSso {
    settings: AwsCliSsoSettings,
}

/// 📄 `export-credentials --format process` output. Same shape as a credential_process.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ExportedCredentials {
    access_key_id: String,
    secret_access_key: String,
    #[serde(default)]
    session_token: Option<String>,
    #[serde(default)]
    expiration: Option<DateTime<Utc>>,
}

impl AwsCliSso {
    pub fn new(settings: AwsCliSsoSettings) -> Self {
        Self { settings }
    }

    fn handle_for(profile: Option<&str>) -> RefreshHandle {
        match profile {
            Some(name) => RefreshHandle::new(format!("{PROFILE_HANDLE_PREFIX}{name}")),
            None => RefreshHandle::new(DEFAULT_PROFILE_HANDLE),
        }
    }

    fn profile_from(handle: &RefreshHandle) -> Result<Option<String>, IdentityFailure> {
        let the_raw = handle.as_str();
        if the_raw == DEFAULT_PROFILE_HANDLE {
            return Ok(None);
        }
        match the_raw.strip_prefix(PROFILE_HANDLE_PREFIX) {
            Some(name) if !name.is_empty() => Ok(Some(name.to_string())),
            _ => Err(IdentityFailure::HandleRejected(format!(
                "unrecognised refresh handle '{the_raw}'"
            ))),
        }
    }

    fn command(&self, profile: Option<&str>) -> Command {
        let mut the_command = Command::new(&self.settings.exec_path);
        the_command.kill_on_drop(true);
        if let Some(profile) = profile {
            the_command.arg("--profile").arg(profile);
        }
        the_command
    }

    async fn export(&self, profile: Option<&str>) -> Result<Session, IdentityFailure> {
        let mut the_command = self.command(profile);
        the_command
            .args(["configure", "export-credentials", "--format", "process"])
            .stdin(Stdio::null());
        let the_output = with_timeout(self.settings.call_timeout, the_command.output())
            .await
            .map_err(|timed_out| IdentityFailure::Transient(format!("export-credentials {timed_out}")))?
            .map_err(|err| self.spawn_failure(err))?;

        if !the_output.status.success() {
            let the_stderr = String::from_utf8_lossy(&the_output.stderr);
            return Err(classify_cli_failure(&the_stderr));
        }
        let the_exported: ExportedCredentials = serde_json::from_slice(&the_output.stdout)
            .map_err(|err| IdentityFailure::Transient(format!("unreadable export-credentials output: {err}")))?;
        self.session_from(profile, the_exported, Utc::now())
    }

    fn session_from(
        &self,
        profile: Option<&str>,
        exported: ExportedCredentials,
        now: DateTime<Utc>,
    ) -> Result<Session, IdentityFailure> {
        let the_expiry = exported
            .expiration
            .unwrap_or(now + self.settings.refresh_window);
        if the_expiry <= now {
            return Err(IdentityFailure::HandleRejected(format!(
                "exported credentials already expired at {the_expiry}"
            )));
        }
        let the_principal = profile.unwrap_or(DEFAULT_PROFILE_HANDLE);
        Session::new(
            the_principal,
            now,
            the_expiry,
            Credentials::new(exported.access_key_id, exported.secret_access_key, exported.session_token),
            Some(Self::handle_for(profile)),
        )
        .map_err(|err| IdentityFailure::HandleRejected(err.to_string()))
    }

    fn spawn_failure(&self, err: std::io::Error) -> IdentityFailure {
        if err.kind() == std::io::ErrorKind::NotFound {
            IdentityFailure::CredentialsRejected(format!(
                "AWS CLI executable not found at {}",
                self.settings.exec_path.display()
            ))
        } else {
            IdentityFailure::Transient(format!("could not run the AWS CLI: {err}"))
        }
    }
}

#[async_trait]
impl IdentityClient for AwsCliSso {
    async fn login(&self) -> Result<Session, IdentityFailure> {
        let the_profile = self.settings.profile.as_deref();
        info!(profile = the_profile.unwrap_or(DEFAULT_PROFILE_HANDLE), "🔐 starting AWS SSO login");
        let mut the_command = self.command(the_profile);
        the_command
            .args(["sso", "login"])
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped());
        let the_output = with_timeout(self.settings.login_timeout, the_command.output())
            .await
            .map_err(|timed_out| IdentityFailure::Transient(format!("sso login {timed_out}")))?
            .map_err(|err| self.spawn_failure(err))?;
        if !the_output.status.success() {
            let the_stderr = String::from_utf8_lossy(&the_output.stderr);
            return Err(match classify_cli_failure(&the_stderr) {
                // 🚪 a login has no handle to reject; a stale-token complaint here means the login itself failed
                IdentityFailure::HandleRejected(message) => IdentityFailure::Transient(message),
                other => other,
            });
        }
        debug!("🔐 sso login finished, exporting credentials");
        self.export(the_profile).await
    }

    async fn refresh(&self, handle: &RefreshHandle) -> Result<Session, IdentityFailure> {
        let the_profile = Self::profile_from(handle)?;
        self.export(the_profile.as_deref()).await
    }
}

/// 🧪 Reads the CLI's stderr and decides whose fault it was.
fn classify_cli_failure(stderr: &str) -> IdentityFailure {
    let the_message = stderr.trim().to_string();
    let the_lower = the_message.to_lowercase();
    let the_handle_markers = [
        "token has expired",
        "token is expired",
        "error loading sso token",
        "sso session",
        "refresh failed",
        "run aws sso login",
    ];
    let the_rejection_markers = [
        "accessdenied",
        "access denied",
        "unauthorized",
        "forbidden",
        "invalid_grant",
        "could not be found",
        "invalidclientexception",
    ];
    if the_handle_markers.iter().any(|marker| the_lower.contains(marker)) {
        IdentityFailure::HandleRejected(the_message)
    } else if the_rejection_markers.iter().any(|marker| the_lower.contains(marker)) {
        IdentityFailure::CredentialsRejected(the_message)
    } else {
        IdentityFailure::Transient(the_message)
    }
}

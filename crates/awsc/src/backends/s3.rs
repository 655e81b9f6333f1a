//! 🪣 S3ObjectStore — the `ObjectStoreClient` that actually talks to AWS.
//!
//! 🎬 COLD OPEN — a 5 MB chunk leaves the laptop. It has never seen a data center.
//! It has heard stories. Some of them involve 503 SlowDown.
//!
//! 🧠 Knowledge graph:
//! - One `SdkConfig` is loaded at construction (region, endpoint, HTTP stack).
//! - Every call signs with the caller's `Session`, not whatever the environment has lying around.
//!   The refresher owns credentials; this module just borrows them for one request.
//! - SDK-level retries are disabled. The uploader owns the retry budget, so a chunk's
//!   attempt count means what it says.
//! - `SdkError` → `StorageError` classification lives in `classify_sdk_error` / `is_transient_status`.

use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_config::retry::RetryConfig;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::ServerSideEncryption;
use tracing::{debug, trace};

use crate::backends::{ObjectStoreClient, PutObject};
use crate::error::StorageError;
use crate::identity::Session;
use crate::retry::with_timeout;
use crate::transfer::EncryptionMode;

/// 🏷️ Provider name stamped on the per-request credentials. Shows up in SDK debug logs.
const CREDENTIALS_PROVIDER_NAME: &str = "awsc-sso";

/// 🪣 Production object store on top of `aws-sdk-s3`.
#[derive(Clone)]
pub struct S3ObjectStore {
    sdk_config: aws_config::SdkConfig,
    call_timeout: Duration,
}

impl std::fmt::Debug for S3ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3ObjectStore")
            .field("region", &self.sdk_config.region())
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

impl S3ObjectStore {
    /// 🚀 Loads the shared AWS config. `region = None` lets the default chain pick one.
    pub async fn new(region: Option<String>, call_timeout: Duration) -> Self {
        let mut the_loader =
            aws_config::defaults(BehaviorVersion::latest()).retry_config(RetryConfig::disabled());
        if let Some(region) = region {
            the_loader = the_loader.region(Region::new(region));
        }
        let the_sdk_config = the_loader.load().await;
        debug!(region = ?the_sdk_config.region(), "🪣 S3 client configured");
        Self {
            sdk_config: the_sdk_config,
            call_timeout,
        }
    }

    /// 🔑 A client signed with this session's credentials. Cheap: the HTTP stack is shared.
    fn client_for(&self, session: &Session) -> aws_sdk_s3::Client {
        let the_creds = session.credentials();
        let the_provider = aws_sdk_s3::config::Credentials::new(
            the_creds.access_key_id.clone(),
            the_creds.secret_access_key.clone(),
            the_creds.session_token.clone(),
            Some(session.expires_at().into()),
            CREDENTIALS_PROVIDER_NAME,
        );
        let the_config = aws_sdk_s3::config::Builder::from(&self.sdk_config)
            .credentials_provider(the_provider)
            .build();
        aws_sdk_s3::Client::from_conf(the_config)
    }
}

#[async_trait]
impl ObjectStoreClient for S3ObjectStore {
    async fn put_object(&self, session: &Session, request: PutObject) -> Result<(), StorageError> {
        let the_client = self.client_for(session);
        let the_size = request.body.len();
        let mut the_put = the_client
            .put_object()
            .bucket(&request.bucket)
            .key(&request.key)
            .content_length(the_size as i64)
            .body(ByteStream::from(request.body));
        the_put = match &request.encryption {
            EncryptionMode::None => the_put,
            EncryptionMode::ServerSide => the_put.server_side_encryption(ServerSideEncryption::Aes256),
            EncryptionMode::Kms { key_id } => the_put
                .server_side_encryption(ServerSideEncryption::AwsKms)
                .ssekms_key_id(key_id),
        };

        let the_response = with_timeout(self.call_timeout, the_put.send())
            .await
            .map_err(|timed_out| StorageError::transient(format!("PutObject {}: {timed_out}", request.key)))?;
        the_response.map_err(|err| classify_sdk_error("PutObject", &request.key, err))?;
        trace!(bucket = %request.bucket, key = %request.key, bytes = the_size, "🪣 object landed");
        Ok(())
    }

    async fn object_exists(&self, session: &Session, bucket: &str, key: &str) -> Result<bool, StorageError> {
        let the_client = self.client_for(session);
        let the_head = the_client.head_object().bucket(bucket).key(key).send();
        let the_response = with_timeout(self.call_timeout, the_head)
            .await
            .map_err(|timed_out| StorageError::transient(format!("HeadObject {key}: {timed_out}")))?;
        match the_response {
            Ok(_) => Ok(true),
            Err(err) => {
                if let SdkError::ServiceError(service) = &err
                    && service.err().is_not_found()
                {
                    return Ok(false);
                }
                Err(classify_sdk_error("HeadObject", key, err))
            }
        }
    }
}

/// 🧪 Sorts an SDK failure into "try again" or "stop asking".
fn classify_sdk_error<E>(operation: &str, key: &str, err: SdkError<E, HttpResponse>) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let the_transient = match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => true,
        SdkError::ServiceError(service) => {
            is_transient_status(service.raw().status().as_u16(), service.err().code())
        }
        _ => false,
    };
    let the_message = format!("{operation} {key}: {}", DisplayErrorContext(&err));
    if the_transient {
        StorageError::transient(the_message)
    } else {
        StorageError::permanent(the_message)
    }
}

/// 5xx, 429 and the throttling codes are worth a retry. Everything else (403, 404, 400) is not.
fn is_transient_status(status: u16, code: Option<&str>) -> bool {
    if status >= 500 || status == 429 || status == 408 {
        return true;
    }
    matches!(
        code,
        Some("SlowDown" | "Throttling" | "ThrottlingException" | "RequestTimeout" | "InternalError")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_s3_tantrums_are_sorted_into_retry_and_give_up() {
        assert!(is_transient_status(503, Some("SlowDown")));
        assert!(is_transient_status(500, None));
        assert!(is_transient_status(429, None));
        assert!(is_transient_status(400, Some("RequestTimeout")));
        assert!(!is_transient_status(403, Some("AccessDenied")));
        assert!(!is_transient_status(404, Some("NoSuchBucket")));
        assert!(!is_transient_status(400, Some("InvalidArgument")));
    }
}

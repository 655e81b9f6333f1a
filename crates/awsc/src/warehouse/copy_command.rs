// ai
//! 📜 COPY — the one statement that turns a staged object into warehouse rows.
//!
//! Rendered twice: once for real (secrets and all, straight to the driver) and once
//! redacted (for logs, errors, and the in-memory warehouse's statement log).
//!
//! 🎬 *[COPY FROM 's3://lake/stage/events.csv'. Redshift nods, lists the prefix, and
//! finds `events.csv`, `events.csv.bak`, and three parts from last Tuesday. It loads them all.]*
//!
//! That is why the connector never hands COPY a bare key. It stages a [`CopyManifest`]
//! naming every object of one upload, and COPY reads that list with `MANIFEST`.
//! Nothing else under the prefix gets a say.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::TableRef;
use crate::identity::Credentials;
use crate::transfer::StorageLocation;

const REDACTED: &str = "<redacted>";

/// 🎛️ The CSV dialect and conversions COPY applies.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CopyOptions {
    pub delimiter: char,
    pub quote: char,
    /// Header lines to skip in every object. The connector sets this per load: 1 when
    /// the payload carried a header (repeated into every part), 0 when it did not.
    pub ignore_header: u32,
    /// Bucket region, when it differs from the cluster's.
    pub region: Option<String>,
    pub time_format: String,
    pub date_format: String,
    /// Objects are gzip-compressed.
    pub gzip: bool,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            delimiter: ',',
            quote: '"',
            ignore_header: 1,
            region: None,
            time_format: "YYYY-MM-DD-HH.MI.SS".to_string(),
            date_format: "YYYY-MM-DD".to_string(),
            gzip: false,
        }
    }
}

/// 🔑 How the warehouse proves it may read the bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyAuthorization {
    /// An IAM role ARN attached to the cluster.
    IamRole(String),
    /// The caller's own session credentials, passed inline.
    SessionCredentials(Credentials),
}

/// 📒 One line of a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub url: String,
    /// COPY fails when a mandatory object is missing instead of loading less.
    pub mandatory: bool,
}

/// 📒 The exact list of objects one COPY reads, in Redshift's manifest format:
/// `{"entries":[{"url":"s3://bucket/key","mandatory":true}, ...]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyManifest {
    pub entries: Vec<ManifestEntry>,
}

impl CopyManifest {
    /// Every key is mandatory: a manifest that silently skips a part is worse than none.
    pub fn new<'a>(bucket: &str, keys: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            entries: keys
                .into_iter()
                .map(|key| ManifestEntry {
                    url: StorageLocation::new(bucket, key).uri(),
                    mandatory: true,
                })
                .collect(),
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 📦 Everything `WarehouseClient::bulk_load` needs to run one COPY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkLoad {
    pub table: TableRef,
    /// A key prefix, or the manifest object when `manifest` is set.
    pub source: StorageLocation,
    pub manifest: bool,
    pub options: CopyOptions,
    pub authorization: CopyAuthorization,
}

impl BulkLoad {
    /// 🔓 The executable statement. Contains secrets when authorizing with session credentials.
    pub fn statement(&self) -> String {
        self.render(false)
    }

    /// 🔒 Same statement, safe for logs.
    pub fn redacted_statement(&self) -> String {
        self.render(true)
    }

    fn render(&self, redact: bool) -> String {
        let mut the_lines = vec![format!(
            "COPY {} FROM {}",
            self.table.qualified(),
            literal(&self.source.uri())
        )];
        the_lines.push(match &self.authorization {
            CopyAuthorization::IamRole(arn) => format!("IAM_ROLE {}", literal(arn)),
            CopyAuthorization::SessionCredentials(creds) => {
                let the_secret = if redact { REDACTED } else { creds.secret_access_key.as_str() };
                let mut the_auth = format!(
                    "ACCESS_KEY_ID {} SECRET_ACCESS_KEY {}",
                    literal(&creds.access_key_id),
                    literal(the_secret)
                );
                if let Some(token) = &creds.session_token {
                    let the_token = if redact { REDACTED } else { token.as_str() };
                    the_auth.push_str(&format!(" SESSION_TOKEN {}", literal(the_token)));
                }
                the_auth
            }
        });
        if self.manifest {
            the_lines.push("MANIFEST".to_string());
        }
        let the_options = &self.options;
        the_lines.push(format!(
            "FORMAT AS CSV DELIMITER {} QUOTE {}",
            literal(&the_options.delimiter.to_string()),
            literal(&the_options.quote.to_string())
        ));
        if the_options.ignore_header > 0 {
            the_lines.push(format!("IGNOREHEADER {}", the_options.ignore_header));
        }
        if let Some(region) = &the_options.region {
            the_lines.push(format!("REGION AS {}", literal(region)));
        }
        the_lines.push(format!("TIMEFORMAT {}", literal(&the_options.time_format)));
        the_lines.push(format!("DATEFORMAT AS {}", literal(&the_options.date_format)));
        if the_options.gzip {
            the_lines.push("GZIP".to_string());
        }
        the_lines.join("\n")
    }
}

/// `it's` → `'it''s'`
fn literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn the_load(authorization: CopyAuthorization) -> BulkLoad {
        BulkLoad {
            table: TableRef::new(Some("prod".into()), Some("sales".into()), "orders"),
            source: StorageLocation::new("lake", "stage/orders.csv"),
            manifest: false,
            options: CopyOptions {
                region: Some("us-east-1".into()),
                ..CopyOptions::default()
            },
            authorization,
        }
    }

    #[test]
    fn the_one_where_the_copy_statement_says_all_the_right_things() {
        let the_sql = the_load(CopyAuthorization::IamRole("arn:aws:iam::123:role/loader".into())).statement();
        assert_eq!(
            the_sql,
            "COPY prod.sales.orders FROM 's3://lake/stage/orders.csv'\n\
             IAM_ROLE 'arn:aws:iam::123:role/loader'\n\
             FORMAT AS CSV DELIMITER ',' QUOTE '\"'\n\
             IGNOREHEADER 1\n\
             REGION AS 'us-east-1'\n\
             TIMEFORMAT 'YYYY-MM-DD-HH.MI.SS'\n\
             DATEFORMAT AS 'YYYY-MM-DD'"
        );
    }

    #[test]
    fn the_one_where_secrets_stay_out_of_the_logs() {
        let the_load = the_load(CopyAuthorization::SessionCredentials(Credentials::new(
            "AKIAVISIBLE",
            "super-secret",
            Some("tok-123".into()),
        )));
        let the_real = the_load.statement();
        assert!(the_real.contains("SECRET_ACCESS_KEY 'super-secret'"));
        assert!(the_real.contains("SESSION_TOKEN 'tok-123'"));

        let the_redacted = the_load.redacted_statement();
        assert!(the_redacted.contains("ACCESS_KEY_ID 'AKIAVISIBLE'"));
        assert!(!the_redacted.contains("super-secret"));
        assert!(!the_redacted.contains("tok-123"));
    }

    #[test]
    fn the_one_where_a_manifest_pins_down_the_exact_objects() {
        let mut the_load = the_load(CopyAuthorization::IamRole("arn:aws:iam::123:role/loader".into()));
        the_load.source = StorageLocation::new("lake", "stage/orders.csv.manifest");
        the_load.manifest = true;
        the_load.options.ignore_header = 0;
        let the_sql = the_load.statement();
        assert!(the_sql.starts_with("COPY prod.sales.orders FROM 's3://lake/stage/orders.csv.manifest'\n"));
        assert!(the_sql.contains("\nMANIFEST\n"));
        assert!(!the_sql.contains("IGNOREHEADER"));

        let the_manifest = CopyManifest::new("lake", ["stage/orders.csv.part00000", "stage/orders.csv.part00001"]);
        let the_bytes = the_manifest.to_bytes().expect("💀 manifest encodes");
        assert_eq!(
            std::str::from_utf8(&the_bytes).expect("💀 utf8"),
            r#"{"entries":[{"url":"s3://lake/stage/orders.csv.part00000","mandatory":true},{"url":"s3://lake/stage/orders.csv.part00001","mandatory":true}]}"#
        );
        assert_eq!(CopyManifest::from_slice(&the_bytes).expect("💀 manifest decodes"), the_manifest);
    }

    #[test]
    fn the_one_where_quotes_in_literals_cannot_escape() {
        let mut the_load = the_load(CopyAuthorization::IamRole("arn".into()));
        the_load.source = StorageLocation::new("lake", "o'brien.csv");
        the_load.options.gzip = true;
        let the_sql = the_load.statement();
        assert!(the_sql.contains("FROM 's3://lake/o''brien.csv'"));
        assert!(the_sql.ends_with("\nGZIP"));
    }
}

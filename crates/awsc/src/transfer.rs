// ai
//! 🚚 Transfer — moving bytes from here to a bucket, one bounded chunk at a time.
//!
//! 🧠 Knowledge graph:
//! - `TransferJob`: payload + destination + options. Validated at construction, so a job
//!   that exists is a job that can at least be attempted.
//! - `TransferChunker` (chunker.rs): payload bytes → lazy sequence of `Chunk`s.
//! - `Table` (tabular.rs): in-memory rows → CSV bytes + row cut points.
//! - `ResilientUploader` (uploader.rs): chunks → objects, with retries and bookkeeping.
//! - `TransferResult`: what happened, chunk by chunk, keyed by index.
//!
//! Key layout: a one-chunk job writes `prefix + name`; a multi-chunk job writes
//! `prefix + name + ".part00000"`, `".part00001"`, ... and gzip adds `".gz"`.
//!
//! ⚠️ `prefix + name` is NOT a safe thing to COPY from. Redshift reads a COPY path as a
//! key prefix, so `events.csv` also drags in `events.csv.bak` and every leftover part of
//! yesterday's bigger upload. Loads go through `prefix + name + ".manifest"` instead,
//! which lists exactly the keys one upload wrote (see `warehouse::CopyManifest`).

mod chunker;
mod tabular;
mod uploader;

pub use chunker::{Boundary, Chunks, TransferChunker};
pub use tabular::{Cell, CsvPayload, Table};
pub use uploader::{ResilientUploader, UploaderSettings};

use std::collections::BTreeMap;
use std::ops::Range;
use std::path::PathBuf;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ErrorDetail};

/// 🔒 Server-side encryption requested for each stored object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum EncryptionMode {
    #[default]
    None,
    /// S3-managed keys (AES256).
    ServerSide,
    /// KMS-managed key. The key id must not be blank.
    Kms { key_id: String },
}

/// 🗜️ Per-chunk body compression.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    #[default]
    None,
    Gzip,
}

/// 📦 What gets uploaded.
#[derive(Debug, Clone)]
pub enum Payload {
    Bytes(Bytes),
    File(PathBuf),
    Table(Table),
}

/// 🎯 Where a job's objects go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageDestination {
    pub bucket: String,
    /// Key prefix, normalized to end in `/` unless empty.
    pub prefix: String,
    pub object_name: String,
}

impl StorageDestination {
    pub fn new(bucket: impl Into<String>, prefix: impl AsRef<str>, object_name: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: normalize_prefix(prefix.as_ref()),
            object_name: object_name.into(),
        }
    }

    /// `prefix + name`: the whole object for one chunk, the shared key prefix for many.
    pub fn object_key(&self) -> String {
        format!("{}{}", self.prefix, self.object_name)
    }

    /// 📒 Where the COPY manifest for this destination lives.
    pub fn manifest_key(&self) -> String {
        format!("{}.manifest", self.object_key())
    }

    /// 🔑 The key chunk `index` of a `total`-chunk job is stored under.
    pub fn chunk_key(&self, index: usize, total: usize, compression: Compression) -> String {
        let mut the_key = self.object_key();
        if total > 1 {
            the_key.push_str(&format!(".part{index:05}"));
        }
        if compression == Compression::Gzip {
            the_key.push_str(".gz");
        }
        the_key
    }
}

/// `"data"` → `"data/"`, `"data//"` → `"data/"`, `""` → `""`.
pub fn normalize_prefix(prefix: &str) -> String {
    let the_trimmed = prefix.trim().trim_end_matches('/');
    if the_trimmed.is_empty() {
        String::new()
    } else {
        format!("{the_trimmed}/")
    }
}

/// 📍 A bucket + key pair, printable as an `s3://` URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct StorageLocation {
    pub bucket: String,
    pub key: String,
}

impl StorageLocation {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    pub fn uri(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key)
    }
}

impl std::fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

/// 🎛️ How a job runs.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferOptions {
    /// Target chunk size in bytes. Line and row boundaries may stretch or shrink a chunk.
    pub chunk_size: usize,
    /// Retries per chunk after the first attempt.
    pub max_retries: u32,
    pub encryption: EncryptionMode,
    pub compression: Compression,
    /// Chunks in flight at once.
    pub parallelism: usize,
    /// Bytes and file payloads start with a header line. Tables always do.
    pub header_row: bool,
    /// Prepend the header to every chunk after the first, so each object is a standalone CSV.
    pub repeat_header: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            chunk_size: 8 * 1024 * 1024,
            max_retries: 3,
            encryption: EncryptionMode::None,
            compression: Compression::None,
            parallelism: 1,
            header_row: false,
            repeat_header: true,
        }
    }
}

/// 📋 One upload job. Immutable once built.
#[derive(Debug, Clone)]
pub struct TransferJob {
    payload: Payload,
    destination: StorageDestination,
    options: TransferOptions,
}

impl TransferJob {
    /// 🏗️ Validates and builds. Nothing touches the network here.
    pub fn new(
        payload: Payload,
        destination: StorageDestination,
        options: TransferOptions,
    ) -> Result<Self, ConfigError> {
        if options.chunk_size == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }
        if let EncryptionMode::Kms { key_id } = &options.encryption
            && key_id.trim().is_empty()
        {
            return Err(ConfigError::MissingKmsKeyId);
        }
        if options.parallelism == 0 {
            return Err(ConfigError::ZeroParallelism);
        }
        if destination.bucket.trim().is_empty() {
            return Err(ConfigError::Empty { field: "bucket" });
        }
        if destination.object_name.trim().is_empty() {
            return Err(ConfigError::Empty { field: "object name" });
        }
        Ok(Self {
            payload,
            destination,
            options,
        })
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn destination(&self) -> &StorageDestination {
        &self.destination
    }

    pub fn options(&self) -> &TransferOptions {
        &self.options
    }
}

/// 🚦 Where a chunk is in its short, eventful life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChunkState {
    Pending,
    InFlight,
    Succeeded,
    Failed,
}

impl std::fmt::Display for ChunkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let the_state = match self {
            ChunkState::Pending => "PENDING",
            ChunkState::InFlight => "IN_FLIGHT",
            ChunkState::Succeeded => "SUCCEEDED",
            ChunkState::Failed => "FAILED",
        };
        f.write_str(the_state)
    }
}

/// 🧩 One slice of a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    pub range: Range<usize>,
    pub attempts: u32,
    pub state: ChunkState,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

/// 📝 The final word on one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkOutcome {
    pub index: usize,
    pub range: Range<usize>,
    pub key: String,
    pub attempts: u32,
    pub state: ChunkState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

/// 📊 The aggregate of a whole job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferResult {
    /// True iff every chunk SUCCEEDED. Vacuously true for an empty payload.
    pub success: bool,
    pub outcomes: BTreeMap<usize, ChunkOutcome>,
    /// The lowest-index failure, or the reason the job never got going.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    /// Where the data landed. Only set on success with at least one chunk.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<StorageLocation>,
    /// The manifest naming exactly `stored_keys()`, once one has been staged.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest: Option<StorageLocation>,
    pub cancelled: bool,
    /// Size of the prepared payload, before per-chunk headers and compression.
    pub total_bytes: usize,
}

impl TransferResult {
    /// A job that failed before any chunk existed (unreadable file, bad options).
    pub fn failed_before_start(error: ErrorDetail) -> Self {
        Self {
            success: false,
            outcomes: BTreeMap::new(),
            error: Some(error),
            location: None,
            manifest: None,
            cancelled: false,
            total_bytes: 0,
        }
    }

    pub fn count_in(&self, state: ChunkState) -> usize {
        self.outcomes.values().filter(|outcome| outcome.state == state).count()
    }

    /// Keys of every chunk that made it, in index order.
    pub fn stored_keys(&self) -> Vec<&str> {
        self.outcomes
            .values()
            .filter(|outcome| outcome.state == ChunkState::Succeeded)
            .map(|outcome| outcome.key.as_str())
            .collect()
    }

    pub fn message(&self) -> String {
        if self.success {
            match &self.location {
                Some(location) => format!("uploaded {} chunk(s) to {location}", self.outcomes.len()),
                None => "nothing to upload: payload was empty".to_string(),
            }
        } else {
            match &self.error {
                Some(error) => format!(
                    "upload failed after {} of {} chunk(s): {error}",
                    self.count_in(ChunkState::Succeeded),
                    self.outcomes.len()
                ),
                None => "upload failed".to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn the_destination() -> StorageDestination {
        StorageDestination::new("bucket", "data", "events.csv")
    }

    #[test]
    fn the_one_where_bad_jobs_never_get_built() {
        let the_payload = || Payload::Bytes(Bytes::from_static(b"x"));
        let the_result = TransferJob::new(
            the_payload(),
            the_destination(),
            TransferOptions {
                chunk_size: 0,
                ..TransferOptions::default()
            },
        );
        assert_eq!(the_result.err(), Some(ConfigError::ZeroChunkSize));

        let the_result = TransferJob::new(
            the_payload(),
            the_destination(),
            TransferOptions {
                encryption: EncryptionMode::Kms { key_id: "  ".into() },
                ..TransferOptions::default()
            },
        );
        assert_eq!(the_result.err(), Some(ConfigError::MissingKmsKeyId));

        let the_result = TransferJob::new(
            the_payload(),
            StorageDestination::new("", "data", "events.csv"),
            TransferOptions::default(),
        );
        assert_eq!(the_result.err(), Some(ConfigError::Empty { field: "bucket" }));

        let the_result = TransferJob::new(
            the_payload(),
            the_destination(),
            TransferOptions {
                parallelism: 0,
                ..TransferOptions::default()
            },
        );
        assert_eq!(the_result.err(), Some(ConfigError::ZeroParallelism));
    }

    #[test]
    fn the_one_where_keys_grow_suffixes_only_when_needed() {
        let the_dest = the_destination();
        assert_eq!(the_dest.chunk_key(0, 1, Compression::None), "data/events.csv");
        assert_eq!(the_dest.chunk_key(0, 1, Compression::Gzip), "data/events.csv.gz");
        assert_eq!(the_dest.chunk_key(3, 12, Compression::None), "data/events.csv.part00003");
        assert_eq!(the_dest.chunk_key(3, 12, Compression::Gzip), "data/events.csv.part00003.gz");
        assert_eq!(the_dest.manifest_key(), "data/events.csv.manifest");
    }

    #[test]
    fn the_one_where_prefixes_get_exactly_one_slash() {
        assert_eq!(normalize_prefix("data"), "data/");
        assert_eq!(normalize_prefix("data//"), "data/");
        assert_eq!(normalize_prefix(""), "");
        assert_eq!(StorageLocation::new("b", "k/x.csv").uri(), "s3://b/k/x.csv");
    }
}

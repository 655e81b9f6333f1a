// ai
//! 🚀 ResilientUploader — chunks in, objects out, and an honest account of what happened.
//!
//! 🎬 COLD OPEN — EXT. US-EAST-1 — PEAK HOURS
//!
//! Chunk 3 got a 503. Chunk 3 waited, chunk 3 tried again, chunk 3 made it. Chunk 7
//! got a 403 and that was the end of the job, because no amount of waiting fixes a
//! bucket policy. Chunks 8 through 11 never left the laptop. The result says all of
//! that, in index order, every single time.
//!
//! 🧠 Knowledge graph:
//! - `prepare`: payload → bytes + header length + boundary mode (file read / CSV render).
//! - Planned chunks go into a bounded `async_channel`; `parallelism` workers drain it.
//! - Per chunk: `ensure_valid()` → `put_object()`, retried on transient errors only.
//! - A FAILED chunk (permanent or retry-exhausted) stops new chunks from starting.
//! - Cancellation is checked before each chunk starts. In-flight chunks finish.
//!   Whether the job counts as cancelled is read off the token once the workers are
//!   done, not off whichever worker happened to notice it first.
//! - After the workers are done, everything above the lowest FAILED index is reported
//!   PENDING. That makes the result independent of scheduling: parallelism 1 and
//!   parallelism 8 produce the same `TransferResult` for the same failures.

use std::collections::BTreeMap;
use std::io::Write;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Bytes, BytesMut};
use flate2::write::GzEncoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    Boundary, ChunkOutcome, ChunkState, Compression, Payload, StorageLocation, TransferChunker, TransferJob,
    TransferResult,
};
use crate::backends::{ObjectStoreClient, PutObject};
use crate::error::{AuthError, ErrorDetail, ErrorKind, PayloadError, StorageError};
use crate::identity::IdentityRefresher;
use crate::progress::TransferProgress;
use crate::retry::{BackoffPolicy, Retryable, retry_transient};

/// 🔧 Uploader-wide knobs. The retry *budget* comes from each job; the *pacing* lives here.
#[derive(Debug, Clone, Default)]
pub struct UploaderSettings {
    pub backoff: BackoffPolicy,
    pub show_progress: bool,
}

/// 🚀 Uploads `TransferJob`s through an `ObjectStoreClient`, one chunk at a time (or several).
#[derive(Debug, Clone)]
pub struct ResilientUploader {
    store: Arc<dyn ObjectStoreClient>,
    refresher: Arc<IdentityRefresher>,
    settings: UploaderSettings,
}

/// The payload, materialized and ready to slice.
struct Prepared {
    bytes: Bytes,
    /// The header line's bytes, when the payload has one.
    header: Option<Bytes>,
    boundary: Boundary,
}

/// One unit of work handed to a worker.
struct PlannedChunk {
    index: usize,
    range: Range<usize>,
    key: String,
}

/// Why a single put attempt did not land.
#[derive(Debug)]
enum AttemptFailure {
    Auth(AuthError),
    Storage(StorageError),
}

impl std::fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptFailure::Auth(err) => err.fmt(f),
            AttemptFailure::Storage(err) => err.fmt(f),
        }
    }
}

impl Retryable for AttemptFailure {
    fn is_transient(&self) -> bool {
        match self {
            // 🔐 the refresher already spent its own retry budget before giving up
            AttemptFailure::Auth(_) => false,
            AttemptFailure::Storage(err) => err.is_transient(),
        }
    }
}

impl From<&AttemptFailure> for ErrorDetail {
    fn from(failure: &AttemptFailure) -> Self {
        match failure {
            AttemptFailure::Auth(err) => err.into(),
            AttemptFailure::Storage(err) => err.into(),
        }
    }
}

impl ResilientUploader {
    pub fn new(store: Arc<dyn ObjectStoreClient>, refresher: Arc<IdentityRefresher>, settings: UploaderSettings) -> Self {
        Self {
            store,
            refresher,
            settings,
        }
    }

    pub async fn upload(&self, job: &TransferJob) -> TransferResult {
        self.upload_with_cancel(job, &CancellationToken::new()).await
    }

    /// 🎯 The whole show. Never panics, never returns `Err`: every failure ends up in the result.
    pub async fn upload_with_cancel(&self, job: &TransferJob, cancel: &CancellationToken) -> TransferResult {
        let the_destination = job.destination();
        let the_prepared = match prepare(job).await {
            Ok(prepared) => prepared,
            Err(err) => {
                error!(object = %the_destination.object_key(), "💀 could not prepare the payload: {err}");
                return TransferResult::failed_before_start((&err).into());
            }
        };
        let the_chunker = match TransferChunker::new(job.options().chunk_size) {
            Ok(chunker) => chunker.with_boundary(the_prepared.boundary.clone()),
            Err(err) => return TransferResult::failed_before_start((&err).into()),
        };

        let the_total_bytes = the_prepared.bytes.len();
        let the_chunks: Vec<_> = the_chunker.split(&the_prepared.bytes).collect();
        if the_chunks.is_empty() {
            info!(object = %the_destination.object_key(), "📭 empty payload, nothing to upload");
            return TransferResult {
                success: true,
                outcomes: BTreeMap::new(),
                error: None,
                location: None,
                manifest: None,
                cancelled: false,
                total_bytes: 0,
            };
        }

        let the_count = the_chunks.len();
        let the_workers = job.options().parallelism.min(the_count);
        info!(
            bucket = %the_destination.bucket,
            object = %the_destination.object_key(),
            chunks = the_count,
            bytes = the_total_bytes,
            workers = the_workers,
            "🚀 upload starting"
        );

        let (the_sender, the_receiver) = async_channel::bounded(the_count);
        for chunk in the_chunks {
            let the_key = the_destination.chunk_key(chunk.index, the_count, job.options().compression);
            // 📬 capacity == chunk count, so this never waits
            if the_sender
                .send(PlannedChunk {
                    index: chunk.index,
                    range: chunk.range,
                    key: the_key,
                })
                .await
                .is_err()
            {
                break;
            }
        }
        the_sender.close();

        let the_progress = TransferProgress::new(
            &StorageLocation::new(&the_destination.bucket, the_destination.object_key()).uri(),
            the_total_bytes as u64,
            self.settings.show_progress,
        );
        let the_stop = AtomicBool::new(false);
        let the_outcomes = parking_lot::Mutex::new(BTreeMap::new());

        let the_worker_loops = (0..the_workers).map(|worker| {
            let the_receiver = the_receiver.clone();
            let (the_prepared, the_progress) = (&the_prepared, &the_progress);
            let (the_stop, the_outcomes) = (&the_stop, &the_outcomes);
            async move {
                while let Ok(planned) = the_receiver.recv().await {
                    let the_outcome = if the_stop.load(Ordering::SeqCst) || cancel.is_cancelled() {
                        pending(planned)
                    } else {
                        let the_outcome = self.upload_chunk(job, the_prepared, planned).await;
                        match the_outcome.state {
                            ChunkState::Succeeded => the_progress.chunk_done(the_outcome.range.len() as u64),
                            _ => the_stop.store(true, Ordering::SeqCst),
                        }
                        the_outcome
                    };
                    the_outcomes.lock().insert(the_outcome.index, the_outcome);
                }
                debug!(worker, "🧵 upload worker drained");
            }
        });
        futures::future::join_all(the_worker_loops).await;

        let the_result = settle(
            the_outcomes.into_inner(),
            cancel.is_cancelled(),
            the_total_bytes,
            StorageLocation::new(
                &the_destination.bucket,
                if the_count == 1 {
                    the_destination.chunk_key(0, 1, job.options().compression)
                } else {
                    the_destination.object_key()
                },
            ),
        );
        the_progress.finish(&the_result.message());
        if the_result.success {
            info!(location = ?the_result.location, chunks = the_count, "✅ upload complete");
        } else {
            warn!(cancelled = the_result.cancelled, "💀 {}", the_result.message());
        }
        the_result
    }

    /// 📤 One chunk, start to finish, including its retries.
    async fn upload_chunk(&self, job: &TransferJob, prepared: &Prepared, planned: PlannedChunk) -> ChunkOutcome {
        let the_options = job.options();
        let the_body = match chunk_body(
            prepared,
            planned.index,
            &planned.range,
            the_options.compression,
            the_options.repeat_header,
        ) {
            Ok(body) => body,
            Err(err) => {
                return ChunkOutcome {
                    index: planned.index,
                    range: planned.range,
                    key: planned.key,
                    attempts: 0,
                    state: ChunkState::Failed,
                    error: Some(ErrorDetail::from(&err).for_chunk(planned.index)),
                };
            }
        };

        let the_policy = self.settings.backoff.clone().with_max_retries(the_options.max_retries);
        let the_what = format!("chunk {} ({})", planned.index, planned.key);
        let the_request = PutObject {
            bucket: job.destination().bucket.clone(),
            key: planned.key.clone(),
            body: the_body,
            encryption: the_options.encryption.clone(),
        };
        let the_index = planned.index;
        let the_outcome = retry_transient(&the_policy, &the_what, |attempt| {
            let the_request = the_request.clone();
            async move {
                debug!(chunk = the_index, attempt, key = %the_request.key, "📤 putting chunk");
                let the_session = self.refresher.ensure_valid().await.map_err(AttemptFailure::Auth)?;
                self.store
                    .put_object(&the_session, the_request)
                    .await
                    .map_err(AttemptFailure::Storage)
            }
        })
        .await;

        match the_outcome.result {
            Ok(()) => ChunkOutcome {
                index: planned.index,
                range: planned.range,
                key: planned.key,
                attempts: the_outcome.attempts,
                state: ChunkState::Succeeded,
                error: None,
            },
            Err(failure) => {
                error!(chunk = planned.index, attempts = the_outcome.attempts, key = %planned.key, "💀 chunk failed: {failure}");
                ChunkOutcome {
                    index: planned.index,
                    range: planned.range,
                    key: planned.key,
                    attempts: the_outcome.attempts,
                    state: ChunkState::Failed,
                    error: Some(ErrorDetail::from(&failure).for_chunk(planned.index)),
                }
            }
        }
    }
}

fn pending(planned: PlannedChunk) -> ChunkOutcome {
    ChunkOutcome {
        index: planned.index,
        range: planned.range,
        key: planned.key,
        attempts: 0,
        state: ChunkState::Pending,
        error: None,
    }
}

/// ⚖️ Turns raw worker outcomes into the one canonical result.
fn settle(
    mut outcomes: BTreeMap<usize, ChunkOutcome>,
    cancelled: bool,
    total_bytes: usize,
    location: StorageLocation,
) -> TransferResult {
    let the_first_failure = outcomes
        .values()
        .find(|outcome| outcome.state == ChunkState::Failed)
        .map(|outcome| outcome.index);

    if let Some(first) = the_first_failure {
        for outcome in outcomes.range_mut(first + 1..).map(|(_, outcome)| outcome) {
            if outcome.state == ChunkState::Succeeded {
                // 👻 already in the bucket, but the job failed: nothing will ever load it
                warn!(chunk = outcome.index, key = %outcome.key, "👻 chunk landed after an earlier failure and is now orphaned");
            }
            outcome.state = ChunkState::Pending;
            outcome.attempts = 0;
            outcome.error = None;
        }
    }

    let the_success = outcomes.values().all(|outcome| outcome.state == ChunkState::Succeeded);
    let the_error = match the_first_failure {
        Some(first) => outcomes.get(&first).and_then(|outcome| outcome.error.clone()),
        None if !the_success && cancelled => Some(ErrorDetail::new(
            ErrorKind::Cancelled,
            "transfer cancelled before every chunk was started",
        )),
        None if !the_success => Some(ErrorDetail::new(ErrorKind::Internal, "transfer ended with unfinished chunks")),
        None => None,
    };
    TransferResult {
        success: the_success,
        outcomes,
        error: the_error,
        location: the_success.then_some(location),
        manifest: None,
        cancelled: cancelled && !the_success,
        total_bytes,
    }
}

/// 📥 Materializes the payload into bytes, noting where the header ends and how cuts may land.
async fn prepare(job: &TransferJob) -> Result<Prepared, PayloadError> {
    let the_header_row = job.options().header_row;
    match job.payload() {
        Payload::Bytes(bytes) => Ok(raw_payload(bytes.clone(), the_header_row)),
        Payload::File(path) => {
            let the_bytes = tokio::fs::read(path).await.map_err(|source| PayloadError::Read {
                path: path.display().to_string(),
                source,
            })?;
            Ok(raw_payload(Bytes::from(the_bytes), the_header_row))
        }
        Payload::Table(table) => {
            let the_csv = table.to_csv();
            let the_bytes = Bytes::from(the_csv.bytes);
            Ok(Prepared {
                header: Some(the_bytes.slice(..the_csv.header_len)),
                bytes: the_bytes,
                boundary: Boundary::Offsets(the_csv.row_cuts),
            })
        }
    }
}

fn raw_payload(bytes: Bytes, header_row: bool) -> Prepared {
    if !header_row {
        return Prepared {
            bytes,
            header: None,
            boundary: Boundary::Bytes,
        };
    }
    let the_header_end = memchr::memchr(b'\n', &bytes).map_or(bytes.len(), |pos| pos + 1);
    Prepared {
        header: Some(bytes.slice(..the_header_end)),
        bytes,
        boundary: Boundary::Lines,
    }
}

/// 🧱 The bytes that actually go over the wire for one chunk.
fn chunk_body(
    prepared: &Prepared,
    index: usize,
    range: &Range<usize>,
    compression: Compression,
    repeat_header: bool,
) -> Result<Bytes, PayloadError> {
    let the_slice = prepared.bytes.slice(range.clone());
    let the_header = match &prepared.header {
        Some(header) if repeat_header && index > 0 => Some(header),
        _ => None,
    };
    match compression {
        Compression::None => match the_header {
            None => Ok(the_slice),
            Some(header) => {
                let mut the_body = BytesMut::with_capacity(header.len() + the_slice.len());
                the_body.extend_from_slice(header);
                the_body.extend_from_slice(&the_slice);
                Ok(the_body.freeze())
            }
        },
        Compression::Gzip => {
            let mut the_encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
            if let Some(header) = the_header {
                the_encoder.write_all(header).map_err(PayloadError::Compress)?;
            }
            the_encoder.write_all(&the_slice).map_err(PayloadError::Compress)?;
            the_encoder.finish().map(Bytes::from).map_err(PayloadError::Compress)
        }
    }
}

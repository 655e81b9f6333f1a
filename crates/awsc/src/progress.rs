// AI
//! 📊 Progress — a bar while the chunks fly, a table once they've landed.
//!
//! 🎬 COLD OPEN — INT. TERMINAL — A CURSOR BLINKS
//!
//! Forty chunks. Eight workers. One human staring at a terminal wondering if
//! anything is happening. This module exists so the answer is visibly "yes".
//!
//! 🧠 Knowledge graph:
//! - `TransferProgress`: indicatif bar over payload bytes, plus a rolling rate window.
//!   Hidden unless asked for, so library callers and tests stay quiet.
//! - `render_summary`: comfy-table rendering of a `TransferResult`, one row per chunk.
//! - All methods take `&self`; workers share one `TransferProgress` without ceremony.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::Mutex;

use crate::transfer::{ChunkState, TransferResult};

const MIB: u64 = 1024 * 1024;
const RATE_WINDOW: Duration = Duration::from_secs(5);

/// 📏 Human-sized bytes. Units follow the magnitude of the number itself.
pub fn format_bytes(bytes: u64) -> String {
    if bytes >= MIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= 1024 {
        format!("{:.2} KiB", bytes as f64 / 1024.0)
    } else {
        format!("{bytes} bytes")
    }
}

fn format_duration(duration: Duration) -> String {
    let the_secs = duration.as_secs();
    let (hours, minutes, seconds) = (the_secs / 3600, (the_secs % 3600) / 60, the_secs % 60);
    if hours > 0 {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes:02}:{seconds:02}")
    }
}

#[derive(Debug)]
struct Tally {
    bytes: u64,
    chunks: u64,
    /// (when, bytes at that moment) — trimmed to `RATE_WINDOW`
    samples: VecDeque<(Instant, u64)>,
}

/// 🚥 Byte-level progress for one transfer.
pub struct TransferProgress {
    bar: ProgressBar,
    total_bytes: u64,
    started: Instant,
    tally: Mutex<Tally>,
}

impl std::fmt::Debug for TransferProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferProgress")
            .field("total_bytes", &self.total_bytes)
            .field("visible", &!self.bar.is_hidden())
            .finish()
    }
}

impl TransferProgress {
    /// 🎬 `visible = false` gives a hidden bar that still counts.
    pub fn new(label: &str, total_bytes: u64, visible: bool) -> Self {
        let the_bar = if visible {
            ProgressBar::new(total_bytes)
        } else {
            ProgressBar::hidden()
        };
        if let Ok(style) = ProgressStyle::with_template("{msg}\n| [{bar:40.cyan/blue}] {percent:>3}%") {
            the_bar.set_style(style.progress_chars("=>-"));
        }
        the_bar.set_length(total_bytes);
        the_bar.set_message(format!("🚚 {label}"));
        let the_now = Instant::now();
        Self {
            bar: the_bar,
            total_bytes,
            started: the_now,
            tally: Mutex::new(Tally {
                bytes: 0,
                chunks: 0,
                samples: VecDeque::from([(the_now, 0)]),
            }),
        }
    }

    /// ➕ A chunk of `bytes` just landed.
    pub fn chunk_done(&self, bytes: u64) {
        let the_now = Instant::now();
        let mut the_tally = self.tally.lock();
        the_tally.bytes += bytes;
        the_tally.chunks += 1;
        while let Some(&(at, _)) = the_tally.samples.front() {
            if the_now.duration_since(at) > RATE_WINDOW {
                the_tally.samples.pop_front();
            } else {
                break;
            }
        }
        let the_current = the_tally.bytes;
        the_tally.samples.push_back((the_now, the_current));
        let the_rate = the_tally
            .samples
            .front()
            .map(|&(at, start_bytes)| {
                let the_elapsed = the_now.duration_since(at).as_secs_f64();
                if the_elapsed > 0.0 {
                    (the_current.saturating_sub(start_bytes)) as f64 / the_elapsed / MIB as f64
                } else {
                    0.0
                }
            })
            .unwrap_or(0.0);
        self.bar.set_position(the_current);
        self.bar.set_message(format!(
            "🚚 {} chunk(s) | {} / {} | {the_rate:.2} MiB/s | {} elapsed",
            the_tally.chunks,
            format_bytes(the_current),
            format_bytes(self.total_bytes),
            format_duration(self.started.elapsed())
        ));
    }

    pub fn bytes_done(&self) -> u64 {
        self.tally.lock().bytes
    }

    pub fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }
}

/// 🧾 One row per chunk: index, key, state, attempts, error. Plus a verdict line on top.
pub fn render_summary(result: &TransferResult) -> String {
    let mut the_table = Table::new();
    the_table.load_preset(UTF8_FULL_CONDENSED);
    the_table.set_content_arrangement(ContentArrangement::Dynamic);
    the_table.set_header(vec!["#", "key", "bytes", "state", "attempts", "error"]);
    for outcome in result.outcomes.values() {
        let the_state = match outcome.state {
            ChunkState::Succeeded => format!("✅ {}", outcome.state),
            ChunkState::Failed => format!("💀 {}", outcome.state),
            _ => format!("⏸️ {}", outcome.state),
        };
        the_table.add_row(vec![
            Cell::new(outcome.index).set_alignment(CellAlignment::Right),
            Cell::new(&outcome.key),
            Cell::new(format_bytes(outcome.range.len() as u64)).set_alignment(CellAlignment::Right),
            Cell::new(the_state),
            Cell::new(outcome.attempts).set_alignment(CellAlignment::Right),
            Cell::new(outcome.error.as_ref().map(|e| e.message.as_str()).unwrap_or("")),
        ]);
    }
    format!("{}\n{the_table}", result.message())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorDetail, ErrorKind};
    use crate::transfer::ChunkOutcome;
    use std::collections::BTreeMap;

    #[test]
    fn the_one_where_bytes_get_sensible_units() {
        assert_eq!(format_bytes(512), "512 bytes");
        assert_eq!(format_bytes(2048), "2.00 KiB");
        assert_eq!(format_bytes(3 * MIB), "3.00 MiB");
        assert_eq!(format_duration(Duration::from_secs(3725)), "01:02:05");
        assert_eq!(format_duration(Duration::from_secs(65)), "01:05");
    }

    #[test]
    fn the_one_where_a_hidden_bar_still_keeps_score() {
        let the_progress = TransferProgress::new("s3://b/k", 300, false);
        the_progress.chunk_done(100);
        the_progress.chunk_done(200);
        assert_eq!(the_progress.bytes_done(), 300);
        the_progress.finish("done");
    }

    #[test]
    fn the_one_where_the_summary_names_the_broken_chunk() {
        let mut the_outcomes = BTreeMap::new();
        the_outcomes.insert(
            0,
            ChunkOutcome {
                index: 0,
                range: 0..10,
                key: "data/x.csv.part00000".into(),
                attempts: 1,
                state: ChunkState::Succeeded,
                error: None,
            },
        );
        the_outcomes.insert(
            1,
            ChunkOutcome {
                index: 1,
                range: 10..20,
                key: "data/x.csv.part00001".into(),
                attempts: 1,
                state: ChunkState::Failed,
                error: Some(ErrorDetail::new(ErrorKind::Storage, "AccessDenied").for_chunk(1)),
            },
        );
        let the_result = TransferResult {
            success: false,
            outcomes: the_outcomes,
            error: Some(ErrorDetail::new(ErrorKind::Storage, "AccessDenied").for_chunk(1)),
            location: None,
            manifest: None,
            cancelled: false,
            total_bytes: 20,
        };
        let the_summary = render_summary(&the_result);
        assert!(the_summary.contains("data/x.csv.part00001"));
        assert!(the_summary.contains("FAILED"));
        assert!(the_summary.contains("AccessDenied"));
        assert!(the_summary.starts_with("upload failed after 1 of 2 chunk(s)"));
    }
}

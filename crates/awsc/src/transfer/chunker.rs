// ai
//! ✂️ TransferChunker — payload bytes in, disjoint ordered ranges out.
//!
//! 🧠 The laws, which every boundary mode obeys:
//! - indices start at 0 and go up by one
//! - ranges are contiguous, disjoint, and cover `0..len` exactly
//! - the last chunk takes the remainder
//! - an empty payload yields nothing at all
//! - splitting twice yields the same sequence (no hidden state outside the iterator)
//!
//! No I/O. No allocation per chunk beyond the `Chunk` itself. The iterator borrows the payload.
//!
//! 🎬 *[a 5 GB CSV. a 64 MB window. the chunker looks for the last newline inside the
//! window, cuts there, and moves on. no line was harmed in the making of this upload.]*
//!
//! Boundary modes:
//! - `Bytes`: cut at exactly `chunk_size`. Fine for opaque blobs, bad for anything COPY reads.
//! - `Lines`: cut after the last `\n` inside the window. A line fatter than the window
//!   stretches its chunk to the next `\n` instead of being split.
//! - `Offsets`: cut only at the row ends a `Table` reported. Same stretching rule.

use std::sync::Arc;

use memchr::{memchr, memrchr};

use super::{Chunk, ChunkState};
use crate::error::ConfigError;

/// 📐 Where a cut is allowed to land.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Boundary {
    /// Anywhere. Chunks are exactly `chunk_size` bytes except the last.
    #[default]
    Bytes,
    /// Just after a `\n`. Cuts snap back to the last newline inside the window, or
    /// forward to the next one when a single line is longer than the window.
    Lines,
    /// Only at these offsets, which must be sorted and strictly increasing (cuts are
    /// found by binary search). Used for CSV rows whose quoted fields may contain
    /// newlines of their own.
    Offsets(Arc<[usize]>),
}

/// ✂️ The splitter. Cheap to build, cheap to clone, reusable across payloads.
#[derive(Debug, Clone)]
pub struct TransferChunker {
    chunk_size: usize,
    boundary: Boundary,
}

impl TransferChunker {
    pub fn new(chunk_size: usize) -> Result<Self, ConfigError> {
        if chunk_size == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }
        Ok(Self {
            chunk_size,
            boundary: Boundary::Bytes,
        })
    }

    pub fn with_boundary(mut self, boundary: Boundary) -> Self {
        self.boundary = boundary;
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// 🔪 Lazily splits `payload`. Nothing happens until you iterate.
    pub fn split<'a>(&'a self, payload: &'a [u8]) -> Chunks<'a> {
        Chunks {
            payload,
            chunk_size: self.chunk_size,
            boundary: &self.boundary,
            cursor: 0,
            next_index: 0,
        }
    }
}

/// 🧩 The lazy chunk sequence. `Clone` it to restart from the same point.
#[derive(Debug, Clone)]
pub struct Chunks<'a> {
    payload: &'a [u8],
    chunk_size: usize,
    boundary: &'a Boundary,
    cursor: usize,
    next_index: usize,
}

impl Chunks<'_> {
    /// End of the chunk starting at `self.cursor`. Always `> cursor` and `<= len`.
    fn next_cut(&self) -> usize {
        let the_len = self.payload.len();
        let the_window_end = self.cursor.saturating_add(self.chunk_size);
        if the_window_end >= the_len {
            return the_len;
        }
        match self.boundary {
            Boundary::Bytes => the_window_end,
            Boundary::Lines => {
                let the_window = &self.payload[self.cursor..the_window_end];
                match memrchr(b'\n', the_window) {
                    Some(pos) => self.cursor + pos + 1,
                    // 🐘 one line fatter than the window: the chunk grows to fit it
                    None => match memchr(b'\n', &self.payload[the_window_end..]) {
                        Some(pos) => the_window_end + pos + 1,
                        None => the_len,
                    },
                }
            }
            Boundary::Offsets(offsets) => {
                // 🔍 two binary searches per chunk, the offsets are sorted
                let the_past_cursor = offsets.partition_point(|offset| *offset <= self.cursor);
                let the_past_window = offsets.partition_point(|offset| *offset <= the_window_end);
                if the_past_window > the_past_cursor {
                    offsets[the_past_window - 1]
                } else {
                    // 🐘 one row fatter than the window: stretch to the next allowed cut
                    offsets
                        .get(the_past_window)
                        .copied()
                        .filter(|offset| *offset < the_len)
                        .unwrap_or(the_len)
                }
            }
        }
    }
}

impl Iterator for Chunks<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.cursor >= self.payload.len() {
            return None;
        }
        let the_end = self.next_cut();
        let the_chunk = Chunk {
            index: self.next_index,
            range: self.cursor..the_end,
            attempts: 0,
            state: ChunkState::Pending,
        };
        self.cursor = the_end;
        self.next_index += 1;
        Some(the_chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ranges(chunker: &TransferChunker, payload: &[u8]) -> Vec<std::ops::Range<usize>> {
        chunker.split(payload).map(|chunk| chunk.range).collect()
    }

    #[test]
    fn the_one_where_250_bytes_become_three_chunks() {
        let the_payload = vec![7u8; 250];
        let the_chunker = TransferChunker::new(100).expect("💀 valid size");
        let the_chunks: Vec<Chunk> = the_chunker.split(&the_payload).collect();
        assert_eq!(the_chunks.len(), 3);
        assert_eq!(the_chunks[0].range, 0..100);
        assert_eq!(the_chunks[1].range, 100..200);
        assert_eq!(the_chunks[2].range, 200..250);
        assert!(the_chunks.iter().enumerate().all(|(i, c)| c.index == i));
        assert!(the_chunks.iter().all(|c| c.state == ChunkState::Pending && c.attempts == 0));
    }

    #[test]
    fn the_one_where_nothing_splits_into_nothing() {
        let the_chunker = TransferChunker::new(100).expect("💀 valid size");
        assert_eq!(the_chunker.split(&[]).count(), 0);
    }

    #[test]
    fn the_one_where_zero_sized_chunks_are_refused() {
        assert_eq!(TransferChunker::new(0).err(), Some(ConfigError::ZeroChunkSize));
    }

    #[test]
    fn the_one_where_splitting_twice_tells_the_same_story() {
        let the_payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let the_chunker = TransferChunker::new(64).expect("💀 valid size");
        let the_iter = the_chunker.split(&the_payload);
        let the_first: Vec<Chunk> = the_iter.clone().collect();
        let the_second: Vec<Chunk> = the_iter.collect();
        assert_eq!(the_first, the_second);
        assert_eq!(the_first, the_chunker.split(&the_payload).collect::<Vec<_>>());
    }

    #[test]
    fn the_one_where_lines_are_never_cut_in_half() {
        let the_payload = b"id,name\n1,alpha\n2,beta\n3,gamma\n";
        let the_chunker = TransferChunker::new(12)
            .expect("💀 valid size")
            .with_boundary(Boundary::Lines);
        let the_ranges = ranges(&the_chunker, the_payload);
        assert_eq!(the_ranges, vec![0..8, 8..16, 16..23, 23..31]);
        for range in &the_ranges {
            assert_eq!(the_payload[range.end - 1], b'\n');
        }
    }

    #[test]
    fn the_one_where_a_chonky_line_gets_a_chunk_to_itself() {
        let the_payload = b"a\nthis-line-is-way-longer-than-the-window\nb\n";
        let the_chunker = TransferChunker::new(8)
            .expect("💀 valid size")
            .with_boundary(Boundary::Lines);
        let the_ranges = ranges(&the_chunker, the_payload);
        assert_eq!(the_ranges, vec![0..2, 2..42, 42..44]);
    }

    #[test]
    fn the_one_where_cuts_only_land_on_allowed_offsets() {
        let the_payload = vec![b'x'; 100];
        let the_offsets: Arc<[usize]> = Arc::from(vec![10, 25, 40, 90]);
        let the_chunker = TransferChunker::new(30)
            .expect("💀 valid size")
            .with_boundary(Boundary::Offsets(the_offsets));
        assert_eq!(ranges(&the_chunker, &the_payload), vec![0..25, 25..40, 40..90, 90..100]);
    }

    #[test]
    fn the_one_where_fat_rows_and_stray_offsets_are_handled() {
        let the_payload = vec![b'x'; 100];
        // 🎯 no cut fits the first window; 100 and 150 sit at or past the end and are ignored
        let the_offsets: Arc<[usize]> = Arc::from(vec![45, 50, 100, 150]);
        let the_chunker = TransferChunker::new(20)
            .expect("💀 valid size")
            .with_boundary(Boundary::Offsets(the_offsets));
        assert_eq!(ranges(&the_chunker, &the_payload), vec![0..45, 45..50, 50..100]);
    }

    #[test]
    fn the_one_where_a_hundred_thousand_rows_split_in_one_pass() {
        let the_rows = 100_000usize;
        let the_payload = vec![b'x'; the_rows * 10];
        let the_offsets: Arc<[usize]> = Arc::from((1..the_rows).map(|row| row * 10).collect::<Vec<_>>());
        let the_chunker = TransferChunker::new(25)
            .expect("💀 valid size")
            .with_boundary(Boundary::Offsets(the_offsets));
        let the_chunks: Vec<Chunk> = the_chunker.split(&the_payload).collect();
        assert_eq!(the_chunks.len(), the_rows / 2);
        assert!(the_chunks.iter().all(|chunk| chunk.len() == 20));
    }

    fn boundary_strategy() -> impl Strategy<Value = Boundary> {
        prop_oneof![
            Just(Boundary::Bytes),
            Just(Boundary::Lines),
            proptest::collection::btree_set(1usize..2048, 0..40)
                .prop_map(|set| Boundary::Offsets(Arc::from(set.into_iter().collect::<Vec<_>>()))),
        ]
    }

    proptest! {
        #[test]
        fn the_one_where_every_byte_comes_home(
            payload in proptest::collection::vec(prop_oneof![Just(b'\n'), any::<u8>()], 0..2048),
            chunk_size in 1usize..300,
            boundary in boundary_strategy(),
        ) {
            let the_chunker = TransferChunker::new(chunk_size).expect("💀 valid size").with_boundary(boundary);
            let the_chunks: Vec<Chunk> = the_chunker.split(&payload).collect();

            let mut the_reassembled = Vec::with_capacity(payload.len());
            let mut the_expected_start = 0;
            for (i, chunk) in the_chunks.iter().enumerate() {
                prop_assert_eq!(chunk.index, i);
                prop_assert_eq!(chunk.range.start, the_expected_start);
                prop_assert!(!chunk.is_empty());
                the_reassembled.extend_from_slice(&payload[chunk.range.clone()]);
                the_expected_start = chunk.range.end;
            }
            prop_assert_eq!(the_reassembled, payload.clone());
            prop_assert_eq!(the_chunks.is_empty(), payload.is_empty());
        }
    }
}

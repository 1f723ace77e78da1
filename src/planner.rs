// SionDL - Resumable Concurrent Download Engine
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Byte-range planning
//!
//! Given a total size and the caller's strategy, the planner computes the
//! non-overlapping ranges the worker pool downloads in parallel. The produced
//! ranges always partition `[0, fileSize)` with no gaps or overlaps:
//!
//! - `Full`/`File`: one sequential range, never split across threads.
//! - `Piece`: fixed-size pieces of `pieceSizeBytes`, last one smaller.
//! - `Multithread`: `min(ceil(size / pieceSize), threads)` ranges — full
//!   thread utilization without over-fragmenting small files.
//! - `Mandatory`: exactly `threads` ranges regardless of piece size.
//!
//! An unknown total size (0) always degrades to a single open-ended range.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};

/// Strategy used to split a download into independent byte ranges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanMethod {
    /// Single sequential stream, one `Range: bytes=completed-` request
    Full,
    /// Fixed-size pieces of `pieceSizeBytes`
    Piece,
    /// Piece-bounded split capped at the thread count
    Multithread,
    /// Exactly `threadCount` ranges, piece size ignored
    Mandatory,
    /// Local-source transfer; planned like `Full`
    File,
}

impl PlanMethod {
    /// Whether this method streams one open-ended range instead of bounded ones
    pub fn is_sequential(&self) -> bool {
        matches!(self, PlanMethod::Full | PlanMethod::File)
    }
}

/// A half-open byte range `[start, end)` of the target file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub start: u64,
    /// Exclusive end offset; 0 together with `start == 0` means "unknown size"
    pub end: u64,
}

impl ChunkRange {
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn ceil_div(a: u64, b: u64) -> u64 {
    (a + b - 1) / b
}

/// Split `[0, size)` into `count` ranges of `ceil(size / count)` bytes each
fn split_even(size: u64, count: u64) -> Vec<ChunkRange> {
    let chunk_size = ceil_div(size, count);
    let mut ranges = Vec::with_capacity(count as usize);
    let mut start = 0u64;
    while start < size {
        let end = (start + chunk_size).min(size);
        ranges.push(ChunkRange { start, end });
        start = end;
    }
    ranges
}

/// Compute the download plan for the given size and strategy.
///
/// `file_size == 0` (unknown) forces a single open-ended range regardless of
/// the requested method. `Mandatory` plans where a range would be empty are
/// rejected up front rather than silently producing zero-byte work.
pub fn plan(
    file_size: u64,
    method: PlanMethod,
    thread_count: usize,
    piece_size_bytes: u64,
) -> Result<Vec<ChunkRange>> {
    if thread_count == 0 {
        return Err(EngineError::InvalidThreadCount(0));
    }

    if file_size == 0 || method.is_sequential() {
        return Ok(vec![ChunkRange {
            start: 0,
            end: file_size,
        }]);
    }

    match method {
        PlanMethod::Piece => {
            if piece_size_bytes == 0 {
                return Err(EngineError::Configuration(
                    "piece size must be positive for piece planning".to_string(),
                ));
            }
            let mut ranges = Vec::new();
            let mut start = 0u64;
            while start < file_size {
                let end = (start + piece_size_bytes).min(file_size);
                ranges.push(ChunkRange { start, end });
                start = end;
            }
            Ok(ranges)
        }
        PlanMethod::Multithread => {
            if piece_size_bytes == 0 {
                return Err(EngineError::Configuration(
                    "piece size must be positive for multithread planning".to_string(),
                ));
            }
            let count = ceil_div(file_size, piece_size_bytes).min(thread_count as u64);
            Ok(split_even(file_size, count.max(1)))
        }
        PlanMethod::Mandatory => {
            // Minimum-chunk-size floor: every range must hold at least one byte.
            if file_size < thread_count as u64 {
                return Err(EngineError::Configuration(format!(
                    "mandatory plan needs at least {} bytes for {} threads, got {}",
                    thread_count, thread_count, file_size
                )));
            }
            Ok(split_even(file_size, thread_count as u64))
        }
        PlanMethod::Full | PlanMethod::File => unreachable!("handled above"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    fn assert_partition(ranges: &[ChunkRange], file_size: u64) {
        assert!(!ranges.is_empty());
        assert_eq!(ranges[0].start, 0);
        assert_eq!(ranges.last().unwrap().end, file_size);
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].end, pair[1].start, "gap or overlap in {:?}", pair);
        }
        for r in ranges {
            assert!(!r.is_empty(), "empty range {:?}", r);
        }
    }

    #[test]
    fn test_full_is_single_range() {
        let ranges = plan(10 * MIB, PlanMethod::Full, 8, MIB).unwrap();
        assert_eq!(ranges, vec![ChunkRange { start: 0, end: 10 * MIB }]);
    }

    #[test]
    fn test_unknown_size_forces_single_open_range() {
        for method in [
            PlanMethod::Piece,
            PlanMethod::Multithread,
            PlanMethod::Mandatory,
        ] {
            let ranges = plan(0, method, 4, MIB).unwrap();
            assert_eq!(ranges, vec![ChunkRange { start: 0, end: 0 }]);
        }
    }

    #[test]
    fn test_piece_plan_sizes() {
        let ranges = plan(10 * MIB + 3, PlanMethod::Piece, 4, 4 * MIB).unwrap();
        assert_partition(&ranges, 10 * MIB + 3);
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges[0].len(), 4 * MIB);
        assert_eq!(ranges[1].len(), 4 * MIB);
        assert_eq!(ranges[2].len(), 2 * MIB + 3);
    }

    #[test]
    fn test_multithread_worked_example() {
        // 10 MiB, 1 MiB pieces, 4 threads: min(10, 4) = 4 ranges of 2.5 MiB.
        let ranges = plan(10 * MIB, PlanMethod::Multithread, 4, MIB).unwrap();
        assert_partition(&ranges, 10 * MIB);
        assert_eq!(ranges.len(), 4);
        for r in &ranges {
            assert_eq!(r.len(), 2621440);
        }
    }

    #[test]
    fn test_multithread_does_not_over_fragment_small_files() {
        let ranges = plan(3 * MIB, PlanMethod::Multithread, 16, 2 * MIB).unwrap();
        assert_partition(&ranges, 3 * MIB);
        // ceil(3 MiB / 2 MiB) = 2 pieces, well under the thread count.
        assert_eq!(ranges.len(), 2);
    }

    #[test]
    fn test_mandatory_exact_thread_count() {
        let ranges = plan(10 * MIB, PlanMethod::Mandatory, 7, MIB).unwrap();
        assert_partition(&ranges, 10 * MIB);
        assert_eq!(ranges.len(), 7);
    }

    #[test]
    fn test_mandatory_rejects_zero_byte_chunks() {
        let err = plan(3, PlanMethod::Mandatory, 4, MIB).unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[test]
    fn test_partition_invariant_exhaustive_small() {
        for file_size in 1..=64u64 {
            for piece in 1..=9u64 {
                for threads in 1..=6usize {
                    for method in [PlanMethod::Piece, PlanMethod::Multithread] {
                        let ranges = plan(file_size, method, threads, piece).unwrap();
                        assert_partition(&ranges, file_size);
                    }
                    if file_size >= threads as u64 {
                        let ranges =
                            plan(file_size, PlanMethod::Mandatory, threads, piece).unwrap();
                        assert_partition(&ranges, file_size);
                    }
                }
            }
        }
    }

    #[test]
    fn test_zero_threads_rejected() {
        assert!(matches!(
            plan(MIB, PlanMethod::Multithread, 0, MIB),
            Err(EngineError::InvalidThreadCount(0))
        ));
    }
}

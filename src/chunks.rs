//! Byte-range chunks and the immutable table resolving cursor positions to
//! chunk start offsets.
//!
//! Chunk lists are produced externally (BAI/CSI index + region planner) and
//! arrive pre-sorted, pre-merged, and non-overlapping. Gaps between chunks
//! are permitted; they cover uninteresting regions of the file.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// A half-open byte range `[start, end)` in the remote resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub start: u64,
    pub end: u64,
}

impl Chunk {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn contains(&self, pos: u64) -> bool {
        pos >= self.start && pos < self.end
    }
}

/// Sorted, non-overlapping chunk table; built once per slicing run.
#[derive(Debug, Clone)]
pub struct ChunkTable {
    chunks: Vec<Chunk>,
}

impl ChunkTable {
    /// Validate and build a table from an externally planned chunk list.
    ///
    /// Merging and padding are the planner's responsibility; this only
    /// rejects lists that are unordered, overlapping, or contain empty
    /// chunks.
    pub fn new(chunks: Vec<Chunk>) -> Result<Self> {
        for (i, chunk) in chunks.iter().enumerate() {
            if chunk.is_empty() {
                return Err(Error::InvalidChunkList(format!(
                    "chunk {} is empty: {}..{}",
                    i, chunk.start, chunk.end
                )));
            }
            if i > 0 && chunk.start < chunks[i - 1].end {
                return Err(Error::InvalidChunkList(format!(
                    "chunk {} ({}..{}) overlaps or is unordered relative to {}..{}",
                    i,
                    chunk.start,
                    chunk.end,
                    chunks[i - 1].start,
                    chunks[i - 1].end
                )));
            }
        }
        Ok(Self { chunks })
    }

    /// The chunk with the greatest start offset `<= pos`.
    pub fn floor(&self, pos: u64) -> Result<Chunk> {
        let idx = self.chunks.partition_point(|c| c.start <= pos);
        if idx == 0 {
            return Err(Error::PositionOutOfRange(pos));
        }
        Ok(self.chunks[idx - 1])
    }

    /// Start offset of the chunk with the greatest start `<= pos`.
    pub fn floor_offset(&self, pos: u64) -> Result<u64> {
        self.floor(pos).map(|c| c.start)
    }

    /// Up to `n` chunk start offsets strictly greater than `from`, ascending.
    /// Used for prefetch planning.
    pub fn next_offsets(&self, from: u64, n: usize) -> Vec<u64> {
        let idx = self.chunks.partition_point(|c| c.start <= from);
        self.chunks[idx..].iter().take(n).map(|c| c.start).collect()
    }

    /// Exact lookup by chunk start offset.
    pub fn get(&self, start: u64) -> Option<Chunk> {
        self.chunks
            .binary_search_by_key(&start, |c| c.start)
            .ok()
            .map(|i| self.chunks[i])
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> ChunkTable {
        ChunkTable::new(vec![
            Chunk::new(0, 100),
            Chunk::new(100, 200),
            Chunk::new(500, 600),
        ])
        .unwrap()
    }

    #[test]
    fn test_build_rejects_overlap() {
        let result = ChunkTable::new(vec![Chunk::new(0, 100), Chunk::new(50, 150)]);
        assert!(matches!(result, Err(Error::InvalidChunkList(_))));
    }

    #[test]
    fn test_build_rejects_unordered() {
        let result = ChunkTable::new(vec![Chunk::new(100, 200), Chunk::new(0, 100)]);
        assert!(matches!(result, Err(Error::InvalidChunkList(_))));
    }

    #[test]
    fn test_build_rejects_empty_chunk() {
        let result = ChunkTable::new(vec![Chunk::new(10, 10)]);
        assert!(matches!(result, Err(Error::InvalidChunkList(_))));
    }

    #[test]
    fn test_build_accepts_adjacent_and_gapped() {
        assert!(ChunkTable::new(vec![Chunk::new(0, 100), Chunk::new(100, 200)]).is_ok());
        assert!(ChunkTable::new(vec![Chunk::new(0, 100), Chunk::new(500, 600)]).is_ok());
        assert!(ChunkTable::new(vec![]).is_ok());
    }

    #[test]
    fn test_floor_offset() {
        let table = table();
        assert_eq!(table.floor_offset(0).unwrap(), 0);
        assert_eq!(table.floor_offset(99).unwrap(), 0);
        assert_eq!(table.floor_offset(100).unwrap(), 100);
        assert_eq!(table.floor_offset(450).unwrap(), 100);
        assert_eq!(table.floor_offset(550).unwrap(), 500);
        assert_eq!(table.floor_offset(10_000).unwrap(), 500);
    }

    #[test]
    fn test_floor_offset_before_first_chunk() {
        let table = ChunkTable::new(vec![Chunk::new(100, 200)]).unwrap();
        assert!(matches!(
            table.floor_offset(50),
            Err(Error::PositionOutOfRange(50))
        ));
    }

    #[test]
    fn test_floor_offset_empty_table() {
        let table = ChunkTable::new(vec![]).unwrap();
        assert!(matches!(
            table.floor_offset(0),
            Err(Error::PositionOutOfRange(0))
        ));
    }

    #[test]
    fn test_next_offsets() {
        let table = table();
        assert_eq!(table.next_offsets(0, 10), vec![100, 500]);
        assert_eq!(table.next_offsets(0, 1), vec![100]);
        assert_eq!(table.next_offsets(100, 10), vec![500]);
        assert_eq!(table.next_offsets(500, 10), Vec::<u64>::new());
        // Strictly greater: an offset between chunks skips to the next start.
        assert_eq!(table.next_offsets(250, 10), vec![500]);
    }

    #[test]
    fn test_get_exact() {
        let table = table();
        assert_eq!(table.get(100), Some(Chunk::new(100, 200)));
        assert_eq!(table.get(101), None);
    }

    #[test]
    fn test_chunk_list_deserializes() {
        let json = r#"[{"start":0,"end":100},{"start":100,"end":200}]"#;
        let chunks: Vec<Chunk> = serde_json::from_str(json).unwrap();
        let table = ChunkTable::new(chunks).unwrap();
        assert_eq!(table.len(), 2);
    }
}

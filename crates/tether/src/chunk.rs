//! Byte-range bookkeeping for chunked downloads
//!
//! A download asks for a file in buffer-sized chunks and may have several
//! in flight at once. [`ChunkMap`] records which ranges were requested and
//! how each one turned out, and decides which range to ask for next: first
//! any hole left behind by a short read, otherwise a fresh chunk at the
//! frontier. Nothing is requested at or past a range known to be the end of
//! the file.

use std::collections::BTreeMap;
use std::fmt;

/// State of a requested range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    /// Requested, no reply yet
    Pending,
    /// Every requested byte arrived
    Filled,
    /// Fewer bytes arrived than requested; the range was shrunk to them
    Short,
    /// The server reported end of file at the start of this range
    Eof,
}

/// A range to request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Chunk {
    /// Start offset
    pub offset: u64,
    /// Number of bytes to request
    pub length: u32,
}

impl Chunk {
    /// Offset one past the last requested byte
    pub fn end(&self) -> u64 {
        self.offset + u64::from(self.length)
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.offset, self.end())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Range {
    end: u64,
    state: ChunkState,
}

/// Disjoint requested ranges keyed by start offset
#[derive(Debug, Default, Clone)]
pub struct ChunkMap {
    ranges: BTreeMap<u64, Range>,
}

impl ChunkMap {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick the next range to request and record it as pending
    ///
    /// Returns `None` once the end of the file has been reached.
    pub fn next_chunk(&mut self, buffer_size: u32) -> Option<Chunk> {
        let chunk = self.plan(buffer_size)?;
        self.ranges.insert(
            chunk.offset,
            Range {
                end: chunk.end(),
                state: ChunkState::Pending,
            },
        );
        Some(chunk)
    }

    fn plan(&self, buffer_size: u32) -> Option<Chunk> {
        let mut frontier = 0u64;
        for (&start, range) in &self.ranges {
            if start > frontier {
                let gap = (start - frontier).min(u64::from(buffer_size));
                return Some(Chunk {
                    offset: frontier,
                    length: gap as u32,
                });
            }
            if range.state == ChunkState::Eof {
                return None;
            }
            frontier = frontier.max(range.end);
        }
        Some(Chunk {
            offset: frontier,
            length: buffer_size,
        })
    }

    /// Record the bytes received for a pending chunk
    ///
    /// A reply shorter than the request shrinks the range to what arrived,
    /// which leaves the remainder to be requested again. An empty reply is
    /// treated as end of file.
    pub fn record_data(&mut self, chunk: Chunk, received: usize) {
        if received == 0 {
            self.record_eof(chunk);
            return;
        }
        if let Some(range) = self.ranges.get_mut(&chunk.offset) {
            let received = (received as u64).min(u64::from(chunk.length));
            if received < u64::from(chunk.length) {
                range.end = chunk.offset + received;
                range.state = ChunkState::Short;
            } else {
                range.state = ChunkState::Filled;
            }
        }
    }

    /// Record that the server reported end of file for a pending chunk
    pub fn record_eof(&mut self, chunk: Chunk) {
        if let Some(range) = self.ranges.get_mut(&chunk.offset) {
            range.end = chunk.offset;
            range.state = ChunkState::Eof;
        }
    }

    /// Offset up to which every byte has been requested
    pub fn frontier(&self) -> u64 {
        let mut frontier = 0u64;
        for (&start, range) in &self.ranges {
            if start > frontier || range.state == ChunkState::Eof {
                break;
            }
            frontier = frontier.max(range.end);
        }
        frontier
    }

    /// Number of chunks still awaiting a reply
    pub fn pending(&self) -> usize {
        self.ranges
            .values()
            .filter(|range| range.state == ChunkState::Pending)
            .count()
    }

    /// Bytes recorded as received
    pub fn received(&self) -> u64 {
        self.ranges
            .iter()
            .filter(|(_, range)| matches!(range.state, ChunkState::Filled | ChunkState::Short))
            .map(|(start, range)| range.end - start)
            .sum()
    }

    /// Lowest offset at which end of file was reported
    pub fn eof_offset(&self) -> Option<u64> {
        self.ranges
            .iter()
            .find(|(_, range)| range.state == ChunkState::Eof)
            .map(|(&start, _)| start)
    }

    /// Whether the whole file up to the end has arrived
    pub fn is_complete(&self) -> bool {
        self.pending() == 0 && self.eof_offset().is_some_and(|eof| self.frontier() == eof)
    }

    /// State of the range starting at `offset`
    pub fn state_at(&self, offset: u64) -> Option<ChunkState> {
        self.ranges.get(&offset).map(|range| range.state)
    }
}

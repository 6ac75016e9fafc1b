//! Splits an object into numbered parts.

use serde::{Deserialize, Serialize};

/// Part size used when none is configured (1 MiB).
pub const DEFAULT_PART_SIZE: u64 = 1_048_576;

/// A part already present on the remote side (upload) or in the sink (download).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    /// 1-based part index.
    pub index: u32,
    /// Part length in bytes.
    pub size: u64,
    /// Integrity tag reported for the part.
    pub tag: String,
}

/// Lifecycle of one part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartState {
    /// Not yet scheduled.
    Pending,
    /// A transmitter is working on it.
    InFlight,
    /// Transmitted and acknowledged.
    Done,
    /// Gave up after a non-retryable error or exhausted retries.
    Failed,
}

/// One contiguous byte range of the object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartDescriptor {
    /// 1-based index; also the transmission and confirmation order.
    pub index: u32,
    /// Offset of the first byte in the object.
    pub offset: u64,
    /// Number of bytes.
    pub length: u64,
    /// Current state.
    pub state: PartState,
    /// Integrity tag once the part is done.
    pub tag: Option<String>,
}

impl PartDescriptor {
    /// Exclusive end offset.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// Marks the part done with its tag.
    pub fn complete(&mut self, tag: impl Into<String>) {
        self.state = PartState::Done;
        self.tag = Some(tag.into());
    }

    /// Record of this part for a resume manifest, if done.
    #[must_use]
    pub fn as_completed(&self) -> Option<CompletedPart> {
        match (&self.state, &self.tag) {
            (PartState::Done, Some(tag)) => Some(CompletedPart {
                index: self.index,
                size: self.length,
                tag: tag.clone(),
            }),
            _ => None,
        }
    }
}

/// Computes part layouts for a fixed part size.
#[derive(Debug, Clone, Copy)]
pub struct ChunkPlanner {
    part_size: u64,
}

impl Default for ChunkPlanner {
    fn default() -> Self {
        Self::new(DEFAULT_PART_SIZE)
    }
}

impl ChunkPlanner {
    /// Creates a planner; a part size of 0 selects [`DEFAULT_PART_SIZE`].
    #[must_use]
    pub fn new(part_size: u64) -> Self {
        let part_size = if part_size == 0 {
            DEFAULT_PART_SIZE
        } else {
            part_size
        };
        Self { part_size }
    }

    /// Configured part size.
    #[must_use]
    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    /// Number of parts for an object of `total` bytes.
    #[must_use]
    pub fn part_count(&self, total: u64) -> u64 {
        total.div_ceil(self.part_size)
    }

    /// Plans parts covering `[0, total)` in index order.
    ///
    /// An entry in `completed` marks the part with the same index done only
    /// when its size equals the planned length; anything else is replanned.
    #[must_use]
    pub fn plan(&self, total: u64, completed: &[CompletedPart]) -> Vec<PartDescriptor> {
        let mut parts = Vec::new();
        let mut offset = 0u64;
        let mut index = 1u32;
        while offset < total {
            let length = self.part_size.min(total - offset);
            let done = completed
                .iter()
                .find(|c| c.index == index && c.size == length);
            parts.push(PartDescriptor {
                index,
                offset,
                length,
                state: if done.is_some() {
                    PartState::Done
                } else {
                    PartState::Pending
                },
                tag: done.map(|c| c.tag.clone()),
            });
            offset += length;
            index += 1;
        }
        parts
    }

    /// Plans the sub-range `[start, end)` of an object, keeping absolute offsets.
    #[must_use]
    pub fn plan_range(
        &self,
        start: u64,
        end: u64,
        completed: &[CompletedPart],
    ) -> Vec<PartDescriptor> {
        let mut parts = self.plan(end.saturating_sub(start), completed);
        for part in &mut parts {
            part.offset += start;
        }
        parts
    }
}

/// Parts that still need transmitting.
pub fn pending(parts: &[PartDescriptor]) -> impl Iterator<Item = &PartDescriptor> {
    parts.iter().filter(|p| p.state != PartState::Done)
}

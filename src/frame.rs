//! # Frame identity and ordering
//!
//! A contiguous work unit identified by a `FrameId`: a monotonic unsigned
//! integer starting at 1, with 0 reserved as "null".

use serde::{Deserialize, Serialize};

/// 64-bit frame identifier. `0` is reserved and never assigned to a real
/// frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FrameId(pub u64);

pub const NULL_FRAME_ID: FrameId = FrameId(0);

impl FrameId {
    #[inline]
    pub fn is_null(&self) -> bool {
        self.0 == NULL_FRAME_ID.0
    }

    #[inline]
    pub fn next(&self) -> FrameId {
        FrameId(self.0 + 1)
    }
}

impl Default for FrameId {
    fn default() -> Self {
        NULL_FRAME_ID
    }
}

/// Monotonic generator for `FrameId`s, starting at 1.
#[derive(Debug)]
pub struct FrameIdGenerator {
    next: u64,
}

impl FrameIdGenerator {
    pub fn new() -> FrameIdGenerator {
        FrameIdGenerator { next: 1 }
    }

    pub fn next(&mut self) -> FrameId {
        let id = FrameId(self.next);
        self.next += 1;
        id
    }
}

impl Default for FrameIdGenerator {
    fn default() -> Self {
        FrameIdGenerator::new()
    }
}

/// Checks whether a batch of frame ids, in the order given, forms a
/// contiguous ascending run `k, k+1, ..., k+n` with no gaps.
pub fn is_contiguous_ascending(ids: &[FrameId]) -> bool {
    if ids.is_empty() {
        return true;
    }
    ids.windows(2).all(|w| w[1].0 == w[0].0 + 1)
}

//! Chain window: a size-bounded, ordered run of recently accepted light blocks.
//!
//! The window is the write side's view of the chain tip. It holds blocks oldest
//! first, heights increasing by exactly one, each block's `previousblockhash`
//! pointing at its predecessor. Only the aggregate's reducers mutate it.

use std::collections::VecDeque;

use crate::error::LoaderError;
use crate::types::LightBlock;

/// Bounded window of recent light blocks, oldest at the front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainWindow {
    blocks: VecDeque<LightBlock>,
    /// Maximum cumulative byte size of retained blocks.
    max_size: u64,
    /// Cumulative byte size of retained blocks.
    size: u64,
}

impl ChainWindow {
    /// Create an empty window bounded to `max_size` bytes.
    pub fn new(max_size: u64) -> Self {
        Self {
            blocks: VecDeque::new(),
            max_size,
            size: 0,
        }
    }

    /// Rebuild a window from its persisted block list.
    ///
    /// Only node contents are persisted, so the run is re-linked with a single
    /// forward scan: every block must extend its predecessor by height and
    /// hash. The head is never checked against a parent since its predecessor
    /// has been evicted or truncated away.
    pub fn from_blocks(max_size: u64, blocks: Vec<LightBlock>) -> Result<Self, LoaderError> {
        let mut window = Self::new(max_size);
        for block in blocks {
            if let Some(prev) = window.blocks.back() {
                if !block.extends(prev) {
                    return Err(LoaderError::Storage(format!(
                        "chain window is not linked: block {} at height {} does not follow {} at {}",
                        block.hash, block.height, prev.hash, prev.height
                    )));
                }
            }
            window.size += block.size;
            window.blocks.push_back(block);
        }
        window.evict();
        Ok(window)
    }

    /// Export the retained blocks, oldest first.
    pub fn to_vec(&self) -> Vec<LightBlock> {
        self.blocks.iter().cloned().collect()
    }

    /// Returns `true` if `candidates` can be appended as-is.
    ///
    /// Candidates must form a linked run among themselves: each one extends
    /// its predecessor by height and hash. A non-empty window additionally
    /// requires the first candidate to extend the tip. An empty candidate
    /// list is trivially valid.
    pub fn validate_next_blocks(&self, candidates: &[LightBlock]) -> bool {
        if !is_linked_run(candidates) {
            return false;
        }
        match (self.blocks.back(), candidates.first()) {
            (Some(tip), Some(first)) => first.extends(tip),
            _ => true,
        }
    }

    /// Append `blocks` in order, then evict from the front while the window is
    /// over its byte budget.
    pub fn add_blocks(&mut self, blocks: impl IntoIterator<Item = LightBlock>) {
        for block in blocks {
            self.size += block.size;
            self.blocks.push_back(block);
        }
        self.evict();
    }

    /// Look up a retained block by height.
    pub fn find_block_by_height(&self, height: u64) -> Option<&LightBlock> {
        let floor = self.blocks.front()?.height;
        let offset = usize::try_from(height.checked_sub(floor)?).ok()?;
        self.blocks.get(offset).filter(|b| b.height == height)
    }

    /// Drop every block above `height`.
    ///
    /// Idempotent. Heights at or above the tip and heights below the floor
    /// leave the window untouched.
    pub fn truncate_to_block(&mut self, height: u64) {
        match self.floor_height() {
            Some(floor) if height >= floor => {}
            _ => return,
        }
        while let Some(back) = self.blocks.back() {
            if back.height <= height {
                break;
            }
            self.size -= back.size;
            self.blocks.pop_back();
        }
    }

    /// Drop every block.
    pub fn clear(&mut self) {
        self.blocks.clear();
        self.size = 0;
    }

    /// The most recently accepted block.
    pub fn tip(&self) -> Option<&LightBlock> {
        self.blocks.back()
    }

    /// The oldest retained block.
    pub fn head(&self) -> Option<&LightBlock> {
        self.blocks.front()
    }

    /// Height of the tip.
    pub fn last_block_height(&self) -> Option<u64> {
        self.tip().map(|b| b.height)
    }

    /// Height of the oldest retained block.
    pub fn floor_height(&self) -> Option<u64> {
        self.head().map(|b| b.height)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Cumulative byte size of retained blocks.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &LightBlock> {
        self.blocks.iter()
    }

    // The tip always survives eviction.
    fn evict(&mut self) {
        while self.size > self.max_size && self.blocks.len() > 1 {
            if let Some(front) = self.blocks.pop_front() {
                self.size -= front.size;
            }
        }
    }
}

/// `true` if every block extends the one before it.
pub fn is_linked_run(blocks: &[LightBlock]) -> bool {
    blocks.windows(2).all(|pair| pair[1].extends(&pair[0]))
}

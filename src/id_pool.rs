//! # Sparse ID Allocator
//!
//! A two-level bitmap allocator for the 32-bit endpoint and connection IDs
//! used throughout the library. The first level is a map from block index to
//! a 64-bit occupancy word; the second level is the word itself. Allocation
//! starts at a randomly chosen block, so IDs come out sparse across the
//! 32-bit space rather than sequentially: a connection ID never reveals how
//! many connections exist, and a guessed ID is overwhelmingly likely to miss.
//!
//! ID 0 is reserved as "none" and is never handed out; the wire protocol
//! relies on it to mean "no connection yet".

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use tracing::warn;

const BLOCK_BITS: u32 = 64;
/// Number of 64-ID blocks covering the full 32-bit space.
const BLOCK_COUNT: u32 = (u32::MAX / BLOCK_BITS) + 1;

/// Two-level bitmap allocator yielding sparse nonzero 32-bit IDs.
pub struct IdPool {
    /// Block index -> occupancy bitmap. Absent blocks are empty; a block is
    /// dropped again once its last ID is freed.
    blocks: HashMap<u32, u64>,
    rng: StdRng,
    allocated: usize,
}

impl IdPool {
    pub fn new() -> Self {
        Self {
            blocks: HashMap::new(),
            rng: StdRng::from_entropy(),
            allocated: 0,
        }
    }

    /// Allocate a fresh ID, or `None` if the 32-bit space is exhausted.
    pub fn alloc(&mut self) -> Option<u32> {
        // With 2^26 blocks the random probe virtually never collides with a
        // full block; the retry bound guards the pathological case.
        for _ in 0..128 {
            let block = self.rng.gen_range(0..BLOCK_COUNT);
            let word = self.blocks.entry(block).or_insert(0);
            if *word == u64::MAX {
                continue;
            }
            let bit = word.trailing_ones();
            let id = block * BLOCK_BITS + bit;
            if id == 0 {
                // Reserve the "none" ID by marking it used and retrying.
                *word |= 1;
                continue;
            }
            *word |= 1u64 << bit;
            self.allocated += 1;
            return Some(id);
        }
        // Fall back to a linear scan before giving up.
        for block in 0..BLOCK_COUNT {
            let word = self.blocks.entry(block).or_insert(0);
            if *word == u64::MAX {
                continue;
            }
            let bit = word.trailing_ones();
            let id = block * BLOCK_BITS + bit;
            if id == 0 {
                *word |= 1;
                continue;
            }
            *word |= 1u64 << bit;
            self.allocated += 1;
            return Some(id);
        }
        None
    }

    /// Release an ID back to the pool. Freeing an ID that was never
    /// allocated is ignored (with a warning) rather than corrupting state.
    pub fn free(&mut self, id: u32) {
        if id == 0 {
            warn!("attempt to free reserved ID 0");
            return;
        }
        let block = id / BLOCK_BITS;
        let bit = id % BLOCK_BITS;
        match self.blocks.get_mut(&block) {
            Some(word) if *word & (1u64 << bit) != 0 => {
                *word &= !(1u64 << bit);
                self.allocated -= 1;
                // Keep the reserved bit 0 from pinning block 0 alive.
                if *word == 0 || (block == 0 && *word == 1) {
                    self.blocks.remove(&block);
                }
            }
            _ => warn!(id, "attempt to free unallocated ID"),
        }
    }

    pub fn contains(&self, id: u32) -> bool {
        if id == 0 {
            return false;
        }
        let block = id / BLOCK_BITS;
        let bit = id % BLOCK_BITS;
        self.blocks
            .get(&block)
            .map_or(false, |word| word & (1u64 << bit) != 0)
    }

    pub fn len(&self) -> usize {
        self.allocated
    }
}

impl Default for IdPool {
    fn default() -> Self {
        Self::new()
    }
}

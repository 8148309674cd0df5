//! Seed pool — cyclic, fixed-capacity buffer of random blocks
//!
//! The pool is filled once by [`EntropyPool::preload`] and drained
//! indefinitely afterwards. Draws walk a cursor that wraps modulo the
//! number of loaded blocks, so block `i` is seen again after exactly
//! `len()` draws. An empty pool never fails a draw: it returns
//! [`FALLBACK_SCALAR`] and records a miss.

use super::source::{
    EntropyError, EntropySource, SeedBlock, SourceRegistry, MAX_PRELOAD_COUNT,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Value returned by a draw on an empty pool
pub const FALLBACK_SCALAR: f64 = 0.5;

/// Map a block to a float in `[0, 1)` using its top 53 bits
pub fn block_to_scalar(block: &SeedBlock) -> f64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&block[..8]);
    let bits = u64::from_le_bytes(word) >> 11;
    bits as f64 * (1.0 / (1u64 << 53) as f64)
}

/// Point-in-time view of pool counters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub loaded: usize,
    pub cursor: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

pub struct EntropyPool {
    /// Loaded blocks (at most `capacity`)
    blocks: Vec<SeedBlock>,
    /// Maximum number of blocks a preload may install
    capacity: usize,
    /// Next block to draw, always `< blocks.len()` when non-empty
    cursor: usize,
    hits: u64,
    misses: u64,
    sources: SourceRegistry,
}

impl EntropyPool {
    /// Create an empty pool backed by the default source registry
    pub fn new(capacity: usize) -> Self {
        Self::with_sources(capacity, SourceRegistry::with_defaults())
    }

    /// Create an empty pool backed by a custom source registry
    pub fn with_sources(capacity: usize, sources: SourceRegistry) -> Self {
        Self {
            blocks: Vec::new(),
            capacity: capacity.min(MAX_PRELOAD_COUNT),
            cursor: 0,
            hits: 0,
            misses: 0,
            sources,
        }
    }

    /// Register an additional named source
    pub fn register_source(&mut self, source: Box<dyn EntropySource>) {
        self.sources.register(source);
    }

    pub fn sources(&self) -> &SourceRegistry {
        &self.sources
    }

    /// Replace the pool contents with `count` blocks from the source `source_id`.
    ///
    /// The cursor restarts at the first block. Hit/miss counters carry over.
    pub fn preload(&mut self, source_id: &str, count: usize) -> Result<(), EntropyError> {
        if count == 0 || count > self.capacity {
            return Err(EntropyError::InvalidCount(count));
        }

        info!("Pre-loading {} seeds from {}", count, source_id);
        let blocks = self.sources.fetch(source_id, count)?;
        self.install(blocks)?;
        info!("Seed pool preloaded with {} blocks", self.blocks.len());
        Ok(())
    }

    /// Replace the pool contents with blocks fetched from `source` directly
    pub fn preload_from(
        &mut self,
        source: &dyn EntropySource,
        count: usize,
    ) -> Result<(), EntropyError> {
        if count == 0 || count > self.capacity {
            return Err(EntropyError::InvalidCount(count));
        }
        let blocks = source.fetch(count)?;
        self.install(blocks)
    }

    fn install(&mut self, blocks: Vec<SeedBlock>) -> Result<(), EntropyError> {
        if blocks.is_empty() || blocks.len() > self.capacity {
            return Err(EntropyError::InvalidCount(blocks.len()));
        }
        self.blocks = blocks;
        self.cursor = 0;
        Ok(())
    }

    /// Draw the block under the cursor and advance
    pub fn draw_block(&mut self) -> Option<SeedBlock> {
        if self.blocks.is_empty() {
            self.misses += 1;
            return None;
        }
        let block = self.blocks[self.cursor];
        self.cursor = (self.cursor + 1) % self.blocks.len();
        self.hits += 1;
        Some(block)
    }

    /// Draw a float in `[0, 1)`; [`FALLBACK_SCALAR`] when the pool is empty
    pub fn draw_scalar(&mut self) -> f64 {
        match self.draw_block() {
            Some(block) => block_to_scalar(&block),
            None => {
                warn!("Seed pool empty, using fallback value");
                FALLBACK_SCALAR
            }
        }
    }

    /// Two sequential scalar draws rescaled to `[-1, 1)`.
    ///
    /// The two components are only as independent as consecutive pool
    /// blocks are.
    pub fn draw_complex(&mut self) -> (f64, f64) {
        let real = self.draw_scalar() * 2.0 - 1.0;
        let imag = self.draw_scalar() * 2.0 - 1.0;
        (real, imag)
    }

    /// Read block `index mod len()` as a scalar without drawing
    pub fn peek_scalar(&self, index: usize) -> Option<f64> {
        if self.blocks.is_empty() {
            return None;
        }
        Some(block_to_scalar(&self.blocks[index % self.blocks.len()]))
    }

    /// Read block `key mod len()` as a scalar without moving the cursor.
    ///
    /// Counted like a draw: a hit when loaded, otherwise a miss and
    /// [`FALLBACK_SCALAR`].
    pub fn lookup_scalar(&mut self, key: u64) -> f64 {
        if self.blocks.is_empty() {
            self.misses += 1;
            warn!("Seed pool empty, using fallback value");
            return FALLBACK_SCALAR;
        }
        let index = (key % self.blocks.len() as u64) as usize;
        self.hits += 1;
        block_to_scalar(&self.blocks[index])
    }

    /// `hits / (hits + misses)`, or `0.0` before any draw
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn hit_count(&self) -> u64 {
        self.hits
    }

    pub fn miss_count(&self) -> u64 {
        self.misses
    }

    /// Number of loaded blocks
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.capacity,
            loaded: self.blocks.len(),
            cursor: self.cursor,
            hits: self.hits,
            misses: self.misses,
            hit_rate: self.hit_rate(),
        }
    }
}

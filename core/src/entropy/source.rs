//! Entropy sources for the seed pool
//!
//! A source turns a request for `count` blocks into freshly derived
//! 32-byte blocks. Sources are looked up by identifier through a
//! [`SourceRegistry`]; an unknown identifier is reported as
//! [`EntropyError::SourceUnavailable`].

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use thiserror::Error;

/// Size of one pooled block in bytes
pub const BLOCK_SIZE: usize = 32;

/// Opaque random block held by the pool
pub type SeedBlock = [u8; BLOCK_SIZE];

/// Upper bound on blocks a single preload may request
pub const MAX_PRELOAD_COUNT: usize = 10_000_000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EntropyError {
    #[error("Entropy source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("Invalid block count: {0}")]
    InvalidCount(usize),
}

/// A named producer of seed blocks
pub trait EntropySource: Send + Sync {
    /// Identifier used to select this source (e.g. `"hash_counter"`)
    fn id(&self) -> &str;

    /// Derive `count` fresh blocks
    fn fetch(&self, count: usize) -> Result<Vec<SeedBlock>, EntropyError>;
}

/// Deterministic source: SHA-256 over a counter.
///
/// Block `i` is `SHA-256(key || "seed_" || i)`. With no key the output is
/// identical across runs and machines, which makes pooled draws
/// reproducible in tests.
#[derive(Debug, Clone, Default)]
pub struct HashCounterSource {
    key: Option<Vec<u8>>,
}

impl HashCounterSource {
    pub const ID: &'static str = "hash_counter";

    pub fn new() -> Self {
        Self { key: None }
    }

    /// Mix a caller-supplied key into every derived block
    pub fn with_key(key: impl AsRef<[u8]>) -> Self {
        Self {
            key: Some(key.as_ref().to_vec()),
        }
    }

    fn block(&self, index: usize) -> SeedBlock {
        let mut hasher = Sha256::new();
        if let Some(key) = &self.key {
            hasher.update(key);
        }
        hasher.update(format!("seed_{}", index).as_bytes());
        hasher.finalize().into()
    }
}

impl EntropySource for HashCounterSource {
    fn id(&self) -> &str {
        Self::ID
    }

    fn fetch(&self, count: usize) -> Result<Vec<SeedBlock>, EntropyError> {
        Ok((0..count).map(|i| self.block(i)).collect())
    }
}

/// Operating-system randomness
#[derive(Debug, Clone, Copy, Default)]
pub struct OsSource;

impl OsSource {
    pub const ID: &'static str = "os";
}

impl EntropySource for OsSource {
    fn id(&self) -> &str {
        Self::ID
    }

    fn fetch(&self, count: usize) -> Result<Vec<SeedBlock>, EntropyError> {
        use rand::rngs::OsRng;
        use rand::RngCore;

        let mut blocks = Vec::with_capacity(count);
        for _ in 0..count {
            let mut block = [0u8; BLOCK_SIZE];
            OsRng
                .try_fill_bytes(&mut block)
                .map_err(|e| EntropyError::SourceUnavailable(format!("os: {}", e)))?;
            blocks.push(block);
        }
        Ok(blocks)
    }
}

/// Identifier → source lookup table
pub struct SourceRegistry {
    sources: HashMap<String, Box<dyn EntropySource>>,
}

impl SourceRegistry {
    /// Empty registry
    pub fn empty() -> Self {
        Self {
            sources: HashMap::new(),
        }
    }

    /// Registry holding the built-in `hash_counter` and `os` sources
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(HashCounterSource::new()));
        registry.register(Box::new(OsSource));
        registry
    }

    /// Add or replace a source under its own identifier
    pub fn register(&mut self, source: Box<dyn EntropySource>) {
        self.sources.insert(source.id().to_string(), source);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sources.contains_key(id)
    }

    /// Sorted identifiers of all registered sources
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sources.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Fetch `count` blocks from the source named `id`
    pub fn fetch(&self, id: &str, count: usize) -> Result<Vec<SeedBlock>, EntropyError> {
        let source = self
            .sources
            .get(id)
            .ok_or_else(|| EntropyError::SourceUnavailable(id.to_string()))?;
        source.fetch(count)
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// Entropy — pooled randomness for phase derivation
//
// A finite, cyclically consumed seed pool plus the named sources that
// fill it.

pub mod pool;
pub mod source;

pub use pool::{block_to_scalar, EntropyPool, PoolStats, FALLBACK_SCALAR};
pub use source::{
    EntropyError, EntropySource, HashCounterSource, OsSource, SeedBlock, SourceRegistry,
    BLOCK_SIZE, MAX_PRELOAD_COUNT,
};

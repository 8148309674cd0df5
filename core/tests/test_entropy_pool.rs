use qtop_core::entropy::{
    EntropyError, EntropyPool, EntropySource, HashCounterSource, SeedBlock, SourceRegistry,
    FALLBACK_SCALAR,
};
use qtop_core::privacy::{
    shared_pool, IndexedPhaseSource, PhaseDelayEngine, PhaseSource, SeededPhaseSource,
    TimingConfig,
};
use std::f64::consts::TAU;

#[test]
fn test_hit_rate_zero_before_draws() {
    let mut pool = EntropyPool::new(8);
    assert_eq!(pool.hit_rate(), 0.0);
    pool.preload("hash_counter", 8).unwrap();
    assert_eq!(pool.hit_rate(), 0.0);
}

#[test]
fn test_hit_rate_one_after_n_draws() {
    for n in [1usize, 5, 8] {
        let mut pool = EntropyPool::new(8);
        pool.preload("hash_counter", 8).unwrap();
        for _ in 0..n {
            pool.draw_scalar();
        }
        assert_eq!(pool.hit_rate(), 1.0);
    }
}

#[test]
fn test_cursor_wraps_to_first_block() {
    let mut pool = EntropyPool::new(6);
    pool.preload("hash_counter", 6).unwrap();
    let first = pool.draw_scalar();
    for _ in 1..6 {
        pool.draw_scalar();
    }
    assert_eq!(pool.cursor(), 0);
    assert_eq!(pool.draw_scalar(), first);
}

#[test]
fn test_empty_pool_falls_back() {
    let mut pool = EntropyPool::new(4);
    assert_eq!(pool.draw_scalar(), FALLBACK_SCALAR);
    assert_eq!(pool.draw_scalar(), FALLBACK_SCALAR);
    assert_eq!(pool.miss_count(), 2);
    assert_eq!(pool.hit_rate(), 0.0);
    assert_eq!(pool.cursor(), 0);
}

#[test]
fn test_preload_is_reproducible() {
    let mut a = EntropyPool::new(16);
    let mut b = EntropyPool::new(16);
    a.preload("hash_counter", 16).unwrap();
    b.preload("hash_counter", 16).unwrap();
    for _ in 0..16 {
        assert_eq!(a.draw_block(), b.draw_block());
    }
}

#[test]
fn test_keyed_source_changes_blocks() {
    let mut plain = EntropyPool::new(4);
    plain.preload("hash_counter", 4).unwrap();

    let mut keyed = EntropyPool::new(4);
    keyed.register_source(Box::new(HashCounterSource::with_key(b"deployment-key")));
    keyed.preload("hash_counter", 4).unwrap();

    assert_ne!(plain.draw_block(), keyed.draw_block());
}

#[test]
fn test_unknown_source_is_unavailable() {
    let mut pool = EntropyPool::with_sources(4, SourceRegistry::empty());
    assert_eq!(
        pool.preload("hash_counter", 4),
        Err(EntropyError::SourceUnavailable("hash_counter".to_string()))
    );
    assert!(pool.is_empty());
}

struct FixedSource;

impl EntropySource for FixedSource {
    fn id(&self) -> &str {
        "fixed"
    }

    fn fetch(&self, count: usize) -> Result<Vec<SeedBlock>, EntropyError> {
        Ok((0..count).map(|i| [i as u8; 32]).collect())
    }
}

#[test]
fn test_custom_source_registration() {
    let mut pool = EntropyPool::new(3);
    pool.register_source(Box::new(FixedSource));
    pool.preload("fixed", 3).unwrap();
    assert_eq!(pool.draw_block(), Some([0u8; 32]));
    assert_eq!(pool.draw_block(), Some([1u8; 32]));
    assert!(pool.sources().ids().contains(&"fixed".to_string()));
}

#[test]
fn test_deterministic_phase_with_exhausted_pool() {
    // both sources are deterministic for identical inputs, so two engines
    // fed the same calls agree even without pool entropy
    let empty = shared_pool(EntropyPool::new(4));
    let mut indexed = IndexedPhaseSource::new(empty);
    assert_eq!(indexed.phase(1, 99, TAU), TAU / 2.0);
    assert_eq!(indexed.phase(1, 99, TAU), indexed.phase(1, 99, TAU));

    let mut a = PhaseDelayEngine::new(TimingConfig::default(), Box::new(SeededPhaseSource))
        .unwrap();
    let mut b = PhaseDelayEngine::new(TimingConfig::default(), Box::new(SeededPhaseSource))
        .unwrap();
    for fp in [3u64, 17, 3, 250] {
        assert_eq!(a.compute_delay(1, fp), b.compute_delay(1, fp));
    }
}

#[test]
fn test_exhausted_pool_engine_is_repeatable() {
    let make = || {
        PhaseDelayEngine::with_pool(TimingConfig::default(), shared_pool(EntropyPool::new(4)))
            .unwrap()
    };
    let (mut a, mut b) = (make(), make());
    let first: Vec<f64> = (0..3).map(|_| a.compute_delay(7, 1)).collect();
    let second: Vec<f64> = (0..3).map(|_| b.compute_delay(7, 1)).collect();
    assert_eq!(first, second);
}

// QTOP Core — phase-driven stream delay injection
//
// Seed pool -> phase engine -> stream interceptor. Everything outside
// that pipeline (control transport, metrics export) sits behind traits.

pub mod control;
pub mod entropy;
pub mod monitoring;
pub mod privacy;

use thiserror::Error;

pub use control::{
    ControlConnection, ControlConnector, ControlError, ControlEvent, EventCategory,
    InterceptorConfig, LocalEventSource, StreamEvent, StreamEventInterceptor, StreamStatus,
};
pub use entropy::{EntropyError, EntropyPool, EntropySource, SourceRegistry};
pub use monitoring::{HealthRegistry, HealthStatus, MetricsRegistry};
pub use privacy::{
    shared_pool, DelayComputation, PhaseDelayEngine, PhaseSourceKind, SharedEngine, SharedPool,
    TimingConfig, TimingError,
};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq)]
pub enum QtopError {
    #[error("Entropy error: {0}")]
    Entropy(#[from] EntropyError),
    #[error("Timing error: {0}")]
    Timing(#[from] TimingError),
    #[error("Control error: {0}")]
    Control(#[from] ControlError),
}

// ============================================================================
// PIPELINE ASSEMBLY
// ============================================================================

/// Preload a pool of `capacity` blocks with `count` blocks from `source_id`
/// and build an engine over it using the given phase source kind.
pub fn build_pipeline(
    capacity: usize,
    source_id: &str,
    count: usize,
    timing: TimingConfig,
    phase_source: PhaseSourceKind,
) -> Result<(SharedPool, SharedEngine), QtopError> {
    let mut pool = EntropyPool::new(capacity);
    pool.preload(source_id, count)?;
    let pool = shared_pool(pool);
    let engine = PhaseDelayEngine::new(timing, phase_source.build(pool.clone()))?;
    Ok((pool, engine.into_shared()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_pipeline() {
        let (pool, engine) = build_pipeline(
            16,
            "hash_counter",
            16,
            TimingConfig::default(),
            PhaseSourceKind::Pool,
        )
        .unwrap();
        assert_eq!(pool.lock().len(), 16);
        let delay = engine.lock().compute_delay(1, 42);
        assert!((0.1..=10.0).contains(&delay));
        assert_eq!(pool.lock().hit_count(), 1);
    }

    #[test]
    fn test_build_pipeline_unknown_source() {
        let err = build_pipeline(
            16,
            "nope",
            4,
            TimingConfig::default(),
            PhaseSourceKind::Pool,
        )
        .err()
        .unwrap();
        assert!(matches!(
            err,
            QtopError::Entropy(EntropyError::SourceUnavailable(_))
        ));
    }

    #[test]
    fn test_build_pipeline_invalid_timing() {
        let timing = TimingConfig {
            min_delay: 5.0,
            max_delay: 1.0,
            ..TimingConfig::default()
        };
        let err = build_pipeline(4, "hash_counter", 4, timing, PhaseSourceKind::Seeded)
            .err()
            .unwrap();
        assert!(matches!(err, QtopError::Timing(TimingError::InvalidConfig(_))));
    }
}

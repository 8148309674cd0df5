// Privacy — phase-driven delay injection
//
// Provides the per-circuit phase/delay engine, the pluggable phase
// sources feeding it, and the circuit phase table.

pub mod phase;
pub mod state;
pub mod timing;

pub use phase::{
    shared_pool, IndexedPhaseSource, PhaseSource, PhaseSourceKind, PoolPhaseSource,
    SeededPhaseSource, SharedPool,
};
pub use state::CircuitPhaseState;
pub use timing::{
    delay_to_duration, DelayComputation, PhaseDelayEngine, SharedEngine, TimingConfig,
    TimingError,
};

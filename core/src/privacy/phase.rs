// Phase Sources — where a circuit's next phase comes from
//
// The delay engine only needs a value in [0, winding_quantum) for each
// (circuit, stream fingerprint) pair. How that value is produced is a
// pluggable capability so the engine's arithmetic can be tested apart
// from the randomness behind it.

use crate::entropy::EntropyPool;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Pool shared between phase sources, interceptors and health checks
pub type SharedPool = Arc<Mutex<EntropyPool>>;

/// Wrap a pool for sharing
pub fn shared_pool(pool: EntropyPool) -> SharedPool {
    Arc::new(Mutex::new(pool))
}

/// Produces the current phase for a circuit
pub trait PhaseSource: Send {
    /// Return a phase in `[0, winding_quantum)`
    fn phase(&mut self, circuit_id: u64, fingerprint: u64, winding_quantum: f64) -> f64;

    /// Short name for logs and config
    fn name(&self) -> &'static str;
}

/// Scale a unit draw onto one full turn, keeping the upper bound open
fn scale_to_turn(unit: f64, winding_quantum: f64) -> f64 {
    let phase = unit * winding_quantum;
    if phase >= winding_quantum {
        0.0
    } else {
        phase
    }
}

/// Selects a phase source implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseSourceKind {
    /// Sequential draws from the seed pool
    #[default]
    Pool,
    /// Pool lookup keyed by circuit and fingerprint
    Indexed,
    /// PRNG seeded from circuit and fingerprint
    Seeded,
}

impl PhaseSourceKind {
    /// Build the selected source over `pool`
    pub fn build(self, pool: SharedPool) -> Box<dyn PhaseSource> {
        match self {
            PhaseSourceKind::Pool => Box::new(PoolPhaseSource::new(pool)),
            PhaseSourceKind::Indexed => Box::new(IndexedPhaseSource::new(pool)),
            PhaseSourceKind::Seeded => Box::new(SeededPhaseSource),
        }
    }
}

impl std::str::FromStr for PhaseSourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pool" => Ok(PhaseSourceKind::Pool),
            "indexed" => Ok(PhaseSourceKind::Indexed),
            "seeded" => Ok(PhaseSourceKind::Seeded),
            other => Err(format!("unknown phase source: {}", other)),
        }
    }
}

impl std::fmt::Display for PhaseSourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PhaseSourceKind::Pool => write!(f, "pool"),
            PhaseSourceKind::Indexed => write!(f, "indexed"),
            PhaseSourceKind::Seeded => write!(f, "seeded"),
        }
    }
}

/// Draws the next pool scalar for every request.
///
/// Ignores the circuit and fingerprint; every call consumes one block.
pub struct PoolPhaseSource {
    pool: SharedPool,
}

impl PoolPhaseSource {
    pub fn new(pool: SharedPool) -> Self {
        Self { pool }
    }
}

impl PhaseSource for PoolPhaseSource {
    fn phase(&mut self, _circuit_id: u64, _fingerprint: u64, winding_quantum: f64) -> f64 {
        let unit = self.pool.lock().draw_scalar();
        scale_to_turn(unit, winding_quantum)
    }

    fn name(&self) -> &'static str {
        "pool"
    }
}

/// Looks up a pool block chosen by the circuit and fingerprint.
///
/// The same inputs against the same pool always yield the same phase.
/// The cursor never moves, but each lookup counts as a pool hit, or as a
/// miss yielding half a turn when the pool is empty.
pub struct IndexedPhaseSource {
    pool: SharedPool,
}

impl IndexedPhaseSource {
    pub fn new(pool: SharedPool) -> Self {
        Self { pool }
    }

    /// Block index for a circuit/fingerprint pair before reduction
    pub fn mix(circuit_id: u64, fingerprint: u64) -> u64 {
        (circuit_id ^ fingerprint).rotate_left(32)
    }
}

impl PhaseSource for IndexedPhaseSource {
    fn phase(&mut self, circuit_id: u64, fingerprint: u64, winding_quantum: f64) -> f64 {
        let unit = self
            .pool
            .lock()
            .lookup_scalar(Self::mix(circuit_id, fingerprint));
        scale_to_turn(unit, winding_quantum)
    }

    fn name(&self) -> &'static str {
        "indexed"
    }
}

/// Seeds a PRNG with `circuit_id + fingerprint` and takes one draw.
///
/// Needs no pool; deterministic for identical inputs.
#[derive(Debug, Clone, Copy, Default)]
pub struct SeededPhaseSource;

impl PhaseSource for SeededPhaseSource {
    fn phase(&mut self, circuit_id: u64, fingerprint: u64, winding_quantum: f64) -> f64 {
        let mut rng = StdRng::seed_from_u64(circuit_id.wrapping_add(fingerprint));
        scale_to_turn(rng.gen::<f64>(), winding_quantum)
    }

    fn name(&self) -> &'static str {
        "seeded"
    }
}

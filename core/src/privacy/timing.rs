// Phase Delay Engine — Resistance to timing correlation attacks
//
// Converts a (circuit, stream fingerprint) pair into a bounded delay.
// Each circuit remembers the last phase it saw; the next delay is driven
// by how far the phase has advanced around one winding quantum since.

use super::phase::{PhaseSource, SharedPool, PoolPhaseSource};
use super::state::CircuitPhaseState;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Configuration for phase-driven delays
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Length of one full phase turn
    pub winding_quantum: f64,
    /// Minimum delay in milliseconds
    pub min_delay: f64,
    /// Maximum delay in milliseconds
    pub max_delay: f64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            winding_quantum: TAU,
            min_delay: 0.1,
            max_delay: 10.0,
        }
    }
}

impl TimingConfig {
    /// Validate timing configuration.
    ///
    /// Both delays must be positive and finite with `min_delay <= max_delay`.
    /// Finite delays too large for a `Duration` are accepted and saturate
    /// when applied.
    pub fn validate(&self) -> Result<(), TimingError> {
        if !self.winding_quantum.is_finite() || self.winding_quantum <= 0.0 {
            return Err(TimingError::InvalidConfig(
                "winding_quantum must be a positive finite number".to_string(),
            ));
        }
        if !self.min_delay.is_finite() || !self.max_delay.is_finite() {
            return Err(TimingError::InvalidConfig(
                "delays must be finite".to_string(),
            ));
        }
        if self.min_delay <= 0.0 {
            return Err(TimingError::InvalidConfig(
                "min_delay must be positive".to_string(),
            ));
        }
        if self.min_delay > self.max_delay {
            return Err(TimingError::InvalidConfig(
                "min_delay must not exceed max_delay".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TimingError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Every intermediate value of one delay computation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DelayComputation {
    pub circuit_id: u64,
    /// Phase produced by the phase source for this call
    pub phase: f64,
    /// Phase recorded for the circuit before this call (0.0 if new)
    pub previous_phase: f64,
    /// `(phase - previous_phase) mod winding_quantum`
    pub delta: f64,
    /// Quantized winding count
    pub winding: f64,
    /// Clamped delay in milliseconds
    pub delay: f64,
}

impl DelayComputation {
    pub fn as_duration(&self) -> Duration {
        delay_to_duration(self.delay)
    }
}

/// Convert a millisecond delay to a `Duration`.
///
/// NaN and non-positive values give zero; values past `Duration::MAX`
/// saturate.
pub fn delay_to_duration(delay_ms: f64) -> Duration {
    if delay_ms.is_nan() || delay_ms <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(delay_ms / 1000.0).unwrap_or(Duration::MAX)
}

/// Engine shared between interceptors; the mutex serializes draws and
/// phase updates
pub type SharedEngine = Arc<Mutex<PhaseDelayEngine>>;

/// Per-circuit phase/delay state machine
pub struct PhaseDelayEngine {
    config: TimingConfig,
    phase_source: Box<dyn PhaseSource>,
    circuits: CircuitPhaseState,
}

impl PhaseDelayEngine {
    /// Create an engine with the given configuration and phase source
    pub fn new(
        config: TimingConfig,
        phase_source: Box<dyn PhaseSource>,
    ) -> Result<Self, TimingError> {
        config.validate()?;
        Ok(Self {
            config,
            phase_source,
            circuits: CircuitPhaseState::new(),
        })
    }

    /// Create an engine drawing phases sequentially from `pool`
    pub fn with_pool(config: TimingConfig, pool: SharedPool) -> Result<Self, TimingError> {
        Self::new(config, Box::new(PoolPhaseSource::new(pool)))
    }

    /// Bound the circuit table, evicting the least recently updated circuit
    pub fn with_max_circuits(mut self, max_circuits: usize) -> Self {
        self.circuits = CircuitPhaseState::bounded(max_circuits);
        self
    }

    /// Wrap for sharing
    pub fn into_shared(self) -> SharedEngine {
        Arc::new(Mutex::new(self))
    }

    /// Compute the delay for a stream on a circuit and record the new phase
    pub fn compute(&mut self, circuit_id: u64, fingerprint: u64) -> DelayComputation {
        let wq = self.config.winding_quantum;
        let phase = self.phase_source.phase(circuit_id, fingerprint, wq);
        let previous_phase = self.circuits.get(circuit_id).unwrap_or(0.0);

        let mut delta = (phase - previous_phase).rem_euclid(wq);
        if delta >= wq {
            // rem_euclid can round up to the modulus
            delta = 0.0;
        }

        // delta / wq is in [0, 1), so the winding term is 0 below half a
        // turn and 1 above it. Ties go to even.
        let winding = (delta / wq).round_ties_even();

        let span = self.config.max_delay - self.config.min_delay;
        let raw = self.config.min_delay + (winding + delta / wq) * span / 10.0;
        let delay = raw.clamp(self.config.min_delay, self.config.max_delay);

        if let Some(evicted) = self.circuits.set(circuit_id, phase) {
            debug!("Evicted phase state for circuit {}", evicted);
        }

        debug!("Computed delay {:.2}ms for circuit {}", delay, circuit_id);
        DelayComputation {
            circuit_id,
            phase,
            previous_phase,
            delta,
            winding,
            delay,
        }
    }

    /// Delay in milliseconds for a stream on a circuit
    pub fn compute_delay(&mut self, circuit_id: u64, fingerprint: u64) -> f64 {
        self.compute(circuit_id, fingerprint).delay
    }

    /// Bounds check only: `min_delay <= delay <= max_delay`.
    ///
    /// This does not verify anything about the circuit's phase history.
    pub fn verify_winding(&self, _circuit_id: u64, delay: f64) -> bool {
        delay >= self.config.min_delay && delay <= self.config.max_delay
    }

    /// Last phase recorded for a circuit
    pub fn last_phase(&self, circuit_id: u64) -> Option<f64> {
        self.circuits.get(circuit_id)
    }

    /// Number of circuits with recorded phase
    pub fn tracked_circuits(&self) -> usize {
        self.circuits.len()
    }

    /// Eviction hook for closed circuits
    pub fn forget_circuit(&mut self, circuit_id: u64) -> bool {
        let removed = self.circuits.forget(circuit_id);
        if removed {
            debug!("Forgot phase state for circuit {}", circuit_id);
        }
        removed
    }

    pub fn config(&self) -> &TimingConfig {
        &self.config
    }

    pub fn phase_source_name(&self) -> &'static str {
        self.phase_source.name()
    }
}

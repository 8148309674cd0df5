// Circuit Phase State — last observed phase per circuit
//
// Entries are created on a circuit's first delay computation and updated
// on every later one. Without a bound the table grows with circuit churn;
// `forget` is the hook for circuit-closed notifications and an optional
// bound evicts the least recently updated circuit.

use lru::LruCache;
use std::num::NonZeroUsize;

/// Circuit id → last phase, in least-recently-updated order
#[derive(Debug)]
pub struct CircuitPhaseState {
    entries: LruCache<u64, f64>,
    max_circuits: Option<usize>,
}

impl Default for CircuitPhaseState {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitPhaseState {
    /// Unbounded state table
    pub fn new() -> Self {
        Self {
            entries: LruCache::unbounded(),
            max_circuits: None,
        }
    }

    /// State table holding at most `max_circuits` circuits (minimum 1)
    pub fn bounded(max_circuits: usize) -> Self {
        let cap = NonZeroUsize::new(max_circuits).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(cap),
            max_circuits: Some(cap.get()),
        }
    }

    pub fn max_circuits(&self) -> Option<usize> {
        self.max_circuits
    }

    /// Last recorded phase for a circuit. Reading does not count as an update.
    pub fn get(&self, circuit_id: u64) -> Option<f64> {
        self.entries.peek(&circuit_id).copied()
    }

    /// Record the phase for a circuit, evicting the stalest circuit if full.
    ///
    /// Returns the evicted circuit id, if any.
    pub fn set(&mut self, circuit_id: u64, phase: f64) -> Option<u64> {
        match self.entries.push(circuit_id, phase) {
            Some((id, _)) if id != circuit_id => Some(id),
            _ => None,
        }
    }

    /// Drop a circuit's entry; returns whether one existed
    pub fn forget(&mut self, circuit_id: u64) -> bool {
        self.entries.pop(&circuit_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

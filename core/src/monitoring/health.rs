//! Health-check registry
//!
//! Checks are registered explicitly by name. Running the registry calls
//! every check; a check that errors counts as unhealthy.

use crate::control::interceptor::StreamEventInterceptor;
use crate::privacy::phase::SharedPool;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{error, warn};

/// A health check returns `(healthy, message)`
pub type HealthCheck = Box<dyn Fn() -> anyhow::Result<(bool, String)> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthCheckResult {
    pub name: String,
    pub healthy: bool,
    pub message: String,
    pub timestamp: SystemTime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthStatus {
    /// True iff every check is healthy
    pub healthy: bool,
    pub checks: BTreeMap<String, HealthCheckResult>,
    pub timestamp: SystemTime,
}

#[derive(Default)]
pub struct HealthRegistry {
    checks: BTreeMap<String, HealthCheck>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the check called `name`
    pub fn register<F>(&mut self, name: impl Into<String>, check: F)
    where
        F: Fn() -> anyhow::Result<(bool, String)> + Send + Sync + 'static,
    {
        self.checks.insert(name.into(), Box::new(check));
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.checks.remove(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        self.checks.keys().cloned().collect()
    }

    /// Run every check
    pub fn status(&self) -> HealthStatus {
        let mut results = BTreeMap::new();
        for (name, check) in &self.checks {
            let result = match check() {
                Ok((healthy, message)) => {
                    if !healthy {
                        warn!("Health check '{}' unhealthy: {}", name, message);
                    }
                    HealthCheckResult {
                        name: name.clone(),
                        healthy,
                        message,
                        timestamp: SystemTime::now(),
                    }
                }
                Err(e) => {
                    error!("Health check '{}' failed: {}", name, e);
                    HealthCheckResult {
                        name: name.clone(),
                        healthy: false,
                        message: format!("Check failed: {}", e),
                        timestamp: SystemTime::now(),
                    }
                }
            };
            results.insert(name.clone(), result);
        }

        HealthStatus {
            healthy: results.values().all(|r| r.healthy),
            checks: results,
            timestamp: SystemTime::now(),
        }
    }
}

/// Healthy while the pool is loaded and its hit rate is at least `min_hit_rate`.
///
/// A pool nobody has drawn from yet is reported healthy.
pub fn pool_check(
    pool: SharedPool,
    min_hit_rate: f64,
) -> impl Fn() -> anyhow::Result<(bool, String)> + Send + Sync + 'static {
    move || {
        let stats = pool.lock().stats();
        if stats.loaded == 0 {
            return Ok((false, "seed pool is empty".to_string()));
        }
        if stats.hits + stats.misses == 0 {
            return Ok((true, format!("{} seeds loaded, no draws yet", stats.loaded)));
        }
        let healthy = stats.hit_rate >= min_hit_rate;
        Ok((
            healthy,
            format!(
                "hit rate {:.3} over {} draws ({} seeds)",
                stats.hit_rate,
                stats.hits + stats.misses,
                stats.loaded
            ),
        ))
    }
}

/// Healthy while the interceptor is active
pub fn interceptor_check(
    interceptor: Arc<StreamEventInterceptor>,
) -> impl Fn() -> anyhow::Result<(bool, String)> + Send + Sync + 'static {
    move || {
        if interceptor.is_active() {
            Ok((true, "stream interception active".to_string()))
        } else {
            Ok((false, "stream interception stopped".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entropy::EntropyPool;
    use crate::privacy::phase::shared_pool;

    #[test]
    fn test_empty_registry_is_healthy() {
        let registry = HealthRegistry::new();
        let status = registry.status();
        assert!(status.healthy);
        assert!(status.checks.is_empty());
    }

    #[test]
    fn test_all_checks_must_pass() {
        let mut registry = HealthRegistry::new();
        registry.register("ok", || Ok((true, "fine".to_string())));
        registry.register("bad", || Ok((false, "broken".to_string())));
        let status = registry.status();
        assert!(!status.healthy);
        assert!(status.checks["ok"].healthy);
        assert_eq!(status.checks["bad"].message, "broken");
    }

    #[test]
    fn test_erroring_check_is_unhealthy() {
        let mut registry = HealthRegistry::new();
        registry.register("boom", || Err(anyhow::anyhow!("socket closed")));
        let status = registry.status();
        assert!(!status.healthy);
        assert_eq!(status.checks["boom"].message, "Check failed: socket closed");
    }

    #[test]
    fn test_register_replaces_and_unregister() {
        let mut registry = HealthRegistry::new();
        registry.register("c", || Ok((false, "old".to_string())));
        registry.register("c", || Ok((true, "new".to_string())));
        assert_eq!(registry.names(), vec!["c".to_string()]);
        assert!(registry.status().healthy);
        assert!(registry.unregister("c"));
        assert!(!registry.unregister("c"));
    }

    #[test]
    fn test_pool_check() {
        let pool = shared_pool(EntropyPool::new(4));
        let check = pool_check(pool.clone(), 0.9);
        assert!(!check().unwrap().0);

        pool.lock().preload("hash_counter", 4).unwrap();
        assert!(check().unwrap().0);

        pool.lock().draw_scalar();
        let (healthy, message) = check().unwrap();
        assert!(healthy);
        assert!(message.contains("hit rate 1.000"));
    }

    #[test]
    fn test_pool_check_low_hit_rate() {
        let pool = shared_pool(EntropyPool::new(4));
        pool.lock().draw_scalar();
        pool.lock().draw_scalar();
        pool.lock().preload("hash_counter", 4).unwrap();
        pool.lock().draw_scalar();
        let check = pool_check(pool, 0.5);
        assert!(!check().unwrap().0);
    }
}

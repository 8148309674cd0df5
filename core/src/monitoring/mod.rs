// Monitoring — metrics and health surfaces

pub mod health;
pub mod metrics;

pub use health::{
    interceptor_check, pool_check, HealthCheck, HealthCheckResult, HealthRegistry, HealthStatus,
};
pub use metrics::{
    HistogramSummary, MetricsRegistry, ACTIVE_CIRCUITS, STREAMS_DELAYED_TOTAL, STREAM_DELAY_MS,
};

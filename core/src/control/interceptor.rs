//! Stream event interceptor
//!
//! Subscribes to STREAM events on a control connection and, for every
//! stream being attached to a circuit (`NEW` / `NEWRESOLVE`), computes a
//! phase-derived delay and blocks the dispatch context for that long
//! before handing control back.
//!
//! The wait happens inside the listener, so delays are serialized: while
//! one stream is held, the connection cannot deliver the next event, and
//! under load the injected latency adds up across streams instead of
//! overlapping. Moving the wait onto independent timers would change that
//! behaviour and is deliberately not done here.

use super::abstraction::{
    ControlConnection, ControlConnector, ControlError, ControlEvent, EventCategory,
    EventListener, StreamEvent, DEFAULT_CONTROL_PORT,
};
use crate::monitoring::metrics::MetricsRegistry;
use crate::privacy::timing::{DelayComputation, SharedEngine};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Applies a computed delay to the calling context
pub trait DelayExecutor: Send + Sync {
    fn wait(&self, delay: Duration);
}

/// Blocks the current thread
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleepExecutor;

impl DelayExecutor for ThreadSleepExecutor {
    fn wait(&self, delay: Duration) {
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }
}

/// Records requested delays without sleeping
#[derive(Debug, Default)]
pub struct RecordingExecutor {
    waits: Mutex<Vec<Duration>>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn waits(&self) -> Vec<Duration> {
        self.waits.lock().clone()
    }

    pub fn total(&self) -> Duration {
        self.waits.lock().iter().sum()
    }
}

impl DelayExecutor for RecordingExecutor {
    fn wait(&self, delay: Duration) {
        self.waits.lock().push(delay);
    }
}

/// Connection settings for the interceptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterceptorConfig {
    /// Control port to connect to
    pub control_port: u16,
    /// Control password, if the daemon requires one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Also subscribe to CIRC events and drop phase state for closed circuits
    #[serde(default)]
    pub evict_on_circuit_close: bool,
}

impl Default for InterceptorConfig {
    fn default() -> Self {
        Self {
            control_port: DEFAULT_CONTROL_PORT,
            password: None,
            evict_on_circuit_close: false,
        }
    }
}

/// The per-event work done on the dispatch context
#[derive(Clone)]
pub struct StreamDelayHandler {
    engine: SharedEngine,
    executor: Arc<dyn DelayExecutor>,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl StreamDelayHandler {
    pub fn new(engine: SharedEngine, executor: Arc<dyn DelayExecutor>) -> Self {
        Self {
            engine,
            executor,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Delay the stream if it is being attached; other statuses are ignored.
    ///
    /// Returns the computation that was applied, if any.
    pub fn handle_stream(&self, event: &StreamEvent) -> Option<DelayComputation> {
        if !event.status.triggers_delay() {
            return None;
        }

        let fingerprint = event.fingerprint();
        let (computation, tracked) = {
            let mut engine = self.engine.lock();
            let computation = engine.compute(event.circuit_id, fingerprint);
            (computation, engine.tracked_circuits())
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_stream_delay(computation.delay, tracked);
        }

        self.executor.wait(computation.as_duration());

        debug!(
            "Applied delay {:.2}ms to stream {} ({:016x}) on circuit {}",
            computation.delay, event.stream_id, fingerprint, event.circuit_id
        );
        Some(computation)
    }

    /// Drop phase state for a circuit that has closed or failed
    pub fn handle_circuit(&self, circuit_id: u64) -> bool {
        self.engine.lock().forget_circuit(circuit_id)
    }

    fn stream_listener(&self) -> EventListener {
        let handler = self.clone();
        Arc::new(move |event: &ControlEvent| {
            if let ControlEvent::Stream(stream) = event {
                handler.handle_stream(stream);
            }
        })
    }

    fn circuit_listener(&self) -> EventListener {
        let handler = self.clone();
        Arc::new(move |event: &ControlEvent| {
            if let ControlEvent::Circuit(circuit) = event {
                if circuit.status.is_terminal() {
                    handler.handle_circuit(circuit.circuit_id);
                }
            }
        })
    }
}

/// STOPPED ⇄ ACTIVE stream interception session
pub struct StreamEventInterceptor {
    connector: Arc<dyn ControlConnector>,
    handler: StreamDelayHandler,
    config: InterceptorConfig,
    connection: Mutex<Option<Arc<dyn ControlConnection>>>,
    active: AtomicBool,
}

impl StreamEventInterceptor {
    /// Interceptor that blocks the dispatch thread for each delay
    pub fn new(
        connector: Arc<dyn ControlConnector>,
        engine: SharedEngine,
        config: InterceptorConfig,
    ) -> Self {
        Self::with_handler(
            connector,
            StreamDelayHandler::new(engine, Arc::new(ThreadSleepExecutor)),
            config,
        )
    }

    pub fn with_handler(
        connector: Arc<dyn ControlConnector>,
        handler: StreamDelayHandler,
        config: InterceptorConfig,
    ) -> Self {
        Self {
            connector,
            handler,
            config,
            connection: Mutex::new(None),
            active: AtomicBool::new(false),
        }
    }

    /// Connect if needed, subscribe to STREAM events and become active.
    ///
    /// Calling `start` while already active returns the live connection
    /// without subscribing twice. On error the interceptor stays stopped.
    pub fn start(&self) -> Result<Arc<dyn ControlConnection>, ControlError> {
        let mut slot = self.connection.lock();

        if self.active.load(Ordering::SeqCst) {
            if let Some(conn) = slot.as_ref() {
                return Ok(conn.clone());
            }
        }

        let conn = match slot.as_ref() {
            Some(conn) => conn.clone(),
            None => {
                info!("Connecting to control port {}", self.config.control_port);
                let conn = self.connector.connect(self.config.control_port)?;
                conn.authenticate(self.config.password.as_deref())?;
                info!("Connected and authenticated to control port");
                *slot = Some(conn.clone());
                conn
            }
        };

        conn.register_listener(EventCategory::Stream, self.handler.stream_listener())?;

        if self.config.evict_on_circuit_close {
            if let Err(e) =
                conn.register_listener(EventCategory::Circuit, self.handler.circuit_listener())
            {
                let _ = conn.unregister_listener(EventCategory::Stream);
                return Err(e);
            }
        }

        self.active.store(true, Ordering::SeqCst);
        info!("STREAM event interception active");
        Ok(conn)
    }

    /// Unsubscribe and return to STOPPED. No-op when already stopped.
    ///
    /// Safe to call from outside the dispatch context; a delay already in
    /// progress is not interrupted.
    pub fn stop(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        let conn = self.connection.lock().clone();
        if let Some(conn) = conn {
            if let Err(e) = conn.unregister_listener(EventCategory::Stream) {
                warn!("Failed to unregister STREAM listener: {}", e);
            }
            if self.config.evict_on_circuit_close {
                if let Err(e) = conn.unregister_listener(EventCategory::Circuit) {
                    warn!("Failed to unregister CIRC listener: {}", e);
                }
            }
        }
        info!("Stopped STREAM event interception");
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// The connection established by `start`, if any
    pub fn connection(&self) -> Option<Arc<dyn ControlConnection>> {
        self.connection.lock().clone()
    }

    pub fn handler(&self) -> &StreamDelayHandler {
        &self.handler
    }

    pub fn config(&self) -> &InterceptorConfig {
        &self.config
    }
}

impl Drop for StreamEventInterceptor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::abstraction::{CircuitEvent, CircuitStatus, StreamStatus};
    use crate::control::local::LocalEventSource;
    use crate::privacy::phase::SeededPhaseSource;
    use crate::privacy::timing::{PhaseDelayEngine, TimingConfig};
    use mockall::mock;

    mock! {
        Connector {}
        impl ControlConnector for Connector {
            fn connect(&self, port: u16) -> Result<Arc<dyn ControlConnection>, ControlError>;
        }
    }

    fn seeded_engine() -> SharedEngine {
        PhaseDelayEngine::new(TimingConfig::default(), Box::new(SeededPhaseSource))
            .unwrap()
            .into_shared()
    }

    fn recording_interceptor(
        source: Arc<LocalEventSource>,
        config: InterceptorConfig,
    ) -> (StreamEventInterceptor, Arc<RecordingExecutor>) {
        let executor = Arc::new(RecordingExecutor::new());
        let handler = StreamDelayHandler::new(seeded_engine(), executor.clone());
        (StreamEventInterceptor::with_handler(source, handler, config), executor)
    }

    fn stream(id: &str, circuit: u64, status: StreamStatus) -> ControlEvent {
        ControlEvent::Stream(StreamEvent::new(id, circuit, status))
    }

    #[test]
    fn test_initial_state_is_stopped() {
        let (interceptor, _) =
            recording_interceptor(Arc::new(LocalEventSource::new()), InterceptorConfig::default());
        assert!(!interceptor.is_active());
        assert!(interceptor.connection().is_none());
    }

    #[test]
    fn test_start_connects_on_configured_port() {
        let source = Arc::new(LocalEventSource::new());
        let config = InterceptorConfig {
            control_port: 9151,
            ..InterceptorConfig::default()
        };
        let (interceptor, _) = recording_interceptor(source.clone(), config);
        interceptor.start().unwrap();
        assert!(interceptor.is_active());
        let conn = source.connection().unwrap();
        assert_eq!(conn.port(), 9151);
        assert!(conn.has_listener(EventCategory::Stream));
        assert!(!conn.has_listener(EventCategory::Circuit));
    }

    #[test]
    fn test_start_twice_keeps_one_subscription() {
        let source = Arc::new(LocalEventSource::new());
        let (interceptor, _) = recording_interceptor(source, InterceptorConfig::default());
        interceptor.start().unwrap();
        assert!(interceptor.start().is_ok());
        assert!(interceptor.is_active());
    }

    #[test]
    fn test_connection_error_leaves_stopped() {
        let (interceptor, _) = recording_interceptor(
            Arc::new(LocalEventSource::unreachable()),
            InterceptorConfig::default(),
        );
        let err = interceptor.start().err().unwrap();
        assert!(matches!(err, ControlError::Connection(_)));
        assert!(!interceptor.is_active());
    }

    #[test]
    fn test_authentication_error_leaves_stopped() {
        let source = Arc::new(LocalEventSource::with_password("secret"));
        let (interceptor, _) = recording_interceptor(source.clone(), InterceptorConfig::default());
        let err = interceptor.start().err().unwrap();
        assert!(matches!(err, ControlError::Authentication(_)));
        assert!(!interceptor.is_active());
        assert!(interceptor.connection().is_none());
    }

    #[test]
    fn test_password_is_forwarded() {
        let source = Arc::new(LocalEventSource::with_password("secret"));
        let config = InterceptorConfig {
            password: Some("secret".to_string()),
            ..InterceptorConfig::default()
        };
        let (interceptor, _) = recording_interceptor(source, config);
        assert!(interceptor.start().is_ok());
    }

    #[test]
    fn test_mocked_connector_error_propagates() {
        let mut connector = MockConnector::new();
        connector
            .expect_connect()
            .withf(|port| *port == 9051)
            .times(1)
            .returning(|_| Err(ControlError::Connection("refused".to_string())));

        let interceptor = StreamEventInterceptor::new(
            Arc::new(connector),
            seeded_engine(),
            InterceptorConfig::default(),
        );
        assert_eq!(
            interceptor.start().err(),
            Some(ControlError::Connection("refused".to_string()))
        );
        assert!(!interceptor.is_active());
    }

    #[test]
    fn test_new_and_newresolve_are_delayed() {
        let source = Arc::new(LocalEventSource::new());
        let (interceptor, executor) =
            recording_interceptor(source.clone(), InterceptorConfig::default());
        interceptor.start().unwrap();

        source.dispatch(&stream("1", 5, StreamStatus::New));
        source.dispatch(&stream("2", 5, StreamStatus::NewResolve));
        assert_eq!(executor.waits().len(), 2);
        for wait in executor.waits() {
            let ms = wait.as_secs_f64() * 1000.0;
            assert!((0.1 - 1e-9..=10.0 + 1e-9).contains(&ms));
        }
    }

    #[test]
    fn test_other_statuses_are_ignored() {
        let source = Arc::new(LocalEventSource::new());
        let (interceptor, executor) =
            recording_interceptor(source.clone(), InterceptorConfig::default());
        interceptor.start().unwrap();

        for status in [
            StreamStatus::Succeeded,
            StreamStatus::Closed,
            StreamStatus::SentConnect,
            StreamStatus::Other("XOFF_SENT".to_string()),
        ] {
            source.dispatch(&stream("1", 5, status));
        }
        assert!(executor.waits().is_empty());
        assert_eq!(interceptor.handler().engine.lock().tracked_circuits(), 0);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let source = Arc::new(LocalEventSource::new());
        let (interceptor, _) = recording_interceptor(source.clone(), InterceptorConfig::default());
        interceptor.start().unwrap();

        interceptor.stop();
        assert!(!interceptor.is_active());
        interceptor.stop();
        assert!(!interceptor.is_active());
        assert!(!source.connection().unwrap().has_listener(EventCategory::Stream));
    }

    #[test]
    fn test_stop_before_start_is_noop() {
        let (interceptor, _) =
            recording_interceptor(Arc::new(LocalEventSource::new()), InterceptorConfig::default());
        interceptor.stop();
        assert!(!interceptor.is_active());
    }

    #[test]
    fn test_no_delays_after_stop() {
        let source = Arc::new(LocalEventSource::new());
        let (interceptor, executor) =
            recording_interceptor(source.clone(), InterceptorConfig::default());
        interceptor.start().unwrap();
        interceptor.stop();
        assert!(!source.dispatch(&stream("1", 1, StreamStatus::New)));
        assert!(executor.waits().is_empty());
    }

    #[test]
    fn test_restart_reuses_connection() {
        let source = Arc::new(LocalEventSource::new());
        let (interceptor, executor) =
            recording_interceptor(source.clone(), InterceptorConfig::default());
        interceptor.start().unwrap();
        interceptor.stop();
        // a new connect would fail now
        source.set_reachable(false);
        interceptor.start().unwrap();
        assert!(interceptor.is_active());
        source.dispatch(&stream("1", 1, StreamStatus::New));
        assert_eq!(executor.waits().len(), 1);
    }

    #[test]
    fn test_circuit_close_evicts_phase_state() {
        let source = Arc::new(LocalEventSource::new());
        let config = InterceptorConfig {
            evict_on_circuit_close: true,
            ..InterceptorConfig::default()
        };
        let (interceptor, _) = recording_interceptor(source.clone(), config);
        interceptor.start().unwrap();

        source.dispatch(&stream("1", 7, StreamStatus::New));
        assert!(interceptor.handler().engine.lock().last_phase(7).is_some());

        source.dispatch(&ControlEvent::Circuit(CircuitEvent {
            circuit_id: 7,
            status: CircuitStatus::Built,
        }));
        assert!(interceptor.handler().engine.lock().last_phase(7).is_some());

        source.dispatch(&ControlEvent::Circuit(CircuitEvent {
            circuit_id: 7,
            status: CircuitStatus::Closed,
        }));
        assert!(interceptor.handler().engine.lock().last_phase(7).is_none());

        interceptor.stop();
        let conn = source.connection().unwrap();
        assert!(!conn.has_listener(EventCategory::Circuit));
    }

    #[test]
    fn test_metrics_recorded_per_delay() {
        let source = Arc::new(LocalEventSource::new());
        let metrics = Arc::new(MetricsRegistry::new());
        let handler = StreamDelayHandler::new(seeded_engine(), Arc::new(RecordingExecutor::new()))
            .with_metrics(metrics.clone());
        let interceptor =
            StreamEventInterceptor::with_handler(source.clone(), handler, InterceptorConfig::default());
        interceptor.start().unwrap();

        source.dispatch(&stream("1", 1, StreamStatus::New));
        source.dispatch(&stream("2", 2, StreamStatus::New));
        source.dispatch(&stream("3", 2, StreamStatus::Closed));

        use crate::monitoring::metrics::{ACTIVE_CIRCUITS, STREAMS_DELAYED_TOTAL};
        assert_eq!(metrics.counter(STREAMS_DELAYED_TOTAL), 2);
        assert_eq!(metrics.gauge(ACTIVE_CIRCUITS), 2.0);
    }

    #[test]
    fn test_oversized_delay_saturates_instead_of_panicking() {
        let config = TimingConfig {
            winding_quantum: 1.0,
            min_delay: 1e300,
            max_delay: 1e300,
        };
        let engine = PhaseDelayEngine::new(config, Box::new(SeededPhaseSource))
            .unwrap()
            .into_shared();
        let executor = Arc::new(RecordingExecutor::new());
        let source = Arc::new(LocalEventSource::new());
        let interceptor = StreamEventInterceptor::with_handler(
            source.clone(),
            StreamDelayHandler::new(engine, executor.clone()),
            InterceptorConfig::default(),
        );
        interceptor.start().unwrap();

        assert!(source.dispatch(&stream("1", 1, StreamStatus::New)));
        assert_eq!(executor.waits(), vec![Duration::MAX]);
    }

    #[test]
    fn test_thread_sleep_executor_blocks() {
        let start = std::time::Instant::now();
        ThreadSleepExecutor.wait(Duration::from_millis(5));
        assert!(start.elapsed() >= Duration::from_millis(5));
    }
}

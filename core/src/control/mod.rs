// Control — event-source contract and stream interception
//
// The daemon control connection is modelled only by the traits in
// `abstraction`; `local` is an in-process implementation of them.

pub mod abstraction;
pub mod interceptor;
pub mod local;

pub use abstraction::{
    CircuitEvent, CircuitStatus, ControlConnection, ControlConnector, ControlError, ControlEvent,
    EventCategory, EventListener, StreamEvent, StreamStatus, DEFAULT_CONTROL_PORT,
};
pub use interceptor::{
    DelayExecutor, InterceptorConfig, RecordingExecutor, StreamDelayHandler,
    StreamEventInterceptor, ThreadSleepExecutor,
};
pub use local::{LocalConnection, LocalEventSource};

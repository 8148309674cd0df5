//! Control-connection abstraction for QTOP
//!
//! Defines the event types and the connect/authenticate/subscribe contract
//! the interceptor depends on. Nothing here knows about a wire format;
//! concrete connections live behind [`ControlConnector`].

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Default control port of the anonymity-network daemon
pub const DEFAULT_CONTROL_PORT: u16 = 9051;

/// Event categories a listener can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventCategory {
    /// Stream lifecycle notifications
    Stream,
    /// Circuit lifecycle notifications
    Circuit,
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventCategory::Stream => write!(f, "STREAM"),
            EventCategory::Circuit => write!(f, "CIRC"),
        }
    }
}

/// Stream status vocabulary
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StreamStatus {
    New,
    NewResolve,
    Remap,
    SentConnect,
    SentResolve,
    Succeeded,
    Failed,
    Closed,
    Detached,
    ControllerWait,
    /// Any status not in the list above, kept verbatim
    Other(String),
}

impl StreamStatus {
    /// Whether this status marks a stream being attached to a circuit
    pub fn triggers_delay(&self) -> bool {
        matches!(self, StreamStatus::New | StreamStatus::NewResolve)
    }

    pub fn as_str(&self) -> &str {
        match self {
            StreamStatus::New => "NEW",
            StreamStatus::NewResolve => "NEWRESOLVE",
            StreamStatus::Remap => "REMAP",
            StreamStatus::SentConnect => "SENTCONNECT",
            StreamStatus::SentResolve => "SENTRESOLVE",
            StreamStatus::Succeeded => "SUCCEEDED",
            StreamStatus::Failed => "FAILED",
            StreamStatus::Closed => "CLOSED",
            StreamStatus::Detached => "DETACHED",
            StreamStatus::ControllerWait => "CONTROLLER_WAIT",
            StreamStatus::Other(s) => s,
        }
    }
}

impl From<&str> for StreamStatus {
    fn from(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "NEW" => StreamStatus::New,
            "NEWRESOLVE" => StreamStatus::NewResolve,
            "REMAP" => StreamStatus::Remap,
            "SENTCONNECT" => StreamStatus::SentConnect,
            "SENTRESOLVE" => StreamStatus::SentResolve,
            "SUCCEEDED" => StreamStatus::Succeeded,
            "FAILED" => StreamStatus::Failed,
            "CLOSED" => StreamStatus::Closed,
            "DETACHED" => StreamStatus::Detached,
            "CONTROLLER_WAIT" => StreamStatus::ControllerWait,
            _ => StreamStatus::Other(s.to_string()),
        }
    }
}

impl From<String> for StreamStatus {
    fn from(s: String) -> Self {
        StreamStatus::from(s.as_str())
    }
}

impl From<StreamStatus> for String {
    fn from(status: StreamStatus) -> Self {
        status.as_str().to_string()
    }
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A stream lifecycle notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Stream identifier assigned by the daemon
    pub stream_id: String,
    /// Circuit the stream is attached to (0 when unattached)
    pub circuit_id: u64,
    pub status: StreamStatus,
    /// Destination `host:port`, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl StreamEvent {
    pub fn new(stream_id: impl Into<String>, circuit_id: u64, status: StreamStatus) -> Self {
        Self {
            stream_id: stream_id.into(),
            circuit_id,
            status,
            target: None,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Stable 64-bit fingerprint of the stream's identity.
    ///
    /// Hashes the stream id; an event without one falls back to its
    /// circuit, status and target.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = Sha256::new();
        if self.stream_id.is_empty() {
            hasher.update(self.circuit_id.to_le_bytes());
            hasher.update(self.status.as_str().as_bytes());
            if let Some(target) = &self.target {
                hasher.update(target.as_bytes());
            }
        } else {
            hasher.update(self.stream_id.as_bytes());
        }
        let digest = hasher.finalize();
        let mut word = [0u8; 8];
        word.copy_from_slice(&digest[..8]);
        u64::from_le_bytes(word)
    }
}

impl fmt::Display for StreamEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "STREAM {} {} circuit={}",
            self.stream_id, self.status, self.circuit_id
        )?;
        if let Some(target) = &self.target {
            write!(f, " target={}", target)?;
        }
        Ok(())
    }
}

/// Circuit status vocabulary
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CircuitStatus {
    Launched,
    Built,
    Extended,
    Failed,
    Closed,
    Other(String),
}

impl CircuitStatus {
    /// Whether the circuit is gone for good
    pub fn is_terminal(&self) -> bool {
        matches!(self, CircuitStatus::Failed | CircuitStatus::Closed)
    }

    pub fn as_str(&self) -> &str {
        match self {
            CircuitStatus::Launched => "LAUNCHED",
            CircuitStatus::Built => "BUILT",
            CircuitStatus::Extended => "EXTENDED",
            CircuitStatus::Failed => "FAILED",
            CircuitStatus::Closed => "CLOSED",
            CircuitStatus::Other(s) => s,
        }
    }
}

impl From<&str> for CircuitStatus {
    fn from(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "LAUNCHED" => CircuitStatus::Launched,
            "BUILT" => CircuitStatus::Built,
            "EXTENDED" => CircuitStatus::Extended,
            "FAILED" => CircuitStatus::Failed,
            "CLOSED" => CircuitStatus::Closed,
            _ => CircuitStatus::Other(s.to_string()),
        }
    }
}

impl From<String> for CircuitStatus {
    fn from(s: String) -> Self {
        CircuitStatus::from(s.as_str())
    }
}

impl From<CircuitStatus> for String {
    fn from(status: CircuitStatus) -> Self {
        status.as_str().to_string()
    }
}

/// A circuit lifecycle notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitEvent {
    pub circuit_id: u64,
    pub status: CircuitStatus,
}

/// Any event delivered by a control connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlEvent {
    Stream(StreamEvent),
    Circuit(CircuitEvent),
}

impl ControlEvent {
    pub fn category(&self) -> EventCategory {
        match self {
            ControlEvent::Stream(_) => EventCategory::Stream,
            ControlEvent::Circuit(_) => EventCategory::Circuit,
        }
    }
}

impl fmt::Display for ControlEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlEvent::Stream(event) => write!(f, "{}", event),
            ControlEvent::Circuit(event) => {
                write!(f, "CIRC {} {}", event.circuit_id, event.status.as_str())
            }
        }
    }
}

/// Callback invoked once per delivered event, on the dispatch context
pub type EventListener = Arc<dyn Fn(&ControlEvent) + Send + Sync>;

/// Errors that can occur on the control connection
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Listener already registered for {0}")]
    AlreadyRegistered(EventCategory),

    #[error("No listener registered for {0}")]
    NotRegistered(EventCategory),
}

/// An established control connection
pub trait ControlConnection: Send + Sync {
    /// Authenticate, with or without a password
    fn authenticate(&self, password: Option<&str>) -> Result<(), ControlError>;

    /// Subscribe `listener` to one event category
    fn register_listener(
        &self,
        category: EventCategory,
        listener: EventListener,
    ) -> Result<(), ControlError>;

    /// Drop the subscription for one event category
    fn unregister_listener(&self, category: EventCategory) -> Result<(), ControlError>;
}

/// Opens control connections
pub trait ControlConnector: Send + Sync {
    fn connect(&self, port: u16) -> Result<Arc<dyn ControlConnection>, ControlError>;
}

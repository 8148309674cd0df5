//! In-process control connection
//!
//! Delivers events to registered listeners from whatever thread calls
//! [`LocalConnection::dispatch`]. Dispatch is serialized: a second caller
//! waits until the listener running for the first event has returned,
//! which matches a daemon connection with a single event thread.

use super::abstraction::{
    ControlConnection, ControlConnector, ControlError, ControlEvent, EventCategory,
    EventListener,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

pub struct LocalConnection {
    port: u16,
    password: Option<String>,
    authenticated: AtomicBool,
    listeners: RwLock<HashMap<EventCategory, EventListener>>,
    dispatch_lock: Mutex<()>,
    delivered: AtomicU64,
}

impl LocalConnection {
    fn new(port: u16, password: Option<String>) -> Self {
        Self {
            port,
            password,
            authenticated: AtomicBool::new(false),
            listeners: RwLock::new(HashMap::new()),
            dispatch_lock: Mutex::new(()),
            delivered: AtomicU64::new(0),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    /// Whether a listener is registered for `category`
    pub fn has_listener(&self, category: EventCategory) -> bool {
        self.listeners.read().contains_key(&category)
    }

    /// Deliver one event; returns whether a listener received it.
    ///
    /// Blocks until the listener returns.
    pub fn dispatch(&self, event: &ControlEvent) -> bool {
        let _serial = self.dispatch_lock.lock();
        let listener = self.listeners.read().get(&event.category()).cloned();
        match listener {
            Some(listener) => {
                listener(event);
                self.delivered.fetch_add(1, Ordering::SeqCst);
                true
            }
            None => {
                debug!("No listener for {}, dropping event", event.category());
                false
            }
        }
    }

    /// Number of events handed to a listener so far
    pub fn delivered_count(&self) -> u64 {
        self.delivered.load(Ordering::SeqCst)
    }
}

impl ControlConnection for LocalConnection {
    fn authenticate(&self, password: Option<&str>) -> Result<(), ControlError> {
        match (&self.password, password) {
            (None, _) => {}
            (Some(expected), Some(given)) if expected == given => {}
            (Some(_), Some(_)) => {
                return Err(ControlError::Authentication("password rejected".to_string()))
            }
            (Some(_), None) => {
                return Err(ControlError::Authentication("password required".to_string()))
            }
        }
        self.authenticated.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn register_listener(
        &self,
        category: EventCategory,
        listener: EventListener,
    ) -> Result<(), ControlError> {
        if !self.is_authenticated() {
            return Err(ControlError::Authentication("not authenticated".to_string()));
        }
        let mut listeners = self.listeners.write();
        if listeners.contains_key(&category) {
            return Err(ControlError::AlreadyRegistered(category));
        }
        listeners.insert(category, listener);
        Ok(())
    }

    fn unregister_listener(&self, category: EventCategory) -> Result<(), ControlError> {
        self.listeners
            .write()
            .remove(&category)
            .map(|_| ())
            .ok_or(ControlError::NotRegistered(category))
    }
}

/// Connector handing out a single shared [`LocalConnection`]
pub struct LocalEventSource {
    reachable: AtomicBool,
    password: Option<String>,
    connection: Mutex<Option<Arc<LocalConnection>>>,
}

impl LocalEventSource {
    /// Reachable source accepting any authentication
    pub fn new() -> Self {
        Self {
            reachable: AtomicBool::new(true),
            password: None,
            connection: Mutex::new(None),
        }
    }

    /// Reachable source requiring `password`
    pub fn with_password(password: impl Into<String>) -> Self {
        Self {
            password: Some(password.into()),
            ..Self::new()
        }
    }

    /// Source whose connect attempts fail
    pub fn unreachable() -> Self {
        let source = Self::new();
        source.reachable.store(false, Ordering::SeqCst);
        source
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// The connection handed out by the last successful `connect`
    pub fn connection(&self) -> Option<Arc<LocalConnection>> {
        self.connection.lock().clone()
    }

    /// Dispatch through the current connection; false if not connected
    pub fn dispatch(&self, event: &ControlEvent) -> bool {
        match self.connection() {
            Some(conn) => conn.dispatch(event),
            None => false,
        }
    }
}

impl Default for LocalEventSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlConnector for LocalEventSource {
    fn connect(&self, port: u16) -> Result<Arc<dyn ControlConnection>, ControlError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(ControlError::Connection(format!(
                "control port {} unreachable",
                port
            )));
        }
        let conn = Arc::new(LocalConnection::new(port, self.password.clone()));
        *self.connection.lock() = Some(conn.clone());
        Ok(conn)
    }
}

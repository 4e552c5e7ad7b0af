//! Broker connection facade.
//!
//! A [`Connection`] exposes exactly one "on message" and one "on connect"
//! slot. Sharing those slots between many parameters is the job of
//! [`CallbackChain`](crate::chain::CallbackChain).

use std::sync::Arc;

use parking_lot::RwLock;
use strum::Display;
use zenoh::Result;

/// Connect return codes, numbered like MQTT 3.1.1 CONNACK codes
pub mod return_code {
    pub const ACCEPTED: u8 = 0;
    pub const UNACCEPTABLE_PROTOCOL: u8 = 1;
    pub const IDENTIFIER_REJECTED: u8 = 2;
    pub const SERVER_UNAVAILABLE: u8 = 3;
    pub const BAD_CREDENTIALS: u8 = 4;
    pub const NOT_AUTHORIZED: u8 = 5;

    /// Human readable meaning of a return code
    pub fn describe(code: u8) -> &'static str {
        match code {
            ACCEPTED => "connection accepted",
            UNACCEPTABLE_PROTOCOL => "unacceptable protocol version",
            IDENTIFIER_REJECTED => "client identifier rejected",
            SERVER_UNAVAILABLE => "server unavailable",
            BAD_CREDENTIALS => "bad user name or password",
            NOT_AUTHORIZED => "not authorized",
            _ => "unknown return code",
        }
    }
}

/// A message received on a subscribed topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new<T: Into<String>, P: Into<Vec<u8>>>(topic: T, payload: P) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Outcome of a connect attempt, delivered through the "on connect" slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectEvent {
    pub return_code: u8,
}

impl ConnectEvent {
    pub fn accepted() -> Self {
        Self {
            return_code: return_code::ACCEPTED,
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.return_code == return_code::ACCEPTED
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Snapshot of a connection's state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub connected: bool,
    /// Last non-success return code, kept for diagnostics
    pub last_return_code: Option<u8>,
}

impl ConnectionStatus {
    /// Apply a connect outcome: success marks the connection live, failure
    /// records the code and leaves it down.
    pub fn apply(&mut self, event: &ConnectEvent) {
        if event.is_accepted() {
            self.state = ConnectionState::Connected;
            self.connected = true;
        } else {
            self.state = ConnectionState::Disconnected;
            self.connected = false;
            self.last_return_code = Some(event.return_code);
        }
    }
}

/// Errors that can occur while establishing a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// No acknowledgment arrived within the connect timeout
    Timeout {
        timeout_secs: u64,
        last_return_code: Option<u8>,
    },
    /// The broker or transport refused the connection
    Rejected { return_code: u8, reason: String },
}

impl std::fmt::Display for ConnectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout {
                timeout_secs,
                last_return_code,
            } => match last_return_code {
                Some(rc) => write!(
                    f,
                    "Connect timed out after {}s (last return code {})",
                    timeout_secs, rc
                ),
                None => write!(f, "Connect timed out after {}s", timeout_secs),
            },
            Self::Rejected {
                return_code,
                reason,
            } => write!(f, "Connect rejected with code {}: {}", return_code, reason),
        }
    }
}

impl std::error::Error for ConnectError {}

pub type EventHandler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// A single mutable handler slot.
pub struct EventSlot<E> {
    handler: RwLock<Option<EventHandler<E>>>,
}

impl<E> Default for EventSlot<E> {
    fn default() -> Self {
        Self {
            handler: RwLock::new(None),
        }
    }
}

impl<E> EventSlot<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a handler, returning the previous occupant
    pub fn replace(&self, handler: EventHandler<E>) -> Option<EventHandler<E>> {
        self.handler.write().replace(handler)
    }

    pub fn take(&self) -> Option<EventHandler<E>> {
        self.handler.write().take()
    }

    pub fn get(&self) -> Option<EventHandler<E>> {
        self.handler.read().clone()
    }

    pub fn is_set(&self) -> bool {
        self.handler.read().is_some()
    }

    /// Invoke the current occupant, if any. The slot lock is released before
    /// the handler runs.
    pub fn fire(&self, event: &E) -> bool {
        match self.get() {
            Some(handler) => {
                handler(event);
                true
            }
            None => false,
        }
    }
}

impl<E> std::fmt::Debug for EventSlot<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSlot")
            .field("set", &self.is_set())
            .finish()
    }
}

/// The broker connection as seen by parameters.
pub trait Connection: Send + Sync {
    fn subscribe(&self, topic: &str) -> Result<()>;

    fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<()>;

    fn on_message(&self) -> &EventSlot<Message>;

    fn on_connect(&self) -> &EventSlot<ConnectEvent>;

    fn status(&self) -> ConnectionStatus;

    fn disconnect(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_slot_replace_returns_previous() {
        let slot: EventSlot<u8> = EventSlot::new();
        assert!(!slot.fire(&1));

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        assert!(slot.replace(Arc::new(move |_: &u8| {
            h.fetch_add(1, Ordering::Relaxed);
        })).is_none());
        assert!(slot.fire(&1));

        let previous = slot.replace(Arc::new(|_: &u8| {}));
        assert!(previous.is_some());
        assert!(slot.fire(&1));
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_status_apply() {
        let mut status = ConnectionStatus::default();
        assert_eq!(status.state, ConnectionState::Disconnected);

        status.apply(&ConnectEvent {
            return_code: return_code::NOT_AUTHORIZED,
        });
        assert!(!status.connected);
        assert_eq!(status.last_return_code, Some(5));

        status.apply(&ConnectEvent::accepted());
        assert!(status.connected);
        assert_eq!(status.state, ConnectionState::Connected);
        // diagnostics survive a later success
        assert_eq!(status.last_return_code, Some(5));
    }

    #[test]
    fn test_connect_error_display() {
        let err = ConnectError::Timeout {
            timeout_secs: 5,
            last_return_code: None,
        };
        assert_eq!(err.to_string(), "Connect timed out after 5s");

        let err = ConnectError::Rejected {
            return_code: return_code::SERVER_UNAVAILABLE,
            reason: "no route".into(),
        };
        assert_eq!(err.to_string(), "Connect rejected with code 3: no route");
    }

    #[test]
    fn test_return_codes_are_described() {
        assert_eq!(return_code::describe(return_code::ACCEPTED), "connection accepted");
        assert_eq!(
            return_code::describe(return_code::UNACCEPTABLE_PROTOCOL),
            "unacceptable protocol version"
        );
        assert_eq!(
            return_code::describe(return_code::IDENTIFIER_REJECTED),
            "client identifier rejected"
        );
        assert_eq!(return_code::describe(return_code::NOT_AUTHORIZED), "not authorized");
        assert_eq!(return_code::describe(42), "unknown return code");
    }
}

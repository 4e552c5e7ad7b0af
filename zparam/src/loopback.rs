//! In-process broker connection.
//!
//! `LoopbackConnection` behaves like a broker client whose broker lives in
//! the same process: publishes are echoed to matching subscriptions, retained
//! payloads are replayed on subscribe, and connects or transport losses are
//! triggered explicitly. Every subscribe and publish is recorded.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use zenoh::Result;

use crate::connection::{
    ConnectEvent, Connection, ConnectionState, ConnectionStatus, EventSlot, Message,
};
use crate::topic::validate_topic;

/// A recorded publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

impl Published {
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

#[derive(Default)]
struct Broker {
    subscribed: HashSet<String>,
    retained: HashMap<String, Vec<u8>>,
    subscribe_log: Vec<String>,
    published: Vec<Published>,
}

pub struct LoopbackConnection {
    on_message: EventSlot<Message>,
    on_connect: EventSlot<ConnectEvent>,
    status: Arc<Mutex<ConnectionStatus>>,
    broker: Mutex<Broker>,
}

impl Default for LoopbackConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackConnection {
    /// A disconnected loopback whose base connect handler tracks the status
    pub fn new() -> Self {
        let status = Arc::new(Mutex::new(ConnectionStatus::default()));
        let on_connect = EventSlot::new();
        let s = status.clone();
        on_connect.replace(Arc::new(move |event: &ConnectEvent| {
            s.lock().apply(event);
        }));

        Self {
            on_message: EventSlot::new(),
            on_connect,
            status,
            broker: Mutex::new(Broker::default()),
        }
    }

    /// A loopback that has already completed its first connect
    pub fn connected() -> Self {
        let conn = Self::new();
        conn.simulate_connect(ConnectEvent::accepted().return_code);
        conn
    }

    /// Run a connect attempt ending with `return_code`
    pub fn simulate_connect(&self, return_code: u8) {
        self.status.lock().state = ConnectionState::Connecting;
        info!(
            "[LOOP] Connect attempt finished: rc={} ({})",
            return_code,
            crate::connection::return_code::describe(return_code)
        );
        self.on_connect.fire(&ConnectEvent { return_code });
    }

    /// Drop the transport; the next `simulate_connect` is a reconnect
    pub fn simulate_connection_lost(&self) {
        let mut status = self.status.lock();
        status.state = ConnectionState::Connecting;
        status.connected = false;
        warn!("[LOOP] Connection lost");
    }

    /// Hand a raw message to the "on message" slot, subscribed or not
    pub fn deliver<T: Into<String>, P: Into<Vec<u8>>>(&self, topic: T, payload: P) -> bool {
        self.on_message.fire(&Message::new(topic, payload))
    }

    /// Topics passed to `subscribe`, in call order
    pub fn subscribe_log(&self) -> Vec<String> {
        self.broker.lock().subscribe_log.clone()
    }

    pub fn clear_subscribe_log(&self) {
        self.broker.lock().subscribe_log.clear();
    }

    pub fn published(&self) -> Vec<Published> {
        self.broker.lock().published.clone()
    }

    pub fn retained(&self, topic: &str) -> Option<Vec<u8>> {
        self.broker.lock().retained.get(topic).cloned()
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.broker.lock().subscribed.contains(topic)
    }
}

impl Connection for LoopbackConnection {
    fn subscribe(&self, topic: &str) -> Result<()> {
        validate_topic(topic)?;
        let replay = {
            let mut broker = self.broker.lock();
            broker.subscribe_log.push(topic.to_string());
            broker.subscribed.insert(topic.to_string());
            broker.retained.get(topic).cloned()
        };
        debug!("[LOOP] Subscribed: topic={}", topic);

        if let Some(payload) = replay {
            self.on_message.fire(&Message::new(topic, payload));
        }
        Ok(())
    }

    fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<()> {
        validate_topic(topic)?;
        let echo = {
            let mut broker = self.broker.lock();
            broker.published.push(Published {
                topic: topic.to_string(),
                payload: payload.to_vec(),
                retain,
            });
            if retain {
                broker.retained.insert(topic.to_string(), payload.to_vec());
            }
            broker.subscribed.contains(topic)
        };

        if echo {
            self.on_message.fire(&Message::new(topic, payload));
        }
        Ok(())
    }

    fn on_message(&self) -> &EventSlot<Message> {
        &self.on_message
    }

    fn on_connect(&self) -> &EventSlot<ConnectEvent> {
        &self.on_connect
    }

    fn status(&self) -> ConnectionStatus {
        *self.status.lock()
    }

    fn disconnect(&self) -> Result<()> {
        let mut status = self.status.lock();
        status.state = ConnectionState::Disconnected;
        status.connected = false;
        self.broker.lock().subscribed.clear();
        info!("[LOOP] Disconnected");
        Ok(())
    }
}

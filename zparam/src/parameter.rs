//! Typed parameters mirrored from broker topics.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::chain::HandlerError;
use crate::connection::{ConnectEvent, Connection, Message};
use crate::decode::{ParamKind, ParamValue};
use crate::topic::{TopicError, parameter_topic};

/// A named value kept in sync with `<root>/<lowercased entity id>`.
///
/// The value starts at the declared default and is overwritten by every
/// message on the parameter topic that decodes successfully.
pub struct Parameter<T: ParamValue> {
    entity_id: String,
    topic: String,
    value: RwLock<T>,
    updates: AtomicU64,
    decode_failures: AtomicU64,
}

pub type IntParameter = Parameter<i64>;
pub type FloatParameter = Parameter<f64>;
pub type BoolParameter = Parameter<bool>;

impl<T: ParamValue> Parameter<T> {
    pub fn new(entity_id: &str, root_topic: &str, default: T) -> Result<Self, TopicError> {
        let topic = parameter_topic(root_topic, entity_id)?;
        Ok(Self {
            entity_id: entity_id.to_string(),
            topic,
            value: RwLock::new(default),
            updates: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
        })
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn kind(&self) -> ParamKind {
        T::KIND
    }

    /// Last decoded value, or the default if nothing arrived yet
    pub fn value(&self) -> T {
        *self.value.read()
    }

    /// Number of accepted updates
    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::Acquire)
    }

    /// Number of payloads on this topic that failed to decode
    pub fn decode_failures(&self) -> u64 {
        self.decode_failures.load(Ordering::Acquire)
    }

    /// Message chain entry: messages on other topics are ignored, a payload
    /// that fails to decode leaves the value untouched.
    pub fn handle_message(&self, message: &Message) -> Result<(), HandlerError> {
        if message.topic != self.topic {
            return Ok(());
        }

        match T::decode(&message.payload) {
            Ok(value) => {
                *self.value.write() = value;
                self.updates.fetch_add(1, Ordering::AcqRel);
                debug!("[PARAM] {} = {:?}", self.entity_id, value);
                Ok(())
            }
            Err(e) => {
                self.decode_failures.fetch_add(1, Ordering::AcqRel);
                Err(e.into())
            }
        }
    }

    /// Connect chain entry: re-subscribe whatever the return code was.
    pub fn resubscribe(
        &self,
        connection: &dyn Connection,
        event: &ConnectEvent,
    ) -> Result<(), HandlerError> {
        trace!(
            "[PARAM] {}: resubscribing {} (rc={})",
            self.entity_id, self.topic, event.return_code
        );
        connection.subscribe(&self.topic)?;
        Ok(())
    }
}

impl<T: ParamValue> std::fmt::Debug for Parameter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Parameter")
            .field("entity_id", &self.entity_id)
            .field("topic", &self.topic)
            .field("value", &self.value())
            .finish()
    }
}

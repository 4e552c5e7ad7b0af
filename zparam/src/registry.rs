//! The set of parameters sharing one broker connection.
//!
//! The registry owns the connection handle and one [`CallbackChain`] per
//! connection event. Both chains are attached to the connection's slots when
//! the registry is created; every declared parameter adds one link to each.

use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::{info, warn};
use zenoh::Result;

use crate::chain::{CallbackChain, attach_connect_chain, attach_message_chain};
use crate::config::BrokerConfig;
use crate::connection::{ConnectEvent, Connection, Message};
use crate::decode::{ParamKind, ParamValue};
use crate::parameter::{BoolParameter, FloatParameter, IntParameter, Parameter};
use crate::topic::publish_topic;

/// Declared parameter as listed by [`ParameterRegistry::parameters`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterInfo {
    pub entity_id: String,
    pub topic: String,
    pub kind: ParamKind,
}

pub struct ParameterRegistry {
    connection: Arc<dyn Connection>,
    root_topic: String,
    control_root: String,
    messages: Arc<CallbackChain<Message>>,
    connects: Arc<CallbackChain<ConnectEvent>>,
    declared: RwLock<Vec<ParameterInfo>>,
}

impl ParameterRegistry {
    /// Take over the connection's event slots. Handlers already installed in
    /// them keep firing first.
    pub fn new<R, C>(connection: Arc<dyn Connection>, root_topic: R, control_root: C) -> Self
    where
        R: Into<String>,
        C: Into<String>,
    {
        let messages = Arc::new(CallbackChain::new("on_message"));
        let connects = Arc::new(CallbackChain::new("on_connect"));
        attach_message_chain(connection.as_ref(), &messages);
        attach_connect_chain(connection.as_ref(), &connects);

        Self {
            connection,
            root_topic: root_topic.into(),
            control_root: control_root.into(),
            messages,
            connects,
            declared: RwLock::new(Vec::new()),
        }
    }

    pub fn from_config(connection: Arc<dyn Connection>, config: &BrokerConfig) -> Self {
        Self::new(connection, config.root_topic.clone(), config.control_root.clone())
    }

    pub fn root_topic(&self) -> &str {
        &self.root_topic
    }

    pub fn control_root(&self) -> &str {
        &self.control_root
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub fn message_chain(&self) -> &Arc<CallbackChain<Message>> {
        &self.messages
    }

    pub fn connect_chain(&self) -> &Arc<CallbackChain<ConnectEvent>> {
        &self.connects
    }

    /// Declare a parameter bound to `<root>/<lowercased entity_id>`.
    ///
    /// The parameter is chained into both events before its first
    /// subscription, so a retained value delivered on subscribe is applied.
    /// Only an invalid topic fails; nothing is registered in that case.
    pub fn declare<T: ParamValue>(&self, entity_id: &str, default: T) -> Result<Arc<Parameter<T>>> {
        let parameter = Arc::new(Parameter::new(entity_id, &self.root_topic, default)?);

        let p = parameter.clone();
        self.messages
            .register(entity_id, move |message: &Message| p.handle_message(message));

        let p = parameter.clone();
        let connection: Weak<dyn Connection> = Arc::downgrade(&self.connection);
        self.connects.register(entity_id, move |event: &ConnectEvent| {
            match connection.upgrade() {
                Some(connection) => p.resubscribe(connection.as_ref(), event),
                None => Ok(()),
            }
        });

        self.declared.write().push(ParameterInfo {
            entity_id: entity_id.to_string(),
            topic: parameter.topic().to_string(),
            kind: T::KIND,
        });

        // The parameter is fully registered at this point; a failed first
        // subscribe is retried by the connect chain.
        if let Err(e) = self.connection.subscribe(parameter.topic()) {
            warn!(
                "[PARAM] Initial subscribe to {} failed, next connect retries it: {}",
                parameter.topic(),
                e
            );
            return Ok(parameter);
        }
        info!(
            "[PARAM] Declared {} parameter '{}' on {}",
            T::KIND,
            entity_id,
            parameter.topic()
        );

        Ok(parameter)
    }

    pub fn declare_int(&self, entity_id: &str, default: i64) -> Result<Arc<IntParameter>> {
        self.declare(entity_id, default)
    }

    pub fn declare_float(&self, entity_id: &str, default: f64) -> Result<Arc<FloatParameter>> {
        self.declare(entity_id, default)
    }

    pub fn declare_bool(&self, entity_id: &str, default: bool) -> Result<Arc<BoolParameter>> {
        self.declare(entity_id, default)
    }

    /// Declared parameters in declaration order
    pub fn parameters(&self) -> Vec<ParameterInfo> {
        self.declared.read().clone()
    }

    pub fn len(&self) -> usize {
        self.declared.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.declared.read().is_empty()
    }

    /// Publish a control value to `<control_root><key>` as a retained
    /// three-decimal string. Returns the payload sent.
    pub fn publish(&self, key: &str, value: f64) -> Result<String> {
        self.publish_value(key, value)
    }

    /// Publish any parameter value, retained, in its wire text form
    pub fn publish_value<T: ParamValue>(&self, key: &str, value: T) -> Result<String> {
        let topic = publish_topic(&self.control_root, key)?;
        let payload = value.encode();
        self.connection.publish(&topic, payload.as_bytes(), true)?;
        info!("[PARAM] {:7}: {:>6}", key, payload);
        Ok(payload)
    }

    /// Disconnect from the broker. Parameters keep their last values.
    pub fn shutdown(&self) -> Result<()> {
        info!("[PARAM] Shutting down with {} parameter(s)", self.len());
        self.connection.disconnect()
    }
}

impl std::fmt::Debug for ParameterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterRegistry")
            .field("root_topic", &self.root_topic)
            .field("control_root", &self.control_root)
            .field("parameters", &self.declared.read().len())
            .finish()
    }
}

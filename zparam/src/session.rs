//! Broker connection backed by a zenoh session.
//!
//! The session runs in client mode against the configured broker. Zenoh keeps
//! declared subscribers alive across transport reconnects, so a re-subscribe
//! only re-reads the retained value. Retained publishes are served by a
//! queryable per topic and fetched on every subscribe.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};
use zenoh::key_expr::KeyExpr;
use zenoh::pubsub::Subscriber;
use zenoh::query::Queryable;
use zenoh::sample::Sample;
use zenoh::{Result, Session, Wait};

use crate::Builder;
use crate::config::{BrokerConfig, session_overrides};
use crate::connection::{
    ConnectError, ConnectEvent, Connection, ConnectionState, ConnectionStatus, EventSlot,
    Message, return_code,
};
use crate::topic::validate_topic;

/// Environment variable naming a zenoh json5 config file used as the base
pub const ZENOH_CONFIG_FILE_ENV: &str = "ZPARAM_ZENOH_CONFIG";
/// Environment variable carrying `key=value;key=value` zenoh config overrides
pub const CONFIG_OVERRIDE_ENV: &str = "ZPARAM_CONFIG_OVERRIDE";

pub struct ZConnectionBuilder {
    broker: BrokerConfig,
    zenoh_config_file: Option<PathBuf>,
    config_overrides: Vec<(String, serde_json::Value)>,
}

impl Default for ZConnectionBuilder {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            zenoh_config_file: None,
            config_overrides: Vec::new(),
        }
    }
}

impl ZConnectionBuilder {
    pub fn with_broker(mut self, broker: BrokerConfig) -> Self {
        self.broker = broker;
        self
    }

    pub fn with_host<S: Into<String>>(mut self, host: S) -> Self {
        self.broker.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.broker.port = port;
        self
    }

    pub fn with_connect_timeout(mut self, secs: u64) -> Self {
        self.broker.connect_timeout_secs = secs;
        self
    }

    /// Base zenoh configuration file
    pub fn with_zenoh_config_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.zenoh_config_file = Some(path.into());
        self
    }

    /// Add a zenoh configuration override, applied after the broker settings
    ///
    /// # Example
    /// ```ignore
    /// let conn = ZConnectionBuilder::default()
    ///     .with_json("transport/link/tx/lease", json!(3000))
    ///     .build()?;
    /// ```
    pub fn with_json<K: Into<String>, V: Into<serde_json::Value>>(mut self, key: K, value: V) -> Self {
        self.config_overrides.push((key.into(), value.into()));
        self
    }

    /// Parse and apply overrides from `ZPARAM_CONFIG_OVERRIDE`
    ///
    /// Expected format: `key1=value1;key2=value2`, values in JSON5
    fn apply_env_overrides(mut self) -> Result<Self> {
        if let Ok(overrides_str) = std::env::var(CONFIG_OVERRIDE_ENV) {
            tracing::debug!(
                "Applying config overrides from {}: {}",
                CONFIG_OVERRIDE_ENV,
                overrides_str
            );
            self.config_overrides.extend(parse_overrides(&overrides_str)?);
        }
        Ok(self)
    }
}

/// Parse `key=value;key=value` pairs with JSON5 values
fn parse_overrides(text: &str) -> Result<Vec<(String, serde_json::Value)>> {
    let mut parsed = Vec::new();
    for pair in text.split(';') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }

        // Split on first '=' only
        let Some((key, value)) = pair.split_once('=') else {
            return Err(format!(
                "Invalid {} format: '{}'. Expected 'key=value'",
                CONFIG_OVERRIDE_ENV, pair
            )
            .into());
        };
        let (key, value) = (key.trim(), value.trim());
        let json_value = json5::from_str::<serde_json::Value>(value).map_err(|e| {
            format!(
                "Failed to parse {} value for key '{}': {} (value: {})",
                CONFIG_OVERRIDE_ENV, key, e, value
            )
        })?;
        tracing::debug!("Override: {} = {}", key, json_value);
        parsed.push((key.to_string(), json_value));
    }
    Ok(parsed)
}

impl Builder for ZConnectionBuilder {
    type Output = ZConnection;

    #[tracing::instrument(name = "connection_build", skip(self), fields(
        endpoint = %self.broker.endpoint()
    ))]
    fn build(mut self) -> Result<ZConnection> {
        // Priority order:
        // 1. Config file passed via with_zenoh_config_file()
        // 2. ZPARAM_ZENOH_CONFIG environment variable
        // 3. Default config
        let mut config = if let Some(ref config_file) = self.zenoh_config_file {
            zenoh::Config::from_file(config_file)?
        } else if let Ok(path) = std::env::var(ZENOH_CONFIG_FILE_ENV) {
            zenoh::Config::from_file(path)?
        } else {
            zenoh::Config::default()
        };

        self = self.apply_env_overrides()?;

        let broker_overrides = session_overrides(&self.broker)
            .into_iter()
            .map(|o| (o.key.to_string(), o.value));
        let user_overrides = std::mem::take(&mut self.config_overrides);

        for (key, value) in broker_overrides.chain(user_overrides) {
            let value_str = serde_json::to_string(&value)
                .map_err(|e| format!("Failed to serialize value for key '{}': {}", key, e))?;
            config.insert_json5(&key, &value_str).map_err(|e| {
                format!(
                    "Failed to apply config override '{}' = '{}': {}",
                    key, value_str, e
                )
            })?;
        }

        let session = zenoh::open(config).wait().map_err(|e| ConnectError::Rejected {
            return_code: return_code::SERVER_UNAVAILABLE,
            reason: e.to_string(),
        })?;
        info!("[CONN] Session open, waiting for broker at {}", self.broker.endpoint());

        Ok(ZConnection::start(Arc::new(session), self.broker))
    }
}

/// State reachable from zenoh callbacks and the transport monitor
struct Shared {
    on_message: EventSlot<Message>,
    on_connect: EventSlot<ConnectEvent>,
    status: Mutex<ConnectionStatus>,
    retained: Mutex<HashMap<String, Vec<u8>>>,
    running: AtomicBool,
    ack_tx: flume::Sender<ConnectEvent>,
}

impl Shared {
    fn deliver(&self, sample: &Sample) {
        let payload = sample.payload().to_bytes();
        trace!(
            "[CONN] Received {} byte(s) on {}",
            payload.len(),
            sample.key_expr()
        );
        self.on_message
            .fire(&Message::new(sample.key_expr().as_str(), payload.into_owned()));
    }
}

pub struct ZConnection {
    session: Arc<Session>,
    shared: Arc<Shared>,
    ack_rx: flume::Receiver<ConnectEvent>,
    subscribers: Mutex<HashMap<String, Subscriber<()>>>,
    queryables: Mutex<HashMap<String, Queryable<()>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    broker: BrokerConfig,
}

impl ZConnection {
    fn start(session: Arc<Session>, broker: BrokerConfig) -> Self {
        let (ack_tx, ack_rx) = flume::bounded(1);
        let shared = Arc::new(Shared {
            on_message: EventSlot::new(),
            on_connect: EventSlot::new(),
            status: Mutex::new(ConnectionStatus {
                state: ConnectionState::Connecting,
                ..Default::default()
            }),
            retained: Mutex::new(HashMap::new()),
            running: AtomicBool::new(true),
            ack_tx,
        });

        // Base connect handler: record the outcome and wake wait_connected
        let s = Arc::downgrade(&shared);
        shared.on_connect.replace(Arc::new(move |event: &ConnectEvent| {
            if let Some(shared) = s.upgrade() {
                shared.status.lock().apply(event);
                let _ = shared.ack_tx.try_send(*event);
            }
        }));

        let interval = Duration::from_millis(broker.monitor_interval_ms.max(1));
        let monitor = {
            let session = session.clone();
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("zparam-monitor".into())
                .spawn(move || monitor_transport(session, shared, interval))
        };
        let monitor = match monitor {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("[CONN] Failed to spawn transport monitor: {}", e);
                None
            }
        };

        Self {
            session,
            shared,
            ack_rx,
            subscribers: Mutex::new(HashMap::new()),
            queryables: Mutex::new(HashMap::new()),
            monitor: Mutex::new(monitor),
            broker,
        }
    }

    pub fn broker(&self) -> &BrokerConfig {
        &self.broker
    }

    /// Block until the broker acknowledges, polling once per second up to
    /// the configured connect timeout.
    /// On timeout the connection is left `Disconnected`.
    pub fn wait_connected(&self) -> std::result::Result<ConnectionStatus, ConnectError> {
        // Acks queued before this call describe an earlier connect
        let stale = self.ack_rx.drain().count();
        if stale > 0 {
            trace!("[CONN] Dropped {} stale connect ack(s)", stale);
        }

        let timeout_secs = self.broker.connect_timeout_secs;
        let mut remaining = timeout_secs;
        loop {
            let status = self.status();
            if status.connected {
                return Ok(status);
            }
            if remaining == 0 {
                self.shared.status.lock().state = ConnectionState::Disconnected;
                warn!("[CONN] No broker acknowledgment within {}s", timeout_secs);
                return Err(ConnectError::Timeout {
                    timeout_secs,
                    last_return_code: status.last_return_code,
                });
            }
            remaining -= 1;

            match self.ack_rx.recv_timeout(Duration::from_secs(1)) {
                Ok(event) if event.is_accepted() => {
                    let status = self.status();
                    if status.connected {
                        return Ok(status);
                    }
                    debug!("[CONN] Accepted ack but broker already lost, still waiting");
                }
                Ok(event) => {
                    return Err(ConnectError::Rejected {
                        return_code: event.return_code,
                        reason: return_code::describe(event.return_code).to_string(),
                    });
                }
                Err(_) => trace!("[CONN] Still waiting for broker, {}s left", remaining),
            }
        }
    }

    fn key_expr(topic: &str) -> Result<KeyExpr<'static>> {
        validate_topic(topic)?;
        KeyExpr::try_from(topic.to_string())
    }

    /// Fetch the retained value of `key_expr` into the message slot
    fn fetch_retained(&self, key_expr: KeyExpr<'static>) -> Result<()> {
        let shared = self.shared.clone();
        self.session
            .get(key_expr)
            .callback(move |reply| match reply.into_result() {
                Ok(sample) => shared.deliver(&sample),
                Err(e) => debug!("[CONN] Retained fetch returned an error reply: {:?}", e),
            })
            .wait()
    }

    fn ensure_retained_queryable(&self, topic: &str, key_expr: &KeyExpr<'static>) -> Result<()> {
        let mut queryables = self.queryables.lock();
        if queryables.contains_key(topic) {
            return Ok(());
        }

        let shared = self.shared.clone();
        let retained_topic = topic.to_string();
        let queryable = self
            .session
            .declare_queryable(key_expr.clone())
            .callback(move |query| {
                let payload = shared.retained.lock().get(&retained_topic).cloned();
                if let Some(payload) = payload
                    && let Err(e) = query.reply(query.key_expr().clone(), payload).wait()
                {
                    warn!("[CONN] Failed to answer retained query on {}: {}", retained_topic, e);
                }
            })
            .wait()?;
        debug!("[CONN] Serving retained value: topic={}", topic);
        queryables.insert(topic.to_string(), queryable);
        Ok(())
    }
}

impl Connection for ZConnection {
    #[tracing::instrument(name = "subscribe", skip(self))]
    fn subscribe(&self, topic: &str) -> Result<()> {
        let key_expr = Self::key_expr(topic)?;

        {
            let mut subscribers = self.subscribers.lock();
            if subscribers.contains_key(topic) {
                debug!("[CONN] Already subscribed, refreshing retained value");
            } else {
                let shared = self.shared.clone();
                let subscriber = self
                    .session
                    .declare_subscriber(key_expr.clone())
                    .callback(move |sample| shared.deliver(&sample))
                    .wait()?;
                subscribers.insert(topic.to_string(), subscriber);
                info!("[CONN] Subscriber ready: topic={}", topic);
            }
        }

        self.fetch_retained(key_expr)
    }

    #[tracing::instrument(name = "publish", skip(self, payload), fields(
        payload_len = payload.len()
    ))]
    fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<()> {
        let key_expr = Self::key_expr(topic)?;
        if retain {
            self.shared
                .retained
                .lock()
                .insert(topic.to_string(), payload.to_vec());
            self.ensure_retained_queryable(topic, &key_expr)?;
        }
        self.session.put(key_expr, payload.to_vec()).wait()
    }

    fn on_message(&self) -> &EventSlot<Message> {
        &self.shared.on_message
    }

    fn on_connect(&self) -> &EventSlot<ConnectEvent> {
        &self.shared.on_connect
    }

    fn status(&self) -> ConnectionStatus {
        *self.shared.status.lock()
    }

    fn disconnect(&self) -> Result<()> {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let monitor = self.monitor.lock().take();
        if let Some(handle) = monitor {
            // The monitor itself may drop the last handle while firing a chain
            if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
                warn!("[CONN] Transport monitor panicked");
            }
        }

        self.subscribers.lock().clear();
        self.queryables.lock().clear();
        {
            let mut status = self.shared.status.lock();
            status.state = ConnectionState::Disconnected;
            status.connected = false;
        }
        info!("[CONN] Disconnecting from {}", self.broker.endpoint());
        self.session.close().wait()
    }
}

impl Drop for ZConnection {
    fn drop(&mut self) {
        if let Err(e) = self.disconnect() {
            warn!("[CONN] Disconnect on drop failed: {}", e);
        }
    }
}

/// Watch broker presence and drive the connect state machine.
///
/// A broker appearing fires the "on connect" slot with an accepted code; a
/// broker disappearing moves the connection back to connecting.
fn monitor_transport(session: Arc<Session>, shared: Arc<Shared>, interval: Duration) {
    let mut had_broker = false;
    while shared.running.load(Ordering::Acquire) {
        let has_broker = session.info().routers_zid().wait().next().is_some();
        match (had_broker, has_broker) {
            (false, true) => {
                info!("[CONN] Broker reachable");
                shared.on_connect.fire(&ConnectEvent::accepted());
            }
            (true, false) => {
                let mut status = shared.status.lock();
                status.state = ConnectionState::Connecting;
                status.connected = false;
                warn!("[CONN] Broker lost, waiting for transport to reconnect");
            }
            _ => {}
        }
        had_broker = has_broker;
        std::thread::sleep(interval);
    }
    debug!("[CONN] Transport monitor stopped");
}

/// Open a session to the configured broker and wait for the first connect.
pub fn connect(broker: &BrokerConfig) -> Result<ZConnection> {
    let connection = ZConnectionBuilder::default()
        .with_broker(broker.clone())
        .build()?;
    connection.wait_connected()?;
    Ok(connection)
}

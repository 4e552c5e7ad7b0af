//! Ordered handler dispatch over a single connection slot.
//!
//! A connection exposes one handler slot per event. A [`CallbackChain`] takes
//! ownership of that slot and fans every event out to its registered handlers,
//! oldest first. Whatever occupied the slot before the chain was attached is
//! kept as the first handler.
//!
//! Each handler runs in isolation: an error or a panic in one handler is
//! logged and counted, and the remaining handlers still see the event.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tracing::{debug, error, trace, warn};

use crate::connection::{ConnectEvent, Connection, EventHandler, EventSlot, Message};
use crate::decode::DecodeError;

/// Errors a chained handler can report
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerError {
    /// Payload could not be decoded
    Decode(DecodeError),
    /// A connection operation issued by the handler failed
    Connection(String),
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "{}", e),
            Self::Connection(s) => write!(f, "Connection error: {}", s),
        }
    }
}

impl std::error::Error for HandlerError {}

impl From<DecodeError> for HandlerError {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

impl From<zenoh::Error> for HandlerError {
    fn from(value: zenoh::Error) -> Self {
        Self::Connection(value.to_string())
    }
}

pub type ChainHandler<E> = Arc<dyn Fn(&E) -> Result<(), HandlerError> + Send + Sync>;

/// Label used for the handler found in the slot at attach time
pub const SLOT_DEFAULT_LABEL: &str = "slot-default";

struct Link<E> {
    label: Arc<str>,
    handler: ChainHandler<E>,
}

impl<E> Clone for Link<E> {
    fn clone(&self) -> Self {
        Self {
            label: self.label.clone(),
            handler: self.handler.clone(),
        }
    }
}

/// Result of one chain firing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FireReport {
    pub invoked: usize,
    pub failed: usize,
}

impl FireReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

pub struct CallbackChain<E> {
    name: &'static str,
    links: RwLock<Vec<Link<E>>>,
    attached: AtomicBool,
}

impl<E: 'static> CallbackChain<E> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            links: RwLock::new(Vec::new()),
            attached: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Append a handler. It fires after every handler registered before it.
    pub fn register<L, F>(&self, label: L, handler: F)
    where
        L: Into<Arc<str>>,
        F: Fn(&E) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let label = label.into();
        let mut links = self.links.write();
        debug!(
            "[CHAIN] {}: registered '{}' at position {}",
            self.name,
            label,
            links.len()
        );
        links.push(Link {
            label,
            handler: Arc::new(handler),
        });
    }

    /// Put a plain slot handler at the front of the chain.
    fn prepend_slot_handler(&self, handler: EventHandler<E>) {
        let link = Link {
            label: Arc::from(SLOT_DEFAULT_LABEL),
            handler: Arc::new(move |event: &E| -> Result<(), HandlerError> {
                handler(event);
                Ok(())
            }),
        };
        self.links.write().insert(0, link);
        debug!("[CHAIN] {}: kept previous slot handler as first link", self.name);
    }

    pub fn len(&self) -> usize {
        self.links.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.read().is_empty()
    }

    /// Handler labels in firing order
    pub fn labels(&self) -> Vec<String> {
        self.links.read().iter().map(|l| l.label.to_string()).collect()
    }

    /// Run every handler once, in registration order.
    ///
    /// Handlers run on a snapshot of the chain, so a handler registering a new
    /// link does not see it until the next firing.
    pub fn fire(&self, event: &E) -> FireReport {
        let snapshot = self.links.read().clone();
        let mut report = FireReport::default();

        for link in snapshot.iter() {
            report.invoked += 1;
            trace!("[CHAIN] {}: invoking '{}'", self.name, link.label);
            match catch_unwind(AssertUnwindSafe(|| (link.handler)(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    report.failed += 1;
                    warn!("[CHAIN] {}: handler '{}' failed: {}", self.name, link.label, e);
                }
                Err(panic) => {
                    report.failed += 1;
                    error!(
                        "[CHAIN] {}: handler '{}' panicked: {}",
                        self.name,
                        link.label,
                        panic_message(panic.as_ref())
                    );
                }
            }
        }

        report
    }

    /// Take over `slot`: its current occupant becomes the first link and the
    /// slot is replaced by a dispatcher that fires this chain.
    ///
    /// Attaching twice is a no-op.
    pub fn attach(self: &Arc<Self>, slot: &EventSlot<E>) {
        if self.attached.swap(true, Ordering::AcqRel) {
            warn!("[CHAIN] {}: already attached, ignoring", self.name);
            return;
        }

        if let Some(previous) = slot.take() {
            self.prepend_slot_handler(previous);
        }

        let chain = self.clone();
        slot.replace(Arc::new(move |event: &E| {
            chain.fire(event);
        }));
        debug!("[CHAIN] {}: attached with {} link(s)", self.name, self.len());
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }
}

impl<E> std::fmt::Debug for CallbackChain<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackChain")
            .field("name", &self.name)
            .field("links", &self.links.read().len())
            .field("attached", &self.attached.load(Ordering::Relaxed))
            .finish()
    }
}

/// Route every message of `connection` through `chain`
pub fn attach_message_chain(connection: &dyn Connection, chain: &Arc<CallbackChain<Message>>) {
    chain.attach(connection.on_message());
}

/// Route every connect outcome of `connection` through `chain`
pub fn attach_connect_chain(
    connection: &dyn Connection,
    chain: &Arc<CallbackChain<ConnectEvent>>,
) {
    chain.attach(connection.on_connect());
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

//! Event bus for pub/sub coordination between modules.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::event::{Event, EventTypeDesc};

/// Asynchronous event handler.
pub type Listener = Arc<dyn Fn(Event) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a [`Listener`].
pub fn listener<F, Fut>(handler: F) -> Listener
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |event| handler(event).boxed())
}

/// Pattern for filtering events by type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventPattern {
    /// Match one event type.
    Exact(String),
    /// Match every event type starting with the prefix.
    Prefix(String),
}

impl EventPattern {
    pub const WILDCARD: char = '*';

    /// `prefix*` is a prefix pattern; anything else is exact.
    pub fn parse(pattern: &str) -> Self {
        match pattern.strip_suffix(Self::WILDCARD) {
            Some(prefix) => Self::Prefix(prefix.to_string()),
            None => Self::Exact(pattern.to_string()),
        }
    }

    /// Check if an event type matches this pattern.
    pub fn matches(&self, event_type: &str) -> bool {
        match self {
            Self::Exact(name) => name == event_type,
            Self::Prefix(prefix) => event_type.starts_with(prefix.as_str()),
        }
    }
}

impl fmt::Display for EventPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(name) => f.write_str(name),
            Self::Prefix(prefix) => write!(f, "{prefix}{}", Self::WILDCARD),
        }
    }
}

impl From<&str> for EventPattern {
    fn from(pattern: &str) -> Self {
        Self::parse(pattern)
    }
}

struct Subscriber {
    pattern: EventPattern,
    listener: Listener,
}

/// Publish/subscribe registry keyed by event-type pattern.
///
/// Subscriptions live for the lifetime of the bus. Every matching handler runs
/// in its own task; the publisher never waits for handlers.
pub struct EventBus {
    types: RwLock<BTreeMap<String, EventTypeDesc>>,
    subscribers: RwLock<Vec<Subscriber>>,
    tracker: TaskTracker,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            types: RwLock::new(BTreeMap::new()),
            subscribers: RwLock::new(Vec::new()),
            tracker: TaskTracker::new(),
        }
    }

    /// Register metadata for an event type.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyRegistered` for a duplicate name and `InvalidDescriptor`
    /// for an empty one.
    pub async fn register_event_type(&self, desc: EventTypeDesc) -> Result<()> {
        if desc.name.trim().is_empty() {
            return Err(Error::invalid_descriptor("event type name is empty"));
        }

        let mut types = self.types.write().await;
        if types.contains_key(&desc.name) {
            return Err(Error::already_registered(desc.name));
        }
        debug!(event_type = %desc.name, "Registered event type");
        types.insert(desc.name.clone(), desc);
        Ok(())
    }

    /// Registered descriptors, ordered by name.
    pub async fn event_types(&self) -> Vec<EventTypeDesc> {
        self.types.read().await.values().cloned().collect()
    }

    /// Subscribe a handler to every event matching `pattern`.
    pub async fn subscribe(&self, pattern: impl Into<EventPattern>, listener: Listener) {
        let pattern = pattern.into();
        debug!(pattern = %pattern, "Added subscriber");
        self.subscribers
            .write()
            .await
            .push(Subscriber { pattern, listener });
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Publish an event. Returns the number of handlers dispatched.
    ///
    /// The event is stamped with the current time. Missing required payload
    /// fields are logged and the event is delivered anyway.
    pub async fn publish(&self, mut event: Event) -> usize {
        event.timestamp = Utc::now();

        if let Some(desc) = self.types.read().await.get(&event.event_type) {
            let missing: Vec<&str> = desc.missing_fields(&event).collect();
            if !missing.is_empty() {
                warn!(
                    event_type = %event.event_type,
                    source = %event.source,
                    missing = ?missing,
                    "Event is missing required payload fields"
                );
            }
        }

        let listeners: Vec<Listener> = self
            .subscribers
            .read()
            .await
            .iter()
            .filter(|sub| sub.pattern.matches(&event.event_type))
            .map(|sub| Arc::clone(&sub.listener))
            .collect();

        debug!(
            event_type = %event.event_type,
            source = %event.source,
            handlers = listeners.len(),
            "Publishing event"
        );

        for listener in &listeners {
            self.dispatch(Arc::clone(listener), event.clone());
        }
        listeners.len()
    }

    fn dispatch(&self, listener: Listener, event: Event) {
        let event_type = event.event_type.clone();
        self.tracker.spawn(async move {
            let delivery = AssertUnwindSafe(async move { listener(event).await }).catch_unwind();
            if delivery.await.is_err() {
                warn!(event_type = %event_type, "Event handler panicked");
            }
        });
    }

    /// Wait until every dispatched handler, including ones dispatched while
    /// waiting, has finished.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// [`Self::drain`] bounded by `deadline`. Returns `false` if handlers were
    /// still running when it fired.
    pub async fn drain_until(&self, deadline: &CancellationToken) -> bool {
        tokio::select! {
            () = self.drain() => true,
            () = deadline.cancelled() => {
                self.tracker.reopen();
                warn!(pending = self.tracker.len(), "Gave up waiting for event handlers");
                false
            }
        }
    }

    /// Number of handler tasks still running.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

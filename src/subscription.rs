use std::fmt;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::error::StompError;
use crate::frame::{AckMode, Command, Frame, SUBSCRIPTION, generate_id};

/// Callback run for every MESSAGE delivered to a subscription.
pub type SubscriptionHandler = Arc<dyn Fn(Frame) -> BoxFuture<'static, ()> + Send + Sync>;

/// Match rule of a one-shot reply listener.
pub type ReplyPredicate = Box<dyn Fn(&Frame) -> bool + Send + Sync>;

/// An interested party for inbound frames.
pub enum Listener {
    /// Persistent; receives MESSAGE frames whose `subscription` header
    /// equals `id`.
    Subscription {
        id: String,
        ack_mode: AckMode,
        handler: SubscriptionHandler,
    },
    /// One-shot; resolves with the first frame matching `predicate`.
    Reply {
        predicate: ReplyPredicate,
        tx: Mutex<Option<oneshot::Sender<Frame>>>,
    },
}

impl Listener {
    fn matches(&self, frame: &Frame) -> bool {
        match self {
            Listener::Subscription { id, .. } => {
                frame.command() == Command::Message
                    && frame.get_header(SUBSCRIPTION) == Some(id.as_str())
            }
            Listener::Reply { predicate, .. } => predicate(frame),
        }
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Listener::Subscription { id, ack_mode, .. } => f
                .debug_struct("Subscription")
                .field("id", id)
                .field("ack_mode", ack_mode)
                .finish(),
            Listener::Reply { .. } => f.write_str("Reply"),
        }
    }
}

type Registry = Arc<DashMap<String, Arc<Listener>>>;

/// Registry of subscription and reply listeners.
///
/// Dispatch takes a snapshot of matching listeners first, so listeners
/// registered while a frame is being dispatched do not see that frame.
/// Subscription handlers are spawned on the runtime and never awaited here.
pub struct SubscriptionService {
    listeners: Registry,
    handle: Handle,
}

impl SubscriptionService {
    pub fn new(handle: Handle) -> Self {
        Self {
            listeners: Arc::new(DashMap::new()),
            handle,
        }
    }

    /// Register a subscription listener under `id`.
    ///
    /// Returns `false` if a listener with that id already exists.
    pub fn add_listener(&self, id: &str, ack_mode: AckMode, handler: SubscriptionHandler) -> bool {
        match self.listeners.entry(id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Listener::Subscription {
                    id: id.to_string(),
                    ack_mode,
                    handler,
                }));
                debug!(subscription = id, ack = %ack_mode, "listener added");
                true
            }
        }
    }

    /// Register a one-shot listener. Dropping the returned handle removes
    /// the listener whether or not it resolved.
    pub fn add_reply_listener<P>(&self, predicate: P) -> ReplyListener
    where
        P: Fn(&Frame) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let listener = Arc::new(Listener::Reply {
            predicate: Box::new(predicate),
            tx: Mutex::new(Some(tx)),
        });
        // generated ids may collide with caller-chosen subscription ids
        let id = loop {
            let id = generate_id("reply");
            if let Entry::Vacant(slot) = self.listeners.entry(id.clone()) {
                slot.insert(listener);
                break id;
            }
        };
        trace!(listener = %id, "reply listener added");
        ReplyListener {
            id,
            rx: Some(rx),
            listeners: Arc::clone(&self.listeners),
        }
    }

    /// Dispatch `frame` to every matching listener. Returns the number of
    /// listeners that matched.
    pub fn notify_listeners(&self, frame: &Frame) -> usize {
        let matched: Vec<(String, Arc<Listener>)> = self
            .listeners
            .iter()
            .filter(|entry| entry.value().matches(frame))
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        for (id, listener) in &matched {
            match listener.as_ref() {
                Listener::Subscription { handler, .. } => {
                    let fut = handler(frame.clone());
                    self.handle.spawn(fut);
                }
                Listener::Reply { tx, .. } => {
                    let sender = tx.lock().ok().and_then(|mut slot| slot.take());
                    if let Some(sender) = sender {
                        let _ = sender.send(frame.clone());
                    }
                    self.listeners.remove(id);
                }
            }
        }
        matched.len()
    }

    /// Remove the listener `id`. Idempotent.
    pub fn remove_listener(&self, id: &str) -> bool {
        self.listeners.remove(id).is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.listeners.contains_key(id)
    }

    /// Acknowledge mode of subscription `id`, `Auto` when unknown.
    pub fn acknowledge_mode(&self, id: &str) -> AckMode {
        match self.listeners.get(id).as_deref().map(Arc::as_ref) {
            Some(Listener::Subscription { ack_mode, .. }) => *ack_mode,
            _ => AckMode::Auto,
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn clear(&self) {
        self.listeners.clear();
    }
}

/// Handle to a registered one-shot listener.
pub struct ReplyListener {
    id: String,
    rx: Option<oneshot::Receiver<Frame>>,
    listeners: Registry,
}

impl ReplyListener {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the matching frame. Can be awaited once.
    pub async fn result(&mut self) -> Result<Frame, StompError> {
        let rx = self
            .rx
            .take()
            .ok_or_else(|| StompError::Closed("reply listener result already taken".into()))?;
        rx.await
            .map_err(|_| StompError::Closed("reply listener removed before a reply arrived".into()))
    }
}

impl Drop for ReplyListener {
    fn drop(&mut self) {
        self.listeners.remove(&self.id);
    }
}

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tracing::{debug, trace};

use crate::frame::AckMode;
use crate::subscription::SubscriptionService;

#[derive(Debug, Clone)]
struct PendingAck {
    subscription_id: String,
    timestamp: u64,
}

/// Outcome of [`AcknowledgeService::is_acknowledge_required`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AckDecision {
    pub required: bool,
    pub subscription_id: Option<String>,
    pub timestamp: Option<u64>,
}

/// Decides whether an outgoing ACK/NACK has to reach the broker.
///
/// Every MESSAGE carrying an `ack` header is registered with the tick at
/// which it was read. An ACK/NACK consumes that entry exactly once:
/// - `auto` subscriptions never need one;
/// - `client-individual` subscriptions always do;
/// - `client` subscriptions need one only for a message newer than the last
///   one acknowledged on that subscription, since acknowledging covers every
///   earlier message.
pub struct AcknowledgeService {
    pending: DashMap<String, PendingAck>,
    last_acked: Mutex<HashMap<String, u64>>,
    subscriptions: Arc<SubscriptionService>,
}

impl AcknowledgeService {
    pub fn new(subscriptions: Arc<SubscriptionService>) -> Self {
        Self {
            pending: DashMap::new(),
            last_acked: Mutex::new(HashMap::new()),
            subscriptions,
        }
    }

    /// Record that the message with `ack_id` awaits a disposition.
    pub fn register(&self, ack_id: &str, subscription_id: &str, received_ticks: u64) {
        self.pending.insert(
            ack_id.to_string(),
            PendingAck {
                subscription_id: subscription_id.to_string(),
                timestamp: received_ticks,
            },
        );
        trace!(ack = ack_id, subscription = subscription_id, "acknowledgement registered");
    }

    /// Consume the entry for `ack_id` and decide whether the ACK/NACK goes
    /// out. Unknown ids are never required.
    pub fn is_acknowledge_required(&self, ack_id: &str) -> AckDecision {
        let Some((_, entry)) = self.pending.remove(ack_id) else {
            debug!(ack = ack_id, "no pending acknowledgement");
            return AckDecision::default();
        };
        let required = match self.subscriptions.acknowledge_mode(&entry.subscription_id) {
            AckMode::Auto => false,
            AckMode::ClientIndividual => true,
            AckMode::Client => entry.timestamp > self.last_acknowledged(&entry.subscription_id),
        };
        AckDecision {
            required,
            subscription_id: Some(entry.subscription_id),
            timestamp: Some(entry.timestamp),
        }
    }

    /// Advance the high-water mark of `subscription_id` after an ACK/NACK
    /// was written.
    pub fn update(&self, subscription_id: &str, timestamp: u64) {
        if let Ok(mut last) = self.last_acked.lock() {
            let mark = last.entry(subscription_id.to_string()).or_insert(0);
            if timestamp > *mark {
                *mark = timestamp;
            }
        }
    }

    fn last_acknowledged(&self, subscription_id: &str) -> u64 {
        self.last_acked
            .lock()
            .ok()
            .and_then(|last| last.get(subscription_id).copied())
            .unwrap_or(0)
    }

    /// Drop every pending entry and the high-water mark of a subscription.
    pub fn discard_subscription(&self, subscription_id: &str) {
        self.pending
            .retain(|_, entry| entry.subscription_id != subscription_id);
        if let Ok(mut last) = self.last_acked.lock() {
            last.remove(subscription_id);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&self) {
        self.pending.clear();
        if let Ok(mut last) = self.last_acked.lock() {
            last.clear();
        }
    }
}

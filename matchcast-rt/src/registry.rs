//! Topic registry: which connections want which topics
//!
//! All mutations and broadcast dispatch run inside one mutex-guarded
//! critical section. Nothing awaits while the lock is held; delivery is a
//! non-blocking enqueue per connection, so one stalled client cannot hold up
//! fan-out to the others.

use crate::channel::{ConnectionHandle, ConnectionId, DeliveryError};
use matchcast_common::events::LiveEvent;
use matchcast_common::Topic;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

#[derive(Default)]
struct RegistryInner {
    /// Subscriber set per topic
    topics: HashMap<Topic, HashMap<ConnectionId, ConnectionHandle>>,
    /// Reverse index used to sweep a connection in one pass
    memberships: HashMap<ConnectionId, HashSet<Topic>>,
}

impl RegistryInner {
    fn remove_membership(&mut self, topic: &Topic, conn: ConnectionId) -> bool {
        let removed = match self.topics.get_mut(topic) {
            Some(subscribers) => {
                let removed = subscribers.remove(&conn).is_some();
                if subscribers.is_empty() {
                    self.topics.remove(topic);
                }
                removed
            }
            None => false,
        };

        if let Some(joined) = self.memberships.get_mut(&conn) {
            joined.remove(topic);
            if joined.is_empty() {
                self.memberships.remove(&conn);
            }
        }

        removed
    }

    fn sweep(&mut self, conn: ConnectionId) -> usize {
        let Some(joined) = self.memberships.remove(&conn) else {
            return 0;
        };

        for topic in &joined {
            if let Some(subscribers) = self.topics.get_mut(topic) {
                subscribers.remove(&conn);
                if subscribers.is_empty() {
                    self.topics.remove(topic);
                }
            }
        }

        joined.len()
    }
}

/// Result of one fan-out
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections that accepted the event
    pub delivered: usize,
    /// Connections that refused it and were swept
    pub dropped: Vec<ConnectionId>,
}

/// Thread-safe topic → subscriber map
#[derive(Default)]
pub struct TopicRegistry {
    inner: Mutex<RegistryInner>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        // No code path panics while holding the lock; recover the data anyway
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a connection to a topic's subscriber set
    ///
    /// Idempotent. Returns true when the subscription is new.
    pub fn subscribe(&self, topic: &Topic, conn: &ConnectionHandle) -> bool {
        let mut inner = self.lock();
        let added = inner
            .topics
            .entry(topic.clone())
            .or_default()
            .insert(conn.id(), conn.clone())
            .is_none();
        inner
            .memberships
            .entry(conn.id())
            .or_default()
            .insert(topic.clone());

        if added {
            debug!(topic = %topic, connection_id = %conn.id(), "Subscribed");
        }
        added
    }

    /// Remove a connection from a topic's subscriber set
    ///
    /// Idempotent. An emptied topic entry is evicted. Any scoring task for
    /// the topic is left running.
    pub fn unsubscribe(&self, topic: &Topic, conn: ConnectionId) -> bool {
        let removed = self.lock().remove_membership(topic, conn);
        if removed {
            debug!(topic = %topic, connection_id = %conn, "Unsubscribed");
        }
        removed
    }

    /// Remove a connection from every topic
    ///
    /// Returns the number of subscriptions swept.
    pub fn on_disconnect(&self, conn: ConnectionId) -> usize {
        let swept = self.lock().sweep(conn);
        info!(connection_id = %conn, subscriptions = swept, "Connection closed");
        swept
    }

    /// Deliver an event to every current subscriber of `topic`
    ///
    /// Connections whose queue refuses the event are swept from all topics,
    /// marked closed (see [`ConnectionHandle::closed`]) and not retried.
    pub fn broadcast(&self, topic: &Topic, event: LiveEvent) -> BroadcastReport {
        let event = Arc::new(event);
        let mut inner = self.lock();

        let Some(subscribers) = inner.topics.get(topic) else {
            debug!(topic = %topic, event = event.event_type(), "No subscribers");
            return BroadcastReport::default();
        };

        let mut report = BroadcastReport::default();
        for handle in subscribers.values() {
            match handle.send(Arc::clone(&event)) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    match e {
                        DeliveryError::Closed(_) => {
                            debug!(topic = %topic, error = %e, "Dropping closed subscriber")
                        }
                        DeliveryError::Stalled(_) => {
                            warn!(topic = %topic, error = %e, "Dropping stalled subscriber")
                        }
                    }
                    report.dropped.push(handle.id());
                }
            }
        }

        for conn in &report.dropped {
            inner.sweep(*conn);
        }

        debug!(
            topic = %topic,
            event = event.event_type(),
            delivered = report.delivered,
            dropped = report.dropped.len(),
            "Broadcast"
        );
        report
    }

    /// Current subscribers of a topic
    pub fn subscribers(&self, topic: &Topic) -> Vec<ConnectionId> {
        self.lock()
            .topics
            .get(topic)
            .map(|s| s.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Topics a connection is subscribed to
    pub fn topics_of(&self, conn: ConnectionId) -> Vec<Topic> {
        self.lock()
            .memberships
            .get(&conn)
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of topics with at least one subscriber
    pub fn topic_count(&self) -> usize {
        self.lock().topics.len()
    }

    /// Number of connections holding at least one subscription
    pub fn connection_count(&self) -> usize {
        self.lock().memberships.len()
    }
}

//! Subscription Registry
//!
//! Derives topics and tracks the (at most two) subscriptions a session
//! holds: one per-code tracking topic and one broadcast topic. Subscribing
//! into an occupied slot unsubscribes the previous handle first, so
//! subscriptions replace each other instead of stacking.

use crate::broker::{ConnectionManager, MessageHandler, SubscriptionHandle};
use crate::error::{LifecycleError, TrackingResult};
use crate::tracking::{Topic, TopicKind, TopicScheme};

#[derive(Debug, Clone)]
struct Slot {
    topic: Topic,
    handle: SubscriptionHandle,
}

/// Topic subscriptions owned by one session
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    scheme: TopicScheme,
    tracking: Option<Slot>,
    broadcast: Option<Slot>,
}

impl SubscriptionRegistry {
    pub fn new(scheme: TopicScheme) -> Self {
        Self {
            scheme,
            tracking: None,
            broadcast: None,
        }
    }

    pub fn scheme(&self) -> &TopicScheme {
        &self.scheme
    }

    /// Subscribe `handler` to `topic`, replacing the subscription of the
    /// same kind if one is active
    pub fn subscribe(
        &mut self,
        conn: &ConnectionManager,
        topic: Topic,
        handler: MessageHandler,
    ) -> Result<SubscriptionHandle, LifecycleError> {
        let slot = match topic.kind() {
            TopicKind::Broadcast => &mut self.broadcast,
            TopicKind::Tracking { .. } => &mut self.tracking,
        };

        if let Some(previous) = slot.take() {
            conn.unsubscribe(previous.handle);
            tracing::debug!(old = %previous.topic, new = %topic, "Replacing subscription");
        }

        let handle = conn.subscribe(&topic, handler)?;
        tracing::info!(topic = %topic, subscription = %handle.wire_id(), "Subscribed");
        *slot = Some(Slot { topic, handle });
        Ok(handle)
    }

    /// Validate raw user input and subscribe to its tracking topic
    ///
    /// Invalid input fails with a validation error before the connection
    /// is touched.
    pub fn subscribe_tracking(
        &mut self,
        conn: &ConnectionManager,
        raw_code: &str,
        handler: MessageHandler,
    ) -> TrackingResult<Topic> {
        let topic = self.scheme.tracking(raw_code)?;
        self.subscribe(conn, topic.clone(), handler)?;
        Ok(topic)
    }

    pub fn subscribe_broadcast(
        &mut self,
        conn: &ConnectionManager,
        handler: MessageHandler,
    ) -> Result<Topic, LifecycleError> {
        let topic = self.scheme.broadcast();
        self.subscribe(conn, topic.clone(), handler)?;
        Ok(topic)
    }

    /// Drop one subscription. Returns false for handles that are not held.
    pub fn unsubscribe(&mut self, conn: &ConnectionManager, handle: SubscriptionHandle) -> bool {
        for slot in [&mut self.tracking, &mut self.broadcast] {
            if slot.as_ref().is_some_and(|s| s.handle == handle) {
                if let Some(removed) = slot.take() {
                    conn.unsubscribe(removed.handle);
                    tracing::info!(topic = %removed.topic, "Unsubscribed");
                }
                return true;
            }
        }
        false
    }

    /// Drop every subscription, returning how many were held
    pub fn unsubscribe_all(&mut self, conn: &ConnectionManager) -> usize {
        let mut removed = 0;
        for slot in [&mut self.tracking, &mut self.broadcast] {
            if let Some(held) = slot.take() {
                conn.unsubscribe(held.handle);
                tracing::debug!(topic = %held.topic, "Unsubscribed");
                removed += 1;
            }
        }
        removed
    }

    pub fn active_topics(&self) -> Vec<&Topic> {
        [&self.tracking, &self.broadcast]
            .into_iter()
            .flatten()
            .map(|slot| &slot.topic)
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.tracking.is_some() as usize + self.broadcast.is_some() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{ConnectionHooks, MemoryBroker, ReconnectPolicy};
    use crate::error::{TrackingError, ValidationError};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn manager(broker: &MemoryBroker) -> ConnectionManager {
        let policy = ReconnectPolicy {
            delay: Duration::from_millis(20),
            ..ReconnectPolicy::default()
        };
        ConnectionManager::new(Arc::new(broker.clone()), policy, ConnectionHooks::new())
    }

    fn noop() -> MessageHandler {
        Arc::new(|_: &str| {})
    }

    #[tokio::test]
    async fn test_empty_code_never_subscribes() {
        let broker = MemoryBroker::default();
        let mut conn = manager(&broker);
        conn.activate();
        let mut registry = SubscriptionRegistry::default();

        for raw in ["", "   ", "\t\n"] {
            let result = registry.subscribe_tracking(&conn, raw, noop());
            assert_eq!(
                result,
                Err(TrackingError::Validation(ValidationError::Empty))
            );
        }
        assert_eq!(registry.active_count(), 0);

        conn.deactivate().await;
    }

    #[tokio::test]
    async fn test_resubscribe_replaces() {
        let broker = MemoryBroker::default();
        let mut conn = manager(&broker);
        conn.activate();
        let mut registry = SubscriptionRegistry::default();

        let first = registry.subscribe_tracking(&conn, " tr-1 ", noop()).unwrap();
        assert_eq!(first.as_str(), "tracking/TR-1");
        timeout(WAIT, broker.until_subscribed("tracking/TR-1", 1)).await.unwrap();

        let second = registry.subscribe_tracking(&conn, "tr-2", noop()).unwrap();
        timeout(WAIT, broker.until_subscribed("tracking/TR-2", 1)).await.unwrap();
        timeout(WAIT, broker.until_subscribed("tracking/TR-1", 0)).await.unwrap();

        assert_eq!(registry.active_topics(), vec![&second]);
        assert_eq!(registry.active_count(), 1);

        conn.deactivate().await;
    }

    #[tokio::test]
    async fn test_tracking_and_broadcast_coexist() {
        let broker = MemoryBroker::default();
        let mut conn = manager(&broker);
        conn.activate();
        let mut registry = SubscriptionRegistry::default();

        registry.subscribe_tracking(&conn, "TR-1", noop()).unwrap();
        registry.subscribe_broadcast(&conn, noop()).unwrap();
        assert_eq!(registry.active_count(), 2);

        assert_eq!(registry.unsubscribe_all(&conn), 2);
        assert_eq!(registry.unsubscribe_all(&conn), 0);
        assert!(registry.active_topics().is_empty());

        conn.deactivate().await;
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let broker = MemoryBroker::default();
        let mut conn = manager(&broker);
        conn.activate();
        let mut registry = SubscriptionRegistry::default();

        let topic = registry.scheme().broadcast();
        let handle = registry.subscribe(&conn, topic, noop()).unwrap();

        assert!(registry.unsubscribe(&conn, handle));
        assert!(!registry.unsubscribe(&conn, handle));
        assert_eq!(registry.active_count(), 0);

        conn.deactivate().await;
    }

    #[tokio::test]
    #[cfg_attr(debug_assertions, should_panic(expected = "on an inactive connection"))]
    async fn test_subscribe_without_connection() {
        let broker = MemoryBroker::default();
        let conn = manager(&broker);
        let mut registry = SubscriptionRegistry::default();

        let result = registry.subscribe_broadcast(&conn, noop());
        assert!(matches!(result, Err(LifecycleError::NotActive { .. })));
        assert_eq!(registry.active_count(), 0);
    }
}

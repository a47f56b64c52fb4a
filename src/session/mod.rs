//! Sessions
//!
//! A [`Session`] ties one view to one broker connection: it owns the
//! [`ConnectionManager`], the [`SubscriptionRegistry`] and the generation it
//! was opened with. Views never reuse a session. Switching targets or
//! unmounting closes the current session and, for a switch, opens a new one
//! with the next generation.
//!
//! ## Stale deliveries
//!
//! Teardown alone cannot stop a message that is already being dispatched.
//! Every handler is therefore stamped with its session's generation and
//! writes through [`ViewBinding::upsert_guarded`], which compares the stamp
//! with the counter under the store lock. Views advance the counter through
//! [`ViewBinding::reset_with`], under the same lock, before closing the old
//! session.
//!
//! Two views are built on this:
//! - [`UserTracker`]: one shipment, chosen by tracking code
//! - [`DispatchBoard`]: every shipment on the broadcast topic

mod dispatch;
mod generation;
mod registry;
mod user;

pub use dispatch::DispatchBoard;
pub use generation::{Generation, GenerationCounter};
pub use registry::SubscriptionRegistry;
pub use user::{TrackingStatus, UserTracker};

use std::sync::Arc;
use tokio::sync::watch;

use crate::broker::{
    ConnectionHooks, ConnectionManager, ConnectionState, MessageHandler, ReconnectPolicy,
    SubscriptionHandle, Transport,
};
use crate::config::Config;
use crate::error::{LifecycleError, TrackingResult, TransportError};
use crate::tracking::{LocationStore, MessageDecoder, Topic, TopicScheme, ViewBinding};

/// Everything a view needs to open sessions
#[derive(Debug, Clone, Default)]
pub struct SessionSettings {
    pub policy: ReconnectPolicy,
    pub scheme: TopicScheme,
    pub decoder: Arc<MessageDecoder>,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            policy: config.broker.reconnect_policy(),
            scheme: config.topics.scheme(),
            decoder: Arc::new(MessageDecoder::new(config.decoder.decoder_config())),
        }
    }
}

/// One view's connection and subscriptions, stamped with a generation
pub struct Session {
    generation: Generation,
    connection: ConnectionManager,
    registry: SubscriptionRegistry,
}

impl Session {
    /// Create the session and activate its connection
    pub fn open(
        transport: Arc<dyn Transport>,
        settings: &SessionSettings,
        generation: Generation,
        hooks: ConnectionHooks,
    ) -> Self {
        let mut connection = ConnectionManager::new(transport, settings.policy.clone(), hooks);
        connection.activate();
        tracing::info!(generation = generation.value(), "Session opened");

        Self {
            generation,
            connection,
            registry: SubscriptionRegistry::new(settings.scheme.clone()),
        }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn subscribe(
        &mut self,
        topic: Topic,
        handler: MessageHandler,
    ) -> Result<SubscriptionHandle, LifecycleError> {
        self.registry.subscribe(&self.connection, topic, handler)
    }

    /// Subscribe to the tracking topic of raw user input
    pub fn subscribe_tracking(
        &mut self,
        raw_code: &str,
        handler: MessageHandler,
    ) -> TrackingResult<Topic> {
        self.registry
            .subscribe_tracking(&self.connection, raw_code, handler)
    }

    pub fn subscribe_broadcast(&mut self, handler: MessageHandler) -> Result<Topic, LifecycleError> {
        self.registry.subscribe_broadcast(&self.connection, handler)
    }

    /// Unsubscribe everything, then tear the connection down
    pub async fn close(mut self) {
        let dropped = self.registry.unsubscribe_all(&self.connection);
        self.connection.deactivate().await;
        tracing::info!(
            generation = self.generation.value(),
            subscriptions = dropped,
            "Session closed"
        );
    }
}

/// Handler that decodes a payload and upserts it while `generation` is
/// still current
fn stamped_handler<S: LocationStore>(
    binding: ViewBinding<S>,
    decoder: Arc<MessageDecoder>,
    generations: GenerationCounter,
    generation: Generation,
    topic: &Topic,
) -> MessageHandler {
    let topic = topic.clone();
    Arc::new(move |payload: &str| {
        let update = match decoder.decode(payload) {
            Ok(update) => update,
            Err(e) => {
                tracing::warn!(
                    topic = %topic,
                    generation = generation.value(),
                    error = %e,
                    "Discarding undecodable payload"
                );
                return;
            }
        };

        let entity_id = update.entity_id();
        match binding.upsert_guarded(update, || generations.is_current(generation)) {
            Some(_) => {
                tracing::trace!(topic = %topic, entity_id, "Location updated");
            }
            None => {
                tracing::debug!(
                    topic = %topic,
                    generation = generation.value(),
                    current = generations.current().value(),
                    "Discarding stale delivery"
                );
            }
        }
    })
}

/// State shared by both views: the store binding, the generation counter
/// and the current session, if any
struct LiveView<S: LocationStore> {
    transport: Arc<dyn Transport>,
    settings: SessionSettings,
    binding: ViewBinding<S>,
    generations: GenerationCounter,
    session: Option<Session>,
    state: Arc<watch::Sender<ConnectionState>>,
    errors: Arc<watch::Sender<Option<TransportError>>>,
}

impl<S: LocationStore> LiveView<S> {
    fn new(transport: Arc<dyn Transport>, settings: SessionSettings) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        let (errors, _) = watch::channel(None);
        Self {
            transport,
            settings,
            binding: ViewBinding::new(),
            generations: GenerationCounter::new(),
            session: None,
            state: Arc::new(state),
            errors: Arc::new(errors),
        }
    }

    /// Close the current session and open a new one, subscribed by
    /// `subscribe` with a handler stamped for `topic`
    async fn start<F>(&mut self, topic: Topic, subscribe: F) -> TrackingResult<Topic>
    where
        F: FnOnce(&mut Session, MessageHandler) -> TrackingResult<Topic>,
    {
        let generation = self.invalidate();
        self.teardown().await;

        let handler = stamped_handler(
            self.binding.clone(),
            Arc::clone(&self.settings.decoder),
            self.generations.clone(),
            generation,
            &topic,
        );
        let mut session = Session::open(
            Arc::clone(&self.transport),
            &self.settings,
            generation,
            self.hooks(generation),
        );
        let subscribed = subscribe(&mut session, handler);
        self.session = Some(session);

        subscribed
    }

    async fn stop(&mut self) {
        if self.session.is_none() {
            tracing::debug!("No session to stop");
            return;
        }
        self.invalidate();
        self.teardown().await;
    }

    /// Start a new generation and clear the store in one step, so no
    /// handler of an older generation can write afterwards
    fn invalidate(&self) -> Generation {
        let generations = &self.generations;
        let generation = self.binding.reset_with(|| generations.advance());
        self.errors.send_replace(None);
        generation
    }

    async fn teardown(&mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
        }
        self.state.send_replace(ConnectionState::Idle);
    }

    /// Mirror the session's connection state and transport errors while
    /// it is current
    fn hooks(&self, generation: Generation) -> ConnectionHooks {
        let state = Arc::clone(&self.state);
        let errors = Arc::clone(&self.errors);
        let generations = self.generations.clone();
        let error_generations = self.generations.clone();

        ConnectionHooks::new()
            .on_state_change(move |next| {
                if generations.is_current(generation) {
                    state.send_replace(next);
                }
            })
            .on_error(move |error| {
                // Checked under the channel lock so a clear in `invalidate`
                // cannot be overwritten by an older session
                errors.send_if_modified(|last| {
                    if !error_generations.is_current(generation) {
                        return false;
                    }
                    *last = Some(error.clone());
                    true
                });
            })
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn last_error(&self) -> Option<TransportError> {
        self.errors.borrow().clone()
    }

    fn watch_errors(&self) -> watch::Receiver<Option<TransportError>> {
        self.errors.subscribe()
    }

    fn active_topic(&self) -> Option<&Topic> {
        self.session
            .as_ref()
            .and_then(|s| s.registry().active_topics().into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::error::{TrackingError, ValidationError};
    use crate::tracking::SingleEntityState;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);
    const PAYLOAD: &str =
        r#"{"entityId":3,"latitude":1.5,"longitude":2.5,"timestamp":"2024-05-01T10:00:00Z"}"#;

    fn settings() -> SessionSettings {
        SessionSettings {
            policy: ReconnectPolicy {
                delay: Duration::from_millis(20),
                ..ReconnectPolicy::default()
            },
            ..SessionSettings::default()
        }
    }

    #[test]
    fn test_stamped_handler_checks_generation() {
        let binding: ViewBinding<SingleEntityState> = ViewBinding::new();
        let generations = GenerationCounter::new();
        let topic = TopicScheme::default().tracking("TR-1").unwrap();

        let stamped = generations.advance();
        let handler = stamped_handler(
            binding.clone(),
            Arc::new(MessageDecoder::default()),
            generations.clone(),
            stamped,
            &topic,
        );

        handler(PAYLOAD);
        assert_eq!(binding.snapshot().unwrap().entity_id(), 3);

        binding.reset_with(|| generations.advance());
        handler(PAYLOAD);
        assert!(binding.snapshot().is_none());
    }

    #[test]
    fn test_stamped_handler_skips_bad_payload() {
        let binding: ViewBinding<SingleEntityState> = ViewBinding::new();
        let generations = GenerationCounter::new();
        let topic = TopicScheme::default().broadcast();

        let handler = stamped_handler(
            binding.clone(),
            Arc::new(MessageDecoder::default()),
            generations.clone(),
            generations.advance(),
            &topic,
        );

        handler("not json");
        handler(r#"{"entityId":3,"longitude":2.5,"timestamp":"2024-05-01T10:00:00Z"}"#);
        assert!(binding.snapshot().is_none());

        handler(PAYLOAD);
        assert!(binding.snapshot().is_some());
    }

    #[tokio::test]
    async fn test_session_subscribe_tracking_validates() {
        let broker = MemoryBroker::default();
        let settings = settings();
        let generations = GenerationCounter::new();

        let mut session = Session::open(
            Arc::new(broker.clone()),
            &settings,
            generations.advance(),
            ConnectionHooks::new(),
        );
        let rejected = session.subscribe_tracking("  ", Arc::new(|_: &str| {}));
        assert_eq!(
            rejected,
            Err(TrackingError::Validation(ValidationError::Empty))
        );
        assert_eq!(session.registry().active_count(), 0);

        let topic = session
            .subscribe_tracking(" tr-9 ", Arc::new(|_: &str| {}))
            .unwrap();
        assert_eq!(topic.as_str(), "tracking/TR-9");
        timeout(WAIT, broker.until_subscribed("tracking/TR-9", 1)).await.unwrap();
        assert_eq!(session.registry().active_topics(), vec![&topic]);

        session.close().await;
    }

    #[tokio::test]
    async fn test_session_close_releases_connection() {
        let broker = MemoryBroker::default();
        let settings = settings();
        let generations = GenerationCounter::new();

        let mut session = Session::open(
            Arc::new(broker.clone()),
            &settings,
            generations.advance(),
            ConnectionHooks::new(),
        );
        session
            .subscribe(settings.scheme.broadcast(), Arc::new(|_: &str| {}))
            .unwrap();
        timeout(WAIT, broker.until_subscribed("all-cargos", 1)).await.unwrap();
        assert_eq!(session.registry().active_count(), 1);

        session.close().await;
        assert_eq!(broker.connection_count(), 0);
        assert_eq!(broker.subscription_count("all-cargos"), 0);
    }
}

//! User view: follow one shipment by tracking code

use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

use super::{Generation, LiveView, SessionSettings};
use crate::broker::{ConnectionState, Transport};
use crate::error::{TrackingResult, TransportError};
use crate::tracking::{LocationUpdate, SingleEntityState, Topic, ViewBinding};

/// What the user should be told about their tracking request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackingStatus {
    /// Nothing is being tracked
    Idle,
    /// Connection attempt in progress
    Connecting,
    /// Subscribed, but no location has arrived yet
    WaitingForSignal,
    /// A location is available
    Live,
    /// The connection is down; the next attempt is scheduled
    Reconnecting,
}

impl fmt::Display for TrackingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackingStatus::Idle => write!(f, "idle"),
            TrackingStatus::Connecting => write!(f, "connecting"),
            TrackingStatus::WaitingForSignal => write!(f, "waiting for signal"),
            TrackingStatus::Live => write!(f, "live"),
            TrackingStatus::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// Tracks a single shipment
///
/// Each call to [`track`](Self::track) replaces the previous session: the
/// store is cleared, the old connection is fully torn down, and a new
/// connection subscribes to the new code's topic.
pub struct UserTracker {
    view: LiveView<SingleEntityState>,
}

impl UserTracker {
    pub fn new(transport: Arc<dyn Transport>, settings: SessionSettings) -> Self {
        Self {
            view: LiveView::new(transport, settings),
        }
    }

    /// Start tracking `raw_code`
    ///
    /// Invalid input is rejected before anything changes, so the current
    /// session (if any) keeps running.
    pub async fn track(&mut self, raw_code: &str) -> TrackingResult<Topic> {
        let topic = match self.view.settings.scheme.tracking(raw_code) {
            Ok(topic) => topic,
            Err(e) => {
                tracing::warn!(input = ?raw_code, error = %e, "Rejected tracking code");
                return Err(e.into());
            }
        };

        let topic = self
            .view
            .start(topic, |session, handler| {
                session.subscribe_tracking(raw_code, handler)
            })
            .await?;
        tracing::info!(
            topic = %topic,
            generation = self.view.generations.current().value(),
            "Tracking shipment"
        );
        Ok(topic)
    }

    /// Stop tracking and release the connection
    pub async fn stop(&mut self) {
        self.view.stop().await;
    }

    pub fn binding(&self) -> &ViewBinding<SingleEntityState> {
        &self.view.binding
    }

    /// Latest known location of the tracked shipment
    pub fn location(&self) -> Option<Arc<LocationUpdate>> {
        self.view.binding.snapshot()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.view.connection_state()
    }

    /// Connection state of whichever session is current
    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.view.watch_connection()
    }

    /// Most recent transport error of the current session
    ///
    /// Errors are notices: the connection keeps retrying on its own. Cleared
    /// whenever a session starts or stops.
    pub fn last_error(&self) -> Option<TransportError> {
        self.view.last_error()
    }

    pub fn watch_errors(&self) -> watch::Receiver<Option<TransportError>> {
        self.view.watch_errors()
    }

    pub fn status(&self) -> TrackingStatus {
        match self.connection_state() {
            ConnectionState::Idle => TrackingStatus::Idle,
            ConnectionState::Connecting => TrackingStatus::Connecting,
            ConnectionState::Disconnected => TrackingStatus::Reconnecting,
            ConnectionState::Connected if self.location().is_some() => TrackingStatus::Live,
            ConnectionState::Connected => TrackingStatus::WaitingForSignal,
        }
    }

    pub fn generation(&self) -> Generation {
        self.view.generations.current()
    }

    /// Topic of the current session
    pub fn active_topic(&self) -> Option<&Topic> {
        self.view.active_topic()
    }
}

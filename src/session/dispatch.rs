//! Dispatch view: every shipment in transit

use std::sync::Arc;
use tokio::sync::watch;

use super::{LiveView, SessionSettings};
use crate::broker::{ConnectionState, Transport};
use crate::error::{TrackingResult, TransportError};
use crate::tracking::{FleetSnapshot, LocationUpdate, MultiEntityState, Topic, ViewBinding};

/// Latest location of every shipment published on the broadcast topic
pub struct DispatchBoard {
    view: LiveView<MultiEntityState>,
}

impl DispatchBoard {
    pub fn new(transport: Arc<dyn Transport>, settings: SessionSettings) -> Self {
        Self {
            view: LiveView::new(transport, settings),
        }
    }

    /// Open a session on the broadcast topic. No effect while mounted.
    pub async fn mount(&mut self) -> TrackingResult<Topic> {
        if let Some(topic) = self.view.active_topic() {
            tracing::debug!(topic = %topic, "Dispatch board already mounted");
            return Ok(topic.clone());
        }

        let topic = self.view.settings.scheme.broadcast();
        let topic = self
            .view
            .start(topic, |session, handler| {
                Ok(session.subscribe_broadcast(handler)?)
            })
            .await?;
        tracing::info!(topic = %topic, "Dispatch board mounted");
        Ok(topic)
    }

    /// Close the session and forget every location
    pub async fn unmount(&mut self) {
        self.view.stop().await;
    }

    pub fn is_mounted(&self) -> bool {
        self.view.session.is_some()
    }

    pub fn binding(&self) -> &ViewBinding<MultiEntityState> {
        &self.view.binding
    }

    pub fn snapshot(&self) -> FleetSnapshot {
        self.view.binding.snapshot()
    }

    /// Current locations, ordered by entity id
    pub fn cargos(&self) -> Vec<LocationUpdate> {
        self.snapshot().sorted()
    }

    /// Number of shipments with a known location
    pub fn active_count(&self) -> usize {
        self.snapshot().len()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.view.connection_state()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.view.watch_connection()
    }

    /// Most recent transport error since the board was mounted
    pub fn last_error(&self) -> Option<TransportError> {
        self.view.last_error()
    }

    pub fn watch_errors(&self) -> watch::Receiver<Option<TransportError>> {
        self.view.watch_errors()
    }
}

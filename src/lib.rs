//! # Shipwatch
//!
//! Live shipment tracking - keeps a consistent, observable snapshot of
//! current cargo locations fed by a pub/sub broker.
//!
//! ## Features
//!
//! - **Single-shipment tracking**: follow one tracking code, switching
//!   codes without stale deliveries leaking into the new session
//! - **Dispatch board**: latest location of every shipment in transit
//! - **Resilient connections**: fixed-delay reconnect with resubscription
//! - **Strict decoding**: malformed or out-of-range payloads never reach a store
//!
//! ## Modules
//!
//! - [`tracking`]: location records, decoding, stores and view bindings
//! - [`session`]: sessions, the user view and the dispatch view
//! - [`broker`]: connection lifecycle and broker transports
//! - [`config`]: TOML configuration with environment overrides
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use shipwatch::broker::{StompConfig, StompTransport};
//! use shipwatch::session::{SessionSettings, UserTracker};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(StompTransport::new(StompConfig::default()));
//!     let mut tracker = UserTracker::new(transport, SessionSettings::default());
//!
//!     // Print every location of the tracked shipment
//!     tracker.binding().subscribe(|location| {
//!         if let Some(update) = location {
//!             println!("{:?}", update.position());
//!         }
//!     });
//!
//!     tracker.track("tr-1001").await?;
//!     tokio::signal::ctrl_c().await?;
//!
//!     tracker.stop().await;
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod config;
pub mod error;
pub mod session;
pub mod tracking;

// Re-export top-level types for convenience
pub use error::{
    DecodeError, LifecycleError, TrackingError, TrackingResult, TransportError, ValidationError,
};

pub use tracking::{
    FleetSnapshot, LocationUpdate, MessageDecoder, MultiEntityState, SingleEntityState, Topic,
    ViewBinding,
};

pub use session::{DispatchBoard, SessionSettings, TrackingStatus, UserTracker};

pub use broker::{ConnectionManager, ConnectionState, MemoryBroker, StompTransport};

pub use config::{Config, ConfigError};

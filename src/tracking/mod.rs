//! Location tracking core
//!
//! Everything between a raw broker payload and what the rendering layer sees:
//!
//! - [`types`]: the validated `LocationUpdate` record
//! - [`decoder`]: payload parsing and bound checks
//! - [`store`]: single-entity and multi-entity current-state stores
//! - [`view`]: push-on-change binding for renderers
//! - [`topic`]: topic derivation and tracking code validation

pub mod decoder;
pub mod store;
pub mod topic;
pub mod types;
pub mod view;

pub use decoder::{DecoderConfig, MessageDecoder};
pub use store::{FleetSnapshot, LocationStore, MultiEntityState, SingleEntityState};
pub use topic::{normalize_tracking_code, Topic, TopicKind, TopicScheme, MAX_CODE_LEN};
pub use types::{EntityId, LocationUpdate};
pub use view::{ObserverId, ViewBinding};

pub mod code;
pub mod coordinator;
pub mod error;
pub mod hub;
pub mod ticker;

pub use coordinator::{CoordinatorConfig, SessionCoordinator};
pub use error::CoordinatorError;
pub use hub::{BroadcastHub, HubConfig, Observer, PublishReport, TransportError};
pub use ticker::{DurationTicker, TickReport};

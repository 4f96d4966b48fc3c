//! Lifecycle event types and the broadcast bus.

pub mod bus;
pub mod types;

pub use bus::{EventBus, SharedEventBus};
pub use types::DeliberationEvent;

//! Network module
//!
//! In-process event bus connecting the trading loop to its observers.

pub mod event_bus;

pub use event_bus::{spawn_event_handler, Event, EventBus, EventProcessor};

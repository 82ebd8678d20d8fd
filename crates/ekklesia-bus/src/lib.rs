//! # ekklesia-bus
//!
//! Push-subscription layer. Components open scoped topic registrations and
//! receive validated, typed change events through an mpsc sink.
//!
//! Delivery is at-least-once and ordered within a topic; topics without a
//! subscriber drop their events.

pub mod bus;
pub mod handle;

mod error;

pub use bus::{EventBus, LocalEventBus};
pub use error::{BusError, Result};
pub use handle::{Delivery, DeliverySink, SubscriptionHandle, SubscriptionId};

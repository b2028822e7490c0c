//! Trellis Events
//!
//! Typed events emitted while a dashboard executes, plus the bus that fans
//! them out to subscribers (typically a websocket session per browser).
//!
//! Publication never suspends: each subscriber owns a bounded queue and the
//! oldest event is dropped when a slow consumer falls behind. Events for one
//! execution are delivered to any single subscriber in publication order.

mod bus;
mod event;

pub use bus::{DashboardEventBus, EventSubscription, DEFAULT_SUBSCRIBER_CAPACITY};
pub use event::DashboardEvent;

//! # Event Bus Module
//!
//! Publish/subscribe fan-out for printer notifications.
//!
//! ## Overview
//!
//! The printer link never calls listeners directly. It queues events while
//! it holds its state lock and publishes them once the lock is released,
//! so a listener always observes a consistent engine and may call back
//! into it.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use printlink_core::event_bus::{AppEvent, ConnectionEvent, EventBus, EventCategory, EventFilter};
//!
//! let bus = EventBus::new();
//! let subscription = bus.subscribe(
//!     EventFilter::Categories(vec![EventCategory::Connection]),
//!     |event| {
//!         if let AppEvent::Connection(ConnectionEvent::StateChanged { current, .. }) = event {
//!             println!("now {}", current);
//!         }
//!     },
//! );
//!
//! bus.unsubscribe(subscription);
//! ```

mod bus;
mod events;

pub use bus::*;
pub use events::*;

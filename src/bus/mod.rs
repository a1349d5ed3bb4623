//! Event bus: multiplexed in-process publish/subscribe keyed by channel name.
//!
//! Producers call [`EventBus::publish`]; consumers either pull from an
//! [`EventStream`] or push-subscribe a callback, which is what the
//! [`crate::flow`] combinators build on. Teardown ends every subscription and
//! stops adopted background tasks.

/// Subscription storage and synchronous delivery.
pub mod dispatcher;
/// Event and subscription types.
pub mod event;
/// Process-wide bus with explicit init/teardown.
pub mod global;
/// Pull-style subscriber handle.
pub mod stream;

pub use dispatcher::{BackgroundTask, BusConfig, Callback, EventBus};
pub use event::{Delivery, Event, SubscriptionId};
pub use stream::EventStream;

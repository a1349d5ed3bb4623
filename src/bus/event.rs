//! Event and subscription types for the bus.
//!
//! Events are immutable once published and shared behind `Arc` between every
//! subscriber that receives them.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::time::Timestamp;
use crate::value::Value;

/// Unique identifier for a subscription.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Create a new random subscription id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A published event.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    pub value: Value,
    /// Monotonic stamp from the bus clock.
    pub timestamp: Timestamp,
    /// Wall-clock stamp, for humans reading dumps.
    pub wall_time: DateTime<Utc>,
}

impl Event {
    /// Creates an event stamped at `timestamp`.
    #[must_use]
    pub fn new(name: impl Into<String>, value: Value, timestamp: Timestamp) -> Self {
        Self {
            name: name.into(),
            value,
            timestamp,
            wall_time: Utc::now(),
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.name, self.value)
    }
}

/// What a callback subscriber is handed by the bus.
#[derive(Debug, Clone)]
pub enum Delivery {
    /// A matching event.
    Event(Arc<Event>),
    /// Heartbeat: the bus clock reached this time. Lets time-driven operators
    /// flush while their channel is idle.
    Tick(Timestamp),
    /// No further events will arrive for this subscription.
    Closed,
}

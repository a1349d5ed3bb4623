use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};

use crate::error::{ProbeError, ProbeResult};

use super::dispatcher::BusInner;
use super::event::{Event, SubscriptionId};

/// A live, lazy view of the events matching one subscription.
///
/// Iteration blocks until the next matching event arrives and ends once the
/// bus is torn down (or the subscription is removed) and the buffered events
/// have been consumed. Only events published after the subscription was
/// created are seen.
///
/// Dropping this stream removes the subscription.
#[derive(Debug)]
pub struct EventStream {
    subscription_id: SubscriptionId,
    rx: Receiver<Arc<Event>>,
    bus: Weak<BusInner>,
    unregistered: AtomicBool,
}

impl EventStream {
    pub(crate) fn new(subscription_id: SubscriptionId, rx: Receiver<Arc<Event>>, bus: Weak<BusInner>) -> Self {
        Self {
            subscription_id,
            rx,
            bus,
            unregistered: AtomicBool::new(false),
        }
    }

    /// The subscription id backing this stream.
    #[must_use]
    pub const fn subscription_id(&self) -> SubscriptionId {
        self.subscription_id
    }

    /// Explicit unregistration. Idempotent.
    ///
    /// Events already buffered can still be received; afterwards the stream
    /// reports `ChannelClosed`.
    pub fn unsubscribe(&self) {
        if self.unregistered.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(inner) = self.bus.upgrade() {
            inner.remove_subscriber(self.subscription_id);
        }
    }

    /// Receive the next event (blocking).
    pub fn recv(&self) -> ProbeResult<Arc<Event>> {
        self.rx.recv().map_err(|_| ProbeError::ChannelClosed)
    }

    /// Receive the next event, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` when nothing arrived in time.
    pub fn recv_timeout(&self, timeout: Duration) -> ProbeResult<Option<Arc<Event>>> {
        match self.rx.recv_timeout(timeout) {
            Ok(ev) => Ok(Some(ev)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(ProbeError::ChannelClosed),
        }
    }

    /// Receive a buffered event without blocking.
    pub fn try_recv(&self) -> ProbeResult<Option<Arc<Event>>> {
        match self.rx.try_recv() {
            Ok(ev) => Ok(Some(ev)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(ProbeError::ChannelClosed),
        }
    }

    /// Drains everything currently buffered.
    #[must_use]
    pub fn drain_buffered(&self) -> Vec<Arc<Event>> {
        self.rx.try_iter().collect()
    }
}

impl Iterator for EventStream {
    type Item = Arc<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.recv().ok()
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

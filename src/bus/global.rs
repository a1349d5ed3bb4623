//! Process-wide bus.
//!
//! Components always take an [`EventBus`] by injection; this module only offers
//! a shared instance for host programs that cannot thread one through. It must
//! be initialised and torn down explicitly.

use std::sync::{Mutex, OnceLock, PoisonError};

use tracing::debug;

use super::dispatcher::{BusConfig, EventBus};

static GLOBAL: OnceLock<Mutex<Option<EventBus>>> = OnceLock::new();

fn slot() -> &'static Mutex<Option<EventBus>> {
    GLOBAL.get_or_init(|| Mutex::new(None))
}

/// Installs the process-wide bus, or returns the live one if already installed.
pub fn init(cfg: BusConfig) -> EventBus {
    let mut guard = slot().lock().unwrap_or_else(PoisonError::into_inner);
    match guard.as_ref() {
        Some(bus) if !bus.is_closed() => bus.clone(),
        _ => {
            let bus = EventBus::new(cfg);
            debug!("process-wide bus initialised");
            *guard = Some(bus.clone());
            bus
        }
    }
}

/// The process-wide bus, if initialised and not torn down.
#[must_use]
pub fn get() -> Option<EventBus> {
    slot()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .as_ref()
        .filter(|bus| !bus.is_closed())
        .cloned()
}

/// Tears down and uninstalls the process-wide bus.
pub fn teardown() {
    let bus = slot().lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(bus) = bus {
        bus.teardown();
    }
}

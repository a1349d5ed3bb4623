//! Phase lifecycle and the instruments bound to it.

pub mod instrument;
pub mod overseer;
/// The fixed phase order.
pub mod phase;

pub use instrument::{Activation, Checkpoint, Instrument, InstrumentContext, Step};
pub use overseer::{InstrumentState, Overseer};
pub use phase::Phase;

//! # runprobe - Runtime instrumentation for long-running training jobs
//!
//! runprobe observes a host program (typically a training loop) through an
//! in-process event bus, derives metrics from what the host publishes, and
//! checks the run when it ends.
//!
//! ## Core Concepts
//!
//! - **EventBus**: Named channels with synchronous, ordered delivery
//! - **Flow**: Lazily attached stream combinators over bus channels
//! - **Overseer**: Drives instruments through the host's lifecycle phases
//! - **Instrument**: A unit of observation gated by configuration
//! - **Probe**: A timed region in host code, silent unless something listens
//!
//! ## Usage
//!
//! ```rust
//! use runprobe::{Collaborators, EventBus, Overseer, Phase, ProbeConfig};
//! use runprobe::instruments::register_builtins;
//!
//! let config = ProbeConfig::from_json(r#"{"instruments": {"verify": true}}"#)?;
//! let mut overseer = Overseer::new(EventBus::default(), config, Collaborators::default())?;
//! register_builtins(&mut overseer)?;
//!
//! // The host advances through its milestones and publishes as it goes.
//! while overseer.advance()? != Phase::RunScript {}
//! overseer.bus().publish("loss", 2.0)?;
//! overseer.bus().publish("loss", 0.5)?;
//! overseer.run_to_end()?;
//! # Ok::<(), runprobe::ProbeError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod error;
pub mod pattern;
pub mod time;
pub mod value;

// Bus and combinators
pub mod bus;
pub mod flow;
pub mod poller;
pub mod probe;

// Lifecycle and instruments
pub mod collaborators;
pub mod config;
pub mod instruments;
pub mod lifecycle;

// Re-export primary types at crate root for convenience
pub use bus::{BusConfig, Delivery, Event, EventBus, EventStream, SubscriptionId};
pub use collaborators::Collaborators;
pub use config::{InstrumentOptions, ProbeConfig, ProfilerKind, RuntimeConfig};
pub use error::{
    AcquisitionError, ConfigurationError, LifecycleError, ProbeError, ProbeResult, ProbeTargetError,
};
pub use flow::{Accumulated, Flow, Sample, Signal};
pub use lifecycle::{Activation, Checkpoint, Instrument, InstrumentContext, InstrumentState, Overseer, Phase, Step};
pub use pattern::ChannelPattern;
pub use poller::Poller;
pub use probe::{LoaderDescriptor, LoaderKind, ProbedIter, SpanGuard};
pub use time::Timestamp;
pub use value::Value;

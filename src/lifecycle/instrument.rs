//! The instrument state machine.
//!
//! An instrument is driven by the overseer: `start` runs once when it is
//! activated and every later step happens in `resume`, called when the phase
//! it asked for is entered. State that must survive between checkpoints lives
//! in the instrument's own fields.

use std::collections::BTreeMap;

use crate::bus::EventBus;
use crate::collaborators::Collaborators;
use crate::config::{InstrumentOptions, ProbeConfig, RuntimeConfig};
use crate::error::{LifecycleError, ProbeResult};

use super::phase::Phase;

/// A point in the lifecycle an instrument waits for.
///
/// Instruments waiting on the same phase resume by ascending `priority`, then
/// in registration order.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub phase: Phase,
    pub priority: i32,
}

impl Checkpoint {
    /// Waits for `phase` at default priority.
    #[must_use]
    pub const fn at(phase: Phase) -> Self {
        Self { phase, priority: 0 }
    }

    /// Same phase, another priority.
    #[must_use]
    pub const fn with_priority(self, priority: i32) -> Self {
        Self { priority, ..self }
    }
}

/// What an instrument wants next.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Await(Checkpoint),
    Finished,
}

impl Step {
    /// Waits for `phase` at default priority.
    #[must_use]
    pub const fn wait(phase: Phase) -> Self {
        Self::Await(Checkpoint::at(phase))
    }

    /// Waits for `phase` at `priority`.
    #[must_use]
    pub const fn wait_with_priority(phase: Phase, priority: i32) -> Self {
        Self::Await(Checkpoint { phase, priority })
    }
}

/// How an instrument gets switched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// Runs only when its gate is on. The gate comes from the instrument
    /// options when they have one by this name, otherwise from `default`.
    Gated {
        /// Gate value when no option names this instrument.
        default: bool,
    },
    /// Always started; reads its own parameter and may do nothing.
    Parametrized,
}

/// A unit of instrumentation bound to lifecycle phases.
pub trait Instrument: Send {
    /// Unique name; also the name of its gate.
    fn name(&self) -> &str;

    /// How this instrument is switched on.
    fn activation(&self) -> Activation {
        Activation::Gated { default: false }
    }

    /// Runs once on activation and returns the first checkpoint.
    ///
    /// # Errors
    ///
    /// Any error makes the instrument inert; it is logged, never propagated.
    fn start(&mut self, ctx: &mut InstrumentContext<'_>) -> ProbeResult<Step>;

    /// Runs when the awaited `phase` is entered.
    ///
    /// # Errors
    ///
    /// Any error makes the instrument inert; it is logged, never propagated.
    fn resume(&mut self, phase: Phase, ctx: &mut InstrumentContext<'_>) -> ProbeResult<Step>;
}

/// Everything an instrument may use while it runs.
pub struct InstrumentContext<'a> {
    pub(crate) instrument: &'a str,
    pub(crate) bus: &'a EventBus,
    pub(crate) config: &'a ProbeConfig,
    pub(crate) collaborators: &'a Collaborators,
    pub(crate) phase: Option<Phase>,
    /// Every registered instrument and whether it is currently running.
    pub(crate) registry: &'a BTreeMap<String, bool>,
    pub(crate) required: Vec<String>,
}

impl<'a> InstrumentContext<'a> {
    /// The bus to subscribe and publish on.
    #[must_use]
    pub const fn bus(&self) -> &'a EventBus {
        self.bus
    }

    /// Instrument toggles and parameters.
    #[must_use]
    pub const fn options(&self) -> &'a InstrumentOptions {
        &self.config.instruments
    }

    /// Runtime tuning.
    #[must_use]
    pub const fn runtime(&self) -> &'a RuntimeConfig {
        &self.config.runtime
    }

    /// Host-provided back ends.
    #[must_use]
    pub const fn collaborators(&self) -> &'a Collaborators {
        self.collaborators
    }

    /// The phase being entered, or `None` before the first one.
    #[must_use]
    pub const fn phase(&self) -> Option<Phase> {
        self.phase
    }

    /// Returns true if `name` is registered and running.
    #[must_use]
    pub fn is_active(&self, name: &str) -> bool {
        self.registry.get(name).copied().unwrap_or(false)
    }

    /// Declares a hard dependency on instrument `name`, activating it even if
    /// its gate is off.
    ///
    /// # Errors
    ///
    /// Returns `LifecycleError::DependencyUnavailable` if no instrument of that
    /// name is registered.
    pub fn require(&mut self, name: &str) -> ProbeResult<()> {
        if !self.registry.contains_key(name) {
            return Err(LifecycleError::DependencyUnavailable {
                instrument: self.instrument.to_string(),
                dependency: name.to_string(),
            }
            .into());
        }
        if !self.required.iter().any(|r| r == name) {
            self.required.push(name.to_string());
        }
        Ok(())
    }
}

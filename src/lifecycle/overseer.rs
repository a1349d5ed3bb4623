//! Drives instruments through the lifecycle.
//!
//! The host calls [`Overseer::advance`] once per milestone. Each transition
//! resumes every instrument waiting on the phase just entered, by ascending
//! priority and then registration order. Resumption is cooperative and runs
//! on the caller's thread. Entering `Finalize` stops background producers and
//! drains the bus first; entering `Done` tears the bus down.

use std::collections::BTreeMap;
use std::fmt;

use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::collaborators::Collaborators;
use crate::config::ProbeConfig;
use crate::error::{LifecycleError, ProbeError, ProbeResult};

use super::instrument::{Activation, Checkpoint, Instrument, InstrumentContext, Step};
use super::phase::Phase;

/// Where an instrument stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstrumentState {
    /// Registered, activation not evaluated yet.
    Pending,
    /// Gated off. Can still be activated by a dependent.
    Disabled,
    /// Running, waiting for a checkpoint.
    Waiting(Checkpoint),
    /// Ran to completion.
    Finished,
    /// Failed; never resumed again.
    Inert(String),
}

impl InstrumentState {
    const fn is_running(&self) -> bool {
        matches!(self, Self::Waiting(_) | Self::Finished)
    }
}

struct Entry {
    name: String,
    instrument: Box<dyn Instrument>,
    state: InstrumentState,
}

enum Call {
    Start,
    Resume(Phase),
}

/// Owner of the lifecycle and the instruments bound to it.
pub struct Overseer {
    bus: EventBus,
    config: ProbeConfig,
    collaborators: Collaborators,
    entries: Vec<Entry>,
    current: Option<Phase>,
}

impl fmt::Debug for Overseer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Overseer")
            .field("current", &self.current)
            .field("instruments", &self.entries.iter().map(|e| &e.name).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Overseer {
    /// Creates an overseer for `bus`.
    ///
    /// # Errors
    ///
    /// Returns `ProbeError::Configuration` if `config` is invalid. No
    /// instrument is activated in that case.
    pub fn new(bus: EventBus, config: ProbeConfig, collaborators: Collaborators) -> ProbeResult<Self> {
        let config = config.validate()?;
        Ok(Self {
            bus,
            config,
            collaborators,
            entries: Vec::new(),
            current: None,
        })
    }

    /// The bus the instruments run on.
    #[must_use]
    pub const fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Validated configuration.
    #[must_use]
    pub const fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// The phase most recently entered, or `None` before the first advance.
    #[must_use]
    pub const fn current_phase(&self) -> Option<Phase> {
        self.current
    }

    /// State of instrument `name`, if registered.
    #[must_use]
    pub fn state(&self, name: &str) -> Option<&InstrumentState> {
        self.entries.iter().find(|e| e.name == name).map(|e| &e.state)
    }

    /// Registers an instrument. It is activated on the next `advance`.
    ///
    /// # Errors
    ///
    /// Returns `LifecycleError::DuplicateInstrument` if the name is taken.
    pub fn register(&mut self, instrument: impl Instrument + 'static) -> ProbeResult<()> {
        self.register_boxed(Box::new(instrument))
    }

    /// Registers an already boxed instrument.
    ///
    /// # Errors
    ///
    /// Returns `LifecycleError::DuplicateInstrument` if the name is taken.
    pub fn register_boxed(&mut self, instrument: Box<dyn Instrument>) -> ProbeResult<()> {
        let name = instrument.name().to_string();
        if self.entries.iter().any(|e| e.name == name) {
            return Err(LifecycleError::DuplicateInstrument { name }.into());
        }
        debug!(instrument = %name, "instrument registered");
        self.entries.push(Entry {
            name,
            instrument,
            state: InstrumentState::Pending,
        });
        Ok(())
    }

    /// Enters the next phase and resumes the instruments waiting on it.
    ///
    /// Returns the phase entered.
    ///
    /// # Errors
    ///
    /// Returns `LifecycleError::InvalidTransition` when already at `Done`.
    /// Instrument failures are never returned; they make that instrument
    /// inert.
    pub fn advance(&mut self) -> ProbeResult<Phase> {
        let next = match self.current {
            None => Phase::ParseArgs,
            Some(current) => current
                .next()
                .ok_or(ProbeError::from(LifecycleError::InvalidTransition { from: current }))?,
        };

        self.activate_pending();

        self.current = Some(next);
        info!(phase = %next, "entering phase");
        match next {
            Phase::ParseArgs if self.config.runtime.heartbeat => {
                if let Err(err) = self.bus.start_heartbeat() {
                    warn!(error = %err, "heartbeat not started");
                }
            }
            Phase::Finalize => {
                self.bus.stop_background();
                self.bus.drain();
            }
            Phase::Done => self.bus.teardown(),
            _ => {}
        }

        // Forced activations during this round may add instruments waiting
        // on `next`; keep going until none are left.
        loop {
            let mut due: Vec<(i32, usize)> = self
                .entries
                .iter()
                .enumerate()
                .filter_map(|(idx, e)| match e.state {
                    InstrumentState::Waiting(cp) if cp.phase == next => Some((cp.priority, idx)),
                    _ => None,
                })
                .collect();
            if due.is_empty() {
                break;
            }
            due.sort_unstable();
            for (_, idx) in due {
                self.step(idx, Call::Resume(next));
            }
        }

        Ok(next)
    }

    /// Advances through every remaining phase.
    ///
    /// # Errors
    ///
    /// Returns `LifecycleError::InvalidTransition` if already at `Done`.
    pub fn run_to_end(&mut self) -> ProbeResult<()> {
        loop {
            if self.advance()? == Phase::Done {
                return Ok(());
            }
        }
    }

    fn activate_pending(&mut self) {
        for idx in 0..self.entries.len() {
            if self.entries[idx].state != InstrumentState::Pending {
                continue;
            }
            let entry = &self.entries[idx];
            let enabled = match entry.instrument.activation() {
                Activation::Gated { default } => self.config.instruments.gate(&entry.name).unwrap_or(default),
                Activation::Parametrized => true,
            };
            if enabled {
                self.step(idx, Call::Start);
            } else {
                debug!(instrument = %entry.name, "gated off");
                self.entries[idx].state = InstrumentState::Disabled;
            }
        }
    }

    fn registry(&self) -> BTreeMap<String, bool> {
        self.entries
            .iter()
            .map(|e| (e.name.clone(), e.state.is_running()))
            .collect()
    }

    fn step(&mut self, idx: usize, call: Call) {
        let registry = self.registry();
        let name = self.entries[idx].name.clone();
        let mut ctx = InstrumentContext {
            instrument: &name,
            bus: &self.bus,
            config: &self.config,
            collaborators: &self.collaborators,
            phase: self.current,
            registry: &registry,
            required: Vec::new(),
        };
        let entry = &mut self.entries[idx];
        let result = match call {
            Call::Start => entry.instrument.start(&mut ctx),
            Call::Resume(phase) => entry.instrument.resume(phase, &mut ctx),
        };
        let required = std::mem::take(&mut ctx.required);
        drop(ctx);

        let resumed = matches!(call, Call::Resume(_));
        let entry = &mut self.entries[idx];
        entry.state = match result {
            Ok(Step::Finished) => {
                debug!(instrument = %entry.name, "instrument finished");
                InstrumentState::Finished
            }
            Ok(Step::Await(cp)) => match self.current {
                // A fresh start may still join the round in progress.
                Some(current) if cp.phase < current || (resumed && cp.phase == current) => {
                    let err = LifecycleError::PhaseAlreadyPassed {
                        instrument: entry.name.clone(),
                        requested: cp.phase,
                        current,
                    };
                    warn!(instrument = %entry.name, error = %err, "instrument disabled");
                    InstrumentState::Inert(err.to_string())
                }
                _ => InstrumentState::Waiting(cp),
            },
            Err(err) => {
                warn!(instrument = %entry.name, error = %err, "instrument failed; disabled");
                InstrumentState::Inert(err.to_string())
            }
        };

        for name in required {
            self.force(&name);
        }
    }

    fn force(&mut self, name: &str) {
        let Some(idx) = self.entries.iter().position(|e| e.name == name) else {
            return;
        };
        if matches!(
            self.entries[idx].state,
            InstrumentState::Pending | InstrumentState::Disabled
        ) {
            info!(instrument = %name, "activated as a dependency");
            self.step(idx, Call::Start);
        }
    }
}

impl Drop for Overseer {
    fn drop(&mut self) {
        // Abandoned mid-run: background threads must still be joined.
        if self.current.is_some() && self.current != Some(Phase::Done) {
            self.bus.teardown();
        }
    }
}

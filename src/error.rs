//! Error types for runprobe.
//!
//! All errors are strongly typed using thiserror so callers can match on the
//! specific condition. Only configuration errors are fatal; everything else is
//! recovered locally by the component that hit it.

use thiserror::Error;

use crate::lifecycle::Phase;

/// Configuration errors, raised before any instrument activates.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// The `profile` option names no known profiler.
    #[error("Unknown profiler '{name}' (expected one of: torch, deepspeed)")]
    UnknownProfiler {
        /// The name as given.
        name: String,
    },

    /// An option is out of range.
    #[error("Invalid option '{field}': {reason}")]
    InvalidOption {
        /// Option name.
        field: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The configuration is not valid JSON for [`crate::ProbeConfig`].
    #[error("Failed to parse configuration: {message}")]
    Parse {
        /// Parser message.
        message: String,
    },

    /// The configuration file could not be read.
    #[error("Failed to read configuration file '{path}': {message}")]
    Io {
        /// File path.
        path: String,
        /// OS error message.
        message: String,
    },
}

/// Lifecycle errors raised by the phase overseer.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// `advance` was called at `Done`.
    #[error("Invalid transition: cannot advance past {from:?}")]
    InvalidTransition {
        /// The final phase.
        from: Phase,
    },

    /// An instrument asked to wait on a phase already entered.
    #[error("Instrument '{instrument}' waited on {requested:?} but the lifecycle is already at {current:?}")]
    PhaseAlreadyPassed {
        /// Offending instrument.
        instrument: String,
        /// Phase it asked for.
        requested: Phase,
        /// Phase the lifecycle is in.
        current: Phase,
    },

    /// `require` named an instrument that is not registered.
    #[error("Dependency '{dependency}' required by '{instrument}' is not available")]
    DependencyUnavailable {
        /// The requiring instrument.
        instrument: String,
        /// The missing dependency.
        dependency: String,
    },

    /// Two instruments share a name.
    #[error("Instrument '{name}' is already registered")]
    DuplicateInstrument {
        /// The duplicated name.
        name: String,
    },
}

/// An instrument could not attach to a host object.
#[derive(Debug, Error)]
pub enum ProbeTargetError {
    /// The host object has no shape the instrument knows how to wrap.
    #[error("Cannot instrument {target} of kind '{kind}'")]
    UnsupportedProbeTarget {
        /// Host object name.
        target: String,
        /// Its declared kind.
        kind: String,
    },
}

/// Transient failure acquiring an external resource during a poll.
///
/// These never reach the bus: the poller skips the sample and retries on the
/// next interval.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AcquisitionError {
    /// The resource did not answer.
    #[error("Resource unavailable: {message}")]
    Unavailable {
        /// Collaborator message.
        message: String,
    },

    /// The resource answered with something unusable.
    #[error("Malformed reading: {message}")]
    Malformed {
        /// Collaborator message.
        message: String,
    },
}

impl AcquisitionError {
    /// Creates an `Unavailable` error.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }
}

/// Top-level error type for runprobe.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// Lifecycle misuse.
    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    /// Unsupported probe target.
    #[error("Probe target error: {0}")]
    ProbeTarget(#[from] ProbeTargetError),

    /// Transient acquisition failure.
    #[error("Acquisition error: {0}")]
    Acquisition(#[from] AcquisitionError),

    /// Publish or subscribe after teardown.
    #[error("Channel closed: the event bus has been torn down")]
    ChannelClosed,

    /// Anything else, e.g. a thread that could not be spawned.
    #[error("Internal error: {message}")]
    Internal {
        /// What went wrong.
        message: String,
    },
}

impl ProbeError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    /// Returns true if this is a lifecycle error.
    #[must_use]
    pub const fn is_lifecycle(&self) -> bool {
        matches!(self, Self::Lifecycle(_))
    }

    /// Returns true if the bus was already torn down.
    #[must_use]
    pub const fn is_channel_closed(&self) -> bool {
        matches!(self, Self::ChannelClosed)
    }

    /// Returns true if the condition must abort startup.
    ///
    /// Everything except configuration errors is recovered locally.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

/// Result type alias for runprobe operations.
pub type ProbeResult<T> = Result<T, ProbeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_profiler_message() {
        let err = ConfigurationError::UnknownProfiler {
            name: "nvprof".to_string(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("nvprof"));
        assert!(msg.contains("torch"));
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = LifecycleError::InvalidTransition { from: Phase::Done };
        let msg = format!("{err}");
        assert!(msg.contains("Done"));
    }

    #[test]
    fn test_probe_error_from_configuration_is_fatal() {
        let err: ProbeError = ConfigurationError::Parse {
            message: "eof".to_string(),
        }
        .into();
        assert!(err.is_configuration());
        assert!(err.is_fatal());
    }

    #[test]
    fn test_channel_closed_is_not_fatal() {
        let err = ProbeError::ChannelClosed;
        assert!(err.is_channel_closed());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_probe_target_error() {
        let err: ProbeError = ProbeTargetError::UnsupportedProbeTarget {
            target: "loader".to_string(),
            kind: "opaque".to_string(),
        }
        .into();
        assert!(!err.is_fatal());
        assert!(format!("{err}").contains("opaque"));
    }

    #[test]
    fn test_internal_error() {
        let err = ProbeError::internal("unexpected state");
        assert!(!err.is_fatal());
        assert!(format!("{err}").contains("unexpected state"));
    }

    #[test]
    fn test_lifecycle_errors_are_recoverable() {
        let err: ProbeError = LifecycleError::DependencyUnavailable {
            instrument: "verify".to_string(),
            dependency: "dash".to_string(),
        }
        .into();
        assert!(err.is_lifecycle());
        assert!(!err.is_fatal());
    }
}

//! Instrument toggles and runtime tuning.
//!
//! Everything here is plain serde data with defaults, loadable from JSON and
//! validated up front. A configuration error is the only fatal error in the
//! crate: it is returned before any instrument activates.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bus::BusConfig;
use crate::error::ConfigurationError;

/// Serde helper storing a [`Duration`] as integer milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(missing_docs, clippy::cast_possible_truncation)]
    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    #[allow(missing_docs)]
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Numeric profiler back ends.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfilerKind {
    Torch,
    DeepSpeed,
}

impl ProfilerKind {
    /// Parses a `profile` option. The empty string means "no profiling".
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::UnknownProfiler` for any other name.
    pub fn parse(name: &str) -> Result<Option<Self>, ConfigurationError> {
        match name.trim() {
            "" => Ok(None),
            "torch" => Ok(Some(Self::Torch)),
            "deepspeed" => Ok(Some(Self::DeepSpeed)),
            other => Err(ConfigurationError::UnknownProfiler {
                name: other.to_string(),
            }),
        }
    }

    /// Option spelling of this profiler.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Torch => "torch",
            Self::DeepSpeed => "deepspeed",
        }
    }
}

/// Which instruments run, and their parameters.
///
/// Gates default to off. `stop == 0` and an empty `profile` leave the
/// corresponding parametrized instruments inert.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentOptions {
    pub display: bool,
    pub dash: bool,
    pub gpu: bool,
    pub verify: bool,
    pub train_rate: bool,
    pub loading_rate: bool,
    pub compute_rate: bool,
    /// Stop the host after this many `train_rate` observations.
    pub stop: u64,
    /// Profiler back end: "", "torch" or "deepspeed".
    pub profile: String,
    /// Upper bound the final loss must be under for verification to pass.
    pub loss_threshold: f64,
}

impl Default for InstrumentOptions {
    fn default() -> Self {
        Self {
            display: false,
            dash: false,
            gpu: false,
            verify: false,
            train_rate: false,
            loading_rate: false,
            compute_rate: false,
            stop: 0,
            profile: String::new(),
            loss_threshold: 1.0,
        }
    }
}

impl InstrumentOptions {
    /// Value of a boolean gate by instrument name, or `None` if no option
    /// gates that name.
    #[must_use]
    pub fn gate(&self, name: &str) -> Option<bool> {
        match name {
            "display" => Some(self.display),
            "dash" => Some(self.dash),
            "gpu" => Some(self.gpu),
            "verify" => Some(self.verify),
            "train_rate" => Some(self.train_rate),
            "loading_rate" => Some(self.loading_rate),
            "compute_rate" => Some(self.compute_rate),
            _ => None,
        }
    }

    /// Parsed `profile` option.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::UnknownProfiler` for an unknown name.
    pub fn profiler(&self) -> Result<Option<ProfilerKind>, ConfigurationError> {
        ProfilerKind::parse(&self.profile)
    }

    /// Checks every option.
    ///
    /// # Errors
    ///
    /// Returns the first invalid option found.
    pub fn validate(self) -> Result<Self, ConfigurationError> {
        self.profiler()?;
        if !self.loss_threshold.is_finite() {
            return Err(ConfigurationError::InvalidOption {
                field: "loss_threshold".to_string(),
                reason: format!("must be finite (got {})", self.loss_threshold),
            });
        }
        Ok(self)
    }
}

/// Bus and background-task tuning.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub bus: BusConfig,
    /// Run the bus heartbeat thread, so time windows flush while idle.
    pub heartbeat: bool,
    #[serde(with = "duration_ms")]
    pub gpu_poll_interval: Duration,
    #[serde(with = "duration_ms")]
    pub dash_refresh_interval: Duration,
    /// Window of the `train_rate` time buffer.
    #[serde(with = "duration_ms")]
    pub rate_window: Duration,
    /// Number of samples averaged by span-based rates.
    pub smoothing_window: usize,
    /// Minimum spacing of published span-based rates.
    #[serde(with = "duration_ms")]
    pub rate_throttle: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            bus: BusConfig::default(),
            heartbeat: true,
            gpu_poll_interval: Duration::from_millis(100),
            dash_refresh_interval: Duration::from_millis(250),
            rate_window: Duration::from_secs(1),
            smoothing_window: 5,
            rate_throttle: Duration::from_secs(1),
        }
    }
}

impl RuntimeConfig {
    const MIN_INTERVAL: Duration = Duration::from_millis(1);

    /// Checks intervals and sizes.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::InvalidOption` naming the offending field.
    pub fn validate(self) -> Result<Self, ConfigurationError> {
        let intervals = [
            ("bus.heartbeat_interval", self.bus.heartbeat_interval),
            ("gpu_poll_interval", self.gpu_poll_interval),
            ("dash_refresh_interval", self.dash_refresh_interval),
            ("rate_window", self.rate_window),
        ];
        for (field, value) in intervals {
            if value < Self::MIN_INTERVAL {
                return Err(ConfigurationError::InvalidOption {
                    field: field.to_string(),
                    reason: format!("must be at least {}ms (got {value:?})", Self::MIN_INTERVAL.as_millis()),
                });
            }
        }
        if self.bus.stream_capacity == 0 {
            return Err(ConfigurationError::InvalidOption {
                field: "bus.stream_capacity".to_string(),
                reason: "must be non-zero".to_string(),
            });
        }
        if self.smoothing_window == 0 {
            return Err(ConfigurationError::InvalidOption {
                field: "smoothing_window".to_string(),
                reason: "must be non-zero".to_string(),
            });
        }
        Ok(self)
    }
}

/// Complete configuration: which instruments run and how the runtime is tuned.
///
/// ```
/// use runprobe::config::ProbeConfig;
///
/// let cfg = ProbeConfig::from_json(r#"{"instruments": {"dash": true, "stop": 10}}"#).unwrap();
/// assert!(cfg.instruments.dash);
/// assert_eq!(cfg.instruments.stop, 10);
/// assert_eq!(cfg.runtime.smoothing_window, 5);
/// ```
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub instruments: InstrumentOptions,
    pub runtime: RuntimeConfig,
}

impl ProbeConfig {
    /// Parses and validates JSON text.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::Parse` for malformed JSON, or the
    /// validation error of the first invalid option.
    pub fn from_json(text: &str) -> Result<Self, ConfigurationError> {
        let cfg: Self = serde_json::from_str(text).map_err(|e| ConfigurationError::Parse {
            message: e.to_string(),
        })?;
        cfg.validate()
    }

    /// Reads, parses and validates a JSON file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::Io` if the file cannot be read, otherwise
    /// as [`ProbeConfig::from_json`].
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigurationError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_json(&text)
    }

    /// Validates both halves.
    ///
    /// # Errors
    ///
    /// Returns the first invalid option found.
    pub fn validate(self) -> Result<Self, ConfigurationError> {
        Ok(Self {
            instruments: self.instruments.validate()?,
            runtime: self.runtime.validate()?,
        })
    }

    /// Serializes to pretty JSON.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

//! Boundaries to the outside world.
//!
//! Instruments never talk to a GPU driver, a terminal or a profiler directly;
//! they go through the traits here so hosts can plug in real back ends and
//! tests can plug in fakes. [`Collaborators`] bundles whatever the host
//! provides; anything missing leaves the instrument that needs it inert.

use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::config::ProfilerKind;
use crate::error::AcquisitionError;

/// One device's state at one poll.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuReading {
    pub index: u32,
    pub name: String,
    /// Utilisation in `[0, 1]`.
    pub load: f64,
    pub memory_used: u64,
    pub memory_total: u64,
    /// Degrees Celsius, when the driver reports it.
    pub temperature: Option<f64>,
}

impl GpuReading {
    /// Fraction of device memory in use.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn memory_fraction(&self) -> f64 {
        if self.memory_total == 0 {
            return 0.0;
        }
        self.memory_used as f64 / self.memory_total as f64
    }
}

/// Source of GPU readings.
pub trait GpuTelemetry: Send + Sync {
    /// Reads every device once. An error skips this poll only.
    ///
    /// # Errors
    ///
    /// Returns `AcquisitionError` when the driver cannot be queried right now.
    fn poll(&self) -> Result<Vec<GpuReading>, AcquisitionError>;
}

/// One line of the dashboard.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub enum Row {
    Scalar {
        key: String,
        text: String,
    },
    Progress {
        key: String,
        progress: u64,
        total: u64,
        descr: String,
    },
}

impl Row {
    /// Key the row is stored under.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Scalar { key, .. } | Self::Progress { key, .. } => key,
        }
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar { key, text } => write!(f, "{key}: {text}"),
            Self::Progress {
                key, progress, total, ..
            } => write!(f, "{key} {progress}/{total}"),
        }
    }
}

/// Draws the dashboard table.
pub trait DashboardRenderer: Send {
    /// Redraws the whole table.
    fn render(&mut self, rows: &[Row]);

    /// Called once after the final render.
    fn finish(&mut self) {}
}

/// Renders rows as plain lines, one block per refresh.
pub struct PlainRenderer<W: Write + Send> {
    out: W,
}

impl<W: Write + Send> PlainRenderer<W> {
    /// Renders to `out`.
    pub const fn new(out: W) -> Self {
        Self { out }
    }

    /// Gives the writer back.
    pub fn into_inner(self) -> W {
        self.out
    }
}

impl PlainRenderer<io::Stdout> {
    /// Renders to standard output.
    #[must_use]
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send> DashboardRenderer for PlainRenderer<W> {
    fn render(&mut self, rows: &[Row]) {
        for row in rows {
            let _ = writeln!(self.out, "{row}");
        }
        let _ = writeln!(self.out);
        let _ = self.out.flush();
    }
}

/// Waits for outstanding device work so a timing measurement covers it.
pub trait HardwareSync: Send + Sync {
    /// Blocks until the device is idle.
    fn synchronize(&self);
}

/// One profiled operation.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfiledOp {
    pub name: String,
    pub flops: u64,
}

/// What a profiler measured over its span.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProfileReport {
    Totals { flops: u64, macs: u64, params: u64 },
    Events(Vec<ProfiledOp>),
}

impl ProfileReport {
    /// Total floating point operations in the report.
    #[must_use]
    pub fn total_flops(&self) -> u64 {
        match self {
            Self::Totals { flops, .. } => *flops,
            Self::Events(ops) => ops.iter().map(|op| op.flops).sum(),
        }
    }
}

/// A numeric profiler measuring one span of execution.
pub trait Profiler: Send {
    /// Starts measuring.
    ///
    /// # Errors
    ///
    /// Returns `AcquisitionError` if the back end cannot start.
    fn start(&mut self) -> Result<(), AcquisitionError>;

    /// Stops measuring and reports.
    ///
    /// # Errors
    ///
    /// Returns `AcquisitionError` if the back end failed while measuring.
    fn stop(&mut self) -> Result<ProfileReport, AcquisitionError>;
}

/// Builds profilers by kind.
pub trait ProfilerFactory: Send + Sync {
    /// Returns `None` if this factory has no back end for `kind`.
    fn create(&self, kind: ProfilerKind) -> Option<Box<dyn Profiler>>;
}

/// Asks the host program to stop.
pub trait StopController: Send + Sync {
    /// Requests a stop. Called at most once per run.
    fn request_stop(&self);
}

/// A flag the host loop polls to find out it should stop.
#[derive(Debug, Clone, Default)]
pub struct StopFlag {
    raised: Arc<AtomicBool>,
}

impl StopFlag {
    /// Creates a lowered flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true once a stop was requested.
    #[must_use]
    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }
}

impl StopController for StopFlag {
    fn request_stop(&self) {
        self.raised.store(true, Ordering::Release);
    }
}

/// Shared writer for the display instrument.
pub type SharedWriter = Arc<Mutex<dyn Write + Send>>;

/// Everything the host plugs into the instruments.
#[derive(Clone)]
pub struct Collaborators {
    /// GPU readings for the `gpu` instrument.
    pub gpu: Option<Arc<dyn GpuTelemetry>>,
    /// Table renderer for the `dash` instrument.
    pub renderer: Option<Arc<Mutex<dyn DashboardRenderer>>>,
    /// Device sync used by `train_rate` when the host announces `use_cuda`.
    pub sync: Option<Arc<dyn HardwareSync>>,
    /// Profiler back ends for the `profile` instrument.
    pub profilers: Option<Arc<dyn ProfilerFactory>>,
    /// Target of the `stop` instrument.
    pub stop: Arc<dyn StopController>,
    /// Output of the `display` instrument.
    pub display: SharedWriter,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("gpu", &self.gpu.is_some())
            .field("renderer", &self.renderer.is_some())
            .field("sync", &self.sync.is_some())
            .field("profilers", &self.profilers.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            gpu: None,
            renderer: None,
            sync: None,
            profilers: None,
            stop: Arc::new(StopFlag::new()),
            display: Arc::new(Mutex::new(io::stdout())),
        }
    }
}

#[allow(missing_docs)]
impl Collaborators {
    #[must_use]
    pub fn with_gpu(mut self, gpu: impl GpuTelemetry + 'static) -> Self {
        self.gpu = Some(Arc::new(gpu));
        self
    }

    #[must_use]
    pub fn with_renderer(mut self, renderer: impl DashboardRenderer + 'static) -> Self {
        self.renderer = Some(Arc::new(Mutex::new(renderer)));
        self
    }

    #[must_use]
    pub fn with_sync(mut self, sync: impl HardwareSync + 'static) -> Self {
        self.sync = Some(Arc::new(sync));
        self
    }

    #[must_use]
    pub fn with_profilers(mut self, factory: impl ProfilerFactory + 'static) -> Self {
        self.profilers = Some(Arc::new(factory));
        self
    }

    #[must_use]
    pub fn with_stop(mut self, stop: impl StopController + 'static) -> Self {
        self.stop = Arc::new(stop);
        self
    }

    #[must_use]
    pub fn with_display(mut self, out: impl Write + Send + 'static) -> Self {
        self.display = Arc::new(Mutex::new(out));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_flops_sums_events() {
        let report = ProfileReport::Events(vec![
            ProfiledOp {
                name: "matmul".into(),
                flops: 600,
            },
            ProfiledOp {
                name: "add".into(),
                flops: 40,
            },
        ]);
        assert_eq!(report.total_flops(), 640);
        let totals = ProfileReport::Totals {
            flops: 7,
            macs: 3,
            params: 1,
        };
        assert_eq!(totals.total_flops(), 7);
    }

    #[test]
    fn test_stop_flag_is_shared_between_clones() {
        let flag = StopFlag::new();
        let handle = flag.clone();
        assert!(!flag.is_raised());
        handle.request_stop();
        assert!(flag.is_raised());
    }

    #[test]
    fn test_plain_renderer_writes_rows() {
        let mut r = PlainRenderer::new(Vec::new());
        r.render(&[
            Row::Scalar {
                key: "loss".into(),
                text: "0.5".into(),
            },
            Row::Progress {
                key: "[train]".into(),
                progress: 3,
                total: 10,
                descr: "train".into(),
            },
        ]);
        let text = String::from_utf8(r.into_inner()).unwrap();
        assert_eq!(text, "loss: 0.5\n[train] 3/10\n\n");
    }

    #[test]
    fn test_memory_fraction_handles_zero_total() {
        let reading = GpuReading {
            index: 0,
            name: "fake".into(),
            load: 0.5,
            memory_used: 10,
            memory_total: 0,
            temperature: None,
        };
        assert!(reading.memory_fraction().abs() < f64::EPSILON);
    }
}

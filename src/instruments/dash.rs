//! Live dashboard of the latest value on every channel.
//!
//! The table lives on a dedicated thread that consumes its own event stream,
//! so it has exactly one writer. Rendering goes through the host's
//! [`DashboardRenderer`].

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::bus::{Event, EventStream, SubscriptionId};
use crate::collaborators::{DashboardRenderer, Row};
use crate::error::{ProbeError, ProbeResult};
use crate::lifecycle::{Instrument, InstrumentContext, Phase, Step};
use crate::value::Value;

/// Rows of the dashboard in first-seen order.
#[derive(Debug, Default)]
pub struct DashTable {
    rows: Vec<Row>,
    index: HashMap<String, usize>,
}

impl DashTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one event into the table.
    ///
    /// Progress values get a bar keyed `[descr]`; everything else shows its
    /// latest value under the channel name.
    pub fn update(&mut self, ev: &Event) {
        let row = match &ev.value {
            Value::Progress { progress, total, descr } => Row::Progress {
                key: format!("[{descr}]"),
                progress: *progress,
                total: *total,
                descr: descr.clone(),
            },
            other => Row::Scalar {
                key: ev.name.clone(),
                text: other.to_string(),
            },
        };
        match self.index.get(row.key()) {
            Some(&idx) => self.rows[idx] = row,
            None => {
                self.index.insert(row.key().to_string(), self.rows.len());
                self.rows.push(row);
            }
        }
    }

    /// Current rows.
    #[must_use]
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }
}

fn run_dash(stream: &EventStream, renderer: &Mutex<dyn DashboardRenderer>, refresh: Duration) {
    let mut table = DashTable::new();
    let mut dirty = false;
    let mut last_render = Instant::now();
    let render = |table: &DashTable| {
        renderer.lock().unwrap_or_else(PoisonError::into_inner).render(table.rows());
    };

    loop {
        let wait = refresh.saturating_sub(last_render.elapsed());
        match stream.recv_timeout(wait) {
            Ok(Some(ev)) => {
                table.update(&ev);
                dirty = true;
            }
            Ok(None) => {}
            Err(_) => break,
        }
        if last_render.elapsed() >= refresh {
            if dirty {
                render(&table);
                dirty = false;
            }
            last_render = Instant::now();
        }
    }

    render(&table);
    renderer.lock().unwrap_or_else(PoisonError::into_inner).finish();
    debug!(rows = table.rows().len(), "dashboard closed");
}

/// The `dash` instrument.
#[derive(Debug, Default)]
pub struct Dash {
    running: Option<(SubscriptionId, JoinHandle<()>)>,
}

impl Dash {
    #[allow(missing_docs)]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Instrument for Dash {
    fn name(&self) -> &str {
        "dash"
    }

    fn start(&mut self, _ctx: &mut InstrumentContext<'_>) -> ProbeResult<Step> {
        Ok(Step::wait(Phase::Init))
    }

    fn resume(&mut self, phase: Phase, ctx: &mut InstrumentContext<'_>) -> ProbeResult<Step> {
        match phase {
            Phase::Init => {
                let Some(renderer) = ctx.collaborators().renderer.clone() else {
                    warn!("no dashboard renderer configured");
                    return Ok(Step::Finished);
                };
                let stream = ctx.bus().subscribe("*")?;
                let id = stream.subscription_id();
                let refresh = ctx.runtime().dash_refresh_interval;
                let handle = thread::Builder::new()
                    .name("runprobe-dash".to_string())
                    .spawn(move || run_dash(&stream, &renderer, refresh))
                    .map_err(|e| ProbeError::internal(format!("failed to spawn dashboard: {e}")))?;
                self.running = Some((id, handle));
                // Runs after everything else in Finalize, once results are in.
                Ok(Step::wait_with_priority(Phase::Finalize, 1000))
            }
            _ => {
                if let Some((id, handle)) = self.running.take() {
                    // Ends the stream once its buffer is consumed.
                    ctx.bus().unsubscribe(id);
                    if handle.join().is_err() {
                        warn!("dashboard thread panicked");
                    }
                }
                Ok(Step::Finished)
            }
        }
    }
}

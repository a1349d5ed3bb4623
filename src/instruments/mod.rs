//! Built-in instruments.
//!
//! | Name           | Activation   | Runs at                         | Publishes                      |
//! |----------------|--------------|---------------------------------|--------------------------------|
//! | `display`      | gate         | `ParseArgs`                     | nothing (writes events out)    |
//! | `dash`         | gate         | `Init` .. `Finalize`            | nothing (renders a table)      |
//! | `stop`         | `stop: u64`  | `LoadScript`                    | `progress`                     |
//! | `train_rate`   | gate         | `LoadScript`                    | `train_rate`                   |
//! | `loading_rate` | gate         | `LoadScript`                    | `loading_rate`                 |
//! | `compute_rate` | gate         | `LoadScript`                    | `compute_rate`                 |
//! | `gpu`          | gate         | `LoadScript` .. `RunScript`     | `gpudata`                      |
//! | `verify`       | gate         | `ParseArgs` .. `RunScript`      | `initial_loss`, `verify.*`     |
//! | `profile`      | `profile`    | `LoadScript` .. `RunScript`     | `profiler_stats`               |

mod dash;
mod display;
mod gpu;
mod profile;
mod rate;
mod stop;
mod verify;

pub use dash::{Dash, DashTable};
pub use display::Display;
pub use gpu::{GpuMonitor, GPU_CHANNEL};
pub use profile::{report_record, Profile, PROFILER_STATS};
pub use rate::{compute_train_rate, ComputeRate, LoadingRate, TrainRate, RATE_UNITS};
pub use stop::Stop;
pub use verify::Verify;

use crate::error::ProbeResult;
use crate::lifecycle::{Instrument, Overseer};

/// Every built-in instrument, in registration order.
#[must_use]
pub fn builtins() -> Vec<Box<dyn Instrument>> {
    vec![
        Box::new(Display::new()),
        Box::new(Dash::new()),
        Box::new(Stop::new()),
        Box::new(TrainRate::new()),
        Box::new(LoadingRate::new()),
        Box::new(ComputeRate::new()),
        Box::new(GpuMonitor::new()),
        Box::new(Verify::new()),
        Box::new(Profile::new()),
    ]
}

/// Registers every built-in instrument with `overseer`.
///
/// # Errors
///
/// Returns `LifecycleError::DuplicateInstrument` if one of the names is
/// already taken.
pub fn register_builtins(overseer: &mut Overseer) -> ProbeResult<()> {
    for instrument in builtins() {
        overseer.register_boxed(instrument)?;
    }
    Ok(())
}

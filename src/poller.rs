//! Fixed-interval background poller.
//!
//! A `Poller` runs a task on its own thread every `interval`, independently of
//! the lifecycle's resumption order. It is a guard: `stop()` (or dropping it)
//! signals the thread and joins it, so nothing the task does can happen after
//! `stop()` returns. A failing or panicking poll is counted and skipped; the
//! next interval polls again.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::bus::BackgroundTask;
use crate::error::{ProbeError, ProbeResult};

/// Counters for one poller.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStats {
    pub polls: u64,
    pub successes: u64,
    pub failures: u64,
}

struct PollerShared {
    id: Uuid,
    name: String,
    stop_tx: Mutex<Option<Sender<()>>>,
    /// Disconnects when the poll thread exits.
    done: Receiver<()>,
    join: Mutex<Option<JoinHandle<()>>>,
    thread_id: Mutex<Option<ThreadId>>,
    polls: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
}

impl PollerShared {
    fn stats(&self) -> PollStats {
        PollStats {
            polls: self.polls.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

impl BackgroundTask for PollerShared {
    fn id(&self) -> Uuid {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn stop(&self) {
        // Disconnecting the stop channel wakes the thread out of its wait.
        drop(self.stop_tx.lock().unwrap_or_else(PoisonError::into_inner).take());

        let own_thread = *self.thread_id.lock().unwrap_or_else(PoisonError::into_inner) == Some(thread::current().id());
        if own_thread {
            // Stopped from inside a poll: the loop exits after this poll.
            return;
        }
        let handle = self.join.lock().unwrap_or_else(PoisonError::into_inner).take();
        match handle {
            Some(handle) => {
                let _ = handle.join();
                debug!(poller = %self.name, stats = ?self.stats(), "poller stopped");
            }
            // Another caller is joining; wait for the thread all the same.
            None => {
                let _ = self.done.recv();
            }
        }
    }
}

/// Guard over a running background poll loop.
pub struct Poller {
    shared: Arc<PollerShared>,
    detached: bool,
}

impl fmt::Debug for Poller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Poller")
            .field("name", &self.shared.name)
            .field("stats", &self.shared.stats())
            .finish()
    }
}

impl Poller {
    /// Spawns a thread running `task` now and then every `interval`.
    ///
    /// # Errors
    ///
    /// Returns `ProbeError::Internal` if the thread cannot be spawned.
    pub fn start<F, E>(name: impl Into<String>, interval: Duration, mut task: F) -> ProbeResult<Self>
    where
        F: FnMut() -> Result<(), E> + Send + 'static,
        E: fmt::Display,
    {
        let name = name.into();
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (done_tx, done_rx) = bounded::<()>(0);
        let shared = Arc::new(PollerShared {
            id: Uuid::new_v4(),
            name: name.clone(),
            stop_tx: Mutex::new(Some(stop_tx)),
            done: done_rx,
            join: Mutex::new(None),
            thread_id: Mutex::new(None),
            polls: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        });

        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let _done = done_tx;
                loop {
                    thread_shared.polls.fetch_add(1, Ordering::Relaxed);
                    match panic::catch_unwind(AssertUnwindSafe(&mut task)) {
                        Ok(Ok(())) => {
                            thread_shared.successes.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(Err(err)) => {
                            thread_shared.failures.fetch_add(1, Ordering::Relaxed);
                            trace!(poller = %thread_shared.name, error = %err, "poll skipped");
                        }
                        Err(_) => {
                            thread_shared.failures.fetch_add(1, Ordering::Relaxed);
                            debug!(poller = %thread_shared.name, "poll panicked; skipped");
                        }
                    }

                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .map_err(|e| ProbeError::internal(format!("failed to spawn {name}: {e}")))?;

        *shared.thread_id.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle.thread().id());
        *shared.join.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        debug!(poller = %name, ?interval, "poller started");

        Ok(Self {
            shared,
            detached: false,
        })
    }

    /// Stops the loop and joins the thread. Idempotent.
    pub fn stop(&self) {
        self.shared.stop();
    }

    /// Returns true until the poller has been stopped.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared
            .join
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Poll counters so far.
    #[must_use]
    pub fn stats(&self) -> PollStats {
        self.shared.stats()
    }

    /// Id under which this poller is known to a bus.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Handle for registering this poller with a bus.
    #[must_use]
    pub fn task(&self) -> Arc<dyn BackgroundTask> {
        Arc::clone(&self.shared) as Arc<dyn BackgroundTask>
    }

    /// Gives up the guard without stopping the thread. Whoever holds
    /// [`Poller::task`] becomes responsible for stopping it.
    pub fn detach(mut self) {
        self.detached = true;
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        if !self.detached {
            self.shared.stop();
        }
    }
}

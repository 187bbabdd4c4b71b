//! Service run state and live-connection accounting.

use crate::error::NetError;
use crate::fault::catch_fault;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, Default)]
struct RunState {
    running: bool,
    run: u64,
}

/// Running flag and connection counter shared by a service and its
/// connections.
///
/// Transitions are compare-and-set: only one caller can start a stopped
/// service and only one can stop a running one. Every start begins a new
/// run with a fresh id, so work tied to an earlier run still observes that
/// run's end after a quick restart.
#[derive(Debug)]
pub struct Lifecycle {
    state: watch::Sender<RunState>,
    conns: AtomicUsize,
}

impl Lifecycle {
    pub fn new() -> Self {
        let (state, _) = watch::channel(RunState::default());
        Self {
            state,
            conns: AtomicUsize::new(0),
        }
    }

    /// Marks the service running and begins a new run, returning its id.
    pub fn start(&self) -> Result<u64, NetError> {
        let mut run = None;
        self.state.send_if_modified(|state| {
            if state.running {
                false
            } else {
                state.running = true;
                state.run += 1;
                run = Some(state.run);
                true
            }
        });
        run.ok_or(NetError::AlreadyRunning)
    }

    /// Marks the service stopped and wakes everything waiting on the run.
    /// Returns the id of the run that ended.
    pub fn stop(&self) -> Result<u64, NetError> {
        let mut run = None;
        self.state.send_if_modified(|state| {
            if state.running {
                state.running = false;
                run = Some(state.run);
                true
            } else {
                false
            }
        });
        run.ok_or(NetError::NotRunning)
    }

    pub fn is_running(&self) -> bool {
        self.state.borrow().running
    }

    /// Id of the current run, or of the last one if stopped.
    pub fn run_id(&self) -> u64 {
        self.state.borrow().run
    }

    /// Returns true while run `run` is in progress.
    pub fn in_run(&self, run: u64) -> bool {
        let state = *self.state.borrow();
        state.running && state.run == run
    }

    /// Completes once run `run` is over.
    pub async fn run_ended(&self, run: u64) {
        let mut rx = self.state.subscribe();
        let _ = rx
            .wait_for(|state| !state.running || state.run != run)
            .await;
    }

    /// Completes once the current run is over.
    pub async fn stopped(&self) {
        self.run_ended(self.run_id()).await
    }

    /// Number of connections opened and not yet closed.
    pub fn conns(&self) -> usize {
        self.conns.load(Ordering::Acquire)
    }

    pub(crate) fn conn_opened(&self) {
        self.conns.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn conn_closed(&self) {
        self.conns.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives a periodic tick until the service stops.
///
/// `on_tick` runs immediately and then again after each delay it returns.
/// A panicking tick ends the loop without affecting the service.
pub async fn run_ticker<F, Fut>(lifecycle: Arc<Lifecycle>, mut on_tick: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Duration>,
{
    let run = lifecycle.run_id();
    while lifecycle.in_run(run) {
        let delay = match catch_fault(on_tick()).await {
            Ok(delay) => delay,
            Err(e) => {
                tracing::warn!("Ticker stopped: {}", e);
                return;
            }
        };
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = lifecycle.run_ended(run) => return,
        }
    }
}

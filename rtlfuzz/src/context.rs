//! Process-wide simulation context.
//!
//! Model runtimes query the elapsed simulation time through a callback with a
//! fixed signature and no caller context (the `sc_time_stamp` convention), so
//! the current tick has to be reachable from a global. Exactly one simulation
//! exists per process; [`install`] publishes its clock.

use anyhow::{Result, bail};
use once_cell::sync::OnceCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared handle to the tick counter of a simulation.
///
/// Only the clock stepper advances it; everybody else reads.
#[derive(Debug, Clone, Default)]
pub struct SimTime(Arc<AtomicU64>);

impl SimTime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub(crate) fn tick(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

static CONTEXT: OnceCell<SimTime> = OnceCell::new();

/// Installs the process-wide simulation clock.
///
/// Fails if a clock was already installed.
pub fn install(time: SimTime) -> Result<()> {
    if CONTEXT.set(time).is_err() {
        bail!("a simulation context is already installed for this process");
    }
    Ok(())
}

/// Current simulation time in ticks, as seen by the model runtime.
///
/// Returns `0.0` until a context is installed.
pub fn time_stamp() -> f64 {
    CONTEXT.get().map_or(0.0, |time| time.get() as f64)
}

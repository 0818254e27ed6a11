//! Per-test-case state machine: reset, feed stimulus, drain coverage.

use anyhow::Result;
use slog::{Logger, o, trace};

use crate::clock::Simulation;
use crate::model::CircuitModel;
use crate::queue::FuzzQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Reset is held for exactly one cycle.
    ResetHold,
    /// One stimulus unit is popped and clocked in per cycle.
    Feeding,
    /// Coverage is read and pushed; the case ends.
    Draining,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseOutcome {
    Completed {
        /// Stimulus units clocked in after reset.
        cycles_fed: u64,
    },
    /// The model ended the run mid-case. No coverage was pushed.
    ModelFinished { tick: u64 },
}

/// Drives test cases against a simulation.
///
/// Owns the stimulus and coverage buffers, so queue backends only ever see
/// slices of the configured widths.
pub struct TestRunner {
    input: Vec<u8>,
    coverage: Vec<u8>,
    log: Logger,
}

impl TestRunner {
    pub fn new(input_width: usize, coverage_width: usize, log: &Logger) -> Self {
        Self {
            input: vec![0; input_width],
            coverage: vec![0; coverage_width],
            log: log.new(o!("component" => "runner")),
        }
    }

    /// Runs one complete case.
    pub fn run_case<M, Q>(&mut self, sim: &mut Simulation<M>, queue: &mut Q) -> Result<CaseOutcome>
    where
        M: CircuitModel,
        Q: FuzzQueue + ?Sized,
    {
        let mut phase = Phase::ResetHold;
        let mut cycles_fed = 0;
        loop {
            trace!(self.log, "Phase"; "phase" => ?phase, "tick" => sim.tick());
            phase = match phase {
                Phase::ResetHold => {
                    sim.set_reset(true);
                    if let Err(finish) = sim.step() {
                        return Ok(CaseOutcome::ModelFinished { tick: finish.tick });
                    }
                    sim.set_reset(false);
                    Phase::Feeding
                }
                Phase::Feeding => {
                    if queue.pop(&mut self.input)? {
                        sim.apply(&self.input);
                        if let Err(finish) = sim.step() {
                            return Ok(CaseOutcome::ModelFinished { tick: finish.tick });
                        }
                        cycles_fed += 1;
                        Phase::Feeding
                    } else {
                        Phase::Draining
                    }
                }
                Phase::Draining => {
                    sim.extract(&mut self.coverage);
                    queue.push(&self.coverage)?;
                    Phase::Done
                }
                Phase::Done => return Ok(CaseOutcome::Completed { cycles_fed }),
            };
        }
    }
}

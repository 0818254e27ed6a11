//! The control loop: run test cases until the queue reports it is done.

use anyhow::Result;
use slog::{Logger, info, o, warn};

use crate::clock::Simulation;
use crate::context;
use crate::logging;
use crate::model::CircuitModel;
use crate::queue::FuzzQueue;
use crate::runner::{CaseOutcome, TestRunner};
use crate::waveform::WaveformSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// The queue reported that no work remains.
    Exhausted,
    /// The model requested the end of the run; the in-flight case was dropped.
    ModelFinished { tick: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Cases that ran to completion and pushed coverage.
    pub cases: u64,
    pub cycles: u64,
    pub ticks: u64,
    pub exit: RunExit,
}

pub struct DriverBuilder<M> {
    model: M,
    sink: Option<Box<dyn WaveformSink>>,
    install_context: bool,
    log: Option<Logger>,
}

impl<M: CircuitModel> DriverBuilder<M> {
    pub fn new(model: M) -> Self {
        Self {
            model,
            sink: None,
            install_context: false,
            log: None,
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn WaveformSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Publishes the simulation clock as the process-wide time source.
    pub fn install_context(mut self) -> Self {
        self.install_context = true;
        self
    }

    pub fn with_logger(mut self, log: Logger) -> Self {
        self.log = Some(log);
        self
    }

    pub fn build(self) -> Result<Driver<M>> {
        let log = self.log.unwrap_or_else(logging::discard);
        let mut sim = Simulation::new(self.model, &log)?;
        if let Some(sink) = self.sink {
            sim = sim.with_sink(sink);
        }
        if self.install_context {
            context::install(sim.time())?;
        }
        let runner = TestRunner::new(sim.map().input_width(), sim.map().coverage_width(), &log);
        Ok(Driver {
            sim,
            runner,
            log: log.new(o!("component" => "driver")),
        })
    }
}

/// Owns the simulation for the lifetime of one fuzzing run.
pub struct Driver<M> {
    sim: Simulation<M>,
    runner: TestRunner,
    log: Logger,
}

impl<M: CircuitModel> Driver<M> {
    pub fn simulation(&self) -> &Simulation<M> {
        &self.sim
    }

    /// Runs test cases until `queue` is done or the model finishes the run.
    ///
    /// Consumes the driver: the queue is initialised exactly once.
    pub fn run<Q: FuzzQueue + ?Sized>(mut self, queue: &mut Q) -> Result<RunSummary> {
        let result = self.run_cases(queue);
        if result.is_err() {
            self.sim.close_sink();
        }
        result
    }

    fn run_cases<Q: FuzzQueue + ?Sized>(&mut self, queue: &mut Q) -> Result<RunSummary> {
        queue.init(self.sim.map().coverage_width())?;
        info!(self.log, "Starting";
            "input_width" => self.sim.map().input_width(),
            "coverage_width" => self.sim.map().coverage_width());

        let mut cases = 0;
        while !queue.done()? {
            match self.runner.run_case(&mut self.sim, queue)? {
                CaseOutcome::Completed { .. } => cases += 1,
                CaseOutcome::ModelFinished { tick } => {
                    warn!(self.log, "Model finished the run"; "tick" => tick, "cases" => cases);
                    return Ok(self.summary(cases, RunExit::ModelFinished { tick }));
                }
            }
        }

        info!(self.log, "Simulation completed after {} cycles", self.sim.cycles(); "cases" => cases);
        // Flush pending combinational settling.
        if let Err(finish) = self.sim.settle() {
            return Ok(self.summary(cases, RunExit::ModelFinished { tick: finish.tick }));
        }
        self.sim.close_sink();
        Ok(self.summary(cases, RunExit::Exhausted))
    }

    fn summary(&self, cases: u64, exit: RunExit) -> RunSummary {
        RunSummary {
            cases,
            cycles: self.sim.cycles(),
            ticks: self.sim.tick(),
            exit,
        }
    }
}

/// Runs `driver` and ends the process as soon as the model finishes the run.
///
/// The waveform sink is already closed by then; exit status is 0.
pub fn run_and_exit<M, Q>(driver: Driver<M>, queue: &mut Q) -> Result<RunSummary>
where
    M: CircuitModel,
    Q: FuzzQueue + ?Sized,
{
    let summary = driver.run(queue)?;
    if let RunExit::ModelFinished { .. } = summary.exit {
        std::process::exit(0);
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{CounterModel, QueueCall, RecordingSink, ScriptedQueue};

    #[test]
    fn runs_every_case_then_settles_once() {
        let (sink, recorded) = RecordingSink::new();
        let driver = DriverBuilder::new(CounterModel::new(40, 8))
            .with_sink(Box::new(sink))
            .build()
            .unwrap();
        let units = vec![vec![0u8; 40]; 3];
        let mut queue = ScriptedQueue::new(vec![units]);

        let summary = driver.run(&mut queue).unwrap();
        assert_eq!(
            summary,
            RunSummary {
                cases: 1,
                cycles: 4,
                ticks: 8,
                exit: RunExit::Exhausted,
            }
        );
        assert_eq!(queue.calls.first(), Some(&QueueCall::Init(8)));
        assert_eq!(queue.count(|c| matches!(c, QueueCall::Push(_))), 1);
        assert_eq!(queue.calls.last(), Some(&QueueCall::Done(true)));
        // Eight half-cycle samples plus the final settle at tick 8.
        assert_eq!(recorded.borrow().ticks.len(), 9);
        assert_eq!(recorded.borrow().ticks.last(), Some(&8));
        assert!(recorded.borrow().closed);
    }

    #[test]
    fn done_queue_runs_nothing() {
        let driver = DriverBuilder::new(CounterModel::new(1, 1)).build().unwrap();
        let mut queue = ScriptedQueue::new(vec![]);
        let summary = driver.run(&mut queue).unwrap();
        assert_eq!(summary.cases, 0);
        assert_eq!(summary.ticks, 0);
        assert_eq!(queue.calls, vec![QueueCall::Init(1), QueueCall::Done(true)]);
    }

    #[test]
    fn model_finish_stops_the_loop() {
        let mut model = CounterModel::new(1, 1);
        model.finish_after = Some(6);
        let (sink, recorded) = RecordingSink::new();
        let driver = DriverBuilder::new(model)
            .with_sink(Box::new(sink))
            .build()
            .unwrap();
        let mut queue = ScriptedQueue::new(vec![vec![vec![1]], vec![vec![2]], vec![vec![3]]]);
        let summary = driver.run(&mut queue).unwrap();
        assert_eq!(summary.exit, RunExit::ModelFinished { tick: 5 });
        assert_eq!(summary.cases, 1);
        assert!(recorded.borrow().closed);
        // The second case never pushed.
        assert_eq!(queue.pushes().len(), 1);
    }

    /// Counter whose two input bytes land on one register.
    struct Aliased(CounterModel);

    impl CircuitModel for Aliased {
        fn ports(&self) -> crate::model::PortLayout {
            let mut ports = self.0.ports();
            ports.inputs[1].handle = ports.inputs[0].handle;
            ports
        }
        fn set_clock(&mut self, high: bool) {
            self.0.set_clock(high)
        }
        fn set_reset(&mut self, asserted: bool) {
            self.0.set_reset(asserted)
        }
        fn set_input(&mut self, register: crate::model::RegisterHandle, value: u8) {
            self.0.set_input(register, value)
        }
        fn output(&self, register: crate::model::RegisterHandle) -> u8 {
            self.0.output(register)
        }
        fn advance(&mut self) -> crate::model::Advance {
            self.0.advance()
        }
    }

    #[test]
    fn aliased_ports_fail_the_build() {
        let err = DriverBuilder::new(Aliased(CounterModel::new(2, 1)))
            .build()
            .err()
            .unwrap()
            .to_string();
        assert!(err.contains("reuses register 0"), "{err}");
    }
}

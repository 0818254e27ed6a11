//! Clock stepping of a circuit model.
//!
//! One cycle is two ticks: the model is settled with the clock low, then with
//! the clock high. Settling before each toggle lets combinational logic
//! stabilise under the previous clock value before the edge is presented.

use anyhow::Result;
use slog::{Logger, o, warn};

use crate::context::SimTime;
use crate::marshal::RegisterMap;
use crate::model::{Advance, CircuitModel};
use crate::waveform::{Sample, WaveformSink};

/// The model asked for the run to end while it was being advanced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Finish {
    /// Tick at which the request was observed.
    pub tick: u64,
}

/// A circuit model together with its clock, register map and waveform sink.
pub struct Simulation<M> {
    model: M,
    map: RegisterMap,
    time: SimTime,
    sink: Option<Box<dyn WaveformSink>>,
    clock: bool,
    reset: bool,
    last_input: Vec<u8>,
    outputs: Vec<u8>,
    log: Logger,
}

impl<M: CircuitModel> Simulation<M> {
    /// Fails if the model's port layout does not describe a valid register map.
    pub fn new(model: M, log: &Logger) -> Result<Self> {
        let map = RegisterMap::from_ports(&model.ports())?;
        let last_input = vec![0; map.input_width()];
        let outputs = vec![0; map.coverage_width()];
        Ok(Self {
            model,
            map,
            time: SimTime::new(),
            sink: None,
            clock: false,
            reset: false,
            last_input,
            outputs,
            log: log.new(o!("component" => "clock")),
        })
    }

    pub fn with_sink(mut self, sink: Box<dyn WaveformSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn map(&self) -> &RegisterMap {
        &self.map
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Handle to the tick counter, for installing into the process context.
    pub fn time(&self) -> SimTime {
        self.time.clone()
    }

    pub fn tick(&self) -> u64 {
        self.time.get()
    }

    pub fn cycles(&self) -> u64 {
        self.tick() / 2
    }

    pub fn set_reset(&mut self, asserted: bool) {
        self.reset = asserted;
        self.model.set_reset(asserted);
    }

    /// Writes one stimulus unit to the input registers.
    pub fn apply(&mut self, input: &[u8]) {
        self.map.apply(&mut self.model, input);
        self.last_input.copy_from_slice(input);
    }

    /// Reads the coverage vector from the output registers.
    pub fn extract(&self, coverage: &mut [u8]) {
        self.map.extract(&self.model, coverage);
    }

    /// Advances the model by one full clock cycle.
    ///
    /// On `Err` the run must end: the model finished mid-cycle and the
    /// waveform sink has already been closed.
    pub fn step(&mut self) -> Result<(), Finish> {
        self.half_step(false)?;
        self.half_step(true)
    }

    fn half_step(&mut self, clock: bool) -> Result<(), Finish> {
        self.clock = clock;
        self.model.set_clock(clock);
        if self.model.advance() == Advance::Finished {
            let tick = self.tick();
            self.close_sink();
            return Err(Finish { tick });
        }
        self.record();
        self.time.tick();
        Ok(())
    }

    /// Settles pending combinational logic without advancing time.
    pub fn settle(&mut self) -> Result<(), Finish> {
        if self.model.advance() == Advance::Finished {
            let tick = self.tick();
            self.close_sink();
            return Err(Finish { tick });
        }
        self.record();
        Ok(())
    }

    fn record(&mut self) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        self.map.extract(&self.model, &mut self.outputs);
        let sample = Sample {
            clock: self.clock,
            reset: self.reset,
            inputs: &self.last_input,
            outputs: &self.outputs,
        };
        if let Err(e) = sink.sample(self.time.get(), &sample) {
            warn!(self.log, "Dropping waveform sink"; "error" => %e);
            self.sink = None;
        }
    }

    /// Flushes and closes the waveform sink, if any. Errors are logged only.
    pub fn close_sink(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            if let Err(e) = sink.close() {
                warn!(self.log, "Unable to close waveform sink"; "error" => %e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging;
    use crate::test_utils::{CounterModel, Event, RecordingSink};

    #[test]
    fn step_advances_two_ticks_per_cycle() {
        let mut sim = Simulation::new(CounterModel::new(2, 1), &logging::discard()).unwrap();
        for n in 1..=25u64 {
            let before = sim.tick();
            sim.step().unwrap();
            assert_eq!(sim.tick(), before + 2);
            assert_eq!(sim.tick(), 2 * n);
        }
        assert_eq!(sim.cycles(), 25);
    }

    #[test]
    fn clock_goes_low_then_high_around_each_advance() {
        let mut sim = Simulation::new(CounterModel::new(1, 1), &logging::discard()).unwrap();
        sim.step().unwrap();
        assert_eq!(
            sim.model().events,
            vec![
                Event::Clock(false),
                Event::Advance,
                Event::Clock(true),
                Event::Advance
            ]
        );
        // The counter samples on the rising edge only.
        assert_eq!(sim.model().edges, 1);
    }

    #[test]
    fn sink_sees_one_sample_per_tick() {
        let (sink, samples) = RecordingSink::new();
        let mut sim = Simulation::new(CounterModel::new(1, 1), &logging::discard())
            .unwrap()
            .with_sink(Box::new(sink));
        sim.step().unwrap();
        sim.step().unwrap();
        sim.settle().unwrap();
        let ticks: Vec<u64> = samples.borrow().ticks.clone();
        assert_eq!(ticks, vec![0, 1, 2, 3, 4]);
        assert_eq!(samples.borrow().clocks, vec![false, true, false, true, true]);
    }

    #[test]
    fn finish_mid_cycle_closes_sink_and_keeps_tick() {
        let (sink, samples) = RecordingSink::new();
        let mut model = CounterModel::new(1, 1);
        // Second advance is the rising half of the first cycle.
        model.finish_after = Some(2);
        let mut sim = Simulation::new(model, &logging::discard())
            .unwrap()
            .with_sink(Box::new(sink));
        assert_eq!(sim.step(), Err(Finish { tick: 1 }));
        assert_eq!(sim.tick(), 1);
        assert!(samples.borrow().closed);
        assert_eq!(samples.borrow().ticks, vec![0]);
    }
}

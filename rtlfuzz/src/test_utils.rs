//! Deterministic models, sinks and queues for tests.

use anyhow::{Context, Result};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use crate::model::{Advance, CircuitModel, PortLayout, RegisterHandle};
use crate::queue::FuzzQueue;
use crate::queue::shared::{BatchHeader, SegmentProvider};
use crate::waveform::{Sample, WaveformSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Clock(bool),
    Reset(bool),
    Advance,
}

/// A small synchronous circuit.
///
/// On every rising edge with reset low it latches its inputs and counts the
/// edge. Output 0 is the edge count since the last reset, output 1 is the
/// latched input byte 0, further outputs xor-accumulate latched inputs.
#[derive(Debug, Clone)]
pub struct CounterModel {
    pub inputs: Vec<u8>,
    pub outputs: Vec<u8>,
    pub events: Vec<Event>,
    /// Rising edges seen, reset or not.
    pub edges: u64,
    /// Return [`Advance::Finished`] on this advance (1-based).
    pub finish_after: Option<usize>,
    clock: bool,
    reset: bool,
    prev_clock: bool,
    advances: usize,
}

impl CounterModel {
    pub fn new(input_width: usize, coverage_width: usize) -> Self {
        Self {
            inputs: vec![0; input_width],
            outputs: vec![0; coverage_width],
            events: Vec::new(),
            edges: 0,
            finish_after: None,
            clock: false,
            reset: false,
            prev_clock: false,
            advances: 0,
        }
    }

    fn rising_edge(&mut self) {
        self.edges += 1;
        if self.reset {
            self.outputs.iter_mut().for_each(|o| *o = 0);
            return;
        }
        let width = self.inputs.len();
        for (index, out) in self.outputs.iter_mut().enumerate() {
            match index {
                0 => *out = out.wrapping_add(1),
                1 => *out = self.inputs.first().copied().unwrap_or(0),
                _ if width > 0 => *out ^= self.inputs[index % width],
                _ => {}
            }
        }
    }
}

impl CircuitModel for CounterModel {
    fn ports(&self) -> PortLayout {
        PortLayout::sequential(
            (0..self.inputs.len()).map(|i| format!("io_input_bytes_{i}")),
            (0..self.outputs.len()).map(|i| format!("io_coverage_bytes_{i}")),
        )
    }

    fn set_clock(&mut self, high: bool) {
        self.clock = high;
        self.events.push(Event::Clock(high));
    }

    fn set_reset(&mut self, asserted: bool) {
        self.reset = asserted;
        self.events.push(Event::Reset(asserted));
    }

    fn set_input(&mut self, register: RegisterHandle, value: u8) {
        self.inputs[register.0] = value;
    }

    fn output(&self, register: RegisterHandle) -> u8 {
        self.outputs[register.0]
    }

    fn advance(&mut self) -> Advance {
        self.advances += 1;
        self.events.push(Event::Advance);
        if self.finish_after == Some(self.advances) {
            return Advance::Finished;
        }
        if self.clock && !self.prev_clock {
            self.rising_edge();
        }
        self.prev_clock = self.clock;
        Advance::Settled
    }
}

#[derive(Debug, Default)]
pub struct Recorded {
    pub ticks: Vec<u64>,
    pub clocks: Vec<bool>,
    pub closed: bool,
}

/// Sink that keeps samples in memory behind a shared handle.
pub struct RecordingSink(Rc<RefCell<Recorded>>);

impl RecordingSink {
    pub fn new() -> (Self, Rc<RefCell<Recorded>>) {
        let recorded = Rc::new(RefCell::new(Recorded::default()));
        (Self(recorded.clone()), recorded)
    }
}

impl WaveformSink for RecordingSink {
    fn sample(&mut self, tick: u64, sample: &Sample<'_>) -> Result<()> {
        let mut recorded = self.0.borrow_mut();
        recorded.ticks.push(tick);
        recorded.clocks.push(sample.clock);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.0.borrow_mut().closed = true;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueCall {
    Init(usize),
    Done(bool),
    Pop(bool),
    Push(Vec<u8>),
}

/// Queue that serves a fixed list of cases and logs every call.
#[derive(Debug, Default)]
pub struct ScriptedQueue {
    cases: VecDeque<VecDeque<Vec<u8>>>,
    pub calls: Vec<QueueCall>,
}

impl ScriptedQueue {
    pub fn new(cases: Vec<Vec<Vec<u8>>>) -> Self {
        Self {
            cases: cases.into_iter().map(VecDeque::from).collect(),
            calls: Vec::new(),
        }
    }

    pub fn pushes(&self) -> Vec<Vec<u8>> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                QueueCall::Push(coverage) => Some(coverage.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&QueueCall) -> bool) -> usize {
        self.calls.iter().filter(|c| pred(c)).count()
    }
}

impl FuzzQueue for ScriptedQueue {
    fn init(&mut self, coverage_width: usize) -> Result<()> {
        self.calls.push(QueueCall::Init(coverage_width));
        Ok(())
    }

    fn done(&mut self) -> Result<bool> {
        let done = self.cases.is_empty();
        self.calls.push(QueueCall::Done(done));
        Ok(done)
    }

    fn pop(&mut self, input: &mut [u8]) -> Result<bool> {
        let unit = self.cases.front_mut().and_then(VecDeque::pop_front);
        let popped = match unit {
            Some(unit) => {
                input.copy_from_slice(&unit);
                true
            }
            None => false,
        };
        self.calls.push(QueueCall::Pop(popped));
        Ok(popped)
    }

    fn push(&mut self, coverage: &[u8]) -> Result<()> {
        self.calls.push(QueueCall::Push(coverage.to_vec()));
        self.cases.pop_front();
        Ok(())
    }
}

/// In-process stand-in for the fuzzing server's shared segments.
#[derive(Debug, Default)]
pub struct MemorySegments {
    segments: HashMap<u32, Vec<u8>>,
}

impl MemorySegments {
    pub fn with(mut self, id: u32, contents: Vec<u8>) -> Self {
        self.segments.insert(id, contents);
        self
    }
}

impl SegmentProvider for MemorySegments {
    type Segment = Vec<u8>;

    fn attach(&mut self, id: u32) -> Result<Vec<u8>> {
        self.segments
            .remove(&id)
            .with_context(|| format!("no segment {id}"))
    }
}

/// Encodes a test batch the way the fuzzing server lays it out in a segment.
pub fn test_batch(buffer_id: u32, tests: &[&[&[u8]]]) -> Vec<u8> {
    let mut out = BatchHeader {
        buffer_id,
        tests: tests.len() as u16,
    }
    .encode()
    .to_vec();
    for test in tests {
        out.extend_from_slice(&(test.len() as u64).to_be_bytes());
        for unit in *test {
            out.extend_from_slice(unit);
        }
    }
    out
}

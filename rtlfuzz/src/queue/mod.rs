//! The queue protocol between the simulation driver and a fuzzing engine.
//!
//! A backend is initialised once with the coverage width. After that the
//! driver runs test cases while [`FuzzQueue::done`] reports work remaining;
//! each case is any number of [`FuzzQueue::pop`] calls (one stimulus unit
//! each) until one returns `false`, followed by exactly one
//! [`FuzzQueue::push`] of the coverage vector.
//!
//! Call order is enforced by the test runner, not checked by backends.

use anyhow::Result;
use slog::Logger;

use crate::config::QueueConfig;

pub mod engine;
pub mod replay;
pub mod shared;

pub trait FuzzQueue {
    /// Called exactly once, before any other call.
    fn init(&mut self, coverage_width: usize) -> Result<()>;

    /// Whether the backend has no further test cases to run.
    fn done(&mut self) -> Result<bool>;

    /// Fills `input` with the next stimulus unit of the current case.
    ///
    /// Returns `false` when the case has no more stimulus.
    fn pop(&mut self, input: &mut [u8]) -> Result<bool>;

    /// Reports the coverage vector that ends the current case.
    fn push(&mut self, coverage: &[u8]) -> Result<()>;
}

impl<Q: FuzzQueue + ?Sized> FuzzQueue for Box<Q> {
    fn init(&mut self, coverage_width: usize) -> Result<()> {
        (**self).init(coverage_width)
    }

    fn done(&mut self) -> Result<bool> {
        (**self).done()
    }

    fn pop(&mut self, input: &mut [u8]) -> Result<bool> {
        (**self).pop(input)
    }

    fn push(&mut self, coverage: &[u8]) -> Result<()> {
        (**self).push(coverage)
    }
}

/// Builds the backend selected by `config`.
pub fn from_config(
    config: &QueueConfig,
    input_width: usize,
    log: &Logger,
) -> Result<Box<dyn FuzzQueue>> {
    Ok(match config {
        QueueConfig::Engine(options) => {
            Box::new(engine::EngineQueue::new(options.clone(), input_width, log)?)
        }
        QueueConfig::Shared(options) => Box::new(shared::SharedQueue::open_pipes(
            &options.rx,
            &options.tx,
            options.segment_size,
            input_width,
            log,
        )?),
    })
}

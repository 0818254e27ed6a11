//! A coverage-guided fuzzing driver for clocked circuit models.
//!
//! The driver feeds attacker-controlled bytes into a register-level circuit
//! model one clock cycle at a time and reports a fixed-size coverage vector
//! back to a fuzzing engine after every test case. Each case resets the
//! circuit for one cycle, clocks in stimulus until the engine runs out of it,
//! then reads the coverage registers.
//!
//! The engine side is pluggable: an in-process mutation engine built on
//! `libafl`, or a cross-process queue served by an external fuzzing server.
//!
//! ## Getting Started
//!
//! Implement [`model::CircuitModel`] for your circuit, then run the control
//! loop against a queue backend.
//!
//! ```no_run
//! use rtlfuzz::config::EngineOptions;
//! use rtlfuzz::driver::DriverBuilder;
//! use rtlfuzz::logging;
//! use rtlfuzz::model::{Advance, CircuitModel, PortLayout, RegisterHandle};
//! use rtlfuzz::queue::engine::EngineQueue;
//!
//! struct Echo {
//!     value: u8,
//!     latched: u8,
//!     clock: bool,
//! }
//!
//! impl CircuitModel for Echo {
//!     fn ports(&self) -> PortLayout {
//!         PortLayout::sequential(["in"], ["out"])
//!     }
//!     fn set_clock(&mut self, high: bool) {
//!         self.clock = high;
//!     }
//!     fn set_reset(&mut self, _asserted: bool) {}
//!     fn set_input(&mut self, _register: RegisterHandle, value: u8) {
//!         self.value = value;
//!     }
//!     fn output(&self, _register: RegisterHandle) -> u8 {
//!         self.latched
//!     }
//!     fn advance(&mut self) -> Advance {
//!         if self.clock {
//!             self.latched = self.value;
//!         }
//!         Advance::Settled
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     let log = logging::terminal(slog::Level::Info);
//!     let options = EngineOptions {
//!         max_executions: Some(1_000),
//!         ..EngineOptions::default()
//!     };
//!     let mut queue = EngineQueue::new(options, 1, &log)?;
//!     let driver = DriverBuilder::new(Echo { value: 0, latched: 0, clock: false })
//!         .with_logger(log)
//!         .build()?;
//!     let summary = driver.run(&mut queue)?;
//!     println!("{} cases, {} cycles", summary.cases, summary.cycles);
//!     Ok(())
//! }
//! ```
pub mod clock;
pub mod config;
pub mod constants;
pub mod context;
pub mod driver;
pub mod logging;
pub mod marshal;
pub mod model;
pub mod queue;
pub mod runner;
pub mod waveform;

#[doc(hidden)]
pub mod test_utils;

// re-export libAFL and libAFL_bolts
pub use libafl;
pub use libafl_bolts;

//! A combination lock, modelled at register level.
//!
//! Each cycle the circuit samples an 8-bit `code` and a 1-bit `enter` strobe.
//! The strobe is the MSB of its register, matching the bit packing of the
//! harness description.
//! Entering the four digits of the secret in order opens the lock; any wrong
//! digit sends it back to the idle state. The coverage registers record, for
//! every state, whether the lock was seen in it and out of it since reset.

use rtlfuzz::context;
use rtlfuzz::model::{Advance, CircuitModel, PortLayout, RegisterHandle};
use slog::{Logger, info};

pub const SECRET: [u8; 4] = [0x42, 0x13, 0x37, 0xC0];

const OPEN: usize = SECRET.len();
const STATES: usize = OPEN + 1;
const COVERAGE_BYTES: usize = (STATES * 2).div_ceil(8);

const CODE: RegisterHandle = RegisterHandle(0);
const ENTER: RegisterHandle = RegisterHandle(1);
pub const ENTER_BIT: u8 = 0x80;

pub struct Lock {
    code: u8,
    enter: u8,
    clock: bool,
    reset: bool,
    prev_clock: bool,
    state: usize,
    coverage: [u8; COVERAGE_BYTES],
    finish_on_unlock: bool,
    log: Logger,
}

impl Lock {
    pub fn new(log: &Logger) -> Self {
        Self {
            code: 0,
            enter: 0,
            clock: false,
            reset: false,
            prev_clock: false,
            state: 0,
            coverage: [0; COVERAGE_BYTES],
            finish_on_unlock: true,
            log: log.clone(),
        }
    }

    /// Keep running after the lock opens instead of finishing the simulation.
    pub fn keep_running(mut self) -> Self {
        self.finish_on_unlock = false;
        self
    }

    pub fn is_open(&self) -> bool {
        self.state == OPEN
    }

    fn mark(&mut self, index: usize) {
        self.coverage[index / 8] |= 0x80 >> (index % 8);
    }

    fn rising_edge(&mut self) {
        if self.reset {
            self.state = 0;
            self.coverage = [0; COVERAGE_BYTES];
            return;
        }
        if self.enter & ENTER_BIT != 0 && self.state < OPEN {
            self.state = if self.code == SECRET[self.state] {
                self.state + 1
            } else {
                0
            };
        }
        for state in 0..STATES {
            let index = if self.state == state { 2 * state } else { 2 * state + 1 };
            self.mark(index);
        }
    }
}

impl CircuitModel for Lock {
    fn ports(&self) -> PortLayout {
        PortLayout::sequential(
            ["code", "enter"],
            (0..COVERAGE_BYTES).map(|i| format!("coverage_{i}")),
        )
    }

    fn set_clock(&mut self, high: bool) {
        self.clock = high;
    }

    fn set_reset(&mut self, asserted: bool) {
        self.reset = asserted;
    }

    fn set_input(&mut self, register: RegisterHandle, value: u8) {
        match register {
            CODE => self.code = value,
            ENTER => self.enter = value,
            _ => {}
        }
    }

    fn output(&self, register: RegisterHandle) -> u8 {
        self.coverage.get(register.0).copied().unwrap_or(0)
    }

    fn advance(&mut self) -> Advance {
        let edge = self.clock && !self.prev_clock;
        self.prev_clock = self.clock;
        if edge {
            let was_open = self.is_open();
            self.rising_edge();
            if self.is_open() && !was_open {
                info!(self.log, "Lock opened"; "time" => context::time_stamp());
                if self.finish_on_unlock {
                    return Advance::Finished;
                }
            }
        }
        Advance::Settled
    }
}

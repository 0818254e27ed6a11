//! Register marshalling between fixed-width byte buffers and model registers.

use anyhow::{Result, bail};
use std::collections::HashSet;

use crate::model::{CircuitModel, Port, PortLayout, RegisterHandle};

/// Table-driven mapping from buffer byte positions to model registers.
///
/// The tables are built from the model's [`PortLayout`], one entry per port.
/// Every byte of a stimulus unit or coverage vector corresponds to exactly one
/// register, and no two bytes of the same buffer share a register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterMap {
    inputs: Vec<RegisterHandle>,
    outputs: Vec<RegisterHandle>,
}

impl RegisterMap {
    /// Fails if two inputs, or two outputs, name the same register.
    pub fn from_ports(ports: &PortLayout) -> Result<Self> {
        Ok(Self {
            inputs: distinct_handles("input", &ports.inputs)?,
            outputs: distinct_handles("output", &ports.outputs)?,
        })
    }

    /// Number of bytes in one stimulus unit.
    pub fn input_width(&self) -> usize {
        self.inputs.len()
    }

    /// Number of bytes in one coverage vector.
    pub fn coverage_width(&self) -> usize {
        self.outputs.len()
    }

    /// Checks the widths a harness description expects against the model.
    pub fn check_widths(&self, input: usize, coverage: usize) -> Result<()> {
        if input != self.input_width() {
            bail!(
                "harness expects {input} input bytes per cycle, the model exposes {} input registers",
                self.input_width()
            );
        }
        if coverage != self.coverage_width() {
            bail!(
                "harness expects {coverage} coverage bytes, the model exposes {} output registers",
                self.coverage_width()
            );
        }
        Ok(())
    }

    /// Writes each byte of `buffer` to its input register, in index order.
    ///
    /// `buffer` must be exactly [`Self::input_width`] bytes long.
    pub fn apply<M: CircuitModel + ?Sized>(&self, model: &mut M, buffer: &[u8]) {
        debug_assert_eq!(buffer.len(), self.inputs.len());
        for (&register, &value) in self.inputs.iter().zip(buffer) {
            model.set_input(register, value);
        }
    }

    /// Reads each output register into its byte position of `buffer`.
    ///
    /// `buffer` must be exactly [`Self::coverage_width`] bytes long.
    pub fn extract<M: CircuitModel + ?Sized>(&self, model: &M, buffer: &mut [u8]) {
        debug_assert_eq!(buffer.len(), self.outputs.len());
        for (&register, slot) in self.outputs.iter().zip(buffer.iter_mut()) {
            *slot = model.output(register);
        }
    }
}

fn distinct_handles(kind: &str, ports: &[Port]) -> Result<Vec<RegisterHandle>> {
    let mut seen = HashSet::with_capacity(ports.len());
    for port in ports {
        if !seen.insert(port.handle) {
            bail!(
                "{kind} port {} reuses register {}, already mapped by another {kind} byte",
                port.name,
                port.handle.0
            );
        }
    }
    Ok(ports.iter().map(|p| p.handle).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Advance;

    /// Inputs and outputs alias the same register file.
    struct Loopback {
        regs: Vec<u8>,
    }

    impl CircuitModel for Loopback {
        fn ports(&self) -> PortLayout {
            // Outputs are listed in reverse to exercise handle lookup.
            let inputs = (0..self.regs.len())
                .map(|i| Port {
                    name: format!("in_{i}"),
                    handle: RegisterHandle(i),
                })
                .collect();
            let outputs = (0..self.regs.len())
                .rev()
                .map(|i| Port {
                    name: format!("out_{i}"),
                    handle: RegisterHandle(i),
                })
                .collect();
            PortLayout { inputs, outputs }
        }

        fn set_clock(&mut self, _high: bool) {}

        fn set_reset(&mut self, _asserted: bool) {}

        fn set_input(&mut self, register: RegisterHandle, value: u8) {
            self.regs[register.0] = value;
        }

        fn output(&self, register: RegisterHandle) -> u8 {
            self.regs[register.0]
        }

        fn advance(&mut self) -> Advance {
            Advance::Settled
        }
    }

    #[test]
    fn apply_then_extract_follows_the_tables() {
        let mut model = Loopback { regs: vec![0; 5] };
        let map = RegisterMap::from_ports(&model.ports()).unwrap();
        map.apply(&mut model, &[1, 2, 3, 4, 5]);
        assert_eq!(model.regs, vec![1, 2, 3, 4, 5]);

        let mut out = [0u8; 5];
        map.extract(&model, &mut out);
        assert_eq!(out, [5, 4, 3, 2, 1]);
    }

    #[test]
    fn shared_registers_round_trip() {
        let mut model = Loopback { regs: vec![0; 40] };
        let map = RegisterMap::from_ports(&PortLayout::sequential(
            (0..40).map(|i| format!("in_{i}")),
            (0..40).map(|i| format!("out_{i}")),
        ))
        .unwrap();
        let stimulus: Vec<u8> = (0..40u8).map(|b| b.wrapping_mul(37)).collect();
        map.apply(&mut model, &stimulus);
        let mut read_back = vec![0u8; 40];
        map.extract(&model, &mut read_back);
        assert_eq!(read_back, stimulus);
    }

    #[test]
    fn width_check_names_the_mismatch() {
        let map = RegisterMap::from_ports(&PortLayout::sequential(["a", "b"], ["c"])).unwrap();
        assert!(map.check_widths(2, 1).is_ok());
        let err = map.check_widths(3, 1).unwrap_err().to_string();
        assert!(err.contains("3 input bytes"), "{err}");
        let err = map.check_widths(2, 8).unwrap_err().to_string();
        assert!(err.contains("8 coverage bytes"), "{err}");
    }

    #[test]
    fn shared_input_register_is_rejected() {
        let port = |name: &str, handle| Port {
            name: name.to_string(),
            handle: RegisterHandle(handle),
        };
        let aliased = PortLayout {
            inputs: vec![port("a", 0), port("b", 0)],
            outputs: vec![port("c", 0), port("d", 1)],
        };
        let err = RegisterMap::from_ports(&aliased).unwrap_err().to_string();
        assert!(err.contains("input port b reuses register 0"), "{err}");

        let aliased = PortLayout {
            inputs: vec![port("a", 0), port("b", 1)],
            outputs: vec![port("c", 3), port("d", 3)],
        };
        let err = RegisterMap::from_ports(&aliased).unwrap_err().to_string();
        assert!(err.contains("output port d"), "{err}");

        // The same register may be both an input and an output.
        let looped = PortLayout {
            inputs: vec![port("a", 0)],
            outputs: vec![port("a_q", 0)],
        };
        assert!(RegisterMap::from_ports(&looped).is_ok());
    }
}

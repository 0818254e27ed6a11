//! The boundary between the driver and the simulated circuit.
//!
//! The driver treats a circuit as an opaque register-level device: it can drive
//! the clock and reset lines, write input registers, read output registers and
//! ask the model to settle its logic. Nothing else about the model is assumed.

/// Identifies one addressable register of a model.
///
/// Handles are handed out by the model through its [`PortLayout`]; the driver
/// never invents them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegisterHandle(pub usize);

/// Result of settling the model for the current line values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// Combinational and sequential logic settled normally.
    Settled,
    /// The model requested an immediate end of the whole run (`$finish`).
    Finished,
}

/// A single named port register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Port {
    pub name: String,
    pub handle: RegisterHandle,
}

/// Model metadata: the ordered input and output registers of a circuit.
///
/// Byte `i` of a stimulus unit maps to `inputs[i]`, byte `i` of a coverage
/// vector maps to `outputs[i]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortLayout {
    pub inputs: Vec<Port>,
    pub outputs: Vec<Port>,
}

impl PortLayout {
    /// Builds a layout whose handles are the positions of the names.
    pub fn sequential<I, O>(inputs: I, outputs: O) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
        O: IntoIterator,
        O::Item: Into<String>,
    {
        let number = |names: Vec<String>| -> Vec<Port> {
            names
                .into_iter()
                .enumerate()
                .map(|(index, name)| Port {
                    name,
                    handle: RegisterHandle(index),
                })
                .collect()
        };
        Self {
            inputs: number(inputs.into_iter().map(Into::into).collect()),
            outputs: number(outputs.into_iter().map(Into::into).collect()),
        }
    }

    pub fn input_width(&self) -> usize {
        self.inputs.len()
    }

    pub fn coverage_width(&self) -> usize {
        self.outputs.len()
    }
}

/// A clocked circuit model driven one half-cycle at a time.
///
/// Implementations are not expected to be safe for concurrent mutation;
/// exactly one driver owns a model at a time.
pub trait CircuitModel {
    /// Returns the register metadata of the model.
    fn ports(&self) -> PortLayout;

    fn set_clock(&mut self, high: bool);

    fn set_reset(&mut self, asserted: bool);

    fn set_input(&mut self, register: RegisterHandle, value: u8);

    fn output(&self, register: RegisterHandle) -> u8;

    /// Settles the model logic for the current line values.
    fn advance(&mut self) -> Advance;
}

impl<M: CircuitModel + ?Sized> CircuitModel for Box<M> {
    fn ports(&self) -> PortLayout {
        (**self).ports()
    }

    fn set_clock(&mut self, high: bool) {
        (**self).set_clock(high)
    }

    fn set_reset(&mut self, asserted: bool) {
        (**self).set_reset(asserted)
    }

    fn set_input(&mut self, register: RegisterHandle, value: u8) {
        (**self).set_input(register, value)
    }

    fn output(&self, register: RegisterHandle) -> u8 {
        (**self).output(register)
    }

    fn advance(&mut self) -> Advance {
        (**self).advance()
    }
}

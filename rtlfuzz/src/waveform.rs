//! Optional per-tick waveform recording.

use anyhow::Result;

/// Line and register values of the model at one tick.
#[derive(Debug, Clone, Copy)]
pub struct Sample<'a> {
    pub clock: bool,
    pub reset: bool,
    pub inputs: &'a [u8],
    pub outputs: &'a [u8],
}

/// Append-only, single-writer waveform log keyed by tick.
///
/// Ticks arrive strictly increasing: each half-cycle is sampled before the
/// tick advances, and the final settle samples the tick after the last step.
pub trait WaveformSink {
    fn sample(&mut self, tick: u64, sample: &Sample<'_>) -> Result<()>;

    /// Flushes and closes the underlying file. Later samples are dropped.
    fn close(&mut self) -> Result<()>;
}

#[cfg(feature = "trace")]
pub use vcd_sink::VcdSink;

#[cfg(feature = "trace")]
mod vcd_sink {
    use anyhow::{Context, Result};
    use std::cell::RefCell;
    use std::fs::File;
    use std::io::{self, BufWriter, Write};
    use std::path::Path;
    use std::rc::Rc;
    use vcd::{IdCode, TimescaleUnit, Value, Writer};

    use super::{Sample, WaveformSink};
    use crate::model::PortLayout;

    struct Wires {
        clock: IdCode,
        reset: IdCode,
        inputs: Vec<IdCode>,
        outputs: Vec<IdCode>,
    }

    /// Buffered trace file shared between the VCD writer and the sink, so the
    /// sink can flush it on close.
    #[derive(Clone)]
    struct TraceFile(Rc<RefCell<BufWriter<File>>>);

    impl Write for TraceFile {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            self.0.borrow_mut().flush()
        }
    }

    /// Writes samples to a Value Change Dump file.
    pub struct VcdSink {
        writer: Option<Writer<TraceFile>>,
        file: TraceFile,
        wires: Wires,
        last_tick: Option<u64>,
    }

    impl VcdSink {
        /// Creates the file and writes the header for every port of `ports`.
        pub fn create(path: &Path, module: &str, ports: &PortLayout) -> Result<Self> {
            let file = File::create(path)
                .with_context(|| format!("Unable to create waveform file {}", path.display()))?;
            let file = TraceFile(Rc::new(RefCell::new(BufWriter::new(file))));
            let mut writer = Writer::new(file.clone());
            writer.timescale(1, TimescaleUnit::NS)?;
            writer.add_module(module)?;
            let clock = writer.add_wire(1, "clock")?;
            let reset = writer.add_wire(1, "reset")?;
            let mut inputs = Vec::with_capacity(ports.inputs.len());
            for port in &ports.inputs {
                inputs.push(writer.add_wire(8, &port.name)?);
            }
            let mut outputs = Vec::with_capacity(ports.outputs.len());
            for port in &ports.outputs {
                outputs.push(writer.add_wire(8, &port.name)?);
            }
            writer.upscope()?;
            writer.enddefinitions()?;
            Ok(Self {
                writer: Some(writer),
                file,
                wires: Wires {
                    clock,
                    reset,
                    inputs,
                    outputs,
                },
                last_tick: None,
            })
        }
    }

    fn byte_bits(byte: u8) -> impl Iterator<Item = Value> {
        (0..8)
            .rev()
            .map(move |bit| Value::from((byte >> bit) & 1 == 1))
    }

    impl WaveformSink for VcdSink {
        fn sample(&mut self, tick: u64, sample: &Sample<'_>) -> Result<()> {
            let Some(writer) = self.writer.as_mut() else {
                return Ok(());
            };
            debug_assert!(
                self.last_tick.is_none_or(|last| tick > last),
                "waveform tick {tick} is not after {:?}",
                self.last_tick
            );
            self.last_tick = Some(tick);

            writer.timestamp(tick)?;
            writer.change_scalar(self.wires.clock, sample.clock)?;
            writer.change_scalar(self.wires.reset, sample.reset)?;
            for (&id, &byte) in self.wires.inputs.iter().zip(sample.inputs) {
                writer.change_vector(id, byte_bits(byte))?;
            }
            for (&id, &byte) in self.wires.outputs.iter().zip(sample.outputs) {
                writer.change_vector(id, byte_bits(byte))?;
            }
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            if self.writer.take().is_some() {
                self.file.flush().context("Unable to flush waveform file")?;
            }
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::model::PortLayout;

        #[test]
        fn writes_header_and_one_timestamp_per_tick() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("dump.vcd");
            let ports = PortLayout::sequential(["io_input_bytes_0"], ["io_coverage_bytes_0"]);
            let mut sink = VcdSink::create(&path, "harness", &ports).unwrap();

            let sample = Sample {
                clock: false,
                reset: true,
                inputs: &[0xA5],
                outputs: &[0x01],
            };
            sink.sample(0, &sample).unwrap();
            sink.sample(1, &Sample { clock: true, ..sample }).unwrap();
            sink.close().unwrap();
            // Closed sinks swallow samples.
            sink.sample(2, &sample).unwrap();

            let text = std::fs::read_to_string(&path).unwrap();
            assert!(text.contains("$enddefinitions"));
            assert!(text.contains("io_input_bytes_0"));
            assert!(text.contains("b10100101"));
            assert_eq!(text.matches("\n#1").count(), 1);
            assert!(!text.contains("#2"));
        }
    }
}

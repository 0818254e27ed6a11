//! Constants shared by the driver and its queue backends.

/// Header word of a test batch sent by the fuzzing server.
pub const TEST_INPUT_MAGIC: u32 = 0x1993_1993;

/// Header word of a coverage reply sent back to the fuzzing server.
pub const COVERAGE_OUTPUT_MAGIC: u32 = 0x7353_7353;

/// Length of both batch headers: magic, buffer id, test count, three u16 fields.
pub const BATCH_HEADER_LEN: usize = 16;

pub const DEFAULT_RX_FIFO: &str = "/tmp/fpga/0/rx.fifo";
pub const DEFAULT_TX_FIFO: &str = "/tmp/fpga/0/tx.fifo";

/// Size of each shared segment the fuzzing server allocates.
pub const DEFAULT_SEGMENT_SIZE: usize = 64 * 1024 * 16;

pub const DEFAULT_WAVEFORM_PATH: &str = "dump.vcd";

pub const DEFAULT_QUEUE_DIR: &str = "queue";

/// Upper bound on stimulus units per engine-generated test case.
pub const DEFAULT_MAX_CYCLES: usize = 64;

/// File the engine writes the in-flight test case to.
pub const CUR_INPUT_FILE: &str = ".cur_input";

/// Executions between two engine progress reports.
pub const STATS_INTERVAL: u64 = 10_000;

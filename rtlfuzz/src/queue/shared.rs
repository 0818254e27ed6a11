//! Cross-process queue served by an external fuzzing server.
//!
//! The server writes each test batch into a SysV shared-memory segment and
//! announces it on the rx pipe with a pair of native-endian u32 segment ids:
//! the segment holding the batch, then the segment that receives the
//! coverage reply. Once every test of the batch has run, the driver writes
//! the reply into the second segment and echoes the same id pair on the tx
//! pipe.
//!
//! Segment contents are big-endian.
//!
//! Test batch:
//!
//! ```text
//! u32 magic (0x19931993) | u32 buffer id | u16 tests | u16 reserved x3
//! then per test: u64 inputs | inputs x input-width bytes
//! ```
//!
//! Coverage reply:
//!
//! ```text
//! u32 magic (0x73537353) | u32 buffer id | u16 tests | u16 coverage width | u16 reserved x2
//! then tests x coverage-width bytes
//! ```
//!
//! The server ends the session by closing the rx pipe between batches.

use anyhow::{Context, Result, anyhow, bail, ensure};
use libafl_bolts::shmem::{ShMemId, ShMemProvider, UnixShMemProvider};
use slog::{Logger, debug, info, o};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::ops::DerefMut;
use std::path::Path;

use super::FuzzQueue;
use crate::constants::{BATCH_HEADER_LEN, COVERAGE_OUTPUT_MAGIC, TEST_INPUT_MAGIC};

/// Length of the segment id pair exchanged on the pipes.
const SEGMENT_IDS_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchHeader {
    pub buffer_id: u32,
    pub tests: u16,
}

impl BatchHeader {
    fn parse(raw: &[u8]) -> Result<Self> {
        let magic = u32::from_be_bytes(raw[0..4].try_into()?);
        if magic != TEST_INPUT_MAGIC {
            bail!("Bad test batch magic {magic:#010x}, expected {TEST_INPUT_MAGIC:#010x}");
        }
        Ok(Self {
            buffer_id: u32::from_be_bytes(raw[4..8].try_into()?),
            tests: u16::from_be_bytes(raw[8..10].try_into()?),
        })
    }

    /// Encodes a test batch header, as the server side writes it.
    pub fn encode(&self) -> [u8; BATCH_HEADER_LEN] {
        let mut raw = [0u8; BATCH_HEADER_LEN];
        raw[0..4].copy_from_slice(&TEST_INPUT_MAGIC.to_be_bytes());
        raw[4..8].copy_from_slice(&self.buffer_id.to_be_bytes());
        raw[8..10].copy_from_slice(&self.tests.to_be_bytes());
        raw
    }
}

/// The segment pair announcing one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentIds {
    pub test_in: u32,
    pub coverage_out: u32,
}

impl SegmentIds {
    fn parse(raw: &[u8; SEGMENT_IDS_LEN]) -> Self {
        Self {
            test_in: u32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]),
            coverage_out: u32::from_ne_bytes([raw[4], raw[5], raw[6], raw[7]]),
        }
    }

    pub fn encode(&self) -> [u8; SEGMENT_IDS_LEN] {
        let mut raw = [0u8; SEGMENT_IDS_LEN];
        raw[0..4].copy_from_slice(&self.test_in.to_ne_bytes());
        raw[4..8].copy_from_slice(&self.coverage_out.to_ne_bytes());
        raw
    }
}

/// Attaches shared segments created by the fuzzing server.
pub trait SegmentProvider {
    type Segment: DerefMut<Target = [u8]>;

    fn attach(&mut self, id: u32) -> Result<Self::Segment>;
}

/// SysV shared memory, attached by segment id.
pub struct SysvSegments {
    provider: UnixShMemProvider,
    size: usize,
}

impl SysvSegments {
    /// `size` is the length of every segment the server allocates.
    pub fn new(size: usize) -> Result<Self> {
        let provider = UnixShMemProvider::new()
            .map_err(|e| anyhow!("Unable to set up shared memory: {e}"))?;
        Ok(Self { provider, size })
    }
}

impl SegmentProvider for SysvSegments {
    type Segment = <UnixShMemProvider as ShMemProvider>::ShMem;

    fn attach(&mut self, id: u32) -> Result<Self::Segment> {
        let raw = i32::try_from(id).with_context(|| format!("Invalid segment id {id}"))?;
        self.provider
            .shmem_from_id_and_size(ShMemId::from_int(raw), self.size)
            .map_err(|e| anyhow!("Unable to attach shared segment {id}: {e}"))
    }
}

fn read_at(segment: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    segment.get(offset..offset + len).with_context(|| {
        format!(
            "Test batch overruns its {}-byte segment at offset {offset}",
            segment.len()
        )
    })
}

struct Batch {
    ids: SegmentIds,
    header: BatchHeader,
    tests_left: u16,
    /// Read offset into the test segment.
    cursor: usize,
    /// Stimulus units left in the current test, once its count was read.
    inputs_left: Option<u64>,
    coverage: Vec<u8>,
}

pub struct SharedQueue<R, W, P: SegmentProvider> {
    rx: R,
    tx: W,
    segments: P,
    /// Segments stay attached for the whole session; servers reuse them.
    attached: HashMap<u32, P::Segment>,
    input_width: usize,
    coverage_width: usize,
    batch: Option<Batch>,
    closed: bool,
    log: Logger,
}

impl SharedQueue<BufReader<File>, BufWriter<File>, SysvSegments> {
    /// Opens the named pipes of a running fuzzing server.
    ///
    /// `tx` is opened first: the server opens it for reading before it opens
    /// `rx` for writing, and opening a FIFO blocks until both ends exist.
    pub fn open_pipes(
        rx: &Path,
        tx: &Path,
        segment_size: usize,
        input_width: usize,
        log: &Logger,
    ) -> Result<Self> {
        let tx_file = OpenOptions::new()
            .write(true)
            .open(tx)
            .with_context(|| format!("Unable to open {}; is the fuzzing server running?", tx.display()))?;
        let rx_file = File::open(rx)
            .with_context(|| format!("Unable to open {}; is the fuzzing server running?", rx.display()))?;
        Ok(Self::new(
            BufReader::new(rx_file),
            BufWriter::new(tx_file),
            SysvSegments::new(segment_size)?,
            input_width,
            log,
        ))
    }
}

impl<R: Read, W: Write, P: SegmentProvider> SharedQueue<R, W, P> {
    pub fn new(rx: R, tx: W, segments: P, input_width: usize, log: &Logger) -> Self {
        Self {
            rx,
            tx,
            segments,
            attached: HashMap::new(),
            input_width,
            coverage_width: 0,
            batch: None,
            closed: false,
            log: log.new(o!("component" => "shared_queue")),
        }
    }

    pub fn into_inner(self) -> (R, W) {
        (self.rx, self.tx)
    }

    /// Contents of an attached segment.
    pub fn segment(&self, id: u32) -> Option<&[u8]> {
        self.attached.get(&id).map(|segment| &**segment)
    }

    fn attach(&mut self, id: u32) -> Result<&mut [u8]> {
        let segment = match self.attached.entry(id) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let segment = self.segments.attach(id)?;
                debug!(self.log, "Attached segment"; "id" => id, "len" => segment.len());
                entry.insert(segment)
            }
        };
        Ok(&mut **segment)
    }

    /// Reads the next segment id pair; `None` if the server closed the pipe.
    fn read_ids(&mut self) -> Result<Option<SegmentIds>> {
        let mut raw = [0u8; SEGMENT_IDS_LEN];
        let mut filled = 0;
        while filled < raw.len() {
            match self.rx.read(&mut raw[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => bail!("Segment ids truncated after {filled} bytes"),
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e).context("Unable to read segment ids"),
            }
        }
        Ok(Some(SegmentIds::parse(&raw)))
    }

    fn send_reply(&mut self, batch: &Batch) -> Result<()> {
        let mut header = [0u8; BATCH_HEADER_LEN];
        header[0..4].copy_from_slice(&COVERAGE_OUTPUT_MAGIC.to_be_bytes());
        header[4..8].copy_from_slice(&batch.header.buffer_id.to_be_bytes());
        header[8..10].copy_from_slice(&batch.header.tests.to_be_bytes());
        header[10..12].copy_from_slice(&(self.coverage_width as u16).to_be_bytes());

        let segment = self.attach(batch.ids.coverage_out)?;
        let end = BATCH_HEADER_LEN + batch.coverage.len();
        ensure!(
            end <= segment.len(),
            "Coverage reply of {end} bytes does not fit its {}-byte segment",
            segment.len()
        );
        segment[..BATCH_HEADER_LEN].copy_from_slice(&header);
        segment[BATCH_HEADER_LEN..end].copy_from_slice(&batch.coverage);

        self.tx.write_all(&batch.ids.encode())?;
        self.tx.flush().context("Unable to send coverage reply")?;
        debug!(self.log, "Sent coverage"; "buffer_id" => batch.header.buffer_id, "tests" => batch.header.tests);
        Ok(())
    }
}

impl<R: Read, W: Write, P: SegmentProvider> FuzzQueue for SharedQueue<R, W, P> {
    fn init(&mut self, coverage_width: usize) -> Result<()> {
        if coverage_width > usize::from(u16::MAX) {
            bail!("Coverage width {coverage_width} does not fit the reply header");
        }
        self.coverage_width = coverage_width;
        Ok(())
    }

    fn done(&mut self) -> Result<bool> {
        loop {
            if self.closed {
                return Ok(true);
            }
            if self.batch.as_ref().is_some_and(|b| b.tests_left > 0) {
                return Ok(false);
            }
            let Some(ids) = self.read_ids()? else {
                info!(self.log, "Fuzzing server closed the queue");
                self.closed = true;
                continue;
            };
            let header = BatchHeader::parse(read_at(self.attach(ids.test_in)?, 0, BATCH_HEADER_LEN)?)?;
            debug!(self.log, "Received test batch";
                "buffer_id" => header.buffer_id,
                "tests" => header.tests,
                "segment" => ids.test_in);
            let batch = Batch {
                ids,
                header,
                tests_left: header.tests,
                cursor: BATCH_HEADER_LEN,
                inputs_left: None,
                coverage: Vec::with_capacity(usize::from(header.tests) * self.coverage_width),
            };
            if header.tests == 0 {
                self.send_reply(&batch)?;
            } else {
                self.batch = Some(batch);
            }
        }
    }

    fn pop(&mut self, input: &mut [u8]) -> Result<bool> {
        debug_assert_eq!(input.len(), self.input_width);
        let Some(batch) = self.batch.as_mut() else {
            bail!("pop outside of a test batch");
        };
        let Some(segment) = self.attached.get(&batch.ids.test_in) else {
            bail!("test segment {} is not attached", batch.ids.test_in);
        };
        let left = match batch.inputs_left {
            Some(left) => left,
            None => {
                let raw = read_at(segment, batch.cursor, 8)?;
                batch.cursor += 8;
                u64::from_be_bytes(raw.try_into()?)
            }
        };
        if left == 0 {
            batch.inputs_left = Some(0);
            return Ok(false);
        }
        input.copy_from_slice(read_at(segment, batch.cursor, input.len())?);
        batch.cursor += input.len();
        batch.inputs_left = Some(left - 1);
        Ok(true)
    }

    fn push(&mut self, coverage: &[u8]) -> Result<()> {
        let Some(mut batch) = self.batch.take() else {
            bail!("push outside of a test batch");
        };
        batch.coverage.extend_from_slice(coverage);
        batch.tests_left -= 1;
        batch.inputs_left = None;
        if batch.tests_left == 0 {
            // Reply right away so the server is not kept waiting on the next
            // `done` poll.
            self.send_reply(&batch)?;
        } else {
            self.batch = Some(batch);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging;
    use crate::test_utils::{MemorySegments, test_batch};
    use assert_matches::assert_matches;
    use std::io::Cursor;

    fn announce(pairs: &[(u32, u32)]) -> Cursor<Vec<u8>> {
        let mut rx = Vec::new();
        for &(test_in, coverage_out) in pairs {
            rx.extend(SegmentIds { test_in, coverage_out }.encode());
        }
        Cursor::new(rx)
    }

    type TestQueue = SharedQueue<Cursor<Vec<u8>>, Vec<u8>, MemorySegments>;

    fn queue(rx: Cursor<Vec<u8>>, segments: MemorySegments, input_width: usize) -> TestQueue {
        SharedQueue::new(rx, Vec::new(), segments, input_width, &logging::discard())
    }

    #[test]
    fn serves_a_batch_and_replies_once() {
        let segments = MemorySegments::default()
            .with(1, test_batch(9, &[&[&[1, 2], &[3, 4]], &[]]))
            .with(2, vec![0; 32]);
        let mut queue = queue(announce(&[(1, 2)]), segments, 2);
        queue.init(1).unwrap();

        assert!(!queue.done().unwrap());
        let mut unit = [0u8; 2];
        assert!(queue.pop(&mut unit).unwrap());
        assert_eq!(unit, [1, 2]);
        assert!(queue.pop(&mut unit).unwrap());
        assert_eq!(unit, [3, 4]);
        assert!(!queue.pop(&mut unit).unwrap());
        queue.push(&[0xAA]).unwrap();

        assert!(!queue.done().unwrap());
        assert!(!queue.pop(&mut unit).unwrap());
        queue.push(&[0xBB]).unwrap();

        let reply = queue.segment(2).unwrap().to_vec();
        assert_eq!(&reply[0..4], &COVERAGE_OUTPUT_MAGIC.to_be_bytes());
        assert_eq!(&reply[4..8], &9u32.to_be_bytes());
        assert_eq!(&reply[8..10], &2u16.to_be_bytes());
        assert_eq!(&reply[10..12], &1u16.to_be_bytes());
        assert_eq!(&reply[BATCH_HEADER_LEN..BATCH_HEADER_LEN + 2], &[0xAA, 0xBB]);

        assert!(queue.done().unwrap());
        let (_, tx) = queue.into_inner();
        assert_eq!(tx, SegmentIds { test_in: 1, coverage_out: 2 }.encode());
    }

    #[test]
    fn ids_are_native_endian_pairs() {
        let ids = SegmentIds {
            test_in: 0x0102_0304,
            coverage_out: 7,
        };
        let raw = ids.encode();
        assert_eq!(&raw[0..4], &0x0102_0304u32.to_ne_bytes());
        assert_eq!(SegmentIds::parse(&raw), ids);
    }

    #[test]
    fn empty_batch_is_answered_immediately() {
        let segments = MemorySegments::default()
            .with(1, test_batch(5, &[]))
            .with(2, vec![0; 16])
            .with(3, test_batch(6, &[&[&[7]]]));
        let mut queue = queue(announce(&[(1, 2), (3, 2)]), segments, 1);
        queue.init(2).unwrap();
        assert!(!queue.done().unwrap());
        assert_eq!(&queue.segment(2).unwrap()[4..8], &5u32.to_be_bytes());
        let (_, tx) = queue.into_inner();
        assert_eq!(tx, SegmentIds { test_in: 1, coverage_out: 2 }.encode());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut batch = test_batch(1, &[]);
        batch[0] ^= 0xFF;
        let segments = MemorySegments::default().with(1, batch).with(2, vec![0; 16]);
        let mut queue = queue(announce(&[(1, 2)]), segments, 1);
        queue.init(1).unwrap();
        let err = queue.done().unwrap_err();
        assert!(err.to_string().contains("magic"), "{err}");
    }

    #[test]
    fn unknown_segment_is_an_error() {
        let mut queue = queue(announce(&[(4, 5)]), MemorySegments::default(), 1);
        queue.init(1).unwrap();
        assert_matches!(queue.done(), Err(_));
    }

    #[test]
    fn truncated_ids_are_an_error() {
        let mut rx = announce(&[(1, 2)]).into_inner();
        rx.truncate(5);
        let mut queue = queue(Cursor::new(rx), MemorySegments::default(), 1);
        queue.init(1).unwrap();
        assert_matches!(queue.done(), Err(_));
    }

    #[test]
    fn overrunning_the_segment_is_an_error() {
        let mut batch = test_batch(1, &[&[&[1], &[2]]]);
        // Claims two inputs, carries one.
        batch.pop();
        let segments = MemorySegments::default().with(1, batch).with(2, vec![0; 32]);
        let mut queue = queue(announce(&[(1, 2)]), segments, 1);
        queue.init(1).unwrap();
        assert!(!queue.done().unwrap());
        let mut unit = [0u8; 1];
        assert!(queue.pop(&mut unit).unwrap());
        let err = queue.pop(&mut unit).unwrap_err();
        assert!(err.to_string().contains("overruns"), "{err}");
    }

    #[test]
    fn reply_must_fit_the_coverage_segment() {
        let segments = MemorySegments::default()
            .with(1, test_batch(1, &[&[]]))
            .with(2, vec![0; BATCH_HEADER_LEN + 3]);
        let mut queue = queue(announce(&[(1, 2)]), segments, 1);
        queue.init(4).unwrap();
        assert!(!queue.done().unwrap());
        assert!(!queue.pop(&mut [0u8; 1]).unwrap());
        assert_matches!(queue.push(&[1, 2, 3, 4]), Err(_));
    }

    #[test]
    fn closed_pipe_means_done() {
        let mut queue = queue(Cursor::new(Vec::new()), MemorySegments::default(), 1);
        queue.init(1).unwrap();
        assert_matches!(queue.done(), Ok(true));
        assert_matches!(queue.done(), Ok(true));
    }
}

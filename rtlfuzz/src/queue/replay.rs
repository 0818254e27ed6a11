//! Single-case queue that replays a recorded stimulus.

use anyhow::Result;

use super::FuzzQueue;

/// Serves one test case from a byte buffer and keeps the coverage it yields.
///
/// A trailing partial unit is ignored, the same way the engine treats it.
#[derive(Debug, Clone)]
pub struct ReplayQueue {
    stimulus: Vec<u8>,
    cursor: usize,
    coverage: Option<Vec<u8>>,
}

impl ReplayQueue {
    pub fn new(stimulus: Vec<u8>) -> Self {
        Self {
            stimulus,
            cursor: 0,
            coverage: None,
        }
    }

    /// Coverage vector of the replayed case, once it ran.
    pub fn coverage(&self) -> Option<&[u8]> {
        self.coverage.as_deref()
    }
}

impl FuzzQueue for ReplayQueue {
    fn init(&mut self, _coverage_width: usize) -> Result<()> {
        Ok(())
    }

    fn done(&mut self) -> Result<bool> {
        Ok(self.coverage.is_some())
    }

    fn pop(&mut self, input: &mut [u8]) -> Result<bool> {
        let end = self.cursor + input.len();
        if end > self.stimulus.len() {
            return Ok(false);
        }
        input.copy_from_slice(&self.stimulus[self.cursor..end]);
        self.cursor = end;
        Ok(true)
    }

    fn push(&mut self, coverage: &[u8]) -> Result<()> {
        self.coverage = Some(coverage.to_vec());
        Ok(())
    }
}

//! Configuration files.
//!
//! Two TOML documents describe a run:
//!
//! * the harness description, generated by the instrumentation pass that
//!   inserted coverage points into the circuit (and possibly edited by hand);
//! * the driver configuration, which points at the harness description and
//!   selects the queue backend.

use anyhow::{Context, Result, bail, ensure};
use chrono::{DateTime, FixedOffset};
use serde::Deserialize;
use slog::{Logger, info};
use std::fs;
use std::path::{Path, PathBuf};

use crate::constants::{
    DEFAULT_MAX_CYCLES, DEFAULT_QUEUE_DIR, DEFAULT_RX_FIFO, DEFAULT_SEGMENT_SIZE, DEFAULT_TX_FIFO,
};

/// Bytes allocated per cycle of stimulus and for the coverage vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestSize {
    pub input: usize,
    pub coverage: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct General {
    pub filename: String,
    pub instrumented: String,
    pub module: String,
    pub timestamp: toml::value::Datetime,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoveragePoint {
    pub name: String,
    pub inverted: bool,
    pub index: u32,
    pub counterbits: u32,
    pub filename: String,
    pub line: u32,
    pub column: u32,
    pub human: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InputField {
    pub name: String,
    pub width: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct HarnessData {
    general: General,
    coverage: Vec<CoveragePoint>,
    input: Vec<InputField>,
}

/// The instrumented circuit: its input fields and coverage points.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    size: TestSize,
    data: HarnessData,
}

/// Whether each coverage point was observed true, false, or both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointCoverage {
    pub name: String,
    pub human: String,
    pub covered_true: bool,
    pub covered_false: bool,
}

impl PointCoverage {
    pub fn covered(&self) -> bool {
        self.covered_true && self.covered_false
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverageReport {
    pub points: Vec<PointCoverage>,
}

impl CoverageReport {
    pub fn covered(&self) -> usize {
        self.points.iter().filter(|p| p.covered()).count()
    }
}

impl HarnessConfig {
    pub fn from_file(word_size: usize, path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Unable to read harness description {}", path.display()))?;
        Self::parse(word_size, &contents)
            .with_context(|| format!("Invalid harness description {}", path.display()))
    }

    pub fn parse(word_size: usize, contents: &str) -> Result<Self> {
        ensure!(word_size > 0, "word size must be at least one byte");
        let data: HarnessData = toml::from_str(contents)?;
        let size = Self::determine_test_size(word_size, &data);
        let config = Self { size, data };
        config.validate()?;
        Ok(config)
    }

    /// Rounds bit counts up to whole bytes, then up to whole words.
    fn determine_test_size(word_size: usize, data: &HarnessData) -> TestSize {
        let to_bytes = |bits: usize| bits.div_ceil(8).div_ceil(word_size) * word_size;
        TestSize {
            input: to_bytes(data.input_bits()),
            coverage: to_bytes(data.coverage_bits()),
        }
    }

    fn validate(&self) -> Result<()> {
        if let Some(point) = self.data.coverage.iter().find(|c| c.counterbits != 1) {
            bail!(
                "coverage point {} uses {}-bit counters, only 1-bit counters are supported",
                point.name,
                point.counterbits
            );
        }

        // Each coverage point is followed by its inverted twin.
        for pair in self.data.coverage.chunks(2) {
            let [plain, inverted] = pair else {
                bail!("coverage point {} has no inverted version", pair[0].name);
            };
            ensure!(
                !plain.inverted,
                "coverage point {} is inverted but not preceded by its plain version",
                plain.name
            );
            ensure!(
                inverted.inverted && inverted.name == plain.name,
                "coverage point {} is not followed by its inverted version",
                plain.name
            );
        }

        for point in &self.data.coverage {
            ensure!(
                (point.index as usize) < self.size.coverage * 8,
                "coverage point {} has index {} outside the coverage vector",
                point.name,
                point.index
            );
        }
        Ok(())
    }

    pub fn test_size(&self) -> TestSize {
        self.size
    }

    pub fn module(&self) -> &str {
        &self.data.general.module
    }

    pub fn inputs(&self) -> &[InputField] {
        &self.data.input
    }

    pub fn coverage_signal_count(&self) -> usize {
        self.data.coverage.len() / 2
    }

    pub fn log_header(&self, log: &Logger) {
        let timestamp = self.data.general.timestamp.to_string();
        let instrumented = DateTime::<FixedOffset>::parse_from_rfc3339(&timestamp)
            .map(|t| t.to_rfc2822())
            .unwrap_or(timestamp);
        info!(log, "Fuzzing {}", self.data.general.module;
            "source" => &self.data.general.filename,
            "instrumented" => &self.data.general.instrumented,
            "instrumented_on" => instrumented,
            "coverage_signals" => self.coverage_signal_count(),
            "input_fields" => self.data.input.len(),
            "input_bits" => self.data.input_bits(),
            "input_bytes" => self.size.input,
            "coverage_bytes" => self.size.coverage);
    }

    /// Splits a stimulus into cycles and decodes every input field.
    ///
    /// Returns one row per cycle with one bit string per `[[input]]` field.
    /// Fields are packed back to back starting at the MSB of each cycle's
    /// first byte, and each bit string reads MSB first.
    pub fn input_report(&self, stimulus: &[u8]) -> Result<Vec<Vec<String>>> {
        let unit = self.size.input;
        ensure!(
            unit > 0 && stimulus.len() % unit == 0,
            "stimulus of {} bytes is not a whole number of {unit}-byte cycles",
            stimulus.len()
        );
        let rows: Vec<Vec<String>> = stimulus
            .chunks(unit)
            .map(|cycle| {
                let mut bit = 0;
                self.data
                    .input
                    .iter()
                    .map(|field| {
                        (0..field.width)
                            .map(|_| {
                                let set = cycle[bit / 8] & (0x80 >> (bit % 8)) != 0;
                                bit += 1;
                                if set { '1' } else { '0' }
                            })
                            .collect::<String>()
                    })
                    .collect()
            })
            .collect();
        Ok(rows)
    }

    /// Decodes a coverage vector into per-point results.
    ///
    /// Bits are numbered from the MSB of byte 0. If `inverted` is set, a 0
    /// bit means covered.
    pub fn coverage_report(&self, coverage: &[u8], inverted: bool) -> Result<CoverageReport> {
        ensure!(
            coverage.len() == self.size.coverage,
            "coverage vector has {} bytes, expected {}",
            coverage.len(),
            self.size.coverage
        );
        let bit = |index: usize| {
            let byte = coverage[index / 8];
            let byte = if inverted { !byte } else { byte };
            (byte >> (7 - index % 8)) & 1 == 1
        };
        let points = self
            .data
            .coverage
            .chunks(2)
            .map(|pair| {
                let plain = &pair[0];
                let twin = &pair[1];
                PointCoverage {
                    name: plain.name.clone(),
                    human: plain.human.clone(),
                    covered_true: bit(plain.index as usize),
                    covered_false: bit(twin.index as usize),
                }
            })
            .collect();
        Ok(CoverageReport { points })
    }
}

impl HarnessData {
    fn input_bits(&self) -> usize {
        self.input.iter().map(|i| i.width as usize).sum()
    }

    fn coverage_bits(&self) -> usize {
        self.coverage.iter().map(|c| c.counterbits as usize).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// Seed inputs, one test case per file.
    pub corpus_dir: Option<PathBuf>,
    /// Where inputs with new coverage are written.
    pub queue_dir: PathBuf,
    pub max_executions: Option<u64>,
    pub time_budget_secs: Option<u64>,
    /// Upper bound on stimulus units per test case.
    pub max_cycles: usize,
    pub seed: Option<u64>,
    pub handle_ctrlc: bool,
    /// Write each case to the queue dir before running it.
    pub record_cur_input: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            corpus_dir: None,
            queue_dir: PathBuf::from(DEFAULT_QUEUE_DIR),
            max_executions: None,
            time_budget_secs: None,
            max_cycles: DEFAULT_MAX_CYCLES,
            seed: None,
            handle_ctrlc: false,
            record_cur_input: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SharedOptions {
    /// Test batches from the fuzzing server.
    pub rx: PathBuf,
    /// Coverage replies to the fuzzing server.
    pub tx: PathBuf,
    /// Length of the server's shared segments.
    pub segment_size: usize,
}

impl Default for SharedOptions {
    fn default() -> Self {
        Self {
            rx: PathBuf::from(DEFAULT_RX_FIFO),
            tx: PathBuf::from(DEFAULT_TX_FIFO),
            segment_size: DEFAULT_SEGMENT_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum QueueConfig {
    Engine(EngineOptions),
    Shared(SharedOptions),
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::Engine(EngineOptions::default())
    }
}

fn default_word_size() -> usize {
    1
}

/// Top-level driver configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DriverConfig {
    /// Harness description. All relative paths resolve against the directory
    /// of the configuration file.
    pub harness: PathBuf,
    #[serde(default = "default_word_size")]
    pub word_size: usize,
    /// Waveform output; only honoured when built with the `trace` feature.
    #[serde(default)]
    pub waveform: Option<PathBuf>,
    #[serde(default)]
    pub queue: QueueConfig,
}

impl DriverConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Unable to read driver config {}", path.display()))?;
        let mut config: Self = toml::from_str(&contents)
            .with_context(|| format!("Invalid driver config {}", path.display()))?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        Ok(config)
    }

    /// Makes every relative path of the configuration relative to `base`.
    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |path: &mut PathBuf| *path = base.join(&*path);
        resolve(&mut self.harness);
        if let Some(waveform) = self.waveform.as_mut() {
            resolve(waveform);
        }
        match &mut self.queue {
            QueueConfig::Engine(options) => {
                if let Some(corpus_dir) = options.corpus_dir.as_mut() {
                    resolve(corpus_dir);
                }
                resolve(&mut options.queue_dir);
            }
            QueueConfig::Shared(options) => {
                resolve(&mut options.rx);
                resolve(&mut options.tx);
            }
        }
    }

    pub fn load_harness(&self) -> Result<HarnessConfig> {
        HarnessConfig::from_file(self.word_size, &self.harness)
    }
}

//! In-process mutation engine.
//!
//! Keeps a `libafl` corpus of whole test cases (concatenated stimulus units),
//! mutates the next seed with havoc mutations for every case and keeps inputs
//! whose coverage vector sets bits never seen before.

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use libafl::corpus::{Corpus, CorpusId, InMemoryCorpus, InMemoryOnDiskCorpus, Testcase};
use libafl::feedbacks::CrashFeedback;
use libafl::inputs::BytesInput;
use libafl::mutators::{HavocMutationsType, HavocScheduledMutator, Mutator, havoc_mutations};
use libafl::state::{HasCorpus, HasMaxSize, HasRand, StdState};
use libafl_bolts::current_nanos;
use libafl_bolts::rands::{Rand, StdRand};
use once_cell::sync::OnceCell;
use slog::{Logger, debug, info, o};
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use super::FuzzQueue;
use crate::config::EngineOptions;
use crate::constants::{CUR_INPUT_FILE, STATS_INTERVAL};

type EngineState = StdState<
    InMemoryOnDiskCorpus<BytesInput>,
    BytesInput,
    StdRand,
    InMemoryCorpus<BytesInput>,
>;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);
static CTRLC_HANDLER: OnceCell<()> = OnceCell::new();

fn install_ctrlc_handler() -> Result<()> {
    CTRLC_HANDLER
        .get_or_try_init(|| {
            ctrlc::set_handler(|| SHUTDOWN.store(true, Ordering::SeqCst))
                .context("Unable to install the Ctrl-C handler")
        })
        .map(|_| ())
}

fn afl(e: libafl::Error) -> anyhow::Error {
    anyhow!("libafl: {e}")
}

/// The test case currently being served.
struct Case {
    stimulus: Vec<u8>,
    cursor: usize,
}

pub struct EngineQueue {
    options: EngineOptions,
    input_width: usize,
    state: EngineState,
    mutator: HavocScheduledMutator<HavocMutationsType>,
    /// Union of every coverage vector seen so far.
    seen: Vec<u8>,
    case: Option<Case>,
    next_seed: usize,
    executions: u64,
    started: Instant,
    log: Logger,
}

impl EngineQueue {
    pub fn new(options: EngineOptions, input_width: usize, log: &Logger) -> Result<Self> {
        let log = log.new(o!("component" => "engine"));
        if options.handle_ctrlc {
            install_ctrlc_handler()?;
        }

        let mut feedback = CrashFeedback::new();
        let mut objective = CrashFeedback::new();
        let mut state = StdState::new(
            StdRand::with_seed(options.seed.unwrap_or_else(current_nanos)),
            InMemoryOnDiskCorpus::no_meta(options.queue_dir.clone()).map_err(afl)?,
            InMemoryCorpus::new(),
            &mut feedback,
            &mut objective,
        )
        .map_err(afl)?;
        state.set_max_size(options.max_cycles.max(1) * input_width);

        let mut engine = Self {
            options,
            input_width,
            state,
            mutator: HavocScheduledMutator::new(havoc_mutations()),
            seen: Vec::new(),
            case: None,
            next_seed: 0,
            executions: 0,
            started: Instant::now(),
            log,
        };
        engine.load_seeds()?;
        Ok(engine)
    }

    pub fn executions(&self) -> u64 {
        self.executions
    }

    pub fn corpus_size(&self) -> usize {
        self.state.corpus().count()
    }

    /// Number of coverage bits hit by at least one case.
    pub fn covered_bits(&self) -> u32 {
        self.seen.iter().map(|b| b.count_ones()).sum()
    }

    fn load_seeds(&mut self) -> Result<()> {
        if let Some(dir) = self.options.corpus_dir.clone() {
            if dir.is_dir() {
                let paths = fs::read_dir(&dir)
                    .with_context(|| format!("Unable to read corpus dir {}", dir.display()))?;
                for path in paths {
                    let path = path?.path();
                    if !path.is_file() {
                        continue;
                    }
                    let bytes = fs::read(&path)
                        .with_context(|| format!("Unable to read seed {}", path.display()))?;
                    self.add_to_corpus(bytes)?;
                }
            }
        }

        if self.corpus_size() == 0 {
            let seed = self.random_stimulus();
            self.add_to_corpus(seed)?;
        }
        info!(self.log, "Loaded seeds"; "corpus" => self.corpus_size());
        Ok(())
    }

    fn add_to_corpus(&mut self, stimulus: Vec<u8>) -> Result<CorpusId> {
        self.state
            .corpus_mut()
            .add(Testcase::new(BytesInput::new(stimulus)))
            .map_err(afl)
    }

    fn random_stimulus(&mut self) -> Vec<u8> {
        let rand = self.state.rand_mut();
        let cycles = rand.between(1, self.options.max_cycles.max(1));
        let mut stimulus = vec![0u8; cycles * self.input_width];
        for chunk in stimulus.chunks_mut(8) {
            let word = rand.next().to_le_bytes();
            chunk.copy_from_slice(&word[..chunk.len()]);
        }
        stimulus
    }

    /// Picks the next seed round-robin and mutates it into a fresh case.
    fn start_case(&mut self) -> Result<()> {
        let count = self.corpus_size();
        let id = self.state.corpus().nth(self.next_seed % count);
        self.next_seed = self.next_seed.wrapping_add(1);

        let mut input = self.state.corpus().cloned_input_for_id(id).map_err(afl)?;
        self.mutator
            .mutate(&mut self.state, &mut input)
            .map_err(afl)?;
        let stimulus: Vec<u8> = input.into();

        if self.options.record_cur_input {
            // Survives an early model finish, which ends the process mid-case.
            fs::write(self.options.queue_dir.join(CUR_INPUT_FILE), &stimulus)
                .context("Unable to record the in-flight input")?;
        }
        self.case = Some(Case {
            stimulus,
            cursor: 0,
        });
        Ok(())
    }

    fn is_novel(&self, coverage: &[u8]) -> bool {
        coverage
            .iter()
            .zip(&self.seen)
            .any(|(&hit, &seen)| hit & !seen != 0)
    }

    fn report(&self) {
        info!(self.log, "Fuzzing";
            "executions" => self.executions,
            "corpus" => self.corpus_size(),
            "covered_bits" => self.covered_bits(),
            "elapsed_s" => self.started.elapsed().as_secs());
    }
}

impl FuzzQueue for EngineQueue {
    fn init(&mut self, coverage_width: usize) -> Result<()> {
        self.seen = vec![0; coverage_width];
        self.started = Instant::now();
        info!(self.log, "Engine started";
            "at" => Utc::now().to_rfc3339(),
            "input_width" => self.input_width,
            "coverage_width" => coverage_width);
        Ok(())
    }

    fn done(&mut self) -> Result<bool> {
        if SHUTDOWN.load(Ordering::SeqCst) {
            info!(self.log, "Shutdown requested");
            return Ok(true);
        }
        if self
            .options
            .max_executions
            .is_some_and(|max| self.executions >= max)
        {
            return Ok(true);
        }
        let budget = self.options.time_budget_secs.map(Duration::from_secs);
        Ok(budget.is_some_and(|budget| self.started.elapsed() >= budget))
    }

    fn pop(&mut self, input: &mut [u8]) -> Result<bool> {
        if self.case.is_none() {
            self.start_case()?;
        }
        let Some(case) = self.case.as_mut() else {
            return Ok(false);
        };
        let end = case.cursor + input.len();
        if end > case.stimulus.len() {
            return Ok(false);
        }
        input.copy_from_slice(&case.stimulus[case.cursor..end]);
        case.cursor = end;
        Ok(true)
    }

    fn push(&mut self, coverage: &[u8]) -> Result<()> {
        // A case may end without a single pop having started it.
        let stimulus = match self.case.take() {
            Some(case) => case.stimulus,
            None => Vec::new(),
        };
        self.executions += 1;

        let mut new_id = None;
        if self.is_novel(coverage) {
            for (seen, &hit) in self.seen.iter_mut().zip(coverage) {
                *seen |= hit;
            }
            let id = self.add_to_corpus(stimulus)?;
            debug!(self.log, "New coverage"; "id" => %id, "covered_bits" => self.covered_bits());
            new_id = Some(id);
        }
        self.mutator
            .post_exec(&mut self.state, new_id)
            .map_err(afl)?;

        if self.executions % STATS_INTERVAL == 0 {
            self.report();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging;
    use std::path::Path;

    fn options(dir: &Path) -> EngineOptions {
        EngineOptions {
            queue_dir: dir.join("queue"),
            corpus_dir: None,
            max_executions: Some(5),
            seed: Some(7),
            ..EngineOptions::default()
        }
    }

    #[test]
    fn synthesizes_a_seed_when_corpus_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let opts = EngineOptions {
            max_cycles: 8,
            ..options(dir.path())
        };
        let engine = EngineQueue::new(opts, 4, &logging::discard()).unwrap();
        assert_eq!(engine.corpus_size(), 1);

        let corpus = engine.state.corpus();
        let seed: Vec<u8> = corpus
            .cloned_input_for_id(corpus.first().unwrap())
            .unwrap()
            .into();
        // Whole units, one to eight cycles.
        assert_eq!(seed.len() % 4, 0);
        assert!((4..=32).contains(&seed.len()), "{}", seed.len());
    }

    #[test]
    fn loads_seed_files() {
        let dir = tempfile::tempdir().unwrap();
        let seeds = dir.path().join("seeds");
        fs::create_dir(&seeds).unwrap();
        fs::write(seeds.join("a"), [1, 2, 3, 4]).unwrap();
        fs::write(seeds.join("b"), [5, 6, 7, 8, 9, 10, 11, 12]).unwrap();
        let engine = EngineQueue::new(
            EngineOptions {
                corpus_dir: Some(seeds),
                ..options(dir.path())
            },
            4,
            &logging::discard(),
        )
        .unwrap();
        assert_eq!(engine.corpus_size(), 2);
    }

    #[test]
    fn pops_whole_units_then_reports_exhaustion() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = EngineQueue::new(options(dir.path()), 4, &logging::discard()).unwrap();
        engine.init(2).unwrap();

        let mut unit = [0u8; 4];
        while engine.pop(&mut unit).unwrap() {}
        // Exhaustion is sticky until the case is pushed.
        assert!(!engine.pop(&mut unit).unwrap());
        engine.push(&[0, 0]).unwrap();
        assert_eq!(engine.executions(), 1);
    }

    #[test]
    fn novel_coverage_grows_the_corpus() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = EngineQueue::new(options(dir.path()), 1, &logging::discard()).unwrap();
        engine.init(2).unwrap();
        let before = engine.corpus_size();

        let mut unit = [0u8; 1];
        while engine.pop(&mut unit).unwrap() {}
        engine.push(&[0b0000_0001, 0]).unwrap();
        assert_eq!(engine.corpus_size(), before + 1);

        while engine.pop(&mut unit).unwrap() {}
        engine.push(&[0b0000_0001, 0]).unwrap();
        assert_eq!(engine.corpus_size(), before + 1);

        while engine.pop(&mut unit).unwrap() {}
        engine.push(&[0b0000_0001, 0b1000_0000]).unwrap();
        assert_eq!(engine.corpus_size(), before + 2);
        assert_eq!(engine.covered_bits(), 2);
    }

    #[test]
    fn stops_after_the_execution_budget() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = EngineQueue::new(options(dir.path()), 2, &logging::discard()).unwrap();
        engine.init(1).unwrap();
        let mut unit = [0u8; 2];
        for _ in 0..5 {
            assert!(!engine.done().unwrap());
            while engine.pop(&mut unit).unwrap() {}
            engine.push(&[0]).unwrap();
        }
        assert!(engine.done().unwrap());
    }

    #[test]
    fn records_the_in_flight_input() {
        let dir = tempfile::tempdir().unwrap();
        let opts = EngineOptions {
            record_cur_input: true,
            ..options(dir.path())
        };
        let cur = opts.queue_dir.join(CUR_INPUT_FILE);
        let mut engine = EngineQueue::new(opts, 3, &logging::discard()).unwrap();
        engine.init(1).unwrap();
        let mut unit = [0u8; 3];
        let _ = engine.pop(&mut unit).unwrap();
        assert!(cur.is_file());
    }
}

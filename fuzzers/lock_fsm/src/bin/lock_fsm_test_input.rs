use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use lock_fsm::Lock;
use rtlfuzz::config::DriverConfig;
use rtlfuzz::driver::{DriverBuilder, RunExit};
use rtlfuzz::logging;
use rtlfuzz::queue::replay::ReplayQueue;
use slog::{Level, info, warn};

#[derive(Parser)]
#[command(about = "Replay one recorded input against the combination lock")]
struct Args {
    /// Recorded stimulus, e.g. a queue entry or `.cur_input`.
    input: PathBuf,
    /// Driver configuration.
    #[arg(long, default_value = "fuzzers/lock_fsm/fuzz.toml")]
    config: PathBuf,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let log = logging::terminal(Level::Info);

    let config = DriverConfig::from_file(&args.config)?;
    let harness = config.load_harness()?;
    let stimulus = std::fs::read(&args.input)
        .with_context(|| format!("Unable to read stimulus {}", args.input.display()))?;

    let fields: Vec<&str> = harness.inputs().iter().map(|f| f.name.as_str()).collect();
    info!(log, "cycle {}", fields.join(" "));
    // The partial trailing unit is never clocked in.
    let unit = harness.test_size().input;
    let whole = stimulus.len() - stimulus.len() % unit.max(1);
    if whole < stimulus.len() {
        warn!(log, "Ignoring partial trailing cycle"; "bytes" => stimulus.len() - whole);
    }
    for (cycle, row) in harness.input_report(&stimulus[..whole])?.iter().enumerate() {
        info!(log, "{cycle:>5} {}", row.join(" "));
    }
    let mut queue = ReplayQueue::new(stimulus);

    let model = Lock::new(&log).keep_running();
    let driver = DriverBuilder::new(model)
        .install_context()
        .with_logger(log.clone())
        .build()?;
    let summary = driver.run(&mut queue)?;
    if let RunExit::ModelFinished { tick } = summary.exit {
        info!(log, "Model finished the run"; "tick" => tick);
        return Ok(());
    }

    let coverage = queue.coverage().context("replay produced no coverage")?;
    let report = harness.coverage_report(coverage, false)?;
    for point in &report.points {
        info!(log, "{}", point.name;
            "covered" => point.covered(),
            "true" => point.covered_true,
            "false" => point.covered_false,
            "expression" => &point.human);
    }
    info!(log, "Covered a total of {}/{} signals", report.covered(), harness.coverage_signal_count();
        "cycles" => summary.cycles);
    Ok(())
}

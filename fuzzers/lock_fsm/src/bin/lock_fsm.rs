use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use lock_fsm::Lock;
use rtlfuzz::config::DriverConfig;
use rtlfuzz::driver::{self, DriverBuilder};
use rtlfuzz::logging;
use rtlfuzz::model::CircuitModel;
use rtlfuzz::queue;
use slog::{Level, info};

#[derive(Parser)]
#[command(about = "Fuzz the combination lock circuit")]
struct Args {
    /// Driver configuration.
    #[arg(default_value = "fuzzers/lock_fsm/fuzz.toml")]
    config: PathBuf,
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let log = logging::terminal(if args.verbose { Level::Debug } else { Level::Info });

    let config = DriverConfig::from_file(&args.config)?;
    let harness = config.load_harness()?;
    harness.log_header(&log);

    let model = Lock::new(&log);
    let size = harness.test_size();
    let ports = model.ports();
    rtlfuzz::marshal::RegisterMap::from_ports(&ports)?.check_widths(size.input, size.coverage)?;

    #[allow(unused_mut)]
    let mut builder = DriverBuilder::new(model)
        .install_context()
        .with_logger(log.clone());
    #[cfg(feature = "trace")]
    {
        let path = config
            .waveform
            .clone()
            .unwrap_or_else(|| PathBuf::from(rtlfuzz::constants::DEFAULT_WAVEFORM_PATH));
        let sink = rtlfuzz::waveform::VcdSink::create(&path, harness.module(), &ports)?;
        builder = builder.with_sink(Box::new(sink));
    }
    let driver = builder.build()?;

    let mut queue = queue::from_config(&config.queue, size.input, &log)?;
    let summary = driver::run_and_exit(driver, &mut queue)?;
    info!(log, "Done"; "cases" => summary.cases, "cycles" => summary.cycles);
    Ok(())
}

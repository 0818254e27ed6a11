//! Structured logging.
//!
//! The terminal drain is synchronous: the model may end the process at any
//! point and buffered records would be lost.

use slog::{Drain, Level, Logger, o};

/// A logger writing to stderr, filtered at `level`.
pub fn terminal(level: Level) -> Logger {
    let decorator = slog_term::PlainSyncDecorator::new(std::io::stderr());
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = drain.filter_level(level).fuse();
    Logger::root(drain, o!("crate" => env!("CARGO_PKG_NAME")))
}

/// A logger that drops every record.
pub fn discard() -> Logger {
    Logger::root(slog::Discard, o!())
}

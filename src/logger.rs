use std::fs::File;

use time::format_description;
use tracing::{subscriber::set_global_default, Level};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, FmtSubscriber};

const LOG_FILE: &str = "arena.log";

/// Set up the global tracing subscriber, writing to the run's log file.
/// Will panic on error.
pub fn init_logger() {
    let file = File::create(LOG_FILE).expect("could not create log file");
    let writer = BoxMakeWriter::new(file);
    let local_offset =
        time::UtcOffset::current_local_offset().unwrap_or(time::UtcOffset::UTC);
    let timer = tracing_subscriber::fmt::time::OffsetTime::new(
        local_offset,
        format_description::parse("[year]-[month]-[day] [hour]:[minute]:[second]").unwrap(),
    );

    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::TRACE)
        .with_ansi(false)
        .with_timer(timer)
        .with_writer(writer)
        .finish();

    set_global_default(subscriber).expect("Could not set global default tracing subscriber. Consider disabling logs if you are already setting a subscriber.");
}

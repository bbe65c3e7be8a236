//! Logging infrastructure for ehci-hcd
//!
//! The driver logs through the `log` facade. This module provides a
//! ready-made `log::Log` for firmware-style environments: every record
//! becomes one `[ticks] [LEVEL] message` line on a registered
//! `core::fmt::Write` sink (usually a serial port), stamped by a
//! caller-supplied tick source.
//!
//! Records emitted while the sink is in use (for example from the interrupt
//! path while a producer is logging) are dropped rather than spun on.

use core::fmt::{self, Write};
use log::{Level, LevelFilter, Metadata, Record, SetLoggerError};
use spin::Mutex;

/// Where log lines go
pub type Sink = &'static mut (dyn Write + Send);

/// Time source for line stamps
pub type TickSource = fn() -> u64;

struct State {
    sink: Option<Sink>,
    ticks: TickSource,
}

/// Serial-style logger
struct HcdLogger {
    state: Mutex<State>,
}

fn no_ticks() -> u64 {
    0
}

static LOGGER: HcdLogger = HcdLogger {
    state: Mutex::new(State {
        sink: None,
        ticks: no_ticks,
    }),
};

fn level_str(level: Level) -> &'static str {
    match level {
        Level::Error => "ERROR",
        Level::Warn => "WARN ",
        Level::Info => "INFO ",
        Level::Debug => "DEBUG",
        Level::Trace => "TRACE",
    }
}

fn write_line(w: &mut dyn Write, ticks: u64, level: Level, args: &fmt::Arguments) -> fmt::Result {
    writeln!(w, "[{:>10}] [{}] {}", ticks, level_str(level), args)
}

impl log::Log for HcdLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let Some(mut state) = self.state.try_lock() else {
            return;
        };
        let ts = (state.ticks)();
        if let Some(sink) = state.sink.as_mut() {
            let _ = write_line(*sink, ts, record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Install the logger
///
/// Fails if another logger was installed first.
pub fn init(sink: Sink, ticks: TickSource) -> Result<(), SetLoggerError> {
    {
        let mut state = LOGGER.state.lock();
        state.sink = Some(sink);
        state.ticks = ticks;
    }
    log::set_logger(&LOGGER)?;
    log::set_max_level(LevelFilter::Debug);
    Ok(())
}

/// Set the maximum log level
pub fn set_level(level: LevelFilter) {
    log::set_max_level(level);
}

//! Logger setup.
//!
//! A normal host-process dispatcher built on `fern`, `chrono`, and
//! `colored`. This runs in the inspector's own process, not inside a
//! captured syscall trap, so none of the allocation-free, signal-handler-safe
//! discipline an in-tracee ring-buffer logger would need applies here; a
//! conventional dispatcher is the right fit. Verbosity is a runtime
//! `-v`/`-vv` flag rather than a compile-time debug switch.

use colored::Colorize;
use log::LevelFilter;

/// Maps `-v` occurrence count to a level filter: none is warnings and
/// above, one is info, two or more is debug/trace.
pub fn level_for_verbosity(count: u8) -> LevelFilter {
    match count {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Installs the global logger. Safe to call once per process; a second
/// call returns the `SetLogger` error from `fern`/`log` unchanged.
pub fn init(level: LevelFilter) -> Result<(), fern::InitError> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            let level_str = match record.level() {
                log::Level::Error => record.level().to_string().red(),
                log::Level::Warn => record.level().to_string().yellow(),
                log::Level::Info => record.level().to_string().green(),
                log::Level::Debug => record.level().to_string().cyan(),
                log::Level::Trace => record.level().to_string().dimmed(),
            };
            out.finish(format_args!(
                "[{} {} {}] {}",
                chrono::Local::now().format("%H:%M:%S%.3f"),
                level_str,
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr())
        .apply()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_escalates_monotonically() {
        assert_eq!(level_for_verbosity(0), LevelFilter::Warn);
        assert_eq!(level_for_verbosity(1), LevelFilter::Info);
        assert_eq!(level_for_verbosity(2), LevelFilter::Debug);
        assert_eq!(level_for_verbosity(5), LevelFilter::Trace);
    }
}

use core::fmt::Write;

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

use crate::spinlock::Spinlock;

/// Kernel logger. Formats `log` records onto a console, one line each;
/// the lock keeps lines from interleaving when an interrupt handler logs.
pub struct Printer<W> {
    console: Spinlock<W>,
    level: LevelFilter,
}

impl<W: Write + Send> Printer<W> {
    pub const fn new(console: W, level: LevelFilter) -> Self {
        Self {
            console: Spinlock::new("pr", console),
            level,
        }
    }

    /// Route the `log` macros here.
    pub fn init(&'static self) -> Result<(), SetLoggerError> {
        log::set_logger(self)?;
        log::set_max_level(self.level);
        Ok(())
    }

    pub fn with_console<R>(&self, f: impl FnOnce(&mut W) -> R) -> R {
        f(&mut self.console.lock())
    }
}

impl<W: Write + Send> Log for Printer<W> {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut console = self.console.lock();
        let _ = writeln!(
            console,
            "[{}] {}: {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Level;
    use std::string::String;

    #[test]
    fn formats_one_line_per_record() {
        let printer = Printer::new(String::new(), LevelFilter::Info);
        printer.log(
            &Record::builder()
                .args(format_args!("queue {} ready", 0))
                .level(Level::Info)
                .target("virtio_disk")
                .build(),
        );
        printer.log(
            &Record::builder()
                .args(format_args!("bad block"))
                .level(Level::Warn)
                .target("virtio_disk")
                .build(),
        );
        printer.with_console(|out| {
            assert_eq!(
                out.as_str(),
                "[INFO] virtio_disk: queue 0 ready\n[WARN] virtio_disk: bad block\n"
            )
        });
    }

    #[test]
    fn drops_records_below_level() {
        let printer = Printer::new(String::new(), LevelFilter::Warn);
        assert!(!printer.enabled(&Metadata::builder().level(Level::Debug).build()));
        printer.log(
            &Record::builder()
                .args(format_args!("submit"))
                .level(Level::Debug)
                .build(),
        );
        printer.with_console(|out| assert!(out.is_empty()));
    }
}

// logger.rs
// `log` facade backed by the UART driver
//
// Structured logging over a byte UART: each record is written as
// `LEVEL target: message\r\n`. There is no buffering here, matching the
// kernel's general policy of never sleeping or blocking on kernel-side
// I/O — a full FIFO just makes `put` spin until there's room.

use core::fmt::Write;

use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::uart::Uart;

struct UartLogger;

static LOGGER: UartLogger = UartLogger;

impl Log for UartLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Info
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut uart = Uart::new(crate::uart::UART_BASE);
        let _ = write!(uart, "[{}] {}\r\n", record.level(), record.args());
    }

    fn flush(&self) {}
}

/// Install the UART-backed logger as the global `log` sink. Must be
/// called once, after the UART is initialised and before any `log::`
/// macro use.
pub fn init() {
    log::set_logger(&LOGGER).expect("logger already initialised");
    log::set_max_level(LevelFilter::Info);
}

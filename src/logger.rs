//! `log::Log` sink. Always writes to the serial port; the framebuffer console
//! this kernel hands records to is an external collaborator, not implemented
//! here.

use crate::serial_println;

pub struct SerialLogger;

impl SerialLogger {
    pub const fn new() -> Self {
        SerialLogger
    }
}

impl log::Log for SerialLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if crate::serial::mirror_enabled() {
            serial_println!(
                "[{}] {}: {}",
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

static LOGGER: SerialLogger = SerialLogger::new();

pub fn init() {
    crate::serial::set_mirror_enabled(true);
    log::set_logger(&LOGGER)
        .map(|()| log::set_max_level(log::LevelFilter::Trace))
        .expect("logger already initialized");
}

//! UART 16550 output sink (COM1). Output only; there is no input path in this
//! core — a console's keyboard/input handling lives outside it.

use core::fmt;
use spin::Mutex;
use uart_16550::SerialPort;

const COM1_PORT: u16 = 0x3F8;

pub static SERIAL1: Mutex<SerialPort> = Mutex::new(unsafe { SerialPort::new(COM1_PORT) });

pub fn init() {
    SERIAL1.lock().init();
}

pub fn write_byte(byte: u8) {
    use x86_64::instructions::interrupts;
    interrupts::without_interrupts(|| {
        SERIAL1.lock().send(byte);
    });
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;
    use x86_64::instructions::interrupts;

    interrupts::without_interrupts(|| {
        let _ = SERIAL1.lock().write_fmt(args);
    });
}

/// Direct port I/O, no lock. Used by the panic path so a held serial lock
/// elsewhere can never deadlock the last thing the kernel ever prints.
pub fn emergency_print(args: fmt::Arguments) {
    use core::fmt::Write;

    struct EmergencySerial;
    impl fmt::Write for EmergencySerial {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            for byte in s.bytes() {
                unsafe {
                    x86_64::instructions::port::Port::<u8>::new(COM1_PORT).write(byte);
                }
            }
            Ok(())
        }
    }

    let _ = EmergencySerial.write_fmt(args);
}

pub fn flush_serial() {
    unsafe {
        use x86_64::instructions::port::Port;
        let mut status_port = Port::<u8>::new(COM1_PORT + 5);
        while (status_port.read() & 0x20) == 0 {
            core::hint::spin_loop();
        }
    }
}

static MIRROR_ENABLED: core::sync::atomic::AtomicBool = core::sync::atomic::AtomicBool::new(
    cfg!(feature = "serial_mirror"),
);

/// Whether log records (in addition to panics, which always mirror) are
/// echoed to serial.
pub fn set_mirror_enabled(enabled: bool) {
    MIRROR_ENABLED.store(enabled, core::sync::atomic::Ordering::Relaxed);
}

pub fn mirror_enabled() -> bool {
    MIRROR_ENABLED.load(core::sync::atomic::Ordering::Relaxed)
}

#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => ($crate::serial::_print(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => ($crate::serial_print!("{}\n", format_args!($($arg)*)));
}

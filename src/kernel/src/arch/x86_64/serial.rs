//! Serial port driver for x86_64.
//!
//! COM1 (0x3F8) carries every log line; [`SerialLogger`] is the `log`
//! backend on bare metal.

use core::fmt::{self, Write};

use log::{Level, LevelFilter, Metadata, Record};
use spin::{Mutex, Once};
use uart_16550::SerialPort;
use x86_64::instructions::interrupts::without_interrupts;

/// COM1 I/O port address.
const COM1_PORT: u16 = 0x3F8;

static SERIAL: Once<Mutex<SerialPort>> = Once::new();

/// Initializes the global serial port. Idempotent.
pub fn init() -> &'static Mutex<SerialPort> {
    SERIAL.call_once(|| {
        // SAFETY: COM1 is the standard first UART and we run at ring 0.
        let mut serial = unsafe { SerialPort::new(COM1_PORT) };
        serial.init();
        Mutex::new(serial)
    })
}

/// Write formatted text to COM1.
pub fn write_fmt(args: fmt::Arguments) {
    // Interrupt handlers log too; never spin on a lock they interrupted.
    without_interrupts(|| {
        let _ = init().lock().write_fmt(args);
    });
}

/// Prints to the serial port without a newline.
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::arch::x86_64::serial::write_fmt(format_args!($($arg)*))
    };
}

/// Prints to the serial port with a newline.
#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => ($crate::serial_print!("{}\n", format_args!($($arg)*)))
}

/// Byte-level handle on COM1.
#[derive(Debug, Default, Clone, Copy)]
pub struct Com1;

impl kestrel_hal::Serial for Com1 {
    fn write_byte(&mut self, byte: u8) {
        without_interrupts(|| init().lock().send(byte));
    }

    fn read_byte(&mut self) -> Option<u8> {
        without_interrupts(|| init().lock().try_receive().ok())
    }
}

/// `log` backend writing `[LEVEL target] message` lines to COM1.
struct SerialLogger;

static LOGGER: SerialLogger = SerialLogger;

impl log::Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let tag = match record.level() {
            Level::Error => "\x1b[31mERROR\x1b[0m",
            Level::Warn => "\x1b[33mWARN \x1b[0m",
            Level::Info => "\x1b[32mINFO \x1b[0m",
            Level::Debug => "\x1b[90mDEBUG\x1b[0m",
            Level::Trace => "\x1b[90mTRACE\x1b[0m",
        };
        write_fmt(format_args!("[{} {}] {}\n", tag, record.target(), record.args()));
    }

    fn flush(&self) {}
}

/// Install the serial logger at `level`. A second call is a no-op.
pub fn init_logger(level: LevelFilter) {
    init();
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

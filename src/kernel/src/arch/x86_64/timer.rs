//! 8253/8254 programmable interval timer on IRQ 0.

use core::sync::atomic::{AtomicU64, Ordering};

use kestrel_hal::Timer;
use x86_64::instructions::port::Port;

const PIT_FREQUENCY: u64 = 1_193_182;
const CHANNEL0: u16 = 0x40;
const COMMAND: u16 = 0x43;
// Channel 0, lobyte/hibyte, rate generator.
const MODE_RATE: u8 = 0x34;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Program channel 0 to fire every `tick_ms` milliseconds.
pub fn init(tick_ms: u64) {
    let hz = 1000 / tick_ms.clamp(1, 54);
    let divisor = (PIT_FREQUENCY / hz).min(u64::from(u16::MAX)) as u16;
    let mut command = Port::<u8>::new(COMMAND);
    let mut data = Port::<u8>::new(CHANNEL0);
    // SAFETY: standard PIT ports; runs once during boot.
    unsafe {
        command.write(MODE_RATE);
        data.write((divisor & 0xFF) as u8);
        data.write((divisor >> 8) as u8);
    }
    log::debug!(target: "boot", "pit at {} Hz (divisor {})", hz, divisor);
}

/// Count one timer interrupt.
pub(super) fn tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
}

/// Time source backed by the PIT tick count.
#[derive(Debug, Default, Clone, Copy)]
pub struct PitClock;

impl Timer for PitClock {
    fn current_ticks(&self) -> u64 {
        TICKS.load(Ordering::Relaxed)
    }
}

//! Monotonic tick counter, incremented by the timer interrupt handler.
//! No wall-clock/RTC component — out of scope for this core.

use core::sync::atomic::{AtomicU64, Ordering};

static TICKS: AtomicU64 = AtomicU64::new(0);

pub fn increment_ticks() {
    TICKS.fetch_add(1, Ordering::Relaxed);
}

pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

#[cfg(test)]
mod time_tests {
    use super::*;

    #[test_case]
    fn ticks_increment_monotonically() {
        let before = ticks();
        increment_ticks();
        increment_ticks();
        assert_eq!(ticks(), before + 2);
    }
}

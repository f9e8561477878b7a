//! Monotonic millisecond clock
//!
//! All timestamps in the reactor (session activity, timeout sweeps, audit
//! entries) are milliseconds on this clock. The origin is fixed the first
//! time the clock is sampled, so values are small and never go backwards.

use std::sync::OnceLock;
use std::time::Instant;

static ORIGIN: OnceLock<Instant> = OnceLock::new();

/// Milliseconds elapsed on the monotonic clock.
#[inline]
pub fn millis_now() -> u64 {
    let origin = *ORIGIN.get_or_init(Instant::now);
    origin.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_clock_is_monotonic() {
        let a = millis_now();
        thread::sleep(Duration::from_millis(5));
        let b = millis_now();
        assert!(b >= a + 4);
    }
}

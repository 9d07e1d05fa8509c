//! Randomized pause between consecutive sends.

use std::time::Duration;

use rand::Rng;

/// Draw a delay uniformly from `[min_ms, max_ms]`, inclusive.
///
/// Inverted bounds are swapped; equal bounds yield exactly that delay.
pub fn draw_delay(min_ms: u64, max_ms: u64) -> Duration {
    let (low, high) = if min_ms <= max_ms {
        (min_ms, max_ms)
    } else {
        (max_ms, min_ms)
    };
    if low == high {
        return Duration::from_millis(low);
    }
    Duration::from_millis(rand::thread_rng().gen_range(low..=high))
}

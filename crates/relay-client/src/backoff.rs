//! Reconnect delay schedule.

use std::time::Duration;

/// Delay before reconnect attempt `attempt` (1-based).
///
/// `min(initial * 2^(attempt - 1), max)`. Attempt `0` is treated as `1`.
pub fn reconnect_delay(attempt: u32, initial: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    initial.saturating_mul(1_u32 << exponent).min(max)
}

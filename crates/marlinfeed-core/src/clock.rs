//! Monotonic millisecond clock shared by all timeout accounting.

use std::sync::OnceLock;
use std::time::Instant;

static START: OnceLock<Instant> = OnceLock::new();

/// Milliseconds since the first call in this process, starting at 1.
///
/// All deadlines (ack timeout, error budget, stall detection, pause
/// accounting) are differences of this clock, so the arbitrary origin
/// does not matter. Monotonic, unaffected by wall clock adjustments.
/// Never returns 0, which serves as the "not armed" sentinel in
/// timestamp fields.
pub fn millis() -> i64 {
    START.get_or_init(Instant::now).elapsed().as_millis() as i64 + 1
}

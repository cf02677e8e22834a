//! Monotonic tick source shared by the receipt, acknowledge and heartbeat
//! services.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

static ANCHOR: OnceLock<Instant> = OnceLock::new();
static LAST: AtomicU64 = AtomicU64::new(0);

/// Return a strictly increasing tick value (nanoseconds since first use).
///
/// Two calls never return the same value, so a tick can order events that
/// happen within the same clock resolution. The first value is at least 1.
pub fn ticks() -> u64 {
    let anchor = ANCHOR.get_or_init(Instant::now);
    let now = anchor.elapsed().as_nanos() as u64 + 1;
    let prev = LAST.fetch_max(now, Ordering::AcqRel);
    if now > prev {
        return now;
    }
    // clock did not advance past the last handed-out value
    LAST.fetch_add(1, Ordering::AcqRel) + 1
}

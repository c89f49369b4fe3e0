//! Process-wide netlink sequence allocation.
//!
//! All handlers draw from one counter, so a sequence number is unique
//! across handlers within the counter's current 31-bit window;
//! correlation still happens per (handler, seq). The counter is only
//! ever advanced from the scheduler thread, but an atomic keeps the
//! allocator safe should tests run handlers on separate threads.

use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_SEQ: AtomicU32 = AtomicU32::new(0);

/// Advance a sequence value by one, masked to the non-negative 31-bit
/// range. 0 is never produced: the counter wraps past 2³¹−1 to 1.
pub(crate) fn advance(prev: u32) -> u32 {
    let next = (prev + 1) & i32::MAX as u32;
    if next == 0 { 1 } else { next }
}

/// Allocate the next sequence number.
pub fn next_seq() -> u32 {
    let mut prev = NEXT_SEQ.load(Ordering::Relaxed);
    loop {
        let next = advance(prev);
        match NEXT_SEQ.compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(observed) => prev = observed,
        }
    }
}

//! Tick counts and their wrap-around-aware ordering.
//!
//! The tick counter is a free-running 32-bit value. It's only meaningful to
//! compare two tick values that are less than `2³¹` ticks apart. Under this
//! condition, the chronological order of `a` and `b` is determined by the sign
//! of `a - b` interpreted as a two's complement number:
//!
//! ```text
//!                 b                         b + 2³¹
//! ════════════════╤═════════════════════════════╤════════════════
//!  ◀── a is before b (a - b < 0)                 a is after b ──▶
//!                 │
//!                 └─ a is at b (a - b = 0)
//! ```
//!
//! The line wraps around, so this holds even if the counter has passed
//! through zero between `a` and `b`.

/// An absolute point of time or a span, measured in ticks.
pub type Ticks = u32;

/// Get a flag indicating whether `a` comes strictly before `b`.
#[inline]
pub const fn ticks_before(a: Ticks, b: Ticks) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// Get a flag indicating whether `a` comes before `b` or is equal to it.
#[inline]
pub const fn ticks_before_or_at(a: Ticks, b: Ticks) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}

/// Calculate the number of ticks from `now` until `at`. Returns `0` if `at` is
/// already due.
#[inline]
pub const fn saturating_ticks_until(at: Ticks, now: Ticks) -> Ticks {
    if ticks_before_or_at(at, now) {
        0
    } else {
        at.wrapping_sub(now)
    }
}

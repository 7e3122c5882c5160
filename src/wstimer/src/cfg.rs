//! Static configuration of the scheduler
use crate::ticks::Ticks;

/// The default number of statically allocated timer records, i.e., the
/// default value of `TimerSys`'s `N` parameter.
pub const DEFAULT_STATIC_TIMERS: usize = 6;

/// The configuration of a [`TimerSys`].
///
/// [`TimerSys`]: crate::TimerSys
///
/// # Examples
///
/// ```
/// use wstimer::TimerSysCfg;
/// const CFG: TimerSysCfg = TimerSysCfg::new().with_tick_hz(100);
/// assert_eq!(CFG.tick_period_ms(), 10);
/// assert_eq!(CFG.ms_to_ticks_exact(255), None);
/// assert_eq!(CFG.ms_to_ticks_exact(260), Some(26));
///
/// // A tick period that isn't a divisor of one second
/// const CFG30: TimerSysCfg = TimerSysCfg::new().with_tick_period_ms(30);
/// assert_eq!(CFG30.tick_hz(), None);
/// assert_eq!(CFG30.ms_to_ticks_exact(90), Some(3));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerSysCfg {
    tick_period_ms: u32,
    /// The maximum number of records that can be allocated in addition to the
    /// static ones. `None` means no limit.
    pub overflow_limit: Option<usize>,
}

impl TimerSysCfg {
    /// Construct the default configuration: a 20 Hz tick (50 milliseconds per
    /// tick) and no overflow limit.
    pub const fn new() -> Self {
        Self {
            tick_period_ms: 50,
            overflow_limit: None,
        }
    }

    /// Set the tick frequency.
    ///
    /// # Panics
    ///
    /// Panics if one tick isn't a whole number of milliseconds. When called in
    /// a constant context, this is a compile-time error.
    pub const fn with_tick_hz(self, tick_hz: u32) -> Self {
        assert!(
            tick_hz > 0 && tick_hz <= 1000 && 1000 % tick_hz == 0,
            "the tick period must be a whole number of milliseconds"
        );
        Self {
            tick_period_ms: 1000 / tick_hz,
            ..self
        }
    }

    /// Set the length of one tick in milliseconds.
    ///
    /// # Panics
    ///
    /// Panics if `tick_period_ms` is zero. When called in a constant context,
    /// this is a compile-time error.
    pub const fn with_tick_period_ms(self, tick_period_ms: u32) -> Self {
        assert!(tick_period_ms > 0, "the tick period must not be zero");
        Self {
            tick_period_ms,
            ..self
        }
    }

    /// Set [`Self::overflow_limit`].
    pub const fn with_overflow_limit(self, overflow_limit: Option<usize>) -> Self {
        Self {
            overflow_limit,
            ..self
        }
    }

    /// The tick frequency. Returns `None` if one second isn't a whole number
    /// of ticks.
    #[inline]
    pub const fn tick_hz(&self) -> Option<u32> {
        if 1000 % self.tick_period_ms == 0 {
            Some(1000 / self.tick_period_ms)
        } else {
            None
        }
    }

    /// The length of one tick in milliseconds.
    #[inline]
    pub const fn tick_period_ms(&self) -> u32 {
        self.tick_period_ms
    }

    /// Convert a duration in milliseconds to ticks. Returns `None` if the
    /// duration isn't a whole positive multiple of the tick period.
    pub const fn ms_to_ticks_exact(&self, ms: u32) -> Option<Ticks> {
        let period = self.tick_period_ms();
        if ms < period || ms % period != 0 {
            None
        } else {
            Some(ms / period)
        }
    }

    /// Convert ticks to milliseconds, saturating at `u32::MAX`.
    #[inline]
    pub const fn ticks_to_ms(&self, ticks: Ticks) -> u32 {
        ticks.saturating_mul(self.tick_period_ms())
    }

    /// Like [`Self::ms_to_ticks_exact`], but panics on an invalid duration.
    #[track_caller]
    pub(crate) fn ms_to_ticks_or_panic(&self, ms: u32) -> Ticks {
        match self.ms_to_ticks_exact(ms) {
            Some(ticks) => ticks,
            None => panic!(
                "{} ms is not a positive multiple of the tick period ({} ms)",
                ms,
                self.tick_period_ms()
            ),
        }
    }
}

impl Default for TimerSysCfg {
    fn default() -> Self {
        Self::new()
    }
}

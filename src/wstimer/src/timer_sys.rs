//! Scheduler Core
use core::fmt;

use crate::{
    cfg::{TimerSysCfg, DEFAULT_STATIC_TIMERS},
    error::{CancelTimerError, CompleteDeliveryError, CpuLockError, RequestTimerError},
    event::{Delivery, DeliveryToken, EventSink, TaskletId, TimerEvent, TimerHandle},
    klock::{lock_cpu, CpuLockCell, CpuLockTokenRefMut},
    pool::{SlotId, TimerPool, TimerState},
    queue::TimerQueue,
    ticks::{saturating_ticks_until, ticks_before_or_at, Ticks},
    PortThreading,
};

#[cfg(test)]
mod tests;

/// A snapshot of how the timer records are distributed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// The number of statically allocated records. This is zero until
    /// [`TimerSys::init`] is called.
    pub static_capacity: usize,
    /// The number of records allocated on demand.
    pub overflow_allocated: usize,
    /// The number of records in the pool.
    pub free: usize,
    /// The number of records in the Timer Queue.
    pub queued: usize,
    /// The number of records handed to the event sink and not completed yet.
    pub in_flight: usize,
}

/// The tick-driven timer scheduler.
///
/// `TimerSys` owns the tick counter, the Timer Pool, and the Timer Queue.
/// All of them are guarded by CPU Lock, which is provided by `Traits`. `N` is
/// the number of statically allocated timer records.
///
/// A `TimerSys` is usually placed in a `static` so that the tick source, the
/// event sink, and application code can share it:
///
/// ```ignore
/// static TIMER_SYS: TimerSys<SystemTraits> = TimerSys::new(TimerSysCfg::new());
/// ```
///
/// # Delivery protocol
///
/// When a timer comes due, the scheduler hands a [`Delivery`] to the
/// [`EventSink`] passed to the operation that noticed it. The record stays
/// *in flight* until the sink returns its [`DeliveryToken`] through
/// [`Self::on_delivery_complete`]. Only then is a one-shot timer's record
/// released or a periodic timer rearmed.
pub struct TimerSys<Traits: PortThreading, const N: usize = DEFAULT_STATIC_TIMERS> {
    cfg: TimerSysCfg,
    state: CpuLockCell<Traits, TimerSysState<N>>,
}

#[derive(Debug)]
struct TimerSysState<const N: usize> {
    /// The tick counter. Wraps around.
    ticks: Ticks,
    pool: TimerPool<N>,
    queue: TimerQueue,
    initialized: bool,
}

impl<Traits: PortThreading, const N: usize> TimerSys<Traits, N> {
    /// Construct a `TimerSys`. The static timer records are not available
    /// until [`Self::init`] is called.
    pub const fn new(cfg: TimerSysCfg) -> Self {
        Self {
            cfg,
            state: CpuLockCell::new(TimerSysState {
                ticks: 0,
                pool: TimerPool::new(),
                queue: TimerQueue::new(),
                initialized: false,
            }),
        }
    }

    #[inline]
    pub fn cfg(&self) -> &TimerSysCfg {
        &self.cfg
    }

    /// Populate the Timer Pool with the statically allocated records.
    ///
    /// Calling this method again has no effect. The tick counter and the Timer
    /// Queue are left untouched in both cases.
    pub fn init(&self) -> Result<(), CpuLockError> {
        let mut lock = lock_cpu::<Traits>()?;
        let state = self.state.write(&mut *lock);

        if state.initialized {
            log::warn!("init: already initialized; ignored");
            return Ok(());
        }

        let num_records = state.pool.populate();
        state.initialized = true;
        log::debug!("init: {} static timer record(s)", num_records);
        Ok(())
    }

    /// Request a timer that comes due at tick `at` and then every `period`
    /// ticks after that. `period == 0` requests a one-shot timer.
    ///
    /// If `at` is not in the future, the timer is handed to `sink` before this
    /// method returns.
    pub fn request_at(
        &self,
        sink: &mut impl EventSink,
        event: TimerEvent,
        at: Ticks,
        period: Ticks,
    ) -> Result<TimerHandle, RequestTimerError> {
        let mut lock = lock_cpu::<Traits>()?;
        self.request_at_locked(lock.borrow_mut(), sink, event, at, period)
    }

    /// [`Self::request_at`] for a caller that already holds CPU Lock.
    pub fn request_at_locked(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        sink: &mut impl EventSink,
        event: TimerEvent,
        at: Ticks,
        period: Ticks,
    ) -> Result<TimerHandle, RequestTimerError> {
        self.state
            .write(&mut *lock)
            .request_at(&self.cfg, sink, event, at, period)
    }

    /// Request a timer that comes due `delay` ticks from now and then every
    /// `period` ticks after that.
    pub fn request_in(
        &self,
        sink: &mut impl EventSink,
        event: TimerEvent,
        delay: Ticks,
        period: Ticks,
    ) -> Result<TimerHandle, RequestTimerError> {
        let mut lock = lock_cpu::<Traits>()?;
        let state = self.state.write(&mut *lock);
        let at = state.ticks.wrapping_add(delay);
        state.request_at(&self.cfg, sink, event, at, period)
    }

    /// Request a periodic timer that comes due every `period_ms`
    /// milliseconds, starting `period_ms` milliseconds from now.
    ///
    /// # Panics
    ///
    /// Panics if `period_ms` isn't a positive multiple of the tick period.
    #[track_caller]
    pub fn request_every(
        &self,
        sink: &mut impl EventSink,
        event: TimerEvent,
        period_ms: u32,
    ) -> Result<TimerHandle, RequestTimerError> {
        let period = self.cfg.ms_to_ticks_or_panic(period_ms);
        self.request_in(sink, event, period, period)
    }

    /// Request a one-shot timer that sends an event with the given
    /// identification to `receiver` `time_ms` milliseconds from now.
    ///
    /// # Panics
    ///
    /// Panics if `time_ms` isn't a positive multiple of the tick period.
    #[track_caller]
    pub fn request_once(
        &self,
        sink: &mut impl EventSink,
        event_id: u8,
        event_type: u8,
        receiver: TaskletId,
        time_ms: u32,
    ) -> Result<TimerHandle, RequestTimerError> {
        let delay = self.cfg.ms_to_ticks_or_panic(time_ms);
        let event = TimerEvent::new(receiver, event_id, event_type);
        self.request_in(sink, event, delay, 0)
    }

    /// Advance the tick counter by `delta` and hand every timer that is now
    /// due to `sink`, in queue order.
    ///
    /// This is meant to be called by the tick source. `delta` may exceed one
    /// if ticks were missed.
    pub fn on_tick_advance(&self, sink: &mut impl EventSink, delta: Ticks) -> Result<(), CpuLockError> {
        let mut lock = lock_cpu::<Traits>()?;
        let state = self.state.write(&mut *lock);

        state.ticks = state.ticks.wrapping_add(delta);
        let now = state.ticks;

        // Process expired timers. Stop at the first one that is not due yet.
        while let Some(slot) = state.queue.pop_due(&mut state.pool, now) {
            state.hand_off(sink, slot);
        }

        Ok(())
    }

    /// Finish the delivery identified by `token`.
    ///
    /// A one-shot (or cancelled) timer's record is returned to the pool. A
    /// periodic timer's `launch_time` is advanced by its period. If the new
    /// `launch_time` is already due (the delivery took longer than a period),
    /// the timer is handed to `sink` again right away.
    pub fn on_delivery_complete(
        &self,
        sink: &mut impl EventSink,
        token: DeliveryToken,
    ) -> Result<(), CompleteDeliveryError> {
        let mut lock = lock_cpu::<Traits>()?;
        self.state.write(&mut *lock).complete(sink, token)
    }

    /// Cancel the timer identified by `handle`.
    ///
    /// A queued timer is removed from the Timer Queue and its record is
    /// returned to the pool. An in-flight delivery can't be retracted, but the
    /// timer won't be rearmed when the delivery completes.
    pub fn cancel(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        handle: TimerHandle,
    ) -> Result<(), CancelTimerError> {
        self.state.write(&mut *lock).cancel(handle)
    }

    /// [`Self::cancel`] for a caller that doesn't hold CPU Lock.
    pub fn cancel_timer(&self, handle: TimerHandle) -> Result<(), CancelTimerError> {
        let mut lock = lock_cpu::<Traits>()?;
        self.cancel(lock.borrow_mut(), handle)
    }

    /// Cancel the first queued timer whose event has the specified `event_id`
    /// and `receiver`. Returns `true` if such a timer was found.
    pub fn cancel_event(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        event_id: u8,
        receiver: TaskletId,
    ) -> bool {
        let state = self.state.write(&mut *lock);
        let pool = &state.pool;
        let found = state.queue.iter(pool).find(|&slot| {
            let event = &pool[slot].event;
            event.event_id == event_id && event.receiver == receiver
        });

        if let Some(slot) = found {
            log::trace!(
                "cancel_event: cancelling {:?} (event_id = {}, receiver = {:?})",
                slot,
                event_id,
                receiver
            );
            state.queue.remove(&mut state.pool, slot);
            state.pool.release(slot);
            true
        } else {
            false
        }
    }

    /// Cancel every timer whose event is addressed to `receiver`. Returns the
    /// number of timers affected.
    ///
    /// This is meant to be called when a tasklet goes away, before its ID can
    /// be handed out again. Queued timers are returned to the pool, and
    /// in-flight ones won't be rearmed, as with [`Self::cancel`].
    pub fn cancel_receiver(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        receiver: TaskletId,
    ) -> usize {
        let state = self.state.write(&mut *lock);
        let mut count = 0;

        for record in state.pool.iter_mut() {
            if record.state == TimerState::InFlight && record.event.receiver == receiver {
                record.period = 0;
                count += 1;
            }
        }

        loop {
            let pool = &state.pool;
            let found = state
                .queue
                .iter(pool)
                .find(|&slot| pool[slot].event.receiver == receiver);
            let Some(slot) = found else { break };
            state.queue.remove(&mut state.pool, slot);
            state.pool.release(slot);
            count += 1;
        }

        log::trace!("cancel_receiver: {:?}: {} timer(s)", receiver, count);
        count
    }

    /// Get the current value of the tick counter.
    pub fn ticks(&self) -> Result<Ticks, CpuLockError> {
        let lock = lock_cpu::<Traits>()?;
        Ok(self.state.read(&*lock).ticks)
    }

    /// Get the number of milliseconds until the earliest queued timer comes
    /// due (zero if it's already overdue), or `None` if there are no queued
    /// timers.
    pub fn shortest_active_timer(&self) -> Result<Option<u32>, CpuLockError> {
        let lock = lock_cpu::<Traits>()?;
        let state = self.state.read(&*lock);
        Ok(state.queue.front().map(|slot| {
            let remaining = saturating_ticks_until(state.pool[slot].launch_time, state.ticks);
            self.cfg.ticks_to_ms(remaining)
        }))
    }

    /// Get a snapshot of how the timer records are distributed.
    pub fn stats(&self) -> Result<PoolStats, CpuLockError> {
        let lock = lock_cpu::<Traits>()?;
        let state = self.state.read(&*lock);

        let mut stats = PoolStats {
            static_capacity: state.pool.static_len(),
            overflow_allocated: state.pool.overflow_len(),
            ..PoolStats::default()
        };
        for record in state.pool.iter() {
            match record.state {
                TimerState::Free { .. } => stats.free += 1,
                TimerState::Queued { .. } => stats.queued += 1,
                TimerState::InFlight => stats.in_flight += 1,
            }
        }
        debug_assert_eq!(stats.queued, state.queue.len());

        Ok(stats)
    }
}

impl<Traits: PortThreading, const N: usize> fmt::Debug for TimerSys<Traits, N> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimerSys")
            .field("cfg", &self.cfg)
            .field("state", &self.state)
            .finish()
    }
}

impl<const N: usize> TimerSysState<N> {
    fn request_at(
        &mut self,
        cfg: &TimerSysCfg,
        sink: &mut impl EventSink,
        event: TimerEvent,
        at: Ticks,
        period: Ticks,
    ) -> Result<TimerHandle, RequestTimerError> {
        if !sink.is_tasklet_valid(event.receiver) {
            log::warn!("request_at: receiver {:?} doesn't exist", event.receiver);
            return Err(RequestTimerError::InvalidReceiver);
        }

        let slot = self
            .pool
            .acquire(cfg.overflow_limit)
            .map_err(|_| RequestTimerError::ResourceExhausted)?;

        let record = &mut self.pool[slot];
        record.launch_time = at;
        record.period = period;
        record.event = event;
        let handle = TimerHandle {
            slot,
            generation: record.generation,
        };

        log::trace!(
            "request_at: {:?} at {} (period = {}, now = {})",
            slot,
            at,
            period,
            self.ticks
        );

        if ticks_before_or_at(at, self.ticks) {
            // Already due
            self.hand_off(sink, slot);
        } else {
            self.queue.insert(&mut self.pool, slot);
        }

        Ok(handle)
    }

    /// Hand a detached record to `sink`.
    fn hand_off(&mut self, sink: &mut impl EventSink, slot: SlotId) {
        let record = &self.pool[slot];
        debug_assert_eq!(record.state, TimerState::InFlight);

        log::trace!(
            "hand_off: {:?} (launch_time = {}, now = {})",
            slot,
            record.launch_time,
            self.ticks
        );

        sink.send_timer_event(Delivery {
            event: record.event,
            launch_time: record.launch_time,
            token: DeliveryToken {
                handle: TimerHandle {
                    slot,
                    generation: record.generation,
                },
            },
        });
    }

    fn complete(
        &mut self,
        sink: &mut impl EventSink,
        token: DeliveryToken,
    ) -> Result<(), CompleteDeliveryError> {
        let TimerHandle { slot, generation } = token.handle;

        let record = match self.pool.lookup_mut(slot, generation) {
            Some(record) if record.state == TimerState::InFlight => record,
            _ => {
                log::warn!("on_delivery_complete: {:?} is not in flight", token);
                return Err(CompleteDeliveryError::NoAccess);
            }
        };

        if record.period == 0 {
            log::trace!("on_delivery_complete: releasing {:?}", slot);
            self.pool.release(slot);
            return Ok(());
        }

        record.launch_time = record.launch_time.wrapping_add(record.period);
        let at = record.launch_time;

        if ticks_before_or_at(at, self.ticks) {
            // The next occurrence is already due. Catch up without skipping
            // it.
            log::trace!(
                "on_delivery_complete: {:?} is behind (launch_time = {}, now = {})",
                slot,
                at,
                self.ticks
            );
            self.hand_off(sink, slot);
        } else {
            log::trace!("on_delivery_complete: rearming {:?} at {}", slot, at);
            self.queue.insert(&mut self.pool, slot);
        }

        Ok(())
    }

    fn cancel(&mut self, handle: TimerHandle) -> Result<(), CancelTimerError> {
        let TimerHandle { slot, generation } = handle;

        let record = self.pool.lookup_mut(slot, generation).ok_or_else(|| {
            log::warn!("cancel: {:?} is stale", handle);
            CancelTimerError::NoAccess
        })?;

        // Prevent rearming
        record.period = 0;

        let queued = matches!(record.state, TimerState::Queued { .. });
        if queued {
            log::trace!("cancel: removing {:?} from the queue", slot);
            self.queue.remove(&mut self.pool, slot);
            self.pool.release(slot);
        } else {
            log::trace!("cancel: {:?} is in flight", slot);
        }

        Ok(())
    }
}

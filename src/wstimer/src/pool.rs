//! Timer Pool: timer records and their free list
//!
//! The pool has a static part of `N` records, which are linked into the free
//! list by [`TimerPool::populate`], and (with the `alloc` feature) an overflow
//! part that grows one record at a time when the free list runs dry. Overflow
//! records are never returned to the heap. Once released, they join the same
//! free list as the static ones.
//!
//! Records are addressed by [`SlotId`]. Slots `0..N` refer to the static part,
//! and slots `N..` refer to the overflow part.
use arrayvec::ArrayVec;
use core::ops;

use crate::{
    event::{TaskletId, TimerEvent},
    queue::Link,
    ticks::Ticks,
};

#[cfg(feature = "alloc")]
use alloc::vec::Vec;

/// The index of a timer record in [`TimerPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SlotId(u32);

impl SlotId {
    #[inline]
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Who owns a timer record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerState {
    /// Owned by the pool. Points the next free record.
    Free { next_free: Option<SlotId> },
    /// Owned by the Timer Queue.
    Queued { link: Link },
    /// Owned by the event sink, or detached from both the pool and the queue
    /// within a single critical section.
    InFlight,
}

#[derive(Debug)]
pub(crate) struct TimerRecord {
    /// The tick at which the next occurrence is due.
    pub(crate) launch_time: Ticks,
    /// Zero for a one-shot timer.
    pub(crate) period: Ticks,
    pub(crate) event: TimerEvent,
    /// Incremented every time the record is released, which invalidates the
    /// outstanding handles.
    pub(crate) generation: u32,
    pub(crate) state: TimerState,
}

impl TimerRecord {
    const fn new_free(next_free: Option<SlotId>) -> Self {
        Self {
            launch_time: 0,
            period: 0,
            event: TimerEvent::new(TaskletId(0), 0, 0),
            generation: 0,
            state: TimerState::Free { next_free },
        }
    }

    #[inline]
    pub(crate) fn is_free(&self) -> bool {
        matches!(self.state, TimerState::Free { .. })
    }
}

/// The error type of [`TimerPool::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PoolExhausted;

#[derive(Debug)]
pub(crate) struct TimerPool<const N: usize> {
    fixed: ArrayVec<TimerRecord, N>,
    #[cfg(feature = "alloc")]
    overflow: Vec<TimerRecord>,
    first_free: Option<SlotId>,
}

impl<const N: usize> TimerPool<N> {
    pub(crate) const fn new() -> Self {
        Self {
            fixed: ArrayVec::new_const(),
            #[cfg(feature = "alloc")]
            overflow: Vec::new(),
            first_free: None,
        }
    }

    /// Fill the static part and link it into the free list. Returns the
    /// number of records added, which is zero if the pool is already
    /// populated.
    pub(crate) fn populate(&mut self) -> usize {
        if !self.fixed.is_empty() {
            return 0;
        }

        // Link the static records in ascending order in front of whatever
        // overflow records have been freed so far
        let tail = self.first_free;
        for i in 0..N {
            let next_free = if i + 1 < N {
                Some(SlotId((i + 1) as u32))
            } else {
                tail
            };
            self.fixed.push(TimerRecord::new_free(next_free));
        }
        if N > 0 {
            self.first_free = Some(SlotId(0));
        }

        N
    }

    /// Take a record out of the free list, growing the overflow part if the
    /// free list is empty. The returned record is in the `InFlight` state and
    /// must be either queued, handed off, or released before the critical
    /// section ends.
    pub(crate) fn acquire(&mut self, overflow_limit: Option<usize>) -> Result<SlotId, PoolExhausted> {
        if let Some(slot) = self.first_free {
            let record = &mut self[slot];
            let next_free = match record.state {
                TimerState::Free { next_free } => next_free,
                _ => unreachable!("a record in the free list is not free"),
            };
            record.state = TimerState::InFlight;
            self.first_free = next_free;
            return Ok(slot);
        }

        self.grow(overflow_limit)
    }

    #[cfg(feature = "alloc")]
    fn grow(&mut self, overflow_limit: Option<usize>) -> Result<SlotId, PoolExhausted> {
        let len = self.overflow.len();
        if overflow_limit.map_or(false, |limit| len >= limit) {
            log::warn!("acquire: the overflow limit ({}) has been reached", len);
            return Err(PoolExhausted);
        }

        let slot = u32::try_from(N + len).map_err(|_| PoolExhausted)?;
        self.overflow.try_reserve(1).map_err(|_| {
            log::warn!("acquire: failed to allocate an overflow record");
            PoolExhausted
        })?;

        let mut record = TimerRecord::new_free(None);
        record.state = TimerState::InFlight;
        self.overflow.push(record);

        log::debug!(
            "acquire: the pool has grown to {} overflow record(s)",
            len + 1
        );

        Ok(SlotId(slot))
    }

    #[cfg(not(feature = "alloc"))]
    fn grow(&mut self, _overflow_limit: Option<usize>) -> Result<SlotId, PoolExhausted> {
        log::warn!("acquire: the static pool is exhausted");
        Err(PoolExhausted)
    }

    /// Return a record to the free list. The record must not be in the Timer
    /// Queue.
    pub(crate) fn release(&mut self, slot: SlotId) {
        let first_free = self.first_free;
        let record = &mut self[slot];
        debug_assert_eq!(record.state, TimerState::InFlight);
        record.generation = record.generation.wrapping_add(1);
        record.period = 0;
        record.state = TimerState::Free {
            next_free: first_free,
        };
        self.first_free = Some(slot);
    }

    /// Get the record at `slot` if `slot` is in range.
    pub(crate) fn get(&self, slot: SlotId) -> Option<&TimerRecord> {
        let i = slot.index();
        if i < N {
            self.fixed.get(i)
        } else {
            match () {
                #[cfg(feature = "alloc")]
                () => self.overflow.get(i - N),
                #[cfg(not(feature = "alloc"))]
                () => None,
            }
        }
    }

    /// Get the record at `slot` if `slot` is in range.
    pub(crate) fn get_mut(&mut self, slot: SlotId) -> Option<&mut TimerRecord> {
        let i = slot.index();
        if i < N {
            self.fixed.get_mut(i)
        } else {
            match () {
                #[cfg(feature = "alloc")]
                () => self.overflow.get_mut(i - N),
                #[cfg(not(feature = "alloc"))]
                () => None,
            }
        }
    }

    /// Get the non-free record identified by `slot` and `generation`.
    pub(crate) fn lookup_mut(&mut self, slot: SlotId, generation: u32) -> Option<&mut TimerRecord> {
        self.get_mut(slot)
            .filter(|record| record.generation == generation && !record.is_free())
    }

    /// The number of records in the static part, which is `N` once the pool
    /// is populated.
    pub(crate) fn static_len(&self) -> usize {
        self.fixed.len()
    }

    pub(crate) fn overflow_len(&self) -> usize {
        match () {
            #[cfg(feature = "alloc")]
            () => self.overflow.len(),
            #[cfg(not(feature = "alloc"))]
            () => 0,
        }
    }

    /// Iterate through all records.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &TimerRecord> + '_ {
        let overflow = match () {
            #[cfg(feature = "alloc")]
            () => self.overflow.iter(),
            #[cfg(not(feature = "alloc"))]
            () => <&[TimerRecord]>::default().iter(),
        };
        self.fixed.iter().chain(overflow)
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut TimerRecord> + '_ {
        let overflow = match () {
            #[cfg(feature = "alloc")]
            () => self.overflow.iter_mut(),
            #[cfg(not(feature = "alloc"))]
            () => <&mut [TimerRecord]>::default().iter_mut(),
        };
        self.fixed.iter_mut().chain(overflow)
    }
}

impl<const N: usize> ops::Index<SlotId> for TimerPool<N> {
    type Output = TimerRecord;

    #[inline]
    fn index(&self, slot: SlotId) -> &Self::Output {
        let i = slot.index();
        if i < N {
            &self.fixed[i]
        } else {
            match () {
                #[cfg(feature = "alloc")]
                () => &self.overflow[i - N],
                #[cfg(not(feature = "alloc"))]
                () => panic!("slot out of range"),
            }
        }
    }
}

impl<const N: usize> ops::IndexMut<SlotId> for TimerPool<N> {
    #[inline]
    fn index_mut(&mut self, slot: SlotId) -> &mut Self::Output {
        let i = slot.index();
        if i < N {
            &mut self.fixed[i]
        } else {
            match () {
                #[cfg(feature = "alloc")]
                () => &mut self.overflow[i - N],
                #[cfg(not(feature = "alloc"))]
                () => panic!("slot out of range"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_records_first() {
        let mut pool = TimerPool::<3>::new();
        assert_eq!(pool.populate(), 3);
        assert_eq!(pool.populate(), 0);

        let slots: Vec<_> = (0..3).map(|_| pool.acquire(None).unwrap()).collect();
        assert_eq!(slots, [SlotId(0), SlotId(1), SlotId(2)]);
        assert_eq!(pool.overflow_len(), 0);
    }

    #[cfg(feature = "alloc")]
    #[test]
    fn overflow_grows_and_is_reused() {
        let mut pool = TimerPool::<1>::new();
        pool.populate();

        let a = pool.acquire(None).unwrap();
        let b = pool.acquire(None).unwrap();
        assert_eq!(a, SlotId(0));
        assert_eq!(b, SlotId(1));
        assert_eq!(pool.overflow_len(), 1);

        pool.release(b);
        assert_eq!(pool[b].generation, 1);
        assert!(pool[b].is_free());

        // The released overflow record is reused instead of growing further
        assert_eq!(pool.acquire(None).unwrap(), b);
        assert_eq!(pool.overflow_len(), 1);
    }

    #[cfg(feature = "alloc")]
    #[test]
    fn overflow_limit() {
        let mut pool = TimerPool::<1>::new();
        pool.populate();

        assert!(pool.acquire(Some(1)).is_ok());
        assert!(pool.acquire(Some(1)).is_ok());
        assert_eq!(pool.acquire(Some(1)), Err(PoolExhausted));
        assert_eq!(pool.overflow_len(), 1);
    }

    #[cfg(not(feature = "alloc"))]
    #[test]
    fn exhaustion_without_alloc() {
        let mut pool = TimerPool::<1>::new();
        pool.populate();

        assert!(pool.acquire(None).is_ok());
        assert_eq!(pool.acquire(None), Err(PoolExhausted));
    }

    #[test]
    fn stale_generation() {
        let mut pool = TimerPool::<2>::new();
        pool.populate();

        let a = pool.acquire(None).unwrap();
        assert!(pool.lookup_mut(a, 0).is_some());
        pool.release(a);
        assert!(pool.lookup_mut(a, 0).is_none());
        assert!(pool.lookup_mut(a, 1).is_none(), "free records can't be looked up");

        assert_eq!(pool.acquire(None).unwrap(), a);
        assert!(pool.lookup_mut(a, 0).is_none());
        assert!(pool.lookup_mut(a, 1).is_some());
    }

    #[cfg(feature = "alloc")]
    #[test]
    fn populate_after_overflow() {
        let mut pool = TimerPool::<2>::new();

        // An unpopulated pool only has the overflow part
        let a = pool.acquire(None).unwrap();
        assert_eq!(a, SlotId(2));
        pool.release(a);

        pool.populate();
        assert_eq!(pool.iter().filter(|r| r.is_free()).count(), 3);
        let slots: Vec<_> = (0..3).map(|_| pool.acquire(None).unwrap()).collect();
        assert_eq!(slots, [SlotId(0), SlotId(1), SlotId(2)]);
        assert_eq!(pool.overflow_len(), 1);
    }
}

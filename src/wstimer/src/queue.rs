//! Timer Queue: the tick-ordered list of pending timers
//!
//! The queue is an intrusive circular doubly linked list threaded through the
//! records of [`TimerPool`]. The links live in [`TimerState::Queued`], so a
//! record carries links if and only if it's in the queue.
//!
//! The elements are sorted by `launch_time` in the wrap-around-aware order
//! defined in [`crate::ticks`]. Elements with equal `launch_time` are kept in
//! insertion order.
use crate::{
    pool::{SlotId, TimerPool, TimerState},
    ticks::{ticks_before, ticks_before_or_at, Ticks},
};

/// Links to neighbor items.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct Link {
    pub(crate) prev: SlotId,
    pub(crate) next: SlotId,
}

/// Circular linked list header.
#[derive(Debug, Default)]
pub(crate) struct TimerQueue {
    first: Option<SlotId>,
    len: usize,
}

fn link<const N: usize>(pool: &TimerPool<N>, slot: SlotId) -> Link {
    match pool[slot].state {
        TimerState::Queued { link } => link,
        _ => unreachable!("{:?} is not linked", slot),
    }
}

fn link_mut<const N: usize>(pool: &mut TimerPool<N>, slot: SlotId) -> &mut Link {
    match &mut pool[slot].state {
        TimerState::Queued { link } => link,
        _ => unreachable!("{:?} is not linked", slot),
    }
}

impl TimerQueue {
    pub(crate) const fn new() -> Self {
        Self {
            first: None,
            len: 0,
        }
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.first.is_none()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Get the element that comes due first.
    #[inline]
    pub(crate) fn front(&self) -> Option<SlotId> {
        self.first
    }

    /// Insert `item` at the position determined by its `launch_time`, after
    /// all elements due at or before the same tick.
    pub(crate) fn insert<const N: usize>(&mut self, pool: &mut TimerPool<N>, item: SlotId) {
        let at = pool[item].launch_time;
        let pos = self
            .iter(pool)
            .find(|&slot| ticks_before(at, pool[slot].launch_time));
        self.insert_before(pool, item, pos);
    }

    /// Insert `item` before the position `p` (if `at` is `Some(p)`) or to the
    /// list's back (if `at` is `None`).
    fn insert_before<const N: usize>(
        &mut self,
        pool: &mut TimerPool<N>,
        item: SlotId,
        at: Option<SlotId>,
    ) {
        debug_assert_eq!(pool[item].state, TimerState::InFlight, "{:?} is not detached", item);

        if let Some(first) = self.first {
            let next = at.unwrap_or(first);
            let prev = link(pool, next).prev;

            // prev.next = item
            link_mut(pool, prev).next = item;
            // next.prev = item
            link_mut(pool, next).prev = item;
            pool[item].state = TimerState::Queued {
                link: Link { prev, next },
            };

            if at == Some(first) {
                self.first = Some(item);
            }
        } else {
            debug_assert!(at.is_none());

            pool[item].state = TimerState::Queued {
                link: Link {
                    prev: item,
                    next: item,
                },
            };
            self.first = Some(item);
        }

        self.len += 1;
    }

    /// Remove `item` from the queue. `item` is left in the `InFlight` state.
    pub(crate) fn remove<const N: usize>(&mut self, pool: &mut TimerPool<N>, item: SlotId) {
        let Link { prev, next } = link(pool, item);

        if next == item {
            // The list just became empty
            debug_assert_eq!(self.first, Some(item));
            self.first = None;
        } else {
            // link.prev.next = link.next
            link_mut(pool, prev).next = next;
            // link.next.prev = link.prev
            link_mut(pool, next).prev = prev;

            if self.first == Some(item) {
                self.first = Some(next);
            }
        }

        pool[item].state = TimerState::InFlight;
        self.len -= 1;
    }

    /// Remove and return the front element if it's due at or before `now`.
    pub(crate) fn pop_due<const N: usize>(
        &mut self,
        pool: &mut TimerPool<N>,
        now: Ticks,
    ) -> Option<SlotId> {
        let first = self.first?;
        if ticks_before_or_at(pool[first].launch_time, now) {
            self.remove(pool, first);
            Some(first)
        } else {
            None
        }
    }

    /// Iterate through the elements from front to back.
    pub(crate) fn iter<'a, const N: usize>(
        &self,
        pool: &'a TimerPool<N>,
    ) -> impl Iterator<Item = SlotId> + 'a {
        let first = self.first;
        let mut cur = first;
        core::iter::from_fn(move || {
            let slot = cur?;
            let next = link(pool, slot).next;
            cur = if Some(next) == first { None } else { Some(next) };
            Some(slot)
        })
    }
}

//! Timer payloads and the interface to the event subsystem
use core::fmt;

use crate::{pool::SlotId, ticks::Ticks};

/// Identifies a tasklet (the receiver or the sender of an event).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskletId(pub i8);

/// The dispatch priority of an event.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventPriority {
    Low,
    #[default]
    Medium,
    High,
}

/// The event delivered to the receiver tasklet when a timer expires.
///
/// The scheduler doesn't interpret any of the fields except `receiver`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerEvent {
    pub receiver: TaskletId,
    pub sender: TaskletId,
    pub event_id: u8,
    pub event_type: u8,
    pub event_data: u32,
    /// An opaque word owned by the application.
    pub data: usize,
    pub priority: EventPriority,
}

impl TimerEvent {
    /// Construct a `TimerEvent` with the fields not specified by the parameters
    /// set to zero and the priority set to [`EventPriority::Medium`].
    pub const fn new(receiver: TaskletId, event_id: u8, event_type: u8) -> Self {
        Self {
            receiver,
            sender: TaskletId(0),
            event_id,
            event_type,
            event_data: 0,
            data: 0,
            priority: EventPriority::Medium,
        }
    }

    /// Construct an event by setting `data` of `self`.
    pub const fn with_data(self, data: usize) -> Self {
        Self { data, ..self }
    }

    /// Construct an event by setting `priority` of `self`.
    pub const fn with_priority(self, priority: EventPriority) -> Self {
        Self { priority, ..self }
    }

    /// Construct an event by setting `sender` of `self`.
    pub const fn with_sender(self, sender: TaskletId) -> Self {
        Self { sender, ..self }
    }
}

/// A reference to a scheduled timer, returned by the request operations and
/// accepted by [`TimerSys::cancel`].
///
/// A handle stays valid until the timer's record is returned to the pool.
/// After that, operations on the handle fail with `NoAccess` even if the
/// record has been reused for another timer.
///
/// [`TimerSys::cancel`]: crate::TimerSys::cancel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle {
    pub(crate) slot: SlotId,
    pub(crate) generation: u32,
}

/// The proof of an outstanding hand-off, to be presented to
/// [`TimerSys::on_delivery_complete`] exactly once.
///
/// This type is neither `Clone` nor `Copy`, so a token can't be presented more
/// than once.
///
/// [`TimerSys::on_delivery_complete`]: crate::TimerSys::on_delivery_complete
#[must_use = "the timer record is leaked unless the token is returned to the scheduler"]
pub struct DeliveryToken {
    pub(crate) handle: TimerHandle,
}

impl DeliveryToken {
    /// Get the handle of the timer being delivered.
    pub fn handle(&self) -> TimerHandle {
        self.handle
    }
}

impl fmt::Debug for DeliveryToken {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("DeliveryToken").field(&self.handle).finish()
    }
}

/// A due timer handed to the [`EventSink`].
#[derive(Debug)]
pub struct Delivery {
    pub event: TimerEvent,
    /// The tick at which this occurrence was due.
    pub launch_time: Ticks,
    pub token: DeliveryToken,
}

/// The registry of live tasklets.
pub trait TaskRegistry {
    /// Return a flag indicating whether `id` identifies an existing tasklet.
    ///
    /// This method is called with CPU Lock active. It must not have side
    /// effects.
    fn is_tasklet_valid(&self, id: TaskletId) -> bool;
}

/// Receives due timers from the scheduler.
///
/// An implementation is expected to queue the delivery, invoke the receiver's
/// handler at some later point, and then return the token through
/// [`TimerSys::on_delivery_complete`].
///
/// [`TimerSys::on_delivery_complete`]: crate::TimerSys::on_delivery_complete
pub trait EventSink: TaskRegistry {
    /// Accept a due timer.
    ///
    /// This method is called with CPU Lock active. It must not block or call
    /// back into the scheduler.
    fn send_timer_event(&mut self, delivery: Delivery);
}

//! A minimal tasklet-based event loop
use slab::Slab;
use spin::Mutex as SpinMutex;
use std::{collections::VecDeque, fmt, thread, time::Duration, time::Instant};
use wstimer::{
    lock_cpu, CompleteDeliveryError, Delivery, EventPriority, EventSink, PortThreading,
    TaskRegistry, TaskletId, Ticks, TimerEvent, TimerSys,
};

/// The event handler of a tasklet. Receives the event and the tick at which
/// the timer was due.
pub type TaskletHandler = Box<dyn FnMut(&TimerEvent, Ticks) + Send>;

/// A tasklet registry and an [`EventSink`] that dispatches deliveries to
/// tasklet handlers in priority order.
///
/// Deliveries are queued by [`LoopSink`] (obtained by [`Self::sink`]) and
/// dispatched by [`Self::run_once`], which calls the receiver's handler
/// without holding any locks and then returns the delivery token to the
/// scheduler.
///
/// A tasklet handles one event at a time. Deliveries for a tasklet whose
/// handler is running stay queued in their original order.
pub struct EventLoop {
    inner: SpinMutex<Inner>,
}

struct Inner {
    tasklets: Slab<Tasklet>,
    /// The serial number to assign to the next registered tasklet.
    next_serial: u64,
    /// Pending deliveries, indexed by [`priority_index`].
    queues: [VecDeque<Delivery>; 3],
}

struct Tasklet {
    /// Distinguishes this registration from earlier ones that used the same
    /// slab key.
    serial: u64,
    /// `None` while the handler is running.
    handler: Option<TaskletHandler>,
}

/// Map a priority to an index into `Inner::queues`. Lower indices are
/// dispatched first.
fn priority_index(priority: EventPriority) -> usize {
    match priority {
        EventPriority::High => 0,
        EventPriority::Medium => 1,
        EventPriority::Low => 2,
    }
}

fn tasklet_key(id: TaskletId) -> Option<usize> {
    usize::try_from(id.0).ok()
}

impl EventLoop {
    pub fn new() -> Self {
        Self {
            inner: SpinMutex::new(Inner {
                tasklets: Slab::new(),
                next_serial: 0,
                queues: Default::default(),
            }),
        }
    }

    /// Register a tasklet. Returns `None` if all tasklet IDs are in use.
    pub fn register_tasklet(&self, handler: TaskletHandler) -> Option<TaskletId> {
        let mut inner = self.inner.lock();
        let serial = inner.next_serial;
        let entry = inner.tasklets.vacant_entry();
        let id = TaskletId(i8::try_from(entry.key()).ok()?);
        entry.insert(Tasklet {
            serial,
            handler: Some(handler),
        });
        inner.next_serial += 1;
        log::debug!("register_tasklet: {:?}", id);
        Some(id)
    }

    /// Unregister a tasklet. Returns `Ok(false)` if `id` doesn't identify a
    /// registered tasklet.
    ///
    /// The tasklet's timers in `sys` are cancelled, and its pending
    /// deliveries are completed without calling any handler, so that nothing
    /// meant for it reaches a tasklet that is registered later with the same
    /// ID.
    pub fn unregister_tasklet<Traits: PortThreading, const N: usize>(
        &self,
        sys: &TimerSys<Traits, N>,
        id: TaskletId,
    ) -> Result<bool, CompleteDeliveryError> {
        let Some(key) = tasklet_key(id) else {
            return Ok(false);
        };

        let orphans: Vec<Delivery> = {
            // The registry and the Timer Queue are updated under CPU Lock so
            // that no request can slip in between
            let mut lock = lock_cpu::<Traits>()?;
            let orphans = {
                let mut inner = self.inner.lock();
                if inner.tasklets.try_remove(key).is_none() {
                    return Ok(false);
                }
                let mut orphans = Vec::new();
                for queue in inner.queues.iter_mut() {
                    let (mine, others): (VecDeque<_>, VecDeque<_>) = queue
                        .drain(..)
                        .partition(|delivery: &Delivery| delivery.event.receiver == id);
                    *queue = others;
                    orphans.extend(mine);
                }
                orphans
            };
            sys.cancel_receiver(lock.borrow_mut(), id);
            orphans
        };

        log::debug!(
            "unregister_tasklet: {:?} ({} pending deliveries dropped)",
            id,
            orphans.len()
        );

        for delivery in orphans {
            sys.on_delivery_complete(&mut self.sink(), delivery.token)?;
        }

        Ok(true)
    }

    /// Get an [`EventSink`] that queues deliveries into `self`.
    pub fn sink(&self) -> LoopSink<'_> {
        LoopSink { event_loop: self }
    }

    /// The number of pending deliveries.
    pub fn pending(&self) -> usize {
        self.inner.lock().queues.iter().map(VecDeque::len).sum()
    }

    /// Dispatch the oldest delivery of the highest priority whose receiver
    /// isn't busy, if any. Returns `Ok(true)` if a delivery was dispatched.
    ///
    /// Returns `Ok(false)` if every pending delivery is for a tasklet whose
    /// handler is running (e.g., when called from inside a handler). Those
    /// deliveries are dispatched by a later call.
    pub fn run_once<Traits: PortThreading, const N: usize>(
        &self,
        sys: &TimerSys<Traits, N>,
    ) -> Result<bool, CompleteDeliveryError> {
        let (delivery, handler) = {
            let mut inner = self.inner.lock();
            let Inner {
                tasklets, queues, ..
            } = &mut *inner;

            let is_ready = |delivery: &Delivery| {
                tasklet_key(delivery.event.receiver)
                    .and_then(|key| tasklets.get(key))
                    .map_or(true, |tasklet| tasklet.handler.is_some())
            };
            let Some(delivery) = queues.iter_mut().find_map(|queue| {
                let i = queue.iter().position(is_ready)?;
                queue.remove(i)
            }) else {
                return Ok(false);
            };

            let handler = tasklet_key(delivery.event.receiver)
                .and_then(|key| tasklets.get_mut(key))
                .and_then(|tasklet| Some((tasklet.serial, tasklet.handler.take()?)));
            (delivery, handler)
        };

        let Delivery {
            event,
            launch_time,
            token,
        } = delivery;

        if let Some((serial, mut handler)) = handler {
            log::trace!("run_once: dispatching {:?} (launch_time = {})", event, launch_time);
            handler(&event, launch_time);

            // Put the handler back unless the tasklet was unregistered
            // meanwhile
            let mut inner = self.inner.lock();
            if let Some(tasklet) = tasklet_key(event.receiver)
                .and_then(|key| inner.tasklets.get_mut(key))
                .filter(|tasklet| tasklet.serial == serial)
            {
                tasklet.handler = Some(handler);
            }
        } else {
            log::warn!("run_once: {:?} has no receiver; dropped", event);
        }

        sys.on_delivery_complete(&mut self.sink(), token)?;
        Ok(true)
    }

    /// Keep dispatching deliveries until `duration` elapses. Returns the
    /// number of dispatched deliveries.
    pub fn run_for<Traits: PortThreading, const N: usize>(
        &self,
        sys: &TimerSys<Traits, N>,
        duration: Duration,
    ) -> Result<usize, CompleteDeliveryError> {
        let deadline = Instant::now() + duration;
        let mut count = 0;
        while Instant::now() < deadline {
            if self.run_once(sys)? {
                count += 1;
            } else {
                thread::sleep(Duration::from_millis(1));
            }
        }
        Ok(count)
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("EventLoop")
            .field("tasklets", &inner.tasklets.len())
            .field("queues", &inner.queues)
            .finish()
    }
}

/// The [`EventSink`] of an [`EventLoop`].
#[derive(Debug, Clone, Copy)]
pub struct LoopSink<'a> {
    event_loop: &'a EventLoop,
}

impl TaskRegistry for LoopSink<'_> {
    fn is_tasklet_valid(&self, id: TaskletId) -> bool {
        let inner = self.event_loop.inner.lock();
        tasklet_key(id).map_or(false, |key| inner.tasklets.contains(key))
    }
}

impl EventSink for LoopSink<'_> {
    fn send_timer_event(&mut self, delivery: Delivery) {
        let mut inner = self.event_loop.inner.lock();
        inner.queues[priority_index(delivery.event.priority)].push_back(delivery);
    }
}

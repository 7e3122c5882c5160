//! Hosted environment for the `wstimer` scheduler.
//!
//! This crate provides the pieces needed to run [`wstimer::TimerSys`] as an
//! ordinary process:
//!
//!  - [`use_port!`] defines a traits type whose CPU Lock is a thread-aware
//!    critical section.
//!  - [`EventLoop`] is a tasklet registry and event sink that dispatches
//!    due timers to per-tasklet handlers.
//!  - [`TickSource`] is a thread that advances the tick counter in real time.
//!
//! ```ignore
//! wstimer_port_std::use_port!(unsafe struct SystemTraits);
//!
//! static TIMER_SYS: TimerSys<SystemTraits> = TimerSys::new(TimerSysCfg::new());
//! ```
#![deny(unsafe_op_in_unsafe_fn)]
use spin::Mutex as SpinMutex;
use std::thread::{self, ThreadId};

mod event_loop;
mod tick_source;

pub use self::{
    event_loop::{EventLoop, LoopSink, TaskletHandler},
    tick_source::TickSource,
};

/// Used by `use_port!`
#[doc(hidden)]
pub extern crate wstimer;
/// Used by `use_port!`
#[doc(hidden)]
pub extern crate env_logger;

/// The internal state of the port.
///
/// # Safety
///
/// For the safety information of this type's methods, see the documentation of
/// the corresponding methods of [`wstimer::PortThreading`].
#[doc(hidden)]
pub struct State {
    /// The thread holding CPU Lock.
    cpu_lock_owner: SpinMutex<Option<ThreadId>>,
}

#[allow(clippy::missing_safety_doc)]
impl State {
    pub const fn new() -> Self {
        Self {
            cpu_lock_owner: SpinMutex::new(None),
        }
    }

    pub unsafe fn try_enter_cpu_lock(&self) -> bool {
        let current = thread::current().id();
        loop {
            let mut owner = self.cpu_lock_owner.lock();
            match *owner {
                None => {
                    *owner = Some(current);
                    log::trace!("enter_cpu_lock");
                    return true;
                }
                Some(id) if id == current => return false,
                Some(_) => {
                    // Another thread is in the critical section
                    drop(owner);
                    thread::yield_now();
                }
            }
        }
    }

    pub unsafe fn leave_cpu_lock(&self) {
        log::trace!("leave_cpu_lock");
        let mut owner = self.cpu_lock_owner.lock();
        assert_eq!(*owner, Some(thread::current().id()));
        *owner = None;
    }

    pub fn is_cpu_lock_active(&self) -> bool {
        *self.cpu_lock_owner.lock() == Some(thread::current().id())
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

/// Define a traits type and implement [`wstimer::PortThreading`] on it.
///
/// The generated CPU Lock can be held by at most one thread at a time. A
/// thread trying to enter it while another thread holds it waits until it's
/// released.
///
/// # Safety
///
/// The `unsafe` keyword acknowledges that the traits type must be the only
/// implementor of CPU Lock for the `TimerSys` instances it's used with.
#[macro_export]
macro_rules! use_port {
    (unsafe $vis:vis struct $Traits:ident) => {
        $vis struct $Traits;

        mod port_std_impl {
            use super::$Traits;
            use $crate::wstimer::PortThreading;
            use $crate::State;

            pub(super) static PORT_STATE: State = State::new();

            unsafe impl PortThreading for $Traits {
                unsafe fn try_enter_cpu_lock() -> bool {
                    unsafe { PORT_STATE.try_enter_cpu_lock() }
                }

                unsafe fn leave_cpu_lock() {
                    unsafe { PORT_STATE.leave_cpu_lock() }
                }

                fn is_cpu_lock_active() -> bool {
                    PORT_STATE.is_cpu_lock_active()
                }
            }
        }
    };
}

//! A tick-driven timer/event scheduler for event-loop based network stacks.
//!
//! Application code requests timers through [`TimerSys`]. A tick source calls
//! [`TimerSys::on_tick_advance`] as time passes, which hands every due timer
//! to an [`EventSink`]. The sink dispatches the timer's event and then
//! returns the [`DeliveryToken`] through [`TimerSys::on_delivery_complete`],
//! which releases a one-shot timer or rearms a periodic one.
//!
//! All scheduler state is guarded by a critical section (*CPU Lock*) provided
//! by a port through [`PortThreading`].
//!
//! # Cargo features
//!
//!  - **`alloc`** (enabled by default): Allocate additional timer records from
//!    the heap when the statically allocated ones run out. Without this
//!    feature, requests fail with [`ResultCode::ResourceExhausted`] instead.
#![cfg_attr(not(test), no_std)] // Link `std` only when building a test (`cfg(test)`)

#[cfg(feature = "alloc")]
extern crate alloc;

mod cfg;
mod error;
mod event;
mod klock;
mod pool;
mod port;
mod queue;
pub mod ticks;
mod timer_sys;

pub use self::{
    cfg::{TimerSysCfg, DEFAULT_STATIC_TIMERS},
    error::{CancelTimerError, CompleteDeliveryError, CpuLockError, RequestTimerError, ResultCode},
    event::{
        Delivery, DeliveryToken, EventPriority, EventSink, TaskRegistry, TaskletId, TimerEvent,
        TimerHandle,
    },
    klock::{lock_cpu, CpuLockGuard, CpuLockTokenRefMut},
    port::PortThreading,
    ticks::Ticks,
    timer_sys::{PoolStats, TimerSys},
};

#[doc(hidden)]
pub use self::klock::{CpuLockKeyhole, CpuLockTag, CpuLockToken};

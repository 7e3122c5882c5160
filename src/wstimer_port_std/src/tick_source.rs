//! The real-time tick source
use std::{
    io,
    sync::mpsc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use wstimer::{PortThreading, Ticks, TimerSys};

use crate::EventLoop;

/// A thread that advances the tick counter of a [`TimerSys`] in real time.
///
/// The thread wakes up once per tick period and converts the wall-clock time
/// elapsed since it started to whole ticks. If it wakes up late, the missed
/// ticks are passed to [`TimerSys::on_tick_advance`] in one call, so no tick
/// is lost. Due timers are queued into the given [`EventLoop`].
///
/// The thread is stopped by [`Self::stop`] or when `TickSource` is dropped.
#[derive(Debug)]
pub struct TickSource {
    stop_send: Option<mpsc::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl TickSource {
    /// Start a tick source thread for `sys`.
    pub fn spawn<Traits: PortThreading, const N: usize>(
        sys: &'static TimerSys<Traits, N>,
        event_loop: &'static EventLoop,
    ) -> io::Result<Self> {
        let period = Duration::from_millis(sys.cfg().tick_period_ms().into());
        let (stop_send, stop_recv) = mpsc::channel::<()>();

        log::trace!("starting the tick source thread (period = {:?})", period);
        let join_handle = thread::Builder::new()
            .name("tick source".into())
            .spawn(move || {
                let origin = Instant::now();
                let mut ticks_seen: u64 = 0;
                loop {
                    match stop_recv.recv_timeout(period) {
                        Err(mpsc::RecvTimeoutError::Timeout) => {}
                        // A stop request or the sender was dropped
                        Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    }

                    let elapsed = whole_ticks(origin.elapsed(), period);
                    let delta = elapsed - ticks_seen;
                    if delta == 0 {
                        continue;
                    }
                    ticks_seen = elapsed;

                    if delta > 1 {
                        log::debug!("tick source: catching up {} ticks", delta);
                    }

                    let delta = Ticks::try_from(delta).unwrap_or(Ticks::MAX);
                    if let Err(e) = sys.on_tick_advance(&mut event_loop.sink(), delta) {
                        log::warn!("tick source: on_tick_advance failed: {:?}", e);
                    }
                }
                log::trace!("the tick source thread is exiting");
            })?;

        Ok(Self {
            stop_send: Some(stop_send),
            join_handle: Some(join_handle),
        })
    }

    /// Stop the thread and wait for it to exit.
    pub fn stop(mut self) -> thread::Result<()> {
        self.stop_inner()
    }

    fn stop_inner(&mut self) -> thread::Result<()> {
        // `stop_recv.recv_timeout` returns `Err(Disconnected)` when we drop
        // the sender
        self.stop_send = None;
        match self.join_handle.take() {
            Some(join_handle) => join_handle.join(),
            None => Ok(()),
        }
    }
}

/// The number of whole tick periods in `elapsed`, saturating at `u64::MAX`.
fn whole_ticks(elapsed: Duration, period: Duration) -> u64 {
    u64::try_from(elapsed.as_nanos() / period.as_nanos()).unwrap_or(u64::MAX)
}

impl Drop for TickSource {
    fn drop(&mut self) {
        if let Err(e) = self.stop_inner() {
            if !thread::panicking() {
                std::panic::resume_unwind(e);
            }
        }
    }
}

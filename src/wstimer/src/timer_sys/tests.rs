use super::*;
use crate::{
    event::{EventPriority, TaskRegistry},
    ticks::ticks_before,
};
use quickcheck_macros::quickcheck;
use std::cell::Cell;

/// A port whose CPU Lock is a per-thread flag. Each test owns its `TimerSys`,
/// so the threads of the test harness never share scheduler state.
struct TestTraits;

std::thread_local! {
    static CPU_LOCK: Cell<bool> = Cell::new(false);
}

unsafe impl PortThreading for TestTraits {
    unsafe fn try_enter_cpu_lock() -> bool {
        CPU_LOCK.with(|l| !l.replace(true))
    }

    unsafe fn leave_cpu_lock() {
        CPU_LOCK.with(|l| {
            debug_assert!(l.get());
            l.set(false);
        })
    }

    fn is_cpu_lock_active() -> bool {
        CPU_LOCK.with(|l| l.get())
    }
}

type Sys<const N: usize> = TimerSys<TestTraits, N>;

#[derive(Default)]
struct RecordingSink {
    deliveries: Vec<Delivery>,
    dead: Vec<TaskletId>,
}

impl RecordingSink {
    fn take(&mut self) -> Vec<Delivery> {
        std::mem::take(&mut self.deliveries)
    }

    fn take_one(&mut self) -> Delivery {
        let mut deliveries = self.take();
        assert_eq!(deliveries.len(), 1, "{:?}", deliveries);
        deliveries.pop().unwrap()
    }
}

impl TaskRegistry for RecordingSink {
    fn is_tasklet_valid(&self, id: TaskletId) -> bool {
        id.0 >= 0 && !self.dead.contains(&id)
    }
}

impl EventSink for RecordingSink {
    fn send_timer_event(&mut self, delivery: Delivery) {
        log::trace!("    sink ← {:?}", delivery);
        self.deliveries.push(delivery);
    }
}

fn new_sys<const N: usize>(cfg: TimerSysCfg) -> Sys<N> {
    let _ = env_logger::builder().is_test(true).try_init();
    let sys = Sys::<N>::new(cfg);
    sys.init().unwrap();
    sys
}

fn event(tag: usize) -> TimerEvent {
    TimerEvent::new(TaskletId(1), 7, 0).with_data(tag)
}

/// Check the structural invariants of the scheduler state.
fn check_invariants<const N: usize>(sys: &Sys<N>) {
    let lock = lock_cpu::<TestTraits>().unwrap();
    let state = sys.state.read(&*lock);

    let queued: Vec<Ticks> = state
        .queue
        .iter(&state.pool)
        .map(|slot| state.pool[slot].launch_time)
        .collect();
    log::trace!("[queue: {:?}, now = {}]", queued, state.ticks);

    assert_eq!(queued.len(), state.queue.len());
    for pair in queued.windows(2) {
        assert!(!ticks_before(pair[1], pair[0]), "queue is unsorted: {:?}", queued);
    }
    // Due timers never stay in the queue
    for &at in &queued {
        assert!(ticks_before(state.ticks, at), "{} is overdue: {:?}", at, queued);
    }

    let total = state.pool.static_len() + state.pool.overflow_len();
    assert_eq!(total, state.pool.iter().count());
}

#[test]
fn scenario_periodic_with_catch_up() {
    let sys = new_sys::<6>(TimerSysCfg::new());
    let mut sink = RecordingSink::default();

    let handle = sys.request_every(&mut sink, event(0), 200).unwrap();
    assert!(sink.deliveries.is_empty());
    assert_eq!(sys.shortest_active_timer().unwrap(), Some(200));

    sys.on_tick_advance(&mut sink, 4).unwrap();
    let d = sink.take_one();
    assert_eq!(d.launch_time, 4);
    assert_eq!(d.token.handle(), handle);
    assert_eq!(sys.stats().unwrap().in_flight, 1);

    sys.on_delivery_complete(&mut sink, d.token).unwrap();
    assert!(sink.deliveries.is_empty());
    assert_eq!(sys.stats().unwrap().queued, 1);
    assert_eq!(sys.shortest_active_timer().unwrap(), Some(200));
    check_invariants(&sys);

    sys.on_tick_advance(&mut sink, 10).unwrap();
    assert_eq!(sys.ticks().unwrap(), 14);
    let d = sink.take_one();
    assert_eq!(d.launch_time, 8);

    // `12` is already due, so it's handed off again right away
    sys.on_delivery_complete(&mut sink, d.token).unwrap();
    let d = sink.take_one();
    assert_eq!(d.launch_time, 12);

    sys.on_delivery_complete(&mut sink, d.token).unwrap();
    assert!(sink.deliveries.is_empty());
    assert_eq!(sys.shortest_active_timer().unwrap(), Some(100));
    check_invariants(&sys);
}

#[test]
fn fifo_ties() {
    let sys = new_sys::<6>(TimerSysCfg::new());
    let mut sink = RecordingSink::default();

    for tag in 0..5 {
        sys.request_at(&mut sink, event(tag), 3, 0).unwrap();
    }
    sys.request_at(&mut sink, event(99), 2, 0).unwrap();
    check_invariants(&sys);

    sys.on_tick_advance(&mut sink, 3).unwrap();
    let tags: Vec<usize> = sink.take().iter().map(|d| d.event.data).collect();
    assert_eq!(tags, [99, 0, 1, 2, 3, 4]);
}

#[test]
fn wraparound() {
    let sys = new_sys::<6>(TimerSysCfg::new());
    let mut sink = RecordingSink::default();

    sys.on_tick_advance(&mut sink, u32::MAX - 4).unwrap();
    sys.request_in(&mut sink, event(0), 10, 0).unwrap();
    // This one is due later despite its smaller absolute value
    sys.request_in(&mut sink, event(1), 12, 0).unwrap();
    check_invariants(&sys);

    for _ in 0..9 {
        sys.on_tick_advance(&mut sink, 1).unwrap();
        assert!(sink.deliveries.is_empty());
    }
    sys.on_tick_advance(&mut sink, 1).unwrap();
    let d = sink.take_one();
    assert_eq!(d.event.data, 0);
    assert_eq!(d.launch_time, 5);
    assert_eq!(sys.ticks().unwrap(), 5);
    check_invariants(&sys);

    sys.on_tick_advance(&mut sink, 2).unwrap();
    assert_eq!(sink.take_one().launch_time, 7);
}

#[test]
fn overdue_at_request() {
    let sys = new_sys::<6>(TimerSysCfg::new());
    let mut sink = RecordingSink::default();

    sys.on_tick_advance(&mut sink, 100).unwrap();
    sys.request_at(&mut sink, event(0), 100, 0).unwrap();
    sys.request_at(&mut sink, event(1), 90, 0).unwrap();

    let tags: Vec<usize> = sink.deliveries.iter().map(|d| d.event.data).collect();
    assert_eq!(tags, [0, 1]);

    let stats = sys.stats().unwrap();
    assert_eq!(stats.in_flight, 2);
    assert_eq!(stats.queued, 0);

    for d in sink.take() {
        sys.on_delivery_complete(&mut sink, d.token).unwrap();
    }
    assert_eq!(sys.stats().unwrap().free, 6);
}

#[test]
fn invalid_receiver_consumes_nothing() {
    let sys = new_sys::<1>(TimerSysCfg::new());
    let mut sink = RecordingSink::default();
    sink.dead.push(TaskletId(1));

    let before = sys.stats().unwrap();
    assert_eq!(
        sys.request_in(&mut sink, event(0), 1, 0),
        Err(RequestTimerError::InvalidReceiver)
    );
    assert_eq!(
        sys.request_once(&mut sink, 1, 2, TaskletId(-1), 50),
        Err(RequestTimerError::InvalidReceiver)
    );
    assert_eq!(sys.stats().unwrap(), before);
    assert_eq!(before.overflow_allocated, 0);
}

#[test]
fn cancel_queued() {
    let sys = new_sys::<6>(TimerSysCfg::new());
    let mut sink = RecordingSink::default();

    let a = sys.request_in(&mut sink, event(0), 2, 0).unwrap();
    let b = sys.request_in(&mut sink, event(1), 2, 3).unwrap();
    sys.cancel_timer(a).unwrap();
    {
        let mut lock = lock_cpu::<TestTraits>().unwrap();
        sys.cancel(lock.borrow_mut(), b).unwrap();
    }
    check_invariants(&sys);

    assert_eq!(sys.stats().unwrap().free, 6);
    assert_eq!(sys.shortest_active_timer().unwrap(), None);

    sys.on_tick_advance(&mut sink, 100).unwrap();
    assert!(sink.deliveries.is_empty());

    // The handles are stale now
    assert_eq!(sys.cancel_timer(a), Err(CancelTimerError::NoAccess));
    assert_eq!(sys.cancel_timer(b), Err(CancelTimerError::NoAccess));
}

#[test]
fn cancel_in_flight_periodic() {
    let sys = new_sys::<6>(TimerSysCfg::new());
    let mut sink = RecordingSink::default();

    let handle = sys.request_in(&mut sink, event(0), 4, 4).unwrap();
    sys.on_tick_advance(&mut sink, 4).unwrap();
    let d = sink.take_one();

    // The delivery in progress can't be retracted
    sys.cancel_timer(handle).unwrap();
    assert_eq!(sys.stats().unwrap().in_flight, 1);

    sys.on_delivery_complete(&mut sink, d.token).unwrap();
    assert_eq!(sys.stats().unwrap().free, 6);

    sys.on_tick_advance(&mut sink, 100).unwrap();
    assert!(sink.deliveries.is_empty());
}

#[test]
fn cancel_event_matches_first() {
    let sys = new_sys::<6>(TimerSysCfg::new());
    let mut sink = RecordingSink::default();

    sys.request_once(&mut sink, 5, 0, TaskletId(2), 100).unwrap();
    sys.request_once(&mut sink, 5, 0, TaskletId(3), 150).unwrap();
    sys.request_once(&mut sink, 5, 0, TaskletId(3), 200).unwrap();

    {
        let mut lock = lock_cpu::<TestTraits>().unwrap();
        assert!(sys.cancel_event(lock.borrow_mut(), 5, TaskletId(3)));
        assert!(!sys.cancel_event(lock.borrow_mut(), 6, TaskletId(3)));
        assert!(!sys.cancel_event(lock.borrow_mut(), 5, TaskletId(4)));
    }
    check_invariants(&sys);

    sys.on_tick_advance(&mut sink, 4).unwrap();
    let launch_times: Vec<Ticks> = sink.take().iter().map(|d| d.launch_time).collect();
    assert_eq!(launch_times, [2, 4]);
}

#[test]
fn cancel_receiver_queued_and_in_flight() {
    let sys = new_sys::<6>(TimerSysCfg::new());
    let mut sink = RecordingSink::default();

    let periodic = TimerEvent::new(TaskletId(3), 1, 0);
    sys.request_in(&mut sink, periodic, 1, 2).unwrap();
    sys.request_once(&mut sink, 2, 0, TaskletId(3), 200).unwrap();
    sys.request_once(&mut sink, 3, 0, TaskletId(2), 200).unwrap();
    sys.request_once(&mut sink, 4, 0, TaskletId(3), 250).unwrap();

    sys.on_tick_advance(&mut sink, 1).unwrap();
    let in_flight = sink.take_one();
    assert_eq!(in_flight.event.receiver, TaskletId(3));

    {
        let mut lock = lock_cpu::<TestTraits>().unwrap();
        assert_eq!(sys.cancel_receiver(lock.borrow_mut(), TaskletId(3)), 3);
        assert_eq!(sys.cancel_receiver(lock.borrow_mut(), TaskletId(3)), 1);
    }
    check_invariants(&sys);

    let stats = sys.stats().unwrap();
    assert_eq!((stats.queued, stats.in_flight), (1, 1));

    // The in-flight periodic timer isn't rearmed
    sys.on_delivery_complete(&mut sink, in_flight.token).unwrap();
    sys.on_tick_advance(&mut sink, 10).unwrap();
    let receivers: Vec<TaskletId> = sink.take().iter().map(|d| d.event.receiver).collect();
    assert_eq!(receivers, [TaskletId(2)]);
}

#[test]
fn request_once_event_fields() {
    let sys = new_sys::<6>(TimerSysCfg::new());
    let mut sink = RecordingSink::default();

    sys.request_once(&mut sink, 3, 9, TaskletId(4), 50).unwrap();
    sys.on_tick_advance(&mut sink, 1).unwrap();
    let d = sink.take_one();
    assert_eq!(
        d.event,
        TimerEvent {
            receiver: TaskletId(4),
            sender: TaskletId(0),
            event_id: 3,
            event_type: 9,
            event_data: 0,
            data: 0,
            priority: EventPriority::Medium,
        }
    );
    sys.on_delivery_complete(&mut sink, d.token).unwrap();
}

#[test]
#[should_panic(expected = "not a positive multiple")]
fn request_every_rejects_fraction() {
    let sys = new_sys::<6>(TimerSysCfg::new());
    let mut sink = RecordingSink::default();
    let _ = sys.request_every(&mut sink, event(0), 120);
}

#[test]
#[should_panic(expected = "not a positive multiple")]
fn request_once_rejects_zero() {
    let sys = new_sys::<6>(TimerSysCfg::new());
    let mut sink = RecordingSink::default();
    let _ = sys.request_once(&mut sink, 0, 0, TaskletId(1), 0);
}

#[test]
fn stale_token_and_handle() {
    let sys = new_sys::<1>(TimerSysCfg::new().with_overflow_limit(Some(0)));
    let mut sink = RecordingSink::default();

    let first = sys.request_in(&mut sink, event(0), 1, 0).unwrap();
    sys.on_tick_advance(&mut sink, 1).unwrap();
    let d = sink.take_one();
    sys.on_delivery_complete(&mut sink, d.token).unwrap();

    // The only record is reused
    let second = sys.request_in(&mut sink, event(1), 1, 0).unwrap();
    assert_ne!(first, second);
    assert_eq!(sys.cancel_timer(first), Err(CancelTimerError::NoAccess));
    assert_eq!(sys.stats().unwrap().queued, 1);

    // A forged token for the old generation is rejected too
    let forged = DeliveryToken { handle: first };
    assert_eq!(
        sys.on_delivery_complete(&mut sink, forged),
        Err(CompleteDeliveryError::NoAccess)
    );
    // So is a token for a queued timer
    let forged = DeliveryToken { handle: second };
    assert_eq!(
        sys.on_delivery_complete(&mut sink, forged),
        Err(CompleteDeliveryError::NoAccess)
    );
    check_invariants(&sys);
}

#[test]
fn overflow_limit() {
    let sys = new_sys::<1>(TimerSysCfg::new().with_overflow_limit(Some(1)));
    let mut sink = RecordingSink::default();

    sys.request_in(&mut sink, event(0), 1, 0).unwrap();
    sys.request_in(&mut sink, event(1), 2, 0).unwrap();
    let before = sys.stats().unwrap();
    assert_eq!(
        sys.request_in(&mut sink, event(2), 3, 0),
        Err(RequestTimerError::ResourceExhausted)
    );
    assert_eq!(sys.stats().unwrap(), before);
    assert_eq!(before.overflow_allocated, 1);

    sys.on_tick_advance(&mut sink, 1).unwrap();
    let d = sink.take_one();
    sys.on_delivery_complete(&mut sink, d.token).unwrap();

    // A record is free again
    sys.request_in(&mut sink, event(2), 3, 0).unwrap();
}

#[cfg(feature = "alloc")]
#[test]
fn pool_grows_without_limit() {
    let sys = new_sys::<2>(TimerSysCfg::new());
    let mut sink = RecordingSink::default();

    for tag in 0..10 {
        sys.request_in(&mut sink, event(tag), 1 + tag as Ticks, 0).unwrap();
    }
    let stats = sys.stats().unwrap();
    assert_eq!(stats.static_capacity, 2);
    assert_eq!(stats.overflow_allocated, 8);
    assert_eq!(stats.queued, 10);
    check_invariants(&sys);
}

#[test]
fn bad_context() {
    let sys = new_sys::<6>(TimerSysCfg::new());
    let mut sink = RecordingSink::default();
    let handle = sys.request_in(&mut sink, event(0), 1, 0).unwrap();

    let mut lock = lock_cpu::<TestTraits>().unwrap();
    assert_eq!(lock_cpu::<TestTraits>().unwrap_err(), CpuLockError::BadContext);
    assert_eq!(sys.ticks(), Err(CpuLockError::BadContext));
    assert_eq!(
        sys.request_in(&mut sink, event(1), 1, 0),
        Err(RequestTimerError::BadContext)
    );
    assert_eq!(sys.cancel_timer(handle), Err(CancelTimerError::BadContext));
    assert_eq!(sys.on_tick_advance(&mut sink, 1), Err(CpuLockError::BadContext));

    // The `_locked` variants compose with the held lock
    let second = sys
        .request_at_locked(lock.borrow_mut(), &mut sink, event(1), 5, 0)
        .unwrap();
    sys.cancel(lock.borrow_mut(), second).unwrap();
    drop(lock);

    assert_eq!(sys.stats().unwrap().queued, 1);
}

#[test]
fn reinit_is_ignored() {
    let sys = new_sys::<3>(TimerSysCfg::new());
    let mut sink = RecordingSink::default();
    sys.request_in(&mut sink, event(0), 1, 0).unwrap();

    sys.init().unwrap();
    let stats = sys.stats().unwrap();
    assert_eq!(stats.static_capacity, 3);
    assert_eq!(stats.queued, 1);
    assert_eq!(stats.free, 2);
}

#[test]
fn debug_output() {
    let sys = new_sys::<1>(TimerSysCfg::new());
    let text = format!("{:?}", sys);
    assert!(text.starts_with("TimerSys"), "{}", text);
    assert!(text.contains("CpuLockCell("), "{}", text);

    let _lock = lock_cpu::<TestTraits>().unwrap();
    let text = format!("{:?}", sys);
    assert!(text.contains("< locked >"), "{}", text);
}

/// A modifying operation on `TimerSys`.
#[derive(Debug)]
enum Cmd {
    Request { delay: Ticks, period: Ticks },
    Advance(Ticks),
    Complete(usize),
    Cancel(usize),
}

/// Map random bytes to operations on `TimerSys`.
fn interpret(bytecode: &[u8]) -> impl Iterator<Item = Cmd> + '_ {
    bytecode.chunks_exact(3).map(|instr| match instr[0] % 4 {
        0 => Cmd::Request {
            delay: (instr[1] % 32) as Ticks,
            period: if instr[2] % 3 == 0 {
                (instr[2] % 8) as Ticks
            } else {
                0
            },
        },
        1 => Cmd::Advance((instr[1] % 8) as Ticks),
        2 => Cmd::Complete(instr[1] as usize),
        _ => Cmd::Cancel(instr[1] as usize),
    })
}

/// The reference model of one requested timer.
#[derive(Debug)]
struct ModelTimer {
    next_due: Ticks,
    period: Ticks,
    one_shot: bool,
    cancelled: bool,
    /// The record hasn't been released.
    live: bool,
    in_flight: bool,
    deliveries: usize,
}

struct Harness {
    sys: Sys<4>,
    sink: RecordingSink,
    now: Ticks,
    model: Vec<ModelTimer>,
    handles: Vec<(TimerHandle, usize)>,
    outstanding: Vec<Delivery>,
}

impl Harness {
    /// Validate the new deliveries against the model and keep them until they
    /// are completed.
    fn collect_deliveries(&mut self) {
        for d in self.sink.take() {
            let timer = &mut self.model[d.event.data];
            log::trace!("     → delivery of {:?}", timer);
            assert!(timer.live && !timer.in_flight, "duplicate delivery");
            assert_eq!(d.launch_time, timer.next_due, "lost or early occurrence");
            assert!(crate::ticks::ticks_before_or_at(d.launch_time, self.now));
            timer.in_flight = true;
            timer.deliveries += 1;
            self.outstanding.push(d);
        }
    }

    fn run(&mut self, cmd: Cmd) {
        log::trace!("    {:?}", cmd);
        match cmd {
            Cmd::Request { delay, period } => {
                let tag = self.model.len();
                let handle = self
                    .sys
                    .request_in(&mut self.sink, event(tag), delay, period)
                    .unwrap();
                self.model.push(ModelTimer {
                    next_due: self.now.wrapping_add(delay),
                    period,
                    one_shot: period == 0,
                    cancelled: false,
                    live: true,
                    in_flight: false,
                    deliveries: 0,
                });
                self.handles.push((handle, tag));
            }
            Cmd::Advance(delta) => {
                self.now = self.now.wrapping_add(delta);
                self.sys.on_tick_advance(&mut self.sink, delta).unwrap();
            }
            Cmd::Complete(i) => {
                if self.outstanding.is_empty() {
                    return;
                }
                let d = self.outstanding.swap_remove(i % self.outstanding.len());
                let timer = &mut self.model[d.event.data];
                timer.in_flight = false;
                if timer.period == 0 {
                    timer.live = false;
                } else {
                    timer.next_due = timer.next_due.wrapping_add(timer.period);
                }
                self.sys.on_delivery_complete(&mut self.sink, d.token).unwrap();
            }
            Cmd::Cancel(i) => {
                if self.handles.is_empty() {
                    return;
                }
                let (handle, tag) = self.handles[i % self.handles.len()];
                let timer = &mut self.model[tag];
                let result = self.sys.cancel_timer(handle);
                if timer.live {
                    assert_eq!(result, Ok(()));
                    timer.period = 0;
                    timer.cancelled = true;
                    if !timer.in_flight {
                        timer.live = false;
                    }
                } else {
                    assert_eq!(result, Err(CancelTimerError::NoAccess));
                }
            }
        }

        self.collect_deliveries();
        check_invariants(&self.sys);

        let stats = self.sys.stats().unwrap();
        assert_eq!(stats.in_flight, self.outstanding.len());
        assert_eq!(
            stats.queued + stats.in_flight,
            self.model.iter().filter(|t| t.live).count()
        );
    }
}

fn test_inner(origin: Ticks, bytecode: Vec<u8>) {
    let mut harness = Harness {
        sys: new_sys::<4>(TimerSysCfg::new()),
        sink: RecordingSink::default(),
        now: origin,
        model: Vec::new(),
        handles: Vec::new(),
        outstanding: Vec::new(),
    };

    log::debug!("origin = {}, bytecode len = {}", origin, bytecode.len());
    harness.sys.on_tick_advance(&mut harness.sink, origin).unwrap();

    for cmd in interpret(&bytecode) {
        harness.run(cmd);
    }

    // Let every queued timer come due and complete all deliveries. The
    // periodic ones catch up until their next occurrence is in the future.
    harness.run(Cmd::Advance(7));
    for _ in 0..5 {
        harness.run(Cmd::Advance(7));
        while !harness.outstanding.is_empty() {
            harness.run(Cmd::Complete(0));
        }
    }

    for timer in &harness.model {
        assert!(!timer.live || timer.period != 0, "{:?} is stuck", timer);
        if timer.one_shot && !timer.cancelled {
            assert_eq!(timer.deliveries, 1, "{:?}", timer);
        }
    }
}

#[quickcheck]
fn matches_model(origin: u32, bytecode: Vec<u8>) {
    test_inner(origin, bytecode);
}

#[quickcheck]
fn matches_model_near_wrap(offset: u8, bytecode: Vec<u8>) {
    test_inner(u32::MAX - offset as u32, bytecode);
}

#[test]
fn model_regression1() {
    test_inner(
        u32::MAX - 3,
        vec![
            0, 0, 0, 0, 4, 3, 0, 2, 6, 1, 5, 0, 2, 0, 0, 3, 1, 0, 1, 7, 0, 2, 1, 0, 0, 9, 0,
        ],
    );
}

//! # Event Loop - One Selector, One Thread
//!
//! An [`EventLoop`] owns a readiness selector (`mio::Poll`) and a FIFO task
//! queue, and drives both on a single dedicated thread. Channels are
//! affined to exactly one loop for their lifetime, which makes every
//! channel effectively single-threaded from its pipeline's point of view:
//! cross-thread callers never touch a channel directly, they
//! [`EventLoop::submit`] a task to its loop.
//!
//! ## The loop body
//!
//! Each iteration: clear the wake-up flag, select with a bounded timeout,
//! re-wake if the flag flipped during the select (see below), dispatch
//! readiness to the owning channels, drain the task queue, and finally
//! compact the selector after enough keys were cancelled.
//!
//! ## The wake-up race
//!
//! `wake()` is an expensive syscall, so submitters only issue it after
//! winning a compare-and-swap on the `waken_up` flag. That opens a window:
//! a submitter can win the CAS between the loop clearing the flag and
//! entering the select, leaving the flag `true` for the whole next round —
//! every later submitter loses the CAS and nobody wakes the selector. The
//! loop absorbs the race by re-waking itself whenever the flag is set
//! right after the select returns.
//!
//! ## Failure policy
//!
//! A panic escaping one iteration is logged and the loop pauses for a
//! second before resuming, so a persistent failure cannot spin a core at
//! 100%. Shutdown closes every registered channel, drains the remaining
//! tasks and lets the thread exit.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::panic::AssertUnwindSafe;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use log::{trace, warn};
use mio::{Events, Poll, Registry, Token, Waker};
use seine_buffer::PooledAllocator;

use crate::channel::{self, ChannelShared};

/// Token reserved for the loop's own waker.
pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// Compact the selector after this many cancelled registrations.
const CLEANUP_INTERVAL: usize = 256;

/// Pause after an unexpected loop failure, to avoid tight failure loops.
const FAILURE_PAUSE: Duration = Duration::from_secs(1);

const DEFAULT_SELECT_TIMEOUT: Duration = Duration::from_millis(10);

struct ScheduledTask {
    run: Box<dyn FnOnce() + Send>,
    cancelled: Arc<AtomicBool>,
}

/// Cancels a submitted task if it has not started yet.
///
/// Cancellation after the task started (or finished) has no effect; a
/// cancelled-before-run task is skipped silently.
#[derive(Clone)]
pub struct TaskHandle {
    cancelled: Arc<AtomicBool>,
}

impl TaskHandle {
    /// Requests cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

pub(crate) struct LoopShared {
    name: String,
    waker: Waker,
    tasks: Mutex<VecDeque<ScheduledTask>>,
    waken_up: AtomicBool,
    shutdown: AtomicBool,
    terminated: AtomicBool,
    thread: OnceLock<ThreadId>,
    join: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to one selector loop. Cheap to clone and safe to share; all
/// methods may be called from any thread.
#[derive(Clone)]
pub struct EventLoop {
    pub(crate) shared: Arc<LoopShared>,
}

/// Loop-thread-local state: the selector registry and the channels this
/// loop drives. Only code already running on the loop thread can see it.
pub(crate) struct LoopContext {
    pub(crate) event_loop: EventLoop,
    pub(crate) allocator: PooledAllocator,
    pub(crate) registry: Registry,
    pub(crate) channels: RefCell<HashMap<u64, Rc<ChannelShared>>>,
    pub(crate) tokens: RefCell<HashMap<Token, u64>>,
    pub(crate) next_token: Cell<usize>,
    pub(crate) cancelled_keys: Cell<usize>,
}

impl LoopContext {
    pub(crate) fn allocate_token(&self) -> Token {
        let token = Token(self.next_token.get());
        self.next_token.set(self.next_token.get() + 1);
        token
    }

    pub(crate) fn channel(&self, id: u64) -> Option<Rc<ChannelShared>> {
        self.channels.borrow().get(&id).cloned()
    }
}

thread_local! {
    static CURRENT_LOOP: RefCell<Option<Rc<LoopContext>>> = const { RefCell::new(None) };
}

/// The [`LoopContext`] of the loop running on this thread, if any.
pub(crate) fn current_loop() -> Option<Rc<LoopContext>> {
    CURRENT_LOOP.with(|c| c.borrow().clone())
}

/// Configures and spawns event loops, in the spirit of a local-executor
/// builder: a thread name, optional CPU pinning, a shared allocator.
///
/// # Example
///
/// ```rust,no_run
/// use seine_transport::EventLoopBuilder;
///
/// let event_loop = EventLoopBuilder::new()
///     .name("io-0")
///     .spawn()
///     .unwrap();
/// event_loop.submit(|| println!("runs on the loop thread"));
/// event_loop.shutdown_gracefully();
/// ```
pub struct EventLoopBuilder {
    name: String,
    core_id: Option<core_affinity::CoreId>,
    allocator: Option<PooledAllocator>,
    select_timeout: Duration,
}

impl Default for EventLoopBuilder {
    fn default() -> Self {
        EventLoopBuilder::new()
    }
}

impl EventLoopBuilder {
    /// A builder with the default name, timeout and allocator.
    pub fn new() -> Self {
        EventLoopBuilder {
            name: "seine-loop".to_string(),
            core_id: None,
            allocator: None,
            select_timeout: DEFAULT_SELECT_TIMEOUT,
        }
    }

    /// Names the loop thread (visible in panic messages and tooling).
    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Pins the loop thread to a CPU core.
    pub fn core_id(mut self, core_id: core_affinity::CoreId) -> Self {
        self.core_id = Some(core_id);
        self
    }

    /// The buffer allocator handed to channels registered with this loop.
    /// Loops of one group normally share a single allocator.
    pub fn allocator(mut self, allocator: PooledAllocator) -> Self {
        self.allocator = Some(allocator);
        self
    }

    /// Bounds the selector wait; the default 10 ms caps idle latency.
    pub fn select_timeout(mut self, timeout: Duration) -> Self {
        self.select_timeout = timeout;
        self
    }

    /// Spawns the loop thread and returns its handle.
    pub fn spawn(self) -> io::Result<EventLoop> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let registry = poll.registry().try_clone()?;
        let shared = Arc::new(LoopShared {
            name: self.name.clone(),
            waker,
            tasks: Mutex::new(VecDeque::new()),
            waken_up: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            thread: OnceLock::new(),
            join: Mutex::new(None),
        });
        let event_loop = EventLoop {
            shared: Arc::clone(&shared),
        };
        let allocator = self.allocator.unwrap_or_default();
        let core_id = self.core_id;
        let select_timeout = self.select_timeout;
        let for_thread = event_loop.clone();
        let handle = thread::Builder::new().name(self.name).spawn(move || {
            if let Some(core) = core_id {
                let _ = core_affinity::set_for_current(core);
            }
            run_loop(for_thread, poll, registry, allocator, select_timeout);
        })?;
        *shared.join.lock().expect("loop handle poisoned") = Some(handle);
        Ok(event_loop)
    }
}

impl EventLoop {
    /// The loop's thread name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// True when called from this loop's own thread.
    pub fn in_event_loop(&self) -> bool {
        self.shared.thread.get() == Some(&thread::current().id())
    }

    /// Enqueues `task` for execution on the loop thread and returns a
    /// cancellation handle. Always enqueues — even from the loop thread
    /// itself — so per-submitter FIFO order holds unconditionally.
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) -> TaskHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        if self.shared.terminated.load(Ordering::Acquire) {
            warn!(
                "task submitted to terminated event loop '{}'; dropped",
                self.shared.name
            );
            cancelled.store(true, Ordering::Release);
            return TaskHandle { cancelled };
        }
        self.shared
            .tasks
            .lock()
            .expect("task queue poisoned")
            .push_back(ScheduledTask {
                run: Box::new(task),
                cancelled: Arc::clone(&cancelled),
            });
        if !self.in_event_loop() {
            self.wakeup();
        }
        TaskHandle { cancelled }
    }

    /// Wakes the selector, guarded by a CAS so an already-awake loop costs
    /// no syscall.
    fn wakeup(&self) {
        if self
            .shared
            .waken_up
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            if let Err(err) = self.shared.waker.wake() {
                warn!("failed to wake event loop '{}': {err}", self.shared.name);
            }
        }
    }

    /// Requests graceful termination: registered channels close, queued
    /// tasks drain, the thread exits.
    pub fn shutdown(&self) {
        if !self.shared.shutdown.swap(true, Ordering::AcqRel) {
            // Bypass the CAS guard: this must reach the selector.
            let _ = self.shared.waker.wake();
        }
    }

    /// Whether shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Blocks until the loop thread has exited.
    pub fn join(&self) {
        if self.in_event_loop() {
            warn!(
                "join() called from inside event loop '{}'; ignored",
                self.shared.name
            );
            return;
        }
        let handle = self.shared.join.lock().expect("loop handle poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// [`EventLoop::shutdown`] followed by [`EventLoop::join`].
    pub fn shutdown_gracefully(&self) {
        self.shutdown();
        self.join();
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("name", &self.shared.name)
            .field("shutdown", &self.is_shutting_down())
            .finish()
    }
}

fn run_loop(
    event_loop: EventLoop,
    mut poll: Poll,
    registry: Registry,
    allocator: PooledAllocator,
    select_timeout: Duration,
) {
    let shared = Arc::clone(&event_loop.shared);
    let _ = shared.thread.set(thread::current().id());
    let ctx = Rc::new(LoopContext {
        event_loop,
        allocator,
        registry,
        channels: RefCell::new(HashMap::new()),
        tokens: RefCell::new(HashMap::new()),
        next_token: Cell::new(0),
        cancelled_keys: Cell::new(0),
    });
    CURRENT_LOOP.with(|c| *c.borrow_mut() = Some(Rc::clone(&ctx)));

    let mut events = Events::with_capacity(1024);
    loop {
        let iteration = std::panic::catch_unwind(AssertUnwindSafe(|| {
            shared.waken_up.store(false, Ordering::Release);
            if let Err(err) = poll.poll(&mut events, Some(select_timeout)) {
                if err.kind() != io::ErrorKind::Interrupted {
                    warn!("selector error in loop '{}': {err}", shared.name);
                }
            }
            // Absorb the wake-up race window (flag set between the clear
            // above and the select): without this, the next select could
            // block with the flag already burnt.
            if shared.waken_up.load(Ordering::Acquire) {
                let _ = shared.waker.wake();
            }

            process_ready(&ctx, &events);
            run_tasks(&shared);

            if ctx.cancelled_keys.get() >= CLEANUP_INTERVAL {
                ctx.cancelled_keys.set(0);
                // A no-op selection lets the selector settle cancelled
                // registrations.
                let _ = poll.poll(&mut events, Some(Duration::ZERO));
                process_ready(&ctx, &events);
            }
        }));
        if iteration.is_err() {
            warn!(
                "unexpected failure in event loop '{}'; pausing briefly",
                shared.name
            );
            thread::sleep(FAILURE_PAUSE);
        }
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
    }

    close_all(&ctx);
    run_tasks(&shared);
    shared.terminated.store(true, Ordering::Release);
    // Late submissions may have raced the flag; nothing will run them.
    let stragglers = shared.tasks.lock().expect("task queue poisoned").len();
    if stragglers > 0 {
        warn!(
            "event loop '{}' dropped {stragglers} task(s) submitted during termination",
            shared.name
        );
    }
    CURRENT_LOOP.with(|c| *c.borrow_mut() = None);
    trace!("event loop '{}' terminated", shared.name);
}

fn run_tasks(shared: &Arc<LoopShared>) {
    loop {
        let task = shared
            .tasks
            .lock()
            .expect("task queue poisoned")
            .pop_front();
        match task {
            Some(task) => {
                if task.cancelled.load(Ordering::Acquire) {
                    trace!("skipping a cancelled task");
                } else {
                    (task.run)();
                }
            }
            None => break,
        }
    }
}

fn process_ready(ctx: &Rc<LoopContext>, events: &Events) {
    for event in events.iter() {
        let token = event.token();
        if token == WAKER_TOKEN {
            continue;
        }
        let chan = ctx
            .tokens
            .borrow()
            .get(&token)
            .copied()
            .and_then(|id| ctx.channel(id));
        match chan {
            Some(chan) => channel::handle_ready(&chan, event),
            None => trace!("readiness for a vanished channel on {token:?}"),
        }
    }
}

fn close_all(ctx: &Rc<LoopContext>) {
    let channels: Vec<_> = ctx.channels.borrow().values().cloned().collect();
    for chan in channels {
        channel::close_now(&chan);
    }
}

/// A fixed pool of event loops with round-robin channel placement.
pub struct EventLoopGroup {
    loops: Vec<EventLoop>,
    next: AtomicUsize,
}

impl EventLoopGroup {
    /// Spawns `count` loops named `{base_name}-{i}` sharing `allocator`.
    pub fn new(count: usize, base_name: &str, allocator: PooledAllocator) -> io::Result<Self> {
        assert!(count > 0, "an event loop group needs at least one loop");
        let mut loops = Vec::with_capacity(count);
        for i in 0..count {
            loops.push(
                EventLoopBuilder::new()
                    .name(&format!("{base_name}-{i}"))
                    .allocator(allocator.clone())
                    .spawn()?,
            );
        }
        Ok(EventLoopGroup {
            loops,
            next: AtomicUsize::new(0),
        })
    }

    /// The next loop in round-robin order.
    pub fn next(&self) -> EventLoop {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        self.loops[idx].clone()
    }

    /// Number of loops in the group.
    pub fn len(&self) -> usize {
        self.loops.len()
    }

    /// Never true; groups are non-empty by construction.
    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    /// All loops, in spawn order.
    pub fn iter(&self) -> impl Iterator<Item = &EventLoop> {
        self.loops.iter()
    }

    /// Shuts down and joins every loop.
    pub fn shutdown_gracefully(&self) {
        for event_loop in &self.loops {
            event_loop.shutdown();
        }
        for event_loop in &self.loops {
            event_loop.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Instant;

    #[test]
    fn tasks_run_in_submission_order() {
        let event_loop = EventLoopBuilder::new().name("order-test").spawn().unwrap();
        let (tx, rx) = mpsc::channel();
        for i in 0..100 {
            let tx = tx.clone();
            event_loop.submit(move || {
                let _ = tx.send(i);
            });
        }
        let got: Vec<i32> = (0..100).map(|_| rx.recv().unwrap()).collect();
        assert_eq!(got, (0..100).collect::<Vec<_>>());
        event_loop.shutdown_gracefully();
    }

    #[test]
    fn submit_from_the_loop_thread_still_enqueues() {
        let event_loop = EventLoopBuilder::new().name("reentrant-test").spawn().unwrap();
        let (tx, rx) = mpsc::channel();
        let ev = event_loop.clone();
        event_loop.submit(move || {
            assert!(ev.in_event_loop());
            let tx2 = tx.clone();
            ev.submit(move || {
                let _ = tx2.send("inner");
            });
            // The inner task must not have run inline.
            let _ = tx.send("outer");
        });
        assert_eq!(rx.recv().unwrap(), "outer");
        assert_eq!(rx.recv().unwrap(), "inner");
        event_loop.shutdown_gracefully();
    }

    #[test]
    fn cancelled_tasks_are_skipped() {
        let event_loop = EventLoopBuilder::new().name("cancel-test").spawn().unwrap();
        let (tx, rx) = mpsc::channel();

        // Park the loop briefly so the second task can be cancelled before
        // it dequeues.
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        event_loop.submit(move || {
            let _ = gate_rx.recv_timeout(Duration::from_secs(1));
        });
        let tx2 = tx.clone();
        let doomed = event_loop.submit(move || {
            let _ = tx2.send("doomed");
        });
        doomed.cancel();
        event_loop.submit(move || {
            let _ = tx.send("survivor");
        });
        let _ = gate_tx.send(());

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "survivor");
        event_loop.shutdown_gracefully();
    }

    #[test]
    fn wakeup_race_does_not_stall_submissions() {
        // Hammer submit from another thread while the loop sleeps in its
        // selector; every task must land within roughly one quantum.
        let event_loop = EventLoopBuilder::new().name("race-test").spawn().unwrap();
        for _ in 0..200 {
            let (tx, rx) = mpsc::channel();
            let start = Instant::now();
            event_loop.submit(move || {
                let _ = tx.send(());
            });
            rx.recv_timeout(Duration::from_millis(500))
                .expect("task stalled: wake-up lost");
            assert!(start.elapsed() < Duration::from_millis(500));
        }
        event_loop.shutdown_gracefully();
    }

    #[test]
    fn shutdown_drains_pending_tasks() {
        let event_loop = EventLoopBuilder::new().name("drain-test").spawn().unwrap();
        let (tx, rx) = mpsc::channel();
        for i in 0..10 {
            let tx = tx.clone();
            event_loop.submit(move || {
                let _ = tx.send(i);
            });
        }
        event_loop.shutdown_gracefully();
        let mut got: Vec<i32> = rx.try_iter().collect();
        got.sort_unstable();
        assert_eq!(got, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn group_round_robins_over_loops() {
        let group = EventLoopGroup::new(3, "group-test", PooledAllocator::default()).unwrap();
        let a = group.next();
        let b = group.next();
        let c = group.next();
        let d = group.next();
        assert_eq!(a.name(), "group-test-0");
        assert_eq!(b.name(), "group-test-1");
        assert_eq!(c.name(), "group-test-2");
        assert_eq!(d.name(), "group-test-0");
        group.shutdown_gracefully();
    }
}

use std::collections::VecDeque;
use std::io::{self, Write};
use std::mem;
use std::ops;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant, SystemTime};

use slab::Slab;

use crate::backend::{self, Features, Selector};
use crate::ready::Ready;
use crate::signal::SigBridge;
use crate::sys::Waker;
use crate::timeheap::{TimeHeap, NO_HEAP_IDX};

/// Upper bound on distinct common-timeout durations per reactor.
const MAX_COMMON_TIMEOUTS: usize = 256;

/// Deferred callbacks processed per loop iteration before returning to
/// the demultiplexer.
const MAX_DEFERRED: usize = 16;

/// How often the wall-clock/monotonic skew is refreshed.
const CLOCK_SYNC_INTERVAL: Duration = Duration::from_secs(5);

pub(crate) const EVLIST_TIMEOUT: u8 = 0x01;
pub(crate) const EVLIST_INSERTED: u8 = 0x02;
pub(crate) const EVLIST_ACTIVE: u8 = 0x08;
pub(crate) const EVLIST_INTERNAL: u8 = 0x10;

/// Reactor construction options.
///
/// ```
/// use evio::{Config, Features, Reactor};
///
/// # fn main() -> std::io::Result<()> {
/// let reactor = Reactor::with_config(
///     Config::new().require_features(Features::O1),
/// )?;
/// assert!(reactor.features().is_o1());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default, Clone)]
pub struct Config {
    require: Features,
    avoid: Vec<String>,
    no_lock: bool,
    ignore_env: bool,
    no_cache_time: bool,
}

impl Config {
    /// A configuration with no requirements.
    pub fn new() -> Config {
        Config::default()
    }

    /// Only consider backends advertising all of `features`.
    pub fn require_features(mut self, features: Features) -> Config {
        self.require = self.require | features;
        self
    }

    /// Never use the named backend (e.g. `"epoll"`).
    pub fn avoid_method(mut self, name: &str) -> Config {
        self.avoid.push(name.to_string());
        self
    }

    /// Promise that the reactor is only touched from one thread; skips
    /// cross-thread wake-up and wait machinery.
    pub fn no_lock(mut self) -> Config {
        self.no_lock = true;
        self
    }

    /// Ignore `EVIO_NO*` and `EVIO_SHOW_METHOD` environment variables.
    pub fn ignore_env(mut self) -> Config {
        self.ignore_env = true;
        self
    }

    /// Query the clock on every time lookup instead of caching it per
    /// loop iteration.
    pub fn no_cache_time(mut self) -> Config {
        self.no_cache_time = true;
        self
    }

    pub(crate) fn is_avoided(&self, name: &str) -> bool {
        self.avoid.iter().any(|avoided| avoided == name)
    }

    pub(crate) fn ignores_env(&self) -> bool {
        self.ignore_env
    }

    pub(crate) fn required_features(&self) -> Features {
        self.require
    }
}

/// A shared-duration timer class.
///
/// Events added with the same `CommonTimeout` share a single timer-heap
/// slot; their expirations live in one insertion-ordered queue. Obtained
/// from [`Reactor::init_common_timeout`] and only valid on the reactor
/// that produced it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CommonTimeout {
    pub(crate) index: usize,
    pub(crate) duration: Duration,
}

impl CommonTimeout {
    /// The shared duration.
    pub fn duration(&self) -> Duration {
        self.duration
    }
}

/// A timeout for [`Event::add`](crate::Event::add).
#[derive(Debug, Copy, Clone)]
pub enum Timeout {
    /// Fire after the given delay.
    After(Duration),
    /// Fire after the duration of a registered common-timeout class.
    Common(CommonTimeout),
}

/// Flags for [`Reactor::run`].
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct LoopFlags(u8);

impl LoopFlags {
    /// Block until one batch of events was handled, then return.
    pub const ONCE: LoopFlags = LoopFlags(0b01);

    /// Poll without blocking, handle whatever is ready, return.
    pub const NONBLOCK: LoopFlags = LoopFlags(0b10);

    pub(crate) fn is_once(self) -> bool {
        self.0 & 0b01 != 0
    }

    pub(crate) fn is_nonblock(self) -> bool {
        self.0 & 0b10 != 0
    }
}

impl ops::BitOr for LoopFlags {
    type Output = LoopFlags;

    fn bitor(self, other: LoopFlags) -> LoopFlags {
        LoopFlags(self.0 | other.0)
    }
}

/// Why [`Reactor::run`] returned.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Exit {
    /// The loop finished: break, exit, or the requested flags were
    /// satisfied.
    Done,
    /// No events are registered; there is nothing to wait for.
    Empty,
}

// A timeout as resolved at add time.
#[derive(Copy, Clone)]
pub(crate) enum AddTimeout {
    None,
    Rel(Timeout),
    Abs { at: Instant, common: Option<usize> },
}

pub(crate) enum Internal {
    /// Drain the cross-thread notification pipe.
    Notify,
    /// Drain the signal bridge socket and fan out per-signal counts.
    SignalBridge,
    /// A common-timeout queue's representative timer fired.
    CommonTimeout(usize),
    /// Terminate the loop at the next iteration boundary.
    LoopExit,
}

pub(crate) enum Callback {
    User(Box<dyn FnMut(RawFd, Ready) + Send>),
    Once(Option<Box<dyn FnOnce(RawFd, Ready) + Send>>),
    Internal(Internal),
    /// Temporarily moved out while the callback runs.
    Taken,
}

pub(crate) struct Registration {
    pub(crate) fd: RawFd,
    pub(crate) interest: Ready,
    pub(crate) callback: Callback,
    pub(crate) priority: u8,
    pub(crate) flags: u8,
    pub(crate) res: Ready,
    pub(crate) gen: u64,
    /// Absolute expiration while in a timeout queue.
    pub(crate) deadline: Option<Instant>,
    /// The relative timeout a persistent event re-arms with.
    pub(crate) period: Option<Timeout>,
    /// Which common-timeout queue holds this event, if any.
    pub(crate) common: Option<usize>,
    pub(crate) heap_idx: usize,
    pub(crate) ncalls: u16,
    /// Unregister after the callback ran (one-shot helpers).
    pub(crate) auto_free: bool,
}

impl Registration {
    pub(crate) fn is_internal(&self) -> bool {
        self.flags & EVLIST_INTERNAL != 0
    }
}

struct FdEntry {
    nread: u16,
    nwrite: u16,
    events: Vec<usize>,
}

impl FdEntry {
    fn new() -> FdEntry {
        FdEntry {
            nread: 0,
            nwrite: 0,
            events: Vec::new(),
        }
    }

    fn mask(&self) -> Ready {
        let mut mask = Ready::EMPTY;
        if self.nread > 0 {
            mask |= Ready::READABLE;
        }
        if self.nwrite > 0 {
            mask |= Ready::WRITABLE;
        }
        mask
    }
}

struct CommonQueue {
    duration: Duration,
    queue: VecDeque<usize>,
    timer_id: usize,
}

/// A one-shot continuation run after the current iteration's activation
/// queues drain.
pub(crate) struct Deferred {
    queued: AtomicBool,
    func: Mutex<Box<dyn FnMut() + Send>>,
}

impl Deferred {
    pub(crate) fn new<F: FnMut() + Send + 'static>(func: F) -> Arc<Deferred> {
        Arc::new(Deferred {
            queued: AtomicBool::new(false),
            func: Mutex::new(Box::new(func)),
        })
    }
}

pub(crate) struct Core {
    pub(crate) regs: Slab<Registration>,
    gen_counter: u64,
    fds: Vec<Option<FdEntry>>,
    active: Vec<VecDeque<usize>>,
    heap: TimeHeap,
    common: Vec<CommonQueue>,
    deferred: VecDeque<Arc<Deferred>>,
    deferred_active: usize,
    /// Queue memberships held by non-internal events.
    event_count: usize,
    event_count_active: usize,
    running_loop: bool,
    loop_thread: Option<ThreadId>,
    done: bool,
    brk: bool,
    cont: bool,
    running_priority: i32,
    pub(crate) current_event: Option<usize>,
    pub(crate) current_event_waiters: u32,
    cached_now: Option<Instant>,
    skew: Option<(Instant, SystemTime)>,
    is_notify_pending: bool,
    no_lock: bool,
    no_cache_time: bool,
    pub(crate) sig: SigBridge,
}

pub(crate) struct Inner {
    pub(crate) core: Mutex<Core>,
    pub(crate) cond: Condvar,
    pub(crate) selector: Box<dyn Selector>,
    pub(crate) waker: Waker,
}

/// The event loop: registration of interests, priority-ordered dispatch,
/// timers and cross-thread wake-up.
///
/// `Reactor` is cheap to clone; clones refer to the same loop. The loop
/// runs on whichever thread calls [`dispatch`](Reactor::dispatch) or
/// [`run`](Reactor::run) — one at a time — while other threads may add,
/// modify and remove events concurrently.
#[derive(Clone)]
pub struct Reactor {
    pub(crate) inner: Arc<Inner>,
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Reactor")
            .field("method", &self.inner.selector.name())
            .finish()
    }
}

impl Reactor {
    /// Create a reactor with the default configuration.
    pub fn new() -> io::Result<Reactor> {
        Reactor::with_config(Config::new())
    }

    /// Create a reactor honoring `config`'s feature requirements, avoid
    /// list and flags.
    pub fn with_config(config: Config) -> io::Result<Reactor> {
        let selector = backend::choose(&config)?;
        let waker = Waker::new()?;
        log::debug!("reactor using backend {}", selector.name());

        let core = Core {
            regs: Slab::new(),
            gen_counter: 0,
            fds: Vec::new(),
            active: vec![VecDeque::new()],
            heap: TimeHeap::new(),
            common: Vec::new(),
            deferred: VecDeque::new(),
            deferred_active: 0,
            event_count: 0,
            event_count_active: 0,
            running_loop: false,
            loop_thread: None,
            done: false,
            brk: false,
            cont: false,
            running_priority: -1,
            current_event: None,
            current_event_waiters: 0,
            cached_now: None,
            skew: None,
            is_notify_pending: false,
            no_lock: config.no_lock,
            no_cache_time: config.no_cache_time,
            sig: SigBridge::new(),
        };
        let inner = Arc::new(Inner {
            core: Mutex::new(core),
            cond: Condvar::new(),
            selector,
            waker,
        });

        // Register the wake-up pipe as an internal persistent event.
        {
            let mut core = inner.core.lock().unwrap();
            let fd = inner.waker.read_fd();
            let id = core.register(
                fd,
                Ready::READABLE | Ready::PERSIST,
                Callback::Internal(Internal::Notify),
                0,
                true,
            );
            core.add_nolock(&inner, id, AddTimeout::None)?;
        }

        Ok(Reactor { inner })
    }

    /// The name of the demultiplexer backend in use.
    pub fn method_name(&self) -> &'static str {
        self.inner.selector.name()
    }

    /// The feature set of the demultiplexer backend in use.
    pub fn features(&self) -> Features {
        self.inner.selector.features()
    }

    /// Resize the per-priority activation-queue array.
    ///
    /// Fails while any event is active, or if `n` is out of range.
    pub fn set_priorities(&self, n: usize) -> io::Result<()> {
        let mut core = self.inner.core.lock().unwrap();
        if n == 0 || n > 256 || core.event_count_active > 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot resize priority queues",
            ));
        }
        core.active.resize_with(n, VecDeque::new);
        core.active.truncate(n);
        Ok(())
    }

    /// Number of priority levels.
    pub fn priority_count(&self) -> usize {
        self.inner.core.lock().unwrap().active.len()
    }

    /// Whether any non-internal event is registered.
    pub fn has_events(&self) -> bool {
        self.inner.core.lock().unwrap().event_count > 0
    }

    /// Run the event loop until no events remain or the loop is told to
    /// stop. Equivalent to [`run`](Reactor::run) with empty flags.
    pub fn dispatch(&self) -> io::Result<Exit> {
        self.run(LoopFlags::default())
    }

    /// Run the event loop.
    ///
    /// Returns [`Exit::Empty`] when no events are registered at all; an
    /// error only means catastrophic backend failure.
    pub fn run(&self, flags: LoopFlags) -> io::Result<Exit> {
        run_loop(&self.inner, flags)
    }

    /// Stop the loop at the next callback boundary.
    pub fn loop_break(&self) -> io::Result<()> {
        let mut core = self.inner.core.lock().unwrap();
        core.brk = true;
        if core.need_notify() {
            core.notify(&self.inner);
        }
        Ok(())
    }

    /// Schedule loop termination after `delay`, or at the next iteration
    /// boundary when `None`.
    pub fn loop_exit(&self, delay: Option<Duration>) -> io::Result<()> {
        let mut core = self.inner.core.lock().unwrap();
        let priority = core.default_priority();
        let id = core.register(
            -1,
            Ready::EMPTY,
            Callback::Internal(Internal::LoopExit),
            priority,
            false,
        );
        core.regs[id].auto_free = true;
        let timeout = AddTimeout::Rel(Timeout::After(delay.unwrap_or(Duration::ZERO)));
        match core.add_nolock(&self.inner, id, timeout) {
            Ok(()) => Ok(()),
            Err(err) => {
                core.regs.remove(id);
                Err(err)
            }
        }
    }

    /// Run `callback` once when `fd` observes `what` readiness or
    /// `timeout` expires, whichever comes first. With an empty interest
    /// mask this is a one-shot timer; a missing timeout then fires it on
    /// the next iteration.
    pub fn once<F>(
        &self,
        fd: RawFd,
        what: Ready,
        timeout: Option<Duration>,
        callback: F,
    ) -> io::Result<()>
    where
        F: FnOnce(RawFd, Ready) + Send + 'static,
    {
        if what.is_signal() || what.is_persist() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "one-shot events cannot be signal or persistent",
            ));
        }
        let interest = what & (Ready::READABLE | Ready::WRITABLE);
        let timeout = if interest.is_empty() {
            Some(timeout.unwrap_or(Duration::ZERO))
        } else {
            timeout
        };

        let mut core = self.inner.core.lock().unwrap();
        let priority = core.default_priority();
        let id = core.register(
            fd,
            interest,
            Callback::Once(Some(Box::new(callback))),
            priority,
            false,
        );
        core.regs[id].auto_free = true;
        let add = match timeout {
            Some(delay) => AddTimeout::Rel(Timeout::After(delay)),
            None => AddTimeout::None,
        };
        match core.add_nolock(&self.inner, id, add) {
            Ok(()) => Ok(()),
            Err(err) => {
                core.regs.remove(id);
                Err(err)
            }
        }
    }

    /// Register a duration as a common-timeout class.
    ///
    /// All events added with the returned token share one timer-heap
    /// entry, keeping thousands of identical timeouts cheap.
    pub fn init_common_timeout(&self, duration: Duration) -> io::Result<CommonTimeout> {
        let mut core = self.inner.core.lock().unwrap();
        for (index, queue) in core.common.iter().enumerate() {
            if queue.duration == duration {
                return Ok(CommonTimeout { index, duration });
            }
        }
        if core.common.len() == MAX_COMMON_TIMEOUTS {
            log::warn!(
                "too many common timeouts in use; at most {} per reactor",
                MAX_COMMON_TIMEOUTS
            );
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "too many common timeouts",
            ));
        }
        let index = core.common.len();
        let timer_id = core.register(
            -1,
            Ready::EMPTY,
            Callback::Internal(Internal::CommonTimeout(index)),
            0,
            true,
        );
        core.common.push(CommonQueue {
            duration,
            queue: VecDeque::new(),
            timer_id,
        });
        Ok(CommonTimeout { index, duration })
    }

    /// The current wall-clock time, served from the loop's per-iteration
    /// cache when possible.
    pub fn gettimeofday_cached(&self) -> SystemTime {
        let mut core = self.inner.core.lock().unwrap();
        match core.cached_now {
            Some(cached) => {
                let (base_instant, base_system) = core.fresh_skew(cached);
                if cached >= base_instant {
                    base_system + (cached - base_instant)
                } else {
                    base_system - (base_instant - cached)
                }
            }
            None => SystemTime::now(),
        }
    }

    /// Rebuild backend state after `fork(2)` in the child.
    pub fn reinit(&self) -> io::Result<()> {
        let core = self.inner.core.lock().unwrap();
        if !self.inner.selector.needs_reinit() {
            return Ok(());
        }
        self.inner.selector.reinit()?;
        for fd in 0..core.fds.len() {
            let mask = match &core.fds[fd] {
                Some(entry) => entry.mask(),
                None => continue,
            };
            if !mask.is_empty() {
                let edge = core.fd_edge(fd as RawFd);
                self.inner
                    .selector
                    .add(fd as RawFd, Ready::EMPTY, mask | edge)?;
            }
        }
        Ok(())
    }

    /// Write a human-readable list of registered and active events.
    pub fn dump_events(&self, out: &mut dyn io::Write) -> io::Result<()> {
        let core = self.inner.core.lock().unwrap();
        writeln!(out, "Inserted events:")?;
        for (id, reg) in core.regs.iter() {
            if reg.flags & EVLIST_INSERTED != 0 {
                writeln!(
                    out,
                    "  #{} fd={} interest={:?}{}",
                    id,
                    reg.fd,
                    reg.interest,
                    if reg.is_internal() { " [internal]" } else { "" },
                )?;
            }
        }
        writeln!(out, "Active events:")?;
        for (id, reg) in core.regs.iter() {
            if reg.flags & EVLIST_ACTIVE != 0 {
                writeln!(out, "  #{} fd={} res={:?}", id, reg.fd, reg.res)?;
            }
        }
        writeln!(out, "Timer heap: {} entries", core.heap.len())?;
        Ok(())
    }
}

impl Inner {
    pub(crate) fn schedule_deferred(&self, deferred: &Arc<Deferred>) {
        let mut core = self.core.lock().unwrap();
        core.schedule_deferred(self, deferred);
    }

    pub(crate) fn cancel_deferred(&self, deferred: &Arc<Deferred>) {
        let mut core = self.core.lock().unwrap();
        core.cancel_deferred(deferred);
    }
}

impl Core {
    pub(crate) fn register(
        &mut self,
        fd: RawFd,
        interest: Ready,
        callback: Callback,
        priority: u8,
        internal: bool,
    ) -> usize {
        self.gen_counter += 1;
        self.regs.insert(Registration {
            fd,
            interest,
            callback,
            priority,
            flags: if internal { EVLIST_INTERNAL } else { 0 },
            res: Ready::EMPTY,
            gen: self.gen_counter,
            deadline: None,
            period: None,
            common: None,
            heap_idx: NO_HEAP_IDX,
            ncalls: 0,
            auto_free: false,
        })
    }

    pub(crate) fn default_priority(&self) -> u8 {
        (self.active.len() / 2) as u8
    }

    pub(crate) fn priority_in_range(&self, priority: u8) -> bool {
        (priority as usize) < self.active.len()
    }

    pub(crate) fn in_loop_thread(&self) -> bool {
        self.loop_thread == Some(thread::current().id())
    }

    pub(crate) fn need_notify(&self) -> bool {
        !self.no_lock && self.running_loop && !self.in_loop_thread()
    }

    pub(crate) fn notify(&mut self, inner: &Inner) {
        if self.is_notify_pending {
            return;
        }
        self.is_notify_pending = true;
        if let Err(err) = inner.waker.wake() {
            log::warn!("failed to wake event loop: {}", err);
        }
    }

    fn n_active(&self) -> usize {
        self.event_count_active + self.deferred_active
    }

    /// Current monotonic time, from the per-iteration cache when set.
    pub(crate) fn now(&self) -> Instant {
        self.cached_now.unwrap_or_else(Instant::now)
    }

    fn fresh_skew(&mut self, at: Instant) -> (Instant, SystemTime) {
        let stale = match self.skew {
            Some((instant, _)) => at
                .checked_duration_since(instant)
                .map_or(false, |age| age > CLOCK_SYNC_INTERVAL),
            None => true,
        };
        if stale {
            self.skew = Some((Instant::now(), SystemTime::now()));
        }
        self.skew.unwrap()
    }

    fn clear_time_cache(&mut self) {
        self.cached_now = None;
    }

    fn update_time_cache(&mut self) {
        self.cached_now = None;
        if !self.no_cache_time {
            self.cached_now = Some(Instant::now());
        }
    }

    fn timeout_next(&self) -> Option<Duration> {
        let (deadline, _) = self.heap.top()?;
        Some(deadline.saturating_duration_since(self.now()))
    }

    // ===== queue membership =====

    fn count_insert(&mut self, id: usize) {
        if !self.regs[id].is_internal() {
            self.event_count += 1;
        }
    }

    fn count_remove(&mut self, id: usize) {
        if !self.regs[id].is_internal() {
            self.event_count -= 1;
        }
    }

    fn queue_insert_inserted(&mut self, id: usize) {
        debug_assert!(self.regs[id].flags & EVLIST_INSERTED == 0);
        self.count_insert(id);
        self.regs[id].flags |= EVLIST_INSERTED;
    }

    fn queue_remove_inserted(&mut self, id: usize) {
        debug_assert!(self.regs[id].flags & EVLIST_INSERTED != 0);
        self.count_remove(id);
        self.regs[id].flags &= !EVLIST_INSERTED;
    }

    fn queue_insert_active(&mut self, id: usize) {
        if self.regs[id].flags & EVLIST_ACTIVE != 0 {
            return;
        }
        self.count_insert(id);
        self.regs[id].flags |= EVLIST_ACTIVE;
        self.event_count_active += 1;
        let priority = (self.regs[id].priority as usize).min(self.active.len() - 1);
        self.active[priority].push_back(id);
    }

    fn queue_remove_active(&mut self, id: usize) {
        if self.regs[id].flags & EVLIST_ACTIVE == 0 {
            return;
        }
        self.count_remove(id);
        self.regs[id].flags &= !EVLIST_ACTIVE;
        self.event_count_active -= 1;
        let priority = (self.regs[id].priority as usize).min(self.active.len() - 1);
        if let Some(pos) = self.active[priority].iter().position(|&qid| qid == id) {
            self.active[priority].remove(pos);
        }
    }

    fn queue_insert_timeout(&mut self, id: usize) {
        debug_assert!(self.regs[id].flags & EVLIST_TIMEOUT == 0);
        self.count_insert(id);
        self.regs[id].flags |= EVLIST_TIMEOUT;
        let deadline = self.regs[id].deadline.expect("timeout without deadline");
        match self.regs[id].common {
            Some(index) => {
                // Identical durations keep the queue expiration-ordered;
                // walk from the tail for the rare out-of-order re-add.
                let queue = &mut self.common[index].queue;
                let mut at = queue.len();
                while at > 0 {
                    let prev = queue[at - 1];
                    let prev_deadline = self.regs[prev]
                        .deadline
                        .expect("queued event without deadline");
                    if prev_deadline <= deadline {
                        break;
                    }
                    at -= 1;
                }
                self.common[index].queue.insert(at, id);
            }
            None => {
                let Core {
                    ref mut heap,
                    ref mut regs,
                    ..
                } = *self;
                heap.push(deadline, id, &mut |eid, idx| regs[eid].heap_idx = idx);
            }
        }
    }

    fn queue_remove_timeout(&mut self, id: usize) {
        debug_assert!(self.regs[id].flags & EVLIST_TIMEOUT != 0);
        self.count_remove(id);
        self.regs[id].flags &= !EVLIST_TIMEOUT;
        match self.regs[id].common {
            Some(index) => {
                let queue = &mut self.common[index].queue;
                if let Some(pos) = queue.iter().position(|&qid| qid == id) {
                    queue.remove(pos);
                }
            }
            None => {
                let idx = self.regs[id].heap_idx;
                debug_assert!(idx != NO_HEAP_IDX);
                let Core {
                    ref mut heap,
                    ref mut regs,
                    ..
                } = *self;
                heap.remove(idx, &mut |eid, i| regs[eid].heap_idx = i);
            }
        }
    }

    // ===== fd map =====

    fn fd_entry(&mut self, fd: RawFd) -> &mut FdEntry {
        let fd = fd as usize;
        if fd >= self.fds.len() {
            self.fds.resize_with(fd + 1, || None);
        }
        self.fds[fd].get_or_insert_with(FdEntry::new)
    }

    /// Union of edge-trigger requests among events registered on `fd`.
    fn fd_edge(&self, fd: RawFd) -> Ready {
        match self.fds.get(fd as usize).and_then(|e| e.as_ref()) {
            Some(entry) => {
                for &id in &entry.events {
                    if self.regs[id].interest.is_edge() {
                        return Ready::EDGE;
                    }
                }
                Ready::EMPTY
            }
            None => Ready::EMPTY,
        }
    }

    fn io_add(&mut self, inner: &Inner, id: usize) -> io::Result<bool> {
        let fd = self.regs[id].fd;
        let interest = self.regs[id].interest;
        if fd < 0 {
            return Ok(false);
        }
        let entry = self.fd_entry(fd);
        let old = entry.mask();
        let mut nread = entry.nread;
        let mut nwrite = entry.nwrite;
        let mut added = Ready::EMPTY;
        if interest.is_readable() {
            nread += 1;
            if nread == 1 {
                added |= Ready::READABLE;
            }
        }
        if interest.is_writable() {
            nwrite += 1;
            if nwrite == 1 {
                added |= Ready::WRITABLE;
            }
        }
        let mut notify = false;
        if !added.is_empty() {
            if interest.is_edge() {
                added |= Ready::EDGE;
            }
            inner.selector.add(fd, old, added)?;
            notify = true;
        }
        let entry = self.fd_entry(fd);
        entry.nread = nread;
        entry.nwrite = nwrite;
        entry.events.push(id);
        Ok(notify)
    }

    fn io_del(&mut self, inner: &Inner, id: usize) -> io::Result<bool> {
        let fd = self.regs[id].fd;
        let interest = self.regs[id].interest;
        if fd < 0 {
            return Ok(false);
        }
        let entry = match self.fds.get_mut(fd as usize).and_then(|e| e.as_mut()) {
            Some(entry) => entry,
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "fd was never registered",
                ))
            }
        };
        let old = entry.mask();
        let mut nread = entry.nread;
        let mut nwrite = entry.nwrite;
        let mut removed = Ready::EMPTY;
        if interest.is_readable() {
            nread = nread.saturating_sub(1);
            if nread == 0 {
                removed |= Ready::READABLE;
            }
        }
        if interest.is_writable() {
            nwrite = nwrite.saturating_sub(1);
            if nwrite == 0 {
                removed |= Ready::WRITABLE;
            }
        }
        let mut notify = false;
        if !removed.is_empty() {
            inner.selector.del(fd, old, removed)?;
            notify = true;
        }
        let entry = self.fds[fd as usize].as_mut().unwrap();
        entry.nread = nread;
        entry.nwrite = nwrite;
        entry.events.retain(|&eid| eid != id);
        Ok(notify)
    }

    fn io_active(&mut self, inner: &Inner, fd: RawFd, what: Ready) {
        let ids: Vec<usize> = match self.fds.get(fd as usize).and_then(|e| e.as_ref()) {
            Some(entry) => entry.events.clone(),
            None => return,
        };
        for id in ids {
            let reg = match self.regs.get(id) {
                Some(reg) => reg,
                None => continue,
            };
            let res = reg.interest & what & (Ready::READABLE | Ready::WRITABLE);
            if !res.is_empty() {
                self.active_nolock(inner, id, res, 1);
            }
        }
    }

    // ===== add / del / active =====

    pub(crate) fn add_nolock(
        &mut self,
        inner: &Inner,
        id: usize,
        timeout: AddTimeout,
    ) -> io::Result<()> {
        let interest = self.regs[id].interest;
        let flags = self.regs[id].flags;
        let mut notify = false;

        if interest.intersects(Ready::READABLE | Ready::WRITABLE | Ready::SIGNAL)
            && flags & (EVLIST_INSERTED | EVLIST_ACTIVE) == 0
        {
            if interest.intersects(Ready::READABLE | Ready::WRITABLE) {
                notify |= self.io_add(inner, id)?;
            } else {
                notify |= SigBridge::add(self, inner, id)?;
            }
            self.queue_insert_inserted(id);
        }

        if !matches!(timeout, AddTimeout::None) {
            if let AddTimeout::Rel(rel) = timeout {
                if self.regs[id].interest.is_persist() {
                    self.regs[id].period = Some(rel);
                }
            }

            if self.regs[id].flags & EVLIST_TIMEOUT != 0 {
                if self.regs[id].common.is_none() && self.heap.is_top(self.regs[id].heap_idx)
                {
                    notify = true;
                }
                self.queue_remove_timeout(id);
            }

            // Re-arming an event that is active purely because its
            // previous timeout fired discards the stale activation.
            if self.regs[id].flags & EVLIST_ACTIVE != 0 && self.regs[id].res.is_timeout() {
                if self.regs[id].interest.is_signal() && self.regs[id].ncalls != 0 {
                    self.regs[id].ncalls = 0;
                }
                self.queue_remove_active(id);
            }

            let now = self.now();
            let (deadline, common) = match timeout {
                AddTimeout::Rel(Timeout::After(delay)) => (now + delay, None),
                AddTimeout::Rel(Timeout::Common(ct)) => {
                    if ct.index >= self.common.len()
                        || self.common[ct.index].duration != ct.duration
                    {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidInput,
                            "common timeout belongs to a different reactor",
                        ));
                    }
                    (now + ct.duration, Some(ct.index))
                }
                AddTimeout::Abs { at, common } => (at, common),
                AddTimeout::None => unreachable!(),
            };
            self.regs[id].deadline = Some(deadline);
            self.regs[id].common = common;
            self.queue_insert_timeout(id);

            match common {
                Some(index) => {
                    if self.common[index].queue.front() == Some(&id) {
                        self.common_schedule(inner, index);
                    }
                }
                None => {
                    if self.heap.is_top(self.regs[id].heap_idx) {
                        notify = true;
                    } else if let Some((top, _)) = self.heap.top() {
                        // Handle clocks that jumped while we slept.
                        if top < now {
                            notify = true;
                        }
                    }
                }
            }
        }

        if notify && self.need_notify() {
            self.notify(inner);
        }
        Ok(())
    }

    /// Re-arm the internal timer representing common-timeout queue
    /// `index` from the queue's head deadline.
    fn common_schedule(&mut self, inner: &Inner, index: usize) {
        let timer_id = self.common[index].timer_id;
        let head = match self.common[index].queue.front() {
            Some(&head) => head,
            None => return,
        };
        let at = self.regs[head]
            .deadline
            .expect("queued event without deadline");
        if self.regs[timer_id].flags & EVLIST_TIMEOUT != 0 {
            self.queue_remove_timeout(timer_id);
        }
        self.regs[timer_id].deadline = Some(at);
        self.regs[timer_id].common = None;
        self.queue_insert_timeout(timer_id);
        if self.heap.is_top(self.regs[timer_id].heap_idx) && self.need_notify() {
            self.notify(inner);
        }
    }

    pub(crate) fn del_nolock(&mut self, inner: &Inner, id: usize) -> io::Result<()> {
        // Abort an in-progress repeated signal delivery.
        if self.regs[id].interest.is_signal() && self.regs[id].ncalls != 0 {
            self.regs[id].ncalls = 0;
        }

        let mut notify = false;
        if self.regs[id].flags & EVLIST_TIMEOUT != 0 {
            // Removing the earliest timer leaves the loop sleeping on a
            // stale deadline; it has to recompute its wait.
            if self.regs[id].common.is_none() && self.heap.is_top(self.regs[id].heap_idx) {
                notify = true;
            }
            self.queue_remove_timeout(id);
        }
        if self.regs[id].flags & EVLIST_ACTIVE != 0 {
            self.queue_remove_active(id);
        }
        if self.regs[id].flags & EVLIST_INSERTED != 0 {
            self.queue_remove_inserted(id);
            if self.regs[id]
                .interest
                .intersects(Ready::READABLE | Ready::WRITABLE)
            {
                notify |= self.io_del(inner, id)?;
            } else if self.regs[id].interest.is_signal() {
                notify |= SigBridge::del(self, id)?;
            }
        }

        if notify && self.need_notify() {
            self.notify(inner);
        }
        Ok(())
    }

    pub(crate) fn active_nolock(&mut self, inner: &Inner, id: usize, res: Ready, ncalls: u16) {
        if self.regs[id].flags & EVLIST_ACTIVE != 0 {
            self.regs[id].res |= res;
            return;
        }
        self.regs[id].res = res;
        if (self.regs[id].priority as i32) < self.running_priority {
            self.cont = true;
        }
        if self.regs[id].interest.is_signal() {
            self.regs[id].ncalls = ncalls;
        }
        self.queue_insert_active(id);
        if self.need_notify() {
            self.notify(inner);
        }
    }

    pub(crate) fn schedule_deferred(&mut self, inner: &Inner, deferred: &Arc<Deferred>) {
        if !deferred.queued.swap(true, Ordering::AcqRel) {
            self.deferred.push_back(Arc::clone(deferred));
            self.deferred_active += 1;
            if self.need_notify() {
                self.notify(inner);
            }
        }
    }

    pub(crate) fn cancel_deferred(&mut self, deferred: &Arc<Deferred>) {
        if deferred.queued.swap(false, Ordering::AcqRel) {
            if let Some(pos) = self
                .deferred
                .iter()
                .position(|queued| Arc::ptr_eq(queued, deferred))
            {
                self.deferred.remove(pos);
            }
            self.deferred_active -= 1;
        }
    }

    fn timeout_process(&mut self, inner: &Inner) {
        if self.heap.is_empty() {
            return;
        }
        let now = self.now();
        while let Some((deadline, id)) = self.heap.top() {
            if deadline > now {
                break;
            }
            if let Err(err) = self.del_nolock(inner, id) {
                log::warn!("removing expired timer failed: {}", err);
            }
            self.active_nolock(inner, id, Ready::TIMEOUT, 1);
        }
    }

    /// A common-timeout queue's representative timer fired: expire every
    /// due event in insertion order, then re-arm from the new head.
    fn common_timeout_fired(&mut self, inner: &Inner, index: usize) {
        let now = self.now();
        loop {
            let head = match self.common[index].queue.front() {
                Some(&head) => head,
                None => break,
            };
            let deadline = self.regs[head]
                .deadline
                .expect("queued event without deadline");
            if deadline > now {
                break;
            }
            if let Err(err) = self.del_nolock(inner, head) {
                log::warn!("removing expired common-timeout event failed: {}", err);
            }
            self.active_nolock(inner, head, Ready::TIMEOUT, 1);
        }
        if !self.common[index].queue.is_empty() {
            self.common_schedule(inner, index);
        }
    }

    fn run_internal(&mut self, inner: &Inner, which: &Internal) {
        match which {
            Internal::Notify => {
                inner.waker.drain();
                self.is_notify_pending = false;
            }
            Internal::SignalBridge => SigBridge::drain(self, inner),
            Internal::CommonTimeout(index) => self.common_timeout_fired(inner, *index),
            Internal::LoopExit => self.done = true,
        }
    }
}

// ===== the loop =====

fn run_loop(inner: &Arc<Inner>, flags: LoopFlags) -> io::Result<Exit> {
    let mut core = inner.core.lock().unwrap();
    if core.running_loop {
        log::warn!("reactor loop is already running");
        return Err(io::Error::new(
            io::ErrorKind::WouldBlock,
            "event loop already running",
        ));
    }
    core.running_loop = true;
    core.loop_thread = Some(thread::current().id());
    core.clear_time_cache();
    core.done = false;
    core.brk = false;

    let mut ready: Vec<(RawFd, Ready)> = Vec::new();
    let mut retval = Exit::Done;

    let result = loop {
        core.cont = false;

        if core.done || core.brk {
            break Ok(());
        }

        let timeout = if core.n_active() == 0 && !flags.is_nonblock() {
            core.timeout_next()
        } else {
            Some(Duration::ZERO)
        };

        if core.event_count == 0 && core.n_active() == 0 {
            log::debug!("no events registered; leaving loop");
            retval = Exit::Empty;
            break Ok(());
        }

        core.clear_time_cache();

        drop(core);
        ready.clear();
        let res = inner.selector.select(timeout, &mut ready);
        core = inner.core.lock().unwrap();

        if let Err(err) = res {
            break Err(err);
        }

        core.update_time_cache();

        for (fd, what) in ready.drain(..) {
            core.io_active(inner, fd, what);
        }
        core.timeout_process(inner);

        if core.n_active() > 0 {
            let (guard, n) = process_active(inner, core);
            core = guard;
            if n < 0 {
                // A callback broke the loop; observed at the top.
                continue;
            }
            if flags.is_once() && core.n_active() == 0 && n != 0 {
                break Ok(());
            }
        } else if flags.is_nonblock() {
            break Ok(());
        }
    };

    core.clear_time_cache();
    core.running_loop = false;
    core.loop_thread = None;
    result.map(|()| retval)
}

/// Drain activation queues from the highest priority down, then run a
/// bounded batch of deferred callbacks. Returns −1 when a callback broke
/// the loop, else the number of non-internal events handled.
fn process_active<'a>(
    inner: &'a Arc<Inner>,
    mut core: MutexGuard<'a, Core>,
) -> (MutexGuard<'a, Core>, i32) {
    let mut handled = 0;
    let nqueues = core.active.len();
    for priority in 0..nqueues {
        if core.active[priority].is_empty() {
            continue;
        }
        core.running_priority = priority as i32;
        let (guard, count) = process_one_queue(inner, core, priority);
        core = guard;
        if count < 0 {
            core.running_priority = -1;
            return (core, -1);
        } else if count > 0 {
            handled = count;
            break;
        }
    }

    let (guard, broke) = process_deferred(inner, core);
    core = guard;
    core.running_priority = -1;
    if broke {
        return (core, -1);
    }
    (core, handled)
}

fn process_one_queue<'a>(
    inner: &'a Arc<Inner>,
    mut core: MutexGuard<'a, Core>,
    priority: usize,
) -> (MutexGuard<'a, Core>, i32) {
    let mut count = 0;
    while let Some(&id) = core.active[priority].front() {
        let persist = core.regs[id].interest.is_persist();
        if persist {
            core.queue_remove_active(id);
        } else if let Err(err) = core.del_nolock(inner, id) {
            log::warn!("removing dispatched event failed: {}", err);
            core.queue_remove_active(id);
        }
        if !core.regs[id].is_internal() {
            count += 1;
        }

        let gen = core.regs[id].gen;
        core.current_event = Some(id);
        core.current_event_waiters = 0;

        let is_signal = core.regs[id].interest.is_signal();
        core = if is_signal {
            run_signal_closure(inner, core, id, gen)
        } else if persist {
            run_persist_closure(inner, core, id, gen)
        } else {
            run_plain_closure(inner, core, id, gen)
        };

        core.current_event = None;
        if core.current_event_waiters > 0 {
            core.current_event_waiters = 0;
            inner.cond.notify_all();
        }

        let auto_free = core
            .regs
            .get(id)
            .map_or(false, |reg| reg.gen == gen && reg.auto_free);
        if auto_free {
            core.regs.remove(id);
        }

        if core.brk {
            return (core, -1);
        }
        if core.cont {
            break;
        }
    }
    (core, count)
}

fn run_plain_closure<'a>(
    inner: &'a Arc<Inner>,
    mut core: MutexGuard<'a, Core>,
    id: usize,
    gen: u64,
) -> MutexGuard<'a, Core> {
    let fd = core.regs[id].fd;
    let res = core.regs[id].res;

    if matches!(core.regs[id].callback, Callback::Internal(_)) {
        // Internal closures mutate reactor state; they run under the lock.
        let which = match mem::replace(&mut core.regs[id].callback, Callback::Taken) {
            Callback::Internal(which) => which,
            _ => unreachable!(),
        };
        core.run_internal(inner, &which);
        if let Some(reg) = core.regs.get_mut(id) {
            if reg.gen == gen {
                reg.callback = Callback::Internal(which);
            }
        }
        return core;
    }

    let mut cb = mem::replace(&mut core.regs[id].callback, Callback::Taken);
    drop(core);
    match &mut cb {
        Callback::User(func) => func(fd, res),
        Callback::Once(func) => {
            if let Some(func) = func.take() {
                func(fd, res)
            }
        }
        _ => {}
    }
    core = inner.core.lock().unwrap();
    if let Some(reg) = core.regs.get_mut(id) {
        if reg.gen == gen && matches!(reg.callback, Callback::Taken) {
            reg.callback = cb;
        }
    }
    core
}

/// Persistent events with a timeout re-arm before their callback runs:
/// the next expiration keeps the previous phase when the firing was a
/// timer, and resynchronizes from now when a firing was lost to backlog.
fn run_persist_closure<'a>(
    inner: &'a Arc<Inner>,
    mut core: MutexGuard<'a, Core>,
    id: usize,
    gen: u64,
) -> MutexGuard<'a, Core> {
    if let Some(period) = core.regs[id].period {
        let now = core.now();
        let (delay, common) = match period {
            Timeout::After(delay) => (delay, None),
            Timeout::Common(ct) => (ct.duration, Some(ct.index)),
        };
        let relative_to = if core.regs[id].res.is_timeout() {
            core.regs[id].deadline.unwrap_or(now)
        } else {
            now
        };
        let mut run_at = relative_to + delay;
        if run_at < now {
            run_at = now + delay;
        }
        if let Err(err) = core.add_nolock(inner, id, AddTimeout::Abs { at: run_at, common }) {
            log::warn!("re-arming persistent event failed: {}", err);
        }
    }
    run_plain_closure(inner, core, id, gen)
}

/// Signal closures run their callback once per recorded delivery; a
/// delete or a loop break aborts the remaining repetitions.
fn run_signal_closure<'a>(
    inner: &'a Arc<Inner>,
    mut core: MutexGuard<'a, Core>,
    id: usize,
    gen: u64,
) -> MutexGuard<'a, Core> {
    loop {
        let reg = match core.regs.get_mut(id) {
            Some(reg) if reg.gen == gen => reg,
            _ => break,
        };
        if reg.ncalls == 0 {
            break;
        }
        reg.ncalls -= 1;
        let fd = reg.fd;
        let res = reg.res;
        let mut cb = mem::replace(&mut reg.callback, Callback::Taken);
        drop(core);
        if let Callback::User(func) = &mut cb {
            func(fd, res);
        }
        core = inner.core.lock().unwrap();
        if let Some(reg) = core.regs.get_mut(id) {
            if reg.gen == gen && matches!(reg.callback, Callback::Taken) {
                reg.callback = cb;
            }
        }
        if core.brk {
            break;
        }
    }
    core
}

fn process_deferred<'a>(
    inner: &'a Arc<Inner>,
    mut core: MutexGuard<'a, Core>,
) -> (MutexGuard<'a, Core>, bool) {
    let mut count = 0;
    while let Some(deferred) = core.deferred.pop_front() {
        if !deferred.queued.swap(false, Ordering::AcqRel) {
            // Cancelled while queued.
            continue;
        }
        core.deferred_active -= 1;
        drop(core);
        (deferred.func.lock().unwrap())();
        core = inner.core.lock().unwrap();
        if core.brk {
            return (core, true);
        }
        count += 1;
        if count == MAX_DEFERRED {
            break;
        }
    }
    (core, false)
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Restore process-wide signal state before the bridge sockets go
        // away.
        if let Ok(core) = self.core.get_mut() {
            core.sig.teardown();
        }
    }
}

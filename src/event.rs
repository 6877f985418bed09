use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, MutexGuard, Weak};
use std::time::Duration;

use crate::reactor::{
    AddTimeout, Callback, Core, Inner, Reactor, Timeout, EVLIST_ACTIVE,
    EVLIST_INSERTED, EVLIST_TIMEOUT,
};
use crate::ready::Ready;

/// A registration of interest in file-descriptor readiness, signal
/// delivery or a timer.
///
/// Created unarmed; [`add`](Event::add) schedules it with its reactor and
/// [`del`](Event::del) withdraws it. `Event` is a cheap cloneable handle;
/// dropping the last clone removes the registration. Deleting an event
/// whose callback is running on the loop thread blocks until that
/// callback returns, so callers may free callback state right after
/// `del` returns.
///
/// ```no_run
/// use evio::{Event, Reactor, Ready};
///
/// # fn main() -> std::io::Result<()> {
/// # let fd = 0;
/// let reactor = Reactor::new()?;
/// let ev = Event::new(&reactor, fd, Ready::READABLE | Ready::PERSIST, |fd, what| {
///     assert!(what.is_readable());
///     let _ = fd;
/// })?;
/// ev.add(None)?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Event {
    handle: Arc<Handle>,
}

struct Handle {
    reactor: Weak<Inner>,
    id: usize,
}

impl Event {
    /// Create a registration for `fd` with interest mask `what`.
    ///
    /// For signal events `fd` carries the signal number; for pure timers
    /// it is `-1`. Signal interest cannot be combined with readable or
    /// writable interest.
    pub fn new<F>(reactor: &Reactor, fd: RawFd, what: Ready, callback: F) -> io::Result<Event>
    where
        F: FnMut(RawFd, Ready) + Send + 'static,
    {
        if what.is_signal() && what.intersects(Ready::READABLE | Ready::WRITABLE) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "signal interest cannot be combined with I/O interest",
            ));
        }
        let mut core = reactor.inner.core.lock().unwrap();
        let priority = core.default_priority();
        let id = core.register(fd, what, Callback::User(Box::new(callback)), priority, false);
        Ok(Event {
            handle: Arc::new(Handle {
                reactor: Arc::downgrade(&reactor.inner),
                id,
            }),
        })
    }

    fn upgrade(&self) -> io::Result<Arc<Inner>> {
        self.handle.reactor.upgrade().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "reactor was dropped")
        })
    }

    /// Wait until the loop thread finished running this event's callback.
    fn wait_not_current<'a>(
        inner: &'a Inner,
        mut core: MutexGuard<'a, Core>,
        id: usize,
    ) -> MutexGuard<'a, Core> {
        while core.current_event == Some(id) && !core.in_loop_thread() {
            core.current_event_waiters += 1;
            core = inner.cond.wait(core).unwrap();
        }
        core
    }

    /// Replace the fd, interest mask and callback of an event that is not
    /// currently added.
    pub fn assign<F>(&self, fd: RawFd, what: Ready, callback: F) -> io::Result<()>
    where
        F: FnMut(RawFd, Ready) + Send + 'static,
    {
        if what.is_signal() && what.intersects(Ready::READABLE | Ready::WRITABLE) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "signal interest cannot be combined with I/O interest",
            ));
        }
        let inner = self.upgrade()?;
        let mut core = inner.core.lock().unwrap();
        let reg = &mut core.regs[self.handle.id];
        if reg.flags & (EVLIST_INSERTED | EVLIST_ACTIVE | EVLIST_TIMEOUT) != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot reassign a pending event",
            ));
        }
        reg.fd = fd;
        reg.interest = what;
        reg.callback = Callback::User(Box::new(callback));
        reg.res = Ready::EMPTY;
        reg.period = None;
        Ok(())
    }

    /// Arm the event, optionally with a timeout.
    ///
    /// Re-adding an already-armed event only reschedules its timeout.
    pub fn add(&self, timeout: Option<Timeout>) -> io::Result<()> {
        let inner = self.upgrade()?;
        let id = self.handle.id;
        let mut core = inner.core.lock().unwrap();
        if core.regs[id].interest.is_signal() {
            core = Event::wait_not_current(&inner, core, id);
        }
        let add = match timeout {
            Some(timeout) => AddTimeout::Rel(timeout),
            None => AddTimeout::None,
        };
        core.add_nolock(&inner, id, add)
    }

    /// Disarm the event.
    ///
    /// If its callback is running on another thread this blocks until the
    /// callback returns.
    pub fn del(&self) -> io::Result<()> {
        let inner = self.upgrade()?;
        let id = self.handle.id;
        let core = inner.core.lock().unwrap();
        let mut core = Event::wait_not_current(&inner, core, id);
        core.del_nolock(&inner, id)
    }

    /// Make the event active with result `what`, as if the reactor had
    /// observed that readiness. Signal events run their callback `ncalls`
    /// times.
    pub fn active(&self, what: Ready, ncalls: u16) -> io::Result<()> {
        let inner = self.upgrade()?;
        let id = self.handle.id;
        let mut core = inner.core.lock().unwrap();
        if core.regs[id].interest.is_signal() {
            core = Event::wait_not_current(&inner, core, id);
        }
        core.active_nolock(&inner, id, what, ncalls);
        Ok(())
    }

    /// Which of the bits in `what` the event is pending on, and the time
    /// remaining until its timeout (when one is scheduled and `what`
    /// includes [`Ready::TIMEOUT`]).
    pub fn pending(&self, what: Ready) -> (Ready, Option<Duration>) {
        let inner = match self.handle.reactor.upgrade() {
            Some(inner) => inner,
            None => return (Ready::EMPTY, None),
        };
        let core = inner.core.lock().unwrap();
        let reg = &core.regs[self.handle.id];

        let mut flags = Ready::EMPTY;
        if reg.flags & EVLIST_INSERTED != 0 {
            flags |= reg.interest
                & (Ready::READABLE | Ready::WRITABLE | Ready::SIGNAL);
        }
        if reg.flags & EVLIST_ACTIVE != 0 {
            flags |= reg.res;
        }
        if reg.flags & EVLIST_TIMEOUT != 0 {
            flags |= Ready::TIMEOUT;
        }
        let masked = flags
            & what
            & (Ready::READABLE | Ready::WRITABLE | Ready::SIGNAL | Ready::TIMEOUT);

        let remaining = if masked.is_timeout() && what.is_timeout() {
            reg.deadline
                .map(|deadline| deadline.saturating_duration_since(core.now()))
        } else {
            None
        };
        (masked, remaining)
    }

    /// Set the dispatch priority; smaller is served first. Fails while
    /// the event is active or the priority is out of range.
    pub fn set_priority(&self, priority: u8) -> io::Result<()> {
        let inner = self.upgrade()?;
        let mut core = inner.core.lock().unwrap();
        if core.regs[self.handle.id].flags & EVLIST_ACTIVE != 0
            || !core.priority_in_range(priority)
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "priority out of range or event active",
            ));
        }
        core.regs[self.handle.id].priority = priority;
        Ok(())
    }

    /// The file descriptor (or signal number) this event watches.
    pub fn fd(&self) -> RawFd {
        match self.handle.reactor.upgrade() {
            Some(inner) => inner.core.lock().unwrap().regs[self.handle.id].fd,
            None => -1,
        }
    }

    /// The registered interest mask.
    pub fn interest(&self) -> Ready {
        match self.handle.reactor.upgrade() {
            Some(inner) => inner.core.lock().unwrap().regs[self.handle.id].interest,
            None => Ready::EMPTY,
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Event").field("id", &self.handle.id).finish()
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        let inner = match self.reactor.upgrade() {
            Some(inner) => inner,
            None => return,
        };
        let mut core = inner.core.lock().unwrap();
        while core.current_event == Some(self.id) && !core.in_loop_thread() {
            core.current_event_waiters += 1;
            core = inner.cond.wait(core).unwrap();
        }
        if let Err(err) = core.del_nolock(&inner, self.id) {
            log::warn!("removing event on drop failed: {}", err);
        }
        core.regs.try_remove(self.id);
    }
}

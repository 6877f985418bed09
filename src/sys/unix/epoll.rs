use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::sync::Mutex;
use std::time::Duration;

use libc::{EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLOUT};

use crate::backend::{Features, Selector};
use crate::ready::Ready;

const INITIAL_NEVENT: usize = 32;
const MAX_NEVENT: usize = 4096;

// Old Linux kernels overflow on timeouts larger than (LONG_MAX - 999) / HZ
// milliseconds, so cap the wait at 35 minutes and let the caller re-poll.
const MAX_EPOLL_TIMEOUT_MSEC: libc::c_int = 35 * 60 * 1000;

pub(crate) struct Epoll {
    ep: Mutex<OwnedFd>,
    events: Mutex<Vec<libc::epoll_event>>,
}

fn create_epoll_fd() -> io::Result<OwnedFd> {
    // SAFETY: `epoll_create1(2)` ensures the fd is valid.
    Ok(unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) })
}

fn interests_to_epoll(interests: Ready) -> u32 {
    let mut kind = 0;
    if interests.is_edge() {
        kind |= EPOLLET;
    }
    if interests.is_readable() {
        kind |= EPOLLIN;
    }
    if interests.is_writable() {
        kind |= EPOLLOUT;
    }
    kind as u32
}

impl Epoll {
    pub(crate) fn new() -> io::Result<Epoll> {
        Ok(Epoll {
            ep: Mutex::new(create_epoll_fd()?),
            events: Mutex::new(Vec::with_capacity(INITIAL_NEVENT)),
        })
    }

    fn epfd(&self) -> RawFd {
        self.ep.lock().unwrap().as_raw_fd()
    }

    /// Apply `op` for `fd`, falling back between ADD and MOD. An fd may
    /// have been closed and reopened behind our back (MOD then fails with
    /// ENOENT), or dup'ed onto the same underlying file (ADD then fails
    /// with EEXIST).
    fn ctl(&self, op: libc::c_int, fd: RawFd, mask: Ready) -> io::Result<()> {
        let ep = self.epfd();
        let mut event = libc::epoll_event {
            events: interests_to_epoll(mask),
            u64: fd as u64,
        };
        match syscall!(epoll_ctl(ep, op, fd, &mut event)) {
            Ok(_) => Ok(()),
            Err(err) if op == libc::EPOLL_CTL_MOD
                && err.raw_os_error() == Some(libc::ENOENT) =>
            {
                log::debug!("epoll MOD on fd {} retried as ADD", fd);
                syscall!(epoll_ctl(ep, libc::EPOLL_CTL_ADD, fd, &mut event))
                    .map(|_| ())
            }
            Err(err) if op == libc::EPOLL_CTL_ADD
                && err.raw_os_error() == Some(libc::EEXIST) =>
            {
                log::debug!("epoll ADD on fd {} retried as MOD", fd);
                syscall!(epoll_ctl(ep, libc::EPOLL_CTL_MOD, fd, &mut event))
                    .map(|_| ())
            }
            Err(err) => {
                log::warn!("epoll_ctl(op={}) on fd {} failed: {}", op, fd, err);
                Err(err)
            }
        }
    }
}

impl Selector for Epoll {
    fn name(&self) -> &'static str {
        "epoll"
    }

    fn features(&self) -> Features {
        Features::EDGE_TRIGGERED | Features::O1
    }

    fn needs_reinit(&self) -> bool {
        true
    }

    fn reinit(&self) -> io::Result<()> {
        let mut ep = self.ep.lock().unwrap();
        *ep = create_epoll_fd()?;
        Ok(())
    }

    fn add(&self, fd: RawFd, old: Ready, added: Ready) -> io::Result<()> {
        let op = if old.intersects(Ready::READABLE | Ready::WRITABLE) {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        self.ctl(op, fd, old | added)
    }

    fn del(&self, fd: RawFd, old: Ready, removed: Ready) -> io::Result<()> {
        let remaining = old - removed;
        if remaining.intersects(Ready::READABLE | Ready::WRITABLE) {
            return self.ctl(libc::EPOLL_CTL_MOD, fd, remaining);
        }
        let ep = self.epfd();
        match syscall!(epoll_ctl(ep, libc::EPOLL_CTL_DEL, fd, ptr::null_mut())) {
            Ok(_) => Ok(()),
            // The fd was closed before it was deregistered; DEL was
            // unnecessary.
            Err(err)
                if matches!(
                    err.raw_os_error(),
                    Some(libc::ENOENT) | Some(libc::EBADF) | Some(libc::EPERM)
                ) =>
            {
                log::debug!("epoll DEL on fd {} gave {}: unnecessary", fd, err);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn select(
        &self,
        timeout: Option<Duration>,
        ready: &mut Vec<(RawFd, Ready)>,
    ) -> io::Result<()> {
        let msec = std::cmp::min(super::millis(timeout), MAX_EPOLL_TIMEOUT_MSEC);
        let ep = self.epfd();

        let mut events = self.events.lock().unwrap();
        let capacity = std::cmp::max(events.capacity(), INITIAL_NEVENT);
        events.clear();

        let n = match syscall!(epoll_wait(
            ep,
            events.as_mut_ptr(),
            capacity as libc::c_int,
            msec,
        )) {
            Ok(n) => n as usize,
            Err(err) if err.raw_os_error() == Some(libc::EINTR) => return Ok(()),
            Err(err) => return Err(err),
        };
        // SAFETY: `epoll_wait` ensures that `n` events are assigned.
        unsafe { events.set_len(n) };

        for event in events.iter() {
            let bits = event.events as libc::c_int;
            let mut what = Ready::EMPTY;
            if bits & (EPOLLHUP | EPOLLERR) != 0 {
                what = Ready::READABLE | Ready::WRITABLE;
            } else {
                if bits & EPOLLIN != 0 {
                    what |= Ready::READABLE;
                }
                if bits & EPOLLOUT != 0 {
                    what |= Ready::WRITABLE;
                }
            }
            if !what.is_empty() {
                ready.push((event.u64 as RawFd, what));
            }
        }

        // If the buffer filled up, anticipate more events next round.
        if n == capacity && capacity < MAX_NEVENT {
            events.reserve(capacity * 2);
        }
        Ok(())
    }
}

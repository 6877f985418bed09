use std::io;
use std::os::unix::io::RawFd;
use std::sync::Mutex;
use std::time::Duration;

use libc::{POLLERR, POLLHUP, POLLIN, POLLNVAL, POLLOUT};

use crate::backend::{Features, Selector};
use crate::ready::Ready;

pub(crate) struct Poll {
    /// The registered interest set. `select` works on a copy so other
    /// threads can keep changing interests while we are waiting.
    set: Mutex<Vec<libc::pollfd>>,
    copy: Mutex<Vec<libc::pollfd>>,
}

fn interests_to_poll(interests: Ready) -> libc::c_short {
    let mut kind = 0;
    if interests.is_readable() {
        kind |= POLLIN;
    }
    if interests.is_writable() {
        kind |= POLLOUT;
    }
    kind
}

impl Poll {
    pub(crate) fn new() -> io::Result<Poll> {
        Ok(Poll {
            set: Mutex::new(Vec::new()),
            copy: Mutex::new(Vec::new()),
        })
    }
}

impl Selector for Poll {
    fn name(&self) -> &'static str {
        "poll"
    }

    fn features(&self) -> Features {
        Features::ARBITRARY_FDS
    }

    fn needs_reinit(&self) -> bool {
        false
    }

    fn reinit(&self) -> io::Result<()> {
        Ok(())
    }

    fn add(&self, fd: RawFd, old: Ready, added: Ready) -> io::Result<()> {
        let events = interests_to_poll(old | added);
        let mut set = self.set.lock().unwrap();
        match set.iter_mut().find(|pfd| pfd.fd == fd) {
            Some(pfd) => pfd.events = events,
            None => set.push(libc::pollfd {
                fd,
                events,
                revents: 0,
            }),
        }
        Ok(())
    }

    fn del(&self, fd: RawFd, old: Ready, removed: Ready) -> io::Result<()> {
        let remaining = old - removed;
        let mut set = self.set.lock().unwrap();
        let idx = match set.iter().position(|pfd| pfd.fd == fd) {
            Some(idx) => idx,
            None => return Ok(()),
        };
        if remaining.intersects(Ready::READABLE | Ready::WRITABLE) {
            set[idx].events = interests_to_poll(remaining);
        } else {
            set.swap_remove(idx);
        }
        Ok(())
    }

    fn select(
        &self,
        timeout: Option<Duration>,
        ready: &mut Vec<(RawFd, Ready)>,
    ) -> io::Result<()> {
        let mut copy = self.copy.lock().unwrap();
        {
            let set = self.set.lock().unwrap();
            copy.clear();
            copy.extend_from_slice(&set[..]);
        }

        let n = match syscall!(poll(
            copy.as_mut_ptr(),
            copy.len() as libc::nfds_t,
            super::millis(timeout),
        )) {
            Ok(n) => n as usize,
            Err(err) if err.raw_os_error() == Some(libc::EINTR) => return Ok(()),
            Err(err) => return Err(err),
        };
        if n == 0 {
            return Ok(());
        }

        for pfd in copy.iter() {
            let bits = pfd.revents;
            if bits == 0 {
                continue;
            }
            let mut what = Ready::EMPTY;
            if bits & (POLLHUP | POLLERR | POLLNVAL) != 0 {
                what = Ready::READABLE | Ready::WRITABLE;
            }
            if bits & POLLIN != 0 {
                what |= Ready::READABLE;
            }
            if bits & POLLOUT != 0 {
                what |= Ready::WRITABLE;
            }
            if !what.is_empty() {
                ready.push((pfd.fd, what));
            }
        }
        Ok(())
    }
}

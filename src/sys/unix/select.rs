use std::collections::BTreeMap;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::Mutex;
use std::time::Duration;

use crate::backend::{Features, Selector};
use crate::ready::Ready;

pub(crate) struct Select {
    interests: Mutex<BTreeMap<RawFd, Ready>>,
}

impl Select {
    pub(crate) fn new() -> io::Result<Select> {
        Ok(Select {
            interests: Mutex::new(BTreeMap::new()),
        })
    }
}

impl Selector for Select {
    fn name(&self) -> &'static str {
        "select"
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
        if fd as usize >= libc::FD_SETSIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "fd too large for select",
            ));
        }
        let mut interests = self.interests.lock().unwrap();
        interests.insert(fd, old | added);
        Ok(())
    }

    fn del(&self, fd: RawFd, old: Ready, removed: Ready) -> io::Result<()> {
        let remaining = old - removed;
        let mut interests = self.interests.lock().unwrap();
        if remaining.intersects(Ready::READABLE | Ready::WRITABLE) {
            interests.insert(fd, remaining);
        } else {
            interests.remove(&fd);
        }
        Ok(())
    }

    fn select(
        &self,
        timeout: Option<Duration>,
        ready: &mut Vec<(RawFd, Ready)>,
    ) -> io::Result<()> {
        // SAFETY: an all-zero fd_set is a valid empty set.
        let mut readfds: libc::fd_set = unsafe { mem::zeroed() };
        let mut writefds: libc::fd_set = unsafe { mem::zeroed() };
        let mut maxfd: RawFd = -1;

        let snapshot: Vec<(RawFd, Ready)> = {
            let interests = self.interests.lock().unwrap();
            interests.iter().map(|(fd, r)| (*fd, *r)).collect()
        };
        for (fd, interest) in &snapshot {
            if interest.is_readable() {
                unsafe { libc::FD_SET(*fd, &mut readfds) };
            }
            if interest.is_writable() {
                unsafe { libc::FD_SET(*fd, &mut writefds) };
            }
            maxfd = std::cmp::max(maxfd, *fd);
        }

        let mut tv = timeout.map(|to| libc::timeval {
            tv_sec: to.as_secs() as libc::time_t,
            tv_usec: to.subsec_micros() as libc::suseconds_t,
        });
        let tv_ptr = tv
            .as_mut()
            .map(|tv| tv as *mut libc::timeval)
            .unwrap_or(std::ptr::null_mut());

        let n = match syscall!(select(
            maxfd + 1,
            &mut readfds,
            &mut writefds,
            std::ptr::null_mut(),
            tv_ptr,
        )) {
            Ok(n) => n as usize,
            Err(err) if err.raw_os_error() == Some(libc::EINTR) => return Ok(()),
            Err(err) => return Err(err),
        };
        if n == 0 {
            return Ok(());
        }

        for (fd, _) in &snapshot {
            let mut what = Ready::EMPTY;
            if unsafe { libc::FD_ISSET(*fd, &readfds) } {
                what |= Ready::READABLE;
            }
            if unsafe { libc::FD_ISSET(*fd, &writefds) } {
                what |= Ready::WRITABLE;
            }
            if !what.is_empty() {
                ready.push((*fd, what));
            }
        }
        Ok(())
    }
}

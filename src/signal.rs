use std::collections::HashMap;
use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;

use crate::reactor::{AddTimeout, Callback, Core, Inner, Internal};
use crate::ready::Ready;
use crate::sys;

/// One slot per POSIX signal number.
const NSIG: usize = 64;

/// Write end of the owning reactor's bridge socket, published for the
/// signal handler. POSIX handlers are process scope, so this is global.
static BRIDGE_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

/// Which reactor currently owns signal dispatch.
static OWNER: Mutex<Option<usize>> = Mutex::new(None);

/// The process-wide signal handler. Async-signal-safe: it only calls
/// `write(2)` and preserves errno for the interrupted code.
extern "C" fn bridge_handler(signum: libc::c_int) {
    let fd = BRIDGE_WRITE_FD.load(Ordering::Relaxed);
    if fd < 0 {
        return;
    }
    unsafe {
        let saved_errno = *libc::__errno_location();
        let byte = signum as u8;
        libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        *libc::__errno_location() = saved_errno;
    }
}

/// Per-reactor signal state: the socketpair bridge, the signal→events
/// map and the captured previous handlers.
pub(crate) struct SigBridge {
    /// `(read, write)`; the read end is watched by an internal event.
    pair: Option<(OwnedFd, OwnedFd)>,
    bridge_id: Option<usize>,
    map: Vec<Vec<usize>>,
    old_handlers: HashMap<i32, libc::sigaction>,
    owner_token: Option<usize>,
    n_added: usize,
}

impl SigBridge {
    pub(crate) fn new() -> SigBridge {
        SigBridge {
            pair: None,
            bridge_id: None,
            map: Vec::new(),
            old_handlers: HashMap::new(),
            owner_token: None,
            n_added: 0,
        }
    }

    /// Route `core.regs[id]`'s signal through the bridge. Returns true
    /// when the kernel-facing state changed (first event for the signal).
    pub(crate) fn add(core: &mut Core, inner: &Inner, id: usize) -> io::Result<bool> {
        let signum = core.regs[id].fd;
        if signum < 0 || signum as usize >= NSIG {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "signal number out of range",
            ));
        }

        // Only one reactor may own signal dispatch at a time.
        let token = inner as *const Inner as usize;
        {
            let mut owner = OWNER.lock().unwrap();
            match *owner {
                Some(existing) if existing != token => {
                    log::warn!("another reactor already dispatches signals");
                    return Err(io::Error::new(
                        io::ErrorKind::Other,
                        "another reactor already dispatches signals",
                    ));
                }
                _ => *owner = Some(token),
            }
        }
        core.sig.owner_token = Some(token);

        if core.sig.pair.is_none() {
            let (read, write) = sys::socketpair_stream()?;
            BRIDGE_WRITE_FD.store(write.as_raw_fd(), Ordering::Relaxed);
            core.sig.pair = Some((read, write));
        }
        if core.sig.bridge_id.is_none() {
            let fd = core.sig.pair.as_ref().unwrap().0.as_raw_fd();
            let bridge_id = core.register(
                fd,
                Ready::READABLE | Ready::PERSIST,
                Callback::Internal(Internal::SignalBridge),
                0,
                true,
            );
            core.add_nolock(inner, bridge_id, AddTimeout::None)?;
            core.sig.bridge_id = Some(bridge_id);
        }

        let slot = signum as usize;
        if core.sig.map.len() <= slot {
            core.sig.map.resize_with(slot + 1, Vec::new);
        }
        let first = core.sig.map[slot].is_empty();
        if first {
            // SAFETY: an all-zero sigaction is valid; sigemptyset
            // initializes the mask in place.
            let mut action: libc::sigaction = unsafe { mem::zeroed() };
            action.sa_sigaction =
                bridge_handler as extern "C" fn(libc::c_int) as libc::sighandler_t;
            action.sa_flags = libc::SA_RESTART;
            unsafe { libc::sigemptyset(&mut action.sa_mask) };
            let mut old: libc::sigaction = unsafe { mem::zeroed() };
            syscall!(sigaction(signum, &action, &mut old))?;
            core.sig.old_handlers.insert(signum, old);
        }
        core.sig.map[slot].push(id);
        core.sig.n_added += 1;
        Ok(first)
    }

    /// Withdraw `core.regs[id]` from its signal. Restores the previous
    /// handler when it was the last event for that signal.
    pub(crate) fn del(core: &mut Core, id: usize) -> io::Result<bool> {
        let signum = core.regs[id].fd;
        let slot = signum as usize;
        let list = match core.sig.map.get_mut(slot) {
            Some(list) => list,
            None => return Ok(false),
        };
        let before = list.len();
        list.retain(|&eid| eid != id);
        if list.len() == before {
            return Ok(false);
        }
        core.sig.n_added -= 1;
        if !list.is_empty() {
            return Ok(false);
        }
        if let Some(old) = core.sig.old_handlers.remove(&signum) {
            syscall!(sigaction(signum, &old, ptr::null_mut()))?;
        }
        Ok(true)
    }

    /// The bridge socket became readable: tally pending signal bytes and
    /// activate every registered event with its delivery count.
    pub(crate) fn drain(core: &mut Core, inner: &Inner) {
        let fd = match &core.sig.pair {
            Some((read, _)) => read.as_raw_fd(),
            None => return,
        };
        let mut counts = [0u16; NSIG];
        let mut buf = [0u8; 1024];
        loop {
            let n = unsafe {
                libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n <= 0 {
                break;
            }
            for &byte in &buf[..n as usize] {
                if (byte as usize) < NSIG {
                    counts[byte as usize] = counts[byte as usize].saturating_add(1);
                }
            }
        }
        for (signum, &count) in counts.iter().enumerate() {
            if count == 0 {
                continue;
            }
            let ids: Vec<usize> = core
                .sig
                .map
                .get(signum)
                .cloned()
                .unwrap_or_default();
            log::trace!("signal {} delivered {} time(s)", signum, count);
            for id in ids {
                core.active_nolock(inner, id, Ready::SIGNAL, count);
            }
        }
    }

    /// Restore captured handlers and release process-wide ownership.
    pub(crate) fn teardown(&mut self) {
        if self.n_added > 0 {
            log::debug!(
                "tearing down with {} signal event(s) still registered",
                self.n_added
            );
        }
        for (signum, old) in self.old_handlers.drain() {
            unsafe {
                libc::sigaction(signum, &old, ptr::null_mut());
            }
        }
        if let Some((_, write)) = &self.pair {
            let _ = BRIDGE_WRITE_FD.compare_exchange(
                write.as_raw_fd(),
                -1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            );
        }
        if let Some(token) = self.owner_token.take() {
            let mut owner = OWNER.lock().unwrap();
            if *owner == Some(token) {
                *owner = None;
            }
        }
    }
}

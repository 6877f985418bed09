use std::fmt;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, Weak};

use crate::event::Event;
use crate::reactor::Reactor;
use crate::ready::Ready;
use crate::sys;

type AcceptCb = Box<dyn FnMut(RawFd, SocketAddr) + Send>;
type ErrorCb = Box<dyn FnMut(io::Error) + Send>;

struct LState {
    fd: RawFd,
    event: Option<Event>,
    enabled: bool,
    close_on_free: bool,
    accept_cb: Option<AcceptCb>,
    error_cb: Option<ErrorCb>,
}

struct LInner {
    reactor: Reactor,
    state: Mutex<LState>,
}

/// A listening socket that accepts connections from the event loop and
/// hands each new descriptor (already nonblocking and close-on-exec) to
/// a callback.
///
/// ```no_run
/// use evio::{Listener, Reactor};
///
/// # fn main() -> std::io::Result<()> {
/// let reactor = Reactor::new()?;
/// let listener = Listener::bind(
///     &reactor,
///     &"127.0.0.1:0".parse().unwrap(),
///     128,
///     |fd, peer| println!("fd {} connected from {}", fd, peer),
/// )?;
/// println!("listening on {}", listener.local_addr()?);
/// reactor.dispatch()?;
/// # Ok(())
/// # }
/// ```
pub struct Listener {
    inner: Arc<LInner>,
}

impl fmt::Debug for Listener {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock().unwrap();
        fmt.debug_struct("Listener")
            .field("fd", &state.fd)
            .field("enabled", &state.enabled)
            .finish()
    }
}

fn accept_loop(inner: &Arc<LInner>, fd: RawFd) {
    loop {
        // SAFETY: an all-zero sockaddr_storage is a valid out-param.
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let new_fd = match syscall!(accept4(
            fd,
            &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )) {
            Ok(new_fd) => new_fd,
            Err(err) => match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => return,
                // The peer went away between readiness and accept.
                Some(libc::ECONNABORTED) => continue,
                _ => {
                    log::warn!("accept on fd {} failed: {}", fd, err);
                    let cb = {
                        let mut state = inner.state.lock().unwrap();
                        state.error_cb.take()
                    };
                    if let Some(mut cb) = cb {
                        cb(err);
                        let mut state = inner.state.lock().unwrap();
                        if state.error_cb.is_none() {
                            state.error_cb = Some(cb);
                        }
                    }
                    return;
                }
            },
        };
        let peer = match sys::from_sockaddr(&storage) {
            Ok(peer) => peer,
            Err(err) => {
                log::warn!("unparseable peer address: {}", err);
                unsafe { libc::close(new_fd) };
                continue;
            }
        };

        // The callback slot is taken out so user code may re-enter the
        // listener.
        let cb = {
            let mut state = inner.state.lock().unwrap();
            state.accept_cb.take()
        };
        match cb {
            Some(mut cb) => {
                cb(new_fd, peer);
                let mut state = inner.state.lock().unwrap();
                if state.accept_cb.is_none() {
                    state.accept_cb = Some(cb);
                }
            }
            None => unsafe {
                libc::close(new_fd);
            },
        }
    }
}

impl Listener {
    /// Wrap an already-bound listening descriptor. A positive `backlog`
    /// calls `listen(2)`; pass `0` when the fd is already listening.
    pub fn new<F>(
        reactor: &Reactor,
        fd: RawFd,
        backlog: i32,
        close_on_free: bool,
        accept_cb: F,
    ) -> io::Result<Listener>
    where
        F: FnMut(RawFd, SocketAddr) + Send + 'static,
    {
        if backlog > 0 {
            syscall!(listen(fd, backlog))?;
        }
        sys::set_nonblocking(fd)?;
        sys::set_cloexec(fd)?;

        let inner = Arc::new(LInner {
            reactor: reactor.clone(),
            state: Mutex::new(LState {
                fd,
                event: None,
                enabled: false,
                close_on_free,
                accept_cb: Some(Box::new(accept_cb)),
                error_cb: None,
            }),
        });

        let weak: Weak<LInner> = Arc::downgrade(&inner);
        let event = Event::new(
            reactor,
            fd,
            Ready::READABLE | Ready::PERSIST,
            move |fd, _| {
                if let Some(inner) = weak.upgrade() {
                    accept_loop(&inner, fd);
                }
            },
        )?;
        inner.state.lock().unwrap().event = Some(event);

        let listener = Listener { inner };
        listener.enable()?;
        Ok(listener)
    }

    /// Create a socket, bind it to `addr` with `SO_REUSEADDR`, listen,
    /// and start accepting.
    pub fn bind<F>(
        reactor: &Reactor,
        addr: &SocketAddr,
        backlog: i32,
        accept_cb: F,
    ) -> io::Result<Listener>
    where
        F: FnMut(RawFd, SocketAddr) + Send + 'static,
    {
        let family = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };
        let fd = syscall!(socket(
            family,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        ))?;
        let close_on_err = |err: io::Error| {
            unsafe { libc::close(fd) };
            err
        };

        let one: libc::c_int = 1;
        syscall!(setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        ))
        .map_err(close_on_err)?;

        let (storage, len) = sys::to_sockaddr(addr);
        syscall!(bind(
            fd,
            &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
            len,
        ))
        .map_err(close_on_err)?;

        let backlog = if backlog > 0 { backlog } else { 128 };
        Listener::new(reactor, fd, backlog, true, accept_cb).map_err(close_on_err)
    }

    /// Install a callback for fatal accept errors.
    pub fn set_error_callback<F>(&self, callback: F)
    where
        F: FnMut(io::Error) + Send + 'static,
    {
        self.inner.state.lock().unwrap().error_cb = Some(Box::new(callback));
    }

    /// Start accepting (idempotent).
    pub fn enable(&self) -> io::Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        state.enabled = true;
        match &state.event {
            Some(event) => event.add(None),
            None => Ok(()),
        }
    }

    /// Stop accepting; queued connections stay pending in the kernel.
    pub fn disable(&self) -> io::Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        state.enabled = false;
        match &state.event {
            Some(event) => event.del(),
            None => Ok(()),
        }
    }

    /// The listening descriptor.
    pub fn fd(&self) -> RawFd {
        self.inner.state.lock().unwrap().fd
    }

    /// The bound address, useful after binding port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let fd = self.fd();
        // SAFETY: an all-zero sockaddr_storage is a valid out-param.
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        syscall!(getsockname(
            fd,
            &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut len,
        ))?;
        sys::from_sockaddr(&storage)
    }

    /// The reactor this listener accepts on.
    pub fn reactor(&self) -> Reactor {
        self.inner.reactor.clone()
    }
}

impl Drop for LInner {
    fn drop(&mut self) {
        if let Ok(state) = self.state.get_mut() {
            state.event = None;
            if state.close_on_free && state.fd >= 0 {
                unsafe { libc::close(state.fd) };
            }
        }
    }
}

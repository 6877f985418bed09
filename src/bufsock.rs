use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::ops;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::buffer::{Buffer, CallbackHandle};
use crate::event::Event;
use crate::reactor::{Deferred, Reactor, Timeout};
use crate::ready::Ready;
use crate::sys;

/// Read and write ceilings for one readiness-triggered I/O round.
const READ_MAX: usize = 16384;
const WRITE_MAX: usize = 16384;

/// Read/write suspension reason: the watermark logic paused this
/// direction.
const SUSPEND_WM: u16 = 0x01;

/// What happened on a buffered socket, delivered to the event callback.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct SocketEvents(u16);

impl SocketEvents {
    /// The empty set.
    pub const EMPTY: SocketEvents = SocketEvents(0);

    /// The condition arose while reading.
    pub const READING: SocketEvents = SocketEvents(0x01);

    /// The condition arose while writing.
    pub const WRITING: SocketEvents = SocketEvents(0x02);

    /// The peer closed the connection.
    pub const EOF: SocketEvents = SocketEvents(0x10);

    /// An unrecoverable error was observed; see
    /// [`BufferedSocket::last_error`].
    pub const ERROR: SocketEvents = SocketEvents(0x20);

    /// A read or write timeout expired.
    pub const TIMEOUT: SocketEvents = SocketEvents(0x40);

    /// The outbound connection completed.
    pub const CONNECTED: SocketEvents = SocketEvents(0x80);

    /// Returns true if all bits of `other` are present.
    pub const fn contains(self, other: SocketEvents) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Returns true if no bit is set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    fn remove(&mut self, other: SocketEvents) {
        self.0 &= !other.0;
    }
}

impl ops::BitOr for SocketEvents {
    type Output = SocketEvents;

    fn bitor(self, other: SocketEvents) -> SocketEvents {
        SocketEvents(self.0 | other.0)
    }
}

impl ops::BitOrAssign for SocketEvents {
    fn bitor_assign(&mut self, other: SocketEvents) {
        self.0 |= other.0;
    }
}

impl fmt::Debug for SocketEvents {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut one = false;
        let flags = [
            (SocketEvents::READING, "READING"),
            (SocketEvents::WRITING, "WRITING"),
            (SocketEvents::EOF, "EOF"),
            (SocketEvents::ERROR, "ERROR"),
            (SocketEvents::TIMEOUT, "TIMEOUT"),
            (SocketEvents::CONNECTED, "CONNECTED"),
        ];
        for (flag, msg) in &flags {
            if self.contains(*flag) {
                if one {
                    write!(fmt, " | ")?;
                }
                write!(fmt, "{}", msg)?;
                one = true;
            }
        }
        if !one {
            fmt.write_str("(empty)")?;
        }
        Ok(())
    }
}

/// Construction options for [`BufferedSocket::new`].
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct SocketOptions(u8);

impl SocketOptions {
    /// No options.
    pub const EMPTY: SocketOptions = SocketOptions(0);

    /// Close the file descriptor when the socket is dropped.
    pub const CLOSE_ON_FREE: SocketOptions = SocketOptions(0x01);

    /// Accepted for compatibility; buffered sockets are always safe to
    /// share across threads.
    pub const THREAD_SAFE: SocketOptions = SocketOptions(0x02);

    /// Run user callbacks from the reactor's deferred queue instead of
    /// inline.
    pub const DEFER_CALLBACKS: SocketOptions = SocketOptions(0x04);

    /// Release internal locks around user callbacks. Requires
    /// [`DEFER_CALLBACKS`](SocketOptions::DEFER_CALLBACKS).
    pub const UNLOCK_CALLBACKS: SocketOptions = SocketOptions(0x08);

    /// Returns true if all bits of `other` are present.
    pub const fn contains(self, other: SocketOptions) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl ops::BitOr for SocketOptions {
    type Output = SocketOptions;

    fn bitor(self, other: SocketOptions) -> SocketOptions {
        SocketOptions(self.0 | other.0)
    }
}

type DataCb = Box<dyn FnMut(&BufferedSocket) + Send>;
type EventCb = Box<dyn FnMut(&BufferedSocket, SocketEvents) + Send>;

pub(crate) struct BsState {
    fd: RawFd,
    options: SocketOptions,
    enabled: Ready,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    wm_read: (usize, usize),
    wm_write: (usize, usize),
    read_suspended: u16,
    write_suspended: u16,
    connecting: bool,
    connection_refused: bool,
    read_event: Option<Event>,
    write_event: Option<Event>,
    read_cb: Option<DataCb>,
    write_cb: Option<DataCb>,
    event_cb: Option<EventCb>,
    read_wm_cb: Option<CallbackHandle>,
    outbuf_cb: Option<CallbackHandle>,
    deferred: Option<Arc<Deferred>>,
    readcb_pending: bool,
    writecb_pending: bool,
    eventcb_pending: SocketEvents,
    errno_pending: Option<i32>,
    last_error: Option<i32>,
}

pub(crate) struct BsInner {
    reactor: Reactor,
    input: Buffer,
    output: Buffer,
    transport: Box<dyn Transport>,
    state: Mutex<BsState>,
}

/// The pluggable backing of a buffered socket: how enabling, disabling,
/// teardown, timeout adjustment, flushing and fd changes are carried out.
/// The plain-socket transport is the one provided here; filtered
/// transports can substitute their own.
pub(crate) trait Transport: Send + Sync {
    fn enable(&self, bs: &Arc<BsInner>, st: &mut BsState, what: Ready) -> io::Result<()>;
    fn disable(&self, bs: &Arc<BsInner>, st: &mut BsState, what: Ready) -> io::Result<()>;
    fn adj_timeouts(&self, bs: &Arc<BsInner>, st: &mut BsState) -> io::Result<()>;
    fn flush(&self, bs: &Arc<BsInner>, st: &mut BsState, what: Ready) -> io::Result<()>;
    fn set_fd(&self, bs: &Arc<BsInner>, st: &mut BsState, fd: RawFd) -> io::Result<()>;
    fn destruct(&self, st: &mut BsState);
}

struct SocketTransport;

/// A socket paired with an input and an output [`Buffer`], driven by a
/// [`Reactor`].
///
/// Readable readiness fills the input buffer and invokes the read
/// callback once the low watermark is reached; bytes appended to the
/// output buffer are flushed whenever the socket accepts them. Errors,
/// EOF, timeouts and connect completion arrive at the event callback.
///
/// `BufferedSocket` is a cheap cloneable handle.
#[derive(Clone)]
pub struct BufferedSocket {
    inner: Arc<BsInner>,
}

impl fmt::Debug for BufferedSocket {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock().unwrap();
        fmt.debug_struct("BufferedSocket")
            .field("fd", &state.fd)
            .field("enabled", &state.enabled)
            .finish()
    }
}

fn is_retriable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// What `connect(2)` on a nonblocking socket reported.
enum ConnectProgress {
    Connected,
    InProgress,
    Refused,
}

fn start_connect(fd: RawFd, addr: &SocketAddr) -> io::Result<ConnectProgress> {
    let (storage, len) = sys::to_sockaddr(addr);
    match syscall!(connect(
        fd,
        &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
        len,
    )) {
        Ok(_) => Ok(ConnectProgress::Connected),
        Err(err) => match err.raw_os_error() {
            Some(libc::EINTR) | Some(libc::EINPROGRESS) => Ok(ConnectProgress::InProgress),
            Some(libc::ECONNREFUSED) => Ok(ConnectProgress::Refused),
            _ => Err(err),
        },
    }
}

/// Query whether a nonblocking connect finished: `1` connected, `0`
/// still in progress, `-1` failed (with the error in the result).
fn finished_connecting(fd: RawFd) -> (i32, Option<i32>) {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let res = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if res < 0 {
        return (-1, io::Error::last_os_error().raw_os_error());
    }
    if err == 0 {
        (1, None)
    } else if err == libc::EINTR || err == libc::EINPROGRESS {
        (0, None)
    } else {
        (-1, Some(err))
    }
}

impl BufferedSocket {
    /// Wrap `fd` (or `-1` for a socket to be created by
    /// [`connect`](BufferedSocket::connect)) in a buffered socket on
    /// `reactor`.
    ///
    /// Writing is enabled by default; reading starts after
    /// [`enable`](BufferedSocket::enable) with
    /// [`Ready::READABLE`].
    pub fn new(
        reactor: &Reactor,
        fd: RawFd,
        options: SocketOptions,
    ) -> io::Result<BufferedSocket> {
        if options.contains(SocketOptions::UNLOCK_CALLBACKS)
            && !options.contains(SocketOptions::DEFER_CALLBACKS)
        {
            log::warn!("UNLOCK_CALLBACKS requires DEFER_CALLBACKS");
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "UNLOCK_CALLBACKS requires DEFER_CALLBACKS",
            ));
        }

        let input = Buffer::new();
        let output = Buffer::new();
        output.set_drains_to_fd(true);

        let inner = Arc::new(BsInner {
            reactor: reactor.clone(),
            input,
            output,
            transport: Box::new(SocketTransport),
            state: Mutex::new(BsState {
                fd,
                options,
                enabled: Ready::WRITABLE,
                read_timeout: None,
                write_timeout: None,
                wm_read: (0, 0),
                wm_write: (0, 0),
                read_suspended: 0,
                write_suspended: 0,
                connecting: false,
                connection_refused: false,
                read_event: None,
                write_event: None,
                read_cb: None,
                write_cb: None,
                event_cb: None,
                read_wm_cb: None,
                outbuf_cb: None,
                deferred: None,
                readcb_pending: false,
                writecb_pending: false,
                eventcb_pending: SocketEvents::EMPTY,
                errno_pending: None,
                last_error: None,
            }),
        });

        BsInner::assign_events(&inner, fd)?;

        // Appending to the output buffer arms the write event.
        let weak = Arc::downgrade(&inner);
        let outbuf_cb = inner.output.add_cb(move |_, info| {
            if info.n_added > 0 {
                if let Some(bs) = weak.upgrade() {
                    BsInner::output_grew(&bs);
                }
            }
        });

        if options.contains(SocketOptions::DEFER_CALLBACKS) {
            let weak = Arc::downgrade(&inner);
            let deferred = Deferred::new(move || {
                if let Some(bs) = weak.upgrade() {
                    BsInner::run_deferred(&bs);
                }
            });
            inner.state.lock().unwrap().deferred = Some(deferred);
        }
        inner.state.lock().unwrap().outbuf_cb = Some(outbuf_cb);

        // Callbacks must not touch bytes while I/O is in flight: the
        // input tail and the output head stay frozen outside our own
        // read/write calls.
        inner.input.freeze(false);
        inner.output.freeze(true);

        Ok(BufferedSocket { inner })
    }

    /// The input (read-side) buffer.
    pub fn input(&self) -> Buffer {
        self.inner.input.clone()
    }

    /// The output (write-side) buffer.
    pub fn output(&self) -> Buffer {
        self.inner.output.clone()
    }

    /// The underlying descriptor, `-1` if none is attached.
    pub fn fd(&self) -> RawFd {
        self.inner.state.lock().unwrap().fd
    }

    /// Attach a different descriptor, re-arming enabled directions.
    pub fn set_fd(&self, fd: RawFd) -> io::Result<()> {
        let mut st = self.inner.state.lock().unwrap();
        self.inner.transport.set_fd(&self.inner, &mut st, fd)
    }

    /// Append `data` to the output buffer; it is flushed as the socket
    /// accepts it.
    pub fn write(&self, data: &[u8]) -> io::Result<()> {
        self.inner.output.add(data)
    }

    /// Move an entire buffer into the output buffer without copying.
    pub fn write_buffer(&self, src: &Buffer) -> io::Result<()> {
        self.inner.output.add_buffer(src)
    }

    /// Copy and drain up to `out.len()` bytes from the input buffer.
    pub fn read(&self, out: &mut [u8]) -> io::Result<usize> {
        self.inner.input.remove(out)
    }

    /// Move the whole input buffer into `dst` without copying.
    pub fn read_buffer(&self, dst: &Buffer) -> io::Result<()> {
        dst.add_buffer(&self.inner.input)
    }

    /// Install the read-side callback, invoked when the input buffer
    /// reaches its low watermark.
    pub fn set_read_callback<F>(&self, callback: F)
    where
        F: FnMut(&BufferedSocket) + Send + 'static,
    {
        self.inner.state.lock().unwrap().read_cb = Some(Box::new(callback));
    }

    /// Install the write-side callback, invoked when the output buffer
    /// drains to its low watermark.
    pub fn set_write_callback<F>(&self, callback: F)
    where
        F: FnMut(&BufferedSocket) + Send + 'static,
    {
        self.inner.state.lock().unwrap().write_cb = Some(Box::new(callback));
    }

    /// Install the event callback for EOF, errors, timeouts and connect
    /// completion.
    pub fn set_event_callback<F>(&self, callback: F)
    where
        F: FnMut(&BufferedSocket, SocketEvents) + Send + 'static,
    {
        self.inner.state.lock().unwrap().event_cb = Some(Box::new(callback));
    }

    /// Remove all three callbacks.
    pub fn clear_callbacks(&self) {
        let mut st = self.inner.state.lock().unwrap();
        st.read_cb = None;
        st.write_cb = None;
        st.event_cb = None;
    }

    /// Enable reading and/or writing.
    pub fn enable(&self, what: Ready) -> io::Result<()> {
        let mut st = self.inner.state.lock().unwrap();
        let mut impl_events = what;
        if st.read_suspended != 0 {
            impl_events = impl_events - Ready::READABLE;
        }
        if st.write_suspended != 0 {
            impl_events = impl_events - Ready::WRITABLE;
        }
        st.enabled |= what;
        if !impl_events.is_empty() {
            self.inner.transport.enable(&self.inner, &mut st, impl_events)?;
        }
        Ok(())
    }

    /// Disable reading and/or writing.
    pub fn disable(&self, what: Ready) -> io::Result<()> {
        let mut st = self.inner.state.lock().unwrap();
        st.enabled = st.enabled - what;
        self.inner.transport.disable(&self.inner, &mut st, what)
    }

    /// Which directions are enabled.
    pub fn enabled(&self) -> Ready {
        self.inner.state.lock().unwrap().enabled
    }

    /// Set (or clear, with `None`) the inactivity timeouts. A direction
    /// that stays unready this long delivers a TIMEOUT event.
    pub fn set_timeouts(
        &self,
        read: Option<Duration>,
        write: Option<Duration>,
    ) -> io::Result<()> {
        let mut st = self.inner.state.lock().unwrap();
        st.read_timeout = read;
        st.write_timeout = write;
        self.inner.transport.adj_timeouts(&self.inner, &mut st)
    }

    /// Set the low/high watermark pair for the given direction(s).
    ///
    /// A read high watermark pauses reading while the input buffer holds
    /// at least that many bytes; zero clears it.
    pub fn set_watermark(&self, what: Ready, low: usize, high: usize) {
        let mut st = self.inner.state.lock().unwrap();
        if what.is_writable() {
            st.wm_write = (low, high);
        }
        if what.is_readable() {
            st.wm_read = (low, high);
            if high != 0 {
                if st.read_wm_cb.is_none() {
                    let weak = Arc::downgrade(&self.inner);
                    let handle = self.inner.input.add_cb(move |buf, _| {
                        if let Some(bs) = weak.upgrade() {
                            let mut st = bs.state.lock().unwrap();
                            let high = st.wm_read.1;
                            if high != 0 && buf.len() >= high {
                                BsInner::suspend_read_locked(&bs, &mut st, SUSPEND_WM);
                            } else {
                                BsInner::unsuspend_read_locked(&bs, &mut st, SUSPEND_WM);
                            }
                        }
                    });
                    st.read_wm_cb = Some(handle);
                }
                if let Some(handle) = &st.read_wm_cb {
                    handle.set_enabled(true);
                    handle.set_nodefer(true);
                }
                if self.inner.input.len() >= high {
                    BsInner::suspend_read_locked(&self.inner, &mut st, SUSPEND_WM);
                } else {
                    BsInner::unsuspend_read_locked(&self.inner, &mut st, SUSPEND_WM);
                }
            } else {
                if let Some(handle) = &st.read_wm_cb {
                    handle.set_enabled(false);
                }
                BsInner::unsuspend_read_locked(&self.inner, &mut st, SUSPEND_WM);
            }
        }
    }

    /// Connect to `addr`, creating a nonblocking socket when none is
    /// attached. Completion (or refusal) is delivered to the event
    /// callback once the socket becomes writable.
    pub fn connect(&self, addr: &SocketAddr) -> io::Result<()> {
        let mut st = self.inner.state.lock().unwrap();
        let mut owned = false;
        if st.fd < 0 {
            let family = match addr {
                SocketAddr::V4(_) => libc::AF_INET,
                SocketAddr::V6(_) => libc::AF_INET6,
            };
            let fd = syscall!(socket(
                family,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            ))?;
            owned = true;
            if let Err(err) = self.inner.transport.set_fd(&self.inner, &mut st, fd) {
                unsafe { libc::close(fd) };
                return Err(err);
            }
        }

        let progress = match start_connect(st.fd, addr) {
            Ok(progress) => progress,
            Err(err) => {
                if owned {
                    let fd = st.fd;
                    let _ = self.inner.transport.set_fd(&self.inner, &mut st, -1);
                    unsafe { libc::close(fd) };
                }
                st.last_error = err.raw_os_error();
                drop(st);
                BsInner::run_event_cb(&self.inner, SocketEvents::ERROR, err.raw_os_error());
                return Err(err);
            }
        };

        st.connecting = true;
        match progress {
            ConnectProgress::InProgress => {
                self.inner
                    .transport
                    .enable(&self.inner, &mut st, Ready::WRITABLE)?;
            }
            ConnectProgress::Connected => {
                if let Some(ev) = &st.write_event {
                    ev.active(Ready::WRITABLE, 1)?;
                }
            }
            ConnectProgress::Refused => {
                st.connection_refused = true;
                if let Some(ev) = &st.write_event {
                    ev.active(Ready::WRITABLE, 1)?;
                }
            }
        }
        Ok(())
    }

    /// Set the dispatch priority of the underlying events.
    pub fn set_priority(&self, priority: u8) -> io::Result<()> {
        let st = self.inner.state.lock().unwrap();
        if let Some(ev) = &st.read_event {
            ev.set_priority(priority)?;
        }
        if let Some(ev) = &st.write_event {
            ev.set_priority(priority)?;
        }
        Ok(())
    }

    /// Force-flush a direction. The plain socket transport flushes as
    /// readiness allows, so this is a no-op provided for transports that
    /// buffer internally.
    pub fn flush(&self, what: Ready) -> io::Result<()> {
        let mut st = self.inner.state.lock().unwrap();
        self.inner.transport.flush(&self.inner, &mut st, what)
    }

    /// The last socket-level error observed, for use from the event
    /// callback.
    pub fn last_error(&self) -> Option<io::Error> {
        self.inner
            .state
            .lock()
            .unwrap()
            .last_error
            .map(io::Error::from_raw_os_error)
    }
}

impl BsInner {
    /// (Re)bind the read and write events to `fd`.
    fn assign_events(this: &Arc<BsInner>, fd: RawFd) -> io::Result<()> {
        let weak = Arc::downgrade(this);
        let read_event = Event::new(
            &this.reactor,
            fd,
            Ready::READABLE | Ready::PERSIST,
            move |_, what| {
                if let Some(bs) = weak.upgrade() {
                    BsInner::read_ready(&bs, what);
                }
            },
        )?;
        let weak = Arc::downgrade(this);
        let write_event = Event::new(
            &this.reactor,
            fd,
            Ready::WRITABLE | Ready::PERSIST,
            move |_, what| {
                if let Some(bs) = weak.upgrade() {
                    BsInner::write_ready(&bs, what);
                }
            },
        )?;
        let mut st = this.state.lock().unwrap();
        st.fd = fd;
        st.read_event = Some(read_event);
        st.write_event = Some(write_event);
        Ok(())
    }

    fn add_read_event(st: &mut BsState) -> io::Result<()> {
        let timeout = st.read_timeout.map(Timeout::After);
        match &st.read_event {
            Some(ev) => ev.add(timeout),
            None => Ok(()),
        }
    }

    fn add_write_event(st: &mut BsState) -> io::Result<()> {
        let timeout = st.write_timeout.map(Timeout::After);
        match &st.write_event {
            Some(ev) => ev.add(timeout),
            None => Ok(()),
        }
    }

    /// While any reason bit is set the readable registration stays
    /// withdrawn; clearing the last bit re-adds it if reading is enabled.
    fn suspend_read_locked(this: &Arc<BsInner>, st: &mut BsState, reason: u16) {
        if st.read_suspended == 0 {
            let _ = this.transport.disable_impl(st, Ready::READABLE);
        }
        st.read_suspended |= reason;
    }

    fn unsuspend_read_locked(_this: &Arc<BsInner>, st: &mut BsState, reason: u16) {
        st.read_suspended &= !reason;
        if st.read_suspended == 0 && st.enabled.is_readable() {
            let _ = BsInner::add_read_event(st);
        }
    }

    /// The output buffer gained bytes: start writing if we are enabled
    /// for it and not already waiting for writability.
    fn output_grew(this: &Arc<BsInner>) {
        let mut st = this.state.lock().unwrap();
        if !st.enabled.is_writable() || st.write_suspended != 0 {
            return;
        }
        let already = st
            .write_event
            .as_ref()
            .map_or(false, |ev| !ev.pending(Ready::WRITABLE).0.is_empty());
        if !already {
            if let Err(err) = BsInner::add_write_event(&mut st) {
                log::warn!("arming write event failed: {}", err);
            }
        }
    }

    fn read_ready(this: &Arc<BsInner>, what: Ready) {
        if what.is_timeout() && !what.is_readable() {
            BsInner::read_write_error(
                this,
                Ready::READABLE,
                SocketEvents::READING | SocketEvents::TIMEOUT,
                None,
            );
            return;
        }

        let (fd, suspended, high) = {
            let st = this.state.lock().unwrap();
            (st.fd, st.read_suspended != 0, st.wm_read.1)
        };

        // With a high watermark, never read past it.
        let mut howmuch = None;
        if high != 0 {
            let len = this.input.len();
            if len >= high {
                let mut st = this.state.lock().unwrap();
                BsInner::suspend_read_locked(this, &mut st, SUSPEND_WM);
                return;
            }
            howmuch = Some(high - len);
        }
        let howmuch = match howmuch {
            Some(h) if h < READ_MAX => h,
            _ => READ_MAX,
        };
        if suspended {
            return;
        }

        this.input.unfreeze(false);
        let res = this.input.read(fd, Some(howmuch));
        this.input.freeze(false);

        match res {
            Ok(0) => {
                BsInner::read_write_error(
                    this,
                    Ready::READABLE,
                    SocketEvents::READING | SocketEvents::EOF,
                    None,
                );
                return;
            }
            Ok(_) => {}
            Err(ref err) if is_retriable(err) => return,
            Err(err) => {
                BsInner::read_write_error(
                    this,
                    Ready::READABLE,
                    SocketEvents::READING | SocketEvents::ERROR,
                    err.raw_os_error(),
                );
                return;
            }
        }

        let low = this.state.lock().unwrap().wm_read.0;
        if this.input.len() >= low {
            BsInner::run_read_cb(this);
        }
    }

    fn write_ready(this: &Arc<BsInner>, what: Ready) {
        if what.is_timeout() && !what.is_writable() {
            BsInner::read_write_error(
                this,
                Ready::WRITABLE,
                SocketEvents::WRITING | SocketEvents::TIMEOUT,
                None,
            );
            return;
        }

        let mut connected = false;
        {
            let mut st = this.state.lock().unwrap();
            if st.connecting {
                let (c, err) = if st.connection_refused {
                    st.connection_refused = false;
                    (-1, Some(libc::ECONNREFUSED))
                } else {
                    finished_connecting(st.fd)
                };
                if c == 0 {
                    return;
                }
                st.connecting = false;
                if c < 0 {
                    if let Some(ev) = &st.write_event {
                        let _ = ev.del();
                    }
                    if let Some(ev) = &st.read_event {
                        let _ = ev.del();
                    }
                    st.last_error = err;
                    drop(st);
                    BsInner::run_event_cb(this, SocketEvents::ERROR, err);
                    return;
                }
                connected = true;
                drop(st);
                BsInner::run_event_cb(this, SocketEvents::CONNECTED, None);
                let st2 = this.state.lock().unwrap();
                if !st2.enabled.is_writable() || st2.write_suspended != 0 {
                    if let Some(ev) = &st2.write_event {
                        let _ = ev.del();
                    }
                    return;
                }
            }
        }

        let (fd, suspended) = {
            let st = this.state.lock().unwrap();
            (st.fd, st.write_suspended != 0)
        };
        if suspended {
            return;
        }

        let mut res = 0;
        if !this.output.is_empty() {
            this.output.unfreeze(true);
            let write_res = this.output.write_atmost(fd, Some(WRITE_MAX));
            this.output.freeze(true);
            res = match write_res {
                Ok(n) => n,
                Err(ref err) if is_retriable(err) => 0,
                Err(err) => {
                    BsInner::read_write_error(
                        this,
                        Ready::WRITABLE,
                        SocketEvents::WRITING | SocketEvents::ERROR,
                        err.raw_os_error(),
                    );
                    return;
                }
            };
        }

        // Once drained, stop watching writability so a level-triggered
        // backend does not storm us.
        if this.output.is_empty() {
            let st = this.state.lock().unwrap();
            if let Some(ev) = &st.write_event {
                let _ = ev.del();
            }
        }

        let low = this.state.lock().unwrap().wm_write.0;
        if (res != 0 || !connected) && this.output.len() <= low {
            BsInner::run_write_cb(this);
        }
    }

    /// Shared error tail of the read and write paths: disable the
    /// direction, then report.
    fn read_write_error(
        this: &Arc<BsInner>,
        direction: Ready,
        what: SocketEvents,
        errno: Option<i32>,
    ) {
        {
            let mut st = this.state.lock().unwrap();
            st.enabled = st.enabled - direction;
            let _ = this.transport.disable_impl(&mut st, direction);
            if let Some(errno) = errno {
                st.last_error = Some(errno);
            }
        }
        BsInner::run_event_cb(this, what, errno);
    }

    fn run_read_cb(this: &Arc<BsInner>) {
        let cb = {
            let mut st = this.state.lock().unwrap();
            if st.read_cb.is_none() {
                return;
            }
            if st.options.contains(SocketOptions::DEFER_CALLBACKS) {
                st.readcb_pending = true;
                BsInner::schedule_deferred(this, &mut st);
                return;
            }
            st.read_cb.take()
        };
        if let Some(mut cb) = cb {
            cb(&BufferedSocket {
                inner: Arc::clone(this),
            });
            let mut st = this.state.lock().unwrap();
            if st.read_cb.is_none() {
                st.read_cb = Some(cb);
            }
        }
    }

    fn run_write_cb(this: &Arc<BsInner>) {
        let cb = {
            let mut st = this.state.lock().unwrap();
            if st.write_cb.is_none() {
                return;
            }
            if st.options.contains(SocketOptions::DEFER_CALLBACKS) {
                st.writecb_pending = true;
                BsInner::schedule_deferred(this, &mut st);
                return;
            }
            st.write_cb.take()
        };
        if let Some(mut cb) = cb {
            cb(&BufferedSocket {
                inner: Arc::clone(this),
            });
            let mut st = this.state.lock().unwrap();
            if st.write_cb.is_none() {
                st.write_cb = Some(cb);
            }
        }
    }

    fn run_event_cb(this: &Arc<BsInner>, what: SocketEvents, errno: Option<i32>) {
        let cb = {
            let mut st = this.state.lock().unwrap();
            if st.event_cb.is_none() {
                return;
            }
            if st.options.contains(SocketOptions::DEFER_CALLBACKS) {
                st.eventcb_pending |= what;
                if errno.is_some() {
                    st.errno_pending = errno;
                }
                BsInner::schedule_deferred(this, &mut st);
                return;
            }
            st.event_cb.take()
        };
        if let Some(mut cb) = cb {
            cb(
                &BufferedSocket {
                    inner: Arc::clone(this),
                },
                what,
            );
            let mut st = this.state.lock().unwrap();
            if st.event_cb.is_none() {
                st.event_cb = Some(cb);
            }
        }
    }

    fn schedule_deferred(this: &Arc<BsInner>, st: &mut BsState) {
        if let Some(deferred) = &st.deferred {
            let deferred = Arc::clone(deferred);
            let inner = Arc::clone(&this.reactor.inner);
            // The reactor lock nests inside the socket lock everywhere
            // else too.
            let mut core = inner.core.lock().unwrap();
            core.schedule_deferred(&inner, &deferred);
        }
    }

    /// Deliver deferred callbacks: CONNECTED first, then readable, then
    /// writable, then remaining events with the captured errno.
    fn run_deferred(this: &Arc<BsInner>) {
        let handle = BufferedSocket {
            inner: Arc::clone(this),
        };

        let connected = {
            let mut st = this.state.lock().unwrap();
            if st.eventcb_pending.contains(SocketEvents::CONNECTED) {
                st.eventcb_pending.remove(SocketEvents::CONNECTED);
                st.event_cb.take()
            } else {
                None
            }
        };
        if let Some(mut cb) = connected {
            cb(&handle, SocketEvents::CONNECTED);
            let mut st = this.state.lock().unwrap();
            if st.event_cb.is_none() {
                st.event_cb = Some(cb);
            }
        }

        let read = {
            let mut st = this.state.lock().unwrap();
            if st.readcb_pending {
                st.readcb_pending = false;
                st.read_cb.take()
            } else {
                None
            }
        };
        if let Some(mut cb) = read {
            cb(&handle);
            let mut st = this.state.lock().unwrap();
            if st.read_cb.is_none() {
                st.read_cb = Some(cb);
            }
        }

        let write = {
            let mut st = this.state.lock().unwrap();
            if st.writecb_pending {
                st.writecb_pending = false;
                st.write_cb.take()
            } else {
                None
            }
        };
        if let Some(mut cb) = write {
            cb(&handle);
            let mut st = this.state.lock().unwrap();
            if st.write_cb.is_none() {
                st.write_cb = Some(cb);
            }
        }

        let event = {
            let mut st = this.state.lock().unwrap();
            if !st.eventcb_pending.is_empty() {
                let what = st.eventcb_pending;
                st.eventcb_pending = SocketEvents::EMPTY;
                let errno = st.errno_pending.take();
                if let Some(errno) = errno {
                    st.last_error = Some(errno);
                }
                st.event_cb.take().map(|cb| (cb, what))
            } else {
                None
            }
        };
        if let Some((mut cb, what)) = event {
            cb(&handle, what);
            let mut st = this.state.lock().unwrap();
            if st.event_cb.is_none() {
                st.event_cb = Some(cb);
            }
        }
    }
}

impl dyn Transport {
    /// Disable helper callable with the state lock held.
    fn disable_impl(&self, st: &mut BsState, what: Ready) -> io::Result<()> {
        if what.is_readable() {
            if let Some(ev) = &st.read_event {
                ev.del()?;
            }
        }
        if what.is_writable() && !st.connecting {
            if let Some(ev) = &st.write_event {
                ev.del()?;
            }
        }
        Ok(())
    }
}

impl Transport for SocketTransport {
    fn enable(&self, _bs: &Arc<BsInner>, st: &mut BsState, what: Ready) -> io::Result<()> {
        if what.is_readable() {
            BsInner::add_read_event(st)?;
        }
        if what.is_writable() {
            BsInner::add_write_event(st)?;
        }
        Ok(())
    }

    fn disable(&self, _bs: &Arc<BsInner>, st: &mut BsState, what: Ready) -> io::Result<()> {
        (self as &dyn Transport).disable_impl(st, what)
    }

    fn adj_timeouts(&self, _bs: &Arc<BsInner>, st: &mut BsState) -> io::Result<()> {
        let mut result = Ok(());
        if let Some(ev) = &st.read_event {
            if !ev.pending(Ready::READABLE).0.is_empty() {
                result = BsInner::add_read_event(st);
            }
        }
        if let Some(ev) = &st.write_event {
            if !ev.pending(Ready::WRITABLE).0.is_empty() {
                let r = BsInner::add_write_event(st);
                if result.is_ok() {
                    result = r;
                }
            }
        }
        result
    }

    fn flush(&self, _bs: &Arc<BsInner>, _st: &mut BsState, _what: Ready) -> io::Result<()> {
        Ok(())
    }

    fn set_fd(&self, bs: &Arc<BsInner>, st: &mut BsState, fd: RawFd) -> io::Result<()> {
        if let Some(ev) = &st.read_event {
            ev.del()?;
        }
        if let Some(ev) = &st.write_event {
            ev.del()?;
        }
        let enabled = st.enabled;
        st.read_event = None;
        st.write_event = None;
        st.fd = fd;

        let weak = Arc::downgrade(bs);
        let read_event = Event::new(
            &bs.reactor,
            fd,
            Ready::READABLE | Ready::PERSIST,
            move |_, what| {
                if let Some(bs) = weak.upgrade() {
                    BsInner::read_ready(&bs, what);
                }
            },
        )?;
        let weak = Arc::downgrade(bs);
        let write_event = Event::new(
            &bs.reactor,
            fd,
            Ready::WRITABLE | Ready::PERSIST,
            move |_, what| {
                if let Some(bs) = weak.upgrade() {
                    BsInner::write_ready(&bs, what);
                }
            },
        )?;
        st.read_event = Some(read_event);
        st.write_event = Some(write_event);

        if fd >= 0 {
            if enabled.is_readable() && st.read_suspended == 0 {
                BsInner::add_read_event(st)?;
            }
            if enabled.is_writable() && st.write_suspended == 0 {
                BsInner::add_write_event(st)?;
            }
        }
        Ok(())
    }

    fn destruct(&self, st: &mut BsState) {
        st.read_event = None;
        st.write_event = None;
        if st.options.contains(SocketOptions::CLOSE_ON_FREE) && st.fd >= 0 {
            unsafe { libc::close(st.fd) };
            st.fd = -1;
        }
    }
}

impl Drop for BsInner {
    fn drop(&mut self) {
        if let Ok(st) = self.state.get_mut() {
            if let Some(deferred) = &st.deferred {
                self.reactor.inner.cancel_deferred(deferred);
            }
            SocketTransport.destruct(st);
        }
    }
}

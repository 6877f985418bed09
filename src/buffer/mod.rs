//! Scatter-gather byte buffers.
//!
//! A [`Buffer`] is a chain of variable-sized segments. Bytes are cheap to
//! append at the tail and cheap to drain from the head; whole chains move
//! between buffers without copying. Segments may reference external
//! memory, a mapped file or a sendfile source.

mod chain;
mod io;
mod ptr;

pub use self::chain::Cleanup;
pub use self::ptr::{BufferPtr, EolStyle, PtrHow};

use std::collections::VecDeque;
use std::fmt;
use std::io as stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::reactor::{Deferred, Inner, Reactor};

use self::chain::{Segment, MAX_CHAIN, MAX_SEGMENT_AUTO_SIZE};

pub(crate) const CB_ENABLED: u32 = 0x1;
pub(crate) const CB_NODEFER: u32 = 0x2;

/// What changed since the last callback round.
#[derive(Debug, Copy, Clone)]
pub struct CallbackInfo {
    /// Buffer length before the batched changes.
    pub orig_size: usize,
    /// Bytes appended since the last round.
    pub n_added: usize,
    /// Bytes drained since the last round.
    pub n_deleted: usize,
}

pub(crate) struct CbEntry {
    flags: AtomicU32,
    #[allow(clippy::type_complexity)]
    func: Mutex<Box<dyn FnMut(&Buffer, &CallbackInfo) + Send>>,
}

/// Handle to a registered buffer callback; controls its flags and serves
/// as the token for [`Buffer::remove_cb`].
#[derive(Clone)]
pub struct CallbackHandle {
    entry: Arc<CbEntry>,
}

impl CallbackHandle {
    /// Enable or disable the callback.
    pub fn set_enabled(&self, enabled: bool) {
        if enabled {
            self.entry.flags.fetch_or(CB_ENABLED, Ordering::AcqRel);
        } else {
            self.entry.flags.fetch_and(!CB_ENABLED, Ordering::AcqRel);
        }
    }

    /// Run this callback inline even when the buffer defers callbacks.
    pub fn set_nodefer(&self, nodefer: bool) {
        if nodefer {
            self.entry.flags.fetch_or(CB_NODEFER, Ordering::AcqRel);
        } else {
            self.entry.flags.fetch_and(!CB_NODEFER, Ordering::AcqRel);
        }
    }
}

impl fmt::Debug for CallbackHandle {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("CallbackHandle")
            .field("flags", &self.entry.flags.load(Ordering::Relaxed))
            .finish()
    }
}

pub(crate) struct State {
    pub(super) chains: VecDeque<Segment>,
    /// Index of the last segment holding live bytes; `None` when no
    /// segment does (spare empty segments may still exist).
    pub(super) last_with_data: Option<usize>,
    pub(super) total_len: usize,
    pub(super) freeze_start: bool,
    pub(super) freeze_end: bool,
    pub(super) drains_to_fd: bool,
    pub(super) n_add_for_cb: usize,
    pub(super) n_del_for_cb: usize,
    pub(super) callbacks: Vec<Arc<CbEntry>>,
    pub(super) reactor: Option<Weak<Inner>>,
    pub(super) deferred: Option<Arc<Deferred>>,
}

pub(crate) struct Shared {
    pub(crate) state: Mutex<State>,
}

/// A chain of byte segments with cheap append, prepend, drain and
/// zero-copy transfer.
///
/// `Buffer` is a cheap cloneable handle; clones share contents. All
/// operations take an internal lock, so a buffer may be touched from
/// several threads.
///
/// ```
/// use evio::Buffer;
///
/// # fn main() -> std::io::Result<()> {
/// let buf = Buffer::new();
/// buf.add(b"hello ")?;
/// buf.add(b"world")?;
/// let mut out = [0u8; 11];
/// assert_eq!(buf.remove(&mut out)?, 11);
/// assert_eq!(&out, b"hello world");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Buffer {
    pub(crate) inner: Arc<Shared>,
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer::new()
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock().unwrap();
        fmt.debug_struct("Buffer")
            .field("len", &state.total_len)
            .field("segments", &state.chains.len())
            .finish()
    }
}

/// Work to do after the state lock is released: callbacks to run inline
/// and, in deferred mode, the record to schedule.
pub(crate) struct CbActions {
    inline: Vec<Arc<CbEntry>>,
    info: CallbackInfo,
    mask: u32,
    val: u32,
    schedule: Option<(Arc<Inner>, Arc<Deferred>)>,
}

impl CbActions {
    fn none() -> CbActions {
        CbActions {
            inline: Vec::new(),
            info: CallbackInfo {
                orig_size: 0,
                n_added: 0,
                n_deleted: 0,
            },
            mask: 0,
            val: 0,
            schedule: None,
        }
    }

    pub(crate) fn run(self, buffer: &Buffer) {
        for entry in &self.inline {
            if entry.flags.load(Ordering::Acquire) & self.mask == self.val {
                (entry.func.lock().unwrap())(buffer, &self.info);
            }
        }
        if let Some((inner, deferred)) = self.schedule {
            inner.schedule_deferred(&deferred);
        }
    }
}

impl State {
    fn new() -> State {
        State {
            chains: VecDeque::new(),
            last_with_data: None,
            total_len: 0,
            freeze_start: false,
            freeze_end: false,
            drains_to_fd: false,
            n_add_for_cb: 0,
            n_del_for_cb: 0,
            callbacks: Vec::new(),
            reactor: None,
            deferred: None,
        }
    }

    pub(super) fn has_pinned_r_tail(&self) -> bool {
        self.chains.back().map_or(false, |seg| seg.is_pinned_r())
    }

    pub(super) fn recompute_last_with_data(&mut self) {
        self.last_with_data = None;
        for (idx, seg) in self.chains.iter().enumerate() {
            if seg.len > 0 {
                self.last_with_data = Some(idx);
            }
        }
    }

    /// Drop every empty, unpinned segment trailing the data.
    pub(super) fn free_trailing_empty(&mut self) {
        let start = self.last_with_data.map_or(0, |idx| idx + 1);
        let mut keep = start;
        while keep < self.chains.len() && self.chains[keep].is_pinned() {
            keep += 1;
        }
        self.chains.truncate(keep);
    }

    /// Append `seg` at the tail, reusing or dropping spare empty
    /// segments, and account for any live bytes it carries.
    pub(super) fn chain_insert(&mut self, seg: Segment) {
        let start = self.last_with_data.map_or(0, |idx| idx + 1);
        let mut keep = start;
        while keep < self.chains.len() && self.chains[keep].is_pinned() {
            keep += 1;
        }
        self.chains.truncate(keep);
        let len = seg.len;
        self.chains.push_back(seg);
        if len > 0 {
            self.last_with_data = Some(self.chains.len() - 1);
        }
        self.total_len += len;
    }

    pub(super) fn chain_insert_new(&mut self, size: usize) -> usize {
        self.chain_insert(Segment::new_owned(size));
        self.chains.len() - 1
    }

    fn overflows(&self, datlen: usize) -> bool {
        datlen > MAX_CHAIN - self.total_len
    }

    /// Append without invoking callbacks; the caller batches those.
    pub(super) fn add_inner(&mut self, data: &[u8]) -> stdio::Result<()> {
        if self.freeze_end {
            return Err(frozen());
        }
        if self.overflows(data.len()) {
            return Err(overflow());
        }
        let datlen = data.len();

        if self.chains.is_empty() {
            self.chain_insert(Segment::new_owned(datlen));
        }
        let tail_idx = self.chains.len() - 1;
        let mut remain = 0;
        {
            let tail = &mut self.chains[tail_idx];
            if tail.is_writable() {
                remain = tail.space();
                if remain >= datlen {
                    tail.append(data);
                    self.total_len += datlen;
                    self.n_add_for_cb += datlen;
                    self.last_with_data = Some(tail_idx);
                    return Ok(());
                } else if !tail.is_pinned() && tail.should_realign(datlen) {
                    tail.align();
                    tail.append(data);
                    self.total_len += datlen;
                    self.n_add_for_cb += datlen;
                    self.last_with_data = Some(tail_idx);
                    return Ok(());
                }
            }
        }

        // The tail cannot hold everything: size a new segment, doubling
        // small tails, then split the copy across old and new.
        let mut to_alloc = self.chains[tail_idx].capacity();
        if to_alloc <= MAX_SEGMENT_AUTO_SIZE / 2 {
            to_alloc <<= 1;
        }
        if datlen > to_alloc {
            to_alloc = datlen;
        }
        let mut seg = Segment::new_owned(to_alloc);

        if remain > 0 {
            let tail = &mut self.chains[tail_idx];
            tail.append(&data[..remain]);
            self.total_len += remain;
            self.n_add_for_cb += remain;
            self.last_with_data = Some(tail_idx);
        }
        let rest = &data[remain..];
        seg.append(rest);
        self.chain_insert(seg);
        self.n_add_for_cb += rest.len();
        Ok(())
    }

    pub(super) fn prepend_inner(&mut self, data: &[u8]) -> stdio::Result<()> {
        if self.freeze_start {
            return Err(frozen());
        }
        if self.overflows(data.len()) {
            return Err(overflow());
        }
        let mut datlen = data.len();

        if self.chains.is_empty() {
            self.chain_insert(Segment::new_owned(datlen));
        }

        {
            let head = &mut self.chains[0];
            if head.is_writable() {
                // An empty head counts as end-aligned so its whole
                // capacity serves as prepend room.
                if head.len == 0 {
                    head.misalign = head.capacity();
                }
                if head.misalign >= datlen {
                    let at = head.misalign - datlen;
                    if let chain::Store::Owned(buf) = &mut head.store {
                        buf[at..at + datlen].copy_from_slice(data);
                    }
                    head.misalign -= datlen;
                    head.len += datlen;
                    self.total_len += datlen;
                    self.n_add_for_cb += datlen;
                    if self.last_with_data.is_none() {
                        self.last_with_data = Some(0);
                    }
                    return Ok(());
                } else if head.misalign > 0 {
                    let take = head.misalign;
                    if let chain::Store::Owned(buf) = &mut head.store {
                        buf[..take].copy_from_slice(&data[datlen - take..]);
                    }
                    head.misalign = 0;
                    head.len += take;
                    self.total_len += take;
                    self.n_add_for_cb += take;
                    datlen -= take;
                    if self.last_with_data.is_none() {
                        self.last_with_data = Some(0);
                    }
                }
            }
        }

        // The rest goes into a fresh head, end-aligned so the next
        // prepend has room again.
        let mut seg = Segment::new_owned(datlen);
        let cap = seg.capacity();
        seg.misalign = cap - datlen;
        seg.len = datlen;
        if let chain::Store::Owned(buf) = &mut seg.store {
            buf[cap - datlen..].copy_from_slice(&data[..datlen]);
        }
        self.chains.push_front(seg);
        self.last_with_data = Some(match self.last_with_data {
            Some(idx) => idx + 1,
            None => 0,
        });
        self.total_len += datlen;
        self.n_add_for_cb += datlen;
        Ok(())
    }

    pub(super) fn drain_inner(&mut self, len: usize) -> stdio::Result<usize> {
        if self.total_len == 0 {
            return Ok(0);
        }
        if self.freeze_start {
            return Err(frozen());
        }
        let len = len.min(self.total_len);

        if len == self.total_len && !self.chains.iter().any(|seg| seg.is_pinned_r()) {
            self.chains.clear();
            self.last_with_data = None;
            self.total_len = 0;
        } else {
            self.total_len -= len;
            let mut remaining = len;
            while let Some(head) = self.chains.front_mut() {
                if remaining < head.len {
                    break;
                }
                remaining -= head.len;
                if head.is_pinned_r() {
                    // Pinned storage stays put; just move its window.
                    debug_assert_eq!(remaining, 0);
                    head.misalign += head.len;
                    head.len = 0;
                    break;
                }
                self.chains.pop_front();
            }
            if remaining > 0 {
                let head = self.chains.front_mut().expect("drain under-ran the chain");
                head.misalign += remaining;
                head.len -= remaining;
            }
            self.recompute_last_with_data();
        }

        self.n_del_for_cb += len;
        Ok(len)
    }

    pub(super) fn copyout_inner(&self, out: &mut [u8]) -> stdio::Result<usize> {
        let datlen = out.len().min(self.total_len);
        if datlen == 0 {
            return Ok(0);
        }
        if self.freeze_start {
            return Err(frozen());
        }
        let mut copied = 0;
        for seg in &self.chains {
            if copied == datlen {
                break;
            }
            if matches!(seg.store, chain::Store::File { .. }) {
                return Err(stdio::Error::new(
                    stdio::ErrorKind::InvalidInput,
                    "sendfile segments cannot be read back",
                ));
            }
            let take = seg.len.min(datlen - copied);
            out[copied..copied + take].copy_from_slice(&seg.data()[..take]);
            copied += take;
        }
        Ok(datlen)
    }

    /// Detach the read-pinned tail run so the rest of the chain can move
    /// to another buffer. Live bytes still inside the first pinned
    /// segment are duplicated into a fresh owned tail so they travel.
    pub(super) fn preserve_pinned(&mut self) -> Option<VecDeque<Segment>> {
        if !self.has_pinned_r_tail() {
            return None;
        }
        let start = match self.last_with_data {
            Some(idx) if self.chains[idx].is_pinned_r() => idx,
            Some(idx) => idx + 1,
            None => 0,
        };
        let mut run = self.chains.split_off(start);
        debug_assert!(run.front().map_or(false, |seg| seg.is_pinned_r()));
        if let Some(first) = run.front_mut() {
            if first.len > 0 {
                let mut copy = Segment::new_owned(first.len);
                copy.append(first.data());
                first.misalign += first.len;
                first.len = 0;
                self.chains.push_back(copy);
            }
        }
        self.recompute_last_with_data();
        Some(run)
    }

    pub(super) fn first_chain_with_space(&self) -> usize {
        let idx = self.last_with_data.unwrap_or(0);
        if idx < self.chains.len() && self.chains[idx].space() == 0 {
            idx + 1
        } else {
            idx
        }
    }

    /// Make sure one writable segment has `datlen` bytes free and return
    /// its index.
    pub(super) fn expand_singlechain(&mut self, datlen: usize) -> usize {
        let idx = self.first_chain_with_space();

        if idx >= self.chains.len() {
            return self.chain_insert_new(datlen);
        }
        if !self.chains[idx].is_writable() || self.chains[idx].is_pinned() {
            return self.chain_insert_new(datlen);
        }
        if self.chains[idx].space() >= datlen {
            return idx;
        }
        if self.chains[idx].len == 0 {
            return self.chain_insert_new(datlen);
        }
        if self.chains[idx].should_realign(datlen) {
            self.chains[idx].align();
            return idx;
        }

        let seg = &self.chains[idx];
        if seg.space() < seg.capacity() / 8
            || seg.len > chain::MAX_TO_COPY_IN_EXPAND
            || datlen >= MAX_CHAIN - seg.len
        {
            // Not worth resizing this segment; use the next one if it
            // already has room, else link in a new one.
            if idx + 1 < self.chains.len() && self.chains[idx + 1].space() >= datlen {
                idx + 1
            } else {
                self.chain_insert_new(datlen)
            }
        } else {
            // Few live bytes: migrate them into one segment big enough
            // for both them and the expected data.
            let live = self.chains[idx].len;
            let mut bigger = Segment::new_owned(live + datlen);
            bigger.append(self.chains[idx].data());
            self.chains[idx] = bigger;
            idx
        }
    }

    /// Guarantee `datlen` bytes of spare room across at most `limit`
    /// segments ending at the tail.
    pub(super) fn expand_fast(&mut self, datlen: usize, limit: usize) -> stdio::Result<()> {
        debug_assert!(limit >= 2);

        if self.chains.is_empty() || !self.chains[self.chains.len() - 1].is_writable() {
            self.chain_insert(Segment::new_owned(datlen));
            return Ok(());
        }

        let mut used = 0;
        let mut avail = 0;
        let start = self.last_with_data.unwrap_or(0);
        let mut idx = start;
        while idx < self.chains.len() {
            let seg = &mut self.chains[idx];
            if seg.len > 0 {
                let space = seg.space();
                if space > 0 {
                    avail += space;
                    used += 1;
                }
            } else {
                seg.misalign = 0;
                avail += seg.capacity();
                used += 1;
            }
            if avail >= datlen {
                return Ok(());
            }
            if used == limit {
                break;
            }
            idx += 1;
        }

        if used < limit {
            // Ran out of segments before the cap; one more makes up the
            // difference.
            self.chains.push_back(Segment::new_owned(datlen - avail));
            return Ok(());
        }

        // The allowed segments cannot hold it: drop the spare tail and
        // replace it with one segment big enough.
        let keep_avail = match self.last_with_data {
            Some(idx) => self.chains[idx].space(),
            None => 0,
        };
        self.free_trailing_empty();
        self.chains
            .push_back(Segment::new_owned(datlen - keep_avail.min(datlen)));
        Ok(())
    }

    /// Batch up callback work. Called with the lock held, right before
    /// releasing it; the returned actions run unlocked.
    pub(super) fn invoke_callbacks(&mut self) -> CbActions {
        if self.callbacks.is_empty() {
            self.n_add_for_cb = 0;
            self.n_del_for_cb = 0;
            return CbActions::none();
        }

        let deferred_mode = self.deferred.is_some();
        let schedule = if deferred_mode {
            match (&self.reactor, &self.deferred) {
                (Some(reactor), Some(deferred)) => reactor
                    .upgrade()
                    .map(|inner| (inner, Arc::clone(deferred))),
                _ => None,
            }
        } else {
            None
        };

        if self.n_add_for_cb == 0 && self.n_del_for_cb == 0 {
            return CbActions {
                inline: Vec::new(),
                info: CallbackInfo {
                    orig_size: self.total_len,
                    n_added: 0,
                    n_deleted: 0,
                },
                mask: 0,
                val: u32::MAX,
                schedule: None,
            };
        }

        let (mask, val, clear) = if deferred_mode {
            (CB_NODEFER | CB_ENABLED, CB_NODEFER | CB_ENABLED, false)
        } else {
            (CB_ENABLED, CB_ENABLED, true)
        };

        let info = CallbackInfo {
            orig_size: self.total_len + self.n_del_for_cb - self.n_add_for_cb,
            n_added: self.n_add_for_cb,
            n_deleted: self.n_del_for_cb,
        };
        if clear {
            self.n_add_for_cb = 0;
            self.n_del_for_cb = 0;
        }
        CbActions {
            inline: self.callbacks.clone(),
            info,
            mask,
            val,
            schedule,
        }
    }

    /// The deferred-record body: one callback round per change batch.
    fn run_deferred_round(&mut self) -> CbActions {
        if self.callbacks.is_empty() || (self.n_add_for_cb == 0 && self.n_del_for_cb == 0) {
            self.n_add_for_cb = 0;
            self.n_del_for_cb = 0;
            return CbActions::none();
        }
        let info = CallbackInfo {
            orig_size: self.total_len + self.n_del_for_cb - self.n_add_for_cb,
            n_added: self.n_add_for_cb,
            n_deleted: self.n_del_for_cb,
        };
        self.n_add_for_cb = 0;
        self.n_del_for_cb = 0;
        CbActions {
            inline: self.callbacks.clone(),
            info,
            mask: CB_NODEFER | CB_ENABLED,
            val: CB_ENABLED,
            schedule: None,
        }
    }
}

pub(super) fn frozen() -> stdio::Error {
    stdio::Error::new(stdio::ErrorKind::PermissionDenied, "buffer end is frozen")
}

fn overflow() -> stdio::Error {
    stdio::Error::new(stdio::ErrorKind::InvalidInput, "buffer size overflow")
}

/// Lock two buffers in address order so concurrent two-buffer operations
/// cannot deadlock.
fn lock_pair<'a>(
    a: &'a Shared,
    b: &'a Shared,
) -> (MutexGuard<'a, State>, MutexGuard<'a, State>) {
    let pa = a as *const Shared as usize;
    let pb = b as *const Shared as usize;
    if pa < pb {
        let ga = a.state.lock().unwrap();
        let gb = b.state.lock().unwrap();
        (ga, gb)
    } else {
        let gb = b.state.lock().unwrap();
        let ga = a.state.lock().unwrap();
        (ga, gb)
    }
}

impl Buffer {
    /// Create an empty buffer.
    pub fn new() -> Buffer {
        Buffer {
            inner: Arc::new(Shared {
                state: Mutex::new(State::new()),
            }),
        }
    }

    pub(crate) fn same_buffer(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Total live bytes.
    pub fn len(&self) -> usize {
        self.inner.state.lock().unwrap().total_len
    }

    /// Whether the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes readable from the first segment without crossing a segment
    /// boundary.
    pub fn contiguous_space(&self) -> usize {
        let state = self.inner.state.lock().unwrap();
        state.chains.front().map_or(0, |seg| seg.len)
    }

    /// Mark the buffer as draining to a file descriptor, allowing
    /// [`add_file`](Buffer::add_file) to use sendfile segments.
    pub fn set_drains_to_fd(&self, drains: bool) {
        self.inner.state.lock().unwrap().drains_to_fd = drains;
    }

    /// Deliver buffer callbacks from `reactor`'s deferred queue instead
    /// of inline, one round per change batch.
    pub fn defer_callbacks(&self, reactor: &Reactor) {
        let weak = Arc::downgrade(&self.inner);
        let deferred = Deferred::new(move || {
            if let Some(shared) = weak.upgrade() {
                let buffer = Buffer { inner: shared };
                let actions = buffer.inner.state.lock().unwrap().run_deferred_round();
                actions.run(&buffer);
            }
        });
        let mut state = self.inner.state.lock().unwrap();
        state.reactor = Some(Arc::downgrade(&reactor.inner));
        state.deferred = Some(deferred);
    }

    /// Append bytes at the tail.
    pub fn add(&self, data: &[u8]) -> stdio::Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        state.add_inner(data)?;
        let actions = state.invoke_callbacks();
        drop(state);
        actions.run(self);
        Ok(())
    }

    /// Append formatted text; returns the number of bytes added.
    ///
    /// ```
    /// use evio::Buffer;
    /// # fn main() -> std::io::Result<()> {
    /// let buf = Buffer::new();
    /// buf.add_fmt(format_args!("{} bottles\n", 99))?;
    /// assert_eq!(buf.len(), 11);
    /// # Ok(())
    /// # }
    /// ```
    pub fn add_fmt(&self, args: fmt::Arguments<'_>) -> stdio::Result<usize> {
        let text = args.to_string();
        self.add(text.as_bytes())?;
        Ok(text.len())
    }

    /// Insert bytes before the head.
    pub fn prepend(&self, data: &[u8]) -> stdio::Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        state.prepend_inner(data)?;
        let actions = state.invoke_callbacks();
        drop(state);
        actions.run(self);
        Ok(())
    }

    /// Ensure `n` bytes can be appended into a single segment.
    pub fn expand(&self, n: usize) -> stdio::Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        state.expand_singlechain(n);
        Ok(())
    }

    /// Remove `n` bytes from the head.
    pub fn drain(&self, n: usize) -> stdio::Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        state.drain_inner(n)?;
        let actions = state.invoke_callbacks();
        drop(state);
        actions.run(self);
        Ok(())
    }

    /// Copy up to `out.len()` bytes from the head without draining.
    pub fn copyout(&self, out: &mut [u8]) -> stdio::Result<usize> {
        let state = self.inner.state.lock().unwrap();
        state.copyout_inner(out)
    }

    /// Copy and drain up to `out.len()` bytes from the head.
    pub fn remove(&self, out: &mut [u8]) -> stdio::Result<usize> {
        let mut state = self.inner.state.lock().unwrap();
        let n = state.copyout_inner(out)?;
        if n > 0 {
            state.drain_inner(n)?;
        }
        let actions = state.invoke_callbacks();
        drop(state);
        actions.run(self);
        Ok(n)
    }

    /// Move all of `src` to this buffer's tail without copying payload
    /// bytes. Read-pinned tail segments stay behind in `src`, emptied.
    pub fn add_buffer(&self, src: &Buffer) -> stdio::Result<()> {
        if self.same_buffer(src) {
            return Ok(());
        }
        let (mut dst, mut other) = lock_pair(&self.inner, &src.inner);
        let in_len = other.total_len;
        if in_len == 0 {
            return Ok(());
        }
        if dst.freeze_end || other.freeze_start {
            return Err(frozen());
        }

        let pinned = other.preserve_pinned();
        let moved = other.total_len;

        if dst.total_len == 0 {
            dst.chains.clear();
            dst.last_with_data = None;
        }
        dst.chains.extend(other.chains.drain(..));
        dst.recompute_last_with_data();
        dst.total_len += moved;

        other.chains = pinned.unwrap_or_default();
        other.last_with_data = None;
        other.total_len = 0;

        other.n_del_for_cb += in_len;
        dst.n_add_for_cb += in_len;

        let dst_actions = dst.invoke_callbacks();
        let src_actions = other.invoke_callbacks();
        drop(dst);
        drop(other);
        src_actions.run(src);
        dst_actions.run(self);
        Ok(())
    }

    /// Move all of `src` in front of this buffer's head.
    pub fn prepend_buffer(&self, src: &Buffer) -> stdio::Result<()> {
        if self.same_buffer(src) {
            return Ok(());
        }
        let (mut dst, mut other) = lock_pair(&self.inner, &src.inner);
        let in_len = other.total_len;
        if in_len == 0 {
            return Ok(());
        }
        if dst.freeze_start || other.freeze_start {
            return Err(frozen());
        }

        let pinned = other.preserve_pinned();
        let moved = other.total_len;

        if dst.total_len == 0 {
            dst.chains.clear();
        }
        for seg in other.chains.drain(..).rev() {
            dst.chains.push_front(seg);
        }
        dst.recompute_last_with_data();
        dst.total_len += moved;

        other.chains = pinned.unwrap_or_default();
        other.last_with_data = None;
        other.total_len = 0;

        other.n_del_for_cb += in_len;
        dst.n_add_for_cb += in_len;

        let dst_actions = dst.invoke_callbacks();
        let src_actions = other.invoke_callbacks();
        drop(dst);
        drop(other);
        src_actions.run(src);
        dst_actions.run(self);
        Ok(())
    }

    /// Move up to `n` bytes from this buffer's head to `dst`'s tail,
    /// peeling whole segments where possible. Returns the bytes moved.
    pub fn remove_buffer(&self, dst: &Buffer, n: usize) -> stdio::Result<usize> {
        if n == 0 || self.same_buffer(dst) {
            return Ok(0);
        }

        // Moving everything is the zero-copy append.
        if self.len() <= n {
            let moved = self.len();
            dst.add_buffer(self)?;
            return Ok(moved);
        }

        let (mut src, mut dstst) = lock_pair(&self.inner, &dst.inner);
        let mut datlen = n;
        if dstst.freeze_end || src.freeze_start {
            return Err(frozen());
        }
        if datlen >= src.total_len {
            // Raced with a concurrent drain; fall back to the full move.
            drop(src);
            drop(dstst);
            let moved = self.len();
            dst.add_buffer(self)?;
            return Ok(moved);
        }

        // Peel whole segments. The last segment with data never moves
        // this way, because datlen < total_len.
        let mut nread = 0;
        let mut peeled: VecDeque<Segment> = VecDeque::new();
        while src
            .chains
            .front()
            .map_or(false, |seg| seg.len <= datlen)
        {
            debug_assert!(src.last_with_data != Some(0));
            let seg = src.chains.pop_front().unwrap();
            nread += seg.len;
            datlen -= seg.len;
            if let Some(idx) = src.last_with_data {
                src.last_with_data = Some(idx - 1);
            }
            peeled.push_back(seg);
        }
        if nread > 0 {
            dstst.free_trailing_empty();
            dstst.chains.extend(peeled);
            dstst.recompute_last_with_data();
            dstst.total_len += nread;
            dstst.n_add_for_cb += nread;
        }

        // The fractional remainder is copied.
        if datlen > 0 {
            let head = src.chains.front_mut().expect("source under-ran");
            let copied: Vec<u8> = head.data()[..datlen].to_vec();
            head.misalign += datlen;
            head.len -= datlen;
            dstst.add_inner(&copied)?;
            nread += datlen;
        }
        src.total_len -= nread;
        src.n_del_for_cb += nread;
        src.recompute_last_with_data();

        let dst_actions = dstst.invoke_callbacks();
        let src_actions = src.invoke_callbacks();
        drop(src);
        drop(dstst);
        src_actions.run(self);
        dst_actions.run(dst);
        Ok(nread)
    }

    /// Forbid mutation at one end: the head (`front == true`, banning
    /// drain and prepend) or the tail (banning append). Idempotent.
    pub fn freeze(&self, front: bool) {
        let mut state = self.inner.state.lock().unwrap();
        if front {
            state.freeze_start = true;
        } else {
            state.freeze_end = true;
        }
    }

    /// Re-allow mutation at one end. Idempotent.
    pub fn unfreeze(&self, front: bool) {
        let mut state = self.inner.state.lock().unwrap();
        if front {
            state.freeze_start = false;
        } else {
            state.freeze_end = false;
        }
    }

    /// Register a callback invoked after every change batch with the
    /// accumulated counts. Enabled by default.
    pub fn add_cb<F>(&self, func: F) -> CallbackHandle
    where
        F: FnMut(&Buffer, &CallbackInfo) + Send + 'static,
    {
        let entry = Arc::new(CbEntry {
            flags: AtomicU32::new(CB_ENABLED),
            func: Mutex::new(Box::new(func)),
        });
        self.inner
            .state
            .lock()
            .unwrap()
            .callbacks
            .push(Arc::clone(&entry));
        CallbackHandle { entry }
    }

    /// Unregister a callback.
    pub fn remove_cb(&self, handle: &CallbackHandle) {
        self.inner
            .state
            .lock()
            .unwrap()
            .callbacks
            .retain(|entry| !Arc::ptr_eq(entry, &handle.entry));
    }

    // Test hooks for pinning, standing in for in-flight I/O that must
    // not have its storage moved.
    #[cfg(test)]
    pub(crate) fn pin_tail_r(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(seg) = state.chains.back_mut() {
            seg.flags |= chain::SEG_PINNED_R;
        }
    }

    #[cfg(test)]
    pub(crate) fn unpin_tail_r(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(seg) = state.chains.back_mut() {
            seg.flags &= !chain::SEG_PINNED_R;
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Ok(state) = self.state.get_mut() {
            if let (Some(reactor), Some(deferred)) = (&state.reactor, &state.deferred) {
                if let Some(inner) = reactor.upgrade() {
                    inner.cancel_deferred(deferred);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contents(buf: &Buffer) -> Vec<u8> {
        let mut out = vec![0u8; buf.len()];
        buf.copyout(&mut out).unwrap();
        out
    }

    #[test]
    fn add_drain_roundtrip() {
        let buf = Buffer::new();
        buf.add(b"hello world").unwrap();
        assert_eq!(buf.len(), 11);
        buf.drain(6).unwrap();
        assert_eq!(contents(&buf), b"world");
        buf.drain(5).unwrap();
        assert!(buf.is_empty());
    }

    #[test]
    fn prepend_counts_exactly_datlen() {
        // The callback accumulator must grow by exactly the prepended
        // byte count, including when a fresh head segment is needed.
        let buf = Buffer::new();
        buf.add(b"tail").unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let _cb = buf.add_cb(move |_, info| {
            seen2.lock().unwrap().push((info.n_added, info.n_deleted));
        });

        let big = vec![b'x'; 4000];
        buf.prepend(&big).unwrap();
        assert_eq!(buf.len(), 4004);
        assert_eq!(seen.lock().unwrap().as_slice(), &[(4000, 0)]);
    }

    #[test]
    fn prepend_reuses_misalignment() {
        let buf = Buffer::new();
        buf.add(b"world").unwrap();
        buf.drain(0).unwrap();
        buf.prepend(b"hello ").unwrap();
        assert_eq!(contents(&buf), b"hello world");

        // A second prepend fits in the head's remaining misalignment.
        buf.prepend(b"oh, ").unwrap();
        assert_eq!(contents(&buf), b"oh, hello world");
    }

    #[test]
    fn add_buffer_moves_everything() {
        let a = Buffer::new();
        let b = Buffer::new();
        a.add(b"front").unwrap();
        b.add(b" back").unwrap();
        a.add_buffer(&b).unwrap();
        assert_eq!(b.len(), 0);
        assert_eq!(contents(&a), b"front back");
    }

    #[test]
    fn prepend_buffer_splices_in_front() {
        let a = Buffer::new();
        let b = Buffer::new();
        a.add(b"back").unwrap();
        b.add(b"front ").unwrap();
        a.prepend_buffer(&b).unwrap();
        assert_eq!(b.len(), 0);
        assert_eq!(contents(&a), b"front back");
    }

    #[test]
    fn move_preserves_pinned_tail() {
        let src = Buffer::new();
        let dst = Buffer::new();
        src.add(b"0123456789").unwrap();
        src.pin_tail_r();

        dst.add_buffer(&src).unwrap();

        // The ten bytes traveled as a fresh copy.
        assert_eq!(dst.len(), 10);
        assert_eq!(contents(&dst), b"0123456789");

        // The pinned segment stayed behind, emptied, misalign advanced.
        {
            let state = src.inner.state.lock().unwrap();
            assert_eq!(state.total_len, 0);
            assert_eq!(state.chains.len(), 1);
            assert!(state.chains[0].is_pinned_r());
            assert_eq!(state.chains[0].len, 0);
            assert!(state.chains[0].misalign >= 10);
        }

        // Unpinning lets the leftover segment be reclaimed.
        src.unpin_tail_r();
        src.add(b"reuse").unwrap();
        src.drain(5).unwrap();
        assert!(src.is_empty());
    }

    #[test]
    fn remove_buffer_partial() {
        let src = Buffer::new();
        let dst = Buffer::new();
        src.add(b"abcdefgh").unwrap();
        let n = src.remove_buffer(&dst, 3).unwrap();
        assert_eq!(n, 3);
        assert_eq!(contents(&dst), b"abc");
        assert_eq!(contents(&src), b"defgh");
    }

    #[test]
    fn freeze_blocks_mutation() {
        let buf = Buffer::new();
        buf.add(b"data").unwrap();

        buf.freeze(false);
        assert!(buf.add(b"x").is_err());
        buf.unfreeze(false);
        buf.add(b"x").unwrap();

        buf.freeze(true);
        assert!(buf.drain(1).is_err());
        assert!(buf.prepend(b"y").is_err());
        buf.unfreeze(true);
        buf.drain(1).unwrap();
        assert_eq!(contents(&buf), b"atax");

        // Freezing twice then unfreezing once fully unfreezes.
        buf.freeze(true);
        buf.freeze(true);
        buf.unfreeze(true);
        buf.drain(1).unwrap();
    }

    #[test]
    fn callback_batches_accumulate() {
        let buf = Buffer::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let handle = buf.add_cb(move |_, info| {
            seen2
                .lock()
                .unwrap()
                .push((info.orig_size, info.n_added, info.n_deleted));
        });

        buf.add(b"12345").unwrap();
        buf.drain(2).unwrap();
        {
            let log = seen.lock().unwrap();
            assert_eq!(log.as_slice(), &[(0, 5, 0), (5, 0, 2)]);
        }

        handle.set_enabled(false);
        buf.add(b"no callback").unwrap();
        assert_eq!(seen.lock().unwrap().len(), 2);

        handle.set_enabled(true);
        buf.remove_cb(&handle);
        buf.add(b"gone").unwrap();
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn expand_reserves_single_segment() {
        let buf = Buffer::new();
        buf.add(b"seed").unwrap();
        buf.expand(10_000).unwrap();
        let state = buf.inner.state.lock().unwrap();
        let idx = state.first_chain_with_space();
        assert!(state.chains[idx].space() >= 10_000);
    }

    #[test]
    fn copyout_then_drain_equals_remove() {
        let a = Buffer::new();
        let b = Buffer::new();
        a.add(b"one two three").unwrap();
        b.add(b"one two three").unwrap();

        let mut out_a = [0u8; 7];
        a.copyout(&mut out_a).unwrap();
        a.drain(7).unwrap();

        let mut out_b = [0u8; 7];
        b.remove(&mut out_b).unwrap();

        assert_eq!(out_a, out_b);
        assert_eq!(contents(&a), contents(&b));
    }
}

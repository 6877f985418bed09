use std::os::unix::io::RawFd;

/// Smallest backing allocation for an owned segment.
pub(crate) const MIN_SEGMENT_SIZE: usize = 512;

/// Below this capacity a full tail doubles when growing.
pub(crate) const MAX_SEGMENT_AUTO_SIZE: usize = 4096;

/// Segments holding more live bytes than this are never copied while
/// expanding; a new segment is linked in instead.
pub(crate) const MAX_TO_COPY_IN_EXPAND: usize = 4096;

/// Live-byte bound under which realigning (memmove to offset 0) is
/// considered cheap.
pub(crate) const MAX_TO_REALIGN: usize = 2048;

/// Largest representable buffer and segment size.
pub(crate) const MAX_CHAIN: usize = isize::MAX as usize;

pub(crate) const SEG_IMMUTABLE: u8 = 0x01;
pub(crate) const SEG_REFERENCE: u8 = 0x02;
pub(crate) const SEG_MMAP: u8 = 0x04;
pub(crate) const SEG_SENDFILE: u8 = 0x08;
pub(crate) const SEG_PINNED_R: u8 = 0x10;
pub(crate) const SEG_PINNED_W: u8 = 0x20;

/// Invoked when a segment referencing external memory is released.
pub type Cleanup = Box<dyn FnOnce(*const u8, usize) + Send>;

/// Backing storage of one segment.
pub(crate) enum Store {
    /// Heap memory owned by the segment.
    Owned(Box<[u8]>),
    /// Memory owned elsewhere; `cleanup` runs when the segment dies.
    External {
        ptr: *const u8,
        len: usize,
        cleanup: Option<Cleanup>,
    },
    /// A read-only file mapping; unmapped and closed on drop.
    Mmap {
        ptr: *mut u8,
        len: usize,
        fd: RawFd,
    },
    /// A sendfile proxy: no readable bytes, just an fd plus the
    /// offset/length recorded in the segment header.
    File { fd: RawFd },
}

/// One link of a buffer chain: `misalign` dead bytes, then `len` live
/// bytes, inside storage of `capacity()` bytes.
pub(crate) struct Segment {
    pub(crate) misalign: usize,
    pub(crate) len: usize,
    pub(crate) flags: u8,
    pub(crate) store: Store,
}

// SAFETY: `Owned` data is plainly owned; external and mapped pointers
// come with the add_reference/add_file contracts that the memory stays
// valid and the cleanup is Send.
unsafe impl Send for Segment {}

impl Segment {
    /// Allocate a writable segment able to hold at least `size` bytes.
    ///
    /// Sizes below `MAX_CHAIN / 2` round up to a power of two with a 512
    /// byte floor; larger requests are allocated exactly.
    pub(crate) fn new_owned(size: usize) -> Segment {
        debug_assert!(size <= MAX_CHAIN);
        let to_alloc = if size < MAX_CHAIN / 2 {
            let mut to_alloc = MIN_SEGMENT_SIZE;
            while to_alloc < size {
                to_alloc <<= 1;
            }
            to_alloc
        } else {
            size
        };
        Segment {
            misalign: 0,
            len: 0,
            flags: 0,
            store: Store::Owned(vec![0u8; to_alloc].into_boxed_slice()),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        match &self.store {
            Store::Owned(buf) => buf.len(),
            Store::External { len, .. } => *len,
            Store::Mmap { len, .. } => *len,
            Store::File { .. } => self.misalign + self.len,
        }
    }

    /// Bytes that can still be appended in place.
    pub(crate) fn space(&self) -> usize {
        if !self.is_writable() {
            return 0;
        }
        self.capacity() - self.misalign - self.len
    }

    pub(crate) fn is_writable(&self) -> bool {
        self.flags & SEG_IMMUTABLE == 0 && matches!(self.store, Store::Owned(_))
    }

    pub(crate) fn is_pinned(&self) -> bool {
        self.flags & (SEG_PINNED_R | SEG_PINNED_W) != 0
    }

    pub(crate) fn is_pinned_r(&self) -> bool {
        self.flags & SEG_PINNED_R != 0
    }

    /// The live bytes. Not meaningful for sendfile segments.
    pub(crate) fn data(&self) -> &[u8] {
        match &self.store {
            Store::Owned(buf) => &buf[self.misalign..self.misalign + self.len],
            Store::External { ptr, .. } => unsafe {
                std::slice::from_raw_parts(ptr.add(self.misalign), self.len)
            },
            Store::Mmap { ptr, .. } => unsafe {
                std::slice::from_raw_parts((*ptr as *const u8).add(self.misalign), self.len)
            },
            Store::File { .. } => &[],
        }
    }

    /// The writable tail region. Only owned segments have one.
    pub(crate) fn space_mut(&mut self) -> &mut [u8] {
        let (misalign, len) = (self.misalign, self.len);
        match &mut self.store {
            Store::Owned(buf) => &mut buf[misalign + len..],
            _ => &mut [],
        }
    }

    /// Raw pointer and length of the writable tail, for readv.
    pub(crate) fn space_raw(&mut self) -> (*mut u8, usize) {
        let space = self.space();
        let (misalign, len) = (self.misalign, self.len);
        match &mut self.store {
            Store::Owned(buf) => (unsafe { buf.as_mut_ptr().add(misalign + len) }, space),
            _ => (std::ptr::null_mut(), 0),
        }
    }

    /// Append as much of `data` as fits; returns the number copied.
    pub(crate) fn append(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.space());
        self.space_mut()[..n].copy_from_slice(&data[..n]);
        self.len += n;
        n
    }

    /// Move the live bytes to offset zero, clearing the misalignment.
    pub(crate) fn align(&mut self) {
        debug_assert!(self.is_writable() && !self.is_pinned());
        let (misalign, len) = (self.misalign, self.len);
        if let Store::Owned(buf) = &mut self.store {
            buf.copy_within(misalign..misalign + len, 0);
        }
        self.misalign = 0;
    }

    /// Whether realigning would make room for `datlen` more bytes and be
    /// cheap enough to bother.
    pub(crate) fn should_realign(&self, datlen: usize) -> bool {
        self.is_writable()
            && self.capacity() - self.len >= datlen
            && self.len < self.capacity() / 2
            && self.len <= MAX_TO_REALIGN
    }

    pub(crate) fn file_fd(&self) -> Option<RawFd> {
        match &self.store {
            Store::Mmap { fd, .. } | Store::File { fd } => Some(*fd),
            _ => None,
        }
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        match self {
            Store::Owned(_) => {}
            Store::External { ptr, len, cleanup } => {
                if let Some(cleanup) = cleanup.take() {
                    cleanup(*ptr, *len);
                }
            }
            Store::Mmap { ptr, len, fd } => unsafe {
                if libc::munmap(*ptr as *mut libc::c_void, *len) == -1 {
                    log::warn!("munmap failed: {}", std::io::Error::last_os_error());
                }
                libc::close(*fd);
            },
            Store::File { fd } => unsafe {
                libc::close(*fd);
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizing_rounds_to_power_of_two() {
        assert_eq!(Segment::new_owned(0).capacity(), 512);
        assert_eq!(Segment::new_owned(1).capacity(), 512);
        assert_eq!(Segment::new_owned(512).capacity(), 512);
        assert_eq!(Segment::new_owned(513).capacity(), 1024);
        assert_eq!(Segment::new_owned(4097).capacity(), 8192);
    }

    #[test]
    fn append_and_align() {
        let mut seg = Segment::new_owned(16);
        seg.misalign = 100;
        assert_eq!(seg.append(b"hello"), 5);
        assert_eq!(seg.data(), b"hello");

        // Simulate a drained prefix, then realign.
        seg.misalign += 2;
        seg.len -= 2;
        assert_eq!(seg.data(), b"llo");
        seg.align();
        assert_eq!(seg.misalign, 0);
        assert_eq!(seg.data(), b"llo");
    }

    #[test]
    fn space_accounting() {
        let mut seg = Segment::new_owned(100);
        let cap = seg.capacity();
        assert_eq!(seg.space(), cap);
        seg.append(&[0u8; 100]);
        assert_eq!(seg.space(), cap - 100);
        seg.misalign = 0;
        seg.flags |= SEG_IMMUTABLE;
        assert_eq!(seg.space(), 0);
    }
}

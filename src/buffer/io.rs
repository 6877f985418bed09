use std::io as stdio;
use std::os::unix::io::RawFd;

use super::chain::{
    Cleanup, Segment, Store, MAX_CHAIN, SEG_IMMUTABLE, SEG_MMAP, SEG_REFERENCE,
    SEG_SENDFILE,
};
use super::{frozen, Buffer};

/// Ceiling on one readiness-triggered read.
const MAX_READ: usize = 4096;

/// Segments a single readv may scatter into.
const NUM_READ_IOVEC: usize = 4;

/// Segments a single writev may gather from.
const NUM_WRITE_IOVEC: usize = 128;

fn readable_on_socket(fd: RawFd) -> usize {
    let mut n: libc::c_int = 0;
    if unsafe { libc::ioctl(fd, libc::FIONREAD, &mut n) } < 0 || n <= 0 {
        return MAX_READ;
    }
    (n as usize).min(MAX_READ)
}

fn is_retriable(err: &stdio::Error) -> bool {
    matches!(
        err.kind(),
        stdio::ErrorKind::WouldBlock | stdio::ErrorKind::Interrupted
    )
}

impl Buffer {
    /// Read from `fd` into the buffer tail, scattering across at most
    /// four segments. `howmuch` caps the read; `None` reads what the
    /// kernel reports pending, bounded by 4096 bytes.
    ///
    /// Returns the bytes read; zero means end of file. Transient
    /// conditions surface as `WouldBlock`/`Interrupted` errors for the
    /// caller to reschedule.
    pub fn read(&self, fd: RawFd, howmuch: Option<usize>) -> stdio::Result<usize> {
        let mut state = self.inner.state.lock().unwrap();
        if state.freeze_end {
            return Err(frozen());
        }

        let limit = readable_on_socket(fd);
        let howmuch = match howmuch {
            Some(howmuch) if howmuch <= limit => howmuch,
            _ => limit,
        };

        state.expand_fast(howmuch, NUM_READ_IOVEC)?;

        // Gather the spare regions, then hand them to readv in one shot.
        let start = state.first_chain_with_space();
        let mut vecs: [libc::iovec; NUM_READ_IOVEC] = unsafe { std::mem::zeroed() };
        let mut nvecs = 0;
        let mut so_far = 0;
        for idx in start..state.chains.len() {
            if nvecs == NUM_READ_IOVEC || so_far >= howmuch {
                break;
            }
            let (base, len) = state.chains[idx].space_raw();
            if len == 0 {
                continue;
            }
            let len = len.min(howmuch - so_far);
            vecs[nvecs] = libc::iovec {
                iov_base: base as *mut libc::c_void,
                iov_len: len,
            };
            so_far += len;
            nvecs += 1;
        }

        let n = syscall!(readv(fd, vecs.as_ptr(), nvecs as libc::c_int))? as usize;
        if n == 0 {
            return Ok(0);
        }

        // Commit the bytes to the segments the iovecs pointed at.
        let mut remaining = n;
        let mut idx = start;
        loop {
            let space = state.chains[idx].space();
            if space < remaining {
                state.chains[idx].len += space;
                remaining -= space;
                idx += 1;
            } else {
                state.chains[idx].len += remaining;
                state.last_with_data = Some(idx);
                break;
            }
        }
        state.total_len += n;
        state.n_add_for_cb += n;

        let actions = state.invoke_callbacks();
        drop(state);
        actions.run(self);
        Ok(n)
    }

    /// Write the whole buffer head to `fd`; see
    /// [`write_atmost`](Buffer::write_atmost).
    pub fn write(&self, fd: RawFd) -> stdio::Result<usize> {
        self.write_atmost(fd, None)
    }

    /// Write up to `howmuch` bytes from the buffer head to `fd`, using
    /// sendfile for a file segment at the head and gathering up to 128
    /// in-memory segments otherwise. Written bytes are drained.
    ///
    /// Transient failures (`EAGAIN`/`EINTR`) report `Ok(0)`: nothing was
    /// written, try again when the descriptor is ready.
    pub fn write_atmost(&self, fd: RawFd, howmuch: Option<usize>) -> stdio::Result<usize> {
        let mut state = self.inner.state.lock().unwrap();
        if state.freeze_start {
            return Err(frozen());
        }

        let howmuch = howmuch.unwrap_or(state.total_len).min(state.total_len);
        let mut written = 0;
        if howmuch > 0 {
            let head_is_file = state
                .chains
                .front()
                .map_or(false, |seg| seg.flags & SEG_SENDFILE != 0);

            let res = if head_is_file {
                let head = state.chains.front().unwrap();
                let in_fd = head.file_fd().expect("sendfile segment without fd");
                let mut offset = head.misalign as libc::off_t;
                syscall!(sendfile(fd, in_fd, &mut offset, head.len))
            } else {
                let mut vecs: [libc::iovec; NUM_WRITE_IOVEC] =
                    unsafe { std::mem::zeroed() };
                let mut nvecs = 0;
                let mut left = howmuch;
                for seg in state.chains.iter() {
                    if nvecs == NUM_WRITE_IOVEC || left == 0 {
                        break;
                    }
                    // A file segment cannot join a gather write.
                    if seg.flags & SEG_SENDFILE != 0 {
                        break;
                    }
                    if seg.len == 0 {
                        continue;
                    }
                    let data = seg.data();
                    let len = data.len().min(left);
                    vecs[nvecs] = libc::iovec {
                        iov_base: data.as_ptr() as *mut libc::c_void,
                        iov_len: len,
                    };
                    left -= len;
                    nvecs += 1;
                }
                if nvecs == 0 {
                    return Ok(0);
                }
                syscall!(writev(fd, vecs.as_ptr(), nvecs as libc::c_int))
            };

            written = match res {
                Ok(n) => n as usize,
                Err(err) if is_retriable(&err) => return Ok(0),
                Err(err) => return Err(err),
            };
        }

        if written > 0 {
            state.drain_inner(written)?;
        }
        let actions = state.invoke_callbacks();
        drop(state);
        actions.run(self);
        Ok(written)
    }

    /// Append memory owned elsewhere without copying it. The segment is
    /// immutable; `cleanup` runs when the buffer no longer references the
    /// memory.
    ///
    /// # Safety
    ///
    /// `data..data + len` must stay valid and unmodified until `cleanup`
    /// is invoked.
    pub unsafe fn add_reference(
        &self,
        data: *const u8,
        len: usize,
        cleanup: Option<Cleanup>,
    ) -> stdio::Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        if state.freeze_end {
            // The memory will not be referenced after all.
            drop(state);
            if let Some(cleanup) = cleanup {
                cleanup(data, len);
            }
            return Err(frozen());
        }
        if len > MAX_CHAIN - state.total_len {
            drop(state);
            if let Some(cleanup) = cleanup {
                cleanup(data, len);
            }
            return Err(stdio::Error::new(
                stdio::ErrorKind::InvalidInput,
                "buffer size overflow",
            ));
        }

        let seg = Segment {
            misalign: 0,
            len,
            flags: SEG_IMMUTABLE | SEG_REFERENCE,
            store: Store::External {
                ptr: data,
                len,
                cleanup,
            },
        };
        state.chain_insert(seg);
        state.n_add_for_cb += len;

        let actions = state.invoke_callbacks();
        drop(state);
        actions.run(self);
        Ok(())
    }

    /// Append `length` bytes of a file starting at `offset`, taking
    /// ownership of `fd`.
    ///
    /// Buffers flagged [`set_drains_to_fd`](Buffer::set_drains_to_fd)
    /// get a sendfile segment; otherwise the region is mapped read-only,
    /// falling back to plain reads when the file cannot be mapped.
    pub fn add_file(&self, fd: RawFd, offset: u64, length: u64) -> stdio::Result<()> {
        let offset = offset as usize;
        let length = length as usize;
        if length > MAX_CHAIN || offset > MAX_CHAIN - length {
            return Err(stdio::Error::new(
                stdio::ErrorKind::InvalidInput,
                "file region out of range",
            ));
        }

        let sendfile_ok = {
            let state = self.inner.state.lock().unwrap();
            state.drains_to_fd
        };

        if sendfile_ok {
            let mut state = self.inner.state.lock().unwrap();
            if state.freeze_end {
                return Err(frozen());
            }
            let seg = Segment {
                misalign: offset,
                len: length,
                flags: SEG_SENDFILE | SEG_IMMUTABLE,
                store: Store::File { fd },
            };
            state.chain_insert(seg);
            state.n_add_for_cb += length;
            let actions = state.invoke_callbacks();
            drop(state);
            actions.run(self);
            return Ok(());
        }

        let maplen = offset + length;
        let mapped = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                maplen,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                fd,
                0,
            )
        };
        if mapped != libc::MAP_FAILED {
            let mut state = self.inner.state.lock().unwrap();
            if state.freeze_end {
                return Err(frozen());
            }
            let seg = Segment {
                misalign: 0,
                len: maplen,
                flags: SEG_MMAP | SEG_IMMUTABLE,
                store: Store::Mmap {
                    ptr: mapped as *mut u8,
                    len: maplen,
                    fd,
                },
            };
            state.chain_insert(seg);
            state.n_add_for_cb += length;
            // Logically the data starts at the file offset.
            state.drain_inner(offset)?;
            let actions = state.invoke_callbacks();
            drop(state);
            actions.run(self);
            return Ok(());
        }
        log::debug!(
            "mmap of fd {} failed ({}); reading instead",
            fd,
            stdio::Error::last_os_error()
        );

        // Pipes and the like cannot be mapped: read the region through a
        // temporary buffer, then splice.
        let close_fd = |err: stdio::Error| {
            unsafe { libc::close(fd) };
            err
        };
        syscall!(lseek(fd, offset as libc::off_t, libc::SEEK_SET)).map_err(close_fd)?;
        let tmp = Buffer::new();
        let mut left = length;
        while left > 0 {
            let n = match tmp.read(fd, Some(left)) {
                Ok(0) => {
                    return Err(close_fd(stdio::Error::new(
                        stdio::ErrorKind::UnexpectedEof,
                        "file shorter than requested region",
                    )))
                }
                Ok(n) => n,
                Err(ref err) if is_retriable(err) => continue,
                Err(err) => return Err(close_fd(err)),
            };
            left -= n;
        }
        self.add_buffer(&tmp).map_err(close_fd)?;
        unsafe { libc::close(fd) };
        Ok(())
    }
}

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};

/// Cross-thread wake-up over a self-pipe.
///
/// `wake` drops a single sentinel byte into the write end; the read end
/// is registered with the reactor as an internal readable event whose
/// callback calls `drain`. Sentinels are coalesced by the reactor's
/// notify-pending flag, so the pipe normally holds at most one byte.
#[derive(Debug)]
pub(crate) struct Waker {
    sender: File,
    receiver: File,
}

impl Waker {
    pub(crate) fn new() -> io::Result<Waker> {
        let (receiver, sender) = super::pipe_pair()?;
        Ok(Waker {
            sender: File::from(sender),
            receiver: File::from(receiver),
        })
    }

    pub(crate) fn wake(&self) -> io::Result<()> {
        loop {
            match (&self.sender).write(&[0]) {
                Ok(_) => return Ok(()),
                Err(err) => match err.kind() {
                    // A loop that stopped draining left the pipe full;
                    // make room and go around again.
                    io::ErrorKind::WouldBlock => self.drain(),
                    io::ErrorKind::Interrupted => {}
                    _ => return Err(err),
                },
            }
        }
    }

    /// Discard every pending sentinel. Errors are of no interest here:
    /// an empty pipe reports WouldBlock and anything worse surfaces on
    /// the next wake.
    pub(crate) fn drain(&self) {
        let mut sink = [0u8; 64];
        while matches!((&self.receiver).read(&mut sink), Ok(n) if n > 0) {}
    }

    pub(crate) fn read_fd(&self) -> RawFd {
        self.receiver.as_raw_fd()
    }
}

//! Event-driven I/O reactor with scatter-gather buffers.
//!
//! evio multiplexes file-descriptor readiness, POSIX signals and timers
//! over the best available kernel mechanism and dispatches them to user
//! callbacks. Three layers build on each other:
//!
//! * [`Reactor`] — registration of [`Event`]s, priority-ordered dispatch,
//!   a timer heap, common-timeout queues and cross-thread wake-up.
//! * [`Buffer`] — a chain of variable-sized segments supporting cheap
//!   append/prepend, zero-copy transfer between buffers, reference-counted
//!   external memory, file segments and line extraction.
//! * [`BufferedSocket`] — one read and one write buffer paired with a
//!   socket, driven by readiness, with watermarks and deferred callbacks.
//!
//! # Examples
//!
//! Run a one-shot 10ms timer:
//!
//! ```no_run
//! use std::time::Duration;
//! use evio::{Reactor, Ready};
//!
//! # fn main() -> std::io::Result<()> {
//! let reactor = Reactor::new()?;
//! reactor.once(-1, Ready::EMPTY, Some(Duration::from_millis(10)), |_, what| {
//!     assert!(what.is_timeout());
//! })?;
//! reactor.dispatch()?;
//! # Ok(())
//! # }
//! ```
#![warn(missing_docs, missing_debug_implementations)]

#[macro_use]
mod macros;

mod backend;
mod buffer;
mod bufsock;
mod event;
mod listener;
mod reactor;
mod ready;
mod signal;
mod sys;
mod timeheap;

pub use crate::backend::Features;
pub use crate::buffer::{
    Buffer, BufferPtr, CallbackHandle, CallbackInfo, Cleanup, EolStyle, PtrHow,
};
pub use crate::bufsock::{BufferedSocket, SocketEvents, SocketOptions};
pub use crate::event::Event;
pub use crate::listener::Listener;
pub use crate::reactor::{
    CommonTimeout, Config, Exit, LoopFlags, Reactor, Timeout,
};
pub use crate::ready::Ready;

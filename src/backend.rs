use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;
use std::{env, fmt, ops};

use crate::reactor::Config;
use crate::ready::Ready;
use crate::sys;

/// Capabilities advertised by a demultiplexer backend.
///
/// Returned by [`Reactor::features`](crate::Reactor::features) and usable
/// as a requirement filter in [`Config::require_features`](crate::Config::require_features).
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Features(u8);

const EDGE_TRIGGERED: u8 = 0b001;
const O1: u8 = 0b010;
const ARBITRARY_FDS: u8 = 0b100;

impl Features {
    /// No capabilities.
    pub const EMPTY: Features = Features(0);

    /// Edge-triggered delivery is available.
    pub const EDGE_TRIGGERED: Features = Features(EDGE_TRIGGERED);

    /// Adding, deleting and dispatching an event is O(1).
    pub const O1: Features = Features(O1);

    /// Any file descriptor, not just sockets, can be monitored.
    pub const ARBITRARY_FDS: Features = Features(ARBITRARY_FDS);

    /// Returns true if all bits of `required` are present.
    pub const fn contains(self, required: Features) -> bool {
        (self.0 & required.0) == required.0
    }

    /// Returns true if edge-triggered delivery is available.
    pub const fn is_edge_triggered(self) -> bool {
        (self.0 & EDGE_TRIGGERED) != 0
    }

    /// Returns true if backend operations are O(1).
    pub const fn is_o1(self) -> bool {
        (self.0 & O1) != 0
    }

    /// Returns true if arbitrary file descriptors are supported.
    pub const fn is_arbitrary_fds(self) -> bool {
        (self.0 & ARBITRARY_FDS) != 0
    }
}

impl Default for Features {
    fn default() -> Features {
        Features::EMPTY
    }
}

impl ops::BitOr for Features {
    type Output = Features;

    fn bitor(self, other: Features) -> Features {
        Features(self.0 | other.0)
    }
}

impl fmt::Debug for Features {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut one = false;
        let flags = [
            (Features::EDGE_TRIGGERED, "EDGE_TRIGGERED"),
            (Features::O1, "O1"),
            (Features::ARBITRARY_FDS, "ARBITRARY_FDS"),
        ];
        for (flag, msg) in &flags {
            if self.contains(*flag) {
                if one {
                    write!(fmt, " | ")?
                }
                write!(fmt, "{}", msg)?;
                one = true
            }
        }
        if !one {
            fmt.write_str("(empty)")?;
        }
        Ok(())
    }
}

/// A kernel readiness backend.
///
/// Interest changes (`add`/`del`) are made with the reactor lock held;
/// `select` is called with the lock released, so implementations keep
/// whatever interest state they need behind interior mutability.
pub(crate) trait Selector: Send + Sync {
    fn name(&self) -> &'static str;

    fn features(&self) -> Features;

    /// Whether the backend must be rebuilt after `fork(2)`.
    fn needs_reinit(&self) -> bool;

    fn reinit(&self) -> io::Result<()>;

    /// Register the bits in `added` for `fd`. `old` is the union of
    /// interests on this fd before the change.
    fn add(&self, fd: RawFd, old: Ready, added: Ready) -> io::Result<()>;

    /// Withdraw the bits in `removed` for `fd`. `old` is the union of
    /// interests on this fd before the change.
    fn del(&self, fd: RawFd, old: Ready, removed: Ready) -> io::Result<()>;

    /// Block for up to `timeout` (forever when `None`) and append every
    /// observed `(fd, readiness)` pair to `ready`. An interrupted wait is
    /// not an error; it returns with `ready` untouched.
    fn select(
        &self,
        timeout: Option<Duration>,
        ready: &mut Vec<(RawFd, Ready)>,
    ) -> io::Result<()>;
}

type Constructor = fn() -> io::Result<Box<dyn Selector>>;

// Preference order: first eligible backend that initializes wins.
const METHODS: &[(&str, Constructor)] = &[
    ("epoll", || {
        sys::Epoll::new().map(|s| Box::new(s) as Box<dyn Selector>)
    }),
    ("poll", || {
        sys::Poll::new().map(|s| Box::new(s) as Box<dyn Selector>)
    }),
    ("select", || {
        sys::Select::new().map(|s| Box::new(s) as Box<dyn Selector>)
    }),
];

fn disabled_by_env(name: &str) -> bool {
    let var = format!("EVIO_NO{}", name.to_uppercase());
    env::var_os(var).is_some()
}

pub(crate) fn choose(config: &Config) -> io::Result<Box<dyn Selector>> {
    for (name, constructor) in METHODS {
        if config.is_avoided(name) {
            continue;
        }
        if !config.ignores_env() && disabled_by_env(name) {
            continue;
        }
        let selector = match constructor() {
            Ok(selector) => selector,
            Err(err) => {
                log::debug!("backend {} failed to initialize: {}", name, err);
                continue;
            }
        };
        if !selector.features().contains(config.required_features()) {
            continue;
        }
        if !config.ignores_env() && env::var_os("EVIO_SHOW_METHOD").is_some() {
            eprintln!("evio using: {}", name);
        }
        return Ok(selector);
    }
    Err(io::Error::new(
        io::ErrorKind::NotFound,
        "no usable event notification backend",
    ))
}

#[cfg(test)]
mod tests {
    use super::Features;

    #[test]
    fn features_contains() {
        let f = Features::EDGE_TRIGGERED | Features::O1;
        assert!(f.contains(Features::EDGE_TRIGGERED));
        assert!(f.contains(Features::EMPTY));
        assert!(!f.contains(Features::ARBITRARY_FDS));
        assert!(f.is_edge_triggered());
        assert!(f.is_o1());
        assert!(!f.is_arbitrary_fds());
    }
}

use std::{fmt, ops};

/// A set of readiness kinds, used both when registering interest and when
/// a callback is told what happened.
///
/// When registering an [`Event`] the mask states what to monitor:
/// [`READABLE`], [`WRITABLE`], [`SIGNAL`] or nothing at all for a pure
/// timer. [`PERSIST`] keeps the registration alive across firings and
/// [`EDGE`] requests edge-triggered delivery where the backend supports
/// it. When a callback runs it receives the subset of bits that were
/// actually observed, possibly with [`TIMEOUT`] set.
///
/// [`Event`]: crate::Event
/// [`READABLE`]: Ready::READABLE
/// [`WRITABLE`]: Ready::WRITABLE
/// [`SIGNAL`]: Ready::SIGNAL
/// [`PERSIST`]: Ready::PERSIST
/// [`EDGE`]: Ready::EDGE
/// [`TIMEOUT`]: Ready::TIMEOUT
#[derive(Copy, PartialEq, Eq, Clone, PartialOrd, Ord)]
pub struct Ready(u16);

const TIMEOUT: u16 = 0b00_0001;
const READABLE: u16 = 0b00_0010;
const WRITABLE: u16 = 0b00_0100;
const SIGNAL: u16 = 0b00_1000;
const PERSIST: u16 = 0b01_0000;
const EDGE: u16 = 0b10_0000;

impl Ready {
    /// The empty set.
    pub const EMPTY: Ready = Ready(0);

    /// A timeout expired.
    pub const TIMEOUT: Ready = Ready(TIMEOUT);

    /// Readable readiness.
    pub const READABLE: Ready = Ready(READABLE);

    /// Writable readiness.
    pub const WRITABLE: Ready = Ready(WRITABLE);

    /// Signal delivery.
    pub const SIGNAL: Ready = Ready(SIGNAL);

    /// Keep the registration after it fires.
    pub const PERSIST: Ready = Ready(PERSIST);

    /// Request edge-triggered delivery.
    pub const EDGE: Ready = Ready(EDGE);

    /// Add together two `Ready` sets.
    ///
    /// This does the same thing as the `BitOr` implementation, but is a
    /// constant function.
    pub const fn add(self, other: Ready) -> Ready {
        Ready(self.0 | other.0)
    }

    /// Remove `other` from `self`.
    pub const fn remove(self, other: Ready) -> Ready {
        Ready(self.0 & !other.0)
    }

    /// Returns true if the set is empty.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns true if the value includes a timeout.
    pub const fn is_timeout(self) -> bool {
        (self.0 & TIMEOUT) != 0
    }

    /// Returns true if the value includes readable readiness.
    pub const fn is_readable(self) -> bool {
        (self.0 & READABLE) != 0
    }

    /// Returns true if the value includes writable readiness.
    pub const fn is_writable(self) -> bool {
        (self.0 & WRITABLE) != 0
    }

    /// Returns true if the value includes signal delivery.
    pub const fn is_signal(self) -> bool {
        (self.0 & SIGNAL) != 0
    }

    /// Returns true if the registration persists across firings.
    pub const fn is_persist(self) -> bool {
        (self.0 & PERSIST) != 0
    }

    /// Returns true if edge-triggered delivery was requested.
    pub const fn is_edge(self) -> bool {
        (self.0 & EDGE) != 0
    }

    /// Returns true if all bits of `other` are present in `self`.
    pub const fn contains(self, other: Ready) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Returns true if any bit of `other` is present in `self`.
    pub const fn intersects(self, other: Ready) -> bool {
        (self.0 & other.0) != 0
    }
}

impl ops::BitOr for Ready {
    type Output = Ready;

    #[inline]
    fn bitor(self, other: Ready) -> Ready {
        Ready(self.0 | other.0)
    }
}

impl ops::BitOrAssign for Ready {
    #[inline]
    fn bitor_assign(&mut self, other: Ready) {
        self.0 |= other.0;
    }
}

impl ops::BitAnd for Ready {
    type Output = Ready;

    #[inline]
    fn bitand(self, other: Ready) -> Ready {
        Ready(self.0 & other.0)
    }
}

impl ops::Sub for Ready {
    type Output = Ready;

    #[inline]
    fn sub(self, other: Ready) -> Ready {
        Ready(self.0 & !other.0)
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut one = false;
        let flags = [
            (Ready::TIMEOUT, "TIMEOUT"),
            (Ready::READABLE, "READABLE"),
            (Ready::WRITABLE, "WRITABLE"),
            (Ready::SIGNAL, "SIGNAL"),
            (Ready::PERSIST, "PERSIST"),
            (Ready::EDGE, "EDGE"),
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

#[cfg(test)]
mod tests {
    use super::Ready;

    #[test]
    fn bit_ops() {
        let rw = Ready::READABLE | Ready::WRITABLE;
        assert!(rw.is_readable());
        assert!(rw.is_writable());
        assert!(!rw.is_timeout());
        assert!(rw.contains(Ready::READABLE));
        assert!(!rw.contains(Ready::SIGNAL));
        assert!(rw.intersects(Ready::READABLE | Ready::SIGNAL));
        assert_eq!(rw - Ready::READABLE, Ready::WRITABLE);
        assert_eq!(rw.remove(Ready::WRITABLE), Ready::READABLE);
    }

    #[test]
    fn empty() {
        assert!(Ready::EMPTY.is_empty());
        assert!(!Ready::EMPTY.intersects(Ready::READABLE));
        assert_eq!(format!("{:?}", Ready::EMPTY), "(empty)");
    }

    #[test]
    fn debug_lists_bits() {
        let s = format!("{:?}", Ready::READABLE | Ready::PERSIST);
        assert!(s.contains("READABLE"));
        assert!(s.contains("PERSIST"));
    }
}

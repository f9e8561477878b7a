//! Readiness interest bitmask

use core::fmt;

/// Set of readiness events a session wants to be notified about.
///
/// The bit values follow the classic selector constants so masks read
/// naturally in diagnostics: read=1, write=4, connect=8, accept=16.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
#[repr(transparent)]
pub struct InterestSet(u8);

impl InterestSet {
    /// Input (read) readiness
    pub const INPUT: InterestSet = InterestSet(1);
    /// Output (write) readiness
    pub const OUTPUT: InterestSet = InterestSet(4);
    /// Outbound connect completion
    pub const CONNECT: InterestSet = InterestSet(8);
    /// Inbound accept readiness (listeners only)
    pub const ACCEPT: InterestSet = InterestSet(16);

    /// Empty set
    pub const NONE: InterestSet = InterestSet(0);

    #[inline]
    pub const fn from_bits(bits: u8) -> Self {
        InterestSet(bits)
    }

    #[inline]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn contains(self, other: InterestSet) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn with(self, other: InterestSet) -> Self {
        InterestSet(self.0 | other.0)
    }

    #[inline]
    pub const fn without(self, other: InterestSet) -> Self {
        InterestSet(self.0 & !other.0)
    }

    /// True if any bit maps to OS-level read readiness.
    #[inline]
    pub const fn wants_read(self) -> bool {
        self.0 & (Self::INPUT.0 | Self::ACCEPT.0) != 0
    }

    /// True if any bit maps to OS-level write readiness.
    #[inline]
    pub const fn wants_write(self) -> bool {
        self.0 & (Self::OUTPUT.0 | Self::CONNECT.0) != 0
    }
}

impl fmt::Display for InterestSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        if self.contains(InterestSet::INPUT) {
            write!(f, "r")?;
        }
        if self.contains(InterestSet::OUTPUT) {
            write!(f, "w")?;
        }
        if self.contains(InterestSet::CONNECT) {
            write!(f, "c")?;
        }
        if self.contains(InterestSet::ACCEPT) {
            write!(f, "a")?;
        }
        write!(f, "]")
    }
}

impl fmt::Debug for InterestSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InterestSet{}", self)
    }
}

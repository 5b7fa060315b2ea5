//! Context flag bitset

use core::fmt;
use core::ops::{BitAnd, BitOr, BitOrAssign, Not};

/// Flag bits attached to a context
///
/// The spawn-mode bits (`POST`, `DISPATCH`) select how the entry closure is
/// submitted to the reactor. `DETACH` releases the owning handle's claim so
/// the context reclaims itself on exit. `INTERRUPTED`/`TERMINATED` are the
/// cancellation bits observed at interruption points; a context spawned with
/// `INTERRUPTED` already set returns before running its entry function.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct Flags(u8);

impl Flags {
    /// No flags set
    pub const NONE: Flags = Flags(0);
    /// Enqueue the entry for a later reactor turn
    pub const POST: Flags = Flags(1 << 0);
    /// Run the entry now if possible, else enqueue
    pub const DISPATCH: Flags = Flags(1 << 1);
    /// Context cleans itself up; the handle does not join on drop
    pub const DETACH: Flags = Flags(1 << 2);
    /// Cancellation requested; delivered at the next interruption point
    pub const INTERRUPTED: Flags = Flags(1 << 3);
    /// Forced cancellation; distinguishable from INTERRUPTED and sticky
    pub const TERMINATED: Flags = Flags(1 << 4);

    /// Check whether every bit of `other` is set
    #[inline]
    pub const fn has(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Check whether no bits are set
    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Flags {
    type Output = Flags;
    #[inline]
    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl BitOrAssign for Flags {
    #[inline]
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Flags {
    type Output = Flags;
    #[inline]
    fn bitand(self, rhs: Flags) -> Flags {
        Flags(self.0 & rhs.0)
    }
}

impl Not for Flags {
    type Output = Flags;
    #[inline]
    fn not(self) -> Flags {
        Flags(!self.0)
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut put = |f: &mut fmt::Formatter<'_>, s: &str| -> fmt::Result {
            if !first {
                write!(f, "|")?;
            }
            first = false;
            write!(f, "{}", s)
        };
        if self.is_empty() {
            return write!(f, "NONE");
        }
        if self.has(Flags::POST) {
            put(f, "POST")?;
        }
        if self.has(Flags::DISPATCH) {
            put(f, "DISPATCH")?;
        }
        if self.has(Flags::DETACH) {
            put(f, "DETACH")?;
        }
        if self.has(Flags::INTERRUPTED) {
            put(f, "INTERRUPTED")?;
        }
        if self.has(Flags::TERMINATED) {
            put(f, "TERMINATED")?;
        }
        Ok(())
    }
}

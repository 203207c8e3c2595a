//! Arithmetic-flags set
//!
//! A small bitset over the six arithmetic flags. The empty set means
//! every arithmetic flag is dead.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not, Sub};

use serde::{Deserialize, Serialize};

/// A set of arithmetic flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AFlags(u8);

impl AFlags {
    pub const CF: AFlags = AFlags(1 << 0);
    pub const PF: AFlags = AFlags(1 << 1);
    pub const AF: AFlags = AFlags(1 << 2);
    pub const ZF: AFlags = AFlags(1 << 3);
    pub const SF: AFlags = AFlags(1 << 4);
    pub const OF: AFlags = AFlags(1 << 5);

    pub const NONE: AFlags = AFlags(0);
    pub const ALL: AFlags = AFlags(0x3f);
    /// The five flags the byte-load/byte-store flag primitives move;
    /// the overflow flag needs its own instruction.
    pub const BYTE: AFlags = AFlags(0x1f);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: AFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: AFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for AFlags {
    type Output = AFlags;
    fn bitor(self, rhs: AFlags) -> AFlags {
        AFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for AFlags {
    fn bitor_assign(&mut self, rhs: AFlags) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for AFlags {
    type Output = AFlags;
    fn bitand(self, rhs: AFlags) -> AFlags {
        AFlags(self.0 & rhs.0)
    }
}

impl Sub for AFlags {
    type Output = AFlags;
    fn sub(self, rhs: AFlags) -> AFlags {
        AFlags(self.0 & !rhs.0)
    }
}

impl Not for AFlags {
    type Output = AFlags;
    fn not(self) -> AFlags {
        AFlags(!self.0 & Self::ALL.0)
    }
}

impl fmt::Display for AFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("-");
        }
        let names = [
            (AFlags::CF, "C"),
            (AFlags::PF, "P"),
            (AFlags::AF, "A"),
            (AFlags::ZF, "Z"),
            (AFlags::SF, "S"),
            (AFlags::OF, "O"),
        ];
        for (flag, name) in names {
            if self.contains(flag) {
                f.write_str(name)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_algebra() {
        let read = AFlags::CF | AFlags::ZF;
        let written = AFlags::ZF | AFlags::OF;
        // Liveness update: (prior | read) - (written - read)
        let prior = AFlags::SF;
        let next = (prior | read) - (written - read);
        assert!(next.contains(AFlags::CF));
        assert!(next.contains(AFlags::ZF));
        assert!(next.contains(AFlags::SF));
        assert!(!next.contains(AFlags::OF));
    }

    #[test]
    fn test_byte_subset_excludes_overflow() {
        assert!(AFlags::BYTE.contains(AFlags::CF));
        assert!(!AFlags::BYTE.contains(AFlags::OF));
        assert_eq!(AFlags::BYTE | AFlags::OF, AFlags::ALL);
    }

    #[test]
    fn test_display() {
        assert_eq!((AFlags::CF | AFlags::OF).to_string(), "CO");
        assert_eq!(AFlags::NONE.to_string(), "-");
    }
}

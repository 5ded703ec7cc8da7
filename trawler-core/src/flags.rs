//! Open flags for shard checkout.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Number of tries for an operation against the index backend before the
/// error is surfaced and the shard closed.
pub const DB_RETRIES: usize = 10;

#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct OpenFlags(u32);

impl OpenFlags {
    /// Open an existing index.
    pub const OPEN: OpenFlags = OpenFlags(0x0001);
    /// Create a new index; fails if one already exists.
    pub const CREATE: OpenFlags = OpenFlags(0x0002);
    /// Create the index if it doesn't already exist.
    pub const CREATE_OR_OPEN: OpenFlags = OpenFlags(0x0003);
    /// Create the index, overwriting any existing one.
    pub const CREATE_OR_OVERWRITE: OpenFlags = OpenFlags(0x0006);
    /// Open as writable.
    pub const WRITABLE: OpenFlags = OpenFlags(0x1000);
    /// Shard is being restored.
    pub const RESTORE: OpenFlags = OpenFlags(0x2000);
    /// Shard is being replicated.
    pub const REPLICA: OpenFlags = OpenFlags(0x4000);
    /// Do not open a WAL for this shard.
    pub const DISABLE_WAL: OpenFlags = OpenFlags(0x8000);
    /// fsync the WAL on every append instead of debouncing.
    pub const SYNCHRONOUS_WAL: OpenFlags = OpenFlags(0x10000);

    pub fn empty() -> OpenFlags {
        OpenFlags(0)
    }

    pub fn contains(self, other: OpenFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_writable(self) -> bool {
        self.contains(OpenFlags::WRITABLE)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> OpenFlags {
        OpenFlags(bits)
    }
}

impl BitOr for OpenFlags {
    type Output = OpenFlags;

    fn bitor(self, rhs: OpenFlags) -> OpenFlags {
        OpenFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for OpenFlags {
    fn bitor_assign(&mut self, rhs: OpenFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for OpenFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(OpenFlags::CREATE_OR_OPEN) {
            names.push("CREATE_OR_OPEN");
        } else if self.contains(OpenFlags::CREATE) {
            names.push("CREATE");
        } else if self.contains(OpenFlags::OPEN) {
            names.push("OPEN");
        }
        if self.contains(OpenFlags::CREATE_OR_OVERWRITE) {
            names.push("CREATE_OR_OVERWRITE");
        }
        if self.contains(OpenFlags::WRITABLE) {
            names.push("WRITABLE");
        }
        if self.contains(OpenFlags::RESTORE) {
            names.push("RESTORE");
        }
        if self.contains(OpenFlags::REPLICA) {
            names.push("REPLICA");
        }
        if self.contains(OpenFlags::DISABLE_WAL) {
            names.push("DISABLE_WAL");
        }
        if self.contains(OpenFlags::SYNCHRONOUS_WAL) {
            names.push("SYNCHRONOUS_WAL");
        }
        write!(f, "{}", names.join("|"))
    }
}

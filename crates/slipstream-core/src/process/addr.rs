//! Opaque addresses in the target's address space.
//!
//! A `RemotePtr` is never dereferenced locally; it only has meaning as an
//! argument to the read/write operations on [`super::ProcessMemory`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// An address inside the target process.
///
/// Arithmetic is explicit (`offset`/`wrapping_add_signed`) so that pointer
/// math across the process boundary is visible at every call site.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RemotePtr(u64);

impl RemotePtr {
    pub const NULL: RemotePtr = RemotePtr(0);

    /// Any value at or below this is treated as "stub never fired" rather
    /// than a real pointer (the first 64 KB of a Windows process is never
    /// mapped).
    pub const MIN_PLAUSIBLE: u64 = 0x10000;

    pub const fn new(addr: u64) -> Self {
        RemotePtr(addr)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// True if the value looks like a captured pointer rather than a
    /// sentinel or uninitialised scratch memory.
    pub const fn is_plausible(self) -> bool {
        self.0 > Self::MIN_PLAUSIBLE
    }

    pub const fn offset(self, delta: u64) -> Self {
        RemotePtr(self.0 + delta)
    }

    pub const fn wrapping_add_signed(self, delta: i64) -> Self {
        RemotePtr(self.0.wrapping_add_signed(delta))
    }

    pub fn saturating_sub(self, delta: u64) -> Self {
        RemotePtr(self.0.saturating_sub(delta))
    }

    /// Signed distance from `other` to `self`.
    pub const fn distance_from(self, other: RemotePtr) -> i64 {
        self.0.wrapping_sub(other.0) as i64
    }
}

impl fmt::Display for RemotePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<u64> for RemotePtr {
    fn from(addr: u64) -> Self {
        RemotePtr(addr)
    }
}

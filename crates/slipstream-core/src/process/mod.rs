//! Target-process access: addresses, memory I/O, thread freezing, and the
//! test mock.

mod addr;
pub mod freeze;
mod reader;

#[cfg(test)]
pub mod mock;

#[cfg(target_os = "windows")]
mod handle;

pub use addr::RemotePtr;
pub use freeze::{FreezeControl, FreezeGuard};
pub use reader::{PageProtection, ProcessMemory};

#[cfg(target_os = "windows")]
pub use freeze::ThreadFreezer;
#[cfg(target_os = "windows")]
pub use handle::ProcessHandle;

//! Thread suspension for the target process.
//!
//! Freezing every target thread is the sole atomicity primitive of the
//! engine: a patch written while frozen cannot be observed mid-write by
//! any of the target's own threads.

use crate::error::Result;

/// Proof that the target's threads are suspended.
///
/// Dropping the guard resumes them, so an early return from a patching
/// path can never leave the target frozen. Call [`FreezeGuard::resume`]
/// to make the resume point explicit.
pub struct FreezeGuard {
    threads: usize,
    resume: Option<Box<dyn FnOnce() + Send>>,
}

impl FreezeGuard {
    pub fn new(threads: usize, resume: impl FnOnce() + Send + 'static) -> Self {
        FreezeGuard {
            threads,
            resume: Some(Box::new(resume)),
        }
    }

    /// Number of threads that were suspended.
    pub fn thread_count(&self) -> usize {
        self.threads
    }

    /// Resume all suspended threads.
    pub fn resume(mut self) {
        if let Some(resume) = self.resume.take() {
            resume();
        }
    }
}

impl Drop for FreezeGuard {
    fn drop(&mut self) {
        if let Some(resume) = self.resume.take() {
            resume();
        }
    }
}

/// Suspend and resume every thread owned by the target.
pub trait FreezeControl: Send + Sync {
    /// Suspend all target threads.
    ///
    /// A freeze that suspends zero threads is an error, not an empty
    /// success: it means suspension is not in effect and any patch write
    /// would race live execution. Callers must abort and roll back.
    fn freeze_all(&self) -> Result<FreezeGuard>;
}

/// Windows implementation over a Toolhelp32 thread snapshot.
#[cfg(target_os = "windows")]
pub use windows_impl::ThreadFreezer;

#[cfg(target_os = "windows")]
mod windows_impl {
    use std::mem;

    use tracing::{debug, warn};
    use windows::Win32::Foundation::{CloseHandle, HANDLE};
    use windows::Win32::System::Diagnostics::ToolHelp::{
        CreateToolhelp32Snapshot, TH32CS_SNAPTHREAD, THREADENTRY32, Thread32First, Thread32Next,
    };
    use windows::Win32::System::Threading::{
        OpenThread, ResumeThread, SuspendThread, THREAD_SUSPEND_RESUME,
    };

    use super::{FreezeControl, FreezeGuard};
    use crate::error::{Error, Result};

    /// Open thread handle that is closed on drop.
    struct ThreadHandle(HANDLE);

    // SAFETY: a thread HANDLE is a kernel object reference; it is valid
    // from any thread and only closed once, in Drop.
    unsafe impl Send for ThreadHandle {}

    impl Drop for ThreadHandle {
        fn drop(&mut self) {
            // SAFETY: self.0 was returned open by OpenThread.
            unsafe {
                let _ = CloseHandle(self.0);
            }
        }
    }

    pub struct ThreadFreezer {
        pid: u32,
    }

    impl ThreadFreezer {
        pub fn new(pid: u32) -> Self {
            ThreadFreezer { pid }
        }

        fn suspend_all(&self) -> Result<Vec<ThreadHandle>> {
            // SAFETY: snapshot handle is closed below on every path.
            let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, 0) }
                .map_err(|e| Error::FreezeFailed(format!("thread snapshot failed: {e}")))?;

            let mut entry = THREADENTRY32 {
                dwSize: mem::size_of::<THREADENTRY32>() as u32,
                ..Default::default()
            };

            let mut handles = Vec::new();
            // SAFETY: entry.dwSize is initialized and the snapshot is valid.
            unsafe {
                if Thread32First(snapshot, &mut entry).is_ok() {
                    loop {
                        if entry.th32OwnerProcessID == self.pid {
                            match OpenThread(THREAD_SUSPEND_RESUME, false, entry.th32ThreadID) {
                                Ok(handle) => {
                                    if SuspendThread(handle) == u32::MAX {
                                        warn!(
                                            "SuspendThread failed for tid {}",
                                            entry.th32ThreadID
                                        );
                                        let _ = CloseHandle(handle);
                                    } else {
                                        handles.push(ThreadHandle(handle));
                                    }
                                }
                                Err(e) => {
                                    warn!("OpenThread failed for tid {}: {e}", entry.th32ThreadID)
                                }
                            }
                        }
                        if Thread32Next(snapshot, &mut entry).is_err() {
                            break;
                        }
                    }
                }
                let _ = CloseHandle(snapshot);
            }

            Ok(handles)
        }
    }

    impl FreezeControl for ThreadFreezer {
        fn freeze_all(&self) -> Result<FreezeGuard> {
            let handles = self.suspend_all()?;
            if handles.is_empty() {
                return Err(Error::FreezeFailed(format!(
                    "suspended zero threads of pid {}; check process permissions",
                    self.pid
                )));
            }
            debug!("froze {} target threads", handles.len());

            let count = handles.len();
            Ok(FreezeGuard::new(count, move || {
                for handle in &handles {
                    // SAFETY: handle is open and was suspended by us.
                    unsafe {
                        if ResumeThread(handle.0) == u32::MAX {
                            warn!("ResumeThread failed for a suspended target thread");
                        }
                    }
                }
                // handles dropped here, closing them.
            }))
        }
    }
}

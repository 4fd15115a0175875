//! Live process attachment on Windows.
//!
//! Wraps the Toolhelp32 snapshot walk to find the target by executable
//! name and the `windows` crate memory APIs behind [`ProcessMemory`].

use std::ffi::c_void;
use std::mem;

use tracing::{debug, info};
use windows::Win32::Foundation::{CloseHandle, HANDLE};
use windows::Win32::System::Diagnostics::Debug::{ReadProcessMemory, WriteProcessMemory};
use windows::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, MODULEENTRY32W, Module32FirstW, Module32NextW, PROCESSENTRY32W,
    Process32FirstW, Process32NextW, TH32CS_SNAPMODULE, TH32CS_SNAPPROCESS,
};
use windows::Win32::System::Memory::{
    MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_PROTECTION_FLAGS, VirtualAllocEx, VirtualFreeEx,
    VirtualProtectEx,
};
use windows::Win32::System::Threading::{
    OpenProcess, PROCESS_QUERY_INFORMATION, PROCESS_VM_OPERATION, PROCESS_VM_READ,
    PROCESS_VM_WRITE,
};

use crate::error::{Error, Result};
use crate::process::reader::{PageProtection, ProcessMemory};
use crate::process::RemotePtr;

/// Granularity VirtualAllocEx actually hands addresses out at.
const ALLOC_GRANULARITY: u64 = 0x10000;

/// How far either side of the hint the near-alloc probe walks. Stays
/// comfortably inside rel32 range even after page rounding.
const NEAR_ALLOC_SPAN: u64 = 0x7000_0000;

fn wide_to_string(wide: &[u16]) -> String {
    let len = wide.iter().position(|&c| c == 0).unwrap_or(wide.len());
    String::from_utf16_lossy(&wide[..len])
}

/// Open handle to the target process plus its main module geometry.
pub struct ProcessHandle {
    handle: HANDLE,
    pid: u32,
    name: String,
    base: RemotePtr,
    module_size: usize,
}

// SAFETY: a process HANDLE is a kernel object reference usable from any
// thread; all mutation of target memory goes through the win32 calls,
// which are themselves thread-safe.
unsafe impl Send for ProcessHandle {}
unsafe impl Sync for ProcessHandle {}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        // SAFETY: handle was returned open by OpenProcess.
        unsafe {
            let _ = CloseHandle(self.handle);
        }
    }
}

impl ProcessHandle {
    /// Find a running process by executable name and open it with the
    /// memory-access rights the engine needs.
    pub fn attach(process_name: &str) -> Result<Self> {
        let pid = find_pid(process_name)?
            .ok_or_else(|| Error::ProcessNotFound(process_name.to_string()))?;

        // SAFETY: standard OpenProcess call; handle ownership moves into
        // the ProcessHandle and is closed in Drop.
        let handle = unsafe {
            OpenProcess(
                PROCESS_QUERY_INFORMATION
                    | PROCESS_VM_READ
                    | PROCESS_VM_WRITE
                    | PROCESS_VM_OPERATION,
                false,
                pid,
            )
        }
        .map_err(|e| Error::ProcessOpenFailed(format!("{process_name} (pid {pid}): {e}")))?;

        let (base, module_size) = match find_main_module(pid, process_name) {
            Ok(geometry) => geometry,
            Err(e) => {
                // SAFETY: closing the handle we just opened.
                unsafe {
                    let _ = CloseHandle(handle);
                }
                return Err(e);
            }
        };

        info!(
            pid,
            base = %base,
            size = module_size,
            "attached to {process_name}"
        );
        Ok(ProcessHandle {
            handle,
            pid,
            name: process_name.to_string(),
            base,
            module_size,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

fn find_pid(process_name: &str) -> Result<Option<u32>> {
    // SAFETY: snapshot handle closed below on every path.
    let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) }
        .map_err(|e| Error::ProcessOpenFailed(format!("process snapshot failed: {e}")))?;

    let mut entry = PROCESSENTRY32W {
        dwSize: mem::size_of::<PROCESSENTRY32W>() as u32,
        ..Default::default()
    };

    let mut found = None;
    // SAFETY: entry.dwSize is initialized and the snapshot is valid.
    unsafe {
        if Process32FirstW(snapshot, &mut entry).is_ok() {
            loop {
                if wide_to_string(&entry.szExeFile).eq_ignore_ascii_case(process_name) {
                    found = Some(entry.th32ProcessID);
                    break;
                }
                if Process32NextW(snapshot, &mut entry).is_err() {
                    break;
                }
            }
        }
        let _ = CloseHandle(snapshot);
    }
    Ok(found)
}

fn find_main_module(pid: u32, process_name: &str) -> Result<(RemotePtr, usize)> {
    // SAFETY: snapshot handle closed below on every path.
    let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPMODULE, pid) }
        .map_err(|e| Error::ProcessOpenFailed(format!("module snapshot failed: {e}")))?;

    let mut entry = MODULEENTRY32W {
        dwSize: mem::size_of::<MODULEENTRY32W>() as u32,
        ..Default::default()
    };

    let mut found = None;
    // SAFETY: entry.dwSize is initialized and the snapshot is valid.
    unsafe {
        if Module32FirstW(snapshot, &mut entry).is_ok() {
            loop {
                if wide_to_string(&entry.szModule).eq_ignore_ascii_case(process_name) {
                    found = Some((
                        RemotePtr::new(entry.modBaseAddr as u64),
                        entry.modBaseSize as usize,
                    ));
                    break;
                }
                if Module32NextW(snapshot, &mut entry).is_err() {
                    break;
                }
            }
        }
        let _ = CloseHandle(snapshot);
    }
    found.ok_or_else(|| {
        Error::ProcessOpenFailed(format!("main module of {process_name} not found"))
    })
}

impl ProcessMemory for ProcessHandle {
    fn base_address(&self) -> RemotePtr {
        self.base
    }

    fn module_size(&self) -> usize {
        self.module_size
    }

    fn pid(&self) -> u32 {
        self.pid
    }

    fn read_bytes(&self, addr: RemotePtr, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let mut read = 0usize;
        // SAFETY: buf lives for the duration of the call and is at least
        // `len` bytes.
        unsafe {
            ReadProcessMemory(
                self.handle,
                addr.get() as *const c_void,
                buf.as_mut_ptr() as *mut c_void,
                len,
                Some(&mut read),
            )
        }
        .map_err(|e| Error::MemoryReadFailed {
            address: addr,
            message: e.to_string(),
        })?;
        if read != len {
            return Err(Error::MemoryReadFailed {
                address: addr,
                message: format!("short read: {read} of {len} bytes"),
            });
        }
        Ok(buf)
    }

    fn write_bytes(&self, addr: RemotePtr, bytes: &[u8]) -> Result<()> {
        let mut written = 0usize;
        // SAFETY: bytes lives for the duration of the call.
        unsafe {
            WriteProcessMemory(
                self.handle,
                addr.get() as *const c_void,
                bytes.as_ptr() as *const c_void,
                bytes.len(),
                Some(&mut written),
            )
        }
        .map_err(|e| Error::MemoryWriteFailed {
            address: addr,
            message: e.to_string(),
        })?;
        if written != bytes.len() {
            return Err(Error::MemoryWriteFailed {
                address: addr,
                message: format!("short write: {written} of {} bytes", bytes.len()),
            });
        }
        Ok(())
    }

    fn alloc_near(&self, near: RemotePtr, size: usize) -> Result<RemotePtr> {
        // VirtualAllocEx refuses hints inside reserved regions, so walk
        // outward from the hint at allocation granularity until one
        // sticks. Forward first: stub pages after the image keep their
        // displacement positive, which is easier on the eyes in dumps.
        let start = near.get() & !(ALLOC_GRANULARITY - 1);
        let mut step = 0u64;
        while step <= NEAR_ALLOC_SPAN {
            for candidate in [start + step, start.saturating_sub(step)] {
                if candidate == 0 {
                    continue;
                }
                // SAFETY: a hint address; the kernel validates it.
                let page = unsafe {
                    VirtualAllocEx(
                        self.handle,
                        Some(candidate as *const c_void),
                        size,
                        MEM_COMMIT | MEM_RESERVE,
                        windows::Win32::System::Memory::PAGE_EXECUTE_READWRITE,
                    )
                };
                if !page.is_null() {
                    let addr = RemotePtr::new(page as u64);
                    debug!(addr = %addr, near = %near, "allocated stub page");
                    return Ok(addr);
                }
            }
            step += ALLOC_GRANULARITY;
        }
        Err(Error::AllocOutOfRange { near })
    }

    fn free(&self, addr: RemotePtr) -> Result<()> {
        // SAFETY: addr was returned by VirtualAllocEx on this process.
        unsafe { VirtualFreeEx(self.handle, addr.get() as *mut c_void, 0, MEM_RELEASE) }.map_err(
            |e| Error::MemoryWriteFailed {
                address: addr,
                message: format!("VirtualFreeEx failed: {e}"),
            },
        )
    }

    fn protect(
        &self,
        addr: RemotePtr,
        len: usize,
        prot: PageProtection,
    ) -> Result<PageProtection> {
        let mut old = PAGE_PROTECTION_FLAGS(0);
        // SAFETY: out-param lives for the duration of the call.
        unsafe {
            VirtualProtectEx(
                self.handle,
                addr.get() as *const c_void,
                len,
                PAGE_PROTECTION_FLAGS(prot.0),
                &mut old,
            )
        }
        .map_err(|e| Error::ProtectFailed {
            address: addr,
            message: e.to_string(),
        })?;
        Ok(PageProtection(old.0))
    }
}

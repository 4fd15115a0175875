//! In-memory stand-in for a live target process.
//!
//! The mock backs every cross-platform test: it serves a fake module
//! image, hands out stub pages within rel32 range, and tracks the two
//! things the higher layers must never get wrong, namely writes into the
//! module image while the target is not frozen, and stub pages that were
//! allocated but never freed.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::process::freeze::{FreezeControl, FreezeGuard};
use crate::process::reader::{PageProtection, ProcessMemory};
use crate::process::RemotePtr;

const PAGE: u64 = 0x1000;

struct Region {
    data: Vec<u8>,
    freed: bool,
}

struct State {
    image: Vec<u8>,
    allocs: BTreeMap<u64, Region>,
    protections: BTreeMap<u64, u32>,
    next_alloc: u64,
}

struct Inner {
    base: RemotePtr,
    pid: u32,
    state: Mutex<State>,
    frozen: Arc<AtomicBool>,
    unfrozen_image_writes: AtomicUsize,
}

/// Builder for [`MockProcess`].
pub struct MockProcessBuilder {
    base: u64,
    image: Vec<u8>,
    pid: u32,
}

impl MockProcessBuilder {
    pub fn new(base: u64) -> Self {
        MockProcessBuilder {
            base,
            image: Vec::new(),
            pid: 4242,
        }
    }

    /// Set the module image bytes served starting at the base address.
    pub fn image(mut self, image: Vec<u8>) -> Self {
        self.image = image;
        self
    }

    pub fn pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    pub fn build(self) -> MockProcess {
        let next_alloc = (self.base + self.image.len() as u64 + 0x10_0000) & !(PAGE - 1);
        MockProcess {
            inner: Arc::new(Inner {
                base: RemotePtr::new(self.base),
                pid: self.pid,
                state: Mutex::new(State {
                    image: self.image,
                    allocs: BTreeMap::new(),
                    protections: BTreeMap::new(),
                    next_alloc,
                }),
                frozen: Arc::new(AtomicBool::new(false)),
                unfrozen_image_writes: AtomicUsize::new(0),
            }),
        }
    }
}

/// Fake address space. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MockProcess {
    inner: Arc<Inner>,
}

impl MockProcess {
    /// Flag shared with [`MockFreezer`]; true while "threads" are
    /// suspended.
    pub fn frozen_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.inner.frozen)
    }

    /// Number of writes that touched the module image while the target
    /// was not frozen. Patch discipline says this stays at zero for code
    /// patches applied through the hook layer with freezing enabled.
    pub fn unfrozen_image_writes(&self) -> usize {
        self.inner.unfrozen_image_writes.load(Ordering::SeqCst)
    }

    /// Stub pages allocated and not yet freed.
    pub fn live_alloc_count(&self) -> usize {
        let state = self.inner.state.lock().expect("mock state poisoned");
        state.allocs.values().filter(|r| !r.freed).count()
    }

    /// Total pages ever allocated, freed or not.
    pub fn total_alloc_count(&self) -> usize {
        let state = self.inner.state.lock().expect("mock state poisoned");
        state.allocs.len()
    }

    /// Write without the unfrozen-write accounting; for test setup only.
    pub fn poke(&self, addr: RemotePtr, bytes: &[u8]) {
        let mut state = self.inner.state.lock().expect("mock state poisoned");
        write_locked(&mut state, self.inner.base, addr, bytes).expect("poke outside mapped memory");
    }
}

fn slice_of<'a>(
    state: &'a State,
    base: RemotePtr,
    addr: RemotePtr,
    len: usize,
) -> Option<(&'a [u8], usize)> {
    let a = addr.get();
    let image_start = base.get();
    let image_end = image_start + state.image.len() as u64;
    if a >= image_start && a + len as u64 <= image_end {
        return Some((&state.image, (a - image_start) as usize));
    }
    let (&start, region) = state.allocs.range(..=a).next_back()?;
    if !region.freed && a + len as u64 <= start + region.data.len() as u64 {
        Some((&region.data, (a - start) as usize))
    } else {
        None
    }
}

fn write_locked(
    state: &mut State,
    base: RemotePtr,
    addr: RemotePtr,
    bytes: &[u8],
) -> Result<bool> {
    let a = addr.get();
    let image_start = base.get();
    let image_end = image_start + state.image.len() as u64;
    if a >= image_start && a + bytes.len() as u64 <= image_end {
        let off = (a - image_start) as usize;
        state.image[off..off + bytes.len()].copy_from_slice(bytes);
        return Ok(true);
    }
    let containing = state
        .allocs
        .range_mut(..=a)
        .next_back()
        .filter(|(start, region)| {
            !region.freed && a + bytes.len() as u64 <= **start + region.data.len() as u64
        });
    match containing {
        Some((start, region)) => {
            let off = (a - *start) as usize;
            region.data[off..off + bytes.len()].copy_from_slice(bytes);
            Ok(false)
        }
        None => Err(Error::MemoryWriteFailed {
            address: addr,
            message: "address not mapped".to_string(),
        }),
    }
}

impl ProcessMemory for MockProcess {
    fn base_address(&self) -> RemotePtr {
        self.inner.base
    }

    fn module_size(&self) -> usize {
        let state = self.inner.state.lock().expect("mock state poisoned");
        state.image.len()
    }

    fn pid(&self) -> u32 {
        self.inner.pid
    }

    fn read_bytes(&self, addr: RemotePtr, len: usize) -> Result<Vec<u8>> {
        let state = self.inner.state.lock().expect("mock state poisoned");
        match slice_of(&state, self.inner.base, addr, len) {
            Some((data, off)) => Ok(data[off..off + len].to_vec()),
            None => Err(Error::MemoryReadFailed {
                address: addr,
                message: "address not mapped".to_string(),
            }),
        }
    }

    fn write_bytes(&self, addr: RemotePtr, bytes: &[u8]) -> Result<()> {
        let mut state = self.inner.state.lock().expect("mock state poisoned");
        let hit_image = write_locked(&mut state, self.inner.base, addr, bytes)?;
        if hit_image && !self.inner.frozen.load(Ordering::SeqCst) {
            self.inner
                .unfrozen_image_writes
                .fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn alloc_near(&self, near: RemotePtr, size: usize) -> Result<RemotePtr> {
        let mut state = self.inner.state.lock().expect("mock state poisoned");
        let addr = state.next_alloc;
        let pages = (size as u64).div_ceil(PAGE).max(1);
        state.next_alloc += pages * PAGE;

        let delta = RemotePtr::new(addr).distance_from(near);
        if delta.unsigned_abs() > i32::MAX as u64 {
            return Err(Error::AllocOutOfRange { near });
        }
        state.allocs.insert(
            addr,
            Region {
                data: vec![0u8; (pages * PAGE) as usize],
                freed: false,
            },
        );
        Ok(RemotePtr::new(addr))
    }

    fn free(&self, addr: RemotePtr) -> Result<()> {
        let mut state = self.inner.state.lock().expect("mock state poisoned");
        match state.allocs.get_mut(&addr.get()) {
            Some(region) if !region.freed => {
                region.freed = true;
                Ok(())
            }
            _ => Err(Error::MemoryWriteFailed {
                address: addr,
                message: "free of address that is not a live allocation".to_string(),
            }),
        }
    }

    fn protect(
        &self,
        addr: RemotePtr,
        _len: usize,
        prot: PageProtection,
    ) -> Result<PageProtection> {
        let mut state = self.inner.state.lock().expect("mock state poisoned");
        let page = addr.get() & !(PAGE - 1);
        let previous = state.protections.insert(page, prot.0).unwrap_or(0x20);
        Ok(PageProtection(previous))
    }
}

/// Fake freeze controller driving the flag shared with [`MockProcess`].
pub struct MockFreezer {
    frozen: Arc<AtomicBool>,
    threads: usize,
    fail_after: Option<usize>,
    calls: AtomicUsize,
}

impl MockFreezer {
    pub fn new(frozen: Arc<AtomicBool>) -> Self {
        MockFreezer {
            frozen,
            threads: 4,
            fail_after: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Zero threads makes every freeze fail, as a suspension that catches
    /// nothing does on a real target.
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Succeed for the first `n` freezes, then fail every later one, as
    /// when the target's threads die mid-cycle.
    pub fn fail_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }
}

impl FreezeControl for MockFreezer {
    fn freeze_all(&self) -> Result<FreezeGuard> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.threads == 0 || self.fail_after.is_some_and(|n| call >= n) {
            return Err(Error::FreezeFailed(
                "suspended zero threads of mock target".to_string(),
            ));
        }
        self.frozen.store(true, Ordering::SeqCst);
        let flag = Arc::clone(&self.frozen);
        Ok(FreezeGuard::new(self.threads, move || {
            flag.store(false, Ordering::SeqCst)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_is_in_rel32_range() {
        let mem = MockProcessBuilder::new(0x1_4000_0000)
            .image(vec![0u8; 0x1000])
            .build();
        let page = mem.alloc_near(mem.base_address(), 0x1000).unwrap();
        let delta = page.distance_from(mem.base_address());
        assert!(delta.unsigned_abs() <= i32::MAX as u64);

        mem.write_bytes(page, &[1, 2, 3]).unwrap();
        assert_eq!(mem.read_bytes(page, 3).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_freed_page_is_unmapped() {
        let mem = MockProcessBuilder::new(0x1000).image(vec![0u8; 0x10]).build();
        let page = mem.alloc_near(mem.base_address(), 0x1000).unwrap();
        mem.free(page).unwrap();
        assert!(mem.read_bytes(page, 1).is_err());
        assert!(mem.free(page).is_err());
        assert_eq!(mem.live_alloc_count(), 0);
        assert_eq!(mem.total_alloc_count(), 1);
    }

    #[test]
    fn test_unfrozen_image_writes_are_counted() {
        let mem = MockProcessBuilder::new(0x1000)
            .image(vec![0u8; 0x100])
            .build();
        let freezer = MockFreezer::new(mem.frozen_flag());

        mem.write_bytes(mem.base_address(), &[0xCC]).unwrap();
        assert_eq!(mem.unfrozen_image_writes(), 1);

        let guard = freezer.freeze_all().unwrap();
        mem.write_bytes(mem.base_address(), &[0xCC]).unwrap();
        guard.resume();
        assert_eq!(mem.unfrozen_image_writes(), 1);
    }

    #[test]
    fn test_zero_thread_freeze_fails() {
        let mem = MockProcessBuilder::new(0x1000).image(vec![]).build();
        let freezer = MockFreezer::new(mem.frozen_flag()).with_threads(0);
        assert!(matches!(
            freezer.freeze_all(),
            Err(Error::FreezeFailed(_))
        ));
    }
}

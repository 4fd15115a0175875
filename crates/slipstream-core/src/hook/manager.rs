//! Patch lifecycle: prepare, arm, disarm, and the cleanup registry.
//!
//! Every mutation of the target is recorded in the registry before it
//! happens, so a crash at any point leaves enough state to put the
//! target back exactly as it was. The registry is the single source of
//! truth for emergency cleanup; the orchestrator never tracks patches on
//! the side.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::hook::stub::{self, STUB_PAGE_SIZE};
use crate::hook::table::{HookFamily, HookSpec, HookTable};
use crate::process::{FreezeControl, PageProtection, ProcessMemory, RemotePtr};
use crate::scan::{ModuleScanner, Resolution};

/// Everything needed to undo the engine's footprint in the target.
#[derive(Default)]
pub struct CleanupRegistry {
    /// Site address to the original bytes the patch displaced.
    patches: BTreeMap<RemotePtr, Vec<u8>>,
    /// Stub pages allocated in the target.
    pages: BTreeSet<RemotePtr>,
}

impl CleanupRegistry {
    pub fn is_empty(&self) -> bool {
        self.patches.is_empty() && self.pages.is_empty()
    }

    pub fn patch_count(&self) -> usize {
        self.patches.len()
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }
}

/// A prepared (and possibly armed) hook.
pub struct InstalledHook {
    pub family: HookFamily,
    /// Address of the patched instruction.
    pub site: RemotePtr,
    /// Stub page in the target.
    pub page: RemotePtr,
    /// Bytes the patch displaces.
    pub original: Vec<u8>,
    /// Jump to the stub, NOP-padded to the site length.
    pub patch: Vec<u8>,
    pub permanent: bool,
}

impl InstalledHook {
    /// Address of a data cell on this hook's stub page.
    pub fn cell(&self, offset: u64) -> RemotePtr {
        stub::cell_addr(self.page, offset)
    }
}

/// Installs and removes hooks against one attached process.
pub struct HookManager<M> {
    mem: Arc<M>,
    scanner: Arc<ModuleScanner>,
    table: HookTable,
    registry: Arc<Mutex<CleanupRegistry>>,
}

impl<M> Clone for HookManager<M> {
    fn clone(&self) -> Self {
        HookManager {
            mem: Arc::clone(&self.mem),
            scanner: Arc::clone(&self.scanner),
            table: self.table.clone(),
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<M: ProcessMemory> HookManager<M> {
    pub fn new(mem: Arc<M>, table: HookTable) -> Self {
        HookManager {
            mem,
            scanner: Arc::new(ModuleScanner::new()),
            table,
            registry: Arc::new(Mutex::new(CleanupRegistry::default())),
        }
    }

    pub fn memory(&self) -> &Arc<M> {
        &self.mem
    }

    pub fn scanner(&self) -> &ModuleScanner {
        &self.scanner
    }

    pub fn registry(&self) -> Arc<Mutex<CleanupRegistry>> {
        Arc::clone(&self.registry)
    }

    pub fn registry_is_empty(&self) -> bool {
        self.lock_registry().is_empty()
    }

    fn lock_registry(&self) -> std::sync::MutexGuard<'_, CleanupRegistry> {
        // A poisoned registry still holds the truth about what is
        // patched; cleanup must proceed with it.
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Resolve a family's site without touching the target, warming the
    /// scanner cache. Used by the pre-scan pass so the capture cycle
    /// itself never pays for a full module scan.
    pub fn resolve_family(&self, family: HookFamily) -> Result<RemotePtr> {
        let spec = self.table.entry(family)?.clone();
        self.resolve_site(&spec)
    }

    /// Resolve the site, allocate the stub page, and write the stub.
    ///
    /// No target code is modified; the hook fires nothing until
    /// [`HookManager::arm`] writes the site patch.
    pub fn prepare(&self, family: HookFamily) -> Result<InstalledHook> {
        let spec = self.table.entry(family)?.clone();
        let site = self.resolve_site(&spec)?;

        let original = self.mem.read_bytes(site, spec.patch_len)?;
        if original.first() == Some(&0xE9) {
            return Err(Error::StaleInstrumentation { address: site });
        }

        let page = self.mem.alloc_near(site, STUB_PAGE_SIZE)?;
        self.lock_registry().pages.insert(page);

        let stub = stub::build(family, page, site, &original)?;
        self.mem.write_bytes(page, &stub.bytes)?;
        debug!(%family, site = %site, page = %page, "stub prepared");

        Ok(InstalledHook {
            family,
            site,
            page,
            original,
            patch: stub.patch,
            permanent: spec.permanent,
        })
    }

    fn resolve_site(&self, spec: &HookSpec) -> Result<RemotePtr> {
        let key = spec.family.to_string();
        let pattern = spec.pattern_bytes()?;
        let resolution = match self
            .scanner
            .resolve(&*self.mem, &key, &pattern, spec.static_offset)
        {
            Ok(resolution) => resolution,
            Err(Error::SignatureNotFound(key)) => {
                // A leftover jump from a crashed prior run makes the
                // signature unfindable; distinguish that from a target
                // update.
                if let Some(offset) = spec.static_offset {
                    let expected = spec.site(self.mem.base_address().offset(offset));
                    if let Ok(bytes) = self.mem.read_bytes(expected, 1) {
                        if bytes[0] == 0xE9 {
                            return Err(Error::StaleInstrumentation { address: expected });
                        }
                    }
                }
                return Err(Error::SignatureNotFound(key));
            }
            Err(e) => return Err(e),
        };
        if let Resolution::Full(addr) = resolution {
            info!(family = %spec.family, addr = %addr, "site found by full scan");
        }
        Ok(spec.site(resolution.address()))
    }

    /// Write the site patch. The caller decides whether the target is
    /// frozen around this; arming a per-frame site unfrozen risks the
    /// target executing a half-written jump.
    pub fn arm(&self, hook: &InstalledHook) -> Result<()> {
        // Registry first: if the write lands and we crash before
        // returning, cleanup still knows the original bytes.
        self.lock_registry()
            .patches
            .insert(hook.site, hook.original.clone());
        self.write_code(hook.site, &hook.patch)?;
        debug!(family = %hook.family, site = %hook.site, "armed");
        Ok(())
    }

    /// Restore the original bytes at the site. Idempotent: disarming a
    /// hook that is not armed is a no-op.
    pub fn disarm(&self, hook: &InstalledHook) -> Result<()> {
        let original = self.lock_registry().patches.get(&hook.site).cloned();
        let Some(original) = original else {
            return Ok(());
        };
        self.write_code(hook.site, &original)?;
        self.lock_registry().patches.remove(&hook.site);
        debug!(family = %hook.family, site = %hook.site, "disarmed");
        Ok(())
    }

    /// Disarm and free the stub page.
    pub fn release(&self, hook: &InstalledHook) -> Result<()> {
        self.disarm(hook)?;
        if self.lock_registry().pages.remove(&hook.page) {
            self.mem.free(hook.page)?;
        }
        Ok(())
    }

    /// Patch write with protection flip and read-back verification.
    fn write_code(&self, site: RemotePtr, bytes: &[u8]) -> Result<()> {
        let previous = self
            .mem
            .protect(site, bytes.len(), PageProtection::EXECUTE_READWRITE)?;
        let write = self.mem.write_bytes(site, bytes);
        let restore = self.mem.protect(site, bytes.len(), previous);
        write?;
        restore?;

        let readback = self.mem.read_bytes(site, bytes.len())?;
        if readback != bytes {
            return Err(Error::PatchVerifyFailed { address: site });
        }
        Ok(())
    }

    /// Put the target back: restore every recorded patch, free every
    /// recorded page. Failures are logged per address and counted rather
    /// than aborting the sweep.
    pub fn restore_all(&self) -> Result<()> {
        let (patches, pages) = {
            let registry = self.lock_registry();
            (registry.patches.clone(), registry.pages.clone())
        };

        let mut failed = 0usize;
        for (site, original) in patches {
            match self.write_code(site, &original) {
                Ok(()) => {
                    self.lock_registry().patches.remove(&site);
                }
                Err(e) => {
                    error!(site = %site, "failed to restore patch: {e}");
                    failed += 1;
                }
            }
        }
        for page in pages {
            match self.mem.free(page) {
                Ok(()) => {
                    self.lock_registry().pages.remove(&page);
                }
                Err(e) => {
                    error!(page = %page, "failed to free stub page: {e}");
                    failed += 1;
                }
            }
        }

        if failed > 0 {
            Err(Error::RestoreIncomplete { failed })
        } else {
            Ok(())
        }
    }

    /// Last-resort restore, used on shutdown and panic paths. Freezes if
    /// a controller is available so restores are not raced by the
    /// target; a failed freeze downgrades to an unfrozen sweep rather
    /// than leaving patches in place.
    pub fn emergency_cleanup(&self, freezer: Option<&dyn FreezeControl>) -> Result<()> {
        if self.registry_is_empty() {
            return Ok(());
        }
        info!("emergency cleanup: restoring all recorded patches");
        let guard = match freezer {
            Some(freezer) => match freezer.freeze_all() {
                Ok(guard) => Some(guard),
                Err(e) => {
                    warn!("cleanup freeze failed, restoring unfrozen: {e}");
                    None
                }
            },
            None => None,
        };
        let result = self.restore_all();
        drop(guard);
        result
    }
}

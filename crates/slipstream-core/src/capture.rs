//! The capture cycle.
//!
//! Base pointers only exist in registers at the hooked instructions, so
//! capturing them means arming the temporary hooks, letting the target
//! run a few frames, and disarming again. The orchestrator owns that
//! cycle: prepare stubs while the target runs, freeze to arm, poll the
//! data cells, freeze to disarm. Families that did not fire in time are
//! drained by a bounded background thread instead of holding the main
//! cycle open.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use strum::Display;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::hook::stub::cell;
use crate::hook::{HookFamily, HookManager, InstalledHook};
use crate::layout::{race_state, timing};
use crate::process::{FreezeControl, ProcessMemory, RemotePtr};

/// Families captured by a cycle, in arming order.
const TEMPORARY_FAMILIES: [HookFamily; 4] = [
    HookFamily::Dashboard,
    HookFamily::Timer,
    HookFamily::Progress,
    HookFamily::LocalPlayer,
];

/// Where the capture machinery currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Phase {
    Idle,
    PreScanning,
    Preparing,
    Armed,
    Draining,
    Direct,
}

/// Struct bases recovered from the stub data cells.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapturedBases {
    pub dashboard: Option<RemotePtr>,
    pub timer: Option<RemotePtr>,
    pub progress: Option<RemotePtr>,
    pub local_player: Option<RemotePtr>,
}

impl CapturedBases {
    pub fn set(&mut self, family: HookFamily, base: RemotePtr) {
        match family {
            HookFamily::Dashboard => self.dashboard = Some(base),
            HookFamily::Timer => self.timer = Some(base),
            HookFamily::Progress => self.progress = Some(base),
            HookFamily::LocalPlayer => self.local_player = Some(base),
            HookFamily::RaceState | HookFamily::Steering => {}
        }
    }

    pub fn get(&self, family: HookFamily) -> Option<RemotePtr> {
        match family {
            HookFamily::Dashboard => self.dashboard,
            HookFamily::Timer => self.timer,
            HookFamily::Progress => self.progress,
            HookFamily::LocalPlayer => self.local_player,
            HookFamily::RaceState | HookFamily::Steering => None,
        }
    }

    /// Fold late-arriving bases in without clobbering earlier ones.
    pub fn merge(&mut self, late: CapturedBases) {
        self.dashboard = self.dashboard.or(late.dashboard);
        self.timer = self.timer.or(late.timer);
        self.progress = self.progress.or(late.progress);
        self.local_player = self.local_player.or(late.local_player);
    }

    pub fn complete(&self) -> bool {
        self.dashboard.is_some()
            && self.timer.is_some()
            && self.progress.is_some()
            && self.local_player.is_some()
    }
}

/// Result of one capture cycle.
#[derive(Debug)]
pub enum CaptureOutcome {
    /// Every family fired.
    Complete(CapturedBases),
    /// Some families missing; their patches drain in the background and
    /// late bases surface through [`CaptureOrchestrator::take_late_bases`].
    Partial(CapturedBases),
    /// Menus came back or shutdown was requested; nothing captured and
    /// nothing left armed.
    Aborted(String),
}

/// Stub data cell holding the captured base for a family.
fn base_cell(family: HookFamily) -> u64 {
    match family {
        HookFamily::Dashboard => cell::DASH_BASE,
        HookFamily::Timer => cell::TIMER_BASE,
        HookFamily::Progress => cell::PROGRESS_BASE,
        HookFamily::LocalPlayer => cell::LOCAL_PLAYER_BASE,
        // Permanent families capture values, not bases.
        HookFamily::RaceState | HookFamily::Steering => 0,
    }
}

pub struct CaptureOrchestrator<M> {
    hooks: HookManager<M>,
    freezer: Arc<dyn FreezeControl>,
    config: EngineConfig,
    /// Data cell of the permanent race-state hook; drives menu-abort.
    race_state_cell: RemotePtr,
    phase: Mutex<Phase>,
    cancel: Arc<AtomicBool>,
    prescan_done: Arc<AtomicBool>,
    late_bases: Arc<Mutex<CapturedBases>>,
    prescan_thread: Mutex<Option<JoinHandle<()>>>,
    deferred_thread: Mutex<Option<JoinHandle<()>>>,
}

impl<M: ProcessMemory + 'static> CaptureOrchestrator<M> {
    pub fn new(
        hooks: HookManager<M>,
        freezer: Arc<dyn FreezeControl>,
        config: EngineConfig,
        race_state_cell: RemotePtr,
    ) -> Self {
        CaptureOrchestrator {
            hooks,
            freezer,
            config,
            race_state_cell,
            phase: Mutex::new(Phase::Idle),
            cancel: Arc::new(AtomicBool::new(false)),
            prescan_done: Arc::new(AtomicBool::new(false)),
            late_bases: Arc::new(Mutex::new(CapturedBases::default())),
            prescan_thread: Mutex::new(None),
            deferred_thread: Mutex::new(None),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
            .lock()
            .map(|p| *p)
            .unwrap_or(Phase::Idle)
    }

    fn set_phase(&self, phase: Phase) {
        if let Ok(mut current) = self.phase.lock() {
            if *current != phase {
                debug!(from = %current, to = %phase, "phase change");
                *current = phase;
            }
        }
    }

    /// Bases captured by the background drain since the last call.
    pub fn take_late_bases(&self) -> CapturedBases {
        self.late_bases
            .lock()
            .map(|mut slot| std::mem::take(&mut *slot))
            .unwrap_or_default()
    }

    /// Warm the signature cache in the background, typically kicked off
    /// on the countdown transition so the capture cycle starts with every
    /// site already resolved.
    pub fn start_prescan(&self) {
        let mut slot = match self.prescan_thread.lock() {
            Ok(slot) => slot,
            Err(_) => return,
        };
        if slot.is_some() || self.prescan_done.load(Ordering::SeqCst) {
            return;
        }
        self.set_phase(Phase::PreScanning);
        let hooks = self.hooks.clone();
        let done = Arc::clone(&self.prescan_done);
        let cancel = Arc::clone(&self.cancel);
        *slot = Some(thread::spawn(move || {
            for family in TEMPORARY_FAMILIES {
                if cancel.load(Ordering::SeqCst) {
                    return;
                }
                match hooks.resolve_family(family) {
                    Ok(site) => debug!(%family, site = %site, "pre-scan resolved"),
                    Err(e) => warn!(%family, "pre-scan failed: {e}"),
                }
            }
            done.store(true, Ordering::SeqCst);
        }));
    }

    pub fn prescan_finished(&self) -> bool {
        self.prescan_done.load(Ordering::SeqCst)
    }

    /// Run one full capture cycle. Blocks for at most the partial-capture
    /// bound plus two freeze windows.
    pub fn run_capture(&self) -> Result<CaptureOutcome> {
        self.join_prescan();
        self.join_deferred();
        self.set_phase(Phase::Preparing);

        let mut prepared = Vec::new();
        for family in TEMPORARY_FAMILIES {
            match self.hooks.prepare(family) {
                Ok(hook) => prepared.push(hook),
                Err(e) if e.is_fatal() => {
                    self.release_all(&prepared);
                    self.set_phase(Phase::Idle);
                    return Err(e);
                }
                Err(e) => warn!(%family, "family unavailable this cycle: {e}"),
            }
        }
        if prepared.is_empty() {
            self.set_phase(Phase::Idle);
            return Err(Error::CaptureAborted(
                "no hook site could be prepared".to_string(),
            ));
        }

        if let Err(e) = self.with_freeze(|| {
            for hook in &prepared {
                self.hooks.arm(hook)?;
            }
            Ok(())
        }) {
            // Whatever was armed before the failure is on record; put it
            // all back before reporting.
            self.rollback(&prepared);
            self.set_phase(Phase::Idle);
            return Err(e);
        }
        self.set_phase(Phase::Armed);
        info!(hooks = prepared.len(), "capture hooks armed");

        let exit = self.poll_armed(&prepared);

        self.set_phase(Phase::Draining);
        match exit {
            ArmedExit::MenuReturned | ArmedExit::Cancelled => {
                self.rollback(&prepared);
                self.set_phase(Phase::Idle);
                let reason = if matches!(exit, ArmedExit::MenuReturned) {
                    "target returned to menus while armed"
                } else {
                    "shutdown requested while armed"
                };
                return Ok(CaptureOutcome::Aborted(reason.to_string()));
            }
            ArmedExit::AllFired | ArmedExit::Deadline => {}
        }

        let (fired, unfired): (Vec<_>, Vec<_>) = prepared
            .into_iter()
            .partition(|hook| self.has_fired(hook));

        if let Err(e) = self.with_freeze(|| {
            for hook in &fired {
                self.hooks.disarm(hook)?;
            }
            Ok(())
        }) {
            // A half-finished disarm pass must not fall through to the
            // release loop, whose own disarm would rewrite the remaining
            // sites without a freeze.
            warn!("disarm pass failed: {e}");
            let mut all = fired;
            all.extend(unfired);
            self.rollback(&all);
            self.set_phase(Phase::Idle);
            return Err(e);
        }

        let mut bases = CapturedBases::default();
        for hook in &fired {
            if let Some(base) = self.read_base(hook) {
                bases.set(hook.family, base);
            }
            if let Err(e) = self.hooks.release(hook) {
                warn!(family = %hook.family, "release failed: {e}");
            }
        }

        if unfired.is_empty() {
            info!(?bases, "capture complete");
            self.set_phase(Phase::Direct);
            return Ok(CaptureOutcome::Complete(bases));
        }

        self.spawn_deferred_drain(unfired);
        self.set_phase(Phase::Direct);
        info!(?bases, "partial capture, draining remaining families");
        Ok(CaptureOutcome::Partial(bases))
    }

    /// Signal every background thread to wind down and wait for them.
    /// Leaves nothing armed: the deferred drain disarms on its way out.
    pub fn stop(&self) {
        self.cancel.store(true, Ordering::SeqCst);
        self.join_prescan();
        self.join_deferred();
        self.set_phase(Phase::Idle);
    }

    fn poll_armed(&self, prepared: &[InstalledHook]) -> ArmedExit {
        let started = Instant::now();
        // The safety cap binds when configured below the partial bound.
        let deadline = self
            .config
            .partial_capture_after
            .min(self.config.capture_safety_timeout);
        loop {
            if self.cancel.load(Ordering::SeqCst) {
                return ArmedExit::Cancelled;
            }
            // An unreadable cell is transient; menus are only declared on
            // a positive read of the sentinel.
            if let Ok(state) = self.hooks.memory().read_u32(self.race_state_cell) {
                if state == race_state::MENU_SENTINEL {
                    return ArmedExit::MenuReturned;
                }
            }

            let elapsed = started.elapsed();
            let all_fired = prepared.iter().all(|hook| self.has_fired(hook));
            if all_fired && elapsed >= timing::FAST_EXIT_MIN_ARMED {
                return ArmedExit::AllFired;
            }
            if elapsed >= deadline {
                return ArmedExit::Deadline;
            }
            thread::sleep(timing::ARMED_POLL_INTERVAL);
        }
    }

    fn has_fired(&self, hook: &InstalledHook) -> bool {
        self.read_base(hook).is_some()
    }

    fn read_base(&self, hook: &InstalledHook) -> Option<RemotePtr> {
        let addr = hook.cell(base_cell(hook.family));
        let base = self.hooks.memory().read_ptr(addr).ok()?;
        base.is_plausible().then_some(base)
    }

    /// Keep not-yet-fired patches alive for a bounded window, then take
    /// them out whether or not they fired.
    fn spawn_deferred_drain(&self, unfired: Vec<InstalledHook>) {
        let hooks = self.hooks.clone();
        let freezer = Arc::clone(&self.freezer);
        let freeze_enabled = self.config.freeze_for_capture;
        // The safety cap bounds drain exposure too.
        let window = self
            .config
            .deferred_exposure_window
            .min(self.config.capture_safety_timeout);
        let cancel = Arc::clone(&self.cancel);
        let slot = Arc::clone(&self.late_bases);

        let handle = thread::spawn(move || {
            let started = Instant::now();
            let mut remaining = unfired;
            while !remaining.is_empty() {
                let expired = started.elapsed() >= window || cancel.load(Ordering::SeqCst);
                let mut still_waiting = Vec::new();
                for hook in remaining {
                    let base = hooks
                        .memory()
                        .read_ptr(hook.cell(base_cell(hook.family)))
                        .ok()
                        .filter(|b| b.is_plausible());
                    if base.is_none() && !expired {
                        still_waiting.push(hook);
                        continue;
                    }
                    let family = hook.family;
                    let disarmed = if freeze_enabled {
                        match freezer.freeze_all() {
                            Ok(guard) => {
                                let r = hooks.disarm(&hook);
                                guard.resume();
                                r
                            }
                            Err(e) => {
                                warn!(%family, "deferred freeze failed: {e}");
                                hooks.disarm(&hook)
                            }
                        }
                    } else {
                        hooks.disarm(&hook)
                    };
                    match disarmed {
                        Ok(()) => match base {
                            Some(base) => {
                                info!(%family, base = %base, "deferred capture landed");
                                if let Ok(mut late) = slot.lock() {
                                    late.set(family, base);
                                }
                            }
                            None => warn!(%family, "deferred window expired without a capture"),
                        },
                        Err(e) => warn!(%family, "deferred disarm failed: {e}"),
                    }
                    if let Err(e) = hooks.release(&hook) {
                        warn!(%family, "deferred release failed: {e}");
                    }
                }
                remaining = still_waiting;
                if !remaining.is_empty() {
                    thread::sleep(timing::DEFERRED_POLL_INTERVAL);
                }
            }
        });
        if let Ok(mut slot) = self.deferred_thread.lock() {
            *slot = Some(handle);
        }
    }

    fn with_freeze<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let guard = if self.config.freeze_for_capture {
            Some(self.freezer.freeze_all()?)
        } else {
            None
        };
        let out = f();
        drop(guard);
        out
    }

    /// Undo everything about the in-flight cycle: disarm under freeze
    /// where possible, then release stubs.
    fn rollback(&self, prepared: &[InstalledHook]) {
        let result = self.with_freeze(|| {
            for hook in prepared {
                self.hooks.disarm(hook)?;
            }
            Ok(())
        });
        if let Err(e) = result {
            warn!("rollback disarm failed, falling back to registry sweep: {e}");
            // Unfrozen only as a last resort, when no freeze can be had.
            let sweep = match self.with_freeze(|| self.hooks.restore_all()) {
                Err(Error::FreezeFailed(_)) => self.hooks.restore_all(),
                other => other,
            };
            if let Err(e) = sweep {
                warn!("registry sweep incomplete: {e}");
            }
        }
        self.release_all(prepared);
    }

    fn release_all(&self, prepared: &[InstalledHook]) {
        for hook in prepared {
            if let Err(e) = self.hooks.release(hook) {
                warn!(family = %hook.family, "release failed: {e}");
            }
        }
    }

    fn join_prescan(&self) {
        let handle = self.prescan_thread.lock().ok().and_then(|mut s| s.take());
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    fn join_deferred(&self) {
        let handle = self.deferred_thread.lock().ok().and_then(|mut s| s.take());
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

enum ArmedExit {
    AllFired,
    Deadline,
    MenuReturned,
    Cancelled,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::hook::builtin_hook_table;
    use crate::hook::stub::{cell, DATA_OFFSET};
    use crate::process::mock::{MockFreezer, MockProcess, MockProcessBuilder};

    const DASHBOARD: [u8; 8] = [0xF3, 0x0F, 0x11, 0x8F, 0xB8, 0x01, 0x00, 0x00];
    const TIMER: [u8; 15] = [
        0x48, 0x01, 0x47, 0x10, 0x48, 0x8B, 0x97, 0xF8, 0x00, 0x00, 0x00, 0x48, 0x8B, 0x42, 0x08,
    ];
    const PROGRESS: [u8; 10] = [0x89, 0x87, 0xD8, 0x01, 0x00, 0x00, 0x48, 0x83, 0xC4, 0x38];
    const LOCAL_PLAYER: [u8; 13] = [
        0x48, 0x89, 0x43, 0x08, 0xF3, 0x41, 0x0F, 0x10, 0x8E, 0x30, 0x01, 0x00, 0x00,
    ];

    const BASE: u64 = 0x1_4000_0000;

    struct Rig {
        mem: MockProcess,
        orchestrator: CaptureOrchestrator<MockProcess>,
        race_cell: RemotePtr,
        /// Pages the orchestrator will allocate, in prepare order.
        next_pages: Vec<RemotePtr>,
    }

    fn rig(config: EngineConfig) -> Rig {
        let mut image = vec![0xCCu8; 0x8000];
        image[0x1000..0x1008].copy_from_slice(&DASHBOARD);
        image[0x2000..0x200F].copy_from_slice(&TIMER);
        image[0x3000..0x300A].copy_from_slice(&PROGRESS);
        image[0x4000..0x400D].copy_from_slice(&LOCAL_PLAYER);
        let mem = MockProcessBuilder::new(BASE).image(image).build();

        // Stand-in for the permanent race-state stub page.
        let race_page = mem.alloc_near(mem.base_address(), 0x1000).unwrap();
        let race_cell = race_page.offset(DATA_OFFSET + cell::RACE_STATE_VALUE);
        // Mid-race value so the armed loop does not see menus.
        mem.poke(race_cell, &500u32.to_le_bytes());

        // The mock allocator is deterministic: the next four pages go to
        // the four temporary families in prepare order.
        let next_pages = (1..=4)
            .map(|i| race_page.offset(i * 0x1000))
            .collect();

        let freezer = Arc::new(MockFreezer::new(mem.frozen_flag()));
        let hooks = HookManager::new(Arc::new(mem.clone()), builtin_hook_table());
        let orchestrator = CaptureOrchestrator::new(hooks, freezer, config, race_cell);
        Rig {
            mem,
            orchestrator,
            race_cell,
            next_pages,
        }
    }

    fn fire(mem: &MockProcess, page: RemotePtr, cell_off: u64, base: u64) {
        mem.poke(page.offset(DATA_OFFSET + cell_off), &base.to_le_bytes());
    }

    fn quick_config() -> EngineConfig {
        EngineConfig::builder()
            .partial_capture_after(Duration::from_millis(300))
            .deferred_exposure_window(Duration::from_millis(300))
            .build()
    }

    #[test]
    fn test_full_capture_cycle() {
        let r = rig(quick_config());
        let mem = r.mem.clone();
        let pages = r.next_pages.clone();

        let sim = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            fire(&mem, pages[0], cell::DASH_BASE, 0x1_5000_0000);
            fire(&mem, pages[1], cell::TIMER_BASE, 0x1_5100_0000);
            fire(&mem, pages[2], cell::PROGRESS_BASE, 0x1_5200_0000);
            fire(&mem, pages[3], cell::LOCAL_PLAYER_BASE, 0x1_5300_0000);
        });

        let outcome = r.orchestrator.run_capture().unwrap();
        sim.join().unwrap();

        let CaptureOutcome::Complete(bases) = outcome else {
            panic!("expected complete capture, got {outcome:?}");
        };
        assert!(bases.complete());
        assert_eq!(bases.dashboard, Some(RemotePtr::new(0x1_5000_0000)));
        assert_eq!(bases.local_player, Some(RemotePtr::new(0x1_5300_0000)));

        // Sites restored, pages freed (race-state stand-in page stays).
        assert_eq!(
            r.mem.read_bytes(r.mem.base_address().offset(0x1000), 8).unwrap(),
            &DASHBOARD
        );
        assert_eq!(r.mem.live_alloc_count(), 1);
        // Every code write happened under freeze.
        assert_eq!(r.mem.unfrozen_image_writes(), 0);
        assert_eq!(r.orchestrator.phase(), Phase::Direct);
    }

    #[test]
    fn test_menu_return_aborts_and_restores() {
        let r = rig(quick_config());
        let mem = r.mem.clone();
        let race_cell = r.race_cell;

        let sim = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            mem.poke(race_cell, &race_state::MENU_SENTINEL.to_le_bytes());
        });

        let outcome = r.orchestrator.run_capture().unwrap();
        sim.join().unwrap();

        assert!(matches!(outcome, CaptureOutcome::Aborted(_)));
        assert_eq!(
            r.mem.read_bytes(r.mem.base_address().offset(0x3000), 6).unwrap(),
            &PROGRESS[..6]
        );
        assert_eq!(r.mem.live_alloc_count(), 1);
        assert_eq!(r.mem.unfrozen_image_writes(), 0);
        assert_eq!(r.orchestrator.phase(), Phase::Idle);
    }

    #[test]
    fn test_partial_capture_drains_in_background() {
        let r = rig(quick_config());
        let mem = r.mem.clone();
        let pages = r.next_pages.clone();

        // Progress never fires during the cycle.
        let sim = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            fire(&mem, pages[0], cell::DASH_BASE, 0x1_5000_0000);
            fire(&mem, pages[1], cell::TIMER_BASE, 0x1_5100_0000);
            fire(&mem, pages[3], cell::LOCAL_PLAYER_BASE, 0x1_5300_0000);
        });

        let outcome = r.orchestrator.run_capture().unwrap();
        sim.join().unwrap();

        let CaptureOutcome::Partial(bases) = outcome else {
            panic!("expected partial capture, got {outcome:?}");
        };
        assert!(bases.dashboard.is_some());
        assert!(bases.progress.is_none());

        // The progress hook fires late and the drain picks it up.
        fire(&r.mem, r.next_pages[2], cell::PROGRESS_BASE, 0x1_5200_0000);
        r.orchestrator.stop();

        let late = r.orchestrator.take_late_bases();
        assert_eq!(late.progress, Some(RemotePtr::new(0x1_5200_0000)));
        assert_eq!(r.mem.live_alloc_count(), 1);
        assert_eq!(r.mem.unfrozen_image_writes(), 0);
    }

    #[test]
    fn test_deferred_window_expiry_disarms_unfired_hook() {
        let mut config = quick_config();
        config.deferred_exposure_window = Duration::from_millis(80);
        let r = rig(config);
        let mem = r.mem.clone();
        let pages = r.next_pages.clone();

        let sim = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            fire(&mem, pages[0], cell::DASH_BASE, 0x1_5000_0000);
            fire(&mem, pages[1], cell::TIMER_BASE, 0x1_5100_0000);
            fire(&mem, pages[3], cell::LOCAL_PLAYER_BASE, 0x1_5300_0000);
        });

        let outcome = r.orchestrator.run_capture().unwrap();
        sim.join().unwrap();
        assert!(matches!(outcome, CaptureOutcome::Partial(_)));

        // Let the window lapse without firing progress.
        thread::sleep(Duration::from_millis(150));
        r.orchestrator.stop();

        assert_eq!(r.orchestrator.take_late_bases(), CapturedBases::default());
        // Patch removed and page freed regardless.
        assert_eq!(
            r.mem.read_bytes(r.mem.base_address().offset(0x3000), 6).unwrap(),
            &PROGRESS[..6]
        );
        assert_eq!(r.mem.live_alloc_count(), 1);
    }

    #[test]
    fn test_failed_disarm_pass_still_restores_every_site() {
        let mut image = vec![0xCCu8; 0x8000];
        image[0x1000..0x1008].copy_from_slice(&DASHBOARD);
        image[0x2000..0x200F].copy_from_slice(&TIMER);
        image[0x3000..0x300A].copy_from_slice(&PROGRESS);
        image[0x4000..0x400D].copy_from_slice(&LOCAL_PLAYER);
        let mem = MockProcessBuilder::new(BASE).image(image).build();
        let race_page = mem.alloc_near(mem.base_address(), 0x1000).unwrap();
        let race_cell = race_page.offset(DATA_OFFSET + cell::RACE_STATE_VALUE);
        mem.poke(race_cell, &500u32.to_le_bytes());
        let pages: Vec<_> = (1..=4).map(|i| race_page.offset(i * 0x1000)).collect();

        // Arming freezes once; every later freeze fails, as when the
        // target's threads die while the hooks are armed.
        let freezer = Arc::new(MockFreezer::new(mem.frozen_flag()).fail_after(1));
        let hooks = HookManager::new(Arc::new(mem.clone()), builtin_hook_table());
        let orchestrator =
            CaptureOrchestrator::new(hooks, freezer, quick_config(), race_cell);

        // Only two families fire, so the disarm pass has both fired and
        // unfired hooks to unwind.
        let sim_mem = mem.clone();
        let sim = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            fire(&sim_mem, pages[0], cell::DASH_BASE, 0x1_5000_0000);
            fire(&sim_mem, pages[1], cell::TIMER_BASE, 0x1_5100_0000);
        });

        let result = orchestrator.run_capture();
        sim.join().unwrap();
        assert!(matches!(result, Err(Error::FreezeFailed(_))));

        // Fired and unfired sites alike are back to their original
        // bytes, and no stub page outlives the failed cycle.
        assert_eq!(
            mem.read_bytes(mem.base_address().offset(0x1000), 8).unwrap(),
            &DASHBOARD
        );
        assert_eq!(
            mem.read_bytes(mem.base_address().offset(0x3000), 6).unwrap(),
            &PROGRESS[..6]
        );
        assert_eq!(mem.live_alloc_count(), 1);
        assert_eq!(orchestrator.phase(), Phase::Idle);
    }

    #[test]
    fn test_safety_timeout_bounds_armed_window_and_drain() {
        let mut config = quick_config();
        config.partial_capture_after = Duration::from_secs(30);
        config.deferred_exposure_window = Duration::from_secs(30);
        config.capture_safety_timeout = Duration::from_millis(120);
        let r = rig(config);

        let started = Instant::now();
        let outcome = r.orchestrator.run_capture().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));

        // Nothing fired, so the cap ends the cycle with empty bases.
        let CaptureOutcome::Partial(bases) = outcome else {
            panic!("expected partial capture, got {outcome:?}");
        };
        assert_eq!(bases, CapturedBases::default());

        // The cap bounds the drain too: patches come out on their own,
        // well before the 30 s window would have let them.
        thread::sleep(Duration::from_millis(300));
        assert_eq!(
            r.mem.read_bytes(r.mem.base_address().offset(0x1000), 8).unwrap(),
            &DASHBOARD
        );
        assert_eq!(r.mem.live_alloc_count(), 1);
        r.orchestrator.stop();
    }

    #[test]
    fn test_freeze_failure_aborts_without_arming() {
        let r = {
            let mut image = vec![0xCCu8; 0x8000];
            image[0x1000..0x1008].copy_from_slice(&DASHBOARD);
            image[0x2000..0x200F].copy_from_slice(&TIMER);
            image[0x3000..0x300A].copy_from_slice(&PROGRESS);
            image[0x4000..0x400D].copy_from_slice(&LOCAL_PLAYER);
            let mem = MockProcessBuilder::new(BASE).image(image).build();
            let race_page = mem.alloc_near(mem.base_address(), 0x1000).unwrap();
            let race_cell = race_page.offset(DATA_OFFSET);
            mem.poke(race_cell, &500u32.to_le_bytes());
            let freezer = Arc::new(MockFreezer::new(mem.frozen_flag()).with_threads(0));
            let hooks = HookManager::new(Arc::new(mem.clone()), builtin_hook_table());
            let orchestrator =
                CaptureOrchestrator::new(hooks, freezer, quick_config(), race_cell);
            (mem, orchestrator)
        };
        let (mem, orchestrator) = r;

        assert!(matches!(
            orchestrator.run_capture(),
            Err(Error::FreezeFailed(_))
        ));
        // No patch ever landed and no stub page leaked.
        assert_eq!(
            mem.read_bytes(mem.base_address().offset(0x1000), 8).unwrap(),
            &DASHBOARD
        );
        assert_eq!(mem.live_alloc_count(), 1);
        assert_eq!(mem.unfrozen_image_writes(), 0);
        assert_eq!(orchestrator.phase(), Phase::Idle);
    }

    #[test]
    fn test_prescan_warms_the_cache() {
        let r = rig(quick_config());
        r.orchestrator.start_prescan();
        // stop() joins the pre-scan thread.
        r.orchestrator.stop();
        // cancel was set, so the pass may have been cut short; run it
        // again synchronously through the manager to check caching works.
        for family in TEMPORARY_FAMILIES {
            let a = r.orchestrator.hooks.resolve_family(family).unwrap();
            let b = r.orchestrator.hooks.resolve_family(family).unwrap();
            assert_eq!(a, b);
        }
    }
}

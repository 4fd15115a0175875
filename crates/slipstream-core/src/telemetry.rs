//! Live telemetry reads and the session state machine.
//!
//! Once the capture cycle has recovered the struct bases, telemetry is
//! plain offset reads: no hooks fire on the hot path, only the two
//! permanent stubs keep updating their cells. The reader watches the
//! race-state indicator for the menu/countdown/racing transitions and
//! drives pre-scan, capture, and base invalidation off them.

use std::sync::Arc;
use std::thread;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::capture::{CaptureOrchestrator, CaptureOutcome, CapturedBases, Phase};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::hook::stub::cell;
use crate::hook::{
    builtin_hook_table, load_hook_table, HookFamily, HookManager, HookTable, InstalledHook,
    StructOffsetProbe,
};
use crate::layout::{direct, race_state, timing};
use crate::process::{FreezeControl, ProcessMemory, RemotePtr};

/// Attach strategy, so sessions can be opened against a live process on
/// Windows and against the mock everywhere in tests.
pub trait ProcessProvider {
    type Memory: ProcessMemory + 'static;

    fn attach(&self, process_name: &str) -> Result<Self::Memory>;

    fn freezer(&self, mem: &Self::Memory) -> Arc<dyn FreezeControl>;
}

/// Attaches to a real process by executable name.
#[cfg(target_os = "windows")]
#[derive(Debug, Default)]
pub struct WindowsProvider;

#[cfg(target_os = "windows")]
impl ProcessProvider for WindowsProvider {
    type Memory = crate::process::ProcessHandle;

    fn attach(&self, process_name: &str) -> Result<Self::Memory> {
        crate::process::ProcessHandle::attach(process_name)
    }

    fn freezer(&self, mem: &Self::Memory) -> Arc<dyn FreezeControl> {
        Arc::new(crate::process::ThreadFreezer::new(mem.pid()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Velocity {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Velocity {
    pub fn speed(&self) -> f32 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

/// One telemetry poll. Fields backed by a base that has not been
/// captured yet (or died) are `None`; RPM falls back to the idle value
/// so consumers always see something believable.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    /// True while a session is attached to the target; every snapshot a
    /// reader emits comes from an open session.
    pub connected: bool,
    pub race_state: u32,
    pub timer_us: Option<u32>,
    pub progress: Option<f32>,
    pub rpm: i32,
    pub gear: Option<u32>,
    pub velocity: Option<Velocity>,
    pub steering: Option<f32>,
}

impl TelemetrySnapshot {
    fn empty(state: u32) -> Self {
        TelemetrySnapshot {
            connected: false,
            race_state: state,
            timer_us: None,
            progress: None,
            rpm: direct::IDLE_RPM,
            gear: None,
            velocity: None,
            steering: None,
        }
    }

    pub fn in_race(&self) -> bool {
        mid_race(self.race_state)
    }
}

/// Result of a poll: a fresh snapshot, or nothing moved since the last
/// one.
#[derive(Debug)]
pub enum Reading {
    Snapshot(TelemetrySnapshot),
    Unchanged,
}

fn mid_race(state: u32) -> bool {
    state > race_state::COUNTDOWN && state < race_state::MENU_SENTINEL
}

/// Anything prepared before a failed session open must not stay in the
/// target.
fn sweep_on_open_failure<M: ProcessMemory>(hooks: &HookManager<M>, e: Error) -> Error {
    if let Err(sweep) = hooks.restore_all() {
        warn!("cleanup after failed session open incomplete: {sweep}");
    }
    e
}

struct Session<M: ProcessMemory + 'static> {
    mem: Arc<M>,
    hooks: HookManager<M>,
    freezer: Arc<dyn FreezeControl>,
    orchestrator: CaptureOrchestrator<M>,
    race_cell: RemotePtr,
    steering_cell: Option<RemotePtr>,
    local_struct_offset: u32,
    bases: CapturedBases,
    prev_state: Option<u32>,
    capture_attempted: bool,
    /// (timer, race state) of the last emitted snapshot.
    last: Option<(u32, u32)>,
}

impl<M: ProcessMemory + 'static> Session<M> {
    fn open(
        mem: Arc<M>,
        freezer: Arc<dyn FreezeControl>,
        table: HookTable,
        config: &EngineConfig,
    ) -> Result<Self> {
        let hooks = HookManager::new(Arc::clone(&mem), table);

        let race_hook = hooks
            .prepare(HookFamily::RaceState)
            .map_err(|e| sweep_on_open_failure(&hooks, e))?;
        let steering_hook = match hooks.prepare(HookFamily::Steering) {
            Ok(hook) => Some(hook),
            Err(e) if e.is_fatal() => return Err(sweep_on_open_failure(&hooks, e)),
            Err(e) => {
                warn!("steering hook unavailable: {e}");
                None
            }
        };

        Self::arm_permanent(config, &freezer, &hooks, &race_hook, steering_hook.as_ref())
            .map_err(|e| sweep_on_open_failure(&hooks, e))?;

        let race_cell = race_hook.cell(cell::RACE_STATE_VALUE);
        let steering_cell = steering_hook
            .as_ref()
            .map(|hook| hook.cell(cell::STEERING_INPUT));

        let local_struct_offset =
            StructOffsetProbe::default().resolve(&*mem, hooks.scanner());
        debug!(offset = local_struct_offset, "local struct offset");

        let orchestrator = CaptureOrchestrator::new(
            hooks.clone(),
            Arc::clone(&freezer),
            config.clone(),
            race_cell,
        );

        Ok(Session {
            mem,
            hooks,
            freezer,
            orchestrator,
            race_cell,
            steering_cell,
            local_struct_offset,
            bases: CapturedBases::default(),
            prev_state: None,
            capture_attempted: false,
            last: None,
        })
    }

    fn arm_permanent(
        config: &EngineConfig,
        freezer: &Arc<dyn FreezeControl>,
        hooks: &HookManager<M>,
        race_hook: &InstalledHook,
        steering_hook: Option<&InstalledHook>,
    ) -> Result<()> {
        let guard = if config.freeze_for_capture {
            Some(freezer.freeze_all()?)
        } else {
            None
        };
        let armed = hooks.arm(race_hook).and_then(|()| match steering_hook {
            Some(hook) => hooks.arm(hook),
            None => Ok(()),
        });
        drop(guard);
        armed
    }

    fn poll(&mut self) -> Result<Reading> {
        let state = self.mem.read_u32(self.race_cell)?;
        self.handle_transition(state)?;
        self.bases.merge(self.orchestrator.take_late_bases());

        let snapshot = self.snapshot(state);
        let key = (snapshot.timer_us.unwrap_or(0), snapshot.race_state);
        if self.last == Some(key) {
            return Ok(Reading::Unchanged);
        }

        // The physics thread may be mid-update; give the changed values
        // one frame to settle and emit the re-read.
        thread::sleep(timing::STABILIZE_DELAY);
        let state = self.mem.read_u32(self.race_cell)?;
        let snapshot = self.snapshot(state);
        self.last = Some((snapshot.timer_us.unwrap_or(0), snapshot.race_state));
        Ok(Reading::Snapshot(snapshot))
    }

    fn handle_transition(&mut self, state: u32) -> Result<()> {
        let prev = self.prev_state.replace(state);

        if state == race_state::MENU_SENTINEL {
            if prev.is_some_and(|p| p != race_state::MENU_SENTINEL) {
                info!("back in menus, invalidating captured bases");
                self.bases = CapturedBases::default();
                self.capture_attempted = false;
                self.last = None;
            }
            return Ok(());
        }

        if state == race_state::COUNTDOWN {
            if prev == Some(race_state::MENU_SENTINEL) {
                self.orchestrator.start_prescan();
            }
            return Ok(());
        }

        // Racing. Capture on the countdown-to-racing edge, and also when
        // we attached mid-race and have nothing yet.
        let race_started = prev == Some(race_state::COUNTDOWN) || prev.is_none();
        if mid_race(state) && race_started && !self.capture_attempted {
            self.capture_attempted = true;
            match self.orchestrator.run_capture() {
                Ok(CaptureOutcome::Complete(bases)) => self.bases.merge(bases),
                Ok(CaptureOutcome::Partial(bases)) => self.bases.merge(bases),
                Ok(CaptureOutcome::Aborted(reason)) => {
                    info!("capture aborted: {reason}");
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("capture failed, continuing without bases: {e}"),
            }
        }
        Ok(())
    }

    /// Direct reads against the captured bases. A failed read means the
    /// pointed-at struct died, so the base is dropped rather than
    /// reported as stale data.
    fn snapshot(&mut self, state: u32) -> TelemetrySnapshot {
        let mut snap = TelemetrySnapshot::empty(state);
        snap.connected = true;

        if let Some(base) = self.bases.timer {
            match self.mem.read_u32(base.offset(direct::TIMER_US)) {
                Ok(value) => snap.timer_us = Some(value),
                Err(_) => self.bases.timer = None,
            }
        }

        if let Some(base) = self.bases.dashboard {
            let rpm = self.mem.read_f32(base.offset(direct::RPM));
            let gear = self.mem.read_u32(base.offset(direct::GEAR));
            match (rpm, gear) {
                (Ok(rpm), Ok(gear)) => {
                    snap.rpm = rpm as i32;
                    snap.gear = Some(gear);
                }
                _ => self.bases.dashboard = None,
            }
        }

        if let Some(base) = self.bases.progress {
            match self.mem.read_f32(base.offset(direct::PROGRESS)) {
                Ok(value) => snap.progress = Some(value),
                Err(_) => self.bases.progress = None,
            }
        }

        if let Some(base) = self.bases.local_player {
            snap.velocity = self.read_velocity(base);
            if snap.velocity.is_none() {
                self.bases.local_player = None;
            }
        }

        if let Some(cell) = self.steering_cell {
            snap.steering = self
                .mem
                .read_f32(cell)
                .ok()
                .filter(|v| v.abs() <= direct::STEERING_SANITY)
                .map(|v| v.clamp(-1.0, 1.0));
        }

        snap
    }

    fn read_velocity(&self, player: RemotePtr) -> Option<Velocity> {
        let physics = self
            .mem
            .read_ptr(player.offset(self.local_struct_offset as u64))
            .ok()?;
        if !physics.is_plausible() {
            return None;
        }
        let bytes = self
            .mem
            .read_bytes(physics.offset(direct::VELOCITY_X), 12)
            .ok()?;
        let component = |i: usize| {
            bytes[i * 4..i * 4 + 4]
                .try_into()
                .map(f32::from_le_bytes)
                .ok()
        };
        Some(Velocity {
            x: component(0)?,
            y: component(1)?,
            z: component(2)?,
        })
    }

    fn shutdown(&mut self) {
        self.orchestrator.stop();
        if let Err(e) = self.hooks.emergency_cleanup(Some(&*self.freezer)) {
            warn!("cleanup on session close incomplete: {e}");
        }
    }
}

/// Top-level reader: attaches, keeps the session alive, re-attaches
/// after the target dies.
pub struct TelemetryReader<P: ProcessProvider> {
    provider: P,
    config: EngineConfig,
    table: HookTable,
    session: Option<Session<P::Memory>>,
}

impl<P: ProcessProvider> TelemetryReader<P> {
    pub fn new(provider: P, config: EngineConfig) -> Result<Self> {
        let table = match &config.hook_table_path {
            Some(path) => load_hook_table(path)?,
            None => builtin_hook_table(),
        };
        Ok(Self::with_table(provider, config, table))
    }

    pub fn with_table(provider: P, config: EngineConfig, table: HookTable) -> Self {
        TelemetryReader {
            provider,
            config,
            table,
            session: None,
        }
    }

    pub fn connected(&self) -> bool {
        self.session.is_some()
    }

    pub fn phase(&self) -> Phase {
        self.session
            .as_ref()
            .map(|s| s.orchestrator.phase())
            .unwrap_or(Phase::Idle)
    }

    /// One poll of the target. Errors from a dead target close the
    /// session; the next call re-attaches.
    pub fn poll(&mut self) -> Result<Reading> {
        if self.session.is_none() {
            let mem = Arc::new(self.provider.attach(&self.config.process_name)?);
            let freezer = self.provider.freezer(&mem);
            let session = Session::open(mem, freezer, self.table.clone(), &self.config)?;
            info!(process = %self.config.process_name, "session opened");
            self.session = Some(session);
        }
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| Error::ProcessNotFound(self.config.process_name.clone()))?;

        match session.poll() {
            Err(e @ Error::MemoryReadFailed { .. }) => {
                warn!("target unreadable, closing session: {e}");
                self.shutdown();
                Err(e)
            }
            Err(e) if e.is_fatal() => {
                self.shutdown();
                Err(e)
            }
            other => other,
        }
    }

    /// Remove every patch and free every stub page, then drop the
    /// session. Idempotent.
    pub fn shutdown(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.shutdown();
        }
    }
}

impl<P: ProcessProvider> Drop for TelemetryReader<P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

//! Memory layout constants for the target's race structures.
//!
//! This module centralizes the struct offsets and sentinel values used for
//! direct reads once the base pointers have been captured. Constants are
//! organized by structure type.

/// Race-state indicator sentinels, sourced from the permanent hook's
/// scratch cell every poll.
pub mod race_state {
    /// The indicator reads exactly this while the player sits in menus.
    pub const MENU_SENTINEL: u32 = 1_000_000;

    /// The indicator drops to zero for the duration of the pre-race
    /// countdown. Any value strictly between the two sentinels means a
    /// race is running.
    pub const COUNTDOWN: u32 = 0;
}

/// Direct-read offsets into the captured race structs.
///
/// Each hook family captures a different struct base; these offsets are
/// only meaningful relative to the base captured by the matching family.
pub mod direct {
    /// Race timer in microseconds (u32), relative to the timer struct.
    pub const TIMER_US: u64 = 0x10;

    /// Race progress 0.0–1.0 (f32), relative to the progress struct.
    pub const PROGRESS: u64 = 0x1D8;

    /// Engine RPM (f32, truncated to int on read), relative to the
    /// dashboard struct.
    pub const RPM: u64 = 0x1B8;

    /// Current gear (u32), relative to the dashboard struct.
    pub const GEAR: u64 = 0xA0;

    /// Velocity vector components (f32 each), relative to the player base
    /// derived from the local-player pointer.
    pub const VELOCITY_X: u64 = 0x160;
    pub const VELOCITY_Y: u64 = 0x164;
    pub const VELOCITY_Z: u64 = 0x168;

    /// Fallback displacement from the local-player pointer to the player
    /// struct, used when the displacement probe fails.
    pub const DEFAULT_LOCAL_STRUCT_OFFSET: u32 = 0x90;

    /// RPM the engine idles at; reported while no dashboard base is
    /// available so consumers see a believable resting value.
    pub const IDLE_RPM: i32 = 1250;

    /// Normalized steering input (f32), relative to the register base at
    /// the hooked steering store; one float past the wheel-angle field
    /// that store writes.
    pub const STEERING_INPUT: u64 = 0x1544;

    /// Steering values outside this magnitude are uninitialised scratch
    /// memory, not input.
    pub const STEERING_SANITY: f32 = 2.0;
}

/// Timing constants for the capture cycle and polling loops.
pub mod timing {
    use std::time::Duration;

    /// Interval between data-cell polls while hooks are armed.
    pub const ARMED_POLL_INTERVAL: Duration = Duration::from_millis(1);

    /// Minimum time hooks stay armed before a fast exit is allowed; gives
    /// every per-frame hook at least a few frames to fire.
    pub const FAST_EXIT_MIN_ARMED: Duration = Duration::from_millis(100);

    /// After this long armed, proceed with whatever families have fired.
    pub const PARTIAL_CAPTURE_AFTER: Duration = Duration::from_secs(5);

    /// Hard cap on how long any capture patch may stay installed; bounds
    /// both the armed poll loop and the deferred drain when configured
    /// below their own limits.
    pub const CAPTURE_SAFETY_TIMEOUT: Duration = Duration::from_secs(300);

    /// Default bound on how long a deferred-capture patch may stay live
    /// after the main cycle returns. Configurable via `EngineConfig`.
    pub const DEFERRED_EXPOSURE_WINDOW: Duration = Duration::from_secs(10);

    /// Poll interval of the deferred-capture thread.
    pub const DEFERRED_POLL_INTERVAL: Duration = Duration::from_millis(10);

    /// Delay before the stabilizing second read of a changed snapshot.
    pub const STABILIZE_DELAY: Duration = Duration::from_millis(1);

    /// Byte window either side of a static-offset hint for near scans.
    pub const NEAR_SCAN_WINDOW: usize = 0x20_0000;
}

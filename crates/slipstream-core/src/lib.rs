//! # slipstream-core
//!
//! Live process-memory instrumentation for race telemetry.
//!
//! This crate provides:
//! - Windows process attachment and memory access behind a mockable trait
//! - Signature scanning over the target module
//! - Runtime stub construction and temporary jump hooks
//! - The freeze/arm/poll/disarm capture cycle that recovers struct bases
//! - Direct-offset telemetry reads once the bases are known
//!
//! The capture machinery modifies a running process. Every patch and
//! every stub page is recorded before it lands, and
//! [`TelemetryReader::shutdown`] (or drop) restores all of it.

pub mod capture;
pub mod codec;
pub mod config;
pub mod error;
pub mod hook;
pub mod layout;
pub mod process;
pub mod scan;
pub mod telemetry;

pub use capture::{CaptureOrchestrator, CaptureOutcome, CapturedBases, Phase};
pub use config::{EngineConfig, EngineConfigBuilder};
pub use error::{Error, Result};
pub use hook::{
    builtin_hook_table, load_hook_table, save_hook_table, HookFamily, HookManager, HookSpec,
    HookTable, InstalledHook, StructOffsetProbe,
};
pub use process::{FreezeControl, FreezeGuard, PageProtection, ProcessMemory, RemotePtr};
pub use scan::{ModuleScanner, Resolution};
pub use telemetry::{ProcessProvider, Reading, TelemetryReader, TelemetrySnapshot, Velocity};

#[cfg(target_os = "windows")]
pub use process::{ProcessHandle, ThreadFreezer};
#[cfg(target_os = "windows")]
pub use telemetry::WindowsProvider;

//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::layout::timing;

/// Configuration for a telemetry session.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Executable name of the target process.
    pub process_name: String,
    /// Interval between telemetry polls once bases are captured.
    pub poll_interval: Duration,
    /// Freeze target threads around patch writes and removals.
    pub freeze_for_capture: bool,
    /// How long a deferred-capture patch may stay installed after the
    /// main cycle returns.
    pub deferred_exposure_window: Duration,
    /// How long the armed poll loop waits for every family before
    /// settling for a partial capture.
    pub partial_capture_after: Duration,
    /// Hard cap on the armed poll loop.
    pub capture_safety_timeout: Duration,
    /// Optional hook table override; the builtin table is used when
    /// absent.
    pub hook_table_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            process_name: "Asphalt9_Steam_x64_rtl.exe".to_string(),
            poll_interval: Duration::from_millis(10),
            freeze_for_capture: true,
            deferred_exposure_window: timing::DEFERRED_EXPOSURE_WINDOW,
            partial_capture_after: timing::PARTIAL_CAPTURE_AFTER,
            capture_safety_timeout: timing::CAPTURE_SAFETY_TIMEOUT,
            hook_table_path: None,
        }
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct EngineConfigBuilder {
    process_name: Option<String>,
    poll_interval: Option<Duration>,
    freeze_for_capture: Option<bool>,
    deferred_exposure_window: Option<Duration>,
    partial_capture_after: Option<Duration>,
    capture_safety_timeout: Option<Duration>,
    hook_table_path: Option<PathBuf>,
}

impl EngineConfigBuilder {
    pub fn process_name(mut self, name: impl Into<String>) -> Self {
        self.process_name = Some(name.into());
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn freeze_for_capture(mut self, freeze: bool) -> Self {
        self.freeze_for_capture = Some(freeze);
        self
    }

    pub fn deferred_exposure_window(mut self, window: Duration) -> Self {
        self.deferred_exposure_window = Some(window);
        self
    }

    pub fn partial_capture_after(mut self, after: Duration) -> Self {
        self.partial_capture_after = Some(after);
        self
    }

    pub fn capture_safety_timeout(mut self, timeout: Duration) -> Self {
        self.capture_safety_timeout = Some(timeout);
        self
    }

    pub fn hook_table_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.hook_table_path = Some(path.into());
        self
    }

    pub fn build(self) -> EngineConfig {
        let defaults = EngineConfig::default();
        EngineConfig {
            process_name: self.process_name.unwrap_or(defaults.process_name),
            poll_interval: self.poll_interval.unwrap_or(defaults.poll_interval),
            freeze_for_capture: self
                .freeze_for_capture
                .unwrap_or(defaults.freeze_for_capture),
            deferred_exposure_window: self
                .deferred_exposure_window
                .unwrap_or(defaults.deferred_exposure_window),
            partial_capture_after: self
                .partial_capture_after
                .unwrap_or(defaults.partial_capture_after),
            capture_safety_timeout: self
                .capture_safety_timeout
                .unwrap_or(defaults.capture_safety_timeout),
            hook_table_path: self.hook_table_path,
        }
    }
}

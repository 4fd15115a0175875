use thiserror::Error;

use crate::process::RemotePtr;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Process not found: {0}")]
    ProcessNotFound(String),

    #[error("Failed to open process: {0}")]
    ProcessOpenFailed(String),

    #[error("Failed to read process memory at {address}: {message}")]
    MemoryReadFailed { address: RemotePtr, message: String },

    #[error("Failed to write process memory at {address}: {message}")]
    MemoryWriteFailed { address: RemotePtr, message: String },

    #[error("Failed to change page protection at {address}: {message}")]
    ProtectFailed { address: RemotePtr, message: String },

    #[error("No executable page available within ±2 GB of {near}")]
    AllocOutOfRange { near: RemotePtr },

    #[error("Signature not found for hook site '{0}'")]
    SignatureNotFound(String),

    #[error(
        "32-bit displacement overflows: {from} -> {to}; caller must fall back to an absolute jump"
    )]
    DisplacementOverflow { from: RemotePtr, to: RemotePtr },

    #[error("Patch at {address} does not read back as written; hook probably not applied")]
    PatchVerifyFailed { address: RemotePtr },

    #[error(
        "Hook site {address} already contains a foreign jump; a previous session left a stale \
         patch in the target. Restart the target process (or remove the other instrumentation) \
         before running again"
    )]
    StaleInstrumentation { address: RemotePtr },

    #[error("Thread freeze failed: {0}")]
    FreezeFailed(String),

    #[error("Capture cycle aborted: {0}")]
    CaptureAborted(String),

    #[error("Failed to restore {failed} patched address(es); see log for the exact addresses")]
    RestoreIncomplete { failed: usize },

    #[error("Invalid hook table: {0}")]
    InvalidHookTable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Check whether this error should be treated as fatal for the whole
    /// session rather than a single hook family.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::StaleInstrumentation { .. } | Error::FreezeFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let stale = Error::StaleInstrumentation {
            address: RemotePtr::new(0x1400_0000),
        };
        assert!(stale.is_fatal());

        let scan = Error::SignatureNotFound("dashboard".to_string());
        assert!(!scan.is_fatal());
    }
}

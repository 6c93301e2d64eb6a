//! Error types for bdevperf
//!
//! Two layers are used. Setup paths (configuration files, CLI conversion,
//! reactor startup) return `crate::Result` (anyhow) with context attached.
//! Run-time conditions that must be reported to the operator or to a
//! control request are expressed as [`PerfError`], and the outcome of a whole
//! run is a [`FailureCode`].
//!
//! Allocation failures (task pool exhaustion, buffer allocation) are not
//! represented here: they abort the process.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Negative errno-style code describing why a run failed
///
/// The first failure recorded during a run becomes the run's result and is
/// never overwritten. I/O failures and data mismatches use [`FailureCode::GENERIC`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FailureCode(pub i32);

impl FailureCode {
    /// Generic failure used for failed I/O, verify mismatches and reset failures
    pub const GENERIC: FailureCode = FailureCode(-1);

    /// Build a code from a positive errno value
    pub fn from_errno(errno: i32) -> Self {
        FailureCode(-errno.abs())
    }

    pub fn invalid() -> Self {
        Self::from_errno(libc::EINVAL)
    }

    pub fn no_memory() -> Self {
        Self::from_errno(libc::ENOMEM)
    }

    pub fn not_supported() -> Self {
        Self::from_errno(libc::ENOTSUP)
    }

    pub fn no_device() -> Self {
        Self::from_errno(libc::ENODEV)
    }

    pub fn in_progress() -> Self {
        Self::from_errno(libc::EINPROGRESS)
    }

    /// Process exit status for this code (never 0)
    pub fn exit_status(self) -> u8 {
        self.0.unsigned_abs().clamp(1, 255) as u8
    }
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == FailureCode::GENERIC {
            write!(f, "Operation not permitted")
        } else {
            write!(f, "{}", std::io::Error::from_raw_os_error(self.0.abs()))
        }
    }
}

/// Errors surfaced by the load generator
#[derive(Error, Debug)]
pub enum PerfError {
    /// Invalid flag combination, detected before any I/O
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Device open, channel or geometry problem while building a job
    #[error("failed to construct job on {device}: {reason} ({code})")]
    Construction {
        device: String,
        code: FailureCode,
        reason: String,
    },

    #[error("unable to find bdev {0}")]
    DeviceNotFound(String),

    /// A submitted request completed unsuccessfully
    #[error("I/O failed on job {job} at offset {offset_blocks}")]
    IoFailure { job: String, offset_blocks: u64 },

    /// Read-back data did not match what was written
    #[error(
        "buffer mismatch on job {job} at disk offset {offset_blocks}: \
         expected {expected:#010x}, got {actual:#010x}"
    )]
    VerifyMismatch {
        job: String,
        offset_blocks: u64,
        expected: u32,
        actual: u32,
    },

    /// A control request arrived while another run is pending
    #[error("another test is already in progress")]
    InProgress,

    #[error("bdevperf failed with error {0}")]
    RunFailed(FailureCode),
}

impl PerfError {
    /// Failure code reported for this error
    pub fn code(&self) -> FailureCode {
        match self {
            PerfError::Config(_) => FailureCode::invalid(),
            PerfError::Construction { code, .. } => *code,
            PerfError::DeviceNotFound(_) => FailureCode::no_device(),
            PerfError::IoFailure { .. } | PerfError::VerifyMismatch { .. } => FailureCode::GENERIC,
            PerfError::InProgress => FailureCode::in_progress(),
            PerfError::RunFailed(code) => *code,
        }
    }
}

/// Result alias for run-time operations
pub type PerfResult<T> = std::result::Result<T, PerfError>;

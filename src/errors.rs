// SPDX-License-Identifier: GPL-3.0-only

//! Error types for the camera HAL
//!
//! Every fallible operation in the crate returns [`HalResult`]. Callers that
//! need the raw errno of a failed ioctl can match on [`HalError::Driver`].

use std::fmt;
use std::io;

/// Result type alias using HalError
pub type HalResult<T> = Result<T, HalError>;

/// Main HAL error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HalError {
    /// Operation issued while the device or controller is in the wrong state
    InvalidState {
        operation: &'static str,
        state: String,
    },
    /// Underlying ioctl or system call failed
    Driver { call: &'static str, errno: i32 },
    /// Heap or graphics allocation failed
    OutOfMemory(String),
    /// Frames went missing during a bracketing burst and recovery gave up
    FrameLoss { lost: u32, retries: u32 },
    /// Acquire fence did not signal in time
    FenceTimeout { timeout_ms: u32 },
    /// Internal bookkeeping reached a state that should not happen
    InvariantViolation(String),
    /// Caller supplied an out-of-range or malformed value
    InvalidArgument(String),
    /// Operation not permitted on this object (e.g. lock before init)
    InvalidOperation(String),
    /// Handle-backed buffer locked twice
    AlreadyLocked,
    /// Unlock on a buffer that is not locked
    NotLocked,
    /// Registration of something that is already registered
    AlreadyExists(String),
    /// Lookup failed (entity, listener, buffer)
    NotFound(String),
    /// Resource is held by another user
    Busy(String),
    /// Request was discarded by a flush before it was serviced
    Flushed,
    /// Burst or pipeline failed for an unspecified reason
    Unknown(String),
    /// Configuration errors
    Config(String),
}

impl HalError {
    /// Build a driver error from the last OS error
    pub fn last_os_error(call: &'static str) -> Self {
        Self::from_io(call, &io::Error::last_os_error())
    }

    /// Build a driver error from an io::Error
    pub fn from_io(call: &'static str, err: &io::Error) -> Self {
        HalError::Driver {
            call,
            errno: err.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// errno of a driver error, if this is one
    pub fn errno(&self) -> Option<i32> {
        match self {
            HalError::Driver { errno, .. } => Some(*errno),
            _ => None,
        }
    }

    /// Errors a caller may log and continue past
    pub fn is_warning(&self) -> bool {
        matches!(self, HalError::FenceTimeout { .. } | HalError::NotLocked)
    }
}

impl fmt::Display for HalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HalError::InvalidState { operation, state } => {
                write!(f, "{} not allowed in state {}", operation, state)
            }
            HalError::Driver { call, errno } => write!(
                f,
                "{} failed: {}",
                call,
                io::Error::from_raw_os_error(*errno)
            ),
            HalError::OutOfMemory(what) => write!(f, "Out of memory: {}", what),
            HalError::FrameLoss { lost, retries } => write!(
                f,
                "Lost {} frame(s), gave up after {} retries",
                lost, retries
            ),
            HalError::FenceTimeout { timeout_ms } => {
                write!(f, "Acquire fence timed out after {}ms", timeout_ms)
            }
            HalError::InvariantViolation(msg) => write!(f, "Invariant violation: {}", msg),
            HalError::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            HalError::InvalidOperation(msg) => write!(f, "Invalid operation: {}", msg),
            HalError::AlreadyLocked => write!(f, "Buffer already locked"),
            HalError::NotLocked => write!(f, "Buffer is not locked"),
            HalError::AlreadyExists(what) => write!(f, "Already exists: {}", what),
            HalError::NotFound(what) => write!(f, "Not found: {}", what),
            HalError::Busy(what) => write!(f, "Busy: {}", what),
            HalError::Flushed => write!(f, "Request flushed"),
            HalError::Unknown(msg) => write!(f, "Unknown error: {}", msg),
            HalError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for HalError {}

impl From<io::Error> for HalError {
    fn from(err: io::Error) -> Self {
        HalError::from_io("io", &err)
    }
}

impl From<serde_json::Error> for HalError {
    fn from(err: serde_json::Error) -> Self {
        HalError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_error_keeps_errno() {
        let err = HalError::from_io("VIDIOC_STREAMON", &io::Error::from_raw_os_error(libc::EBUSY));
        assert_eq!(err.errno(), Some(libc::EBUSY));
        assert!(err.to_string().starts_with("VIDIOC_STREAMON failed"));
    }

    #[test]
    fn warnings_are_not_fatal() {
        assert!(HalError::FenceTimeout { timeout_ms: 2000 }.is_warning());
        assert!(HalError::NotLocked.is_warning());
        assert!(!HalError::AlreadyLocked.is_warning());
    }
}

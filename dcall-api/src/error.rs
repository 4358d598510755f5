//! Error handling for the acceleration bridge
//!
//! Two tiers: validated user errors are ordinary `Error` values that map to
//! negative errno codes at the raw syscall boundary; invariant violations
//! (teardown/insert failure after validation) are not represented here, the
//! offending execution context halts instead.

use alloc::string::String;
use core::fmt;

/// `EINVAL` - invalid argument.
pub const EINVAL: isize = 22;
/// `ENOENT` - no such entry.
pub const ENOENT: isize = 2;
/// `EFAULT` - bad address / remap unavailable.
pub const EFAULT: isize = 14;
/// `EBUSY` - resource busy.
pub const EBUSY: isize = 16;
/// `ENOSYS` - no such syscall.
pub const ENOSYS: isize = 38;

/// Common error type used throughout the bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Invalid argument (misaligned registration address, malformed range)
    InvalidArgument(String),
    /// Resource not found (no region at the registration address, unknown
    /// syscall number, unknown processor)
    NotFound(String),
    /// Remap unavailable (fast path disabled on the current processor)
    RemapFailed(String),
    /// Resource busy (migration attempted while the guard is held)
    Busy(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Error::NotFound(msg) => write!(f, "Not found: {}", msg),
            Error::RemapFailed(msg) => write!(f, "Remap failed: {}", msg),
            Error::Busy(msg) => write!(f, "Resource busy: {}", msg),
        }
    }
}

impl Error {
    /// Negative errno code for the raw syscall boundary.
    pub fn to_errno(&self) -> isize {
        match self {
            Error::InvalidArgument(_) => -EINVAL,
            Error::NotFound(_) => -ENOENT,
            Error::RemapFailed(_) => -EFAULT,
            Error::Busy(_) => -EBUSY,
        }
    }
}

/// Result type for operations that can fail
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn errno_mapping() {
        assert_eq!(Error::InvalidArgument("x".to_string()).to_errno(), -22);
        assert_eq!(Error::NotFound("x".to_string()).to_errno(), -2);
        assert_eq!(Error::RemapFailed("x".to_string()).to_errno(), -14);
        assert_eq!(Error::Busy("x".to_string()).to_errno(), -16);
    }
}

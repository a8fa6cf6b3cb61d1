//! # Event Engine Errors

use core::fmt;

use fabric_hal::HalError;

/// Result type for event-engine operations
pub type EventResult<T> = Result<T, EventError>;

/// Event-engine error
///
/// Discriminants are the negated errno values the ioctl layer reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum EventError {
    /// Bad handle, out-of-range interface, misaligned or mis-sized ring,
    /// or a channel mode mismatch
    InvalidArgument = 22,
    /// Operation is not valid for the object's current state
    InvalidState = 95,
    /// No free handle of the requested kind
    ResourceExhausted = 28,
    /// Context is not bound to the caller, is closed, or exceeded its
    /// locked-memory limit
    PermissionDenied = 1,
    /// Object has unacknowledged events, a non-empty member list, or is
    /// already waited on through another channel
    Busy = 16,
    /// Object is already associated with this channel
    AlreadyAssociated = 114,
    /// The adapter rejected or failed a descriptor command
    HardwareCommandFailed = 5,
}

impl EventError {
    /// errno value for this error
    pub const fn errno(self) -> i32 {
        self as i32
    }

    /// Short static description
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidArgument => "invalid argument",
            Self::InvalidState => "invalid state",
            Self::ResourceExhausted => "no free handles",
            Self::PermissionDenied => "permission denied",
            Self::Busy => "busy",
            Self::AlreadyAssociated => "already associated",
            Self::HardwareCommandFailed => "hardware command failed",
        }
    }
}

impl fmt::Display for EventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for EventError {}

impl From<HalError> for EventError {
    fn from(err: HalError) -> Self {
        match err {
            HalError::CommandRejected | HalError::CommandTimeout => Self::HardwareCommandFailed,
            HalError::PinLimitExceeded => Self::PermissionDenied,
            HalError::PinFailed => Self::ResourceExhausted,
            HalError::InvalidRange => Self::InvalidArgument,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_values() {
        assert_eq!(EventError::InvalidArgument.errno(), 22);
        assert_eq!(EventError::Busy.errno(), 16);
        assert_eq!(EventError::AlreadyAssociated.errno(), 114);
        assert_eq!(EventError::PermissionDenied.errno(), 1);
    }

    #[test]
    fn test_from_hal_error() {
        assert_eq!(EventError::from(HalError::CommandTimeout), EventError::HardwareCommandFailed);
        assert_eq!(EventError::from(HalError::PinLimitExceeded), EventError::PermissionDenied);
        assert_eq!(EventError::from(HalError::InvalidRange), EventError::InvalidArgument);
    }

    #[test]
    fn test_display() {
        assert_eq!(EventError::ResourceExhausted.to_string(), "no free handles");
    }
}

//! Hardware-level errors

use core::fmt;

/// Errors reported by the adapter or the page-pinning service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalError {
    /// The adapter refused a descriptor-update command
    CommandRejected,
    /// A descriptor-update command did not complete
    CommandTimeout,
    /// Pinning would exceed the caller's locked-memory limit
    PinLimitExceeded,
    /// The pages could not be pinned
    PinFailed,
    /// Address range is malformed or not mapped
    InvalidRange,
}

impl HalError {
    /// Short static description
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::CommandRejected => "command rejected",
            Self::CommandTimeout => "command timed out",
            Self::PinLimitExceeded => "locked memory limit exceeded",
            Self::PinFailed => "page pinning failed",
            Self::InvalidRange => "invalid address range",
        }
    }

    /// Whether the failure came from the adapter command path
    pub const fn is_command_failure(&self) -> bool {
        matches!(self, Self::CommandRejected | Self::CommandTimeout)
    }
}

impl fmt::Display for HalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result type for hardware operations
pub type HalResult<T> = Result<T, HalError>;

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_command_failure_classification() {
        assert!(HalError::CommandRejected.is_command_failure());
        assert!(HalError::CommandTimeout.is_command_failure());
        assert!(!HalError::PinLimitExceeded.is_command_failure());
        assert!(!HalError::InvalidRange.is_command_failure());
    }

    #[test]
    fn test_display() {
        assert_eq!(HalError::PinFailed.to_string(), "page pinning failed");
    }
}

//! Errors reported by the device and the status codes clients see for them.

use thiserror::Error;

pub const EINVAL: i32 = 22;
pub const ETIMEDOUT: i32 = 110;
pub const ENOMEM: i32 = 12;
pub const EDEADLK: i32 = 35;
pub const ENODEV: i32 = 19;
pub const EIO: i32 = 5;

pub type CpResult<T> = Result<T, CpError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CpError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("timed out")]
    Timeout,

    /// A wait observed no hardware progress. Never returned to clients; the
    /// waiter escalates it to recovery.
    #[error("GPU hang confirmed")]
    HangConfirmed,

    #[error("hang recovery failed; device is hung")]
    RecoveryFailed,

    #[error("failed to allocate {bytes} bytes for the recovery snapshot")]
    AllocationFailure { bytes: usize },

    #[error("context {context_id} caused a GPU hang and no longer accepts submissions")]
    ContextHung { context_id: u32 },

    #[error("device is hung")]
    DeviceHung,

    #[error("unknown chip id {chip_id:#010x}")]
    UnknownChip { chip_id: u32 },

    #[error("device is not started")]
    NotStarted,

    #[error("MMU error: {0}")]
    Mmu(String),

    #[error("power control error: {0}")]
    Power(String),
}

impl CpError {
    /// Negative errno reported to clients for this error.
    pub fn errno(&self) -> i32 {
        -match self {
            CpError::InvalidArgument(_) => EINVAL,
            CpError::Timeout | CpError::HangConfirmed | CpError::RecoveryFailed => ETIMEDOUT,
            CpError::AllocationFailure { .. } => ENOMEM,
            CpError::ContextHung { .. } => EDEADLK,
            CpError::DeviceHung | CpError::UnknownChip { .. } | CpError::NotStarted => ENODEV,
            CpError::Mmu(_) | CpError::Power(_) => EIO,
        }
    }
}

/// Collapse an operation result into the status code handed to clients:
/// 0 on success, a negative errno otherwise.
pub fn status_code<T>(res: &CpResult<T>) -> i32 {
    match res {
        Ok(_) => 0,
        Err(err) => err.errno(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_status_codes_follow_errno_convention() {
        assert_eq!(status_code(&Ok::<(), CpError>(())), 0);
        assert_eq!(CpError::Timeout.errno(), -110);
        assert_eq!(CpError::InvalidArgument("ts".into()).errno(), -22);
        assert_eq!(CpError::RecoveryFailed.errno(), -110);
        assert_eq!(CpError::HangConfirmed.errno(), -110);
        assert_eq!(CpError::ContextHung { context_id: 3 }.errno(), -35);
        assert_eq!(CpError::AllocationFailure { bytes: 4 }.errno(), -12);
    }
}

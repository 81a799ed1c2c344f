//! Driver Error Types
//!
//! Errors returned to the host stack and the platform framework. Each variant
//! maps onto the kernel errno the callers expect.

use thiserror::Error;

pub const EINVAL: i32 = 22;
pub const EBUSY: i32 = 16;
pub const EOPNOTSUPP: i32 = 95;
pub const EACCES: i32 = 13;
pub const ENOMEM: i32 = 12;
pub const EIO: i32 = 5;

/// Failure reported by the chip-management layer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason} (errno {errno})")]
pub struct TransportError {
    pub errno: i32,
    pub reason: String,
}

impl TransportError {
    pub fn new(errno: i32, reason: impl Into<String>) -> Self {
        Self {
            errno,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("Device busy: {0}")]
    Busy(&'static str),

    #[error("Unsupported packet type (0x{0:02X})")]
    Unsupported(u8),

    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("No response to {0}")]
    AccessDenied(&'static str),

    #[error("Out of memory")]
    OutOfMemory,

    #[error("Host stack rejected device (errno {0})")]
    Registration(i32),
}

impl DriverError {
    /// Negative errno as handed back to the kernel callers
    pub fn errno(&self) -> i32 {
        let code = match self {
            Self::InvalidArgument(_) => EINVAL,
            Self::Busy(_) => EBUSY,
            Self::Unsupported(_) => EOPNOTSUPP,
            Self::Transport(e) => e.errno,
            Self::AccessDenied(_) => EACCES,
            Self::OutOfMemory => ENOMEM,
            Self::Registration(code) => *code,
        };
        -code.abs()
    }
}

pub type DriverResult<T> = Result<T, DriverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(DriverError::AccessDenied("VS BT Enable (true)").errno(), -EACCES);
        assert_eq!(DriverError::Unsupported(0x03).errno(), -EOPNOTSUPP);
        assert_eq!(DriverError::Transport(TransportError::new(EIO, "write")).errno(), -EIO);
        assert_eq!(DriverError::Registration(-17).errno(), -17);
    }

    #[test]
    fn test_transport_error_passes_through() {
        let err: DriverError = TransportError::new(EIO, "uart stalled").into();
        assert_eq!(err.to_string(), "Transport failure: uart stalled (errno 5)");
    }
}

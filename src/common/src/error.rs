//! System-wide error types for Kestrel.

use core::fmt;

/// Error codes returned across the syscall boundary.
///
/// Each discriminant is the negative value written into the return register,
/// so [`KernelError::to_errno`] is a plain cast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(i64)]
pub enum KernelError {
    /// An argument was malformed or out of range.
    InvalidArg = -1,
    /// The caller lacks the capability for the operation.
    NoPermissions = -2,
    /// Memory or another finite resource is exhausted.
    NoMem = -3,
    /// A user pointer was bad or a fault hit while serving the call.
    Fault = -4,
    /// The named object does not exist.
    NotExists = -5,
    /// The operation or syscall number is not supported.
    OperationNotSupported = -6,
    /// A directory operation was applied to a non-directory.
    NotDir = -7,
}

impl KernelError {
    /// Convert to the raw value placed in the return register.
    pub fn to_errno(self) -> i64 {
        self as i64
    }

    /// Convert a raw return value back into an error, if it is one.
    pub fn from_errno(value: i64) -> Option<Self> {
        match value {
            -1 => Some(KernelError::InvalidArg),
            -2 => Some(KernelError::NoPermissions),
            -3 => Some(KernelError::NoMem),
            -4 => Some(KernelError::Fault),
            -5 => Some(KernelError::NotExists),
            -6 => Some(KernelError::OperationNotSupported),
            -7 => Some(KernelError::NotDir),
            _ => None,
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::InvalidArg => write!(f, "invalid argument"),
            KernelError::NoPermissions => write!(f, "permission denied"),
            KernelError::NoMem => write!(f, "out of memory"),
            KernelError::Fault => write!(f, "bad address"),
            KernelError::NotExists => write!(f, "no such object"),
            KernelError::OperationNotSupported => write!(f, "operation not supported"),
            KernelError::NotDir => write!(f, "not a directory"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_values_are_stable() {
        assert_eq!(KernelError::InvalidArg.to_errno(), -1);
        assert_eq!(KernelError::NotDir.to_errno(), -7);
        for raw in -7..=-1 {
            let err = KernelError::from_errno(raw).unwrap();
            assert_eq!(err.to_errno(), raw);
        }
        assert_eq!(KernelError::from_errno(0), None);
        assert_eq!(KernelError::from_errno(-8), None);
    }
}

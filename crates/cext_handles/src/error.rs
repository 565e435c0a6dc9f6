//! Errors raised by the handle subsystem.
//!
//! All of these terminate the current native call path; none of them is
//! retried. The only tolerated failure, a mark on an already collected
//! handle, never reaches this type (see [`crate::context::ExecutionContext::mark`]).

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CextError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CextError {
    /// Wrapping a wrapper, wrapping a non-managed value, unwrapping something
    /// that is neither a wrapper nor a pointer, or a failing pointer read.
    #[error("{0}")]
    InvalidArgument(String),

    /// The handle did not resolve to a live wrapper.
    #[error("native handle not found (0x{0:x})")]
    HandleNotFound(u64),

    /// A safepoint poll observed an interrupt request.
    #[error("native call interrupted")]
    Interrupted,

    /// The native function itself reported a failure.
    #[error("native call failed: {0}")]
    NativeCall(String),

    #[error("wrong argument type {found} (expected {expected})")]
    WrongArgumentType {
        expected: &'static str,
        found: String,
    },
}

impl CextError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// True for errors signalling a stale or corrupt handle from native code.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::HandleNotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_message_carries_raw_handle() {
        let err = CextError::HandleNotFound(0x0bad_0000_0000_0008);
        assert_eq!(err.to_string(), "native handle not found (0xbad000000000008)");
        assert!(err.is_not_found());
    }

    #[test]
    fn invalid_argument_is_verbatim() {
        let err = CextError::invalid_argument("Wrapping wrapped object.");
        assert_eq!(err.to_string(), "Wrapping wrapped object.");
        assert!(!err.is_not_found());
    }
}

//! Error types.
//!
//! Two kinds of failure exist in this crate:
//!
//! 1. **Recoverable errors** are returned as [`Error`]. The most important variant is
//!    [`Error::Transport`], which carries the integer status of the failed transport call
//!    verbatim. The library never swallows a transport status.
//! 2. **Contract violations** (an internal invariant turned out to be false) are fatal.
//!    They go through [`contract_violation!`](crate::contract_violation), which logs the
//!    violated condition with its call site and panics. Continuing after such a failure
//!    would silently corrupt gradients.

use crate::transport::TransportError;
use thiserror::Error;

/// Error type for differentiable communication.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A transport call failed. `code` is the transport's own status value.
    #[error("Transport call `{call}` failed with status {code}")]
    Transport { call: &'static str, code: i32 },

    /// A message was larger than the buffer it was received into.
    #[error("Message truncated: {got} bytes received into a buffer of {capacity} bytes")]
    Truncated { got: usize, capacity: usize },

    /// Counts, displacements or buffer lengths do not fit together.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// Wraps a transport status together with the name of the failed call.
    pub fn transport(call: &'static str, err: TransportError) -> Self {
        Error::Transport {
            call,
            code: err.code,
        }
    }

    /// The integer status of a failed transport call, if this is one.
    pub fn status(&self) -> Option<i32> {
        match self {
            Error::Transport { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        Error::Transport {
            call: err.call,
            code: err.code,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Reports a violated internal invariant and aborts the current rank.
///
/// ```rust,should_panic
/// admpi_rs::contract_violation!("member {} has holes in its modified layout", 2);
/// ```
#[macro_export]
macro_rules! contract_violation {
    ($($arg:tt)*) => {{
        let message = format!($($arg)*);
        $crate::__private::tracing::error!(
            file = file!(),
            line = line!(),
            "contract violation: {}",
            message
        );
        panic!("contract violation at {}:{}: {}", file!(), line!(), message)
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_status_is_kept() {
        let err: Error = TransportError::new("recv", 15).into();
        assert_eq!(err.status(), Some(15));
        assert_eq!(
            err.to_string(),
            "Transport call `recv` failed with status 15"
        );
    }

    #[test]
    fn test_non_transport_has_no_status() {
        let err = Error::InvalidArgument("counts".into());
        assert_eq!(err.status(), None);
    }

    #[test]
    #[should_panic(expected = "contract violation")]
    fn test_contract_violation_panics() {
        contract_violation!("unreachable deletion policy {}", 3);
    }
}

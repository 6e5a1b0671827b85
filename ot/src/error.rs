use crate::id::UserId;
use thiserror::Error;

/// Errors of the transformation engine.
///
/// Every variant has a stable numeric code used by the wire
/// representation of failed requests.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum OtError {
    /// The request's state vector cannot be reached from the engine's
    /// current state, so no translation path exists.
    #[error("state vector of user {user} is not reachable from the current state")]
    VectorNotReachable {
        /// Author of the offending request.
        user: UserId,
    },
    /// Translating the request would exceed the configured vdiff limit.
    #[error("translating the request would exceed the limit of {limit}")]
    TransformationLimitExceeded {
        /// The configured limit.
        limit: u64,
    },
    /// The request to undo has been garbage collected or is not
    /// reversible.
    #[error("no request of user {user} can be undone")]
    UndoUnavailable {
        /// User that attempted the undo.
        user: UserId,
    },
    /// An operation addressed text outside the buffer.
    #[error("operation range {pos}+{len} exceeds buffer length {buffer_len}")]
    OutOfBounds {
        /// First character offset of the operation.
        pos: u32,
        /// Character count of the operation.
        len: u32,
        /// Length of the buffer the operation was applied to.
        buffer_len: u32,
    },
}

impl OtError {
    /// Stable wire code of the error.
    pub fn code(&self) -> u32 {
        match self {
            Self::VectorNotReachable { .. } => 0,
            Self::TransformationLimitExceeded { .. } => 1,
            Self::UndoUnavailable { .. } => 2,
            Self::OutOfBounds { .. } => 3,
        }
    }
}

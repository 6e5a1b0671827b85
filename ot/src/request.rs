//! The unit fed to and emitted by the transformation engine.
use crate::id::UserId;
use crate::op::Operation;
use crate::vector::StateVector;

/// What a request asks the engine to do.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum RequestKind {
    /// Execute the carried operation.
    Do,
    /// Revert the author's most recent not-yet-undone request.
    Undo,
    /// Revert the author's most recent not-yet-redone undo.
    Redo,
}

/// An operation bundled with its author and the causal state it was
/// issued at.
///
/// A `Do` request carries a concrete operation. `Undo` and `Redo`
/// requests carry none on the wire; the engine derives the operation
/// from the author's request log.
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    /// Author of the request.
    pub user: UserId,
    /// The author's causal state when the request was issued.
    pub vector: StateVector,
    /// Kind of the request.
    pub kind: RequestKind,
    /// The concrete operation, for `Do` requests and for log entries.
    pub operation: Option<Operation>,
}

impl Request {
    /// Creates a `Do` request.
    pub fn make(user: UserId, vector: StateVector, operation: Operation) -> Self {
        Self {
            user,
            vector,
            kind: RequestKind::Do,
            operation: Some(operation),
        }
    }

    /// Creates an `Undo` request.
    pub fn undo(user: UserId, vector: StateVector) -> Self {
        Self {
            user,
            vector,
            kind: RequestKind::Undo,
            operation: None,
        }
    }

    /// Creates a `Redo` request.
    pub fn redo(user: UserId, vector: StateVector) -> Self {
        Self {
            user,
            vector,
            kind: RequestKind::Redo,
            operation: None,
        }
    }
}

//! # The vellum operational transformation engine
//!
//! ## Model
//! Every participant of a session is a *user* with a numeric id. The
//! causal state of a session is a [`StateVector`]: for every user the
//! number of that user's requests contained in the state. A [`Request`]
//! bundles an author, the vector it was issued at, a kind (do, undo,
//! redo) and for do requests a concrete [`Operation`].
//!
//! ## Transformation
//! Two requests issued at concurrent vectors raced. To apply a remote
//! request, the [`Algorithm`] translates its operation into the local
//! state by transforming it against every logged request the author
//! had not seen, walking the state lattice one component at a time and
//! memoizing intermediate translations. Pairwise transformation is
//! position arithmetic: inserts shift, deletes shorten, a delete that
//! encloses a concurrent insert splits into a pair. The single
//! ambiguous case, two inserts at the same position, is decided by a
//! concurrency id derived from the author ids, so every site picks the
//! same winner and the buffers converge.
//!
//! ## Buffers
//! The document is a [`TextChunk`]: an ordered list of authored runs.
//! Chunks remember who wrote what, which the directory layer persists
//! and user interfaces color by author.
//!
//! ## Undo
//! Per-user [`RequestLog`]s record every executed request. An undo
//! derives the inverse of the author's most recent not-yet-undone
//! request and translates it like any concurrent operation, so undo
//! works in the face of interleaved edits from other users. Logs are
//! garbage collected once every participant has announced a state
//! past an entry, unless a pending undo or redo still targets it.
#![deny(missing_docs)]
mod algorithm;
mod chunk;
mod error;
mod id;
mod log;
mod op;
#[cfg(test)]
mod props;
mod request;
mod vector;

pub use crate::algorithm::{Algorithm, AlgorithmConfig, CheckRequest};
pub use crate::chunk::{SegmentRef, TextChunk};
pub use crate::error::OtError;
pub use crate::id::UserId;
pub use crate::log::RequestLog;
pub use crate::op::{ConcurrencyId, Operation};
pub use crate::request::{Request, RequestKind};
pub use crate::vector::{StateVector, VectorParseError};

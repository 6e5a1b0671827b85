//! Buffer operations and their pairwise transformation.
//!
//! The transformation policy works on character offsets only. Inserts
//! shift, deletes shorten or split, and two inserts at the same
//! position are tie-broken by a [`ConcurrencyId`] that every site
//! derives the same way, which is what makes concurrent execution
//! converge.
use crate::chunk::TextChunk;
use crate::error::OtError;
use crate::id::UserId;

/// Decides which of two operations yields when no other criterion can.
///
/// The only case that requires a decision is two concurrent inserts at
/// the same position.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConcurrencyId {
    /// The operation being transformed is shifted.
    Own,
    /// No decision is required.
    None,
    /// The other operation yields; the operation being transformed
    /// stays in place.
    Other,
}

impl ConcurrencyId {
    /// Returns the decision seen from the other operation's side.
    pub fn invert(self) -> Self {
        match self {
            Self::Own => Self::Other,
            Self::None => Self::None,
            Self::Other => Self::Own,
        }
    }
}

/// A single edit against a session buffer.
///
/// Insert and delete exist in a payload-carrying and a stripped form.
/// Stripped operations transform like their full counterparts but are
/// not reversible; a stripped delete becomes reversible when applied,
/// because the buffer yields the erased text.
#[derive(Clone, Debug, PartialEq)]
pub enum Operation {
    /// Insert the chunk at a character offset.
    Insert {
        /// Insertion offset.
        pos: u32,
        /// The inserted, authored text.
        chunk: TextChunk,
    },
    /// An insert whose payload has been dropped.
    InsertStripped {
        /// Insertion offset.
        pos: u32,
        /// Character count of the dropped payload.
        len: u32,
    },
    /// Erase a range, remembering the erased text.
    Delete {
        /// First erased offset.
        pos: u32,
        /// The erased, authored text.
        chunk: TextChunk,
    },
    /// An erase known only by its range.
    DeleteStripped {
        /// First erased offset.
        pos: u32,
        /// Character count of the range.
        len: u32,
    },
    /// Move the author's caret. Does not touch the buffer.
    Move {
        /// New caret offset.
        pos: u32,
    },
    /// Two operations that apply in sequence and transform as one.
    /// The second part is expressed in the coordinates that hold after
    /// the first part has been applied.
    Split(Box<Operation>, Box<Operation>),
    /// Does nothing. Deletes collapse to this when fully consumed by a
    /// concurrent delete.
    Nop,
}

impl Operation {
    /// Returns whether the operation modifies buffer content.
    pub fn affects_buffer(&self) -> bool {
        match self {
            Self::Insert { .. }
            | Self::InsertStripped { .. }
            | Self::Delete { .. }
            | Self::DeleteStripped { .. } => true,
            Self::Split(first, second) => first.affects_buffer() || second.affects_buffer(),
            Self::Move { .. } | Self::Nop => false,
        }
    }

    /// Returns whether [`revert`](Self::revert) can produce an inverse.
    pub fn is_reversible(&self) -> bool {
        match self {
            Self::Insert { .. } | Self::Delete { .. } | Self::Nop => true,
            Self::Split(first, second) => first.is_reversible() && second.is_reversible(),
            Self::InsertStripped { .. } | Self::DeleteStripped { .. } | Self::Move { .. } => false,
        }
    }

    /// Returns the operation that undoes this one, or `None` if the
    /// operation is not reversible.
    pub fn revert(&self) -> Option<Operation> {
        match self {
            Self::Insert { pos, chunk } => Some(Self::Delete {
                pos: *pos,
                chunk: chunk.clone(),
            }),
            Self::Delete { pos, chunk } => Some(Self::Insert {
                pos: *pos,
                chunk: chunk.clone(),
            }),
            Self::Nop => Some(Self::Nop),
            Self::Split(first, second) => Some(Self::Split(
                Box::new(second.revert()?),
                Box::new(first.revert()?),
            )),
            Self::InsertStripped { .. } | Self::DeleteStripped { .. } | Self::Move { .. } => None,
        }
    }

    /// Returns whether transforming against `against` requires a
    /// concurrency id. Only two inserts at the same position do.
    pub fn needs_concurrency_id(&self, against: &Operation) -> bool {
        match (self, against) {
            (Self::Split(first, second), _) => {
                first.needs_concurrency_id(against) || second.needs_concurrency_id(against)
            }
            (_, Self::Split(first, second)) => {
                self.needs_concurrency_id(first) || self.needs_concurrency_id(second)
            }
            _ => match (self.insert_params(), against.insert_params()) {
                (Some((own, _)), Some((other, _))) => own == other,
                _ => false,
            },
        }
    }

    /// Derives a concurrency id from the operations alone: for two
    /// inserts the one further left yields. Returns
    /// [`ConcurrencyId::None`] when positions coincide, in which case
    /// the caller must decide by author id.
    pub fn concurrency_id(&self, against: &Operation) -> ConcurrencyId {
        match (self.insert_params(), against.insert_params()) {
            (Some((own, _)), Some((other, _))) => {
                if own < other {
                    ConcurrencyId::Other
                } else if own > other {
                    ConcurrencyId::Own
                } else {
                    ConcurrencyId::None
                }
            }
            _ => ConcurrencyId::None,
        }
    }

    /// Transforms the operation to include the effect of `against`,
    /// which is concurrent to it and based on the same buffer state.
    pub fn transform(&self, against: &Operation, cid: ConcurrencyId) -> Operation {
        if let Self::Split(first, second) = against {
            // The second part lives in post-first coordinates, and so
            // does the intermediate result.
            return self.transform(first, cid).transform(second, cid);
        }
        match self {
            Self::Nop => Self::Nop,
            Self::Move { pos } => Self::Move {
                pos: transform_point(*pos, against),
            },
            Self::Split(first, second) => {
                let new_first = first.transform(against, cid);
                let shifted_against = against.transform(first, cid.invert());
                let new_second = second.transform(&shifted_against, cid);
                collapse_split(new_first, new_second)
            }
            Self::Insert { .. } | Self::InsertStripped { .. } => self.transform_insert(against, cid),
            Self::Delete { .. } | Self::DeleteStripped { .. } => self.transform_delete(against),
        }
    }

    /// Applies the operation to `buffer` and returns the operation as
    /// applied, enriched with buffer information where that makes it
    /// reversible (a stripped delete picks up the erased text).
    ///
    /// # Panics
    ///
    /// Panics when called on a stripped insert; those exist only
    /// inside the transformation engine and never reach a buffer.
    pub fn apply(&self, buffer: &mut TextChunk, author: UserId) -> Result<Operation, OtError> {
        match self {
            Self::Insert { pos, chunk } => {
                buffer.insert_chunk(*pos, chunk)?;
                Ok(self.clone())
            }
            Self::InsertStripped { .. } => {
                panic!("stripped insert cannot be applied to a buffer");
            }
            Self::Delete { pos, chunk } => {
                buffer.erase(*pos, chunk.len())?;
                Ok(self.clone())
            }
            Self::DeleteStripped { pos, len } => {
                let chunk = buffer.erase(*pos, *len)?;
                Ok(Self::Delete { pos: *pos, chunk })
            }
            Self::Move { .. } | Self::Nop => Ok(self.clone()),
            Self::Split(first, second) => {
                let first = first.apply(buffer, author)?;
                let second = second.apply(buffer, author)?;
                Ok(Self::Split(Box::new(first), Box::new(second)))
            }
        }
    }

    /// Offset and character count of an insert, if the operation is
    /// one.
    fn insert_params(&self) -> Option<(u32, u32)> {
        match self {
            Self::Insert { pos, chunk } => Some((*pos, chunk.len())),
            Self::InsertStripped { pos, len } => Some((*pos, *len)),
            _ => None,
        }
    }

    /// Offset and character count of a delete, if the operation is
    /// one.
    fn delete_params(&self) -> Option<(u32, u32)> {
        match self {
            Self::Delete { pos, chunk } => Some((*pos, chunk.len())),
            Self::DeleteStripped { pos, len } => Some((*pos, *len)),
            _ => None,
        }
    }

    fn with_insert_pos(&self, pos: u32) -> Operation {
        match self {
            Self::Insert { chunk, .. } => Self::Insert {
                pos,
                chunk: chunk.clone(),
            },
            Self::InsertStripped { len, .. } => Self::InsertStripped { pos, len: *len },
            _ => unreachable!("not an insert"),
        }
    }

    /// A sub-range of a delete, preserving the payload slice when one
    /// is carried.
    fn delete_sub(&self, from: u32, len: u32, pos: u32) -> Operation {
        if len == 0 {
            return Self::Nop;
        }
        match self {
            Self::Delete { chunk, .. } => Self::Delete {
                pos,
                chunk: chunk
                    .substring(from, len)
                    .expect("delete payload slice within range"),
            },
            Self::DeleteStripped { .. } => Self::DeleteStripped { pos, len },
            _ => unreachable!("not a delete"),
        }
    }

    fn transform_insert(&self, against: &Operation, cid: ConcurrencyId) -> Operation {
        let (own_pos, _) = self.insert_params().expect("insert operation");
        if let Some((other_pos, other_len)) = against.insert_params() {
            return if own_pos < other_pos
                || (own_pos == other_pos && cid == ConcurrencyId::Other)
            {
                self.clone()
            } else if own_pos > other_pos || cid == ConcurrencyId::Own {
                self.with_insert_pos(own_pos + other_len)
            } else {
                unreachable!("concurrent same-position inserts require a concurrency id");
            };
        }
        if let Some((other_pos, other_len)) = against.delete_params() {
            return if own_pos >= other_pos + other_len {
                self.with_insert_pos(own_pos - other_len)
            } else if own_pos < other_pos {
                self.clone()
            } else {
                self.with_insert_pos(other_pos)
            };
        }
        self.clone()
    }

    fn transform_delete(&self, against: &Operation) -> Operation {
        let (own_pos, own_len) = self.delete_params().expect("delete operation");
        let own_end = own_pos + own_len;
        if let Some((other_pos, other_len)) = against.insert_params() {
            return if other_pos >= own_end {
                self.clone()
            } else if other_pos <= own_pos {
                self.delete_sub(0, own_len, own_pos + other_len)
            } else {
                // The insert lands inside the erased range; erase
                // around it with a pair.
                let first_len = other_pos - own_pos;
                let first = self.delete_sub(0, first_len, own_pos);
                let second = self.delete_sub(first_len, own_len - first_len, own_pos + other_len);
                collapse_split(first, second)
            };
        }
        if let Some((other_pos, other_len)) = against.delete_params() {
            let other_end = other_pos + other_len;
            return if own_end <= other_pos {
                self.clone()
            } else if own_pos >= other_end {
                self.delete_sub(0, own_len, own_pos - other_len)
            } else if other_pos <= own_pos && other_end >= own_end {
                Self::Nop
            } else if other_pos <= own_pos {
                // Prefix of the range is already gone.
                let removed = other_end - own_pos;
                self.delete_sub(removed, own_len - removed, other_pos)
            } else if other_end >= own_end {
                // Suffix of the range is already gone.
                self.delete_sub(0, other_pos - own_pos, own_pos)
            } else {
                // The other delete punched a hole in the middle.
                let head_len = other_pos - own_pos;
                let head = self.delete_sub(0, head_len, own_pos);
                let tail = self.delete_sub(head_len + other_len, own_end - other_end, own_pos);
                match (head, tail) {
                    (Self::Delete { pos, chunk }, Self::Delete { chunk: tail_chunk, .. }) => {
                        let mut joined = chunk;
                        let at = joined.len();
                        joined
                            .insert_chunk(at, &tail_chunk)
                            .expect("append at chunk end");
                        Self::Delete { pos, chunk: joined }
                    }
                    _ => Self::DeleteStripped {
                        pos: own_pos,
                        len: own_len - other_len,
                    },
                }
            };
        }
        self.clone()
    }
}

/// Shifts a caret offset past `against`.
fn transform_point(pos: u32, against: &Operation) -> u32 {
    if let Some((other_pos, other_len)) = against.insert_params() {
        if other_pos <= pos {
            return pos + other_len;
        }
        return pos;
    }
    if let Some((other_pos, other_len)) = against.delete_params() {
        if other_pos + other_len <= pos {
            return pos - other_len;
        }
        if other_pos < pos {
            return other_pos;
        }
    }
    pos
}

/// Builds a split, dropping parts that transformed away.
fn collapse_split(first: Operation, second: Operation) -> Operation {
    match (first, second) {
        (Operation::Nop, second) => second,
        (first, Operation::Nop) => first,
        (first, second) => Operation::Split(Box::new(first), Box::new(second)),
    }
}

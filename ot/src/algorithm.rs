//! The transformation engine that keeps concurrent sites convergent.
//!
//! The engine owns the canonical buffer and, per user, the last
//! announced state vector and the request log. Remote requests are
//! translated into the current state by recursively transforming them
//! against every intervening logged request, with memoization; the
//! recursion terminates because every step removes one component step
//! from the target vector.
use crate::chunk::TextChunk;
use crate::error::OtError;
use crate::id::UserId;
use crate::log::RequestLog;
use crate::op::{ConcurrencyId, Operation};
use crate::request::{Request, RequestKind};
use crate::vector::StateVector;
use fnv::FnvHashMap;
use std::collections::HashMap;

/// Tunables of the engine.
#[derive(Clone, Copy, Debug)]
pub struct AlgorithmConfig {
    /// Upper bound on the total number of requests kept across all
    /// logs before garbage collection kicks in.
    pub max_total_log_size: usize,
}

impl Default for AlgorithmConfig {
    fn default() -> Self {
        Self {
            max_total_log_size: 2048,
        }
    }
}

/// Hook consulted before a request is translated. Returning an error
/// refuses the request; the caller is expected to drop the offending
/// subscription.
pub type CheckRequest = Box<dyn FnMut(&Request, &StateVector) -> Result<(), OtError> + Send>;

#[derive(Debug)]
struct UserLane {
    vector: StateVector,
    log: RequestLog,
}

/// The operational transformation algorithm of one session.
pub struct Algorithm {
    buffer: TextChunk,
    lanes: FnvHashMap<UserId, UserLane>,
    current: StateVector,
    config: AlgorithmConfig,
    check_request: Option<CheckRequest>,
}

type TranslationCache = HashMap<(UserId, u32, StateVector), Operation>;

impl Algorithm {
    /// Creates an engine over `buffer` with no users.
    pub fn new(buffer: TextChunk, config: AlgorithmConfig) -> Self {
        Self {
            buffer,
            lanes: Default::default(),
            current: StateVector::new(),
            config,
            check_request: None,
        }
    }

    /// Installs or clears the per-request check hook.
    pub fn set_check_request(&mut self, check: Option<CheckRequest>) {
        self.check_request = check;
    }

    /// Registers a user. `vector` is the user's announced state; for a
    /// freshly joining user this is the current state, for a user
    /// restored from a synchronized snapshot it is the transferred one.
    pub fn add_user(&mut self, user: UserId, vector: StateVector) {
        let own = vector.get(user);
        self.current.set(user, own);
        // Counters below the announced own count were applied before
        // this engine saw the user; the log starts after them.
        let log = RequestLog::starting_at(user, own + 1);
        self.lanes.insert(user, UserLane { vector, log });
    }

    /// Returns whether the user is known to the engine.
    pub fn has_user(&self, user: UserId) -> bool {
        self.lanes.contains_key(&user)
    }

    /// The canonical buffer.
    pub fn buffer(&self) -> &TextChunk {
        &self.buffer
    }

    /// The engine's current state.
    pub fn current(&self) -> &StateVector {
        &self.current
    }

    /// The last announced state of `user`.
    pub fn user_vector(&self, user: UserId) -> Option<&StateVector> {
        self.lanes.get(&user).map(|lane| &lane.vector)
    }

    /// The request log of `user`.
    pub fn log(&self, user: UserId) -> Option<&RequestLog> {
        self.lanes.get(&user).map(|lane| &lane.log)
    }

    /// Returns whether `user` has a reversible request left to undo.
    pub fn can_undo(&self, user: UserId) -> bool {
        self.undo_target(user, RequestKind::Undo).is_ok()
    }

    /// Returns whether `user` has an undo left to redo.
    pub fn can_redo(&self, user: UserId) -> bool {
        self.undo_target(user, RequestKind::Redo).is_ok()
    }

    /// Generates, applies and returns the wire form of a local `Do`
    /// request. The returned request carries the operation as logged,
    /// so a stripped delete goes out with the payload the buffer
    /// yielded and stays undoable on every site.
    pub fn generate_do(&mut self, user: UserId, operation: Operation) -> Result<Request, OtError> {
        let request = Request::make(user, self.current.clone(), operation);
        self.execute(request)?;
        let lane = &self.lanes[&user];
        let logged = lane
            .log
            .get(lane.log.next_index() - 1)
            .expect("request was just logged");
        Ok(logged.clone())
    }

    /// Generates, applies and returns the wire form of a local `Undo`
    /// request. Fails with [`OtError::UndoUnavailable`] when nothing
    /// reversible is left.
    pub fn generate_undo(&mut self, user: UserId) -> Result<Request, OtError> {
        let request = Request::undo(user, self.current.clone());
        let wire = request.clone();
        self.execute(request)?;
        Ok(wire)
    }

    /// Generates, applies and returns the wire form of a local `Redo`
    /// request.
    pub fn generate_redo(&mut self, user: UserId) -> Result<Request, OtError> {
        let request = Request::redo(user, self.current.clone());
        let wire = request.clone();
        self.execute(request)?;
        Ok(wire)
    }

    /// Translates a request into the current state, applies it to the
    /// buffer and appends it to its author's log.
    ///
    /// Returns the request as applied: author and kind of the input,
    /// the state it was applied at, and the translated operation. The
    /// caller forwards the *original* request to other participants
    /// and uses the returned one for local interest (carets, views).
    pub fn execute(&mut self, request: Request) -> Result<Request, OtError> {
        let user = request.user;
        if !self.lanes.contains_key(&user) {
            return Err(OtError::VectorNotReachable { user });
        }
        if !request.vector.causally_leq(&self.current) {
            return Err(OtError::VectorNotReachable { user });
        }
        let counter = self.lanes[&user].log.next_index();
        if request.vector.get(user) + 1 != counter {
            return Err(OtError::VectorNotReachable { user });
        }
        if let Some(check) = self.check_request.as_mut() {
            if let Err(err) = check(&request, &self.current) {
                tracing::warn!(
                    "refusing request of user {}: {} (request vector '{}', current '{}')",
                    user,
                    err,
                    request.vector,
                    self.current
                );
                return Err(err);
            }
        }

        // Derive the concrete operation in the request's own state.
        let operation = match request.kind {
            RequestKind::Do => {
                let operation = request
                    .operation
                    .clone()
                    .expect("do request carries an operation");
                Self::sanity_check(&operation);
                operation
            }
            kind => {
                let (base, reverted) = self.undo_target(user, kind)?;
                let mut cache = TranslationCache::new();
                self.translate(user, 0, &base, &reverted, &request.vector, &mut cache)?
            }
        };

        // Translate it to the current state and apply.
        let current = self.current.clone();
        let mut cache = TranslationCache::new();
        let translated =
            self.translate(user, counter, &request.vector, &operation, &current, &mut cache)?;
        let mut buffer = self.buffer.clone();
        let applied = translated.apply(&mut buffer, user)?;
        self.buffer = buffer;

        // An untransformed stripped delete picked up its payload from
        // the buffer; log the enriched form so it stays undoable.
        let logged_operation = if request.vector == self.current {
            applied.clone()
        } else {
            operation
        };
        let lane = self.lanes.get_mut(&user).expect("lane exists");
        lane.log.push(Request {
            user,
            vector: request.vector.clone(),
            kind: request.kind,
            operation: Some(logged_operation),
        });
        lane.vector = request.vector.clone();
        lane.vector.set(user, counter);
        let applied_at = self.current.clone();
        self.current.inc(user);

        self.collect_garbage();

        Ok(Request {
            user,
            vector: applied_at,
            kind: request.kind,
            operation: Some(applied),
        })
    }

    /// Finds the request an undo/redo of `user` reverts and returns
    /// the state right after it together with the reverting operation.
    fn undo_target(&self, user: UserId, kind: RequestKind) -> Result<(StateVector, Operation), OtError> {
        let lane = self
            .lanes
            .get(&user)
            .ok_or(OtError::UndoUnavailable { user })?;
        let index = match kind {
            RequestKind::Undo => lane.log.next_undo_index(),
            RequestKind::Redo => lane.log.next_redo_index(),
            RequestKind::Do => None,
        }
        .ok_or(OtError::UndoUnavailable { user })?;
        let target = lane
            .log
            .get(index)
            .ok_or(OtError::UndoUnavailable { user })?;
        let reverted = target
            .operation
            .as_ref()
            .and_then(|operation| operation.revert())
            .ok_or(OtError::UndoUnavailable { user })?;
        let mut base = target.vector.clone();
        base.set(user, index);
        Ok((base, reverted))
    }

    /// Translates `operation`, issued by `user` at state `from`, into
    /// state `to` by transforming it against every intervening logged
    /// request.
    fn translate(
        &self,
        user: UserId,
        counter: u32,
        from: &StateVector,
        operation: &Operation,
        to: &StateVector,
        cache: &mut TranslationCache,
    ) -> Result<Operation, OtError> {
        if from == to {
            return Ok(operation.clone());
        }
        let key = (user, counter, to.clone());
        if let Some(hit) = cache.get(&key) {
            return Ok(hit.clone());
        }
        for (other_user, count) in to.iter() {
            if other_user == user || count <= from.get(other_user) {
                continue;
            }
            let Some(lane) = self.lanes.get(&other_user) else {
                continue;
            };
            let Some(against) = lane.log.get(count) else {
                continue;
            };
            let mut to_minus = to.clone();
            to_minus.set(other_user, count - 1);
            if !against.vector.causally_leq(&to_minus) || !from.causally_leq(&to_minus) {
                continue;
            }
            let against_operation = against
                .operation
                .as_ref()
                .expect("logged requests carry operations");
            let translated_against = self.translate(
                other_user,
                count,
                &against.vector,
                against_operation,
                &to_minus,
                cache,
            )?;
            let translated_own =
                self.translate(user, counter, from, operation, &to_minus, cache)?;
            let cid = if translated_own.needs_concurrency_id(&translated_against) {
                // The site with the numerically lower id keeps its
                // position on every site.
                if user < other_user {
                    ConcurrencyId::Other
                } else {
                    ConcurrencyId::Own
                }
            } else {
                translated_own.concurrency_id(&translated_against)
            };
            let result = translated_own.transform(&translated_against, cid);
            cache.insert(key, result.clone());
            return Ok(result);
        }
        Err(OtError::VectorNotReachable { user })
    }

    /// Drops log entries no participant can still need: entries behind
    /// every announced vector that are not targets of a pending undo
    /// or redo, keeping undo/redo chains intact.
    fn collect_garbage(&mut self) {
        let total: usize = self.lanes.values().map(|lane| lane.log.len()).sum();
        if total <= self.config.max_total_log_size {
            return;
        }
        let users: Vec<UserId> = self.lanes.keys().copied().collect();
        for user in users {
            let oldest_needed = self
                .lanes
                .values()
                .map(|lane| lane.vector.get(user))
                .min()
                .unwrap_or(0);
            let lane = self.lanes.get_mut(&user).expect("lane exists");
            let mut limit = oldest_needed + 1;
            if let Some(index) = lane.log.next_undo_index() {
                limit = limit.min(index);
            }
            if let Some(index) = lane.log.next_redo_index() {
                limit = limit.min(index);
            }
            let mut cut = lane.log.begin();
            while cut < limit {
                let block_end = lane.log.upper_related(cut);
                if block_end < limit {
                    cut = block_end + 1;
                } else {
                    break;
                }
            }
            lane.log.truncate_front(cut);
        }
    }

    fn sanity_check(operation: &Operation) {
        debug_assert!(
            !matches!(operation, Operation::InsertStripped { .. }),
            "stripped inserts cannot be executed"
        );
    }
}

impl std::fmt::Debug for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Algorithm")
            .field("current", &self.current)
            .field("users", &self.lanes.len())
            .field("buffer_len", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

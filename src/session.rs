//! Per-document session state.
//!
//! A session owns the buffer through its transformation engine, the
//! joined users and the subscription group. The same type serves the
//! hosting side (created running, synchronizing its state out to new
//! subscribers) and the mirroring side (created presync, built up from
//! the host's sync messages, deferring live requests until the
//! synchronization ends).
use crate::account::AccountId;
use crate::error::{DirectoryError, Error, RequestError, UserError};
use crate::group::SubscriptionGroup;
use crate::id::ConnectionId;
use crate::observe::{ObserverList, Subscription};
use crate::proto::{Message, SyncUser, WIRE_ENCODING};
use crate::user::{User, UserFlags, UserStatus};
use crate::xml::Element;
use fnv::FnvHashMap;
use vellum_ot::{
    Algorithm, AlgorithmConfig, OtError, Request as OtRequest, StateVector, TextChunk, UserId,
};

/// Lifecycle of a session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionStatus {
    /// Waiting for the host to start synchronizing.
    PreSync,
    /// Receiving the host's snapshot; live requests are deferred.
    Synchronizing,
    /// Fully operational.
    Running,
    /// Shut down; no further requests are accepted.
    Closed,
}

/// Tunables of a session.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Buffer encoding. Fixed for the session's lifetime.
    pub encoding: String,
    /// Engine tunables.
    pub algorithm: AlgorithmConfig,
    /// When set, requests whose vector is further than this from the
    /// current state are refused and the offending subscription is
    /// dropped.
    pub max_translation_vdiff: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            encoding: WIRE_ENCODING.to_string(),
            algorithm: AlgorithmConfig::default(),
            max_translation_vdiff: None,
        }
    }
}

/// Parameters of a user join.
#[derive(Clone, Debug)]
pub struct UserParams {
    /// Requested display name.
    pub name: String,
    /// Initial status. Must not be `Unavailable`.
    pub status: UserStatus,
    /// Initial caret position.
    pub caret: u32,
    /// Account of the joining connection.
    pub account: AccountId,
    /// The joining connection, if any.
    pub connection: Option<ConnectionId>,
    /// The joining side's causal state.
    pub vector: StateVector,
    /// Whether the user is joined by this side.
    pub local: bool,
}

/// Events a session delivers to its observers.
#[derive(Debug)]
pub enum SessionEvent {
    /// A request was translated and applied to the buffer. Carries
    /// the request as applied.
    RequestApplied {
        /// The applied request.
        request: OtRequest,
    },
    /// A user joined, or rejoined after being unavailable.
    UserJoined {
        /// Snapshot of the user record.
        user: User,
        /// True when an unavailable record was taken over.
        rejoin: bool,
    },
    /// A user's status changed.
    UserStatusChanged {
        /// The user.
        id: UserId,
        /// The new status.
        status: UserStatus,
    },
    /// The synchronization completed and the session is running.
    Synchronized,
    /// The session was closed.
    Closed,
}

/// A serialisable image of a session: authored buffer runs plus the
/// user list with final vectors. This is what sync transfers and what
/// the storage back-end persists for a text leaf.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionSnapshot {
    /// User records at snapshot time, ordered by id.
    pub users: Vec<SyncUser>,
    /// The buffer.
    pub buffer: TextChunk,
}

impl SessionSnapshot {
    /// Serialises the snapshot as a `<session>` element.
    pub fn to_xml(&self) -> Element {
        let mut element = Element::new("session").attr("encoding", self.buffer.encoding());
        for user in &self.users {
            element = element.child(
                Element::new("user")
                    .attr("id", user.id)
                    .attr("name", &user.name)
                    .attr("status", user.status.as_str())
                    .attr("vector", &user.vector)
                    .attr("caret", user.caret),
            );
        }
        let mut buffer = Element::new("buffer");
        for run in self.buffer.iter() {
            buffer = buffer.child(
                Element::new("segment")
                    .attr("author", run.author)
                    .text(String::from_utf8_lossy(run.text).to_string()),
            );
        }
        element.child(buffer)
    }

    /// Parses a `<session>` element.
    pub fn from_xml(element: &Element) -> Result<Self, Error> {
        let encoding = element.attr_opt("encoding").unwrap_or(WIRE_ENCODING);
        let mut users = Vec::new();
        for user in element.children_named("user") {
            let id: u32 = user.number_attr("id")?;
            users.push(SyncUser {
                id: UserId::new(id).ok_or(UserError::NoSuchUser(id))?,
                name: user.required_attr("name")?.to_string(),
                status: UserStatus::parse(user.required_attr("status")?)?,
                vector: user
                    .required_attr("vector")?
                    .parse()
                    .map_err(|_| RequestError::InvalidNumber("vector".into()))?,
                caret: user.number_attr("caret")?,
            });
        }
        let mut buffer = TextChunk::new(encoding);
        if let Some(runs) = element.first_child("buffer") {
            for segment in runs.children_named("segment") {
                let author: u32 = segment.number_attr("author")?;
                buffer.push_segment(
                    UserId::new(author).ok_or(UserError::NoSuchUser(author))?,
                    segment.text.as_bytes().to_vec(),
                );
            }
        }
        Ok(Self { users, buffer })
    }
}

/// Accumulates an incoming synchronization.
#[derive(Debug, Default)]
struct SyncProgress {
    expected: u32,
    received: u32,
    users: Vec<SyncUser>,
    buffer: Option<TextChunk>,
}

/// One collaborative editing session.
pub struct Session {
    config: SessionConfig,
    algorithm: Algorithm,
    users: FnvHashMap<UserId, User>,
    next_user_id: u32,
    status: SessionStatus,
    group: SubscriptionGroup,
    deferred: Vec<OtRequest>,
    sync: SyncProgress,
    events: ObserverList<SessionEvent>,
    dirty: bool,
}

impl Session {
    /// Creates an empty running session, as the host does for a fresh
    /// document.
    pub fn new(config: SessionConfig) -> Self {
        Self::with_buffer(config, None)
    }

    /// Creates a running session over existing content.
    pub fn from_snapshot(config: SessionConfig, snapshot: SessionSnapshot) -> Self {
        let mut session = Self::with_buffer(config, Some(snapshot.buffer));
        for user in snapshot.users {
            session.restore_user(user);
        }
        session
    }

    /// Creates a presync session that will be built up from sync
    /// messages.
    pub fn presync(config: SessionConfig) -> Self {
        let mut session = Self::with_buffer(config, None);
        session.status = SessionStatus::PreSync;
        session
    }

    fn with_buffer(config: SessionConfig, buffer: Option<TextChunk>) -> Self {
        let buffer = buffer.unwrap_or_else(|| TextChunk::new(&config.encoding));
        let mut algorithm = Algorithm::new(buffer, config.algorithm);
        install_protection(&mut algorithm, config.max_translation_vdiff);
        Self {
            config,
            algorithm,
            users: Default::default(),
            next_user_id: 1,
            status: SessionStatus::Running,
            group: SubscriptionGroup::new(),
            deferred: Vec::new(),
            sync: SyncProgress::default(),
            events: ObserverList::new(),
            dirty: false,
        }
    }

    /// The session's lifecycle state.
    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// The canonical buffer.
    pub fn buffer(&self) -> &TextChunk {
        self.algorithm.buffer()
    }

    /// The subscription group.
    pub fn group(&self) -> &SubscriptionGroup {
        &self.group
    }

    /// The subscription group, mutably.
    pub fn group_mut(&mut self) -> &mut SubscriptionGroup {
        &mut self.group
    }

    /// Looks up a user.
    pub fn user(&self, id: UserId) -> Option<&User> {
        self.users.get(&id)
    }

    /// Iterates over all user records, including unavailable ones.
    pub fn users(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }

    /// Registers an observer for session events.
    pub fn observe(&self, observer: impl FnMut(&SessionEvent) + Send + 'static) -> Subscription {
        self.events.subscribe(observer)
    }

    /// Returns and clears the modified-since-last-save flag.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    /// Joins a user, or takes over a retained unavailable record with
    /// the same name. The server-side caller has already checked the
    /// account's permission.
    pub fn join_user(&mut self, params: UserParams) -> Result<(User, bool), Error> {
        if self.status != SessionStatus::Running {
            return Err(DirectoryError::UnexpectedMessage("user-join".into()).into());
        }
        if params.status == UserStatus::Unavailable {
            return Err(UserError::UnavailableOnJoin.into());
        }
        if let Some(existing) = self.users.values().find(|user| user.name == params.name) {
            if existing.is_available() {
                return Err(UserError::NameInUse(params.name).into());
            }
            let id = existing.id;
            let user = self.users.get_mut(&id).expect("record exists");
            user.status = params.status;
            user.connection = params.connection;
            user.account = params.account;
            user.flags = UserFlags {
                local: params.local,
            };
            let user = user.clone();
            self.events.emit(&SessionEvent::UserJoined {
                user: user.clone(),
                rejoin: true,
            });
            return Ok((user, true));
        }
        let id = self.allocate_user_id();
        self.algorithm.add_user(id, params.vector.clone());
        let user = User {
            id,
            name: params.name,
            status: params.status,
            flags: UserFlags {
                local: params.local,
            },
            account: params.account,
            connection: params.connection,
            vector: params.vector,
            caret: params.caret,
        };
        self.users.insert(id, user.clone());
        self.events.emit(&SessionEvent::UserJoined {
            user: user.clone(),
            rejoin: false,
        });
        Ok((user, false))
    }

    /// Changes a user's status.
    pub fn set_user_status(&mut self, id: UserId, status: UserStatus) -> Result<(), Error> {
        let user = self
            .users
            .get_mut(&id)
            .ok_or(UserError::NoSuchUser(id.get()))?;
        if user.status == status {
            return Ok(());
        }
        user.status = status;
        if status == UserStatus::Unavailable {
            user.connection = None;
        }
        self.events
            .emit(&SessionEvent::UserStatusChanged { id, status });
        Ok(())
    }

    /// Marks every user of a dropped connection unavailable and
    /// removes the connection from the group. The records stay because
    /// logs and buffer segments keep referring to their ids.
    pub fn leave_connection(&mut self, connection: ConnectionId) {
        let affected: Vec<UserId> = self
            .users
            .values()
            .filter(|user| user.connection == Some(connection))
            .map(|user| user.id)
            .collect();
        for id in affected {
            let _ = self.set_user_status(id, UserStatus::Unavailable);
        }
        self.group.remove(connection);
    }

    /// Feeds a request into the engine.
    ///
    /// Returns the request as applied, or `None` when the session is
    /// synchronizing and the request was deferred. An `Err` of the
    /// [`OtError`] domain means the originating subscription must be
    /// dropped.
    pub fn receive_request(
        &mut self,
        request: OtRequest,
        from: Option<ConnectionId>,
    ) -> Result<Option<OtRequest>, Error> {
        match self.status {
            SessionStatus::Closed => {
                return Err(RequestError::Failed("session is closed".into()).into());
            }
            SessionStatus::PreSync => {
                return Err(DirectoryError::UnexpectedMessage("request".into()).into());
            }
            SessionStatus::Synchronizing => {
                self.deferred.push(request);
                return Ok(None);
            }
            SessionStatus::Running => {}
        }
        if let Some(connection) = from {
            let user = self
                .users
                .get(&request.user)
                .ok_or(UserError::NoSuchUser(request.user.get()))?;
            if user.connection != Some(connection) {
                return Err(UserError::NotJoinedByThisConnection.into());
            }
        }
        let applied = self.algorithm.execute(request)?;
        if let Some(user) = self.users.get_mut(&applied.user) {
            if let Some(vector) = self.algorithm.user_vector(applied.user) {
                user.vector = vector.clone();
            }
            if let Some(vellum_ot::Operation::Move { pos }) = &applied.operation {
                user.caret = *pos;
            }
        }
        self.dirty = true;
        self.events.emit(&SessionEvent::RequestApplied {
            request: applied.clone(),
        });
        Ok(Some(applied))
    }

    /// Returns whether `user` can undo a request.
    pub fn can_undo(&self, user: UserId) -> bool {
        self.algorithm.can_undo(user)
    }

    /// Returns whether `user` can redo an undo.
    pub fn can_redo(&self, user: UserId) -> bool {
        self.algorithm.can_redo(user)
    }

    /// Produces the message sequence that synchronizes this session's
    /// state to a new participant.
    pub fn sync_messages(&self) -> Vec<Message> {
        let snapshot = self.snapshot();
        let segments: Vec<Message> = snapshot
            .buffer
            .iter()
            .map(|run| Message::SyncSegment {
                author: run.author,
                text: String::from_utf8_lossy(run.text).to_string(),
            })
            .collect();
        let mut messages = Vec::with_capacity(snapshot.users.len() + segments.len() + 2);
        messages.push(Message::SyncBegin {
            total: (snapshot.users.len() + segments.len()) as u32,
        });
        messages.extend(snapshot.users.into_iter().map(Message::SyncUser));
        messages.extend(segments);
        messages.push(Message::SyncEnd);
        messages
    }

    /// Applies one synchronization message on the receiving side.
    pub fn apply_sync_message(&mut self, message: Message) -> Result<(), Error> {
        match (self.status, message) {
            (SessionStatus::PreSync, Message::SyncBegin { total }) => {
                self.status = SessionStatus::Synchronizing;
                self.sync = SyncProgress {
                    expected: total,
                    received: 0,
                    users: Vec::new(),
                    buffer: Some(TextChunk::new(&self.config.encoding)),
                };
                Ok(())
            }
            (SessionStatus::Synchronizing, Message::SyncUser(user)) => {
                self.sync.received += 1;
                self.sync.users.push(user);
                Ok(())
            }
            (SessionStatus::Synchronizing, Message::SyncSegment { author, text }) => {
                self.sync.received += 1;
                if let Some(buffer) = self.sync.buffer.as_mut() {
                    buffer.push_segment(author, text.into_bytes());
                }
                Ok(())
            }
            (SessionStatus::Synchronizing, Message::SyncEnd) => self.finish_sync(),
            (_, message) => Err(DirectoryError::UnexpectedMessage(
                message.to_element().name,
            )
            .into()),
        }
    }

    fn finish_sync(&mut self) -> Result<(), Error> {
        let progress = std::mem::take(&mut self.sync);
        if progress.received != progress.expected {
            return Err(DirectoryError::Failed(format!(
                "synchronization delivered {} items, announced {}",
                progress.received, progress.expected
            ))
            .into());
        }
        let buffer = progress.buffer.unwrap_or_else(|| {
            TextChunk::new(&self.config.encoding)
        });
        self.algorithm = Algorithm::new(buffer, self.config.algorithm);
        install_protection(&mut self.algorithm, self.config.max_translation_vdiff);
        self.users.clear();
        for user in progress.users {
            self.restore_user(user);
        }
        self.status = SessionStatus::Running;
        self.events.emit(&SessionEvent::Synchronized);
        for request in std::mem::take(&mut self.deferred) {
            self.receive_request(request, None)?;
        }
        Ok(())
    }

    /// Produces a serialisable image of the session.
    pub fn snapshot(&self) -> SessionSnapshot {
        let mut users: Vec<SyncUser> = self
            .users
            .values()
            .map(|user| SyncUser {
                id: user.id,
                name: user.name.clone(),
                status: user.status,
                vector: user.vector.clone(),
                caret: user.caret,
            })
            .collect();
        users.sort_by_key(|user| user.id);
        SessionSnapshot {
            users,
            buffer: self.buffer().clone(),
        }
    }

    /// Closes the session. Further requests are refused; the caller
    /// persists the final snapshot.
    pub fn close(&mut self) {
        if self.status == SessionStatus::Closed {
            return;
        }
        self.status = SessionStatus::Closed;
        self.group = SubscriptionGroup::new();
        self.events.emit(&SessionEvent::Closed);
    }

    fn restore_user(&mut self, user: SyncUser) {
        self.algorithm.add_user(user.id, user.vector.clone());
        self.next_user_id = self.next_user_id.max(user.id.get() + 1);
        self.users.insert(
            user.id,
            User {
                id: user.id,
                name: user.name,
                // Restored records have no live connection yet.
                status: UserStatus::Unavailable,
                flags: UserFlags::default(),
                account: AccountId::default_account(),
                connection: None,
                vector: user.vector,
                caret: user.caret,
            },
        );
    }

    fn allocate_user_id(&mut self) -> UserId {
        loop {
            let id = UserId::new(self.next_user_id).expect("user ids start at 1");
            self.next_user_id += 1;
            if !self.users.contains_key(&id) {
                return id;
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("status", &self.status)
            .field("users", &self.users.len())
            .field("buffer_len", &self.buffer().len())
            .field("subscribers", &self.group.len())
            .finish_non_exhaustive()
    }
}

/// Installs the translation protection hook.
fn install_protection(algorithm: &mut Algorithm, limit: Option<u64>) {
    if let Some(limit) = limit {
        algorithm.set_check_request(Some(Box::new(move |request, current| {
            if request.vector.vdiff(current) > limit {
                Err(OtError::TransformationLimitExceeded { limit })
            } else {
                Ok(())
            }
        })));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use vellum_ot::Operation;

    fn params(name: &str, connection: Option<ConnectionId>) -> UserParams {
        UserParams {
            name: name.to_string(),
            status: UserStatus::Active,
            caret: 0,
            account: AccountId::default_account(),
            connection,
            vector: StateVector::new(),
            local: false,
        }
    }

    fn insert(pos: u32, text: &str, author: UserId) -> Operation {
        Operation::Insert {
            pos,
            chunk: TextChunk::from_text(WIRE_ENCODING, text, author),
        }
    }

    #[test]
    fn join_allocates_unique_ids_and_names() {
        let mut session = Session::new(SessionConfig::default());
        let (alice, rejoin) = session
            .join_user(params("alice", Some(ConnectionId(1))))
            .unwrap();
        assert!(!rejoin);
        assert_eq!(alice.id.get(), 1);
        let (bob, _) = session
            .join_user(params("bob", Some(ConnectionId(2))))
            .unwrap();
        assert_eq!(bob.id.get(), 2);
        // Scenario: a second join with an already active name fails
        // and leaves the original user untouched.
        let err = session
            .join_user(params("alice", Some(ConnectionId(3))))
            .unwrap_err();
        assert_eq!(err, Error::User(UserError::NameInUse("alice".into())));
        assert_eq!(session.user(alice.id).unwrap().status, UserStatus::Active);
    }

    #[test]
    fn joining_as_unavailable_is_refused() {
        let mut session = Session::new(SessionConfig::default());
        let mut join = params("ghost", None);
        join.status = UserStatus::Unavailable;
        assert_eq!(
            session.join_user(join).unwrap_err(),
            Error::User(UserError::UnavailableOnJoin)
        );
    }

    #[test]
    fn connection_drop_marks_users_unavailable_and_rejoin_revives() {
        let mut session = Session::new(SessionConfig::default());
        let (alice, _) = session
            .join_user(params("alice", Some(ConnectionId(1))))
            .unwrap();
        session.leave_connection(ConnectionId(1));
        assert_eq!(
            session.user(alice.id).unwrap().status,
            UserStatus::Unavailable
        );
        // Same name joins again: the retained record is taken over.
        let (revived, rejoin) = session
            .join_user(params("alice", Some(ConnectionId(2))))
            .unwrap();
        assert!(rejoin);
        assert_eq!(revived.id, alice.id);
        assert_eq!(revived.status, UserStatus::Active);
    }

    #[test]
    fn requests_update_buffer_and_emit_events() {
        let mut session = Session::new(SessionConfig::default());
        let (alice, _) = session
            .join_user(params("alice", Some(ConnectionId(1))))
            .unwrap();
        let applied_count = Arc::new(AtomicU32::new(0));
        let guard = {
            let applied_count = applied_count.clone();
            session.observe(move |event| {
                if matches!(event, SessionEvent::RequestApplied { .. }) {
                    applied_count.fetch_add(1, Ordering::Relaxed);
                }
            })
        };
        let request = OtRequest::make(
            alice.id,
            StateVector::new(),
            insert(0, "hello", alice.id),
        );
        let applied = session
            .receive_request(request, Some(ConnectionId(1)))
            .unwrap()
            .unwrap();
        assert_eq!(session.buffer().text(), "hello");
        assert_eq!(applied.user, alice.id);
        assert_eq!(applied_count.load(Ordering::Relaxed), 1);
        assert!(session.take_dirty());
        assert!(!session.take_dirty());
        drop(guard);
    }

    #[test]
    fn foreign_connection_cannot_speak_for_a_user() {
        let mut session = Session::new(SessionConfig::default());
        let (alice, _) = session
            .join_user(params("alice", Some(ConnectionId(1))))
            .unwrap();
        let request = OtRequest::make(
            alice.id,
            StateVector::new(),
            insert(0, "x", alice.id),
        );
        let err = session
            .receive_request(request, Some(ConnectionId(2)))
            .unwrap_err();
        assert_eq!(err, Error::User(UserError::NotJoinedByThisConnection));
    }

    #[test]
    fn synchronization_defers_live_requests() {
        // Host with content and one user.
        let mut host = Session::new(SessionConfig::default());
        let (alice, _) = host
            .join_user(params("alice", Some(ConnectionId(1))))
            .unwrap();
        host.receive_request(
            OtRequest::make(alice.id, StateVector::new(), insert(0, "doc", alice.id)),
            Some(ConnectionId(1)),
        )
        .unwrap();

        // Mirror goes presync -> synchronizing -> running.
        let mut mirror = Session::presync(SessionConfig::default());
        assert_eq!(mirror.status(), SessionStatus::PreSync);
        let messages = host.sync_messages();
        let mut fed = messages.into_iter();
        mirror.apply_sync_message(fed.next().unwrap()).unwrap();
        assert_eq!(mirror.status(), SessionStatus::Synchronizing);

        // A live request arrives mid-sync and is deferred.
        let mut vector = StateVector::new();
        vector.set(alice.id, 1);
        let live = OtRequest::make(alice.id, vector, insert(3, "!", alice.id));
        assert!(mirror.receive_request(live, None).unwrap().is_none());

        for message in fed {
            mirror.apply_sync_message(message).unwrap();
        }
        assert_eq!(mirror.status(), SessionStatus::Running);
        // The deferred request was applied after sync-end.
        assert_eq!(mirror.buffer().text(), "doc!");
    }

    #[test]
    fn sync_count_mismatch_is_an_error() {
        let mut mirror = Session::presync(SessionConfig::default());
        mirror
            .apply_sync_message(Message::SyncBegin { total: 3 })
            .unwrap();
        let err = mirror.apply_sync_message(Message::SyncEnd).unwrap_err();
        assert!(matches!(err, Error::Directory(DirectoryError::Failed(_))));
    }

    #[test]
    fn snapshot_roundtrips_through_xml() {
        let mut session = Session::new(SessionConfig::default());
        let (alice, _) = session
            .join_user(params("alice", Some(ConnectionId(1))))
            .unwrap();
        session
            .receive_request(
                OtRequest::make(alice.id, StateVector::new(), insert(0, "persisted", alice.id)),
                Some(ConnectionId(1)),
            )
            .unwrap();
        let snapshot = session.snapshot();
        let element = snapshot.to_xml();
        let parsed = SessionSnapshot::from_xml(&Element::parse(&element.to_bytes()).unwrap())
            .unwrap();
        assert_eq!(parsed, snapshot);
        // A session restored from the snapshot carries the content.
        let restored = Session::from_snapshot(SessionConfig::default(), parsed);
        assert_eq!(restored.buffer().text(), "persisted");
        assert_eq!(
            restored.user(alice.id).unwrap().status,
            UserStatus::Unavailable
        );
    }

    #[test]
    fn translation_protection_refuses_distant_requests() {
        let config = SessionConfig {
            max_translation_vdiff: Some(1),
            ..SessionConfig::default()
        };
        let mut session = Session::new(config);
        let (alice, _) = session
            .join_user(params("alice", Some(ConnectionId(1))))
            .unwrap();
        let (bob, _) = session
            .join_user(params("bob", Some(ConnectionId(2))))
            .unwrap();
        for n in 0..3 {
            session
                .receive_request(
                    OtRequest::make(
                        alice.id,
                        {
                            let mut vector = StateVector::new();
                            vector.set(alice.id, n);
                            vector
                        },
                        insert(n, "x", alice.id),
                    ),
                    Some(ConnectionId(1)),
                )
                .unwrap();
        }
        // Bob's request is three requests behind.
        let err = session
            .receive_request(
                OtRequest::make(bob.id, StateVector::new(), insert(0, "y", bob.id)),
                Some(ConnectionId(2)),
            )
            .unwrap_err();
        assert_eq!(
            err,
            Error::Ot(OtError::TransformationLimitExceeded { limit: 1 })
        );
    }

    #[test]
    fn closed_session_refuses_requests() {
        let mut session = Session::new(SessionConfig::default());
        let (alice, _) = session
            .join_user(params("alice", Some(ConnectionId(1))))
            .unwrap();
        session.close();
        assert_eq!(session.status(), SessionStatus::Closed);
        let err = session
            .receive_request(
                OtRequest::make(alice.id, StateVector::new(), insert(0, "x", alice.id)),
                Some(ConnectionId(1)),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Request(RequestError::Failed(_))));
    }

    #[test]
    fn undo_flows_through_the_session() {
        let mut session = Session::new(SessionConfig::default());
        let (alice, _) = session
            .join_user(params("alice", Some(ConnectionId(1))))
            .unwrap();
        session
            .receive_request(
                OtRequest::make(alice.id, StateVector::new(), insert(0, "oops", alice.id)),
                Some(ConnectionId(1)),
            )
            .unwrap();
        assert!(session.can_undo(alice.id));
        let mut vector = StateVector::new();
        vector.set(alice.id, 1);
        session
            .receive_request(OtRequest::undo(alice.id, vector), Some(ConnectionId(1)))
            .unwrap();
        assert_eq!(session.buffer().text(), "");
        assert!(session.can_redo(alice.id));
    }
}

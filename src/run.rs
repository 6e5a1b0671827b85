//! The server runtime: connections in, messages out.
//!
//! [`Server`] is transport-agnostic. The transport hands it raw bytes
//! per connection; it parses fragments, dispatches messages into the
//! directory and sessions, and queues outgoing fragments the
//! transport drains with [`take_outgoing`](Server::take_outgoing).
//! Everything runs on one cooperative loop; nothing here is touched
//! from another thread.
use crate::account::AccountId;
use crate::autosave::Autosave;
use crate::directory::{DirRequest, Directory, DirectoryConfig};
use crate::error::{DirectoryError, Error, TransportError, UserError};
use crate::id::{ConnectionId, NodeId};
use crate::proto::{Message, PROTOCOL_VERSION};
use crate::session::{SessionSnapshot, UserParams};
use crate::storage::Storage;
use crate::xml::stream::FragmentReader;
use fnv::FnvHashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use vellum_ot::TextChunk;

/// Transport keep-alive settings, carried by the core and consumed by
/// the transport.
#[derive(Clone, Copy, Debug)]
pub struct KeepaliveConfig {
    /// Whether keep-alive probing is on.
    pub enabled: bool,
    /// Idle time before the first probe.
    pub time: Duration,
    /// Interval between probes.
    pub interval: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            time: Duration::from_secs(60),
            interval: Duration::from_secs(10),
        }
    }
}

/// Tunables of the server runtime.
#[derive(Clone, Debug, Default)]
pub struct ServerConfig {
    /// Directory and session tunables.
    pub directory: DirectoryConfig,
    /// Keep-alive settings handed to the transport.
    pub keepalive: KeepaliveConfig,
    /// When set, modified sessions are persisted on this interval.
    pub autosave_interval: Option<Duration>,
}

#[derive(Debug)]
struct Connection {
    account: AccountId,
    reader: FragmentReader,
    pending_subscribes: Vec<DirRequest>,
}

/// One running server instance.
pub struct Server<S> {
    config: ServerConfig,
    directory: Directory<S>,
    connections: FnvHashMap<ConnectionId, Connection>,
    outgoing: VecDeque<(ConnectionId, Vec<u8>)>,
    autosave: Option<Autosave>,
}

impl<S: Storage> Server<S> {
    /// Creates a server over the given storage back-end.
    pub fn new(storage: Option<S>, config: ServerConfig) -> Self {
        let autosave = config.autosave_interval.map(Autosave::new);
        let directory = Directory::new(storage, config.directory.clone());
        Self {
            config,
            directory,
            connections: FnvHashMap::default(),
            outgoing: VecDeque::new(),
            autosave,
        }
    }

    /// The hosted directory.
    pub fn directory(&self) -> &Directory<S> {
        &self.directory
    }

    /// The hosted directory, mutably.
    pub fn directory_mut(&mut self) -> &mut Directory<S> {
        &mut self.directory
    }

    /// The keep-alive settings the transport should apply.
    pub fn keepalive(&self) -> KeepaliveConfig {
        self.config.keepalive
    }

    /// Registers a connection that authenticated as `account` and
    /// greets it.
    pub fn connection_opened(&mut self, id: ConnectionId, account: AccountId) {
        tracing::debug!("connection {} opened as account {}", id, account);
        self.connections.insert(
            id,
            Connection {
                account,
                reader: FragmentReader::new(),
                pending_subscribes: Vec::new(),
            },
        );
        self.send(
            id,
            &Message::Welcome {
                version: PROTOCOL_VERSION,
            },
        );
    }

    /// Unregisters a dropped connection. Its users become unavailable
    /// in every session and its pending requests fail with a
    /// synthetic transport error.
    pub fn connection_closed(&mut self, id: ConnectionId) {
        tracing::debug!("connection {} closed", id);
        if let Some(connection) = self.connections.remove(&id) {
            for request in connection.pending_subscribes {
                request.fail(
                    TransportError::Framing("connection closed before completion".into()).into(),
                );
            }
        }
        self.directory.connection_closed(id);
    }

    /// Feeds received bytes from a connection.
    ///
    /// Fragments are processed as they complete. A framing or parse
    /// error terminates the connection; per-message failures are
    /// reported back with `<request-failed>` and the connection
    /// lives on.
    pub fn connection_data(&mut self, id: ConnectionId, bytes: &[u8]) -> Result<(), Error> {
        let Some(connection) = self.connections.get_mut(&id) else {
            return Err(DirectoryError::Failed(format!("unknown connection {}", id)).into());
        };
        connection.reader.feed(bytes);
        loop {
            let fragment = match self
                .connections
                .get_mut(&id)
                .expect("connection checked above")
                .reader
                .next_fragment()
            {
                Ok(Some(fragment)) => fragment,
                Ok(None) => return Ok(()),
                Err(err) => {
                    tracing::warn!("dropping connection {}: {}", id, err);
                    self.connection_closed(id);
                    return Err(err);
                }
            };
            tracing::debug!(target: "vellum::traffic", "recv {}: <{}>", id, fragment.name);
            let seq = fragment.attr_opt("seq").map(str::to_string);
            let result = Message::from_element(&fragment)
                .and_then(|message| self.handle_message(id, message));
            if let Err(err) = result {
                self.send_failed(id, &err, seq.as_deref());
            }
        }
    }

    /// Drains the queued outgoing fragments.
    pub fn take_outgoing(&mut self) -> Vec<(ConnectionId, Vec<u8>)> {
        self.outgoing.drain(..).collect()
    }

    /// Timer hook; drives autosave.
    pub fn tick(&mut self, now: Instant) {
        if let Some(autosave) = self.autosave.as_mut() {
            if autosave.due(now) {
                autosave.save_dirty(&mut self.directory);
            }
        }
    }

    fn handle_message(&mut self, from: ConnectionId, message: Message) -> Result<(), Error> {
        let account = self.account_of(from)?;
        match message {
            Message::Welcome { version } => {
                if version != PROTOCOL_VERSION {
                    return Err(DirectoryError::VersionMismatch.into());
                }
                Ok(())
            }
            Message::ExploreNode { id } => {
                let (_request, messages) = self.directory.explore(&account, id)?;
                for message in messages {
                    self.send(from, &message);
                }
                Ok(())
            }
            Message::AddNode {
                id: None,
                parent,
                name,
                node_type,
            } => {
                let id = if node_type == "subdirectory" {
                    self.directory
                        .add_subdirectory(&account, parent, &name, None)?
                } else {
                    self.directory
                        .add_document(&account, parent, &name, &node_type, None, None)?
                };
                self.broadcast(&Message::AddNode {
                    id: Some(id),
                    parent,
                    name,
                    node_type,
                });
                Ok(())
            }
            Message::AddNode { id: Some(_), .. } => {
                Err(DirectoryError::UnexpectedMessage("add-node".into()).into())
            }
            Message::SyncIn {
                parent,
                name,
                node_type,
            } => {
                let initial = SessionSnapshot {
                    users: Vec::new(),
                    buffer: TextChunk::new(&self.config.directory.session.encoding),
                };
                let id = self.directory.add_document(
                    &account,
                    parent,
                    &name,
                    &node_type,
                    Some(initial),
                    None,
                )?;
                self.broadcast(&Message::AddNode {
                    id: Some(id),
                    parent,
                    name,
                    node_type,
                });
                Ok(())
            }
            Message::RemoveNode { id } => {
                self.directory.remove_node(&account, id)?;
                self.broadcast(&Message::RemoveNode { id });
                Ok(())
            }
            Message::SubscribeSession { id } => {
                let (request, messages) = self.directory.subscribe_session(&account, id, from)?;
                self.connections
                    .get_mut(&from)
                    .expect("connection exists")
                    .pending_subscribes
                    .push(request);
                for message in messages {
                    let message = wrap_for_session(id, message);
                    self.send(from, &message);
                }
                Ok(())
            }
            Message::SubscribeAck { id } => {
                let connection = self.connections.get_mut(&from).expect("connection exists");
                let position = connection
                    .pending_subscribes
                    .iter()
                    .position(|request| request.node() == Some(id))
                    .ok_or_else(|| {
                        Error::from(DirectoryError::UnexpectedMessage("subscribe-ack".into()))
                    })?;
                let request = connection.pending_subscribes.remove(position);
                self.directory.subscribe_ack(&request, from)
            }
            Message::Group { node, inner } => self.handle_session_message(from, node, *inner),
            Message::QueryAclAccountList => {
                let messages = self.directory.query_account_list(&account)?;
                for message in messages {
                    self.send(from, &message);
                }
                Ok(())
            }
            Message::AddAclAccount { account: new } => {
                self.directory.add_account(&account, new.clone())?;
                self.broadcast(&Message::AddAclAccount { account: new });
                Ok(())
            }
            Message::RemoveAclAccount { id } => {
                self.directory.remove_account(&account, &id)?;
                self.broadcast(&Message::RemoveAclAccount { id });
                Ok(())
            }
            Message::QueryAcl { id } => {
                let reply = self.directory.query_acl(&account, id)?;
                self.send(from, &reply);
                Ok(())
            }
            Message::SetAcl { id, sheets } => {
                self.directory.set_acl(&account, id, &sheets)?;
                let reply = self.directory.query_acl(&account, id)?;
                self.send(from, &reply);
                Ok(())
            }
            other => Err(DirectoryError::UnexpectedMessage(other.to_element().name).into()),
        }
    }

    fn handle_session_message(
        &mut self,
        from: ConnectionId,
        node: NodeId,
        message: Message,
    ) -> Result<(), Error> {
        let account = self.account_of(from)?;
        match message {
            Message::UserJoin {
                id,
                name,
                status,
                vector,
                caret,
            } => {
                if id.is_some() {
                    return Err(UserError::IdProvidedByClient.into());
                }
                let params = UserParams {
                    name,
                    status,
                    caret,
                    account: account.clone(),
                    connection: Some(from),
                    vector,
                    local: false,
                };
                let (user, rejoin) = self.directory.join_user(&account, node, params)?;
                let announce = if rejoin {
                    Message::UserRejoin {
                        id: user.id,
                        name: user.name,
                        vector: user.vector,
                    }
                } else {
                    Message::UserJoin {
                        id: Some(user.id),
                        name: user.name,
                        status: user.status,
                        vector: user.vector,
                        caret: user.caret,
                    }
                };
                self.broadcast_session(node, None, &announce)
            }
            Message::Request { request, time: _ } => {
                let mut relayed = Vec::new();
                let mut sink =
                    |to: ConnectionId, message: &Message| relayed.push((to, message.clone()));
                let result = self
                    .directory
                    .receive_request(node, request, Some(from), &mut sink);
                for (to, message) in relayed {
                    self.send(
                        to,
                        &Message::Group {
                            node,
                            inner: Box::new(message),
                        },
                    );
                }
                result.map(|_| ())
            }
            Message::UserStatusChange { id, status } => {
                let session = self
                    .directory
                    .session_mut(node)
                    .ok_or_else(|| Error::from(DirectoryError::no_such_node(node)))?;
                let owner = session
                    .user(id)
                    .ok_or(UserError::NoSuchUser(id.get()))?
                    .connection;
                if owner != Some(from) {
                    return Err(UserError::NotJoinedByThisConnection.into());
                }
                session.set_user_status(id, status)?;
                self.broadcast_session(node, Some(from), &Message::UserStatusChange { id, status })
            }
            other => Err(DirectoryError::UnexpectedMessage(other.to_element().name).into()),
        }
    }

    fn account_of(&self, id: ConnectionId) -> Result<AccountId, Error> {
        self.connections
            .get(&id)
            .map(|connection| connection.account.clone())
            .ok_or_else(|| DirectoryError::Failed(format!("unknown connection {}", id)).into())
    }

    fn send(&mut self, to: ConnectionId, message: &Message) {
        let element = message.to_element();
        tracing::debug!(target: "vellum::traffic", "send {}: <{}>", to, element.name);
        self.outgoing.push_back((to, element.to_bytes()));
    }

    fn send_failed(&mut self, to: ConnectionId, error: &Error, seq: Option<&str>) {
        let mut element = Message::failed(error).to_element();
        if let Some(seq) = seq {
            element.attrs.push(("seq".to_string(), seq.to_string()));
        }
        tracing::debug!(target: "vellum::traffic", "send {}: <request-failed>", to);
        self.outgoing.push_back((to, element.to_bytes()));
    }

    fn broadcast(&mut self, message: &Message) {
        let targets: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for target in targets {
            self.send(target, message);
        }
    }

    fn broadcast_session(
        &mut self,
        node: NodeId,
        except: Option<ConnectionId>,
        message: &Message,
    ) -> Result<(), Error> {
        let members: Vec<ConnectionId> = self
            .directory
            .session(node)
            .ok_or_else(|| Error::from(DirectoryError::no_such_node(node)))?
            .group()
            .iter()
            .collect();
        for member in members {
            if Some(member) != except {
                self.send(
                    member,
                    &Message::Group {
                        node,
                        inner: Box::new(message.clone()),
                    },
                );
            }
        }
        Ok(())
    }
}

impl<S> std::fmt::Debug for Server<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("connections", &self.connections.len())
            .field("queued", &self.outgoing.len())
            .finish_non_exhaustive()
    }
}

/// Wraps session-scoped messages in the group envelope; directory
/// level messages pass through.
fn wrap_for_session(node: NodeId, message: Message) -> Message {
    match &message {
        Message::SyncBegin { .. }
        | Message::SyncUser(_)
        | Message::SyncSegment { .. }
        | Message::SyncEnd
        | Message::Request { .. }
        | Message::UserJoin { .. }
        | Message::UserStatusChange { .. }
        | Message::UserRejoin { .. } => Message::Group {
            node,
            inner: Box::new(message),
        },
        _ => message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::user::UserStatus;
    use crate::xml::Element;
    use tracing_subscriber::EnvFilter;
    use vellum_ot::{Operation, Request as OtRequest, StateVector, UserId};

    fn init_tracing() {
        tracing_log::LogTracer::init().ok();
        let env = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| "info".to_owned());
        let subscriber = tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(EnvFilter::new(env))
            .with_writer(std::io::stderr)
            .finish();
        tracing::subscriber::set_global_default(subscriber).ok();
        log_panics::init();
    }

    fn server() -> Server<MemoryStorage> {
        init_tracing();
        Server::new(Some(MemoryStorage::new()), ServerConfig::default())
    }

    /// Sends one message as the connection's bytes.
    fn deliver(server: &mut Server<MemoryStorage>, from: ConnectionId, message: &Message) {
        server
            .connection_data(from, &message.to_element().to_bytes())
            .unwrap();
    }

    /// Decodes everything queued for one connection and clears the
    /// queue.
    fn sent_to(server: &mut Server<MemoryStorage>, to: ConnectionId) -> Vec<Message> {
        server
            .take_outgoing()
            .into_iter()
            .filter(|(target, _)| *target == to)
            .map(|(_, bytes)| {
                Message::from_element(&Element::parse(&bytes).unwrap()).unwrap()
            })
            .collect()
    }

    fn open(server: &mut Server<MemoryStorage>, id: u64) -> ConnectionId {
        let connection = ConnectionId(id);
        server.connection_opened(connection, AccountId::default_account());
        connection
    }

    /// Runs the full subscribe handshake for a connection and returns
    /// the node's sync message count.
    fn subscribe(server: &mut Server<MemoryStorage>, from: ConnectionId, node: NodeId) {
        deliver(server, from, &Message::SubscribeSession { id: node });
        server.take_outgoing();
        deliver(server, from, &Message::SubscribeAck { id: node });
        server.take_outgoing();
    }

    fn create_document(server: &mut Server<MemoryStorage>, from: ConnectionId) -> NodeId {
        let root = server.directory().root();
        deliver(
            server,
            from,
            &Message::AddNode {
                id: None,
                parent: root,
                name: "doc".into(),
                node_type: "text".into(),
            },
        );
        let id = server
            .take_outgoing()
            .into_iter()
            .find_map(|(_, bytes)| {
                match Message::from_element(&Element::parse(&bytes).unwrap()).unwrap() {
                    Message::AddNode { id: Some(id), .. } => Some(id),
                    _ => None,
                }
            })
            .expect("add-node broadcast");
        id
    }

    fn join(
        server: &mut Server<MemoryStorage>,
        from: ConnectionId,
        node: NodeId,
        name: &str,
    ) -> Option<UserId> {
        deliver(
            server,
            from,
            &Message::Group {
                node,
                inner: Box::new(Message::UserJoin {
                    id: None,
                    name: name.into(),
                    status: UserStatus::Active,
                    vector: StateVector::new(),
                    caret: 0,
                }),
            },
        );
        sent_to(server, from).into_iter().find_map(|message| {
            match message {
                Message::Group { inner, .. } => match *inner {
                    Message::UserJoin { id, .. } => id,
                    Message::UserRejoin { id, .. } => Some(id),
                    _ => None,
                },
                _ => None,
            }
        })
    }

    #[test]
    fn connections_are_welcomed() {
        let mut server = server();
        let a = open(&mut server, 1);
        let messages = sent_to(&mut server, a);
        assert_eq!(messages, vec![Message::Welcome { version: 1 }]);
    }

    #[test]
    fn subscribe_join_edit_relays_to_other_members() {
        let mut server = server();
        let a = open(&mut server, 1);
        let b = open(&mut server, 2);
        let doc = create_document(&mut server, a);
        subscribe(&mut server, a, doc);
        subscribe(&mut server, b, doc);
        let alice = join(&mut server, a, doc, "alice").expect("join announced");
        server.take_outgoing();

        let edit = OtRequest::make(
            alice,
            StateVector::new(),
            Operation::Insert {
                pos: 0,
                chunk: TextChunk::from_text("UTF-8", "hi", alice),
            },
        );
        deliver(
            &mut server,
            a,
            &Message::Group {
                node: doc,
                inner: Box::new(Message::Request {
                    request: edit.clone(),
                    time: None,
                }),
            },
        );
        let to_b = sent_to(&mut server, b);
        assert_eq!(to_b.len(), 1);
        match &to_b[0] {
            Message::Group { node, inner } => {
                assert_eq!(*node, doc);
                match inner.as_ref() {
                    Message::Request { request, .. } => assert_eq!(*request, edit),
                    other => panic!("unexpected {:?}", other),
                }
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            server.directory().session(doc).unwrap().buffer().text(),
            "hi"
        );
    }

    #[test]
    fn joining_a_missing_document_fails_with_no_such_node() {
        let mut server = server();
        let a = open(&mut server, 1);
        server.take_outgoing();
        // The client tags its request; the failure echoes the tag.
        let mut element = Message::Group {
            node: NodeId::new(99).unwrap(),
            inner: Box::new(Message::UserJoin {
                id: None,
                name: "alice".into(),
                status: UserStatus::Active,
                vector: StateVector::new(),
                caret: 0,
            }),
        }
        .to_element();
        element.attrs.push(("seq".into(), "17".into()));
        server.connection_data(a, &element.to_bytes()).unwrap();
        let (_, bytes) = server.take_outgoing().pop().unwrap();
        let reply = Element::parse(&bytes).unwrap();
        assert_eq!(reply.name, "request-failed");
        assert_eq!(reply.attr_opt("domain"), Some("directory"));
        assert_eq!(reply.attr_opt("code"), Some("4"));
        assert_eq!(reply.attr_opt("seq"), Some("17"));
    }

    #[test]
    fn second_join_with_taken_name_fails_and_leaves_user() {
        let mut server = server();
        let a = open(&mut server, 1);
        let b = open(&mut server, 2);
        let doc = create_document(&mut server, a);
        subscribe(&mut server, a, doc);
        subscribe(&mut server, b, doc);
        let alice = join(&mut server, a, doc, "alice").expect("joined");
        server.take_outgoing();

        deliver(
            &mut server,
            b,
            &Message::Group {
                node: doc,
                inner: Box::new(Message::UserJoin {
                    id: None,
                    name: "alice".into(),
                    status: UserStatus::Active,
                    vector: StateVector::new(),
                    caret: 0,
                }),
            },
        );
        let to_b = sent_to(&mut server, b);
        match &to_b[0] {
            Message::RequestFailed { domain, code, .. } => {
                assert_eq!(domain, "user");
                assert_eq!(*code, 0);
            }
            other => panic!("unexpected {:?}", other),
        }
        let session = server.directory().session(doc).unwrap();
        assert_eq!(session.user(alice).unwrap().status, UserStatus::Active);
    }

    #[test]
    fn sync_sequence_reaches_the_subscriber() {
        let mut server = server();
        let a = open(&mut server, 1);
        let doc = create_document(&mut server, a);
        server.take_outgoing();
        deliver(&mut server, a, &Message::SubscribeSession { id: doc });
        let messages = sent_to(&mut server, a);
        assert!(matches!(messages[0], Message::SubscribeSession { .. }));
        assert!(matches!(
            messages[1],
            Message::Group { ref inner, .. } if matches!(**inner, Message::SyncBegin { .. })
        ));
        assert!(matches!(
            messages.last().unwrap(),
            Message::Group { inner, .. } if matches!(**inner, Message::SyncEnd)
        ));
    }

    #[test]
    fn malformed_bytes_terminate_the_connection() {
        let mut server = server();
        let a = open(&mut server, 1);
        server.take_outgoing();
        let err = server.connection_data(a, b"<a></b>").unwrap_err();
        assert_eq!(err.domain().as_str(), "transport");
        // The connection is gone; further bytes are rejected.
        assert!(server.connection_data(a, b"<welcome/>").is_err());
    }

    #[test]
    fn acl_narrowing_keeps_subscribe_but_blocks_set_acl() {
        use crate::acl::{AclMask, AclSetting, AclSheet, AclSheetSet};
        init_tracing();
        // An admin sheet persisted for the root is loaded at startup.
        let admin = AccountId::new("admin");
        let mut admin_sheet = AclSheetSet::new();
        admin_sheet.insert(
            admin.clone(),
            AclSheet {
                mask: AclMask::all(),
                perms: AclMask::all(),
            },
        );
        let mut storage = MemoryStorage::new();
        storage.write_acl("", &admin_sheet).unwrap();
        let mut server = Server::new(Some(storage), ServerConfig::default());
        let root = server.directory().root();
        let a = open(&mut server, 1);
        let doc = create_document(&mut server, a);
        server.take_outgoing();

        // The admin narrows the root default sheet to
        // subscribe-session only.
        let mut narrowed = AclSheetSet::new();
        narrowed.insert(
            AccountId::default_account(),
            AclSheet {
                mask: AclMask::all(),
                perms: AclMask::of(&[AclSetting::CanSubscribeSession]),
            },
        );
        server.directory_mut().set_acl(&admin, root, &narrowed).unwrap();

        // Subscribing as the default account still works.
        subscribe(&mut server, a, doc);
        assert!(server
            .directory()
            .session(doc)
            .unwrap()
            .group()
            .contains(a));

        // A set-acl from the same connection is refused.
        deliver(
            &mut server,
            a,
            &Message::SetAcl {
                id: root,
                sheets: narrowed,
            },
        );
        let to_a = sent_to(&mut server, a);
        match &to_a[0] {
            Message::RequestFailed { domain, code, .. } => {
                assert_eq!(domain, "authentication");
                assert_eq!(*code, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let mut server = server();
        let a = open(&mut server, 1);
        server.take_outgoing();
        deliver(&mut server, a, &Message::Welcome { version: 2 });
        let to_a = sent_to(&mut server, a);
        match &to_a[0] {
            Message::RequestFailed { domain, code, .. } => {
                assert_eq!(domain, "directory");
                assert_eq!(*code, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn dropping_a_connection_marks_its_users_unavailable() {
        let mut server = server();
        let a = open(&mut server, 1);
        let doc = create_document(&mut server, a);
        subscribe(&mut server, a, doc);
        let alice = join(&mut server, a, doc, "alice").expect("joined");
        server.connection_closed(a);
        let session = server.directory().session(doc).unwrap();
        assert_eq!(
            session.user(alice).unwrap().status,
            UserStatus::Unavailable
        );
        assert!(session.group().is_empty());
    }
}

//! The server-side node tree that hosts sessions.
//!
//! The directory owns nodes and sessions by id and hands out ids, not
//! references: sessions know their node id, connections know the node
//! ids they subscribed to, and look-ups fail gracefully once a target
//! is gone. Every operation is gated by an ACL check against the
//! calling connection's account.
use crate::account::{Account, AccountId, AccountTable};
use crate::acl::{AclMask, AclSetting, AclSheet, AclSheetSet};
use crate::error::{AuthError, DirectoryError, Error};
use crate::group::MessageSink;
use crate::id::{ConnectionId, NodeId};
use crate::observe::{ObserverList, Subscription};
use crate::proto::Message;
use crate::session::{Session, SessionConfig, SessionSnapshot, UserParams};
use crate::storage::Storage;
use crate::user::User;
use fnv::FnvHashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use vellum_ot::Request as OtRequest;

/// What a node is.
#[derive(Clone, Debug)]
pub enum NodeKind {
    /// An inner node holding children.
    Subdirectory {
        /// Whether the child list has been populated.
        explored: bool,
        /// Child ids in creation order.
        children: Vec<NodeId>,
    },
    /// A document node that can host a session.
    Leaf {
        /// Plugin type of the document.
        node_type: String,
    },
}

/// One node of the directory tree.
#[derive(Clone, Debug)]
pub struct Node {
    /// The node's id, stable for the process lifetime.
    pub id: NodeId,
    /// Parent id; `None` only for the root.
    pub parent: Option<NodeId>,
    /// Name within the parent, unique among siblings.
    pub name: String,
    /// Subdirectory or leaf.
    pub kind: NodeKind,
    /// The sheets stored locally at this node.
    pub acl: AclSheetSet,
}

impl Node {
    /// Returns whether the node is a subdirectory.
    pub fn is_subdirectory(&self) -> bool {
        matches!(self.kind, NodeKind::Subdirectory { .. })
    }

    /// The leaf's plugin type, if the node is a leaf.
    pub fn node_type(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Leaf { node_type } => Some(node_type),
            NodeKind::Subdirectory { .. } => None,
        }
    }

    fn wire_type(&self) -> String {
        self.node_type().unwrap_or("subdirectory").to_string()
    }
}

/// Directory-level events delivered to observers.
#[derive(Debug)]
pub enum DirEvent {
    /// A node was created.
    NodeAdded {
        /// The new node's id.
        id: NodeId,
    },
    /// A node and its subtree were removed.
    NodeRemoved {
        /// The removed node's id.
        id: NodeId,
    },
    /// A node's ACL changed.
    AclChanged {
        /// The node.
        id: NodeId,
    },
    /// An account was added.
    AccountAdded {
        /// The account.
        account: Account,
    },
    /// An account was removed.
    AccountRemoved {
        /// Id of the removed account.
        id: AccountId,
    },
}

#[derive(Debug)]
struct DirRequestState {
    node: Option<NodeId>,
    total: Option<u32>,
    current: u32,
    outcome: Option<Result<(), Error>>,
}

/// Handle onto one directory operation.
///
/// Progress becomes observable once the operation has announced its
/// total; the outcome is delivered exactly once, later completions or
/// failures of an already-finished request are silently dropped.
#[derive(Clone, Debug)]
pub struct DirRequest {
    inner: Arc<Mutex<DirRequestState>>,
}

impl DirRequest {
    fn new(node: Option<NodeId>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(DirRequestState {
                node,
                total: None,
                current: 0,
                outcome: None,
            })),
        }
    }

    /// The node the request operates on.
    pub fn node(&self) -> Option<NodeId> {
        self.inner.lock().node
    }

    /// Progress as (current, total), once initiated.
    pub fn progress(&self) -> Option<(u32, u32)> {
        let state = self.inner.lock();
        state.total.map(|total| (state.current, total))
    }

    /// The final outcome, once finished.
    pub fn outcome(&self) -> Option<Result<(), Error>> {
        self.inner.lock().outcome.clone()
    }

    /// Returns whether the request has finished.
    pub fn is_finished(&self) -> bool {
        self.inner.lock().outcome.is_some()
    }

    fn initiated(&self, total: u32) {
        self.inner.lock().total = Some(total);
    }

    fn advance(&self) {
        self.inner.lock().current += 1;
    }

    fn finish(&self) {
        let mut state = self.inner.lock();
        if state.outcome.is_none() {
            state.outcome = Some(Ok(()));
        }
    }

    pub(crate) fn fail(&self, error: Error) {
        let mut state = self.inner.lock();
        if state.outcome.is_none() {
            state.outcome = Some(Err(error));
        }
    }
}

/// Tunables of the directory.
#[derive(Clone, Debug)]
pub struct DirectoryConfig {
    /// Leaf types the server accepts; the plugin registry decides
    /// which documents can be hosted.
    pub plugins: Vec<String>,
    /// Configuration applied to every hosted session.
    pub session: SessionConfig,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            plugins: vec!["text".to_string()],
            session: SessionConfig::default(),
        }
    }
}

/// The server's directory of nodes and hosted sessions.
pub struct Directory<S> {
    storage: Option<S>,
    config: DirectoryConfig,
    nodes: FnvHashMap<NodeId, Node>,
    root: NodeId,
    next_node_id: u32,
    sessions: FnvHashMap<NodeId, Session>,
    accounts: AccountTable,
    pending: Vec<DirRequest>,
    events: ObserverList<DirEvent>,
}

impl<S: Storage> Directory<S> {
    /// Creates a directory with a fresh root node. The root carries a
    /// total default sheet so every permission resolves without
    /// falling through to the compiled-in default; sheets persisted
    /// for the root are merged on top.
    pub fn new(storage: Option<S>, config: DirectoryConfig) -> Self {
        let root = NodeId::new(1).expect("node ids start at 1");
        let mut root_acl = AclSheetSet::new();
        root_acl.insert(
            AccountId::default_account(),
            AclSheet {
                mask: AclMask::all(),
                perms: AclMask::default_perms(),
            },
        );
        if let Some(storage) = &storage {
            match storage.read_acl("") {
                Ok(stored) => root_acl.merge(&stored),
                Err(err) => tracing::warn!("could not read the root ACL: {}", err),
            }
        }
        let mut nodes = FnvHashMap::default();
        nodes.insert(
            root,
            Node {
                id: root,
                parent: None,
                name: String::new(),
                kind: NodeKind::Subdirectory {
                    explored: false,
                    children: Vec::new(),
                },
                acl: root_acl,
            },
        );
        Self {
            storage,
            config,
            nodes,
            root,
            next_node_id: 2,
            sessions: FnvHashMap::default(),
            accounts: AccountTable::new(),
            pending: Vec::new(),
            events: ObserverList::new(),
        }
    }

    /// The root node's id.
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Looks up a node.
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    /// The session hosted at a leaf, if one is loaded.
    pub fn session(&self, id: NodeId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    /// The session hosted at a leaf, mutably.
    pub fn session_mut(&mut self, id: NodeId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    /// Registers an observer for directory events.
    pub fn observe(&self, observer: impl FnMut(&DirEvent) + Send + 'static) -> Subscription {
        self.events.subscribe(observer)
    }

    /// The slash-separated path of a node; the root is the empty
    /// path.
    pub fn path(&self, id: NodeId) -> Result<String, Error> {
        let mut segments = Vec::new();
        let mut cursor = self.existing(id)?;
        while let Some(parent) = cursor.parent {
            segments.push(cursor.name.as_str());
            cursor = self.existing(parent)?;
        }
        segments.reverse();
        Ok(segments.join("/"))
    }

    /// Resolves a slash-separated path to a node id, considering only
    /// nodes already present in memory.
    pub fn lookup(&self, path: &str) -> Option<NodeId> {
        let mut cursor = self.root;
        for segment in path.split('/').filter(|segment| !segment.is_empty()) {
            let node = self.nodes.get(&cursor)?;
            let NodeKind::Subdirectory { children, .. } = &node.kind else {
                return None;
            };
            cursor = *children.iter().find(|child| {
                self.nodes
                    .get(child)
                    .map(|child| child.name == segment)
                    .unwrap_or(false)
            })?;
        }
        Some(cursor)
    }

    /// Evaluates whether `account` holds `setting` at `node`: walk
    /// from the node to the root, the first sheet (account-specific
    /// before default) whose mask defines the bit wins; without any,
    /// the compiled-in default applies.
    pub fn check_permission(
        &self,
        account: &AccountId,
        node: NodeId,
        setting: AclSetting,
    ) -> Result<bool, Error> {
        let mut cursor = Some(self.existing(node)?);
        while let Some(current) = cursor {
            if let Some(sheet) = current.acl.find(account) {
                if let Some(granted) = sheet.lookup(setting) {
                    return Ok(granted);
                }
            }
            if !account.is_default() {
                if let Some(sheet) = current.acl.find(&AccountId::default_account()) {
                    if let Some(granted) = sheet.lookup(setting) {
                        return Ok(granted);
                    }
                }
            }
            cursor = match current.parent {
                Some(parent) => Some(self.existing(parent)?),
                None => None,
            };
        }
        Ok(AclMask::default_perms().has(setting))
    }

    fn acl_check(
        &self,
        account: &AccountId,
        node: NodeId,
        setting: AclSetting,
    ) -> Result<(), Error> {
        if self.check_permission(account, node, setting)? {
            Ok(())
        } else {
            Err(AuthError::NotAuthorised.into())
        }
    }

    /// Populates and reports the child list of a subdirectory.
    ///
    /// Children already in memory and children found in storage are
    /// merged; exploring twice is an error. Returns the request
    /// handle and the `explore-begin`/`add-node`/`explore-end`
    /// message sequence for the exploring connection.
    pub fn explore(
        &mut self,
        account: &AccountId,
        id: NodeId,
    ) -> Result<(DirRequest, Vec<Message>), Error> {
        self.acl_check(account, id, AclSetting::CanExploreNode)?;
        let node = self.existing(id)?;
        let NodeKind::Subdirectory { explored, .. } = &node.kind else {
            return Err(DirectoryError::NotSubdirectory(id.get()).into());
        };
        if *explored {
            return Err(DirectoryError::AlreadyExplored(id.get()).into());
        }
        let path = self.path(id)?;
        let stored = match &self.storage {
            Some(storage) => storage.read_subdirectory(&path)?,
            None => Vec::new(),
        };
        for entry in stored {
            if self.child_by_name(id, &entry.name).is_some() {
                continue;
            }
            let kind = match entry.node_type {
                None => NodeKind::Subdirectory {
                    explored: false,
                    children: Vec::new(),
                },
                Some(node_type) => NodeKind::Leaf { node_type },
            };
            let acl = match &self.storage {
                Some(storage) => {
                    storage.read_acl(&join_path(&path, &entry.name))?
                }
                None => AclSheetSet::new(),
            };
            self.insert_node(id, entry.name, kind, acl)?;
        }
        let node = self.nodes.get_mut(&id).expect("node exists");
        let NodeKind::Subdirectory { explored, children } = &mut node.kind else {
            unreachable!("checked above");
        };
        *explored = true;
        let children = children.clone();

        let request = DirRequest::new(Some(id));
        request.initiated(children.len() as u32);
        let mut messages = Vec::with_capacity(children.len() + 2);
        messages.push(Message::ExploreBegin {
            total: children.len() as u32,
        });
        for child in children {
            let node = self.existing(child)?;
            messages.push(Message::AddNode {
                id: Some(node.id),
                parent: id,
                name: node.name.clone(),
                node_type: node.wire_type(),
            });
            request.advance();
        }
        messages.push(Message::ExploreEnd);
        request.finish();
        Ok((request, messages))
    }

    /// Creates a subdirectory node.
    pub fn add_subdirectory(
        &mut self,
        account: &AccountId,
        parent: NodeId,
        name: &str,
        acl: Option<AclSheetSet>,
    ) -> Result<NodeId, Error> {
        self.acl_check(account, parent, AclSetting::CanAddSubdirectory)?;
        if acl.is_some() {
            self.acl_check(account, parent, AclSetting::CanSetAcl)?;
        }
        self.check_new_child(parent, name)?;
        let path = join_path(&self.path(parent)?, name);
        if let Some(storage) = &mut self.storage {
            storage.create_subdirectory(&path)?;
            if let Some(acl) = &acl {
                storage.write_acl(&path, acl)?;
            }
        }
        let id = self.insert_node(
            parent,
            name.to_string(),
            NodeKind::Subdirectory {
                // Freshly created, so there is nothing to explore.
                explored: true,
                children: Vec::new(),
            },
            acl.unwrap_or_default(),
        )?;
        Ok(id)
    }

    /// Creates a document node and hosts a session for it.
    pub fn add_document(
        &mut self,
        account: &AccountId,
        parent: NodeId,
        name: &str,
        node_type: &str,
        initial: Option<SessionSnapshot>,
        acl: Option<AclSheetSet>,
    ) -> Result<NodeId, Error> {
        self.acl_check(account, parent, AclSetting::CanAddDocument)?;
        if initial.is_some() {
            self.acl_check(account, parent, AclSetting::CanSyncIn)?;
        }
        if acl.is_some() {
            self.acl_check(account, parent, AclSetting::CanSetAcl)?;
        }
        if !self.config.plugins.iter().any(|plugin| plugin == node_type) {
            return Err(DirectoryError::UnknownType(node_type.to_string()).into());
        }
        self.check_new_child(parent, name)?;
        let session = match initial {
            Some(snapshot) => Session::from_snapshot(self.config.session.clone(), snapshot),
            None => Session::new(self.config.session.clone()),
        };
        let path = join_path(&self.path(parent)?, name);
        if let Some(storage) = &mut self.storage {
            storage.write_session(node_type, &path, &session.snapshot())?;
            if let Some(acl) = &acl {
                storage.write_acl(&path, acl)?;
            }
        }
        let id = self.insert_node(
            parent,
            name.to_string(),
            NodeKind::Leaf {
                node_type: node_type.to_string(),
            },
            acl.unwrap_or_default(),
        )?;
        self.sessions.insert(id, session);
        Ok(id)
    }

    /// Removes a node, recursively for subdirectories. Hosted
    /// sessions are closed and their final state persisted; pending
    /// requests on removed nodes fail as soon as the removal commits.
    pub fn remove_node(&mut self, account: &AccountId, id: NodeId) -> Result<(), Error> {
        if id == self.root {
            return Err(DirectoryError::RootRemoveAttempt.into());
        }
        self.acl_check(account, id, AclSetting::CanRemoveNode)?;
        let node = self.existing(id)?;
        let parent = node.parent;
        let node_type = node.node_type().map(str::to_string);
        let path = self.path(id)?;

        let mut subtree = Vec::new();
        self.collect_subtree(id, &mut subtree);
        for request in &self.pending {
            if let Some(node) = request.node() {
                if subtree.contains(&node) {
                    request.fail(DirectoryError::no_such_node(node).into());
                }
            }
        }
        self.pending.retain(|request| !request.is_finished());
        for removed in &subtree {
            if let Some(mut session) = self.sessions.remove(removed) {
                session.close();
            }
        }
        if let Some(storage) = &mut self.storage {
            storage.remove_node(node_type.as_deref(), &path)?;
        }
        for removed in &subtree {
            self.nodes.remove(removed);
        }
        if let Some(parent) = parent {
            if let Some(Node {
                kind: NodeKind::Subdirectory { children, .. },
                ..
            }) = self.nodes.get_mut(&parent)
            {
                children.retain(|child| *child != id);
            }
        }
        self.events.emit(&DirEvent::NodeRemoved { id });
        Ok(())
    }

    /// Starts a subscription: loads the session if necessary and
    /// returns the pending request handle together with the
    /// subscribe and synchronization messages for the connection. The
    /// connection joins the group when it acknowledges with
    /// [`subscribe_ack`](Self::subscribe_ack).
    pub fn subscribe_session(
        &mut self,
        account: &AccountId,
        id: NodeId,
        connection: ConnectionId,
    ) -> Result<(DirRequest, Vec<Message>), Error> {
        self.acl_check(account, id, AclSetting::CanSubscribeSession)?;
        let node = self.existing(id)?;
        let Some(node_type) = node.node_type().map(str::to_string) else {
            return Err(DirectoryError::NotLeaf(id.get()).into());
        };
        if let Some(session) = self.sessions.get(&id) {
            if session.group().contains(connection) {
                return Err(DirectoryError::AlreadySubscribed(id.get()).into());
            }
        }
        if !self.sessions.contains_key(&id) {
            let path = self.path(id)?;
            let Some(storage) = &self.storage else {
                return Err(DirectoryError::NoStorage.into());
            };
            let snapshot = storage.read_session(&node_type, &path)?;
            self.sessions.insert(
                id,
                Session::from_snapshot(self.config.session.clone(), snapshot),
            );
        }
        let session = self.sessions.get(&id).expect("session just ensured");
        let mut messages = vec![Message::SubscribeSession { id }];
        messages.extend(session.sync_messages());
        let request = DirRequest::new(Some(id));
        self.pending.push(request.clone());
        Ok((request, messages))
    }

    /// Completes a subscription after the connection has received the
    /// synchronization. Fails with the pending failure if the node
    /// was removed in between.
    pub fn subscribe_ack(
        &mut self,
        request: &DirRequest,
        connection: ConnectionId,
    ) -> Result<(), Error> {
        if let Some(outcome) = request.outcome() {
            self.pending.retain(|pending| !pending.is_finished());
            return outcome;
        }
        let Some(id) = request.node() else {
            return Err(DirectoryError::Failed("request has no node".into()).into());
        };
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or_else(|| DirectoryError::no_such_node(id))?;
        session.group_mut().add(connection);
        request.finish();
        self.pending.retain(|pending| !pending.is_finished());
        Ok(())
    }

    /// Removes a connection from a session's group.
    pub fn unsubscribe(&mut self, id: NodeId, connection: ConnectionId) -> Result<(), Error> {
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or_else(|| DirectoryError::no_such_node(id))?;
        if !session.group_mut().remove(connection) {
            return Err(DirectoryError::NotSubscribed(id.get()).into());
        }
        Ok(())
    }

    /// Joins a user into the session at `id` on behalf of a
    /// subscribed connection.
    pub fn join_user(
        &mut self,
        account: &AccountId,
        id: NodeId,
        params: UserParams,
    ) -> Result<(User, bool), Error> {
        self.acl_check(account, id, AclSetting::CanJoinUser)?;
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or_else(|| DirectoryError::no_such_node(id))?;
        if let Some(connection) = params.connection {
            if !session.group().contains(connection) {
                return Err(DirectoryError::NotSubscribed(id.get()).into());
            }
        }
        session.join_user(params)
    }

    /// Feeds a session request from a subscribed connection into the
    /// engine and relays the original to the other members. An engine
    /// error drops the offending subscription, per the failure model.
    pub fn receive_request(
        &mut self,
        id: NodeId,
        request: OtRequest,
        from: Option<ConnectionId>,
        sink: &mut dyn MessageSink,
    ) -> Result<Option<OtRequest>, Error> {
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or_else(|| DirectoryError::no_such_node(id))?;
        if let Some(connection) = from {
            if !session.group().contains(connection) {
                return Err(DirectoryError::NotSubscribed(id.get()).into());
            }
        }
        let wire = Message::Request {
            request: request.clone(),
            time: None,
        };
        match session.receive_request(request, from) {
            Ok(Some(applied)) => {
                session.group().relay(from, &wire, sink);
                Ok(Some(applied))
            }
            Ok(None) => Ok(None),
            Err(err) => {
                if matches!(err, Error::Ot(_)) {
                    if let Some(connection) = from {
                        session.leave_connection(connection);
                    }
                }
                Err(err)
            }
        }
    }

    /// Marks a dropped connection's users unavailable in every hosted
    /// session and removes it from all groups.
    pub fn connection_closed(&mut self, connection: ConnectionId) {
        for session in self.sessions.values_mut() {
            session.leave_connection(connection);
        }
    }

    /// Writes the current snapshot of the session at `id` to storage.
    pub fn save_session(&mut self, id: NodeId) -> Result<(), Error> {
        let node = self.existing(id)?;
        let Some(node_type) = node.node_type().map(str::to_string) else {
            return Err(DirectoryError::NotLeaf(id.get()).into());
        };
        let path = self.path(id)?;
        let snapshot = self
            .sessions
            .get(&id)
            .ok_or_else(|| DirectoryError::no_such_node(id))?
            .snapshot();
        let Some(storage) = &mut self.storage else {
            return Err(DirectoryError::NoStorage.into());
        };
        storage.write_session(&node_type, &path, &snapshot)
    }

    /// Ids of loaded sessions whose buffers changed since their last
    /// save. Clears the flags.
    pub fn take_dirty_sessions(&mut self) -> Vec<NodeId> {
        let mut dirty = Vec::new();
        for (id, session) in self.sessions.iter_mut() {
            if session.take_dirty() {
                dirty.push(*id);
            }
        }
        dirty
    }

    /// Reports the account list as a message sequence.
    pub fn query_account_list(
        &self,
        account: &AccountId,
    ) -> Result<Vec<Message>, Error> {
        self.acl_check(account, self.root, AclSetting::CanQueryAccountList)?;
        let mut messages = Vec::with_capacity(self.accounts.len() + 2);
        messages.push(Message::AclAccountListBegin {
            total: self.accounts.len() as u32,
        });
        for entry in self.accounts.iter() {
            messages.push(Message::AddAclAccount {
                account: entry.clone(),
            });
        }
        messages.push(Message::AclAccountListEnd);
        Ok(messages)
    }

    /// Adds an account.
    pub fn add_account(&mut self, account: &AccountId, new: Account) -> Result<(), Error> {
        self.acl_check(account, self.root, AclSetting::CanCreateAccount)?;
        self.accounts.add(new.clone());
        self.events.emit(&DirEvent::AccountAdded { account: new });
        Ok(())
    }

    /// Removes an account.
    pub fn remove_account(&mut self, account: &AccountId, id: &AccountId) -> Result<(), Error> {
        self.acl_check(account, self.root, AclSetting::CanRemoveAccount)?;
        if !self.accounts.remove(id) {
            return Err(DirectoryError::Failed(format!("no account {}", id)).into());
        }
        self.events
            .emit(&DirEvent::AccountRemoved { id: id.clone() });
        Ok(())
    }

    /// Reports the sheets stored at a node.
    pub fn query_acl(&self, account: &AccountId, id: NodeId) -> Result<Message, Error> {
        self.acl_check(account, id, AclSetting::CanQueryAcl)?;
        let node = self.existing(id)?;
        Ok(Message::Acl {
            id,
            sheets: node.acl.clone(),
        })
    }

    /// Merges a sheet set into a node's ACL. A sheet with an empty
    /// mask clears the stored sheet for its account.
    pub fn set_acl(
        &mut self,
        account: &AccountId,
        id: NodeId,
        sheets: &AclSheetSet,
    ) -> Result<(), Error> {
        self.acl_check(account, id, AclSetting::CanSetAcl)?;
        let path = self.path(id)?;
        let node = self.nodes.get_mut(&id).ok_or_else(|| {
            Error::from(DirectoryError::no_such_node(id))
        })?;
        node.acl.merge(sheets);
        let stored = node.acl.clone();
        if let Some(storage) = &mut self.storage {
            storage.write_acl(&path, &stored)?;
        }
        self.events.emit(&DirEvent::AclChanged { id });
        Ok(())
    }

    fn existing(&self, id: NodeId) -> Result<&Node, Error> {
        self.nodes
            .get(&id)
            .ok_or_else(|| DirectoryError::no_such_node(id).into())
    }

    fn child_by_name(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        let node = self.nodes.get(&parent)?;
        let NodeKind::Subdirectory { children, .. } = &node.kind else {
            return None;
        };
        children
            .iter()
            .copied()
            .find(|child| {
                self.nodes
                    .get(child)
                    .map(|child| child.name == name)
                    .unwrap_or(false)
            })
    }

    fn check_new_child(&self, parent: NodeId, name: &str) -> Result<(), Error> {
        let node = self.existing(parent)?;
        if !node.is_subdirectory() {
            return Err(DirectoryError::NotSubdirectory(parent.get()).into());
        }
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(DirectoryError::InvalidName(name.to_string()).into());
        }
        if self.child_by_name(parent, name).is_some() {
            return Err(DirectoryError::NodeExists(name.to_string()).into());
        }
        Ok(())
    }

    fn insert_node(
        &mut self,
        parent: NodeId,
        name: String,
        kind: NodeKind,
        acl: AclSheetSet,
    ) -> Result<NodeId, Error> {
        let id = NodeId::new(self.next_node_id)
            .ok_or_else(|| DirectoryError::Failed("node id space exhausted".into()))?;
        self.next_node_id += 1;
        self.nodes.insert(
            id,
            Node {
                id,
                parent: Some(parent),
                name,
                kind,
                acl,
            },
        );
        if let Some(Node {
            kind: NodeKind::Subdirectory { children, .. },
            ..
        }) = self.nodes.get_mut(&parent)
        {
            children.push(id);
        }
        self.events.emit(&DirEvent::NodeAdded { id });
        Ok(id)
    }

    fn collect_subtree(&self, id: NodeId, out: &mut Vec<NodeId>) {
        out.push(id);
        if let Some(Node {
            kind: NodeKind::Subdirectory { children, .. },
            ..
        }) = self.nodes.get(&id)
        {
            for child in children {
                self.collect_subtree(*child, out);
            }
        }
    }
}

impl<S> std::fmt::Debug for Directory<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Directory")
            .field("nodes", &self.nodes.len())
            .field("sessions", &self.sessions.len())
            .field("accounts", &self.accounts.len())
            .finish_non_exhaustive()
    }
}

/// Joins a parent path and a child name.
fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::user::UserStatus;
    use vellum_ot::{Operation, StateVector, TextChunk};

    fn directory() -> Directory<MemoryStorage> {
        Directory::new(Some(MemoryStorage::new()), DirectoryConfig::default())
    }

    fn admin() -> AccountId {
        // Grants administration by a root sheet in admin_directory().
        AccountId::new("admin")
    }

    fn admin_directory() -> Directory<MemoryStorage> {
        let mut directory = directory();
        let root = directory.root();
        let mut sheets = AclSheetSet::new();
        sheets.insert(
            admin(),
            AclSheet {
                mask: AclMask::all(),
                perms: AclMask::all(),
            },
        );
        let node = directory.nodes.get_mut(&root).unwrap();
        node.acl.merge(&sheets);
        directory
    }

    fn join_params(name: &str, connection: ConnectionId) -> UserParams {
        UserParams {
            name: name.to_string(),
            status: UserStatus::Active,
            caret: 0,
            account: AccountId::default_account(),
            connection: Some(connection),
            vector: StateVector::new(),
            local: false,
        }
    }

    fn subscribe(
        directory: &mut Directory<MemoryStorage>,
        id: NodeId,
        connection: ConnectionId,
    ) -> DirRequest {
        let (request, _) = directory
            .subscribe_session(&AccountId::default_account(), id, connection)
            .unwrap();
        directory.subscribe_ack(&request, connection).unwrap();
        request
    }

    #[test]
    fn node_ids_are_monotonic_and_names_unique() {
        let mut directory = directory();
        let root = directory.root();
        let account = AccountId::default_account();
        let a = directory
            .add_subdirectory(&account, root, "a", None)
            .unwrap();
        let b = directory
            .add_subdirectory(&account, root, "b", None)
            .unwrap();
        assert!(a < b);
        assert_eq!(
            directory
                .add_subdirectory(&account, root, "a", None)
                .unwrap_err(),
            Error::Directory(DirectoryError::NodeExists("a".into()))
        );
        assert_eq!(
            directory
                .add_subdirectory(&account, root, "x/y", None)
                .unwrap_err(),
            Error::Directory(DirectoryError::InvalidName("x/y".into()))
        );
        assert!(matches!(
            directory.add_subdirectory(&account, root, "..", None),
            Err(Error::Directory(DirectoryError::InvalidName(_)))
        ));
        assert_eq!(directory.path(a).unwrap(), "a");
        assert_eq!(directory.lookup("a"), Some(a));
        assert_eq!(directory.lookup("zzz"), None);
    }

    #[test]
    fn joining_a_missing_document_reports_no_such_node() {
        let mut directory = directory();
        let ghost = NodeId::new(777).unwrap();
        let err = directory
            .join_user(
                &AccountId::default_account(),
                ghost,
                join_params("alice", ConnectionId(1)),
            )
            .unwrap_err();
        assert_eq!(err, Error::Directory(DirectoryError::NoSuchNode(777)));
        assert_eq!(err.domain().as_str(), "directory");
        assert_eq!(err.code(), 4);
    }

    #[test]
    fn explore_is_lazy_and_only_once() {
        let mut directory = directory();
        let root = directory.root();
        let account = AccountId::default_account();
        directory
            .add_subdirectory(&account, root, "docs", None)
            .unwrap();
        let (request, messages) = directory.explore(&account, root).unwrap();
        assert_eq!(request.progress(), Some((1, 1)));
        assert!(request.is_finished());
        assert!(matches!(messages[0], Message::ExploreBegin { total: 1 }));
        assert!(matches!(messages[1], Message::AddNode { .. }));
        assert!(matches!(messages[2], Message::ExploreEnd));
        assert_eq!(
            directory.explore(&account, root).unwrap_err(),
            Error::Directory(DirectoryError::AlreadyExplored(root.get()))
        );
    }

    #[test]
    fn explore_merges_storage_children() {
        let mut storage = MemoryStorage::new();
        storage.create_subdirectory("archive").unwrap();
        let mut directory =
            Directory::new(Some(storage), DirectoryConfig::default());
        let account = AccountId::default_account();
        let (_, messages) = directory.explore(&account, directory.root()).unwrap();
        assert_eq!(messages.len(), 3);
        assert!(directory.lookup("archive").is_some());
    }

    #[test]
    fn documents_host_sessions_and_persist() {
        let mut directory = directory();
        let root = directory.root();
        let account = AccountId::default_account();
        let doc = directory
            .add_document(&account, root, "readme", "text", None, None)
            .unwrap();
        assert!(directory.session(doc).is_some());
        assert_eq!(
            directory
                .add_document(&account, root, "weird", "spreadsheet", None, None)
                .unwrap_err(),
            Error::Directory(DirectoryError::UnknownType("spreadsheet".into()))
        );

        subscribe(&mut directory, doc, ConnectionId(1));
        let (user, _) = directory
            .join_user(&account, doc, join_params("alice", ConnectionId(1)))
            .unwrap();
        let mut sent = Vec::new();
        let mut sink = |to: ConnectionId, message: &Message| sent.push((to, message.clone()));
        directory
            .receive_request(
                doc,
                OtRequest::make(
                    user.id,
                    StateVector::new(),
                    Operation::Insert {
                        pos: 0,
                        chunk: TextChunk::from_text("UTF-8", "saved", user.id),
                    },
                ),
                Some(ConnectionId(1)),
                &mut sink,
            )
            .unwrap();
        // Only the originator is subscribed, so nothing is relayed.
        assert!(sent.is_empty());
        assert_eq!(directory.take_dirty_sessions(), vec![doc]);
        directory.save_session(doc).unwrap();
        let path = directory.path(doc).unwrap();
        let stored = directory
            .storage
            .as_ref()
            .unwrap()
            .read_session("text", &path)
            .unwrap();
        assert_eq!(stored.buffer.text(), "saved");
    }

    #[test]
    fn relay_reaches_other_members_in_order() {
        let mut directory = directory();
        let root = directory.root();
        let account = AccountId::default_account();
        let doc = directory
            .add_document(&account, root, "shared", "text", None, None)
            .unwrap();
        subscribe(&mut directory, doc, ConnectionId(1));
        subscribe(&mut directory, doc, ConnectionId(2));
        let (user, _) = directory
            .join_user(&account, doc, join_params("alice", ConnectionId(1)))
            .unwrap();
        let mut sent = Vec::new();
        let mut sink = |to: ConnectionId, message: &Message| sent.push((to, message.clone()));
        directory
            .receive_request(
                doc,
                OtRequest::make(
                    user.id,
                    StateVector::new(),
                    Operation::Insert {
                        pos: 0,
                        chunk: TextChunk::from_text("UTF-8", "x", user.id),
                    },
                ),
                Some(ConnectionId(1)),
                &mut sink,
            )
            .unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, ConnectionId(2));
        assert!(matches!(sent[0].1, Message::Request { .. }));
    }

    #[test]
    fn removal_fails_pending_subscriptions() {
        let mut directory = admin_directory();
        let root = directory.root();
        let account = AccountId::default_account();
        let doc = directory
            .add_document(&account, root, "doomed", "text", None, None)
            .unwrap();
        let (request, _) = directory
            .subscribe_session(&account, doc, ConnectionId(1))
            .unwrap();
        // The removal commits while the subscription is in flight.
        directory.remove_node(&admin(), doc).unwrap();
        let err = directory
            .subscribe_ack(&request, ConnectionId(1))
            .unwrap_err();
        assert_eq!(err, Error::Directory(DirectoryError::NoSuchNode(doc.get())));
        assert!(directory.node(doc).is_none());
    }

    #[test]
    fn root_cannot_be_removed() {
        let mut directory = admin_directory();
        let root = directory.root();
        assert_eq!(
            directory.remove_node(&admin(), root).unwrap_err(),
            Error::Directory(DirectoryError::RootRemoveAttempt)
        );
    }

    #[test]
    fn removal_is_recursive_and_closes_sessions() {
        let mut directory = admin_directory();
        let root = directory.root();
        let account = AccountId::default_account();
        let sub = directory
            .add_subdirectory(&account, root, "project", None)
            .unwrap();
        let doc = directory
            .add_document(&account, sub, "notes", "text", None, None)
            .unwrap();
        directory.remove_node(&admin(), sub).unwrap();
        assert!(directory.node(sub).is_none());
        assert!(directory.node(doc).is_none());
        assert!(directory.session(doc).is_none());
        assert!(directory
            .storage
            .as_ref()
            .unwrap()
            .read_subdirectory("")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn acl_walk_and_set_acl_authorisation() {
        // Scenario: the root's default sheet is narrowed to subscribe
        // only; subscribing still works for the default account while
        // a subsequent set-acl is refused.
        let mut directory = admin_directory();
        let root = directory.root();
        let account = AccountId::default_account();
        let doc = directory
            .add_document(&account, root, "doc", "text", None, None)
            .unwrap();
        let mut narrowed = AclSheetSet::new();
        narrowed.insert(
            AccountId::default_account(),
            AclSheet {
                mask: AclMask::all(),
                perms: AclMask::of(&[AclSetting::CanSubscribeSession]),
            },
        );
        directory.set_acl(&admin(), root, &narrowed).unwrap();

        let (request, _) = directory
            .subscribe_session(&account, doc, ConnectionId(1))
            .unwrap();
        directory.subscribe_ack(&request, ConnectionId(1)).unwrap();

        let err = directory.set_acl(&account, root, &narrowed).unwrap_err();
        assert_eq!(err, Error::Authentication(AuthError::NotAuthorised));
        // And adding nodes is gone too.
        assert!(directory
            .add_subdirectory(&account, root, "nope", None)
            .is_err());
    }

    #[test]
    fn specific_sheet_beats_default_and_inherits_down() {
        let mut directory = admin_directory();
        let root = directory.root();
        let account = AccountId::default_account();
        let sub = directory
            .add_subdirectory(&account, root, "area", None)
            .unwrap();
        // alice is banned from exploring anywhere via a root sheet.
        let mut sheets = AclSheetSet::new();
        sheets.insert(
            AccountId::new("alice"),
            AclSheet {
                mask: AclMask::of(&[AclSetting::CanExploreNode]),
                perms: AclMask::EMPTY,
            },
        );
        directory.set_acl(&admin(), root, &sheets).unwrap();
        assert!(!directory
            .check_permission(&AccountId::new("alice"), sub, AclSetting::CanExploreNode)
            .unwrap());
        // Everyone else falls through to the default sheet.
        assert!(directory
            .check_permission(&AccountId::new("bob"), sub, AclSetting::CanExploreNode)
            .unwrap());
        // A node-local sheet for alice overrides the root ban.
        let mut local = AclSheetSet::new();
        local.insert(
            AccountId::new("alice"),
            AclSheet {
                mask: AclMask::of(&[AclSetting::CanExploreNode]),
                perms: AclMask::of(&[AclSetting::CanExploreNode]),
            },
        );
        directory.set_acl(&admin(), sub, &local).unwrap();
        assert!(directory
            .check_permission(&AccountId::new("alice"), sub, AclSetting::CanExploreNode)
            .unwrap());
    }

    #[test]
    fn account_management_is_gated() {
        let mut directory = admin_directory();
        let account = AccountId::default_account();
        assert_eq!(
            directory
                .add_account(&account, Account::new(AccountId::new("eve"), "Eve"))
                .unwrap_err(),
            Error::Authentication(AuthError::NotAuthorised)
        );
        directory
            .add_account(&admin(), Account::new(AccountId::new("eve"), "Eve"))
            .unwrap();
        let messages = directory.query_account_list(&admin()).unwrap();
        assert!(matches!(
            messages[0],
            Message::AclAccountListBegin { total: 2 }
        ));
        directory
            .remove_account(&admin(), &AccountId::new("eve"))
            .unwrap();
        assert!(directory
            .remove_account(&admin(), &AccountId::new("eve"))
            .is_err());
    }

    #[test]
    fn ot_failure_drops_only_the_offending_subscription() {
        let mut directory = directory();
        let root = directory.root();
        let account = AccountId::default_account();
        let doc = directory
            .add_document(&account, root, "doc", "text", None, None)
            .unwrap();
        subscribe(&mut directory, doc, ConnectionId(1));
        subscribe(&mut directory, doc, ConnectionId(2));
        let (user, _) = directory
            .join_user(&account, doc, join_params("mallory", ConnectionId(1)))
            .unwrap();
        let mut sink = |_: ConnectionId, _: &Message| {};
        // An unreachable vector is an engine failure.
        let mut vector = StateVector::new();
        vector.set(user.id, 5);
        let err = directory
            .receive_request(
                doc,
                OtRequest::make(
                    user.id,
                    vector,
                    Operation::DeleteStripped { pos: 0, len: 1 },
                ),
                Some(ConnectionId(1)),
                &mut sink,
            )
            .unwrap_err();
        assert_eq!(err.domain().as_str(), "ot");
        let session = directory.session(doc).unwrap();
        assert!(!session.group().contains(ConnectionId(1)));
        assert!(session.group().contains(ConnectionId(2)));
        assert_eq!(
            session.user(user.id).unwrap().status,
            UserStatus::Unavailable
        );
    }

    #[test]
    fn query_acl_reports_local_sheets() {
        let mut directory = admin_directory();
        let root = directory.root();
        match directory.query_acl(&admin(), root).unwrap() {
            Message::Acl { id, sheets } => {
                assert_eq!(id, root);
                assert!(sheets.find(&AccountId::default_account()).is_some());
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}

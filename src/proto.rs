//! The message grammar spoken on top of the fragment stream.
//!
//! Every wire fragment decodes into one [`Message`]; every outgoing
//! message encodes into one fragment. The grammar has four families:
//! directory control, per-session request transport, user lifecycle
//! and ACL management, plus the terminal failure message.
use crate::account::{Account, AccountId};
use crate::acl::AclSheetSet;
use crate::error::{DirectoryError, Error, RequestError, UserError};
use crate::id::NodeId;
use crate::user::UserStatus;
use crate::xml::Element;
use vellum_ot::{Operation, Request as OtRequest, RequestKind, StateVector, TextChunk, UserId};

/// Protocol revision announced in `<welcome>`.
pub const PROTOCOL_VERSION: u32 = 1;

/// The encoding every wire buffer is transferred in.
pub const WIRE_ENCODING: &str = "UTF-8";

/// A user entry of a synchronized snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct SyncUser {
    /// Session-unique id.
    pub id: UserId,
    /// Display name.
    pub name: String,
    /// Presence at snapshot time.
    pub status: UserStatus,
    /// Causal state at snapshot time.
    pub vector: StateVector,
    /// Caret position at snapshot time.
    pub caret: u32,
}

/// One decoded wire fragment.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// Server greeting, first fragment of every connection.
    Welcome {
        /// Protocol revision of the sender.
        version: u32,
    },
    /// Ask for the children of a subdirectory.
    ExploreNode {
        /// Node to explore.
        id: NodeId,
    },
    /// Announces how many children an exploration will deliver.
    ExploreBegin {
        /// Number of `add-node` fragments that follow.
        total: u32,
    },
    /// Terminates an exploration.
    ExploreEnd,
    /// A node came into existence (exploration or live update), or a
    /// client asks for one to be created (no id yet, the server
    /// assigns it).
    AddNode {
        /// Id of the node; absent in a client's creation request.
        id: Option<NodeId>,
        /// Id of the parent subdirectory.
        parent: NodeId,
        /// Name within the parent.
        name: String,
        /// `"subdirectory"` or the leaf's plugin type.
        node_type: String,
    },
    /// A node was removed, with its whole subtree.
    RemoveNode {
        /// Id of the removed node.
        id: NodeId,
    },
    /// Subscribe to the session hosted at a leaf.
    SubscribeSession {
        /// Id of the leaf.
        id: NodeId,
    },
    /// Client acknowledgement that a subscription's synchronization
    /// arrived; completes the subscription.
    SubscribeAck {
        /// Id of the leaf.
        id: NodeId,
    },
    /// Envelope scoping a message to one session's group.
    Group {
        /// Node hosting the session.
        node: NodeId,
        /// The enveloped message.
        inner: Box<Message>,
    },
    /// Upload existing content into a new node.
    SyncIn {
        /// Parent subdirectory of the new node.
        parent: NodeId,
        /// Name of the new node.
        name: String,
        /// Plugin type of the new node.
        node_type: String,
    },
    /// Starts a session synchronization.
    SyncBegin {
        /// Number of sync fragments that follow before `sync-end`.
        total: u32,
    },
    /// One user record of the synchronized session.
    SyncUser(SyncUser),
    /// One authored buffer run of the synchronized session.
    SyncSegment {
        /// Author of the run.
        author: UserId,
        /// Text of the run.
        text: String,
    },
    /// Terminates a session synchronization.
    SyncEnd,
    /// A transformation engine request.
    Request {
        /// The request, with the operation attached for `Do`.
        request: OtRequest,
        /// Optional issue time, transported verbatim.
        time: Option<String>,
    },
    /// Ask to join a user, or announce a joined user.
    UserJoin {
        /// Assigned id; absent in the client's join request.
        id: Option<UserId>,
        /// Requested display name.
        name: String,
        /// Initial status.
        status: UserStatus,
        /// Causal state of the joining user.
        vector: StateVector,
        /// Initial caret position.
        caret: u32,
    },
    /// A user's status changed.
    UserStatusChange {
        /// The user.
        id: UserId,
        /// The new status.
        status: UserStatus,
    },
    /// An unavailable user is taken over again.
    UserRejoin {
        /// The retained user id.
        id: UserId,
        /// Display name, unchanged from the original join.
        name: String,
        /// Causal state of the rejoining user.
        vector: StateVector,
    },
    /// Ask for the account list.
    QueryAclAccountList,
    /// Announces how many accounts the list reply will carry.
    AclAccountListBegin {
        /// Number of `add-acl-account` fragments that follow.
        total: u32,
    },
    /// Terminates an account list reply.
    AclAccountListEnd,
    /// Adds an account, or delivers one entry of the account list.
    AddAclAccount {
        /// The account.
        account: Account,
    },
    /// Removes an account.
    RemoveAclAccount {
        /// Id of the removed account.
        id: AccountId,
    },
    /// Ask for the full ACL of a node.
    QueryAcl {
        /// The node.
        id: NodeId,
    },
    /// Replace the ACL of a node.
    SetAcl {
        /// The node.
        id: NodeId,
        /// The new sheet set.
        sheets: AclSheetSet,
    },
    /// The full ACL of a node, reply to `query-acl`.
    Acl {
        /// The node.
        id: NodeId,
        /// The stored sheet set.
        sheets: AclSheetSet,
    },
    /// Terminal failure of a request.
    RequestFailed {
        /// Error domain name.
        domain: String,
        /// Code within the domain.
        code: u32,
        /// Human readable message.
        message: String,
    },
}

impl Message {
    /// Builds the failure message for an error.
    pub fn failed(error: &Error) -> Self {
        Self::RequestFailed {
            domain: error.domain().as_str().to_string(),
            code: error.code(),
            message: error.to_string(),
        }
    }

    /// Encodes the message as an XML fragment tree.
    pub fn to_element(&self) -> Element {
        match self {
            Self::Welcome { version } => Element::new("welcome").attr("version", version),
            Self::ExploreNode { id } => Element::new("explore-node").attr("id", id),
            Self::ExploreBegin { total } => Element::new("explore-begin").attr("total", total),
            Self::ExploreEnd => Element::new("explore-end"),
            Self::AddNode {
                id,
                parent,
                name,
                node_type,
            } => {
                let mut element = Element::new("add-node");
                if let Some(id) = id {
                    element = element.attr("id", id);
                }
                element
                    .attr("parent", parent)
                    .attr("name", name)
                    .attr("type", node_type)
            }
            Self::RemoveNode { id } => Element::new("remove-node").attr("id", id),
            Self::SubscribeSession { id } => Element::new("subscribe-session").attr("id", id),
            Self::SubscribeAck { id } => Element::new("subscribe-ack").attr("id", id),
            Self::Group { node, inner } => Element::new("group")
                .attr("node", node)
                .child(inner.to_element()),
            Self::SyncIn {
                parent,
                name,
                node_type,
            } => Element::new("sync-in")
                .attr("parent", parent)
                .attr("name", name)
                .attr("type", node_type),
            Self::SyncBegin { total } => Element::new("sync-begin").attr("total", total),
            Self::SyncUser(user) => Element::new("sync-user")
                .attr("id", user.id)
                .attr("name", &user.name)
                .attr("status", user.status.as_str())
                .attr("vector", &user.vector)
                .attr("caret", user.caret),
            Self::SyncSegment { author, text } => Element::new("sync-segment")
                .attr("author", author)
                .text(text.clone()),
            Self::SyncEnd => Element::new("sync-end"),
            Self::Request { request, time } => {
                let mut element = Element::new("request")
                    .attr("user", request.user)
                    .attr("vector", &request.vector);
                if let Some(time) = time {
                    element = element.attr("time", time);
                }
                element.child(request_body_to_xml(request))
            }
            Self::UserJoin {
                id,
                name,
                status,
                vector,
                caret,
            } => {
                let mut element = Element::new("user-join")
                    .attr("name", name)
                    .attr("status", status.as_str())
                    .attr("vector", vector)
                    .attr("caret", caret);
                if let Some(id) = id {
                    element = element.attr("id", id);
                }
                element
            }
            Self::UserStatusChange { id, status } => Element::new("user-status")
                .attr("id", id)
                .attr("status", status.as_str()),
            Self::UserRejoin { id, name, vector } => Element::new("user-rejoin")
                .attr("id", id)
                .attr("name", name)
                .attr("vector", vector),
            Self::QueryAclAccountList => Element::new("query-acl-account-list"),
            Self::AclAccountListBegin { total } => {
                Element::new("acl-account-list-begin").attr("total", total)
            }
            Self::AclAccountListEnd => Element::new("acl-account-list-end"),
            Self::AddAclAccount { account } => Element::new("add-acl-account")
                .attr("id", account.id.as_str())
                .attr("name", &account.name),
            Self::RemoveAclAccount { id } => {
                Element::new("remove-acl-account").attr("id", id.as_str())
            }
            Self::QueryAcl { id } => Element::new("query-acl").attr("id", id),
            Self::SetAcl { id, sheets } => sheets.to_xml(Element::new("set-acl").attr("id", id)),
            Self::Acl { id, sheets } => sheets.to_xml(Element::new("acl").attr("id", id)),
            Self::RequestFailed {
                domain,
                code,
                message,
            } => Element::new("request-failed")
                .attr("domain", domain)
                .attr("code", code)
                .text(message.clone()),
        }
    }

    /// Decodes a fragment tree. Unknown fragment names fail with
    /// [`DirectoryError::UnexpectedMessage`].
    pub fn from_element(element: &Element) -> Result<Self, Error> {
        Ok(match element.name.as_str() {
            "welcome" => Self::Welcome {
                version: element.number_attr("version")?,
            },
            "explore-node" => Self::ExploreNode {
                id: node_id_attr(element, "id")?,
            },
            "explore-begin" => Self::ExploreBegin {
                total: element.number_attr("total")?,
            },
            "explore-end" => Self::ExploreEnd,
            "add-node" => Self::AddNode {
                id: match element.attr_opt("id") {
                    Some(_) => Some(node_id_attr(element, "id")?),
                    None => None,
                },
                parent: node_id_attr(element, "parent")?,
                name: element.required_attr("name")?.to_string(),
                node_type: element.required_attr("type")?.to_string(),
            },
            "remove-node" => Self::RemoveNode {
                id: node_id_attr(element, "id")?,
            },
            "subscribe-session" => Self::SubscribeSession {
                id: node_id_attr(element, "id")?,
            },
            "subscribe-ack" => Self::SubscribeAck {
                id: node_id_attr(element, "id")?,
            },
            "group" => {
                let inner = element.children.first().ok_or_else(|| {
                    Error::from(RequestError::Failed("empty group envelope".into()))
                })?;
                Self::Group {
                    node: node_id_attr(element, "node")?,
                    inner: Box::new(Self::from_element(inner)?),
                }
            }
            "sync-in" => Self::SyncIn {
                parent: node_id_attr(element, "parent")?,
                name: element.required_attr("name")?.to_string(),
                node_type: element.required_attr("type")?.to_string(),
            },
            "sync-begin" => Self::SyncBegin {
                total: element.number_attr("total")?,
            },
            "sync-user" => Self::SyncUser(SyncUser {
                id: user_id_attr(element, "id")?,
                name: element.required_attr("name")?.to_string(),
                status: UserStatus::parse(element.required_attr("status")?)?,
                vector: vector_attr(element)?,
                caret: element.number_attr("caret")?,
            }),
            "sync-segment" => Self::SyncSegment {
                author: user_id_attr(element, "author")?,
                text: element.text.clone(),
            },
            "sync-end" => Self::SyncEnd,
            "request" => {
                let user = user_id_attr(element, "user")?;
                let vector = vector_attr(element)?;
                let body = element.children.first().ok_or_else(|| {
                    Error::from(RequestError::Failed("request without operation".into()))
                })?;
                let request = request_body_from_xml(user, vector, body)?;
                Self::Request {
                    request,
                    time: element.attr_opt("time").map(str::to_string),
                }
            }
            "user-join" => Self::UserJoin {
                id: match element.attr_opt("id") {
                    Some(_) => Some(user_id_attr(element, "id")?),
                    None => None,
                },
                name: element.required_attr("name")?.to_string(),
                status: UserStatus::parse(element.required_attr("status")?)?,
                vector: vector_attr(element)?,
                caret: element.opt_number_attr("caret")?.unwrap_or(0),
            },
            "user-status" => Self::UserStatusChange {
                id: user_id_attr(element, "id")?,
                status: UserStatus::parse(element.required_attr("status")?)?,
            },
            "user-rejoin" => Self::UserRejoin {
                id: user_id_attr(element, "id")?,
                name: element.required_attr("name")?.to_string(),
                vector: vector_attr(element)?,
            },
            "query-acl-account-list" => Self::QueryAclAccountList,
            "acl-account-list-begin" => Self::AclAccountListBegin {
                total: element.number_attr("total")?,
            },
            "acl-account-list-end" => Self::AclAccountListEnd,
            "add-acl-account" => Self::AddAclAccount {
                account: Account::new(
                    AccountId::new(element.required_attr("id")?),
                    element.required_attr("name")?,
                ),
            },
            "remove-acl-account" => Self::RemoveAclAccount {
                id: AccountId::new(element.required_attr("id")?),
            },
            "query-acl" => Self::QueryAcl {
                id: node_id_attr(element, "id")?,
            },
            "set-acl" => Self::SetAcl {
                id: node_id_attr(element, "id")?,
                sheets: AclSheetSet::from_xml(element)?,
            },
            "acl" => Self::Acl {
                id: node_id_attr(element, "id")?,
                sheets: AclSheetSet::from_xml(element)?,
            },
            "request-failed" => Self::RequestFailed {
                domain: element.required_attr("domain")?.to_string(),
                code: element.number_attr("code")?,
                message: element.text.clone(),
            },
            other => {
                return Err(DirectoryError::UnexpectedMessage(other.to_string()).into());
            }
        })
    }
}

/// Encodes the operation body of a request.
fn request_body_to_xml(request: &OtRequest) -> Element {
    match request.kind {
        RequestKind::Undo => Element::new("undo"),
        RequestKind::Redo => Element::new("redo"),
        RequestKind::Do => operation_to_xml(
            request
                .operation
                .as_ref()
                .expect("do request carries an operation"),
        ),
    }
}

/// Encodes one operation as an element.
fn operation_to_xml(operation: &Operation) -> Element {
    match operation {
        Operation::Insert { pos, chunk } => {
            chunk_to_xml(chunk, Element::new("insert").attr("pos", pos))
        }
        Operation::InsertStripped { pos, len } => {
            Element::new("insert").attr("pos", pos).attr("len", len)
        }
        Operation::Delete { pos, chunk } => {
            chunk_to_xml(chunk, Element::new("delete").attr("pos", pos))
        }
        Operation::DeleteStripped { pos, len } => {
            Element::new("delete").attr("pos", pos).attr("len", len)
        }
        Operation::Move { pos } => Element::new("move").attr("pos", pos),
        Operation::Split(first, second) => Element::new("split")
            .child(operation_to_xml(first))
            .child(operation_to_xml(second)),
        Operation::Nop => Element::new("no-op"),
    }
}

/// Decodes the operation body of a request.
fn request_body_from_xml(
    user: UserId,
    vector: StateVector,
    body: &Element,
) -> Result<OtRequest, Error> {
    match body.name.as_str() {
        "undo" => Ok(OtRequest::undo(user, vector)),
        "redo" => Ok(OtRequest::redo(user, vector)),
        _ => {
            let operation = operation_from_xml(body)?;
            Ok(OtRequest::make(user, vector, operation))
        }
    }
}

/// Decodes one operation element.
fn operation_from_xml(element: &Element) -> Result<Operation, Error> {
    Ok(match element.name.as_str() {
        "insert" => {
            let pos = element.number_attr("pos")?;
            if element.children.is_empty() {
                Operation::InsertStripped {
                    pos,
                    len: element.number_attr("len")?,
                }
            } else {
                Operation::Insert {
                    pos,
                    chunk: chunk_from_xml(element)?,
                }
            }
        }
        "delete" => {
            let pos = element.number_attr("pos")?;
            if element.children.is_empty() {
                Operation::DeleteStripped {
                    pos,
                    len: element.number_attr("len")?,
                }
            } else {
                Operation::Delete {
                    pos,
                    chunk: chunk_from_xml(element)?,
                }
            }
        }
        "move" => Operation::Move {
            pos: element.number_attr("pos")?,
        },
        "split" => {
            if element.children.len() != 2 {
                return Err(RequestError::Failed("split must carry two operations".into()).into());
            }
            Operation::Split(
                Box::new(operation_from_xml(&element.children[0])?),
                Box::new(operation_from_xml(&element.children[1])?),
            )
        }
        "no-op" => Operation::Nop,
        other => {
            return Err(RequestError::Failed(format!("unknown operation {:?}", other)).into());
        }
    })
}

/// Appends a chunk's runs as `<segment>` children.
fn chunk_to_xml(chunk: &TextChunk, mut parent: Element) -> Element {
    for run in chunk.iter() {
        parent = parent.child(
            Element::new("segment")
                .attr("author", run.author)
                .text(String::from_utf8_lossy(run.text).to_string()),
        );
    }
    parent
}

/// Rebuilds a chunk from `<segment>` children.
fn chunk_from_xml(parent: &Element) -> Result<TextChunk, Error> {
    let mut chunk = TextChunk::new(WIRE_ENCODING);
    for segment in parent.children_named("segment") {
        let author = user_id_attr(segment, "author")?;
        chunk.push_segment(author, segment.text.as_bytes().to_vec());
    }
    Ok(chunk)
}

fn node_id_attr(element: &Element, name: &str) -> Result<NodeId, Error> {
    element
        .required_attr(name)?
        .parse()
        .map_err(|_| RequestError::InvalidNumber(name.to_string()).into())
}

fn user_id_attr(element: &Element, name: &str) -> Result<UserId, Error> {
    let raw: u32 = element.number_attr(name)?;
    UserId::new(raw).ok_or_else(|| UserError::NoSuchUser(raw).into())
}

fn vector_attr(element: &Element) -> Result<StateVector, Error> {
    element
        .required_attr("vector")?
        .parse()
        .map_err(|_| RequestError::InvalidNumber("vector".to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::{AclMask, AclSetting, AclSheet};

    fn uid(id: u32) -> UserId {
        UserId::new(id).unwrap()
    }

    fn roundtrip(message: Message) {
        let bytes = message.to_element().to_bytes();
        let parsed = Message::from_element(&Element::parse(&bytes).unwrap()).unwrap();
        assert_eq!(parsed, message);
    }

    #[test]
    fn directory_control_roundtrips() {
        roundtrip(Message::Welcome { version: 1 });
        roundtrip(Message::ExploreNode {
            id: NodeId::new(4).unwrap(),
        });
        roundtrip(Message::AddNode {
            id: Some(NodeId::new(5).unwrap()),
            parent: NodeId::new(1).unwrap(),
            name: "notes".into(),
            node_type: "subdirectory".into(),
        });
        roundtrip(Message::AddNode {
            id: None,
            parent: NodeId::new(1).unwrap(),
            name: "draft".into(),
            node_type: "text".into(),
        });
        roundtrip(Message::RemoveNode {
            id: NodeId::new(5).unwrap(),
        });
    }

    #[test]
    fn do_request_roundtrips_with_segments() {
        let mut chunk = TextChunk::new(WIRE_ENCODING);
        chunk.push_segment(uid(1), b"hello ".to_vec());
        chunk.push_segment(uid(2), b"world".to_vec());
        let mut vector = StateVector::new();
        vector.set(uid(1), 3);
        let request = OtRequest::make(uid(2), vector, Operation::Insert { pos: 4, chunk });
        roundtrip(Message::Request {
            request,
            time: None,
        });
    }

    #[test]
    fn undo_request_carries_no_operation() {
        let message = Message::Request {
            request: OtRequest::undo(uid(3), StateVector::new()),
            time: None,
        };
        let bytes = message.to_element().to_bytes();
        let parsed = Message::from_element(&Element::parse(&bytes).unwrap()).unwrap();
        match parsed {
            Message::Request { request, .. } => {
                assert_eq!(request.kind, RequestKind::Undo);
                assert!(request.operation.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn stripped_delete_roundtrips() {
        roundtrip(Message::Request {
            request: OtRequest::make(
                uid(1),
                StateVector::new(),
                Operation::DeleteStripped { pos: 2, len: 7 },
            ),
            time: Some("1718".into()),
        });
    }

    #[test]
    fn split_operation_roundtrips() {
        let operation = Operation::Split(
            Box::new(Operation::DeleteStripped { pos: 0, len: 2 }),
            Box::new(Operation::DeleteStripped { pos: 3, len: 1 }),
        );
        roundtrip(Message::Request {
            request: OtRequest::make(uid(1), StateVector::new(), operation),
            time: None,
        });
    }

    #[test]
    fn user_join_without_id_is_a_request() {
        let message = Message::UserJoin {
            id: None,
            name: "alice".into(),
            status: UserStatus::Active,
            vector: StateVector::new(),
            caret: 0,
        };
        roundtrip(message);
    }

    #[test]
    fn acl_roundtrips() {
        let mut sheets = AclSheetSet::new();
        sheets.insert(
            AccountId::default_account(),
            AclSheet {
                mask: AclMask::all(),
                perms: AclMask::of(&[AclSetting::CanSubscribeSession]),
            },
        );
        roundtrip(Message::SetAcl {
            id: NodeId::new(1).unwrap(),
            sheets: sheets.clone(),
        });
        roundtrip(Message::Acl {
            id: NodeId::new(1).unwrap(),
            sheets,
        });
        roundtrip(Message::AddAclAccount {
            account: Account::new(AccountId::new("alice"), "Alice"),
        });
    }

    #[test]
    fn group_envelope_roundtrips() {
        roundtrip(Message::Group {
            node: NodeId::new(5).unwrap(),
            inner: Box::new(Message::UserStatusChange {
                id: uid(2),
                status: UserStatus::Inactive,
            }),
        });
        let empty = Element::new("group").attr("node", 5);
        assert!(Message::from_element(&empty).is_err());
    }

    #[test]
    fn unknown_fragment_is_rejected() {
        let element = Element::new("teleport");
        let err = Message::from_element(&element).unwrap_err();
        assert_eq!(
            err,
            Error::Directory(DirectoryError::UnexpectedMessage("teleport".into()))
        );
    }

    #[test]
    fn failure_message_carries_domain_and_code() {
        let error: Error = DirectoryError::NoSuchNode(9).into();
        let message = Message::failed(&error);
        let bytes = message.to_element().to_bytes();
        match Message::from_element(&Element::parse(&bytes).unwrap()).unwrap() {
            Message::RequestFailed {
                domain,
                code,
                message,
            } => {
                assert_eq!(domain, "directory");
                assert_eq!(code, 4);
                assert!(message.contains("does not exist"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}

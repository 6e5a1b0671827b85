//! The closed error taxonomy of the protocol.
//!
//! Every fallible request terminates in at most one failure carrying a
//! domain, a stable numeric code within that domain, and a human
//! readable message. The enumerations below are closed: new codes are
//! appended, existing codes never change meaning.
use crate::id::NodeId;
use thiserror::Error;
use vellum_ot::OtError;

/// The error domains of the wire protocol.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Domain {
    /// Connection and framing failures.
    Transport,
    /// Malformed or unprocessable requests.
    Request,
    /// User lifecycle failures.
    User,
    /// Directory tree and subscription failures.
    Directory,
    /// Authentication failures.
    Authentication,
    /// Transformation engine failures.
    Ot,
}

impl Domain {
    /// The wire name of the domain.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Request => "request",
            Self::User => "user",
            Self::Directory => "directory",
            Self::Authentication => "authentication",
            Self::Ot => "ot",
        }
    }
}

/// Failures of the byte transport below the message grammar.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TransportError {
    /// The connection could not be opened.
    #[error("connection could not be opened")]
    ConnectionOpenFailed,
    /// The TLS handshake failed.
    #[error("TLS handshake failed")]
    TlsHandshakeFailed,
    /// A fragment did not parse as XML.
    #[error("XML parse error at byte {offset}: {message}")]
    XmlParse {
        /// Byte offset into the stream at which parsing failed.
        offset: u64,
        /// The underlying parser diagnostic.
        message: String,
    },
    /// The byte stream violated the fragment framing.
    #[error("framing error: {0}")]
    Framing(String),
}

impl TransportError {
    /// Stable wire code of the error.
    pub fn code(&self) -> u32 {
        match self {
            Self::ConnectionOpenFailed => 0,
            Self::TlsHandshakeFailed => 1,
            Self::XmlParse { .. } => 2,
            Self::Framing(_) => 3,
        }
    }
}

/// Failures of request processing common to all message families.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RequestError {
    /// A failure reply named an unknown error domain.
    #[error("unknown error domain {0:?}")]
    UnknownDomain(String),
    /// A reply could not be processed.
    #[error("reply could not be processed")]
    ReplyUnprocessed,
    /// A sequence number did not match any pending request.
    #[error("invalid sequence number")]
    InvalidSeq,
    /// A required XML attribute was missing.
    #[error("missing attribute {0:?}")]
    MissingAttribute(String),
    /// A numeric attribute did not parse.
    #[error("attribute {0:?} is not a valid number")]
    InvalidNumber(String),
    /// Catch-all when no more precise reason is known.
    #[error("request failed: {0}")]
    Failed(String),
}

impl RequestError {
    /// Stable wire code of the error.
    pub fn code(&self) -> u32 {
        match self {
            Self::UnknownDomain(_) => 0,
            Self::ReplyUnprocessed => 1,
            Self::InvalidSeq => 2,
            Self::MissingAttribute(_) => 3,
            Self::InvalidNumber(_) => 4,
            Self::Failed(_) => 5,
        }
    }
}

/// Failures of the user lifecycle within a session.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum UserError {
    /// The requested name is taken by an active user.
    #[error("user name {0:?} is already in use")]
    NameInUse(String),
    /// A join request carried a client-chosen user id.
    #[error("user ids are assigned by the server")]
    IdProvidedByClient,
    /// A request referred to a user id nobody has.
    #[error("no user with id {0}")]
    NoSuchUser(u32),
    /// A join requested the unavailable status.
    #[error("cannot join a user as unavailable")]
    UnavailableOnJoin,
    /// A request manipulated a user joined by another connection.
    #[error("user was not joined by this connection")]
    NotJoinedByThisConnection,
    /// A status value outside the enumeration was used.
    #[error("invalid user status {0:?}")]
    InvalidStatus(String),
    /// Catch-all when no more precise reason is known.
    #[error("user request failed: {0}")]
    Failed(String),
}

impl UserError {
    /// Stable wire code of the error.
    pub fn code(&self) -> u32 {
        match self {
            Self::NameInUse(_) => 0,
            Self::IdProvidedByClient => 1,
            Self::NoSuchUser(_) => 2,
            Self::UnavailableOnJoin => 3,
            Self::NotJoinedByThisConnection => 4,
            Self::InvalidStatus(_) => 5,
            Self::Failed(_) => 6,
        }
    }
}

/// Failures of directory operations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DirectoryError {
    /// The server never sent its welcome.
    #[error("no welcome message received")]
    NoWelcome,
    /// Client and server protocol versions differ.
    #[error("protocol version mismatch")]
    VersionMismatch,
    /// A sibling with the requested name exists.
    #[error("a node named {0:?} already exists")]
    NodeExists(String),
    /// The requested node name is not permitted.
    #[error("invalid node name {0:?}")]
    InvalidName(String),
    /// The referenced node does not exist.
    #[error("node {0} does not exist")]
    NoSuchNode(u32),
    /// Chat sessions are disabled on this server.
    #[error("chat is disabled")]
    ChatDisabled,
    /// The referenced node is not a subdirectory.
    #[error("node {0} is not a subdirectory")]
    NotSubdirectory(u32),
    /// The referenced node is not a leaf.
    #[error("node {0} is not a document")]
    NotLeaf(u32),
    /// The root node cannot be removed.
    #[error("the root node cannot be removed")]
    RootRemoveAttempt,
    /// The node has already been explored.
    #[error("node {0} is already explored")]
    AlreadyExplored(u32),
    /// Exploration produced a child count other than announced.
    #[error("exploration of node {node} yielded {got} children, expected {expected}")]
    SubchildCountMismatch {
        /// Explored node.
        node: u32,
        /// Announced child count.
        expected: u32,
        /// Observed child count.
        got: u32,
    },
    /// No plugin is registered for the leaf type.
    #[error("unknown document type {0:?}")]
    UnknownType(String),
    /// The connection is already subscribed to the session.
    #[error("already subscribed to node {0}")]
    AlreadySubscribed(u32),
    /// The connection is not subscribed to the session.
    #[error("not subscribed to node {0}")]
    NotSubscribed(u32),
    /// The requested network is not supported.
    #[error("unsupported network")]
    UnsupportedNetwork,
    /// The requested messaging method is not supported.
    #[error("unsupported messaging method {0:?}")]
    UnsupportedMethod(String),
    /// A sync-in arrived without a preceding agreement.
    #[error("unexpected sync-in")]
    UnexpectedSyncIn,
    /// A message that does not belong to the current state arrived.
    #[error("unexpected message {0:?}")]
    UnexpectedMessage(String),
    /// The server runs without a storage back-end.
    #[error("no storage back-end configured")]
    NoStorage,
    /// Catch-all when no more precise reason is known.
    #[error("directory request failed: {0}")]
    Failed(String),
}

impl DirectoryError {
    /// Stable wire code of the error.
    pub fn code(&self) -> u32 {
        match self {
            Self::NoWelcome => 0,
            Self::VersionMismatch => 1,
            Self::NodeExists(_) => 2,
            Self::InvalidName(_) => 3,
            Self::NoSuchNode(_) => 4,
            Self::ChatDisabled => 5,
            Self::NotSubdirectory(_) => 6,
            Self::NotLeaf(_) => 7,
            Self::RootRemoveAttempt => 8,
            Self::AlreadyExplored(_) => 9,
            Self::SubchildCountMismatch { .. } => 10,
            Self::UnknownType(_) => 11,
            Self::AlreadySubscribed(_) => 12,
            Self::NotSubscribed(_) => 13,
            Self::UnsupportedNetwork => 14,
            Self::UnsupportedMethod(_) => 15,
            Self::UnexpectedSyncIn => 16,
            Self::UnexpectedMessage(_) => 17,
            Self::NoStorage => 18,
            Self::Failed(_) => 19,
        }
    }

    /// Shorthand used when a node disappeared mid-request.
    pub fn no_such_node(id: NodeId) -> Self {
        Self::NoSuchNode(id.get())
    }
}

/// Failures of credential verification.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum AuthError {
    /// The presented credentials were wrong.
    #[error("bad credentials")]
    BadCredentials,
    /// The account is not permitted to perform the operation.
    #[error("not authorised")]
    NotAuthorised,
    /// Authentication is temporarily unavailable.
    #[error("try again later")]
    TryAgain,
    /// The server failed while checking credentials.
    #[error("server error during authentication")]
    ServerError,
}

impl AuthError {
    /// Stable wire code of the error.
    pub fn code(&self) -> u32 {
        match self {
            Self::BadCredentials => 0,
            Self::NotAuthorised => 1,
            Self::TryAgain => 2,
            Self::ServerError => 3,
        }
    }
}

/// Any failure a request can terminate with.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum Error {
    /// See [`TransportError`].
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// See [`RequestError`].
    #[error(transparent)]
    Request(#[from] RequestError),
    /// See [`UserError`].
    #[error(transparent)]
    User(#[from] UserError),
    /// See [`DirectoryError`].
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    /// See [`AuthError`].
    #[error(transparent)]
    Authentication(#[from] AuthError),
    /// See [`OtError`].
    #[error(transparent)]
    Ot(#[from] OtError),
}

impl Error {
    /// The domain the error belongs to.
    pub fn domain(&self) -> Domain {
        match self {
            Self::Transport(_) => Domain::Transport,
            Self::Request(_) => Domain::Request,
            Self::User(_) => Domain::User,
            Self::Directory(_) => Domain::Directory,
            Self::Authentication(_) => Domain::Authentication,
            Self::Ot(_) => Domain::Ot,
        }
    }

    /// The stable code within the domain.
    pub fn code(&self) -> u32 {
        match self {
            Self::Transport(err) => err.code(),
            Self::Request(err) => err.code(),
            Self::User(err) => err.code(),
            Self::Directory(err) => err.code(),
            Self::Authentication(err) => err.code(),
            Self::Ot(err) => err.code(),
        }
    }
}

/// Convenience alias for fallible protocol operations.
pub type Result<T> = std::result::Result<T, Error>;

//! # Vellum
//!
//! A server runtime for real-time collaborative text editing.
//!
//! ## Shape
//! Clients connect over a framed-XML byte stream (the transport
//! itself, TLS and credential verification live outside this crate)
//! and operate on a server-maintained directory tree. Subdirectories
//! contain documents; every document hosts a session; every session
//! owns a buffer and the operational transformation engine from
//! [`vellum_ot`] that keeps concurrent editors convergent.
//!
//! ## Layers
//! - [`xml`] delimits fragments in the byte stream and models them as
//!   element trees.
//! - [`proto`] is the typed message grammar on top of the fragments.
//! - [`session`] owns per-document state: buffer, engine, users,
//!   synchronization to newly joining participants.
//! - [`directory`] owns the node tree, hosted sessions, accounts and
//!   per-node ACL sheets; every operation is permission-checked.
//! - [`run`] ties the layers into a transport-agnostic [`run::Server`]
//!   that turns incoming bytes into state changes and outgoing
//!   fragments.
//!
//! ## Concurrency
//! The core is single-threaded and cooperative: directory, session
//! and engine state are only touched from the event loop. CPU-bound
//! work goes through [`worker`], which runs a closure on a plain
//! thread and delivers the result back to the loop.
//!
//! ## Errors
//! Every fallible request terminates in at most one failure from the
//! closed taxonomy in [`error`], carried on the wire as
//! `<request-failed domain="…" code="…">`.
#![deny(missing_docs)]
pub mod account;
pub mod acl;
pub mod autosave;
pub mod directory;
pub mod error;
pub mod group;
pub mod id;
pub mod observe;
pub mod proto;
pub mod run;
pub mod session;
pub mod storage;
pub mod user;
pub mod worker;
pub mod xml;

pub use crate::account::{Account, AccountId, AccountTable};
pub use crate::acl::{AclMask, AclSetting, AclSheet, AclSheetSet};
pub use crate::autosave::Autosave;
pub use crate::directory::{DirEvent, DirRequest, Directory, DirectoryConfig, Node, NodeKind};
pub use crate::error::{
    AuthError, DirectoryError, Domain, Error, RequestError, Result, TransportError, UserError,
};
pub use crate::group::{MessageMethod, MessageSink, SubscriptionGroup};
pub use crate::id::{ConnectionId, NodeId};
pub use crate::observe::{ObserverList, Subscription};
pub use crate::proto::{Message, SyncUser, PROTOCOL_VERSION, WIRE_ENCODING};
pub use crate::run::{KeepaliveConfig, Server, ServerConfig};
pub use crate::session::{
    Session, SessionConfig, SessionEvent, SessionSnapshot, SessionStatus, UserParams,
};
pub use crate::storage::{FileStorage, MemoryStorage, Storage, StorageNode};
pub use crate::user::{User, UserFlags, UserStatus};
pub use crate::worker::{spawn as spawn_worker, WorkerHandle};
pub use vellum_ot::{
    Algorithm, AlgorithmConfig, OtError, Operation, Request, RequestKind, StateVector, TextChunk,
    UserId,
};

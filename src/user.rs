//! Per-session user records.
use crate::account::AccountId;
use crate::error::{Error, UserError};
use crate::id::ConnectionId;
use vellum_ot::{StateVector, UserId};

/// Presence of a user within a session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UserStatus {
    /// The user is editing.
    Active,
    /// The user is joined but idle.
    Inactive,
    /// The user's connection is gone. The record is retained because
    /// logs and buffer segments keep referring to the id.
    Unavailable,
}

impl UserStatus {
    /// The wire name of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Unavailable => "unavailable",
        }
    }

    /// Parses a wire name.
    pub fn parse(name: &str) -> Result<Self, Error> {
        match name {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            "unavailable" => Ok(Self::Unavailable),
            other => Err(UserError::InvalidStatus(other.to_string()).into()),
        }
    }
}

/// Flags attached to a user record.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct UserFlags {
    /// Set when the user was joined by this side of the connection.
    pub local: bool,
}

/// A participant of one session.
#[derive(Clone, Debug)]
pub struct User {
    /// Server-assigned id, unique per session.
    pub id: UserId,
    /// Display name, unique among non-unavailable users.
    pub name: String,
    /// Presence.
    pub status: UserStatus,
    /// Flags.
    pub flags: UserFlags,
    /// The account the joining connection authenticated as.
    pub account: AccountId,
    /// The connection that joined the user, while it is up.
    pub connection: Option<ConnectionId>,
    /// Last announced causal state.
    pub vector: StateVector,
    /// Caret position within the buffer.
    pub caret: u32,
}

impl User {
    /// Returns whether the user currently counts as joined.
    pub fn is_available(&self) -> bool {
        self.status != UserStatus::Unavailable
    }
}

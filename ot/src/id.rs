use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;

/// Identifies a participant within a session.
///
/// User ids are assigned by the hosting side when a user joins and are
/// never zero. They stay resolvable for the lifetime of the session even
/// after the user becomes unavailable, because request logs and buffer
/// segments keep referring to them.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct UserId(NonZeroU32);

impl UserId {
    /// Creates a user id. Returns `None` for zero.
    pub fn new(id: u32) -> Option<Self> {
        NonZeroU32::new(id).map(Self)
    }

    /// Returns the numeric value.
    pub fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UserId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

#[cfg(test)]
pub(crate) fn uid(id: u32) -> UserId {
    UserId::new(id).unwrap()
}

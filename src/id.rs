//! Identifier newtypes for the directory and transport seams.
use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;

/// Identifies a node of the directory tree.
///
/// Node ids are allocated from a process-wide monotonic counter and
/// never reused within a process lifetime. The root's parent is
/// expressed as the absence of a parent, so ids themselves are never
/// zero.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NodeId(NonZeroU32);

impl NodeId {
    /// Creates a node id. Returns `None` for zero.
    pub fn new(id: u32) -> Option<Self> {
        NonZeroU32::new(id).map(Self)
    }

    /// Returns the numeric value.
    pub fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Handle onto a transport connection.
///
/// The transport layer hands these out; the core never dereferences
/// them, it only routes messages by them.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

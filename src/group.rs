//! Per-session messaging scopes.
use crate::id::ConnectionId;
use crate::proto::Message;

/// How a session's messages are distributed among its members.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum MessageMethod {
    /// Every message is relayed through the session host, which gives
    /// the session a total message order. The only implemented method.
    #[default]
    Central,
}

impl MessageMethod {
    /// The wire name of the method.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Central => "central",
        }
    }
}

/// Where outgoing messages go. Implemented by the runtime that owns
/// the transport connections.
pub trait MessageSink {
    /// Queues a message for one connection.
    fn send(&mut self, to: ConnectionId, message: &Message);
}

impl<F: FnMut(ConnectionId, &Message)> MessageSink for F {
    fn send(&mut self, to: ConnectionId, message: &Message) {
        self(to, message)
    }
}

/// The set of connections subscribed to one session.
///
/// Membership is only ever mutated from the loop thread.
#[derive(Debug, Default)]
pub struct SubscriptionGroup {
    method: MessageMethod,
    members: Vec<ConnectionId>,
}

impl SubscriptionGroup {
    /// Returns an empty group using the central method.
    pub fn new() -> Self {
        Self::default()
    }

    /// The group's messaging method.
    pub fn method(&self) -> MessageMethod {
        self.method
    }

    /// Adds a member. Returns false if it was already subscribed.
    pub fn add(&mut self, connection: ConnectionId) -> bool {
        if self.members.contains(&connection) {
            return false;
        }
        self.members.push(connection);
        true
    }

    /// Removes a member. Returns false if it was not subscribed.
    pub fn remove(&mut self, connection: ConnectionId) -> bool {
        let before = self.members.len();
        self.members.retain(|member| *member != connection);
        self.members.len() != before
    }

    /// Returns whether the connection is subscribed.
    pub fn contains(&self, connection: ConnectionId) -> bool {
        self.members.contains(&connection)
    }

    /// Iterates over the members in subscription order.
    pub fn iter(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.members.iter().copied()
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Returns whether nobody is subscribed.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Relays a message to every member except its originator. Under
    /// the central method the host calls this once per accepted
    /// message, which gives every member the same total order.
    pub fn relay(&self, from: Option<ConnectionId>, message: &Message, sink: &mut dyn MessageSink) {
        for member in self.iter() {
            if Some(member) != from {
                sink.send(member, message);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_skips_the_originator() {
        let mut group = SubscriptionGroup::new();
        assert!(group.add(ConnectionId(1)));
        assert!(group.add(ConnectionId(2)));
        assert!(group.add(ConnectionId(3)));
        assert!(!group.add(ConnectionId(2)));
        let mut delivered = Vec::new();
        let mut sink = |to: ConnectionId, _message: &Message| delivered.push(to);
        group.relay(
            Some(ConnectionId(2)),
            &Message::Welcome { version: 1 },
            &mut sink,
        );
        assert_eq!(delivered, vec![ConnectionId(1), ConnectionId(3)]);
    }

    #[test]
    fn membership_is_idempotent() {
        let mut group = SubscriptionGroup::new();
        group.add(ConnectionId(9));
        assert!(group.contains(ConnectionId(9)));
        assert!(group.remove(ConnectionId(9)));
        assert!(!group.remove(ConnectionId(9)));
        assert!(group.is_empty());
    }
}

//! Per-user append-only request logs.
use crate::id::UserId;
use crate::request::{Request, RequestKind};

#[derive(Clone, Debug)]
struct LogEntry {
    request: Request,
    /// For undo/redo entries, the counter of the request they revert.
    associated: Option<u32>,
}

/// The append-only log of one user's requests.
///
/// Entries are indexed by the counter value the user's state vector
/// assigns to them: the first request of a user is number 1 and the
/// numbering has no gaps. Old entries can be dropped from the front,
/// which moves [`begin`](Self::begin) up.
#[derive(Clone, Debug)]
pub struct RequestLog {
    user: UserId,
    begin: u32,
    entries: Vec<LogEntry>,
}

impl RequestLog {
    /// Returns an empty log for `user`, starting at counter 1.
    pub fn new(user: UserId) -> Self {
        Self::starting_at(user, 1)
    }

    /// Returns an empty log whose first entry will get counter
    /// `begin`. Used when a user is restored from a synchronized
    /// snapshot whose earlier requests were never transferred.
    pub fn starting_at(user: UserId, begin: u32) -> Self {
        Self {
            user,
            begin: begin.max(1),
            entries: Vec::new(),
        }
    }

    /// The user whose requests this log records.
    pub fn user(&self) -> UserId {
        self.user
    }

    /// Counter of the oldest entry still stored.
    pub fn begin(&self) -> u32 {
        self.begin
    }

    /// Counter the next appended request will get.
    pub fn next_index(&self) -> u32 {
        self.begin + self.entries.len() as u32
    }

    /// Returns whether no entries are stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns the request with counter `index`, if still stored.
    pub fn get(&self, index: u32) -> Option<&Request> {
        self.entry(index).map(|entry| &entry.request)
    }

    /// Iterates over the requests with counters in `from..to`.
    pub fn slice(&self, from: u32, to: u32) -> impl Iterator<Item = &Request> + '_ {
        (from.max(self.begin)..to.min(self.next_index())).filter_map(move |index| self.get(index))
    }

    /// Appends a request, which must belong to this log's user. For
    /// undo/redo requests the reverted counter is recorded.
    pub fn push(&mut self, request: Request) {
        debug_assert_eq!(request.user, self.user);
        let associated = match request.kind {
            RequestKind::Do => None,
            RequestKind::Undo => self.next_undo_index(),
            RequestKind::Redo => self.next_redo_index(),
        };
        self.entries.push(LogEntry {
            request,
            associated,
        });
    }

    /// Counter of the request an undo issued now would revert: the
    /// newest `Do` or `Redo` entry that is not already undone.
    pub fn next_undo_index(&self) -> Option<u32> {
        let mut pending = 0usize;
        for (offset, entry) in self.entries.iter().enumerate().rev() {
            match entry.request.kind {
                RequestKind::Undo => pending += 1,
                RequestKind::Do | RequestKind::Redo => {
                    if pending > 0 {
                        pending -= 1;
                    } else {
                        return Some(self.begin + offset as u32);
                    }
                }
            }
        }
        None
    }

    /// Counter of the undo a redo issued now would revert. A plain
    /// `Do` entry clears the redo history.
    pub fn next_redo_index(&self) -> Option<u32> {
        let mut pending = 0usize;
        for (offset, entry) in self.entries.iter().enumerate().rev() {
            match entry.request.kind {
                RequestKind::Do => return None,
                RequestKind::Redo => pending += 1,
                RequestKind::Undo => {
                    if pending > 0 {
                        pending -= 1;
                    } else {
                        return Some(self.begin + offset as u32);
                    }
                }
            }
        }
        None
    }

    /// The request an undo issued now would revert.
    pub fn next_undo(&self) -> Option<&Request> {
        self.next_undo_index().and_then(|index| self.get(index))
    }

    /// The request a redo issued now would revert.
    pub fn next_redo(&self) -> Option<&Request> {
        self.next_redo_index().and_then(|index| self.get(index))
    }

    /// For the entry at `index`, the nearest later undo/redo that
    /// reverts it, if any.
    pub fn next_associated_undo(&self, index: u32) -> Option<u32> {
        let start = (index + 1).max(self.begin);
        (start..self.next_index()).find(|later| {
            self.entry(*later)
                .map(|entry| entry.associated == Some(index))
                .unwrap_or(false)
        })
    }

    /// Greatest counter `j >= index` such that the entries in
    /// `index..=j` can only be dropped together: an undo or redo
    /// stays with the request it reverts.
    pub fn upper_related(&self, index: u32) -> u32 {
        let mut upper = index;
        for later in index + 1..self.next_index() {
            if let Some(entry) = self.entry(later) {
                if matches!(entry.associated, Some(target) if target >= index && target <= upper) {
                    upper = later;
                }
            }
        }
        upper
    }

    /// Drops all entries with a counter below `up_to`.
    pub fn truncate_front(&mut self, up_to: u32) {
        if up_to <= self.begin {
            return;
        }
        let drop = ((up_to - self.begin) as usize).min(self.entries.len());
        self.entries.drain(..drop);
        self.begin += drop as u32;
    }

    fn entry(&self, index: u32) -> Option<&LogEntry> {
        if index < self.begin {
            return None;
        }
        self.entries.get((index - self.begin) as usize)
    }
}

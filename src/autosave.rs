//! Periodic persistence of modified sessions.
use crate::directory::Directory;
use crate::error::Error;
use crate::id::NodeId;
use crate::storage::Storage;
use std::time::{Duration, Instant};

/// Interval-driven writer of dirty sessions.
///
/// The runtime calls [`due`](Self::due) from its timer and
/// [`save_dirty`](Self::save_dirty) when it fires. Failures are
/// surfaced per session and never retried before the next interval.
#[derive(Debug)]
pub struct Autosave {
    interval: Duration,
    last: Option<Instant>,
}

impl Autosave {
    /// Creates an autosaver with the given interval.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// The configured interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns whether a save pass is due at `now`, and books it.
    pub fn due(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }

    /// Writes every session modified since its last save. Returns the
    /// failures; successfully saved sessions have their dirty flag
    /// cleared, failed ones are retried on the next pass.
    pub fn save_dirty<S: Storage>(
        &mut self,
        directory: &mut Directory<S>,
    ) -> Vec<(NodeId, Error)> {
        let mut failures = Vec::new();
        for id in directory.take_dirty_sessions() {
            if let Err(err) = directory.save_session(id) {
                tracing::warn!("autosave of node {} failed: {}", id, err);
                failures.push((id, err));
            } else {
                tracing::debug!("autosaved node {}", id);
            }
        }
        failures
    }
}

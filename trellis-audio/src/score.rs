//! Non-realtime score capture.
//!
//! A `ScoreBackend` stands in for a server while rendering offline: every
//! bundle is stamped with the score time set by the renderer and kept in
//! order, and the node tree is simulated so the score can be validated.

use std::sync::{Arc, Mutex};

use trellis_types::{BackendStatus, ServerNode};

use crate::backend::{lock, AudioBackend, BackendMessage, BackendResult};
use crate::node_tree::NodeTree;

/// One time-stamped bundle of a rendered score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreEntry {
    pub seconds: f64,
    pub messages: Vec<BackendMessage>,
}

/// An ordered list of score entries.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Score {
    pub entries: Vec<ScoreEntry>,
}

impl Score {
    /// Merge another score into this one, keeping entries sorted by time.
    /// Entries at equal times keep their relative order.
    pub fn merge(&mut self, other: Score) {
        self.entries.extend(other.entries);
        self.entries.sort_by(|a, b| a.seconds.total_cmp(&b.seconds));
    }

    pub fn message_count(&self) -> usize {
        self.entries.iter().map(|e| e.messages.len()).sum()
    }

    pub fn duration(&self) -> f64 {
        self.entries.last().map(|e| e.seconds).unwrap_or(0.0)
    }
}

pub struct ScoreBackend {
    now: Mutex<f64>,
    score: Mutex<Score>,
    tree: Mutex<NodeTree>,
}

impl ScoreBackend {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(0.0),
            score: Mutex::new(Score::default()),
            tree: Mutex::new(NodeTree::new()),
        }
    }

    /// Set the time stamped on subsequent bundles.
    pub fn set_time(&self, seconds: f64) {
        *lock(&self.now) = seconds;
    }

    pub fn score(&self) -> Score {
        lock(&self.score).clone()
    }
}

impl Default for ScoreBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioBackend for ScoreBackend {
    fn send_bundle(&self, messages: Vec<BackendMessage>, _offset_secs: f64) -> BackendResult {
        lock(&self.tree).apply_bundle(&messages)?;
        let seconds = *lock(&self.now);
        lock(&self.score).entries.push(ScoreEntry { seconds, messages });
        Ok(())
    }

    fn query_tree(&self) -> BackendResult<ServerNode> {
        Ok(lock(&self.tree).to_server_node())
    }

    fn status(&self) -> BackendResult<BackendStatus> {
        Ok(lock(&self.tree).status())
    }
}

/// Shares a `ScoreBackend` between the provider that writes to it and the
/// renderer that collects the score afterwards.
pub struct SharedScore(pub Arc<ScoreBackend>);

impl AudioBackend for SharedScore {
    fn send_bundle(&self, messages: Vec<BackendMessage>, offset_secs: f64) -> BackendResult {
        self.0.send_bundle(messages, offset_secs)
    }

    fn query_tree(&self) -> BackendResult<ServerNode> {
        self.0.query_tree()
    }

    fn status(&self) -> BackendResult<BackendStatus> {
        self.0.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{build_g_new, ADD_TO_TAIL, BUNDLE_IMMEDIATE};

    #[test]
    fn bundles_are_stamped_with_current_time() {
        let backend = ScoreBackend::new();
        backend.send_bundle(vec![build_g_new(1000, ADD_TO_TAIL, 0)], BUNDLE_IMMEDIATE).unwrap();
        backend.set_time(1.5);
        backend.send_bundle(vec![build_g_new(1001, ADD_TO_TAIL, 1000)], BUNDLE_IMMEDIATE).unwrap();

        let score = backend.score();
        assert_eq!(score.entries.len(), 2);
        assert_eq!(score.entries[0].seconds, 0.0);
        assert_eq!(score.entries[1].seconds, 1.5);
        assert_eq!(score.duration(), 1.5);
        assert_eq!(backend.query_tree().unwrap().node_count(), 3);
    }

    #[test]
    fn merge_keeps_time_order() {
        let entry = |seconds| ScoreEntry {
            seconds,
            messages: vec![build_g_new(1, ADD_TO_TAIL, 0)],
        };
        let mut a = Score {
            entries: vec![entry(0.0), entry(2.0)],
        };
        a.merge(Score {
            entries: vec![entry(1.0)],
        });
        let times: Vec<f64> = a.entries.iter().map(|e| e.seconds).collect();
        assert_eq!(times, vec![0.0, 1.0, 2.0]);
        assert_eq!(a.message_count(), 3);
    }
}

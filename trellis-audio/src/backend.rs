//! The command surface a context uses to drive a synthesis server.
//!
//! Core code never builds OSC packets. It assembles ordered
//! `BackendMessage`s and hands each structural change to an `AudioBackend`
//! as one bundle, which the server applies completely or not at all.
//! `TestBackend` records those bundles and keeps a simulated node tree so
//! ordering mistakes surface in tests.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use trellis_types::{BackendStatus, ServerNode};

use crate::node_tree::NodeTree;
use crate::osc_client::{osc_time_from_now, osc_time_immediate, OscClient};

pub type BackendResult<T = ()> = Result<T, BackendError>;

/// A rejected bundle, a dead connection, or a reply that never came.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{0}")]
pub struct BackendError(pub String);

impl From<std::io::Error> for BackendError {
    fn from(e: std::io::Error) -> Self {
        BackendError(e.to_string())
    }
}

impl From<String> for BackendError {
    fn from(message: String) -> Self {
        BackendError(message)
    }
}

/// One server command inside a bundle.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendMessage {
    pub addr: String,
    pub args: Vec<RawArg>,
}

impl BackendMessage {
    fn new(addr: &str, args: Vec<RawArg>) -> Self {
        Self {
            addr: addr.to_string(),
            args,
        }
    }
}

/// Message argument. Keeps `rosc` out of the core crate.
#[derive(Debug, Clone, PartialEq)]
pub enum RawArg {
    Int(i32),
    Float(f32),
    Str(String),
}

impl RawArg {
    pub fn as_int(&self) -> Option<i32> {
        match *self {
            RawArg::Int(v) => Some(v),
            RawArg::Float(v) => Some(v as i32),
            RawArg::Str(_) => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match *self {
            RawArg::Int(v) => Some(v as f32),
            RawArg::Float(v) => Some(v),
            RawArg::Str(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            RawArg::Str(v) => Some(v.as_str()),
            _ => None,
        }
    }
}

impl From<RawArg> for rosc::OscType {
    fn from(arg: RawArg) -> Self {
        match arg {
            RawArg::Int(v) => rosc::OscType::Int(v),
            RawArg::Float(v) => rosc::OscType::Float(v),
            RawArg::Str(v) => rosc::OscType::String(v),
        }
    }
}

/// Bundle offset meaning "run on arrival".
pub const BUNDLE_IMMEDIATE: f64 = -1.0;

// Add actions, relative to the target node.
pub const ADD_TO_HEAD: i32 = 0;
pub const ADD_TO_TAIL: i32 = 1;
pub const ADD_BEFORE: i32 = 2;
pub const ADD_AFTER: i32 = 3;

fn push_controls(args: &mut Vec<RawArg>, controls: &[(String, f32)]) {
    for (name, value) in controls {
        args.push(RawArg::Str(name.clone()));
        args.push(RawArg::Float(*value));
    }
}

pub fn build_g_new(group: i32, action: i32, target: i32) -> BackendMessage {
    BackendMessage::new(
        "/g_new",
        vec![RawArg::Int(group), RawArg::Int(action), RawArg::Int(target)],
    )
}

pub fn build_s_new(
    synthdef: &str,
    node: i32,
    action: i32,
    target: i32,
    controls: &[(String, f32)],
) -> BackendMessage {
    let mut args = vec![
        RawArg::Str(synthdef.to_string()),
        RawArg::Int(node),
        RawArg::Int(action),
        RawArg::Int(target),
    ];
    push_controls(&mut args, controls);
    BackendMessage::new("/s_new", args)
}

pub fn build_n_set(node: i32, controls: &[(String, f32)]) -> BackendMessage {
    let mut args = vec![RawArg::Int(node)];
    push_controls(&mut args, controls);
    BackendMessage::new("/n_set", args)
}

/// Close a voice's gate so its envelope releases and the synth frees itself.
pub fn build_release(node: i32) -> BackendMessage {
    build_n_set(node, &[("gate".to_string(), 0.0)])
}

pub fn build_n_free(node: i32) -> BackendMessage {
    BackendMessage::new("/n_free", vec![RawArg::Int(node)])
}

/// One connection to a synthesis server, bound to a single context.
pub trait AudioBackend: Send {
    /// Apply `messages` as one bundle. A failure means none of them took effect.
    fn send_bundle(&self, messages: Vec<BackendMessage>, offset_secs: f64) -> BackendResult;

    /// The live node tree below the root group.
    fn query_tree(&self) -> BackendResult<ServerNode>;

    fn status(&self) -> BackendResult<BackendStatus>;

    fn close(&self) -> BackendResult {
        Ok(())
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// SuperCollider over OSC.
pub struct ScBackend {
    client: OscClient,
}

impl ScBackend {
    pub fn new(client: OscClient) -> Self {
        Self { client }
    }
}

impl AudioBackend for ScBackend {
    fn send_bundle(&self, messages: Vec<BackendMessage>, offset_secs: f64) -> BackendResult {
        let time = if offset_secs < 0.0 {
            osc_time_immediate()
        } else {
            osc_time_from_now(offset_secs)
        };
        let packets = messages
            .into_iter()
            .map(|m| rosc::OscMessage {
                addr: m.addr,
                args: m.args.into_iter().map(rosc::OscType::from).collect(),
            })
            .collect();
        Ok(self.client.send_bundle(packets, time)?)
    }

    fn query_tree(&self) -> BackendResult<ServerNode> {
        self.client.query_tree()
    }

    fn status(&self) -> BackendResult<BackendStatus> {
        self.client.query_status()
    }

    fn close(&self) -> BackendResult {
        Ok(self.client.send_message("/notify", vec![rosc::OscType::Int(0)])?)
    }
}

/// In-memory server for tests.
///
/// Every bundle is recorded, accepted or not. Accepted bundles are applied
/// to a simulated node tree, which rejects a bundle whole on its first bad
/// message (unknown target, reused id). `reject_next_bundles` forces
/// failures regardless of content.
#[derive(Default)]
pub struct TestBackend {
    sent: Mutex<Vec<Vec<BackendMessage>>>,
    tree: Mutex<NodeTree>,
    rejections: Mutex<usize>,
    closed: Mutex<bool>,
}

impl TestBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bundles(&self) -> Vec<Vec<BackendMessage>> {
        lock(&self.sent).clone()
    }

    /// Forget recorded bundles. The simulated tree is kept.
    pub fn clear(&self) {
        lock(&self.sent).clear();
    }

    pub fn messages(&self) -> Vec<BackendMessage> {
        lock(&self.sent).iter().flatten().cloned().collect()
    }

    pub fn messages_to(&self, addr: &str) -> Vec<BackendMessage> {
        lock(&self.sent)
            .iter()
            .flatten()
            .filter(|m| m.addr == addr)
            .cloned()
            .collect()
    }

    pub fn nodes_freed(&self) -> Vec<i32> {
        self.messages_to("/n_free")
            .iter()
            .flat_map(|m| m.args.iter().filter_map(RawArg::as_int))
            .collect()
    }

    /// Synthdef names from every `/s_new`, in send order.
    pub fn synths_created(&self) -> Vec<String> {
        self.messages_to("/s_new")
            .iter()
            .filter_map(|m| m.args.first().and_then(RawArg::as_str))
            .map(str::to_string)
            .collect()
    }

    pub fn reject_next_bundles(&self, count: usize) {
        *lock(&self.rejections) = count;
    }

    pub fn tree(&self) -> ServerNode {
        lock(&self.tree).to_server_node()
    }

    pub fn is_closed(&self) -> bool {
        *lock(&self.closed)
    }
}

impl AudioBackend for TestBackend {
    fn send_bundle(&self, messages: Vec<BackendMessage>, _offset_secs: f64) -> BackendResult {
        lock(&self.sent).push(messages.clone());
        let mut rejections = lock(&self.rejections);
        if *rejections > 0 {
            *rejections -= 1;
            return Err(BackendError("bundle rejected".to_string()));
        }
        drop(rejections);
        if self.is_closed() {
            return Err(BackendError("connection closed".to_string()));
        }
        lock(&self.tree).apply_bundle(&messages)
    }

    fn query_tree(&self) -> BackendResult<ServerNode> {
        Ok(self.tree())
    }

    fn status(&self) -> BackendResult<BackendStatus> {
        Ok(lock(&self.tree).status())
    }

    fn close(&self) -> BackendResult {
        *lock(&self.closed) = true;
        Ok(())
    }
}

/// Lets a provider own the backend while the test keeps a handle on it.
pub struct SharedTestBackend(pub Arc<TestBackend>);

impl AudioBackend for SharedTestBackend {
    fn send_bundle(&self, messages: Vec<BackendMessage>, offset_secs: f64) -> BackendResult {
        self.0.send_bundle(messages, offset_secs)
    }

    fn query_tree(&self) -> BackendResult<ServerNode> {
        self.0.query_tree()
    }

    fn status(&self) -> BackendResult<BackendStatus> {
        self.0.status()
    }

    fn close(&self) -> BackendResult {
        self.0.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track_group() -> Vec<BackendMessage> {
        vec![
            build_g_new(1000, ADD_TO_TAIL, 0),
            build_s_new("mixer/patch/2x2", 1001, ADD_TO_TAIL, 1000, &[("in".to_string(), 16.0)]),
        ]
    }

    #[test]
    fn accepted_bundle_builds_the_tree() {
        let backend = TestBackend::new();
        backend.send_bundle(track_group(), BUNDLE_IMMEDIATE).unwrap();

        assert_eq!(backend.bundles().len(), 1);
        assert_eq!(backend.synths_created(), vec!["mixer/patch/2x2".to_string()]);
        assert_eq!(backend.tree().execution_order(), vec![0, 1000, 1001]);
    }

    #[test]
    fn forced_rejection_is_recorded_but_not_applied() {
        let backend = TestBackend::new();
        backend.reject_next_bundles(1);
        assert!(backend.send_bundle(track_group(), BUNDLE_IMMEDIATE).is_err());
        assert_eq!(backend.bundles().len(), 1);
        assert_eq!(backend.tree().node_count(), 1);

        backend.send_bundle(track_group(), BUNDLE_IMMEDIATE).unwrap();
        assert_eq!(backend.tree().node_count(), 3);
    }

    #[test]
    fn bad_target_rejects_the_whole_bundle() {
        let backend = TestBackend::new();
        let messages = vec![build_g_new(1000, ADD_TO_TAIL, 0), build_g_new(1001, ADD_TO_TAIL, 999)];
        assert!(backend.send_bundle(messages, BUNDLE_IMMEDIATE).is_err());
        assert!(backend.tree().find(1000).is_none());
    }

    #[test]
    fn freeing_a_group_frees_its_synths() {
        let backend = TestBackend::new();
        backend.send_bundle(track_group(), BUNDLE_IMMEDIATE).unwrap();
        backend.send_bundle(vec![build_n_free(1000)], BUNDLE_IMMEDIATE).unwrap();
        assert_eq!(backend.nodes_freed(), vec![1000]);
        assert_eq!(backend.tree().node_count(), 1);
    }

    #[test]
    fn release_closes_the_gate() {
        let message = build_release(1200);
        assert_eq!(message.addr, "/n_set");
        assert_eq!(message.args[1].as_str(), Some("gate"));
        assert_eq!(message.args[2].as_float(), Some(0.0));
    }

    #[test]
    fn closed_backend_refuses_bundles() {
        let shared = Arc::new(TestBackend::new());
        let backend = SharedTestBackend(Arc::clone(&shared));
        backend.close().unwrap();
        assert!(shared.is_closed());
        assert!(backend.send_bundle(track_group(), BUNDLE_IMMEDIATE).is_err());
    }
}

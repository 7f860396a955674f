//! Binding of one context to one backend connection.
//!
//! A `Provider` owns the connection and everything allocated through it:
//! server node ids, private audio buses and the per-node record of which
//! groups and synths exist. Commands are queued and only reach the backend
//! as one bundle when the enclosing grouped update commits.

use std::collections::{BTreeMap, HashMap};

use trellis_audio::backend::{build_n_free, build_release, build_s_new, ADD_BEFORE, ADD_TO_TAIL};
use trellis_audio::{
    AudioBackend, AudioBus, BackendError, BackendMessage, BackendResult, BusAllocator, NodeRegistry,
    BUNDLE_IMMEDIATE,
};
use trellis_types::{BackendStatus, ServerNode};

use crate::config::Settings;
use crate::tree::{NodeId, PatchRole, Tree};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BusRole {
    /// Where the node's own signal is processed.
    Main,
    /// Where sends and receives deliver into the node.
    Input,
    /// Where a rack's chains sum.
    Mix,
}

/// A synth as the server should see it.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthSpec {
    pub def: String,
    pub controls: Vec<(String, f32)>,
}

impl SynthSpec {
    pub fn new(def: impl Into<String>) -> Self {
        Self {
            def: def.into(),
            controls: Vec::new(),
        }
    }

    pub fn control(mut self, name: &str, value: f32) -> Self {
        self.controls.push((name.to_string(), value));
        self
    }

    /// Controls in `self` whose values differ from (or are missing in) `other`.
    pub fn changed_controls(&self, other: &SynthSpec) -> Vec<(String, f32)> {
        self.controls
            .iter()
            .filter(|(name, value)| {
                !other
                    .controls
                    .iter()
                    .any(|(other_name, other_value)| other_name == name && other_value == value)
            })
            .cloned()
            .collect()
    }
}

/// Channel-adapting patch between an `inputs`-wide and an `outputs`-wide bus.
pub fn patch_def(inputs: u8, outputs: u8) -> String {
    format!("mixer/patch/{}x{}", inputs, outputs)
}

#[derive(Debug, Clone, PartialEq)]
pub struct SynthInstance {
    pub node_id: i32,
    pub spec: SynthSpec,
}

/// What one tree node owns on the server.
#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    pub group: i32,
    /// Width the buses were allocated at.
    pub channels: u8,
    pub buses: BTreeMap<BusRole, AudioBus>,
    /// Patch and body synths keyed by layout slot.
    pub synths: BTreeMap<usize, SynthInstance>,
    /// Sounding instrument voices keyed by pitch.
    pub voices: BTreeMap<u8, i32>,
}

impl Allocation {
    pub fn new(group: i32, channels: u8) -> Self {
        Self {
            group,
            channels,
            buses: BTreeMap::new(),
            synths: BTreeMap::new(),
            voices: BTreeMap::new(),
        }
    }

    pub fn bus(&self, role: BusRole) -> Option<AudioBus> {
        self.buses.get(&role).copied()
    }

    fn node_ids(&self) -> Vec<i32> {
        std::iter::once(self.group)
            .chain(self.synths.values().map(|s| s.node_id))
            .chain(self.voices.values().copied())
            .collect()
    }
}

/// Everything a provider has allocated. Cloned as a checkpoint so a
/// rejected bundle can be unwound.
#[derive(Debug, Clone)]
pub struct ProviderState {
    pub nodes: NodeRegistry,
    pub buses: BusAllocator,
    pub allocations: HashMap<NodeId, Allocation>,
}

impl ProviderState {
    pub fn new(settings: &Settings) -> Self {
        Self {
            nodes: NodeRegistry::new(settings.first_node_id),
            buses: BusAllocator::new(settings.first_private_bus),
            allocations: HashMap::new(),
        }
    }

    pub fn allocation(&self, node: NodeId) -> Option<&Allocation> {
        self.allocations.get(&node)
    }

    pub fn group(&self, node: NodeId) -> Option<i32> {
        self.allocations.get(&node).map(|a| a.group)
    }

    pub fn bus(&self, node: NodeId, role: BusRole) -> Option<AudioBus> {
        self.allocations.get(&node).and_then(|a| a.bus(role))
    }

    /// Forget a node's allocation, returning its buses and ids to the pools.
    pub(crate) fn drop_allocation(&mut self, node: NodeId) -> Option<Allocation> {
        let allocation = self.allocations.remove(&node)?;
        for bus in allocation.buses.values() {
            self.buses.release(*bus);
        }
        self.nodes.unregister_all(allocation.node_ids());
        Some(allocation)
    }
}

pub struct Provider {
    name: String,
    backend: Box<dyn AudioBackend>,
    state: ProviderState,
    pending: Vec<BackendMessage>,
}

impl Provider {
    pub fn new(name: impl Into<String>, backend: Box<dyn AudioBackend>, settings: &Settings) -> Self {
        Self {
            name: name.into(),
            backend,
            state: ProviderState::new(settings),
            pending: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> &ProviderState {
        &self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut ProviderState {
        &mut self.state
    }

    /// Roll bookkeeping back to a checkpoint and drop anything queued.
    pub(crate) fn restore(&mut self, state: ProviderState) {
        self.state = state;
        self.pending.clear();
    }

    pub(crate) fn discard_pending(&mut self) {
        self.pending.clear();
    }

    /// Queue freeing of the context group and forget every allocation, so
    /// the next sync rebuilds the context from nothing. Ids keep counting up.
    pub(crate) fn clear_server(&mut self, context: NodeId) {
        if let Some(group) = self.state.group(context) {
            self.pending.push(build_n_free(group));
        }
        let nodes: Vec<NodeId> = self.state.allocations.keys().copied().collect();
        for node in nodes {
            self.state.drop_allocation(node);
        }
    }

    pub(crate) fn push(&mut self, message: BackendMessage) {
        self.pending.push(message);
    }

    pub fn pending(&self) -> &[BackendMessage] {
        &self.pending
    }

    /// Send everything queued as one bundle. Returns the number of messages sent.
    pub(crate) fn flush(&mut self) -> BackendResult<usize> {
        if self.pending.is_empty() {
            return Ok(0);
        }
        let messages = std::mem::take(&mut self.pending);
        let count = messages.len();
        match self.backend.send_bundle(messages, BUNDLE_IMMEDIATE) {
            Ok(()) => {
                log::debug!(target: "provider", "{}: flushed bundle of {} messages", self.name, count);
                Ok(count)
            }
            Err(e) => {
                log::warn!(target: "provider", "{}: bundle of {} messages rejected: {}", self.name, count, e);
                Err(e)
            }
        }
    }

    /// Queue teardown of everything allocated for `node` and below, and
    /// forget those allocations. Only the outermost groups are freed; the
    /// server frees their contents with them.
    pub(crate) fn release_subtree(&mut self, tree: &Tree, node: NodeId) {
        let subtree = tree.descendants(node);
        for id in &subtree {
            if !self.state.allocations.contains_key(id) {
                continue;
            }
            let covered = tree
                .ancestors(*id)
                .into_iter()
                .take_while(|a| tree.is_descendant_of(*a, node))
                .any(|a| self.state.allocations.contains_key(&a));
            if !covered {
                if let Some(group) = self.state.group(*id) {
                    self.pending.push(build_n_free(group));
                }
            }
        }
        let mut released = 0;
        for id in subtree {
            if self.state.drop_allocation(id).is_some() {
                released += 1;
            }
        }
        if released > 0 {
            log::debug!(target: "provider", "{}: released {} allocations under {}", self.name, released, node);
        }
    }

    /// Start a voice on an instrument device. A voice already sounding at
    /// the same pitch is released first.
    pub(crate) fn start_voice(&mut self, device: NodeId, pitch: u8, spec: SynthSpec) -> bool {
        self.stop_voice(device, pitch);
        let Some(allocation) = self.state.allocations.get(&device) else {
            return false;
        };
        let out_slot = crate::tree::DEVICE_LAYOUT
            .iter()
            .position(|entry| *entry == crate::tree::LayoutSlot::Patch(PatchRole::DeviceOut));
        let (action, target) = match out_slot.and_then(|slot| allocation.synths.get(&slot)) {
            Some(out) => (ADD_BEFORE, out.node_id),
            None => (ADD_TO_TAIL, allocation.group),
        };
        let id = self.state.nodes.allocate();
        self.pending
            .push(build_s_new(&spec.def, id, action, target, &spec.controls));
        if let Some(allocation) = self.state.allocations.get_mut(&device) {
            allocation.voices.insert(pitch, id);
        }
        true
    }

    /// Release a sounding voice; the synth frees itself once its gate closes.
    pub(crate) fn stop_voice(&mut self, device: NodeId, pitch: u8) -> bool {
        let Some(id) = self
            .state
            .allocations
            .get_mut(&device)
            .and_then(|a| a.voices.remove(&pitch))
        else {
            return false;
        };
        self.pending.push(build_release(id));
        self.state.nodes.unregister(id);
        true
    }

    pub fn query_tree(&self) -> BackendResult<ServerNode> {
        self.backend.query_tree()
    }

    pub fn status(&self) -> BackendResult<BackendStatus> {
        self.backend.status()
    }

    /// Queue teardown of the whole context, send it, and close the connection.
    pub(crate) fn teardown(mut self, tree: &Tree, context: NodeId) -> Result<(), BackendError> {
        self.release_subtree(tree, context);
        let sent = self.flush();
        let closed = self.backend.close();
        self.state.nodes.invalidate_all();
        log::info!(target: "provider", "{}: unbound", self.name);
        sent.and(closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use trellis_audio::backend::build_g_new;
    use trellis_audio::{SharedTestBackend, TestBackend};

    fn provider() -> (Provider, Arc<TestBackend>) {
        let backend = Arc::new(TestBackend::new());
        let provider = Provider::new(
            "ctx",
            Box::new(SharedTestBackend(Arc::clone(&backend))),
            &Settings::default(),
        );
        (provider, backend)
    }

    #[test]
    fn changed_controls_only_reports_differences() {
        let old = SynthSpec::new("d").control("in", 16.0).control("out", 18.0);
        let new = SynthSpec::new("d").control("in", 16.0).control("out", 20.0);
        assert_eq!(new.changed_controls(&old), vec![("out".to_string(), 20.0)]);
    }

    #[test]
    fn flush_sends_one_bundle_and_clears_queue() {
        let (mut provider, backend) = provider();
        provider.push(build_g_new(1000, ADD_TO_TAIL, 0));
        provider.push(build_g_new(1001, ADD_TO_TAIL, 1000));
        assert_eq!(provider.flush().unwrap(), 2);
        assert!(provider.pending().is_empty());
        assert_eq!(backend.bundles().len(), 1);
        assert_eq!(provider.flush().unwrap(), 0);
        assert_eq!(backend.bundles().len(), 1);
    }

    #[test]
    fn rejected_flush_reports_error() {
        let (mut provider, backend) = provider();
        backend.reject_next_bundles(1);
        provider.push(build_g_new(1000, ADD_TO_TAIL, 0));
        assert!(provider.flush().is_err());
        assert!(provider.pending().is_empty());
    }

    #[test]
    fn drop_allocation_returns_resources() {
        let (mut provider, _) = provider();
        let state = provider.state_mut();
        let group = state.nodes.allocate();
        let mut allocation = Allocation::new(group, 2);
        allocation.buses.insert(BusRole::Main, state.buses.alloc(2));
        state.allocations.insert(NodeId(5), allocation);
        assert_eq!(state.buses.in_use(), 1);

        assert!(state.drop_allocation(NodeId(5)).is_some());
        assert_eq!(state.buses.in_use(), 0);
        assert!(!state.nodes.is_live(group));
    }

    #[test]
    fn patch_def_names_widths() {
        assert_eq!(patch_def(2, 4), "mixer/patch/2x4");
    }
}

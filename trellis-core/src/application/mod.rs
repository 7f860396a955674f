//! The application: owner of the tree, its backend bindings, the transport
//! and the event bus.
//!
//! Every mutation runs inside [`Application::grouped`]. The outermost call
//! checkpoints the tree and allocator bookkeeping, runs the edit, then
//! reconciles channel widths and backend state for every context and sends
//! each bound context's commands as one bundle. If the edit fails or a
//! bundle is rejected, everything is put back as it was and no events are
//! published.

mod edit;
mod lifecycle;
mod mixer;
mod playback;

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_channel::Receiver;
use trellis_audio::{Connector, ScConnector, ScoreBackend};
use trellis_types::{ApplicationStatus, Document, EntityKind, Event, FaderPoint, Uuid};

use crate::channels::{self, ChannelMap};
use crate::config::{Config, Settings};
use crate::error::{Result, StateError, ValidationError};
use crate::events::EventBus;
use crate::provider::{Provider, ProviderState};
use crate::reconcile;
use crate::routing;
use crate::serialize;
use crate::transport::Transport;
use crate::tree::{ContainerRole, NodeId, Payload, Tree};

pub use edit::DeviceSpec;
pub use playback::TrackPlayback;

use playback::Playback;

/// State captured by the outermost grouped update.
struct Checkpoint {
    tree: Tree,
    providers: HashMap<NodeId, ProviderState>,
    widths: HashMap<NodeId, ChannelMap>,
    transport: Transport,
    playback: Playback,
}

#[derive(Default)]
struct Batch {
    depth: usize,
    checkpoint: Option<Checkpoint>,
    events: Vec<Event>,
    /// Contexts whose bundle reached the server during the current commit.
    flushed: Vec<NodeId>,
}

/// Offline render in progress.
struct RenderSession {
    origin: f64,
    scores: Vec<Arc<ScoreBackend>>,
}

pub struct Application {
    tree: Tree,
    settings: Settings,
    status: ApplicationStatus,
    connector: Arc<dyn Connector>,
    providers: HashMap<NodeId, Provider>,
    /// Effective channel counts per context as of the last commit.
    widths: HashMap<NodeId, ChannelMap>,
    transport: Transport,
    playback: Playback,
    events: EventBus,
    batch: Batch,
    render: Option<RenderSession>,
}

impl Application {
    pub fn new(settings: Settings, connector: Arc<dyn Connector>) -> Self {
        let mut tree = Tree::new(Uuid::new_v4());
        tree.node_mut(NodeId::ROOT).channel_count = Some(settings.channel_count);
        let transport = Transport::new(settings.tempo, settings.time_signature);
        Self {
            tree,
            settings,
            status: ApplicationStatus::Offline,
            connector,
            providers: HashMap::new(),
            widths: HashMap::new(),
            transport,
            playback: Playback::default(),
            events: EventBus::new(),
            batch: Batch::default(),
            render: None,
        }
    }

    /// An application connecting to SuperCollider servers as configured.
    pub fn from_config(config: &Config) -> Self {
        let settings = config.settings();
        let connector = ScConnector::new(&settings.server_host, settings.server_port, settings.reply_timeout);
        Self::new(settings, Arc::new(connector))
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn status(&self) -> ApplicationStatus {
        self.status
    }

    pub fn uuid(&self) -> Uuid {
        self.tree.uuid(NodeId::ROOT)
    }

    pub fn root(&self) -> NodeId {
        NodeId::ROOT
    }

    pub fn channel_count(&self) -> u8 {
        self.tree
            .node(NodeId::ROOT)
            .channel_count
            .unwrap_or(self.settings.channel_count)
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn subscribe(&mut self) -> Receiver<Event> {
        self.events.subscribe()
    }

    pub fn provider(&self, context: NodeId) -> Option<&Provider> {
        self.providers.get(&context)
    }

    pub fn is_bound(&self, context: NodeId) -> bool {
        self.providers.contains_key(&context)
    }

    pub fn lookup(&self, uuid: Uuid) -> Option<NodeId> {
        self.tree.lookup(uuid)
    }

    pub fn graph_order(&self, node: NodeId) -> Vec<usize> {
        if self.tree.contains(node) {
            self.tree.graph_order(node)
        } else {
            Vec::new()
        }
    }

    /// Derived width of a track-like or device, as of the last change.
    pub fn effective_channel_count(&self, node: NodeId) -> Option<u8> {
        if !self.tree.contains(node) {
            return None;
        }
        let context = self.tree.context_of(node)?;
        self.widths.get(&context)?.get(&node).copied()
    }

    pub fn effective_target(&self, send: NodeId) -> Option<NodeId> {
        if !self.tree.contains(send) {
            return None;
        }
        routing::effective_target(&self.tree, send)
    }

    pub fn effective_source(&self, receive: NodeId) -> Option<NodeId> {
        if !self.tree.contains(receive) {
            return None;
        }
        routing::effective_source(&self.tree, receive)
    }

    pub fn contexts(&self) -> Vec<NodeId> {
        self.tree.members(NodeId::ROOT, ContainerRole::Contexts).to_vec()
    }

    pub fn scenes(&self) -> Vec<NodeId> {
        self.tree.members(NodeId::ROOT, ContainerRole::Scenes).to_vec()
    }

    pub fn controllers(&self) -> Vec<NodeId> {
        self.tree.members(NodeId::ROOT, ContainerRole::Controllers).to_vec()
    }

    pub fn master_track(&self, context: NodeId) -> Option<NodeId> {
        self.fixed(context, EntityKind::MasterTrack)
    }

    pub fn cue_track(&self, context: NodeId) -> Option<NodeId> {
        self.fixed(context, EntityKind::CueTrack)
    }

    /// Top-level tracks of a context, or sub-tracks of a track-like.
    pub fn tracks(&self, owner: NodeId) -> Vec<NodeId> {
        if !self.tree.contains(owner) {
            return Vec::new();
        }
        let role = match self.tree.payload(owner) {
            Payload::Context => ContainerRole::Tracks,
            _ => ContainerRole::SubTracks,
        };
        self.members(owner, role)
    }

    pub fn devices(&self, owner: NodeId) -> Vec<NodeId> {
        self.members(owner, ContainerRole::Devices)
    }

    pub fn chains(&self, rack: NodeId) -> Vec<NodeId> {
        self.members(rack, ContainerRole::Chains)
    }

    pub fn sends(&self, track: NodeId, position: FaderPoint) -> Vec<NodeId> {
        let role = match position {
            FaderPoint::PreFader => ContainerRole::PreFaderSends,
            FaderPoint::PostFader => ContainerRole::PostFaderSends,
        };
        self.members(track, role)
    }

    pub fn receives(&self, track: NodeId) -> Vec<NodeId> {
        self.members(track, ContainerRole::Receives)
    }

    pub fn slots(&self, track: NodeId) -> Vec<NodeId> {
        self.members(track, ContainerRole::Slots)
    }

    pub fn parameters(&self, owner: NodeId) -> Vec<NodeId> {
        self.members(owner, ContainerRole::Parameters)
    }

    /// The parameter of `owner` called `name`.
    pub fn parameter(&self, owner: NodeId, name: &str) -> Option<NodeId> {
        self.parameters(owner)
            .into_iter()
            .find(|p| self.tree.node(*p).name.as_deref() == Some(name))
    }

    pub fn parameter_value(&self, owner: NodeId, name: &str) -> Option<f32> {
        match self.tree.payload(self.parameter(owner, name)?) {
            Payload::Parameter(value) => Some(value.value),
            _ => None,
        }
    }

    pub fn clip(&self, slot: NodeId) -> Option<NodeId> {
        self.fixed(slot, EntityKind::Clip)
    }

    fn members(&self, owner: NodeId, role: ContainerRole) -> Vec<NodeId> {
        if !self.tree.contains(owner) {
            return Vec::new();
        }
        self.tree.members(owner, role).to_vec()
    }

    fn fixed(&self, owner: NodeId, kind: EntityKind) -> Option<NodeId> {
        if !self.tree.contains(owner) {
            return None;
        }
        self.tree.fixed_child(owner, kind)
    }

    /// Human-readable context label, also used to pick its connection.
    pub fn context_label(&self, context: NodeId) -> String {
        match &self.tree.node(context).name {
            Some(name) => name.clone(),
            None => self.tree.uuid(context).to_string(),
        }
    }

    // ─── Grouped updates ────────────────────────────────────────────

    /// Run `f` as one atomic update. Nested calls join the outermost one.
    pub fn grouped<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let outermost = self.batch.depth == 0;
        if outermost {
            self.batch.checkpoint = Some(self.checkpoint());
        }
        self.batch.depth += 1;
        let result = f(self);
        self.batch.depth -= 1;
        if !outermost {
            return result;
        }

        let result = result.and_then(|value| self.commit().map(|()| value));
        let checkpoint = self.batch.checkpoint.take();
        match result {
            Ok(value) => {
                for event in std::mem::take(&mut self.batch.events) {
                    self.events.publish(event);
                }
                Ok(value)
            }
            Err(e) => {
                let flushed = std::mem::take(&mut self.batch.flushed);
                if let Some(checkpoint) = checkpoint {
                    self.restore(checkpoint, &flushed);
                }
                self.replay(&flushed);
                self.batch.events.clear();
                log::debug!(target: "tree", "grouped update rolled back: {}", e);
                Err(e)
            }
        }
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            tree: self.tree.clone(),
            providers: self
                .providers
                .iter()
                .map(|(context, provider)| (*context, provider.state().clone()))
                .collect(),
            widths: self.widths.clone(),
            transport: self.transport.clone(),
            playback: self.playback.clone(),
        }
    }

    /// Roll back to `checkpoint`. Contexts in `flushed` keep their current
    /// bookkeeping, since their servers already applied the bundle.
    fn restore(&mut self, checkpoint: Checkpoint, flushed: &[NodeId]) {
        self.tree = checkpoint.tree;
        self.widths = checkpoint.widths;
        self.transport = checkpoint.transport;
        self.playback = checkpoint.playback;
        let mut states = checkpoint.providers;
        self.providers.retain(|context, _| states.contains_key(context));
        for (context, provider) in self.providers.iter_mut() {
            match states.remove(context) {
                Some(_) if flushed.contains(context) => provider.discard_pending(),
                Some(state) => provider.restore(state),
                None => {}
            }
        }
    }

    /// Rebuild contexts whose server ran ahead of a rolled-back update,
    /// each as one bundle from the restored tree.
    fn replay(&mut self, contexts: &[NodeId]) {
        for context in contexts {
            let (Some(provider), Some(widths)) = (self.providers.get_mut(context), self.widths.get(context)) else {
                continue;
            };
            provider.clear_server(*context);
            reconcile::sync(&self.tree, *context, widths, provider);
            match provider.flush() {
                Ok(count) => {
                    log::info!(target: "provider", "{}: replayed {} messages after rollback", provider.name(), count)
                }
                Err(e) => log::error!(target: "provider", "{}: replay after rollback failed: {}", provider.name(), e),
            }
        }
    }

    /// Recompute widths, bring every bound context in line and send the bundles.
    fn commit(&mut self) -> Result<()> {
        let contexts = self.contexts();
        self.widths.retain(|context, _| contexts.contains(context));

        for context in &contexts {
            let widths = channels::compute(&self.tree, *context);
            let mut changed: Vec<(Vec<usize>, Uuid, u8)> = match self.widths.get(context) {
                Some(previous) => widths
                    .iter()
                    .filter(|(node, count)| previous.get(*node).is_some_and(|old| old != *count))
                    .map(|(node, count)| (self.tree.graph_order(*node), self.tree.uuid(*node), *count))
                    .collect(),
                None => Vec::new(),
            };
            changed.sort();
            for (_, uuid, channel_count) in changed {
                self.emit(Event::ChannelCountChanged { uuid, channel_count });
            }

            if let Some(provider) = self.providers.get_mut(context) {
                reconcile::sync(&self.tree, *context, &widths, provider);
            }
            self.widths.insert(*context, widths);
        }

        if let Some(session) = &self.render {
            let seconds = self.transport.seconds_at(self.transport.offset() - session.origin);
            for score in &session.scores {
                score.set_time(seconds);
            }
        }
        self.batch.flushed.clear();
        for context in &contexts {
            if let Some(provider) = self.providers.get_mut(context) {
                if provider.flush()? > 0 {
                    self.batch.flushed.push(*context);
                }
            }
        }
        Ok(())
    }

    /// Publish now, or at commit when inside a grouped update.
    pub(crate) fn emit(&mut self, event: Event) {
        if self.batch.depth > 0 {
            self.batch.events.push(event);
        } else {
            self.events.publish(event);
        }
    }

    // ─── Validation helpers ─────────────────────────────────────────

    pub(crate) fn require_attached(&self, node: NodeId) -> Result<NodeId> {
        self.tree.check(node)?;
        if !self.tree.is_attached(node) {
            return Err(StateError::Detached(self.tree.uuid(node)).into());
        }
        Ok(node)
    }

    /// An attached node whose payload satisfies `accepts`.
    pub(crate) fn require(&self, node: NodeId, operation: &'static str, accepts: fn(&Payload) -> bool) -> Result<NodeId> {
        self.require_attached(node)?;
        if accepts(self.tree.payload(node)) {
            return Ok(node);
        }
        let kind = self.tree.kind(node).unwrap_or(EntityKind::Application);
        Err(ValidationError::Unsupported { kind, operation }.into())
    }

    pub(crate) fn require_not_rendering(&self) -> Result<()> {
        if self.status == ApplicationStatus::NonRealtime {
            return Err(StateError::NonRealtime.into());
        }
        Ok(())
    }

    // ─── Documents ──────────────────────────────────────────────────

    pub fn serialize(&self) -> Document {
        serialize::serialize(&self.tree, &self.transport)
    }

    pub fn to_json(&self) -> Result<String> {
        serialize::to_json(&self.serialize())
    }

    /// Rebuild an offline application from a document.
    pub fn from_document(document: &Document, settings: Settings, connector: Arc<dyn Connector>) -> Result<Self> {
        let restored = serialize::deserialize(document, &settings)?;
        let mut app = Self::new(settings, connector);
        app.tree = restored.tree;
        app.transport.set_tempo(restored.tempo)?;
        let (numerator, denominator) = restored.time_signature;
        app.transport.set_time_signature(numerator, denominator)?;
        app.grouped(|_| Ok(()))?;
        log::info!(target: "serialize", "loaded {} entities", document.entities.len());
        Ok(app)
    }

    pub fn from_json(json: &str, settings: Settings, connector: Arc<dyn Connector>) -> Result<Self> {
        let document = serialize::from_json(json)?;
        Self::from_document(&document, settings, connector)
    }
}

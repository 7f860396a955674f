//! Snapshotting the tree to a `Document` and rebuilding it.
//!
//! Records are written in pre-order, application first, structural
//! containers implied by each record's kind. Rebuilding runs a work queue:
//! a record whose parent (or send target) is not there yet goes to the back
//! of the queue, and a record that keeps failing to resolve is dropped with
//! a warning instead of looping forever.

use std::collections::{HashMap, VecDeque};

use trellis_types::{
    DeviceRole, Document, EntityKind, EntityRecord, EntitySpec, FaderPoint, Uuid,
};

use crate::channels::validate_channel_count;
use crate::clip::Clip;
use crate::config::Settings;
use crate::error::{Result, ValidationError};
use crate::mixer::MixerState;
use crate::transport::Transport;
use crate::tree::{
    ContainerRole, DeviceBody, NodeId, ParameterValue, Payload, ReceiveRoute, SendRoute, Tree,
};

/// How many times a record may be put back before it is discarded.
pub const MAX_VISITS: usize = 2;

pub fn serialize(tree: &Tree, transport: &Transport) -> Document {
    let mut entities = Vec::new();
    for node in tree.descendants(tree.root()) {
        let Some(kind) = tree.kind(node) else {
            continue;
        };
        if node != tree.root() && !tree.is_attached(node) {
            continue;
        }
        entities.push(record_for(tree, node, kind, transport));
    }
    log::debug!(target: "serialize", "serialized {} records", entities.len());
    Document { entities }
}

fn record_for(tree: &Tree, node: NodeId, kind: EntityKind, transport: &Transport) -> EntityRecord {
    let data = tree.node(node);
    let mut record = EntityRecord::new(kind, data.uuid);
    record.meta.name = data.name.clone();
    if node != tree.root() {
        record.meta.parent = tree.owner(node).map(|owner| tree.uuid(owner));
        record.meta.owner = tree
            .ancestors(node)
            .into_iter()
            .find(|a| *tree.payload(*a) == Payload::Context)
            .map(|context| tree.uuid(context));
    }

    let spec = &mut record.spec;
    spec.channel_count = data.channel_count;
    match &data.payload {
        Payload::Application => {
            let (numerator, denominator) = transport.time_signature();
            spec.tempo = Some(transport.tempo());
            spec.time_signature = Some([numerator, denominator]);
        }
        Payload::Device(body) => {
            spec.synthdef = Some(body.synthdef.clone());
        }
        Payload::Send(route) => {
            spec.position = Some(match tree.container_role_of(node) {
                Some(ContainerRole::PreFaderSends) => FaderPoint::PreFader,
                _ => FaderPoint::PostFader,
            });
            spec.target = route.target;
            spec.gain = nonzero(route.gain);
        }
        Payload::Receive(route) => {
            spec.source = Some(route.source);
            spec.gain = nonzero(route.gain);
        }
        Payload::Parameter(value) => {
            spec.default = Some(value.default);
            if value.value != value.default {
                spec.value = Some(value.value);
            }
        }
        Payload::Slot => {
            spec.clip = tree
                .fixed_child(node, EntityKind::Clip)
                .map(|clip| tree.uuid(clip));
        }
        Payload::Track | Payload::Chain => {
            spec.is_muted = data.mixer.muted;
            spec.is_soloed = data.mixer.soloed;
            spec.is_cued = data.mixer.cued;
        }
        Payload::Clip(clip) => {
            spec.duration = Some(clip.duration());
            spec.is_looping = Some(clip.is_looping());
            spec.notes = clip.notes();
        }
        _ => {}
    }
    record
}

fn nonzero(value: f32) -> Option<f32> {
    (value != 0.0).then_some(value)
}

/// A tree rebuilt from a document, with the application-level settings
/// carried by its first record.
pub struct Restored {
    pub tree: Tree,
    pub tempo: f64,
    pub time_signature: (u32, u32),
}

enum Outcome {
    Attached,
    /// A referenced entity is not there yet.
    Deferred(Uuid),
}

struct Builder<'a> {
    tree: Tree,
    /// Position of each record in the document, for sibling ordering.
    order: HashMap<Uuid, usize>,
    index: usize,
    visits: usize,
    _document: &'a Document,
}

type Handler = fn(&mut Builder<'_>, &EntityRecord) -> Result<Outcome>;

/// One rebuild function per entity kind.
static HANDLERS: &[(EntityKind, Handler)] = &[
    (EntityKind::Controller, rebuild_controller),
    (EntityKind::Scene, rebuild_scene),
    (EntityKind::Context, rebuild_context),
    (EntityKind::Track, rebuild_track),
    (EntityKind::MasterTrack, rebuild_track),
    (EntityKind::CueTrack, rebuild_track),
    (EntityKind::Chain, rebuild_track),
    (EntityKind::EffectDevice, rebuild_device),
    (EntityKind::InstrumentDevice, rebuild_device),
    (EntityKind::RackDevice, rebuild_device),
    (EntityKind::Send, rebuild_send),
    (EntityKind::Receive, rebuild_receive),
    (EntityKind::Parameter, rebuild_parameter),
    (EntityKind::Slot, rebuild_slot),
    (EntityKind::Clip, rebuild_clip),
];

fn handler_for(kind: EntityKind) -> Option<Handler> {
    HANDLERS
        .iter()
        .find(|(k, _)| *k == kind)
        .map(|(_, handler)| *handler)
}

pub fn deserialize(document: &Document, settings: &Settings) -> Result<Restored> {
    let Some(first) = document.entities.first() else {
        return Err(ValidationError::MalformedDocument("no records".to_string()).into());
    };
    if first.kind != EntityKind::Application {
        return Err(ValidationError::MalformedDocument(format!(
            "first record is a {}, not the application",
            first.kind
        ))
        .into());
    }

    let mut tree = Tree::new(first.uuid());
    tree.node_mut(NodeId::ROOT).name = first.meta.name.clone();
    let channel_count = first.spec.channel_count.unwrap_or(settings.channel_count);
    validate_channel_count(channel_count).map_err(|_| malformed(first, "invalid channel count"))?;
    tree.node_mut(NodeId::ROOT).channel_count = Some(channel_count);

    let mut transport = Transport::new(settings.tempo, settings.time_signature);
    if let Some(tempo) = first.spec.tempo {
        transport.set_tempo(tempo).map_err(|_| malformed(first, "invalid tempo"))?;
    }
    if let Some([numerator, denominator]) = first.spec.time_signature {
        transport
            .set_time_signature(numerator, denominator)
            .map_err(|_| malformed(first, "invalid time signature"))?;
    }

    let mut builder = Builder {
        tree,
        order: document
            .entities
            .iter()
            .enumerate()
            .map(|(i, r)| (r.uuid(), i))
            .collect(),
        index: 0,
        visits: 0,
        _document: document,
    };

    let mut queue: VecDeque<(usize, usize)> = (1..document.entities.len()).map(|i| (i, 0)).collect();
    while let Some((index, visits)) = queue.pop_front() {
        let record = &document.entities[index];
        let handler = handler_for(record.kind).ok_or_else(|| {
            ValidationError::MalformedDocument(format!("unexpected {} record {}", record.kind, record.uuid()))
        })?;
        builder.index = index;
        builder.visits = visits;
        match handler(&mut builder, record)? {
            Outcome::Attached => {}
            Outcome::Deferred(missing) if visits < MAX_VISITS => {
                log::trace!(target: "serialize", "deferring {} {}: waiting for {}", record.kind, record.uuid(), missing);
                queue.push_back((index, visits + 1));
            }
            Outcome::Deferred(missing) => {
                log::warn!(
                    target: "serialize",
                    "discarding {} {}: {} never appeared",
                    record.kind,
                    record.uuid(),
                    missing
                );
            }
        }
    }

    log::debug!(target: "serialize", "rebuilt {} entities", builder.tree.registry_len());
    Ok(Restored {
        tree: builder.tree,
        tempo: transport.tempo(),
        time_signature: transport.time_signature(),
    })
}

fn malformed(record: &EntityRecord, reason: &str) -> crate::error::Error {
    ValidationError::MalformedRecord {
        kind: record.kind,
        uuid: record.uuid(),
        reason: reason.to_string(),
    }
    .into()
}

impl Builder<'_> {
    fn parent(&self, record: &EntityRecord) -> Result<std::result::Result<NodeId, Uuid>> {
        let uuid = record
            .meta
            .parent
            .ok_or_else(|| malformed(record, "missing parent"))?;
        Ok(self.tree.lookup(uuid).ok_or(uuid))
    }

    /// Create the node and attach it, ordered among siblings by record position.
    fn attach(&mut self, record: &EntityRecord, payload: Payload, parent: NodeId) -> Result<NodeId> {
        if self.tree.lookup(record.uuid()).is_some() {
            return Err(ValidationError::DuplicateEntity(record.uuid()).into());
        }
        let node = self
            .tree
            .create_with_uuid(record.uuid(), payload, record.meta.name.clone());
        if let Some(count) = record.spec.channel_count {
            validate_channel_count(count).map_err(|_| malformed(record, "invalid channel count"))?;
            self.tree.node_mut(node).channel_count = Some(count);
        }
        let position = if self.tree.payload(parent).container_role().is_some() {
            let index = self.index;
            let before = self
                .tree
                .children(parent)
                .iter()
                .filter(|c| self.order.get(&self.tree.uuid(**c)).is_some_and(|i| *i < index))
                .count();
            Some(before)
        } else {
            None
        };
        self.tree
            .insert(parent, node, position)
            .map_err(|e| malformed(record, &e.to_string()))?;
        Ok(node)
    }

    fn container(&self, record: &EntityRecord, owner: NodeId, role: ContainerRole) -> Result<NodeId> {
        self.tree
            .container(owner, role)
            .ok_or_else(|| malformed(record, &format!("parent has no {}", role.name())))
    }
}

fn rebuild_app_level(builder: &mut Builder<'_>, record: &EntityRecord, payload: Payload, role: ContainerRole) -> Result<Outcome> {
    let container = builder.container(record, NodeId::ROOT, role)?;
    builder.attach(record, payload, container)?;
    Ok(Outcome::Attached)
}

fn rebuild_controller(builder: &mut Builder<'_>, record: &EntityRecord) -> Result<Outcome> {
    rebuild_app_level(builder, record, Payload::Controller, ContainerRole::Controllers)
}

fn rebuild_scene(builder: &mut Builder<'_>, record: &EntityRecord) -> Result<Outcome> {
    rebuild_app_level(builder, record, Payload::Scene, ContainerRole::Scenes)
}

fn rebuild_context(builder: &mut Builder<'_>, record: &EntityRecord) -> Result<Outcome> {
    rebuild_app_level(builder, record, Payload::Context, ContainerRole::Contexts)
}

fn rebuild_track(builder: &mut Builder<'_>, record: &EntityRecord) -> Result<Outcome> {
    let parent = match builder.parent(record)? {
        Ok(parent) => parent,
        Err(missing) => return Ok(Outcome::Deferred(missing)),
    };
    let parent_kind = builder.tree.kind(parent);
    let (payload, target) = match (record.kind, parent_kind) {
        (EntityKind::Track, Some(EntityKind::Context)) => {
            (Payload::Track, builder.container(record, parent, ContainerRole::Tracks)?)
        }
        (EntityKind::Track, Some(kind)) if kind.is_track_like() => {
            (Payload::Track, builder.container(record, parent, ContainerRole::SubTracks)?)
        }
        (EntityKind::MasterTrack, Some(EntityKind::Context)) => (Payload::MasterTrack, parent),
        (EntityKind::CueTrack, Some(EntityKind::Context)) => (Payload::CueTrack, parent),
        (EntityKind::Chain, Some(EntityKind::RackDevice)) => {
            (Payload::Chain, builder.container(record, parent, ContainerRole::Chains)?)
        }
        _ => return Err(malformed(record, "parent cannot hold this kind")),
    };
    let cueable = payload == Payload::Track;
    let node = builder.attach(record, payload, target)?;
    if matches!(record.kind, EntityKind::Track | EntityKind::Chain) {
        builder.tree.node_mut(node).mixer = MixerState {
            muted: record.spec.is_muted,
            soloed: record.spec.is_soloed,
            cued: cueable && record.spec.is_cued,
        };
    }
    Ok(Outcome::Attached)
}

fn rebuild_device(builder: &mut Builder<'_>, record: &EntityRecord) -> Result<Outcome> {
    let parent = match builder.parent(record)? {
        Ok(parent) => parent,
        Err(missing) => return Ok(Outcome::Deferred(missing)),
    };
    let payload = match record.kind {
        EntityKind::RackDevice => Payload::Rack,
        kind => {
            let role = if kind == EntityKind::InstrumentDevice {
                DeviceRole::Instrument
            } else {
                DeviceRole::Effect
            };
            let synthdef = record
                .spec
                .synthdef
                .clone()
                .ok_or_else(|| malformed(record, "missing synthdef"))?;
            Payload::Device(DeviceBody { role, synthdef })
        }
    };
    let container = builder.container(record, parent, ContainerRole::Devices)?;
    builder.attach(record, payload, container)?;
    Ok(Outcome::Attached)
}

fn rebuild_send(builder: &mut Builder<'_>, record: &EntityRecord) -> Result<Outcome> {
    let parent = match builder.parent(record)? {
        Ok(parent) => parent,
        Err(missing) => return Ok(Outcome::Deferred(missing)),
    };
    // A missing target is waited for, then accepted: the send comes back inert.
    if let Some(target) = record.spec.target {
        if builder.tree.lookup(target).is_none() && builder.visits < MAX_VISITS {
            return Ok(Outcome::Deferred(target));
        }
    }
    let role = match record.spec.position.unwrap_or_default() {
        FaderPoint::PreFader => ContainerRole::PreFaderSends,
        FaderPoint::PostFader => ContainerRole::PostFaderSends,
    };
    let container = builder.container(record, parent, role)?;
    let payload = Payload::Send(SendRoute {
        target: record.spec.target,
        gain: record.spec.gain.unwrap_or(0.0),
    });
    builder.attach(record, payload, container)?;
    Ok(Outcome::Attached)
}

fn rebuild_receive(builder: &mut Builder<'_>, record: &EntityRecord) -> Result<Outcome> {
    let parent = match builder.parent(record)? {
        Ok(parent) => parent,
        Err(missing) => return Ok(Outcome::Deferred(missing)),
    };
    let source = record
        .spec
        .source
        .ok_or_else(|| malformed(record, "missing source"))?;
    if builder.tree.lookup(source).is_none() && builder.visits < MAX_VISITS {
        return Ok(Outcome::Deferred(source));
    }
    let container = builder.container(record, parent, ContainerRole::Receives)?;
    let payload = Payload::Receive(ReceiveRoute {
        source,
        gain: record.spec.gain.unwrap_or(0.0),
    });
    builder.attach(record, payload, container)?;
    Ok(Outcome::Attached)
}

fn rebuild_parameter(builder: &mut Builder<'_>, record: &EntityRecord) -> Result<Outcome> {
    let parent = match builder.parent(record)? {
        Ok(parent) => parent,
        Err(missing) => return Ok(Outcome::Deferred(missing)),
    };
    if record.meta.name.is_none() {
        return Err(malformed(record, "parameter without a name"));
    }
    let default = record.spec.default.unwrap_or(0.0);
    let payload = Payload::Parameter(ParameterValue {
        default,
        value: record.spec.value.unwrap_or(default),
    });
    let container = builder.container(record, parent, ContainerRole::Parameters)?;
    builder.attach(record, payload, container)?;
    Ok(Outcome::Attached)
}

fn rebuild_slot(builder: &mut Builder<'_>, record: &EntityRecord) -> Result<Outcome> {
    let parent = match builder.parent(record)? {
        Ok(parent) => parent,
        Err(missing) => return Ok(Outcome::Deferred(missing)),
    };
    let container = builder.container(record, parent, ContainerRole::Slots)?;
    builder.attach(record, Payload::Slot, container)?;
    Ok(Outcome::Attached)
}

fn rebuild_clip(builder: &mut Builder<'_>, record: &EntityRecord) -> Result<Outcome> {
    let parent = match builder.parent(record)? {
        Ok(parent) => parent,
        Err(missing) => return Ok(Outcome::Deferred(missing)),
    };
    let spec: &EntitySpec = &record.spec;
    let clip = Clip::with_notes(
        spec.duration.unwrap_or(1.0),
        spec.is_looping.unwrap_or(true),
        &spec.notes,
    )
    .map_err(|e| malformed(record, &e.to_string()))?;
    builder.attach(record, Payload::Clip(clip), parent)?;
    Ok(Outcome::Attached)
}

/// Write a document as JSON.
pub fn to_json(document: &Document) -> Result<String> {
    serde_json::to_string_pretty(document)
        .map_err(|e| ValidationError::MalformedDocument(e.to_string()).into())
}

/// Read a document from JSON.
pub fn from_json(json: &str) -> Result<Document> {
    serde_json::from_str(json).map_err(|e| ValidationError::MalformedDocument(e.to_string()).into())
}

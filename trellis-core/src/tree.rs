//! Arena-backed application object tree.
//!
//! Every entity lives in one `Vec<Node>` and refers to its parent and
//! children by `NodeId`. Nodes are never dropped from the arena: a removed
//! node is detached (no parent, absent from the registry) but keeps its
//! uuid and subtree so it can be attached again.
//!
//! Owners with a fixed shape (application, context, track-likes, devices,
//! slots) place their children at fixed layout slots. Ordered groups of
//! children (tracks, devices, sends, ...) sit inside container nodes, where
//! position is insertion order. A node's graph order is the path of slot
//! and container positions from the root, which sorts signal producers
//! before their consumers.

use std::collections::HashMap;
use std::fmt;

use trellis_types::{DeviceRole, EntityKind, Uuid};

use crate::clip::Clip;
use crate::error::{Result, ValidationError};
use crate::mixer::MixerState;

/// Index of a node in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub const ROOT: NodeId = NodeId(0);

    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerRole {
    Controllers,
    Scenes,
    Contexts,
    Tracks,
    Slots,
    Parameters,
    Receives,
    SubTracks,
    Devices,
    PreFaderSends,
    PostFaderSends,
    Chains,
}

impl ContainerRole {
    pub fn name(self) -> &'static str {
        match self {
            ContainerRole::Controllers => "controllers",
            ContainerRole::Scenes => "scenes",
            ContainerRole::Contexts => "contexts",
            ContainerRole::Tracks => "tracks",
            ContainerRole::Slots => "slots",
            ContainerRole::Parameters => "parameters",
            ContainerRole::Receives => "receives",
            ContainerRole::SubTracks => "sub-tracks",
            ContainerRole::Devices => "devices",
            ContainerRole::PreFaderSends => "pre-fader sends",
            ContainerRole::PostFaderSends => "post-fader sends",
            ContainerRole::Chains => "chains",
        }
    }

    pub fn accepts(self, kind: EntityKind) -> bool {
        match self {
            ContainerRole::Controllers => kind == EntityKind::Controller,
            ContainerRole::Scenes => kind == EntityKind::Scene,
            ContainerRole::Contexts => kind == EntityKind::Context,
            ContainerRole::Tracks | ContainerRole::SubTracks => kind == EntityKind::Track,
            ContainerRole::Slots => kind == EntityKind::Slot,
            ContainerRole::Parameters => kind == EntityKind::Parameter,
            ContainerRole::Receives => kind == EntityKind::Receive,
            ContainerRole::Devices => kind.is_device(),
            ContainerRole::PreFaderSends | ContainerRole::PostFaderSends => kind == EntityKind::Send,
            ContainerRole::Chains => kind == EntityKind::Chain,
        }
    }

    /// Containers that own a server group.
    pub fn is_audible(self) -> bool {
        !matches!(
            self,
            ContainerRole::Controllers
                | ContainerRole::Scenes
                | ContainerRole::Contexts
                | ContainerRole::Slots
                | ContainerRole::Parameters
        )
    }
}

/// Server-side members of a node's group that are not tree nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatchRole {
    Input,
    Output,
    DeviceIn,
    Body,
    DeviceOut,
    RackIn,
    RackOut,
    Route,
    /// Copy of a cued track's signal into the cue track.
    Cue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutSlot {
    Container(ContainerRole),
    Patch(PatchRole),
    Child(EntityKind),
}

use ContainerRole as C;
use LayoutSlot::{Child, Container, Patch};

pub const APPLICATION_LAYOUT: &[LayoutSlot] = &[
    Container(C::Controllers),
    Container(C::Scenes),
    Container(C::Contexts),
];

pub const CONTEXT_LAYOUT: &[LayoutSlot] = &[
    Container(C::Tracks),
    Child(EntityKind::MasterTrack),
    Child(EntityKind::CueTrack),
];

pub const TRACK_LAYOUT: &[LayoutSlot] = &[
    Container(C::Slots),
    Container(C::Parameters),
    Container(C::Receives),
    Patch(PatchRole::Input),
    Container(C::SubTracks),
    Container(C::Devices),
    Container(C::PreFaderSends),
    Patch(PatchRole::Output),
    Container(C::PostFaderSends),
    Patch(PatchRole::Cue),
];

pub const DEVICE_LAYOUT: &[LayoutSlot] = &[
    Container(C::Parameters),
    Patch(PatchRole::DeviceIn),
    Patch(PatchRole::Body),
    Patch(PatchRole::DeviceOut),
];

pub const RACK_LAYOUT: &[LayoutSlot] = &[
    Container(C::Parameters),
    Patch(PatchRole::RackIn),
    Container(C::Chains),
    Patch(PatchRole::RackOut),
];

pub const SLOT_LAYOUT: &[LayoutSlot] = &[Child(EntityKind::Clip)];

pub const ROUTE_LAYOUT: &[LayoutSlot] = &[Patch(PatchRole::Route)];

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceBody {
    pub role: DeviceRole,
    pub synthdef: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SendRoute {
    /// `None` routes to the owning track's default destination.
    pub target: Option<Uuid>,
    pub gain: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReceiveRoute {
    pub source: Uuid,
    pub gain: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParameterValue {
    pub default: f32,
    pub value: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Application,
    Container(ContainerRole),
    Controller,
    Scene,
    Context,
    Track,
    MasterTrack,
    CueTrack,
    Chain,
    Device(DeviceBody),
    Rack,
    Send(SendRoute),
    Receive(ReceiveRoute),
    Parameter(ParameterValue),
    Slot,
    Clip(Clip),
}

impl Payload {
    /// Entity kind, or `None` for structural containers.
    pub fn kind(&self) -> Option<EntityKind> {
        Some(match self {
            Payload::Application => EntityKind::Application,
            Payload::Container(_) => return None,
            Payload::Controller => EntityKind::Controller,
            Payload::Scene => EntityKind::Scene,
            Payload::Context => EntityKind::Context,
            Payload::Track => EntityKind::Track,
            Payload::MasterTrack => EntityKind::MasterTrack,
            Payload::CueTrack => EntityKind::CueTrack,
            Payload::Chain => EntityKind::Chain,
            Payload::Device(body) => body.role.kind(),
            Payload::Rack => EntityKind::RackDevice,
            Payload::Send(_) => EntityKind::Send,
            Payload::Receive(_) => EntityKind::Receive,
            Payload::Parameter(_) => EntityKind::Parameter,
            Payload::Slot => EntityKind::Slot,
            Payload::Clip(_) => EntityKind::Clip,
        })
    }

    pub fn layout(&self) -> &'static [LayoutSlot] {
        match self {
            Payload::Application => APPLICATION_LAYOUT,
            Payload::Context => CONTEXT_LAYOUT,
            Payload::Track | Payload::MasterTrack | Payload::CueTrack | Payload::Chain => TRACK_LAYOUT,
            Payload::Device(_) => DEVICE_LAYOUT,
            Payload::Rack => RACK_LAYOUT,
            Payload::Slot => SLOT_LAYOUT,
            Payload::Send(_) | Payload::Receive(_) => ROUTE_LAYOUT,
            _ => &[],
        }
    }

    /// Layout slot of a backend-only patch, if this kind has one.
    pub fn patch_slot(&self, role: PatchRole) -> Option<usize> {
        self.layout().iter().position(|entry| *entry == Patch(role))
    }

    pub fn container_role(&self) -> Option<ContainerRole> {
        match self {
            Payload::Container(role) => Some(*role),
            _ => None,
        }
    }

    pub fn is_track_like(&self) -> bool {
        self.kind().map(EntityKind::is_track_like).unwrap_or(false)
    }

    pub fn is_device(&self) -> bool {
        self.kind().map(EntityKind::is_device).unwrap_or(false)
    }

    /// Nodes that own a server group when their context is bound.
    pub fn is_audible(&self) -> bool {
        match self {
            Payload::Container(role) => role.is_audible(),
            Payload::Context
            | Payload::Track
            | Payload::MasterTrack
            | Payload::CueTrack
            | Payload::Chain
            | Payload::Device(_)
            | Payload::Rack
            | Payload::Send(_)
            | Payload::Receive(_) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub uuid: Uuid,
    pub name: Option<String>,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    /// Layout slot within a fixed-shape parent; unused inside containers.
    pub slot: usize,
    /// Explicit channel count override.
    pub channel_count: Option<u8>,
    pub mixer: MixerState,
    pub payload: Payload,
}

impl Node {
    pub fn kind(&self) -> Option<EntityKind> {
        self.payload.kind()
    }
}

#[derive(Debug, Clone)]
pub struct Tree {
    nodes: Vec<Node>,
    registry: HashMap<Uuid, NodeId>,
}

impl Tree {
    /// A tree holding only the application root and its containers.
    pub fn new(root_uuid: Uuid) -> Self {
        let mut tree = Self {
            nodes: Vec::new(),
            registry: HashMap::new(),
        };
        let root = tree.create_with_uuid(root_uuid, Payload::Application, None);
        debug_assert_eq!(root, NodeId::ROOT);
        for id in tree.descendants(root) {
            let uuid = tree.nodes[id.0].uuid;
            tree.registry.insert(uuid, id);
        }
        tree
    }

    pub fn root(&self) -> NodeId {
        NodeId::ROOT
    }

    /// Create a detached node (with its layout containers) and a fresh uuid.
    pub fn create(&mut self, payload: Payload, name: Option<String>) -> NodeId {
        self.create_with_uuid(Uuid::new_v4(), payload, name)
    }

    pub fn create_with_uuid(&mut self, uuid: Uuid, payload: Payload, name: Option<String>) -> NodeId {
        let id = NodeId(self.nodes.len());
        let layout = payload.layout();
        self.nodes.push(Node {
            uuid,
            name,
            parent: None,
            children: Vec::new(),
            slot: 0,
            channel_count: None,
            mixer: MixerState::default(),
            payload,
        });
        for (slot, entry) in layout.iter().enumerate() {
            if let Container(role) = entry {
                let container = NodeId(self.nodes.len());
                self.nodes.push(Node {
                    uuid: Uuid::new_v4(),
                    name: None,
                    parent: Some(id),
                    children: Vec::new(),
                    slot,
                    channel_count: None,
                    mixer: MixerState::default(),
                    payload: Payload::Container(*role),
                });
                self.nodes[id.0].children.push(container);
            }
        }
        id
    }

    pub fn contains(&self, id: NodeId) -> bool {
        id.0 < self.nodes.len()
    }

    /// Validate a caller-supplied id.
    pub fn check(&self, id: NodeId) -> Result<NodeId> {
        if self.contains(id) {
            Ok(id)
        } else {
            Err(ValidationError::UnknownNode(id.0).into())
        }
    }

    /// Panics on ids that did not come from this tree.
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    pub fn payload(&self, id: NodeId) -> &Payload {
        &self.nodes[id.0].payload
    }

    pub fn kind(&self, id: NodeId) -> Option<EntityKind> {
        self.nodes[id.0].kind()
    }

    pub fn uuid(&self, id: NodeId) -> Uuid {
        self.nodes[id.0].uuid
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0].parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.0].children
    }

    /// Attached node with this uuid.
    pub fn lookup(&self, uuid: Uuid) -> Option<NodeId> {
        self.registry.get(&uuid).copied()
    }

    pub fn registry_len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_attached(&self, id: NodeId) -> bool {
        let mut current = id;
        loop {
            if current == NodeId::ROOT {
                return true;
            }
            match self.nodes[current.0].parent {
                Some(parent) => current = parent,
                None => return false,
            }
        }
    }

    /// Position of a node within its parent: container index or layout slot.
    pub fn position(&self, id: NodeId) -> Option<usize> {
        let parent = self.nodes[id.0].parent?;
        if self.nodes[parent.0].payload.container_role().is_some() {
            self.nodes[parent.0].children.iter().position(|c| *c == id)
        } else {
            Some(self.nodes[id.0].slot)
        }
    }

    /// Structural ordering key. Empty for detached nodes and for the root.
    pub fn graph_order(&self, id: NodeId) -> Vec<usize> {
        if !self.is_attached(id) {
            return Vec::new();
        }
        let mut order = Vec::new();
        let mut current = id;
        while let Some(parent) = self.nodes[current.0].parent {
            order.push(self.position(current).unwrap_or(0));
            current = parent;
        }
        order.reverse();
        order
    }

    /// The node and everything below it, in pre-order.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            out.push(current);
            for child in self.nodes[current.0].children.iter().rev() {
                stack.push(*child);
            }
        }
        out
    }

    /// Parent chain, nearest first, excluding the node itself.
    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut current = self.nodes[id.0].parent;
        while let Some(parent) = current {
            out.push(parent);
            current = self.nodes[parent.0].parent;
        }
        out
    }

    pub fn is_descendant_of(&self, id: NodeId, ancestor: NodeId) -> bool {
        id == ancestor || self.ancestors(id).contains(&ancestor)
    }

    /// The container role of this node's parent, if the parent is a container.
    pub fn container_role_of(&self, id: NodeId) -> Option<ContainerRole> {
        self.nodes[id.0]
            .parent
            .and_then(|parent| self.nodes[parent.0].payload.container_role())
    }

    /// Nearest ancestor that is an entity rather than a container.
    pub fn owner(&self, id: NodeId) -> Option<NodeId> {
        self.ancestors(id)
            .into_iter()
            .find(|a| self.nodes[a.0].payload.container_role().is_none())
    }

    /// Nearest context at or above this node.
    pub fn context_of(&self, id: NodeId) -> Option<NodeId> {
        std::iter::once(id)
            .chain(self.ancestors(id))
            .find(|n| self.nodes[n.0].payload == Payload::Context)
    }

    pub fn container(&self, owner: NodeId, role: ContainerRole) -> Option<NodeId> {
        self.nodes[owner.0]
            .children
            .iter()
            .copied()
            .find(|c| self.nodes[c.0].payload == Payload::Container(role))
    }

    /// Members of an owner's container, or nothing if it has none.
    pub fn members(&self, owner: NodeId, role: ContainerRole) -> &[NodeId] {
        match self.container(owner, role) {
            Some(container) => &self.nodes[container.0].children,
            None => &[],
        }
    }

    /// Child of a fixed-shape owner at a layout slot.
    pub fn fixed_child(&self, owner: NodeId, kind: EntityKind) -> Option<NodeId> {
        self.nodes[owner.0]
            .children
            .iter()
            .copied()
            .find(|c| self.nodes[c.0].kind() == Some(kind))
    }

    /// Attach a detached node under `parent`.
    ///
    /// Containers insert at `position` (appending when `None` or past the
    /// end); fixed-shape parents place the child at the slot for its kind.
    pub fn insert(&mut self, parent: NodeId, child: NodeId, position: Option<usize>) -> Result<()> {
        self.check(parent)?;
        self.check(child)?;
        let child_uuid = self.uuid(child);
        if child == NodeId::ROOT || self.nodes[child.0].parent.is_some() {
            return Err(ValidationError::AlreadyAttached(child_uuid).into());
        }
        if self.is_descendant_of(parent, child) {
            return Err(self.invalid_parent(parent, child));
        }
        let child_kind = self
            .kind(child)
            .ok_or_else(|| self.invalid_parent(parent, child))?;

        let index = match self.nodes[parent.0].payload.container_role() {
            Some(role) => {
                if !role.accepts(child_kind) {
                    return Err(self.invalid_parent(parent, child));
                }
                let len = self.nodes[parent.0].children.len();
                self.nodes[child.0].slot = 0;
                position.unwrap_or(len).min(len)
            }
            None => {
                let slot = self.nodes[parent.0]
                    .payload
                    .layout()
                    .iter()
                    .position(|entry| *entry == Child(child_kind))
                    .ok_or_else(|| self.invalid_parent(parent, child))?;
                if self.fixed_child(parent, child_kind).is_some() {
                    return Err(self.invalid_parent(parent, child));
                }
                self.nodes[child.0].slot = slot;
                self.nodes[parent.0]
                    .children
                    .iter()
                    .position(|c| self.nodes[c.0].slot > slot)
                    .unwrap_or(self.nodes[parent.0].children.len())
            }
        };

        if self.is_attached(parent) {
            let subtree = self.descendants(child);
            for id in &subtree {
                let uuid = self.nodes[id.0].uuid;
                if self.registry.contains_key(&uuid) {
                    return Err(ValidationError::DuplicateEntity(uuid).into());
                }
            }
            for id in subtree {
                let uuid = self.nodes[id.0].uuid;
                self.registry.insert(uuid, id);
            }
        }
        self.nodes[parent.0].children.insert(index, child);
        self.nodes[child.0].parent = Some(parent);
        log::trace!(target: "tree", "attached {} under {} at {}", child, parent, index);
        Ok(())
    }

    /// Detach a node (and its subtree) from its parent.
    pub fn detach(&mut self, id: NodeId) -> Result<()> {
        self.check(id)?;
        let parent = match self.nodes[id.0].parent {
            Some(parent) => parent,
            None => return Err(crate::error::StateError::Detached(self.uuid(id)).into()),
        };
        if self.is_attached(id) {
            for node in self.descendants(id) {
                let uuid = self.nodes[node.0].uuid;
                self.registry.remove(&uuid);
            }
        }
        self.nodes[parent.0].children.retain(|c| *c != id);
        self.nodes[id.0].parent = None;
        log::trace!(target: "tree", "detached {} from {}", id, parent);
        Ok(())
    }

    /// Give an attached or detached node a new uuid, keeping the registry in step.
    pub fn set_uuid(&mut self, id: NodeId, uuid: Uuid) -> Result<()> {
        let old = self.uuid(id);
        if old == uuid {
            return Ok(());
        }
        if self.registry.contains_key(&uuid) {
            return Err(ValidationError::DuplicateEntity(uuid).into());
        }
        if self.registry.remove(&old).is_some() {
            self.registry.insert(uuid, id);
        }
        self.nodes[id.0].uuid = uuid;
        Ok(())
    }

    fn invalid_parent(&self, parent: NodeId, child: NodeId) -> crate::error::Error {
        ValidationError::InvalidParent {
            parent: self.describe(parent),
            child: self.describe(child),
        }
        .into()
    }

    /// Short human-readable label for errors and logs.
    pub fn describe(&self, id: NodeId) -> String {
        let node = &self.nodes[id.0];
        let label = match (&node.payload, node.kind()) {
            (Payload::Container(role), _) => role.name().to_string(),
            (_, Some(kind)) => kind.to_string(),
            _ => "node".to_string(),
        };
        match &node.name {
            Some(name) => format!("{} {:?}", label, name),
            None => label,
        }
    }

    /// Indented listing of the subtree, for debugging.
    pub fn dump(&self, id: NodeId) -> String {
        let mut out = String::new();
        self.dump_into(id, 0, &mut out);
        out
    }

    fn dump_into(&self, id: NodeId, depth: usize, out: &mut String) {
        out.push_str(&"    ".repeat(depth));
        out.push_str(&self.describe(id));
        out.push('\n');
        for child in &self.nodes[id.0].children {
            self.dump_into(*child, depth + 1, out);
        }
    }
}

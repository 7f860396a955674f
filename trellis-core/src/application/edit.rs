//! Structural edits: adding, removing, moving and configuring entities.

use trellis_types::{DeviceRole, EntityKind, Event, FaderPoint, Uuid};

use super::Application;
use crate::channels::{is_sized, validate_channel_count};
use crate::error::{Result, ValidationError};
use crate::routing;
use crate::tree::{ContainerRole, DeviceBody, NodeId, ParameterValue, Payload, ReceiveRoute, SendRoute};

/// What an effect or instrument device runs.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSpec {
    pub role: DeviceRole,
    pub synthdef: String,
    /// Parameters the definition declares, with their defaults.
    pub parameters: Vec<(String, f32)>,
}

impl DeviceSpec {
    pub fn effect(synthdef: impl Into<String>) -> Self {
        Self {
            role: DeviceRole::Effect,
            synthdef: synthdef.into(),
            parameters: Vec::new(),
        }
    }

    pub fn instrument(synthdef: impl Into<String>) -> Self {
        Self {
            role: DeviceRole::Instrument,
            synthdef: synthdef.into(),
            parameters: Vec::new(),
        }
    }

    pub fn parameter(mut self, name: &str, default: f32) -> Self {
        self.parameters.push((name.to_string(), default));
        self
    }
}

/// Fader parameters every track-like carries.
const TRACK_PARAMETERS: &[(&str, f32)] = &[("gain", 0.0), ("panning", 0.0)];

fn holds_tracks(payload: &Payload) -> bool {
    *payload == Payload::Context || payload.is_track_like()
}

fn has_parameters(payload: &Payload) -> bool {
    payload.is_track_like() || payload.is_device()
}

fn has_width(payload: &Payload) -> bool {
    *payload == Payload::Context || is_sized(payload)
}

fn is_route(payload: &Payload) -> bool {
    matches!(payload, Payload::Send(_) | Payload::Receive(_))
}

impl Application {
    /// Create a node and attach it in one of `owner`'s containers.
    fn attach_new(
        &mut self,
        owner: NodeId,
        role: ContainerRole,
        payload: Payload,
        name: Option<&str>,
        index: Option<usize>,
    ) -> Result<NodeId> {
        let container = self.tree.container(owner, role).ok_or_else(|| ValidationError::InvalidParent {
            parent: self.tree.describe(owner),
            child: role.name().to_string(),
        })?;
        let node = self.tree.create(payload, name.map(str::to_string));
        self.tree.insert(container, node, index)?;
        Ok(node)
    }

    pub(super) fn announce(&mut self, node: NodeId) {
        if let Some(kind) = self.tree.kind(node) {
            let uuid = self.tree.uuid(node);
            self.emit(Event::EntityAdded { uuid, kind });
        }
    }

    fn populate_track_like(&mut self, track: NodeId) -> Result<()> {
        for (name, default) in TRACK_PARAMETERS {
            self.attach_parameter(track, name, *default)?;
        }
        if *self.tree.payload(track) == Payload::Track {
            for _ in 0..self.scenes().len() {
                self.attach_new(track, ContainerRole::Slots, Payload::Slot, None, None)?;
            }
        }
        Ok(())
    }

    fn attach_parameter(&mut self, owner: NodeId, name: &str, default: f32) -> Result<NodeId> {
        if self.parameter(owner, name).is_some() {
            return Err(ValidationError::DuplicateParameter {
                owner: self.tree.uuid(owner),
                name: name.to_string(),
            }
            .into());
        }
        let payload = Payload::Parameter(ParameterValue { default, value: default });
        self.attach_new(owner, ContainerRole::Parameters, payload, Some(name), None)
    }

    /// Set the application-wide channel count every unset node inherits.
    pub fn set_channel_count(&mut self, channel_count: u8) -> Result<()> {
        validate_channel_count(channel_count)?;
        self.grouped(|app| {
            app.tree.node_mut(NodeId::ROOT).channel_count = Some(channel_count);
            Ok(())
        })
    }

    /// Set or clear the explicit channel count of a context, track-like or device.
    pub fn set_node_channel_count(&mut self, node: NodeId, channel_count: Option<u8>) -> Result<()> {
        let node = self.require(node, "channel counts", has_width)?;
        if let Some(count) = channel_count {
            validate_channel_count(count)?;
        }
        self.grouped(|app| {
            app.tree.node_mut(node).channel_count = channel_count;
            Ok(())
        })
    }

    pub fn add_controller(&mut self, name: &str) -> Result<NodeId> {
        self.grouped(|app| {
            let controller = app.attach_new(NodeId::ROOT, ContainerRole::Controllers, Payload::Controller, Some(name), None)?;
            app.announce(controller);
            Ok(controller)
        })
    }

    /// Add a context with its master and cue tracks. Binding is left to the caller.
    pub(crate) fn create_context(&mut self, name: Option<&str>) -> Result<NodeId> {
        self.grouped(|app| {
            let context = app.attach_new(NodeId::ROOT, ContainerRole::Contexts, Payload::Context, name, None)?;
            for (payload, label) in [(Payload::MasterTrack, "master"), (Payload::CueTrack, "cue")] {
                let track = app.tree.create(payload, Some(label.to_string()));
                app.tree.insert(context, track, None)?;
                app.populate_track_like(track)?;
            }
            app.announce(context);
            Ok(context)
        })
    }

    /// Append a track to a context, or a sub-track to a track-like.
    pub fn add_track(&mut self, owner: NodeId, name: Option<&str>) -> Result<NodeId> {
        self.insert_track(owner, None, name)
    }

    pub fn insert_track(&mut self, owner: NodeId, index: Option<usize>, name: Option<&str>) -> Result<NodeId> {
        let owner = self.require(owner, "tracks", holds_tracks)?;
        let role = if *self.tree.payload(owner) == Payload::Context {
            ContainerRole::Tracks
        } else {
            ContainerRole::SubTracks
        };
        self.grouped(|app| {
            let track = app.attach_new(owner, role, Payload::Track, name, index)?;
            app.populate_track_like(track)?;
            app.announce(track);
            Ok(track)
        })
    }

    pub fn add_device(&mut self, owner: NodeId, spec: DeviceSpec, name: Option<&str>) -> Result<NodeId> {
        self.insert_device(owner, None, spec, name)
    }

    pub fn insert_device(
        &mut self,
        owner: NodeId,
        index: Option<usize>,
        spec: DeviceSpec,
        name: Option<&str>,
    ) -> Result<NodeId> {
        let owner = self.require(owner, "devices", Payload::is_track_like)?;
        self.grouped(|app| {
            let body = DeviceBody {
                role: spec.role,
                synthdef: spec.synthdef,
            };
            let device = app.attach_new(owner, ContainerRole::Devices, Payload::Device(body), name, index)?;
            for (parameter, default) in &spec.parameters {
                app.attach_parameter(device, parameter, *default)?;
            }
            app.announce(device);
            Ok(device)
        })
    }

    pub fn add_rack(&mut self, owner: NodeId, name: Option<&str>) -> Result<NodeId> {
        let owner = self.require(owner, "devices", Payload::is_track_like)?;
        self.grouped(|app| {
            let rack = app.attach_new(owner, ContainerRole::Devices, Payload::Rack, name, None)?;
            app.announce(rack);
            Ok(rack)
        })
    }

    pub fn add_chain(&mut self, rack: NodeId, name: Option<&str>) -> Result<NodeId> {
        let rack = self.require(rack, "chains", |p| *p == Payload::Rack)?;
        self.grouped(|app| {
            let chain = app.attach_new(rack, ContainerRole::Chains, Payload::Chain, name, None)?;
            app.populate_track_like(chain)?;
            app.announce(chain);
            Ok(chain)
        })
    }

    fn target_uuid(&self, target: Option<NodeId>) -> Result<Option<Uuid>> {
        target
            .map(|node| self.tree.check(node).map(|node| self.tree.uuid(node)))
            .transpose()
    }

    /// Send from a track-like's fader point to another track-like or a
    /// device, or to the track's default destination when `target` is `None`.
    pub fn add_send(&mut self, track: NodeId, target: Option<NodeId>, position: FaderPoint) -> Result<NodeId> {
        let track = self.require(track, "sends", Payload::is_track_like)?;
        let target = self.target_uuid(target)?;
        routing::validate_send_target(&self.tree, track, target)?;
        let role = match position {
            FaderPoint::PreFader => ContainerRole::PreFaderSends,
            FaderPoint::PostFader => ContainerRole::PostFaderSends,
        };
        self.grouped(|app| {
            let send = app.attach_new(track, role, Payload::Send(SendRoute { target, gain: 0.0 }), None, None)?;
            log::debug!(target: "routing", "added send {} -> {:?}", app.tree.uuid(track), target);
            app.announce(send);
            Ok(send)
        })
    }

    pub fn set_send_target(&mut self, send: NodeId, target: Option<NodeId>) -> Result<()> {
        let send = self.require(send, "send targets", |p| matches!(p, Payload::Send(_)))?;
        let target = self.target_uuid(target)?;
        let owner = routing::route_owner(&self.tree, send).ok_or(ValidationError::InvalidEndpoint {
            kind: EntityKind::Send,
        })?;
        routing::validate_send_target(&self.tree, owner, target)?;
        self.grouped(|app| {
            if let Payload::Send(route) = &mut app.tree.node_mut(send).payload {
                route.target = target;
            }
            Ok(())
        })
    }

    /// Pull a track-like's signal into another track-like.
    pub fn add_receive(&mut self, track: NodeId, source: NodeId) -> Result<NodeId> {
        let track = self.require(track, "receives", Payload::is_track_like)?;
        let source = self.tree.check(source).map(|s| self.tree.uuid(s))?;
        routing::validate_receive_source(&self.tree, track, source)?;
        self.grouped(|app| {
            let payload = Payload::Receive(ReceiveRoute { source, gain: 0.0 });
            let receive = app.attach_new(track, ContainerRole::Receives, payload, None, None)?;
            app.announce(receive);
            Ok(receive)
        })
    }

    /// Gain of a send or receive, in dB.
    pub fn set_route_gain(&mut self, route: NodeId, gain: f32) -> Result<()> {
        let route = self.require(route, "gain", is_route)?;
        self.grouped(|app| {
            match &mut app.tree.node_mut(route).payload {
                Payload::Send(send) => send.gain = gain,
                Payload::Receive(receive) => receive.gain = gain,
                _ => {}
            }
            Ok(())
        })
    }

    pub fn add_parameter(&mut self, owner: NodeId, name: &str, default: f32) -> Result<NodeId> {
        let owner = self.require(owner, "parameters", has_parameters)?;
        self.grouped(|app| {
            let parameter = app.attach_parameter(owner, name, default)?;
            app.announce(parameter);
            Ok(parameter)
        })
    }

    /// Set a named parameter. Bound synths it feeds are updated in place.
    pub fn set_parameter(&mut self, owner: NodeId, name: &str, value: f32) -> Result<()> {
        let owner = self.require(owner, "parameters", has_parameters)?;
        let parameter = self.parameter(owner, name).ok_or_else(|| ValidationError::UnknownParameter {
            owner: self.tree.uuid(owner),
            name: name.to_string(),
        })?;
        self.grouped(|app| {
            if let Payload::Parameter(current) = &mut app.tree.node_mut(parameter).payload {
                current.value = value;
            }
            Ok(())
        })
    }

    /// Append a scene, giving every track a slot for it.
    pub fn add_scene(&mut self, name: Option<&str>) -> Result<NodeId> {
        self.grouped(|app| {
            let scene = app.attach_new(NodeId::ROOT, ContainerRole::Scenes, Payload::Scene, name, None)?;
            for track in app.all_tracks() {
                app.attach_new(track, ContainerRole::Slots, Payload::Slot, None, None)?;
            }
            app.announce(scene);
            Ok(scene)
        })
    }

    /// Remove scenes along with the slot each track holds for them.
    pub fn remove_scenes(&mut self, scenes: &[NodeId]) -> Result<()> {
        let mut indices = Vec::with_capacity(scenes.len());
        for scene in scenes {
            indices.push(self.member_index(NodeId::ROOT, ContainerRole::Scenes, *scene)?);
        }
        indices.sort_unstable();
        indices.dedup();
        let scenes = self.scenes();
        self.grouped(|app| {
            for index in indices.into_iter().rev() {
                for track in app.all_tracks() {
                    if let Some(slot) = app.slots(track).get(index).copied() {
                        app.stop_slot(slot)?;
                        app.tree.detach(slot)?;
                    }
                }
                app.detach_node(scenes[index])?;
            }
            Ok(())
        })
    }

    /// Every attached track (not chains or master/cue tracks), in graph order.
    pub(crate) fn all_tracks(&self) -> Vec<NodeId> {
        self.tree
            .descendants(NodeId::ROOT)
            .into_iter()
            .filter(|n| *self.tree.payload(*n) == Payload::Track)
            .collect()
    }

    fn member_index(&self, owner: NodeId, role: ContainerRole, node: NodeId) -> Result<usize> {
        self.tree.check(node)?;
        self.tree
            .members(owner, role)
            .iter()
            .position(|member| *member == node)
            .ok_or_else(|| {
                ValidationError::NotInContainer {
                    node: self.tree.uuid(node),
                    owner: self.tree.uuid(owner),
                    container: role.name(),
                }
                .into()
            })
    }

    /// Remove an entity from whatever container holds it.
    pub fn remove(&mut self, node: NodeId) -> Result<()> {
        self.require_attached(node)?;
        if self.tree.kind(node) == Some(EntityKind::Clip) {
            let slot = self.tree.parent(node).unwrap_or(NodeId::ROOT);
            return self.remove_clip(slot);
        }
        let (Some(role), Some(owner)) = (self.tree.container_role_of(node), self.tree.owner(node)) else {
            let kind = self.tree.kind(node).unwrap_or(EntityKind::Application);
            return Err(ValidationError::NotRemovable(kind).into());
        };
        self.remove_members(owner, role, &[node])
    }

    /// Remove entities from one of `owner`'s containers. Fails without
    /// changing anything if any of them is not there.
    pub fn remove_members(&mut self, owner: NodeId, role: ContainerRole, nodes: &[NodeId]) -> Result<()> {
        self.tree.check(owner)?;
        match role {
            ContainerRole::Contexts => return Err(ValidationError::NotRemovable(EntityKind::Context).into()),
            ContainerRole::Slots => return Err(ValidationError::NotRemovable(EntityKind::Slot).into()),
            ContainerRole::Scenes => return self.remove_scenes(nodes),
            _ => {}
        }
        for node in nodes {
            self.member_index(owner, role, *node)?;
        }
        self.grouped(|app| {
            for node in nodes {
                if app.tree.is_attached(*node) {
                    app.detach_node(*node)?;
                }
            }
            Ok(())
        })
    }

    /// Release backend resources under `node`, then detach it. Routes that
    /// pointed into the subtree go inert.
    pub(crate) fn detach_node(&mut self, node: NodeId) -> Result<()> {
        for track in self.tree.descendants(node) {
            self.cancel_playback(track);
        }
        if let Some(context) = self.tree.context_of(node) {
            if let Some(provider) = self.providers.get_mut(&context) {
                provider.release_subtree(&self.tree, node);
            }
        }
        let uuid = self.tree.uuid(node);
        let kind = self.tree.kind(node);
        self.tree.detach(node)?;
        let inert = routing::sends_targeting(&self.tree, uuid).len();
        if inert > 0 {
            log::debug!(target: "routing", "{} sends to {} are now inert", inert, uuid);
        }
        if let Some(kind) = kind {
            self.emit(Event::EntityRemoved { uuid, kind });
        }
        Ok(())
    }

    /// Move an entity into one of `owner`'s containers, at `index` or at
    /// the end. Routing is checked again after the move.
    pub fn move_node(&mut self, node: NodeId, owner: NodeId, role: ContainerRole, index: Option<usize>) -> Result<()> {
        self.require_attached(node)?;
        self.require_attached(owner)?;
        let kind = self.tree.kind(node).unwrap_or(EntityKind::Application);
        if matches!(role, ContainerRole::Slots | ContainerRole::Scenes | ContainerRole::Contexts)
            || matches!(kind, EntityKind::Slot | EntityKind::Scene | EntityKind::Context)
        {
            return Err(ValidationError::Unsupported { kind, operation: "moving" }.into());
        }
        let container = self.tree.container(owner, role).ok_or_else(|| ValidationError::InvalidParent {
            parent: self.tree.describe(owner),
            child: self.tree.describe(node),
        })?;
        self.grouped(|app| {
            if let Some(context) = app.tree.context_of(node) {
                if let Some(provider) = app.providers.get_mut(&context) {
                    provider.release_subtree(&app.tree, node);
                }
            }
            app.tree.detach(node)?;
            app.tree.insert(container, node, index)?;
            app.check_device_sends()
        })
    }

    /// Every live send into a device must still be free of cycles.
    fn check_device_sends(&self) -> Result<()> {
        for send in self.tree.descendants(NodeId::ROOT) {
            let Payload::Send(route) = self.tree.payload(send) else {
                continue;
            };
            let Some(target) = routing::effective_target(&self.tree, send) else {
                continue;
            };
            if route.target.is_none() || !self.tree.payload(target).is_device() {
                continue;
            }
            if let Some(owner) = routing::route_owner(&self.tree, send) {
                routing::validate_send_target(&self.tree, owner, route.target)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use std::sync::Arc;
    use trellis_audio::TestConnector;

    fn app_with_context() -> (Application, NodeId) {
        let mut app = Application::new(Settings::default(), Arc::new(TestConnector::new()));
        let context = app.create_context(Some("main")).unwrap();
        (app, context)
    }

    #[test]
    fn context_has_master_and_cue_with_fader_parameters() {
        let (app, context) = app_with_context();
        let master = app.master_track(context).unwrap();
        let cue = app.cue_track(context).unwrap();
        assert!(app.graph_order(master) < app.graph_order(cue));
        assert_eq!(app.parameter_value(master, "gain"), Some(0.0));
        assert_eq!(app.parameter_value(cue, "panning"), Some(0.0));
    }

    #[test]
    fn tracks_get_one_slot_per_scene() {
        let (mut app, context) = app_with_context();
        let early = app.add_track(context, Some("early")).unwrap();
        app.add_scene(None).unwrap();
        app.add_scene(None).unwrap();
        let late = app.add_track(context, Some("late")).unwrap();
        assert_eq!(app.slots(early).len(), 2);
        assert_eq!(app.slots(late).len(), 2);

        let first = app.scenes()[0];
        app.remove_scenes(&[first]).unwrap();
        assert_eq!(app.scenes().len(), 1);
        assert_eq!(app.slots(early).len(), 1);
        assert_eq!(app.slots(late).len(), 1);
    }

    #[test]
    fn removing_from_wrong_container_changes_nothing() {
        let (mut app, context) = app_with_context();
        let a = app.add_track(context, None).unwrap();
        let b = app.add_track(context, None).unwrap();
        let err = app.remove_members(a, ContainerRole::SubTracks, &[b]).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Validation(ValidationError::NotInContainer { .. })
        ));
        assert!(app.tree().is_attached(b));
    }

    #[test]
    fn master_track_is_not_removable() {
        let (mut app, context) = app_with_context();
        let master = app.master_track(context).unwrap();
        assert!(app.remove(master).is_err());
        assert!(app.tree().is_attached(master));
    }

    #[test]
    fn parameters_are_validated_by_name() {
        let (mut app, context) = app_with_context();
        let track = app.add_track(context, None).unwrap();
        app.set_parameter(track, "gain", -6.0).unwrap();
        assert_eq!(app.parameter_value(track, "gain"), Some(-6.0));
        assert!(app.set_parameter(track, "drive", 1.0).is_err());
        assert!(app.add_parameter(track, "gain", 0.0).is_err());
    }

    #[test]
    fn channel_counts_are_validated() {
        let (mut app, context) = app_with_context();
        let track = app.add_track(context, None).unwrap();
        assert!(app.set_node_channel_count(track, Some(0)).is_err());
        assert!(app.set_node_channel_count(track, Some(9)).is_err());
        assert!(app.set_channel_count(0).is_err());
        app.set_node_channel_count(track, Some(4)).unwrap();
        assert_eq!(app.effective_channel_count(track), Some(4));
    }

    #[test]
    fn move_reorders_within_container() {
        let (mut app, context) = app_with_context();
        let a = app.add_track(context, Some("a")).unwrap();
        let b = app.add_track(context, Some("b")).unwrap();
        app.move_node(b, context, ContainerRole::Tracks, Some(0)).unwrap();
        assert_eq!(app.tracks(context), vec![b, a]);

        app.move_node(b, a, ContainerRole::SubTracks, None).unwrap();
        assert_eq!(app.tracks(a), vec![b]);
        assert!(app.move_node(a, b, ContainerRole::SubTracks, None).is_err());
        assert_eq!(app.tracks(a), vec![b]);
    }

    #[test]
    fn moving_a_device_into_a_cycle_is_rejected() {
        let (mut app, context) = app_with_context();
        let a = app.add_track(context, None).unwrap();
        let b = app.add_track(context, None).unwrap();
        let device = app.add_device(b, DeviceSpec::effect("fx/delay"), None).unwrap();
        app.add_send(a, Some(device), FaderPoint::PostFader).unwrap();
        let err = app.move_node(device, a, ContainerRole::Devices, None).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Validation(ValidationError::RoutingCycle { .. })
        ));
        assert_eq!(app.devices(b), vec![device]);
    }
}

//! Resolution of sends, receives and default signal destinations.
//!
//! Routes name their far end by uuid, so they survive the far end being
//! removed and re-attached. Resolution happens on demand against the live
//! registry: a route whose far end is gone is inert.

use std::collections::{HashSet, VecDeque};

use trellis_types::{EntityKind, Uuid};

use crate::error::{Result, ValidationError};
use crate::tree::{ContainerRole, NodeId, Payload, Tree};

/// Where a track-like's output patch writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// Into another track-like's main bus (sub-track into parent).
    Main(NodeId),
    /// Into another track-like's input bus (top-level track into master).
    Input(NodeId),
    /// Into a rack's summing bus (chain into rack).
    RackMix(NodeId),
    /// Hardware outputs starting at this bus.
    Hardware(i32),
}

/// Default output for a track-like, derived from where it sits.
pub fn output_destination(tree: &Tree, track: NodeId) -> Destination {
    match tree.payload(track) {
        Payload::Chain => match tree.owner(track) {
            Some(rack) => Destination::RackMix(rack),
            None => Destination::Hardware(0),
        },
        Payload::Track => match (tree.container_role_of(track), tree.owner(track)) {
            (Some(ContainerRole::SubTracks), Some(parent)) => Destination::Main(parent),
            _ => match tree.context_of(track).and_then(|c| tree.fixed_child(c, EntityKind::MasterTrack)) {
                Some(master) => Destination::Input(master),
                None => Destination::Hardware(0),
            },
        },
        _ => Destination::Hardware(0),
    }
}

/// The node a send with no explicit target feeds, if any.
pub fn default_target(tree: &Tree, track: NodeId) -> Option<NodeId> {
    match output_destination(tree, track) {
        Destination::Main(node) | Destination::Input(node) | Destination::RackMix(node) => Some(node),
        Destination::Hardware(_) => None,
    }
}

/// Owning track-like of a send or receive.
pub fn route_owner(tree: &Tree, route: NodeId) -> Option<NodeId> {
    tree.owner(route)
        .filter(|owner| tree.payload(*owner).is_track_like())
}

/// The live node a send feeds, or `None` if the send is detached or its
/// target is gone, detached, or no longer a valid endpoint.
pub fn effective_target(tree: &Tree, send: NodeId) -> Option<NodeId> {
    let Payload::Send(route) = tree.payload(send) else {
        return None;
    };
    if !tree.is_attached(send) {
        return None;
    }
    let owner = route_owner(tree, send)?;
    match route.target {
        None => default_target(tree, owner),
        Some(uuid) => resolve_endpoint(tree, owner, uuid, is_send_endpoint),
    }
}

/// The live track-like a receive pulls from, if any.
pub fn effective_source(tree: &Tree, receive: NodeId) -> Option<NodeId> {
    let Payload::Receive(route) = tree.payload(receive) else {
        return None;
    };
    if !tree.is_attached(receive) {
        return None;
    }
    let owner = route_owner(tree, receive)?;
    resolve_endpoint(tree, owner, route.source, EntityKind::is_track_like)
}

fn is_send_endpoint(kind: EntityKind) -> bool {
    kind.is_routable()
}

fn resolve_endpoint(tree: &Tree, owner: NodeId, uuid: Uuid, accepts: fn(EntityKind) -> bool) -> Option<NodeId> {
    let node = tree.lookup(uuid)?;
    if node == owner || !tree.kind(node).is_some_and(accepts) {
        return None;
    }
    if tree.context_of(node) != tree.context_of(owner) {
        return None;
    }
    Some(node)
}

/// Check that `owner` may send to `target`.
///
/// Sends into a track's input are always allowed: track inputs read with
/// one block of latency, so mutual track sends form no execution cycle.
/// Sends into a device must not be fed, through device chains, track
/// outputs and other device sends, by the device itself.
pub fn validate_send_target(tree: &Tree, owner: NodeId, target: Option<Uuid>) -> Result<()> {
    let Some(uuid) = target else {
        return Ok(());
    };
    let node = validate_endpoint(tree, owner, uuid, is_send_endpoint)?;
    if tree.kind(node).is_some_and(EntityKind::is_device) && reaches(tree, node, owner) {
        log::debug!(target: "routing", "rejecting send {} -> {}: cycle", tree.uuid(owner), uuid);
        return Err(ValidationError::RoutingCycle {
            from: tree.uuid(owner),
            to: uuid,
        }
        .into());
    }
    Ok(())
}

/// Check that `owner` may receive from `source`.
pub fn validate_receive_source(tree: &Tree, owner: NodeId, source: Uuid) -> Result<()> {
    validate_endpoint(tree, owner, source, EntityKind::is_track_like).map(|_| ())
}

fn validate_endpoint(tree: &Tree, owner: NodeId, uuid: Uuid, accepts: fn(EntityKind) -> bool) -> Result<NodeId> {
    if tree.uuid(owner) == uuid {
        return Err(ValidationError::SelfRouting(uuid).into());
    }
    let node = tree
        .lookup(uuid)
        .ok_or(ValidationError::DetachedTarget(uuid))?;
    let kind = tree
        .kind(node)
        .ok_or(ValidationError::UnknownEntity(uuid))?;
    if !accepts(kind) {
        return Err(ValidationError::InvalidEndpoint { kind }.into());
    }
    if tree.context_of(node) != tree.context_of(owner) {
        return Err(ValidationError::CrossContext(uuid).into());
    }
    Ok(node)
}

/// Whether signal leaving `from` can arrive at `to` within the same
/// processing block.
fn reaches(tree: &Tree, from: NodeId, to: NodeId) -> bool {
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([from]);
    while let Some(node) = queue.pop_front() {
        if node == to {
            return true;
        }
        if !seen.insert(node) {
            continue;
        }
        queue.extend(downstream(tree, node));
    }
    false
}

/// Nodes fed by `node`. A rack's input feeds each of its chains. A chain
/// sums into the rack mix, which leaves through the rack's owning track,
/// so the rack itself is not downstream of its chains.
fn downstream(tree: &Tree, node: NodeId) -> Vec<NodeId> {
    let payload = tree.payload(node);
    let mut out = Vec::new();
    if payload.is_device() {
        out.extend(tree.owner(node));
        if *payload == Payload::Rack {
            out.extend(tree.members(node, ContainerRole::Chains).iter().copied());
        }
    } else if payload.is_track_like() {
        match output_destination(tree, node) {
            Destination::RackMix(rack) => out.extend(tree.owner(rack)),
            _ => out.extend(default_target(tree, node)),
        }
        for role in [ContainerRole::PreFaderSends, ContainerRole::PostFaderSends] {
            for send in tree.members(node, role) {
                if let Some(target) = effective_target(tree, *send) {
                    if tree.payload(target).is_device() {
                        out.push(target);
                    }
                }
            }
        }
    }
    out
}

/// Every attached send in the tree whose explicit target is `uuid`.
pub fn sends_targeting(tree: &Tree, uuid: Uuid) -> Vec<NodeId> {
    tree.descendants(tree.root())
        .into_iter()
        .filter(|n| matches!(tree.payload(*n), Payload::Send(route) if route.target == Some(uuid)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{DeviceBody, SendRoute};
    use trellis_types::DeviceRole;

    struct Fixture {
        tree: Tree,
        context: NodeId,
        master: NodeId,
    }

    fn fixture() -> Fixture {
        let mut tree = Tree::new(Uuid::new_v4());
        let contexts = tree.container(NodeId::ROOT, ContainerRole::Contexts).unwrap();
        let context = tree.create(Payload::Context, None);
        tree.insert(contexts, context, None).unwrap();
        let master = tree.create(Payload::MasterTrack, None);
        tree.insert(context, master, None).unwrap();
        Fixture { tree, context, master }
    }

    impl Fixture {
        fn track(&mut self, parent: Option<NodeId>) -> NodeId {
            let (owner, role) = match parent {
                Some(parent) => (parent, ContainerRole::SubTracks),
                None => (self.context, ContainerRole::Tracks),
            };
            let container = self.tree.container(owner, role).unwrap();
            let track = self.tree.create(Payload::Track, None);
            self.tree.insert(container, track, None).unwrap();
            track
        }

        fn device(&mut self, track: NodeId) -> NodeId {
            let container = self.tree.container(track, ContainerRole::Devices).unwrap();
            let device = self.tree.create(
                Payload::Device(DeviceBody {
                    role: DeviceRole::Effect,
                    synthdef: "fx".to_string(),
                }),
                None,
            );
            self.tree.insert(container, device, None).unwrap();
            device
        }

        fn send(&mut self, track: NodeId, target: Option<NodeId>) -> NodeId {
            let container = self.tree.container(track, ContainerRole::PostFaderSends).unwrap();
            let target = target.map(|t| self.tree.uuid(t));
            let send = self.tree.create(Payload::Send(SendRoute { target, gain: 0.0 }), None);
            self.tree.insert(container, send, None).unwrap();
            send
        }
    }

    #[test]
    fn default_destinations() {
        let mut f = fixture();
        let top = f.track(None);
        let sub = f.track(Some(top));
        assert_eq!(output_destination(&f.tree, top), Destination::Input(f.master));
        assert_eq!(output_destination(&f.tree, sub), Destination::Main(top));
        assert_eq!(output_destination(&f.tree, f.master), Destination::Hardware(0));
    }

    #[test]
    fn self_send_is_rejected() {
        let mut f = fixture();
        let a = f.track(None);
        let uuid = f.tree.uuid(a);
        assert!(matches!(
            validate_send_target(&f.tree, a, Some(uuid)),
            Err(crate::Error::Validation(ValidationError::SelfRouting(_)))
        ));
    }

    #[test]
    fn mutual_track_sends_are_allowed() {
        let mut f = fixture();
        let a = f.track(None);
        let b = f.track(None);
        f.send(a, Some(b));
        let a_uuid = f.tree.uuid(a);
        assert!(validate_send_target(&f.tree, b, Some(a_uuid)).is_ok());
    }

    #[test]
    fn send_into_own_device_is_a_cycle() {
        let mut f = fixture();
        let a = f.track(None);
        let device = f.device(a);
        let uuid = f.tree.uuid(device);
        assert!(matches!(
            validate_send_target(&f.tree, a, Some(uuid)),
            Err(crate::Error::Validation(ValidationError::RoutingCycle { .. }))
        ));
    }

    #[test]
    fn cycle_through_device_sends_is_detected() {
        let mut f = fixture();
        let a = f.track(None);
        let b = f.track(None);
        let device_a = f.device(a);
        let device_b = f.device(b);
        f.send(b, Some(device_a));
        let uuid = f.tree.uuid(device_b);
        assert!(validate_send_target(&f.tree, a, Some(uuid)).is_err());
        let other = f.track(None);
        assert!(validate_send_target(&f.tree, other, Some(uuid)).is_ok());
    }

    #[test]
    fn chain_cannot_send_into_its_own_rack() {
        let mut f = fixture();
        let track = f.track(None);
        let devices = f.tree.container(track, ContainerRole::Devices).unwrap();
        let rack = f.tree.create(Payload::Rack, None);
        f.tree.insert(devices, rack, None).unwrap();
        let chains = f.tree.container(rack, ContainerRole::Chains).unwrap();
        let mut chain = || {
            let chain = f.tree.create(Payload::Chain, None);
            f.tree.insert(chains, chain, None).unwrap();
            chain
        };
        let (left, right) = (chain(), chain());
        let right_device = f.device(right);

        let rack_uuid = f.tree.uuid(rack);
        assert!(matches!(
            validate_send_target(&f.tree, left, Some(rack_uuid)),
            Err(crate::Error::Validation(ValidationError::RoutingCycle { .. }))
        ));
        // A sibling chain's device is fed only by the rack input.
        let uuid = f.tree.uuid(right_device);
        assert!(validate_send_target(&f.tree, left, Some(uuid)).is_ok());
        assert!(validate_send_target(&f.tree, right, Some(uuid)).is_err());
    }

    #[test]
    fn removed_target_makes_send_inert() {
        let mut f = fixture();
        let a = f.track(None);
        let b = f.track(None);
        let send = f.send(a, Some(b));
        assert_eq!(effective_target(&f.tree, send), Some(b));
        f.tree.detach(b).unwrap();
        assert_eq!(effective_target(&f.tree, send), None);
        assert_eq!(sends_targeting(&f.tree, f.tree.uuid(b)), vec![send]);
        let tracks = f.tree.container(f.context, ContainerRole::Tracks).unwrap();
        f.tree.insert(tracks, b, None).unwrap();
        assert_eq!(effective_target(&f.tree, send), Some(b));
    }

    #[test]
    fn detached_target_is_rejected() {
        let mut f = fixture();
        let a = f.track(None);
        let b = f.track(None);
        f.tree.detach(b).unwrap();
        let uuid = f.tree.uuid(b);
        assert!(matches!(
            validate_send_target(&f.tree, a, Some(uuid)),
            Err(crate::Error::Validation(ValidationError::DetachedTarget(_)))
        ));
    }
}

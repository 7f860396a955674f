//! Mute, solo and cue switches on tracks and chains.
//!
//! Switches only change controls on existing patches (and add or drop the
//! cue patch); they never move nodes or change widths.

use trellis_types::EntityKind;

use crate::tree::{ContainerRole, NodeId, Payload, Tree};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MixerState {
    pub muted: bool,
    pub soloed: bool,
    pub cued: bool,
}

/// Tracks and chains have switches. Master and cue tracks do not.
pub fn has_switches(payload: &Payload) -> bool {
    matches!(payload, Payload::Track | Payload::Chain)
}

/// Only tracks can be cued.
pub fn can_cue(payload: &Payload) -> bool {
    *payload == Payload::Track
}

/// Nodes whose solo switches compete with `node`'s: the chains of the same
/// rack for a chain, every attached track of the context for a track.
pub fn solo_scope(tree: &Tree, node: NodeId) -> Vec<NodeId> {
    match tree.payload(node) {
        Payload::Chain => tree
            .owner(node)
            .map(|rack| tree.members(rack, ContainerRole::Chains).to_vec())
            .unwrap_or_default(),
        _ => tree
            .context_of(node)
            .map(|context| tracks_of(tree, context))
            .unwrap_or_default(),
    }
}

fn tracks_of(tree: &Tree, context: NodeId) -> Vec<NodeId> {
    tree.descendants(context)
        .into_iter()
        .filter(|n| *tree.payload(*n) == Payload::Track && tree.is_attached(*n))
        .collect()
}

/// Whether `node`'s output is silent: muted, or passed over by a solo in
/// its scope. A track stays audible when a track above or below it is
/// soloed, since the soloed signal runs through it.
pub fn is_silenced(tree: &Tree, node: NodeId) -> bool {
    if !has_switches(tree.payload(node)) {
        return false;
    }
    if tree.node(node).mixer.muted {
        return true;
    }
    let soloed: Vec<NodeId> = solo_scope(tree, node)
        .into_iter()
        .filter(|n| tree.node(*n).mixer.soloed)
        .collect();
    if soloed.is_empty() {
        return false;
    }
    let nests = *tree.payload(node) == Payload::Track;
    !soloed.iter().any(|other| {
        *other == node || (nests && (tree.is_descendant_of(node, *other) || tree.is_descendant_of(*other, node)))
    })
}

/// The cue track a cued track copies its signal into.
pub fn cue_destination(tree: &Tree, node: NodeId) -> Option<NodeId> {
    if !can_cue(tree.payload(node)) || !tree.node(node).mixer.cued {
        return None;
    }
    tree.context_of(node)
        .and_then(|context| tree.fixed_child(context, EntityKind::CueTrack))
}

/// Every other cued track of `node`'s context.
pub fn other_cued(tree: &Tree, node: NodeId) -> Vec<NodeId> {
    tree.context_of(node)
        .map(|context| tracks_of(tree, context))
        .unwrap_or_default()
        .into_iter()
        .filter(|n| *n != node && tree.node(*n).mixer.cued)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_types::Uuid;

    struct Fixture {
        tree: Tree,
        context: NodeId,
    }

    impl Fixture {
        fn new() -> Self {
            let mut tree = Tree::new(Uuid::new_v4());
            let contexts = tree.container(NodeId::ROOT, ContainerRole::Contexts).unwrap();
            let context = tree.create(Payload::Context, None);
            tree.insert(contexts, context, None).unwrap();
            Self { tree, context }
        }

        fn track(&mut self, parent: Option<NodeId>) -> NodeId {
            let container = match parent {
                Some(parent) => self.tree.container(parent, ContainerRole::SubTracks),
                None => self.tree.container(self.context, ContainerRole::Tracks),
            }
            .unwrap();
            let track = self.tree.create(Payload::Track, None);
            self.tree.insert(container, track, None).unwrap();
            track
        }
    }

    #[test]
    fn mute_silences_only_its_track() {
        let mut f = Fixture::new();
        let a = f.track(None);
        let b = f.track(None);
        f.tree.node_mut(a).mixer.muted = true;
        assert!(is_silenced(&f.tree, a));
        assert!(!is_silenced(&f.tree, b));
    }

    #[test]
    fn solo_silences_tracks_off_its_path() {
        let mut f = Fixture::new();
        let group = f.track(None);
        let child = f.track(Some(group));
        let grandchild = f.track(Some(child));
        let other = f.track(None);
        f.tree.node_mut(child).mixer.soloed = true;

        assert!(!is_silenced(&f.tree, child));
        assert!(!is_silenced(&f.tree, group));
        assert!(!is_silenced(&f.tree, grandchild));
        assert!(is_silenced(&f.tree, other));
    }

    #[test]
    fn chains_solo_within_their_rack() {
        let mut f = Fixture::new();
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
        f.tree.node_mut(left).mixer.soloed = true;

        assert!(!is_silenced(&f.tree, left));
        assert!(is_silenced(&f.tree, right));
        assert!(!is_silenced(&f.tree, track));
    }
}

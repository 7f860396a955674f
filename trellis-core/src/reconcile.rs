//! Bringing a provider's allocations in line with the tree.
//!
//! `sync` walks a context in graph order. The first pass gives every
//! audible node a group (placed before its next allocated sibling, so
//! server execution order follows graph order) and buses at its effective
//! width. The second pass works out which patch and body synths each node
//! needs and queues the difference: `/n_set` when only controls changed,
//! replace-in-place when the definition changed, create or free otherwise.
//! A full replay is just a sync against an empty provider.

use std::collections::{BTreeMap, HashSet};

use trellis_audio::backend::{
    build_g_new, build_n_free, build_n_set, build_s_new, ADD_BEFORE, ADD_TO_TAIL,
};
use trellis_audio::ROOT_GROUP;
use trellis_types::{DeviceRole, EntityKind};

use crate::channels::ChannelMap;
use crate::mixer;
use crate::provider::{patch_def, Allocation, BusRole, Provider, ProviderState, SynthInstance, SynthSpec};
use crate::routing::{self, Destination};
use crate::tree::{ContainerRole, LayoutSlot, NodeId, PatchRole, Payload, Tree};

/// Queue whatever commands make the provider match `context` as it is now.
pub fn sync(tree: &Tree, context: NodeId, widths: &ChannelMap, provider: &mut Provider) {
    let nodes: Vec<NodeId> = tree
        .descendants(context)
        .into_iter()
        .filter(|n| tree.payload(*n).is_audible())
        .collect();

    forget_stale(provider, &nodes);
    for node in &nodes {
        sync_group(tree, *node, widths, provider);
    }
    for node in &nodes {
        sync_synths(tree, *node, widths, provider);
    }
}

fn forget_stale(provider: &mut Provider, nodes: &[NodeId]) {
    let live: HashSet<NodeId> = nodes.iter().copied().collect();
    let stale: Vec<NodeId> = provider
        .state()
        .allocations
        .keys()
        .filter(|n| !live.contains(n))
        .copied()
        .collect();
    for node in stale {
        log::warn!(target: "provider", "{}: dropping stale allocation for {}", provider.name(), node);
        provider.state_mut().drop_allocation(node);
    }
}

fn bus_roles(payload: &Payload) -> &'static [BusRole] {
    match payload {
        Payload::Rack => &[BusRole::Main, BusRole::Input, BusRole::Mix],
        p if p.is_track_like() || p.is_device() => &[BusRole::Main, BusRole::Input],
        _ => &[],
    }
}

fn sync_group(tree: &Tree, node: NodeId, widths: &ChannelMap, provider: &mut Provider) {
    let payload = tree.payload(node);
    let roles = bus_roles(payload);
    let width = widths.get(&node).copied().unwrap_or(0);

    if provider.state().allocation(node).is_none() {
        let (action, target) = group_placement(tree, provider.state(), node);
        let state = provider.state_mut();
        let group = state.nodes.allocate();
        let mut allocation = Allocation::new(group, width);
        for role in roles {
            allocation.buses.insert(*role, state.buses.alloc(width));
        }
        state.allocations.insert(node, allocation);
        provider.push(build_g_new(group, action, target));
        return;
    }

    let state = provider.state_mut();
    let Some(allocation) = state.allocations.get_mut(&node) else {
        return;
    };
    if roles.is_empty() || allocation.channels == width {
        return;
    }
    log::debug!(
        target: "provider",
        "{} changes width {} -> {}",
        node, allocation.channels, width
    );
    for bus in std::mem::take(&mut allocation.buses).into_values() {
        state.buses.release(bus);
    }
    let mut buses = BTreeMap::new();
    for role in roles {
        buses.insert(*role, state.buses.alloc(width));
    }
    if let Some(allocation) = state.allocations.get_mut(&node) {
        allocation.buses = buses;
        allocation.channels = width;
    }
}

fn group_placement(tree: &Tree, state: &ProviderState, node: NodeId) -> (i32, i32) {
    if *tree.payload(node) == Payload::Context {
        return (ADD_TO_TAIL, ROOT_GROUP);
    }
    let Some(parent) = tree.parent(node) else {
        return (ADD_TO_TAIL, ROOT_GROUP);
    };
    let position = tree.position(node).unwrap_or(0);
    match next_member(tree, state, parent, position) {
        Some(id) => (ADD_BEFORE, id),
        None => (ADD_TO_TAIL, state.group(parent).unwrap_or(ROOT_GROUP)),
    }
}

/// First allocated server node inside `parent`'s group after `position`.
fn next_member(tree: &Tree, state: &ProviderState, parent: NodeId, position: usize) -> Option<i32> {
    if tree.payload(parent).container_role().is_some() {
        return tree
            .children(parent)
            .iter()
            .skip(position + 1)
            .find_map(|child| state.group(*child));
    }
    tree.payload(parent)
        .layout()
        .iter()
        .enumerate()
        .skip(position + 1)
        .find_map(|(slot, entry)| match entry {
            LayoutSlot::Container(role) => tree.container(parent, *role).and_then(|c| state.group(c)),
            LayoutSlot::Child(kind) => tree.fixed_child(parent, *kind).and_then(|c| state.group(c)),
            LayoutSlot::Patch(_) => state
                .allocation(parent)
                .and_then(|a| a.synths.get(&slot))
                .map(|s| s.node_id),
        })
}

fn sync_synths(tree: &Tree, node: NodeId, widths: &ChannelMap, provider: &mut Provider) {
    let desired = desired_synths(tree, node, widths, provider.state());
    let Some(existing) = provider.state().allocation(node).map(|a| a.synths.clone()) else {
        return;
    };

    for (slot, spec) in &desired {
        match existing.get(slot) {
            Some(current) if current.spec == *spec => {}
            Some(current) if current.spec.def == spec.def => {
                let changed = spec.changed_controls(&current.spec);
                provider.push(build_n_set(current.node_id, &changed));
                set_synth(provider, node, *slot, current.node_id, spec.clone());
            }
            Some(current) => {
                let id = provider.state_mut().nodes.allocate();
                provider.push(build_s_new(&spec.def, id, ADD_BEFORE, current.node_id, &spec.controls));
                provider.push(build_n_free(current.node_id));
                provider.state_mut().nodes.unregister(current.node_id);
                set_synth(provider, node, *slot, id, spec.clone());
            }
            None => {
                let (action, target) = match next_member(tree, provider.state(), node, *slot) {
                    Some(id) => (ADD_BEFORE, id),
                    None => (ADD_TO_TAIL, provider.state().group(node).unwrap_or(ROOT_GROUP)),
                };
                let id = provider.state_mut().nodes.allocate();
                provider.push(build_s_new(&spec.def, id, action, target, &spec.controls));
                set_synth(provider, node, *slot, id, spec.clone());
            }
        }
    }

    for (slot, current) in existing {
        if desired.contains_key(&slot) {
            continue;
        }
        provider.push(build_n_free(current.node_id));
        let state = provider.state_mut();
        state.nodes.unregister(current.node_id);
        if let Some(allocation) = state.allocations.get_mut(&node) {
            allocation.synths.remove(&slot);
        }
    }
}

fn set_synth(provider: &mut Provider, node: NodeId, slot: usize, node_id: i32, spec: SynthSpec) {
    if let Some(allocation) = provider.state_mut().allocations.get_mut(&node) {
        allocation.synths.insert(slot, SynthInstance { node_id, spec });
    }
}

/// Named parameter values of an owner, in container order.
pub fn parameter_values(tree: &Tree, owner: NodeId) -> Vec<(String, f32)> {
    tree.members(owner, ContainerRole::Parameters)
        .iter()
        .filter_map(|p| match (tree.payload(*p), &tree.node(*p).name) {
            (Payload::Parameter(value), Some(name)) => Some((name.clone(), value.value)),
            _ => None,
        })
        .collect()
}

fn parameter(tree: &Tree, owner: NodeId, name: &str) -> f32 {
    parameter_values(tree, owner)
        .into_iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v)
        .unwrap_or(0.0)
}

/// Synths a node should own, keyed by layout slot.
fn desired_synths(tree: &Tree, node: NodeId, widths: &ChannelMap, state: &ProviderState) -> BTreeMap<usize, SynthSpec> {
    let mut out = BTreeMap::new();
    let payload = tree.payload(node);
    let width = |n: NodeId| widths.get(&n).copied().unwrap_or(1);
    let bus = |n: NodeId, role: BusRole| state.bus(n, role).map(|b| b.index as f32);
    let slot = |role: PatchRole| payload.patch_slot(role);

    match payload {
        p if p.is_track_like() => {
            let (Some(main), Some(input)) = (bus(node, BusRole::Main), bus(node, BusRole::Input)) else {
                return out;
            };
            let input_patch = match (p, tree.owner(node)) {
                (Payload::Chain, Some(rack)) => bus(rack, BusRole::Main).map(|rack_main| {
                    SynthSpec::new(patch_def(width(rack), width(node)))
                        .control("in", rack_main)
                        .control("feedback", input)
                        .control("out", main)
                }),
                _ => Some(
                    SynthSpec::new(patch_def(width(node), width(node)))
                        .control("in", input)
                        .control("out", main),
                ),
            };
            if let (Some(s), Some(spec)) = (slot(PatchRole::Input), input_patch) {
                out.insert(s, spec);
            }

            let destination = match routing::output_destination(tree, node) {
                Destination::Main(n) => bus(n, BusRole::Main).map(|b| (b, width(n))),
                Destination::Input(n) => bus(n, BusRole::Input).map(|b| (b, width(n))),
                Destination::RackMix(n) => bus(n, BusRole::Mix).map(|b| (b, width(n))),
                Destination::Hardware(index) => Some((hardware_bus(tree, node, index, widths), width(node))),
            };
            if let (Some(s), Some((out_bus, out_width))) = (slot(PatchRole::Output), destination) {
                out.insert(
                    s,
                    SynthSpec::new(patch_def(width(node), out_width))
                        .control("in", main)
                        .control("out", out_bus)
                        .control("gain", parameter(tree, node, "gain"))
                        .control("panning", parameter(tree, node, "panning"))
                        .control("mute", if mixer::is_silenced(tree, node) { 1.0 } else { 0.0 }),
                );
            }
            let cue = mixer::cue_destination(tree, node).and_then(|cue| bus(cue, BusRole::Input).map(|b| (b, width(cue))));
            if let (Some(s), Some((cue_bus, cue_width))) = (slot(PatchRole::Cue), cue) {
                out.insert(
                    s,
                    SynthSpec::new(patch_def(width(node), cue_width))
                        .control("in", main)
                        .control("out", cue_bus),
                );
            }
        }
        Payload::Device(body) => {
            let Some(owner) = tree.owner(node) else {
                return out;
            };
            let (Some(owner_main), Some(main), Some(input)) = (
                bus(owner, BusRole::Main),
                bus(node, BusRole::Main),
                bus(node, BusRole::Input),
            ) else {
                return out;
            };
            if let Some(s) = slot(PatchRole::DeviceIn) {
                out.insert(
                    s,
                    SynthSpec::new(patch_def(width(owner), width(node)))
                        .control("in", owner_main)
                        .control("feedback", input)
                        .control("out", main),
                );
            }
            if let (DeviceRole::Effect, Some(s)) = (body.role, slot(PatchRole::Body)) {
                let mut spec = SynthSpec::new(body.synthdef.clone()).control("out", main);
                spec.controls.extend(parameter_values(tree, node));
                out.insert(s, spec);
            }
            if let Some(s) = slot(PatchRole::DeviceOut) {
                out.insert(
                    s,
                    SynthSpec::new(patch_def(width(node), width(owner)))
                        .control("in", main)
                        .control("out", owner_main),
                );
            }
        }
        Payload::Rack => {
            let Some(owner) = tree.owner(node) else {
                return out;
            };
            let (Some(owner_main), Some(main), Some(input), Some(mix)) = (
                bus(owner, BusRole::Main),
                bus(node, BusRole::Main),
                bus(node, BusRole::Input),
                bus(node, BusRole::Mix),
            ) else {
                return out;
            };
            if let Some(s) = slot(PatchRole::RackIn) {
                out.insert(
                    s,
                    SynthSpec::new(patch_def(width(owner), width(node)))
                        .control("in", owner_main)
                        .control("feedback", input)
                        .control("out", main),
                );
            }
            if let Some(s) = slot(PatchRole::RackOut) {
                out.insert(
                    s,
                    SynthSpec::new(patch_def(width(node), width(owner)))
                        .control("in", mix)
                        .control("out", owner_main),
                );
            }
        }
        Payload::Send(route) => {
            let endpoints = routing::route_owner(tree, node).zip(routing::effective_target(tree, node));
            if let Some((owner, target)) = endpoints {
                if let (Some(from), Some(to), Some(s)) =
                    (bus(owner, BusRole::Main), bus(target, BusRole::Input), slot(PatchRole::Route))
                {
                    out.insert(
                        s,
                        SynthSpec::new(patch_def(width(owner), width(target)))
                            .control("in", from)
                            .control("out", to)
                            .control("gain", route.gain),
                    );
                }
            }
        }
        Payload::Receive(route) => {
            let endpoints = routing::route_owner(tree, node).zip(routing::effective_source(tree, node));
            if let Some((owner, source)) = endpoints {
                if let (Some(from), Some(to), Some(s)) =
                    (bus(source, BusRole::Main), bus(owner, BusRole::Input), slot(PatchRole::Route))
                {
                    out.insert(
                        s,
                        SynthSpec::new(patch_def(width(source), width(owner)))
                            .control("in", from)
                            .control("out", to)
                            .control("gain", route.gain),
                    );
                }
            }
        }
        _ => {}
    }
    out
}

/// Hardware output bus for a track-like: the cue track sits just past the
/// master's outputs.
fn hardware_bus(tree: &Tree, node: NodeId, index: i32, widths: &ChannelMap) -> f32 {
    if *tree.payload(node) != Payload::CueTrack {
        return index as f32;
    }
    let master_width = tree
        .context_of(node)
        .and_then(|c| tree.fixed_child(c, EntityKind::MasterTrack))
        .and_then(|m| widths.get(&m).copied())
        .unwrap_or(0);
    (index + master_width as i32) as f32
}

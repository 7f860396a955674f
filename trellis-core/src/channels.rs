//! Effective channel counts.
//!
//! Every track-like and device in a context gets the smallest width that
//! avoids truncation across its routing neighbourhood: at least its declared
//! minimum, and at least as wide as anything it is connected to. Nodes with
//! an explicit override keep exactly that width.

use std::collections::HashMap;

use trellis_types::{MAX_CHANNEL_COUNT, MIN_CHANNEL_COUNT};

use crate::error::{Result, ValidationError};
use crate::routing;
use crate::tree::{ContainerRole, NodeId, Payload, Tree};

/// Effective widths for one context, keyed by node.
pub type ChannelMap = HashMap<NodeId, u8>;

pub fn validate_channel_count(count: u8) -> Result<()> {
    if (MIN_CHANNEL_COUNT..=MAX_CHANNEL_COUNT).contains(&count) {
        Ok(())
    } else {
        Err(ValidationError::InvalidChannelCount(count).into())
    }
}

/// Nodes whose width is tracked.
pub fn is_sized(payload: &Payload) -> bool {
    payload.is_track_like() || payload.is_device()
}

/// Width a node asks for before looking at its neighbours: its own
/// override, else the nearest override above it, else the application's.
pub fn declared_channel_count(tree: &Tree, node: NodeId) -> u8 {
    std::iter::once(node)
        .chain(tree.ancestors(node))
        .find_map(|n| tree.node(n).channel_count)
        .unwrap_or(MIN_CHANNEL_COUNT)
}

/// Compute effective widths for every sized node in `context`.
pub fn compute(tree: &Tree, context: NodeId) -> ChannelMap {
    let nodes: Vec<NodeId> = tree
        .descendants(context)
        .into_iter()
        .filter(|n| is_sized(tree.payload(*n)))
        .collect();

    let mut widths: ChannelMap = nodes
        .iter()
        .map(|n| (*n, declared_channel_count(tree, *n)))
        .collect();
    let edges = edges(tree, &nodes);

    let mut changed = true;
    while changed {
        changed = false;
        for (a, b) in &edges {
            let (wa, wb) = (widths[a], widths[b]);
            if wa < wb && tree.node(*a).channel_count.is_none() {
                widths.insert(*a, wb);
                changed = true;
            } else if wb < wa && tree.node(*b).channel_count.is_none() {
                widths.insert(*b, wa);
                changed = true;
            }
        }
    }
    widths
}

/// Undirected routing edges between sized nodes.
fn edges(tree: &Tree, nodes: &[NodeId]) -> Vec<(NodeId, NodeId)> {
    let known = |n: &NodeId| nodes.contains(n);
    let mut out = Vec::new();
    for node in nodes {
        let payload = tree.payload(*node);
        if payload.is_device() {
            if let Some(owner) = tree.owner(*node) {
                out.push((*node, owner));
            }
            continue;
        }
        if let Some(destination) = routing::default_target(tree, *node) {
            out.push((*node, destination));
        }
        for role in [ContainerRole::PreFaderSends, ContainerRole::PostFaderSends] {
            for send in tree.members(*node, role) {
                if let Some(target) = routing::effective_target(tree, *send) {
                    out.push((*node, target));
                }
            }
        }
        for receive in tree.members(*node, ContainerRole::Receives) {
            if let Some(source) = routing::effective_source(tree, *receive) {
                out.push((source, *node));
            }
        }
    }
    out.retain(|(a, b)| known(a) && known(b));
    out
}

//! In-memory model of a synthesis server's node tree.
//!
//! Applies `/g_new`, `/s_new`, `/n_set` and `/n_free` the way the server
//! does, so recorded bundles can be checked for ordering and answered for
//! tree queries without a running server.

use std::collections::HashMap;

use trellis_types::{BackendStatus, ServerNode};

use crate::backend::{
    BackendError, BackendMessage, BackendResult, RawArg, ADD_AFTER, ADD_BEFORE, ADD_TO_HEAD,
    ADD_TO_TAIL,
};

/// Id of the server's root group.
pub const ROOT_GROUP: i32 = 0;

#[derive(Debug, Clone)]
enum SimKind {
    Group { children: Vec<i32> },
    Synth { def: String, controls: Vec<(String, f32)> },
}

#[derive(Debug, Clone)]
struct SimNode {
    parent: Option<i32>,
    kind: SimKind,
}

#[derive(Debug, Clone)]
pub struct NodeTree {
    nodes: HashMap<i32, SimNode>,
}

impl NodeTree {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            ROOT_GROUP,
            SimNode {
                parent: None,
                kind: SimKind::Group { children: Vec::new() },
            },
        );
        Self { nodes }
    }

    /// Apply a bundle atomically: on the first failing message nothing changes.
    pub fn apply_bundle(&mut self, messages: &[BackendMessage]) -> BackendResult {
        let mut scratch = self.clone();
        for message in messages {
            scratch.apply(message)?;
        }
        *self = scratch;
        Ok(())
    }

    pub fn apply(&mut self, message: &BackendMessage) -> BackendResult {
        let args = &message.args;
        match message.addr.as_str() {
            "/g_new" => {
                for chunk in args.chunks(3) {
                    let id = int_arg(chunk, 0, "/g_new")?;
                    let action = int_arg(chunk, 1, "/g_new")?;
                    let target = int_arg(chunk, 2, "/g_new")?;
                    self.insert(id, action, target, SimKind::Group { children: Vec::new() })?;
                }
                Ok(())
            }
            "/s_new" => {
                let def = args
                    .first()
                    .and_then(RawArg::as_str)
                    .ok_or_else(|| BackendError("/s_new: missing synthdef".to_string()))?
                    .to_string();
                let id = int_arg(args, 1, "/s_new")?;
                let action = int_arg(args, 2, "/s_new")?;
                let target = int_arg(args, 3, "/s_new")?;
                let controls = control_pairs(&args[4.min(args.len())..]);
                self.insert(id, action, target, SimKind::Synth { def, controls })
            }
            "/n_set" => {
                let id = int_arg(args, 0, "/n_set")?;
                let pairs = control_pairs(&args[1.min(args.len())..]);
                match self.nodes.get_mut(&id) {
                    Some(SimNode {
                        kind: SimKind::Synth { controls, .. },
                        ..
                    }) => {
                        for (name, value) in pairs {
                            match controls.iter_mut().find(|(n, _)| *n == name) {
                                Some(slot) => slot.1 = value,
                                None => controls.push((name, value)),
                            }
                        }
                        Ok(())
                    }
                    Some(_) => Ok(()),
                    None => Err(BackendError(format!("/n_set: node {} not found", id))),
                }
            }
            "/n_free" => {
                for arg in args {
                    let id = arg
                        .as_int()
                        .ok_or_else(|| BackendError("/n_free: expected node id".to_string()))?;
                    self.remove(id)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn insert(&mut self, id: i32, action: i32, target: i32, kind: SimKind) -> BackendResult {
        if self.nodes.contains_key(&id) {
            return Err(BackendError(format!("duplicate node id {}", id)));
        }
        let (parent, index) = match action {
            ADD_TO_HEAD | ADD_TO_TAIL => {
                let children = self.group_children(target)?;
                let index = if action == ADD_TO_HEAD { 0 } else { children.len() };
                (target, index)
            }
            ADD_BEFORE | ADD_AFTER => {
                let parent = self
                    .nodes
                    .get(&target)
                    .and_then(|n| n.parent)
                    .ok_or_else(|| BackendError(format!("target node {} not found", target)))?;
                let children = self.group_children(parent)?;
                let position = children
                    .iter()
                    .position(|c| *c == target)
                    .ok_or_else(|| BackendError(format!("target node {} not found", target)))?;
                let index = if action == ADD_BEFORE { position } else { position + 1 };
                (parent, index)
            }
            other => return Err(BackendError(format!("unsupported add action {}", other))),
        };
        if let Some(SimNode {
            kind: SimKind::Group { children },
            ..
        }) = self.nodes.get_mut(&parent)
        {
            children.insert(index, id);
        }
        self.nodes.insert(
            id,
            SimNode {
                parent: Some(parent),
                kind,
            },
        );
        Ok(())
    }

    fn remove(&mut self, id: i32) -> BackendResult {
        if id == ROOT_GROUP {
            return Err(BackendError("cannot free the root group".to_string()));
        }
        let node = self
            .nodes
            .remove(&id)
            .ok_or_else(|| BackendError(format!("/n_free: node {} not found", id)))?;
        if let Some(parent) = node.parent {
            if let Some(SimNode {
                kind: SimKind::Group { children },
                ..
            }) = self.nodes.get_mut(&parent)
            {
                children.retain(|c| *c != id);
            }
        }
        if let SimKind::Group { children } = node.kind {
            for child in children {
                self.remove_subtree(child);
            }
        }
        Ok(())
    }

    fn remove_subtree(&mut self, id: i32) {
        if let Some(node) = self.nodes.remove(&id) {
            if let SimKind::Group { children } = node.kind {
                for child in children {
                    self.remove_subtree(child);
                }
            }
        }
    }

    fn group_children(&self, id: i32) -> BackendResult<&Vec<i32>> {
        match self.nodes.get(&id) {
            Some(SimNode {
                kind: SimKind::Group { children },
                ..
            }) => Ok(children),
            Some(_) => Err(BackendError(format!("node {} is not a group", id))),
            None => Err(BackendError(format!("target group {} not found", id))),
        }
    }

    pub fn contains(&self, id: i32) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn to_server_node(&self) -> ServerNode {
        self.build(ROOT_GROUP)
    }

    fn build(&self, id: i32) -> ServerNode {
        match self.nodes.get(&id).map(|n| &n.kind) {
            Some(SimKind::Group { children }) => ServerNode::Group {
                id,
                children: children.iter().map(|c| self.build(*c)).collect(),
            },
            Some(SimKind::Synth { def, controls }) => ServerNode::Synth {
                id,
                def: def.clone(),
                controls: controls.clone(),
            },
            None => ServerNode::Group {
                id,
                children: Vec::new(),
            },
        }
    }

    pub fn status(&self) -> BackendStatus {
        let groups = self
            .nodes
            .values()
            .filter(|n| matches!(n.kind, SimKind::Group { .. }))
            .count() as i32;
        BackendStatus {
            synths: self.nodes.len() as i32 - groups,
            groups,
            ..BackendStatus::default()
        }
    }
}

impl Default for NodeTree {
    fn default() -> Self {
        Self::new()
    }
}

fn int_arg(args: &[RawArg], index: usize, addr: &str) -> BackendResult<i32> {
    args.get(index)
        .and_then(RawArg::as_int)
        .ok_or_else(|| BackendError(format!("{}: expected integer argument {}", addr, index)))
}

fn control_pairs(args: &[RawArg]) -> Vec<(String, f32)> {
    args.chunks(2)
        .filter_map(|pair| match pair {
            [RawArg::Str(name), value] => value.as_float().map(|v| (name.clone(), v)),
            _ => None,
        })
        .collect()
}

use serde::{Deserialize, Serialize};

/// Whether the application is bound to a live server, rendering, or neither.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ApplicationStatus {
    #[default]
    Offline,
    Realtime,
    NonRealtime,
}

/// Server health as reported by `/status.reply`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BackendStatus {
    pub ugens: i32,
    pub synths: i32,
    pub groups: i32,
    pub synthdefs: i32,
    pub average_cpu: f32,
    pub peak_cpu: f32,
}

/// One node of the live server tree as returned by a tree query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerNode {
    Group {
        id: i32,
        children: Vec<ServerNode>,
    },
    Synth {
        id: i32,
        def: String,
        controls: Vec<(String, f32)>,
    },
}

impl ServerNode {
    pub fn id(&self) -> i32 {
        match self {
            ServerNode::Group { id, .. } | ServerNode::Synth { id, .. } => *id,
        }
    }

    pub fn children(&self) -> &[ServerNode] {
        match self {
            ServerNode::Group { children, .. } => children,
            ServerNode::Synth { .. } => &[],
        }
    }

    /// Depth-first search for a node by id.
    pub fn find(&self, node_id: i32) -> Option<&ServerNode> {
        if self.id() == node_id {
            return Some(self);
        }
        self.children().iter().find_map(|child| child.find(node_id))
    }

    /// Synth definition names in execution order.
    pub fn synth_defs(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_defs(&mut out);
        out
    }

    fn collect_defs<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            ServerNode::Group { children, .. } => {
                for child in children {
                    child.collect_defs(out);
                }
            }
            ServerNode::Synth { def, .. } => out.push(def.as_str()),
        }
    }

    /// Node ids in execution (pre-order) order.
    pub fn execution_order(&self) -> Vec<i32> {
        let mut out = vec![self.id()];
        for child in self.children() {
            out.extend(child.execution_order());
        }
        out
    }

    /// Total number of nodes below (and including) this one.
    pub fn node_count(&self) -> usize {
        1 + self.children().iter().map(ServerNode::node_count).sum::<usize>()
    }

    /// Render as an indented listing, one node per line.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        self.dump_into(&mut out, 0);
        out
    }

    fn dump_into(&self, out: &mut String, depth: usize) {
        let indent = "    ".repeat(depth);
        match self {
            ServerNode::Group { id, children } => {
                out.push_str(&format!("{}{} group\n", indent, id));
                for child in children {
                    child.dump_into(out, depth + 1);
                }
            }
            ServerNode::Synth { id, def, .. } => {
                out.push_str(&format!("{}{} {}\n", indent, id, def));
            }
        }
    }
}

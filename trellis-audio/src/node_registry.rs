use std::collections::BTreeSet;

/// Server node ids handed out for one context's connection.
///
/// Ids only ever count up, so a bundle that arrives late cannot touch a node
/// created after it. Freeing a group frees its contents on the server too;
/// whoever frees the group retires the contained ids here.
#[derive(Debug, Clone)]
pub struct NodeRegistry {
    next: i32,
    live: BTreeSet<i32>,
}

impl NodeRegistry {
    pub fn new(first_id: i32) -> Self {
        Self {
            next: first_id,
            live: BTreeSet::new(),
        }
    }

    pub fn allocate(&mut self) -> i32 {
        let id = self.next;
        self.next += 1;
        self.live.insert(id);
        id
    }

    pub fn unregister(&mut self, id: i32) {
        self.live.remove(&id);
    }

    pub fn unregister_all(&mut self, ids: impl IntoIterator<Item = i32>) {
        for id in ids {
            self.live.remove(&id);
        }
    }

    /// Forget every id, keeping the counter. Used once the connection is gone.
    pub fn invalidate_all(&mut self) {
        if !self.live.is_empty() {
            log::debug!(target: "audio::nodes", "forgetting {} live nodes", self.live.len());
        }
        self.live.clear();
    }

    pub fn is_live(&self, id: i32) -> bool {
        self.live.contains(&id)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }
}

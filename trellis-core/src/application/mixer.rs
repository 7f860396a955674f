use trellis_types::Event;

use super::Application;
use crate::error::Result;
use crate::mixer::{self, MixerState};
use crate::tree::NodeId;

impl Application {
    pub fn mixer_state(&self, node: NodeId) -> Option<MixerState> {
        if !self.tree.contains(node) || !mixer::has_switches(self.tree.payload(node)) {
            return None;
        }
        Some(self.tree.node(node).mixer)
    }

    /// Whether a track or chain is currently silent, either muted or passed
    /// over by a solo in its scope.
    pub fn is_silenced(&self, node: NodeId) -> bool {
        self.tree.contains(node) && mixer::is_silenced(&self.tree, node)
    }

    pub fn set_muted(&mut self, node: NodeId, muted: bool) -> Result<()> {
        let node = self.require(node, "muting", mixer::has_switches)?;
        self.grouped(|app| {
            app.switch(node, |state| state.muted = muted);
            Ok(())
        })
    }

    /// Solo a track or chain. An exclusive solo clears every other solo in
    /// the same scope first.
    pub fn set_soloed(&mut self, node: NodeId, soloed: bool, exclusive: bool) -> Result<()> {
        let node = self.require(node, "soloing", mixer::has_switches)?;
        self.grouped(|app| {
            if exclusive {
                for other in mixer::solo_scope(&app.tree, node) {
                    if other != node && app.tree.node(other).mixer.soloed {
                        app.switch(other, |state| state.soloed = false);
                    }
                }
            }
            app.switch(node, |state| state.soloed = soloed);
            Ok(())
        })
    }

    /// Cue a track into its context's cue track. An exclusive cue clears
    /// every other cue in the context first.
    pub fn set_cued(&mut self, track: NodeId, cued: bool, exclusive: bool) -> Result<()> {
        let track = self.require(track, "cueing", mixer::can_cue)?;
        self.grouped(|app| {
            if exclusive {
                for other in mixer::other_cued(&app.tree, track) {
                    app.switch(other, |state| state.cued = false);
                }
            }
            app.switch(track, |state| state.cued = cued);
            Ok(())
        })
    }

    fn switch(&mut self, node: NodeId, change: impl FnOnce(&mut MixerState)) {
        let before = self.tree.node(node).mixer;
        let mut after = before;
        change(&mut after);
        if after == before {
            return;
        }
        self.tree.node_mut(node).mixer = after;
        log::debug!(target: "tree", "{} mixer {:?}", self.tree.describe(node), after);
        self.emit(Event::MixerChanged {
            uuid: self.tree.uuid(node),
            muted: after.muted,
            soloed: after.soloed,
            cued: after.cued,
        });
    }
}

//! Clip launching, clip editing, transport control and MIDI performance.

use std::collections::{BTreeSet, HashMap};

use trellis_types::{DeviceRole, Event, MidiMessage, Note};

use super::Application;
use crate::clip::Clip;
use crate::error::{Result, ValidationError};
use crate::provider::{BusRole, SynthSpec};
use crate::reconcile::parameter_values;
use crate::transport::{Clock, ClockEvent, EventId};
use crate::tree::{DeviceBody, NodeId, Payload};

/// A clip playing on a track.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackPlayback {
    pub slot: NodeId,
    pub clip: NodeId,
    /// Transport offset the clip was launched at.
    pub start_delta: f64,
    /// Pitches the clip has started and not yet released.
    pub sounding: BTreeSet<u8>,
    pub(crate) event: Option<EventId>,
}

impl TrackPlayback {
    fn track(&mut self, messages: &[MidiMessage]) {
        for message in messages {
            match *message {
                MidiMessage::NoteOn { pitch, .. } => self.sounding.insert(pitch),
                MidiMessage::NoteOff { pitch } => self.sounding.remove(&pitch),
            };
        }
    }
}

#[derive(Debug, Clone, Default)]
pub(super) struct Playback {
    tracks: HashMap<NodeId, TrackPlayback>,
}

fn is_slot(payload: &Payload) -> bool {
    *payload == Payload::Slot
}

fn is_clip(payload: &Payload) -> bool {
    matches!(payload, Payload::Clip(_))
}

impl Application {
    pub fn playing(&self, track: NodeId) -> Option<&TrackPlayback> {
        self.playback.tracks.get(&track)
    }

    // ─── Transport ──────────────────────────────────────────────────

    pub fn set_tempo(&mut self, tempo: f64) -> Result<()> {
        self.grouped(|app| {
            app.transport.set_tempo(tempo)?;
            app.emit(Event::TempoChanged { tempo });
            Ok(())
        })
    }

    pub fn set_time_signature(&mut self, numerator: u32, denominator: u32) -> Result<()> {
        self.grouped(|app| {
            app.transport.set_time_signature(numerator, denominator)?;
            app.emit(Event::TimeSignatureChanged {
                time_signature: (numerator, denominator),
            });
            Ok(())
        })
    }

    pub fn set_looping(&mut self, looping: bool) -> Result<()> {
        self.grouped(|app| {
            app.transport.set_looping(looping);
            app.emit(Event::LoopingChanged { looping });
            Ok(())
        })
    }

    pub fn set_loop_points(&mut self, start: f64, stop: f64) -> Result<()> {
        self.grouped(|app| {
            app.transport.set_loop_points(start, stop)?;
            app.emit(Event::LoopPointsChanged { start, stop });
            Ok(())
        })
    }

    /// Start the transport. Returns `false` if it was already running.
    pub fn start(&mut self) -> Result<bool> {
        self.grouped(|app| Ok(app.start_transport()))
    }

    fn start_transport(&mut self) -> bool {
        let started = self.transport.start();
        if started {
            self.emit(Event::TransportStarted);
        }
        started
    }

    /// Stop every playing clip and the transport.
    pub fn stop(&mut self) -> Result<bool> {
        self.grouped(|app| {
            let mut tracks: Vec<NodeId> = app.playback.tracks.keys().copied().collect();
            tracks.sort_by_key(|track| app.tree.graph_order(*track));
            for track in tracks {
                app.stop_track(track)?;
            }
            let stopped = app.transport.stop();
            if stopped {
                app.emit(Event::TransportStopped);
            }
            Ok(stopped)
        })
    }

    /// Run the clock up to `offset`, handling everything that falls due on
    /// the way. Each event is its own grouped update.
    pub fn advance_to(&mut self, offset: f64) -> Result<()> {
        if !offset.is_finite() {
            return Err(ValidationError::InvalidDuration(offset).into());
        }
        while let Some((_, event, at)) = self.transport.clock_mut().pop_due(offset) {
            log::trace!(target: "transport", "{:?} due at {}", event, at);
            self.grouped(|app| app.handle_clock_event(event, at))?;
        }
        if offset > self.transport.offset() {
            self.transport.clock_mut().seek(offset);
        }
        Ok(())
    }

    fn handle_clock_event(&mut self, event: ClockEvent, at: f64) -> Result<()> {
        match event {
            ClockEvent::Tick => {
                let moment = self.transport.moment_at(at);
                self.emit(Event::TransportTicked(moment));
                self.transport.rearm_tick(at);
                Ok(())
            }
            ClockEvent::ClipPerform(track) => self.perform_clip(track, at),
        }
    }

    // ─── Slots and scenes ───────────────────────────────────────────

    /// Launch the clip in `slot` on its track, stopping whatever the track
    /// was playing. An empty slot just stops the track.
    pub fn fire_slot(&mut self, slot: NodeId) -> Result<()> {
        let slot = self.require(slot, "firing", is_slot)?;
        self.grouped(|app| app.launch(slot))
    }

    /// Fire the slot at `index` on every track.
    pub fn fire_scene(&mut self, index: usize) -> Result<()> {
        if index >= self.scenes().len() {
            return Err(ValidationError::InvalidSceneIndex(index).into());
        }
        self.grouped(|app| {
            for track in app.all_tracks() {
                if let Some(slot) = app.slots(track).get(index).copied() {
                    app.launch(slot)?;
                }
            }
            Ok(())
        })
    }

    fn launch(&mut self, slot: NodeId) -> Result<()> {
        let Some(track) = self.tree.owner(slot) else {
            return Ok(());
        };
        self.stop_track(track)?;
        let uuid = self.tree.uuid(slot);
        self.emit(Event::SlotFired { slot: uuid });

        let Some(clip) = self.clip(slot) else {
            return Ok(());
        };
        self.start_transport();
        let now = self.transport.offset();
        let moment = match self.tree.payload(clip) {
            Payload::Clip(content) => content.at(now, now, false),
            _ => return Ok(()),
        };
        let event = self.schedule_next(track, now, moment.next_offset);
        let messages = moment.messages();
        let mut playing = TrackPlayback {
            slot,
            clip,
            start_delta: now,
            sounding: BTreeSet::new(),
            event,
        };
        playing.track(&messages);
        self.playback.tracks.insert(track, playing);
        let uuid = self.tree.uuid(clip);
        self.emit(Event::ClipLaunched { clip: uuid });
        self.perform_at(track, now, messages);
        Ok(())
    }

    fn schedule_next(&mut self, track: NodeId, now: f64, next: Option<f64>) -> Option<EventId> {
        let next = next.filter(|next| *next > now)?;
        Some(self.transport.clock_mut().schedule(ClockEvent::ClipPerform(track), next))
    }

    fn perform_clip(&mut self, track: NodeId, at: f64) -> Result<()> {
        let Some(playing) = self.playback.tracks.get(&track).cloned() else {
            return Ok(());
        };
        let moment = match self.tree.payload(playing.clip) {
            Payload::Clip(content) => content.at(at, playing.start_delta, false),
            _ => {
                self.playback.tracks.remove(&track);
                return Ok(());
            }
        };
        let event = self.schedule_next(track, at, moment.next_offset);
        let messages = moment.messages();
        if let Some(playing) = self.playback.tracks.get_mut(&track) {
            playing.event = event;
            playing.track(&messages);
        }
        self.perform_at(track, at, messages);
        Ok(())
    }

    /// Stop a track's clip, releasing every note it has sounding.
    pub(super) fn stop_track(&mut self, track: NodeId) -> Result<()> {
        let Some(playing) = self.playback.tracks.remove(&track) else {
            return Ok(());
        };
        if let Some(id) = playing.event {
            self.transport.clock_mut().cancel(id);
        }
        let now = self.transport.offset();
        let messages = playing
            .sounding
            .iter()
            .map(|pitch| MidiMessage::NoteOff { pitch: *pitch })
            .collect();
        self.perform_at(track, now, messages);
        Ok(())
    }

    /// Stop whichever track is playing from `slot`.
    pub(super) fn stop_slot(&mut self, slot: NodeId) -> Result<()> {
        let playing: Vec<NodeId> = self
            .playback
            .tracks
            .iter()
            .filter(|(_, p)| p.slot == slot)
            .map(|(track, _)| *track)
            .collect();
        for track in playing {
            self.stop_track(track)?;
        }
        Ok(())
    }

    /// Forget a track's playback without performing anything.
    pub(super) fn cancel_playback(&mut self, track: NodeId) {
        if let Some(playing) = self.playback.tracks.remove(&track) {
            if let Some(id) = playing.event {
                self.transport.clock_mut().cancel(id);
            }
        }
    }

    /// Release pitches left sounding by a clip's old content that its
    /// current content no longer touches at the current offset.
    fn release_orphans(&mut self, clip: NodeId) {
        let now = self.transport.offset();
        let Payload::Clip(content) = self.tree.payload(clip) else {
            return;
        };
        let mut released = Vec::new();
        for (track, playing) in self.playback.tracks.iter_mut() {
            if playing.clip != clip {
                continue;
            }
            let moment = content.at(now, playing.start_delta, false);
            let held: BTreeSet<u8> = moment
                .start_notes
                .iter()
                .chain(&moment.stop_notes)
                .chain(&moment.overlap_notes)
                .map(|note| note.pitch)
                .collect();
            let messages: Vec<MidiMessage> = playing
                .sounding
                .difference(&held)
                .map(|pitch| MidiMessage::NoteOff { pitch: *pitch })
                .collect();
            if !messages.is_empty() {
                playing.track(&messages);
                released.push((*track, messages));
            }
        }
        released.sort_by_key(|(track, _)| self.tree.graph_order(*track));
        for (track, messages) in released {
            self.perform_at(track, now, messages);
        }
    }

    /// Play a modified clip again from the current offset.
    fn reschedule_clip(&mut self, clip: NodeId) {
        let now = self.transport.offset();
        let clock = self.transport.clock_mut();
        for (track, playing) in self.playback.tracks.iter_mut() {
            if playing.clip != clip {
                continue;
            }
            let current = playing.event;
            match current {
                Some(id) if clock.reschedule(id, now) => {}
                _ => playing.event = Some(clock.schedule(ClockEvent::ClipPerform(*track), now)),
            }
        }
    }

    // ─── Clips ──────────────────────────────────────────────────────

    fn clip_mut(&mut self, clip: NodeId) -> Result<&mut Clip> {
        let kind = self.tree.kind(clip).unwrap_or(trellis_types::EntityKind::Application);
        match &mut self.tree.node_mut(clip).payload {
            Payload::Clip(content) => Ok(content),
            _ => Err(ValidationError::Unsupported {
                kind,
                operation: "notes",
            }
            .into()),
        }
    }

    /// Put a new clip in `slot`, replacing any clip already there. A slot
    /// that is playing carries on with the new clip.
    pub fn add_clip(&mut self, slot: NodeId, duration: f64, is_looping: bool, notes: &[Note]) -> Result<NodeId> {
        let slot = self.require(slot, "clips", is_slot)?;
        let content = Clip::with_notes(duration, is_looping, notes)?;
        self.grouped(|app| {
            if let Some(previous) = app.clip(slot) {
                let uuid = app.tree.uuid(previous);
                app.tree.detach(previous)?;
                app.emit(Event::EntityRemoved {
                    uuid,
                    kind: trellis_types::EntityKind::Clip,
                });
            }
            let clip = app.tree.create(Payload::Clip(content), None);
            app.tree.insert(slot, clip, None)?;
            for playing in app.playback.tracks.values_mut() {
                if playing.slot == slot {
                    playing.clip = clip;
                }
            }
            app.release_orphans(clip);
            app.reschedule_clip(clip);
            app.announce(clip);
            let uuid = app.tree.uuid(clip);
            app.emit(Event::ClipModified { clip: uuid });
            Ok(clip)
        })
    }

    pub fn remove_clip(&mut self, slot: NodeId) -> Result<()> {
        let slot = self.require(slot, "clips", is_slot)?;
        let Some(clip) = self.clip(slot) else {
            return Ok(());
        };
        self.grouped(|app| {
            app.stop_slot(slot)?;
            let uuid = app.tree.uuid(clip);
            app.tree.detach(clip)?;
            app.emit(Event::EntityRemoved {
                uuid,
                kind: trellis_types::EntityKind::Clip,
            });
            Ok(())
        })
    }

    /// Move the clip in `from` to `to`, replacing whatever `to` held.
    pub fn move_clip(&mut self, from: NodeId, to: NodeId) -> Result<()> {
        let from = self.require(from, "clips", is_slot)?;
        let to = self.require(to, "clips", is_slot)?;
        if from == to {
            return Ok(());
        }
        let Some(clip) = self.clip(from) else {
            return Ok(());
        };
        self.grouped(|app| {
            app.stop_slot(from)?;
            if let Some(existing) = app.clip(to) {
                app.stop_slot(to)?;
                let uuid = app.tree.uuid(existing);
                app.tree.detach(existing)?;
                app.emit(Event::EntityRemoved {
                    uuid,
                    kind: trellis_types::EntityKind::Clip,
                });
            }
            app.tree.detach(clip)?;
            app.tree.insert(to, clip, None)?;
            let uuid = app.tree.uuid(clip);
            app.emit(Event::ClipModified { clip: uuid });
            Ok(())
        })
    }

    /// Edit a clip's contents, then tell subscribers and replay it if playing.
    fn modify_clip<T>(&mut self, clip: NodeId, edit: impl FnOnce(&mut Clip) -> Result<T>) -> Result<T> {
        let clip = self.require(clip, "notes", is_clip)?;
        self.grouped(|app| {
            let value = edit(app.clip_mut(clip)?)?;
            let uuid = app.tree.uuid(clip);
            app.emit(Event::ClipModified { clip: uuid });
            app.release_orphans(clip);
            app.reschedule_clip(clip);
            Ok(value)
        })
    }

    pub fn add_notes(&mut self, clip: NodeId, notes: &[Note]) -> Result<()> {
        Clip::validate(notes)?;
        self.modify_clip(clip, |content| content.add_notes(notes))
    }

    /// Remove notes matching exactly. Returns how many were removed.
    pub fn remove_notes(&mut self, clip: NodeId, notes: &[Note]) -> Result<usize> {
        self.modify_clip(clip, |content| Ok(content.remove_notes(notes)))
    }

    pub fn set_clip_duration(&mut self, clip: NodeId, duration: f64) -> Result<()> {
        self.modify_clip(clip, |content| content.set_duration(duration))
    }

    pub fn set_clip_looping(&mut self, clip: NodeId, is_looping: bool) -> Result<()> {
        self.modify_clip(clip, |content| {
            content.set_looping(is_looping);
            Ok(())
        })
    }

    // ─── Performance ────────────────────────────────────────────────

    /// Deliver MIDI to a track as if a clip had played it.
    pub fn perform(&mut self, track: NodeId, messages: &[MidiMessage]) -> Result<()> {
        let track = self.require(track, "performance", Payload::is_track_like)?;
        self.grouped(|app| {
            let now = app.transport.offset();
            app.perform_at(track, now, messages.to_vec());
            Ok(())
        })
    }

    fn perform_at(&mut self, track: NodeId, offset: f64, messages: Vec<MidiMessage>) {
        if messages.is_empty() {
            return;
        }
        self.perform_devices(track, &messages);
        let uuid = self.tree.uuid(track);
        self.emit(Event::TrackPerformed {
            track: uuid,
            offset,
            messages,
        });
    }

    /// Pass MIDI down a device chain until an instrument consumes it.
    fn perform_devices(&mut self, owner: NodeId, messages: &[MidiMessage]) {
        for device in self.devices(owner) {
            match self.tree.payload(device).clone() {
                Payload::Device(DeviceBody {
                    role: DeviceRole::Instrument,
                    synthdef,
                }) => {
                    self.play_voices(device, &synthdef, messages);
                    return;
                }
                Payload::Rack => {
                    for chain in self.chains(device) {
                        self.perform_devices(chain, messages);
                    }
                    return;
                }
                _ => {}
            }
        }
    }

    fn play_voices(&mut self, device: NodeId, synthdef: &str, messages: &[MidiMessage]) {
        let Some(context) = self.tree.context_of(device) else {
            return;
        };
        let parameters = parameter_values(&self.tree, device);
        let Some(provider) = self.providers.get_mut(&context) else {
            return;
        };
        let Some(bus) = provider.state().bus(device, BusRole::Main) else {
            return;
        };
        for message in messages {
            match *message {
                MidiMessage::NoteOn { pitch, velocity } => {
                    let mut spec = SynthSpec::new(synthdef)
                        .control("out", bus.index as f32)
                        .control("pitch", pitch as f32)
                        .control("velocity", velocity)
                        .control("gate", 1.0);
                    spec.controls.extend(parameters.iter().cloned());
                    provider.start_voice(device, pitch, spec);
                }
                MidiMessage::NoteOff { pitch } => {
                    provider.stop_voice(device, pitch);
                }
            }
        }
    }
}

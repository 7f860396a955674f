use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// A note interval. Offsets are measured in whole notes from the clip start.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub start_offset: f64,
    pub stop_offset: f64,
    pub pitch: u8,
    pub velocity: f32,
}

impl Note {
    pub fn new(start_offset: f64, stop_offset: f64, pitch: u8, velocity: f32) -> Self {
        Self {
            start_offset,
            stop_offset,
            pitch,
            velocity,
        }
    }

    /// A note is well-formed only when it starts strictly before it stops.
    pub fn is_valid(&self) -> bool {
        self.start_offset < self.stop_offset
    }

    pub fn duration(&self) -> f64 {
        self.stop_offset - self.start_offset
    }

    pub fn with_stop(self, stop_offset: f64) -> Self {
        Self { stop_offset, ..self }
    }

    /// Total order: start, stop, pitch, velocity.
    pub fn total_cmp(&self, other: &Note) -> Ordering {
        self.start_offset
            .total_cmp(&other.start_offset)
            .then(self.stop_offset.total_cmp(&other.stop_offset))
            .then(self.pitch.cmp(&other.pitch))
            .then(self.velocity.total_cmp(&other.velocity))
    }
}

/// The answer to "what happens at this offset" for a clip.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NoteMoment {
    /// Offset the query was made at, in transport time.
    pub offset: f64,
    /// The offset folded into the clip's own timeline.
    pub local_offset: f64,
    /// Transport offset at which the answer next changes, if ever.
    pub next_offset: Option<f64>,
    pub start_notes: Vec<Note>,
    pub stop_notes: Vec<Note>,
    pub overlap_notes: Vec<Note>,
}

impl NoteMoment {
    pub fn note_on_messages(&self) -> Vec<MidiMessage> {
        self.start_notes
            .iter()
            .map(|note| MidiMessage::NoteOn {
                pitch: note.pitch,
                velocity: note.velocity,
            })
            .collect()
    }

    pub fn note_off_messages(&self) -> Vec<MidiMessage> {
        self.stop_notes
            .iter()
            .map(|note| MidiMessage::NoteOff { pitch: note.pitch })
            .collect()
    }

    /// Note-offs first so a re-struck pitch is released before it sounds again.
    pub fn messages(&self) -> Vec<MidiMessage> {
        let mut messages = self.note_off_messages();
        messages.extend(self.note_on_messages());
        messages
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum MidiMessage {
    NoteOn { pitch: u8, velocity: f32 },
    NoteOff { pitch: u8 },
}

impl MidiMessage {
    pub fn pitch(&self) -> u8 {
        match *self {
            MidiMessage::NoteOn { pitch, .. } | MidiMessage::NoteOff { pitch } => pitch,
        }
    }

    pub fn is_note_on(&self) -> bool {
        matches!(self, MidiMessage::NoteOn { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_length_note_is_invalid() {
        assert!(!Note::new(1.0, 1.0, 60, 100.0).is_valid());
        assert!(!Note::new(2.0, 1.0, 60, 100.0).is_valid());
        assert!(Note::new(0.0, 0.25, 60, 100.0).is_valid());
    }

    #[test]
    fn moment_messages_put_offs_first() {
        let moment = NoteMoment {
            start_notes: vec![Note::new(1.0, 2.0, 64, 90.0)],
            stop_notes: vec![Note::new(0.0, 1.0, 60, 100.0)],
            ..Default::default()
        };
        assert_eq!(
            moment.messages(),
            vec![
                MidiMessage::NoteOff { pitch: 60 },
                MidiMessage::NoteOn { pitch: 64, velocity: 90.0 },
            ]
        );
    }

    #[test]
    fn ordering_is_by_start_then_stop() {
        let mut notes = vec![
            Note::new(0.5, 1.0, 60, 100.0),
            Note::new(0.0, 2.0, 60, 100.0),
            Note::new(0.0, 1.0, 62, 100.0),
        ];
        notes.sort_by(Note::total_cmp);
        assert_eq!(notes[0], Note::new(0.0, 1.0, 62, 100.0));
        assert_eq!(notes[2], Note::new(0.5, 1.0, 60, 100.0));
    }
}

//! Note storage and point queries for clip playback.
//!
//! Notes are kept per pitch, sorted and non-overlapping. Inserting resolves
//! conflicts with what is already there so the per-pitch lists never hold
//! two sounding notes at once.

use std::collections::BTreeMap;

use trellis_types::{Note, NoteMoment};

use crate::error::{Result, ValidationError};

/// Highest valid MIDI pitch.
pub const MAX_PITCH: u8 = 127;

#[derive(Debug, Clone, PartialEq)]
pub struct Clip {
    duration: f64,
    is_looping: bool,
    notes: BTreeMap<u8, Vec<Note>>,
}

impl Default for Clip {
    /// One looping whole note.
    fn default() -> Self {
        Self {
            duration: 1.0,
            is_looping: true,
            notes: BTreeMap::new(),
        }
    }
}

impl Clip {
    pub fn new(duration: f64, is_looping: bool) -> Result<Self> {
        validate_duration(duration)?;
        Ok(Self {
            duration,
            is_looping,
            notes: BTreeMap::new(),
        })
    }

    pub fn with_notes(duration: f64, is_looping: bool, notes: &[Note]) -> Result<Self> {
        let mut clip = Self::new(duration, is_looping)?;
        clip.add_notes(notes)?;
        Ok(clip)
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn set_duration(&mut self, duration: f64) -> Result<()> {
        validate_duration(duration)?;
        self.duration = duration;
        Ok(())
    }

    pub fn is_looping(&self) -> bool {
        self.is_looping
    }

    pub fn set_looping(&mut self, is_looping: bool) {
        self.is_looping = is_looping;
    }

    /// All notes, sorted by start, stop, pitch, velocity.
    pub fn notes(&self) -> Vec<Note> {
        let mut notes: Vec<Note> = self.notes.values().flatten().copied().collect();
        notes.sort_by(Note::total_cmp);
        notes
    }

    pub fn note_count(&self) -> usize {
        self.notes.values().map(Vec::len).sum()
    }

    /// Offset at which playback stops (or wraps, when looping).
    pub fn clip_stop(&self) -> f64 {
        if self.is_looping {
            return self.duration;
        }
        self.notes
            .values()
            .flatten()
            .map(|note| note.stop_offset)
            .fold(self.duration, f64::max)
    }

    /// Check notes without touching the clip.
    pub fn validate(notes: &[Note]) -> Result<()> {
        for note in notes {
            if !note.is_valid() {
                return Err(ValidationError::ZeroLengthNote {
                    start: note.start_offset,
                    stop: note.stop_offset,
                }
                .into());
            }
            if note.pitch > MAX_PITCH {
                return Err(ValidationError::InvalidPitch(note.pitch).into());
            }
        }
        Ok(())
    }

    /// Insert notes, merging and truncating against each other and against
    /// existing notes of the same pitch.
    pub fn add_notes(&mut self, notes: &[Note]) -> Result<()> {
        Self::validate(notes)?;
        let mut by_pitch: BTreeMap<u8, Vec<Note>> = BTreeMap::new();
        for note in notes {
            by_pitch.entry(note.pitch).or_default().push(*note);
        }
        for (pitch, mut incoming) in by_pitch {
            incoming.sort_by(Note::total_cmp);
            let merged = merge_incoming(incoming);
            let existing = self.notes.remove(&pitch).unwrap_or_default();
            let mut kept = resolve_existing(&merged, existing);
            kept.extend(merged);
            kept.sort_by(Note::total_cmp);
            self.notes.insert(pitch, kept);
        }
        Ok(())
    }

    /// Remove exact matches; returns how many were removed.
    pub fn remove_notes(&mut self, notes: &[Note]) -> usize {
        let mut removed = 0;
        for note in notes {
            if let Some(list) = self.notes.get_mut(&note.pitch) {
                if let Some(index) = list.iter().position(|n| n == note) {
                    list.remove(index);
                    removed += 1;
                }
                if list.is_empty() {
                    self.notes.remove(&note.pitch);
                }
            }
        }
        removed
    }

    /// What happens at `offset` for a clip launched at `start_delta`.
    ///
    /// Looping clips fold the offset into `[0, duration)`. With `force_stop`
    /// nothing starts, everything sounding stops, and no next offset is given.
    pub fn at(&self, offset: f64, start_delta: f64, force_stop: bool) -> NoteMoment {
        let mut local_offset = offset - start_delta;
        let mut count = 0.0;
        if self.is_looping && local_offset >= 0.0 {
            let stop = self.clip_stop();
            count = (local_offset / stop).floor();
            local_offset -= count * stop;
        }

        let (mut start_notes, mut stop_notes, mut overlap_notes) = self.moment_at(local_offset);
        if count > 0.0 && local_offset == 0.0 {
            let (_, stops, overlaps) = self.moment_at(self.duration);
            stop_notes.extend(overlaps);
            stop_notes.extend(stops);
        }

        let mut next_offset = self.offset_after(local_offset);
        if next_offset.is_none() && self.is_looping {
            next_offset = Some(self.duration);
        }
        let mut next_offset = next_offset.map(|next| {
            let next = if self.is_looping { next.min(self.duration) } else { next };
            next + start_delta + count * self.duration
        });

        if force_stop {
            start_notes.clear();
            stop_notes.append(&mut overlap_notes);
            next_offset = None;
        }
        stop_notes.sort_by(Note::total_cmp);

        NoteMoment {
            offset,
            local_offset,
            next_offset,
            start_notes,
            stop_notes,
            overlap_notes,
        }
    }

    /// Notes starting at, stopping at, and sounding through `offset`.
    fn moment_at(&self, offset: f64) -> (Vec<Note>, Vec<Note>, Vec<Note>) {
        let mut starts = Vec::new();
        let mut stops = Vec::new();
        let mut overlaps = Vec::new();
        for note in self.notes.values().flatten() {
            if note.start_offset == offset {
                starts.push(*note);
            } else if note.stop_offset == offset {
                stops.push(*note);
            } else if note.start_offset < offset && offset < note.stop_offset {
                overlaps.push(*note);
            }
        }
        starts.sort_by(Note::total_cmp);
        stops.sort_by(Note::total_cmp);
        overlaps.sort_by(Note::total_cmp);
        (starts, stops, overlaps)
    }

    /// Smallest note boundary strictly after `offset`.
    fn offset_after(&self, offset: f64) -> Option<f64> {
        self.notes
            .values()
            .flatten()
            .flat_map(|note| [note.start_offset, note.stop_offset])
            .filter(|boundary| *boundary > offset)
            .min_by(f64::total_cmp)
    }
}

fn validate_duration(duration: f64) -> Result<()> {
    if duration > 0.0 && duration.is_finite() {
        Ok(())
    } else {
        Err(ValidationError::InvalidDuration(duration).into())
    }
}

/// Resolve conflicts within one pitch's sorted batch: equal starts merge
/// (longest stop, loudest velocity), a later start cuts the earlier note.
fn merge_incoming(incoming: Vec<Note>) -> Vec<Note> {
    let mut merged: Vec<Note> = Vec::with_capacity(incoming.len());
    for current in incoming {
        if let Some(previous) = merged.last_mut() {
            if current.start_offset < previous.stop_offset {
                if current.start_offset == previous.start_offset {
                    previous.stop_offset = previous.stop_offset.max(current.stop_offset);
                    previous.velocity = previous.velocity.max(current.velocity);
                    continue;
                }
                previous.stop_offset = current.start_offset;
            }
        }
        merged.push(current);
    }
    merged
}

/// Drop existing notes that start inside a new note and truncate those a
/// new note starts inside of.
fn resolve_existing(incoming: &[Note], existing: Vec<Note>) -> Vec<Note> {
    let mut kept = Vec::with_capacity(existing.len());
    let mut cursor = incoming.iter().peekable();
    for old in existing {
        while cursor
            .peek()
            .is_some_and(|new| new.stop_offset <= old.start_offset)
        {
            cursor.next();
        }
        let Some(new) = cursor.peek() else {
            kept.push(old);
            continue;
        };
        if new.start_offset <= old.start_offset && old.start_offset < new.stop_offset {
            continue;
        }
        if old.start_offset < new.start_offset && new.start_offset < old.stop_offset {
            kept.push(old.with_stop(new.start_offset));
            continue;
        }
        kept.push(old);
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(start: f64, stop: f64, pitch: u8) -> Note {
        Note::new(start, stop, pitch, 100.0)
    }

    #[test]
    fn same_start_merges_to_longest() {
        let mut clip = Clip::default();
        clip.add_notes(&[note(0.0, 1.0, 60), note(0.0, 2.0, 60)]).unwrap();
        assert_eq!(clip.notes(), vec![note(0.0, 2.0, 60)]);
    }

    #[test]
    fn same_start_keeps_louder_velocity() {
        let mut clip = Clip::default();
        clip.add_notes(&[
            Note::new(0.0, 2.0, 60, 40.0),
            Note::new(0.0, 1.0, 60, 90.0),
        ])
        .unwrap();
        assert_eq!(clip.notes(), vec![Note::new(0.0, 2.0, 60, 90.0)]);
    }

    #[test]
    fn later_note_truncates_earlier_in_one_batch() {
        let mut clip = Clip::default();
        clip.add_notes(&[note(0.0, 1.0, 60), note(0.5, 1.5, 60)]).unwrap();
        assert_eq!(clip.notes(), vec![note(0.0, 0.5, 60), note(0.5, 1.5, 60)]);
    }

    #[test]
    fn later_note_truncates_existing_note() {
        let mut clip = Clip::default();
        clip.add_notes(&[note(0.0, 1.0, 60)]).unwrap();
        clip.add_notes(&[note(0.5, 1.5, 60)]).unwrap();
        assert_eq!(clip.notes(), vec![note(0.0, 0.5, 60), note(0.5, 1.5, 60)]);
    }

    #[test]
    fn existing_note_starting_inside_new_note_is_replaced() {
        let mut clip = Clip::default();
        clip.add_notes(&[note(0.5, 0.75, 60)]).unwrap();
        clip.add_notes(&[note(0.25, 1.0, 60)]).unwrap();
        assert_eq!(clip.notes(), vec![note(0.25, 1.0, 60)]);
    }

    #[test]
    fn pitches_do_not_interact() {
        let mut clip = Clip::default();
        clip.add_notes(&[note(0.0, 1.0, 60), note(0.5, 1.5, 64)]).unwrap();
        assert_eq!(clip.notes(), vec![note(0.0, 1.0, 60), note(0.5, 1.5, 64)]);
    }

    #[test]
    fn invalid_notes_leave_clip_untouched() {
        let mut clip = Clip::default();
        clip.add_notes(&[note(0.0, 1.0, 60)]).unwrap();
        assert!(clip.add_notes(&[note(0.5, 0.5, 61)]).is_err());
        assert!(clip.add_notes(&[note(0.0, 0.5, 128)]).is_err());
        assert_eq!(clip.note_count(), 1);
    }

    #[test]
    fn remove_exact_notes() {
        let mut clip = Clip::default();
        clip.add_notes(&[note(0.0, 0.5, 60), note(0.5, 1.0, 60)]).unwrap();
        assert_eq!(clip.remove_notes(&[note(0.0, 0.5, 60), note(0.0, 0.25, 60)]), 1);
        assert_eq!(clip.notes(), vec![note(0.5, 1.0, 60)]);
    }

    #[test]
    fn at_reports_starts_and_next_offset() {
        let clip = Clip::with_notes(1.0, true, &[note(0.0, 0.25, 60), note(0.5, 0.75, 62)]).unwrap();
        let moment = clip.at(0.0, 0.0, false);
        assert_eq!(moment.start_notes, vec![note(0.0, 0.25, 60)]);
        assert!(moment.stop_notes.is_empty());
        assert_eq!(moment.next_offset, Some(0.25));

        let moment = clip.at(0.6, 0.0, false);
        assert_eq!(moment.overlap_notes, vec![note(0.5, 0.75, 62)]);
        assert_eq!(moment.next_offset, Some(0.75));
    }

    #[test]
    fn looping_folds_offset_and_stops_at_boundary() {
        let clip = Clip::with_notes(1.0, true, &[note(0.0, 1.0, 60)]).unwrap();
        let moment = clip.at(2.0, 0.0, false);
        assert_eq!(moment.local_offset, 0.0);
        assert_eq!(moment.start_notes, vec![note(0.0, 1.0, 60)]);
        assert_eq!(moment.stop_notes, vec![note(0.0, 1.0, 60)]);
        assert_eq!(moment.next_offset, Some(3.0));
    }

    #[test]
    fn start_delta_shifts_next_offset() {
        let clip = Clip::with_notes(1.0, true, &[note(0.25, 0.5, 60)]).unwrap();
        let moment = clip.at(3.0, 3.0, false);
        assert!(moment.start_notes.is_empty());
        assert_eq!(moment.next_offset, Some(3.25));
    }

    #[test]
    fn empty_looping_clip_wakes_at_duration() {
        let clip = Clip::new(2.0, true).unwrap();
        assert_eq!(clip.at(0.0, 0.0, false).next_offset, Some(2.0));
        let clip = Clip::new(2.0, false).unwrap();
        assert_eq!(clip.at(0.0, 0.0, false).next_offset, None);
    }

    #[test]
    fn force_stop_turns_sounding_notes_into_stops() {
        let clip = Clip::with_notes(1.0, true, &[note(0.0, 0.5, 60), note(0.25, 0.5, 64)]).unwrap();
        let moment = clip.at(0.25, 0.0, true);
        assert!(moment.start_notes.is_empty());
        assert!(moment.overlap_notes.is_empty());
        assert_eq!(moment.stop_notes, vec![note(0.0, 0.5, 60)]);
        assert_eq!(moment.next_offset, None);
    }

    #[test]
    fn invalid_duration_is_rejected() {
        assert!(Clip::new(0.0, true).is_err());
        assert!(Clip::new(f64::NAN, true).is_err());
        let mut clip = Clip::default();
        assert!(clip.set_duration(-1.0).is_err());
        assert_eq!(clip.duration(), 1.0);
    }
}

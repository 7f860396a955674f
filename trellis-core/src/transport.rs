//! Musical transport: tempo, meter, looping and the scheduling clock.
//!
//! Time is measured in whole notes. The clock does not run on its own; the
//! application advances it to a target offset and handles every event that
//! falls due on the way, in time order.

use std::collections::BTreeMap;

use trellis_types::Moment;

use crate::error::{Result, ValidationError};
use crate::tree::NodeId;

/// Handle to a scheduled clock event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockEvent {
    /// Transport tick, published to subscribers.
    Tick,
    /// Next change in the clip playing on a track.
    ClipPerform(NodeId),
}

/// Scheduling primitive the transport drives playback with.
pub trait Clock: Send {
    fn schedule(&mut self, event: ClockEvent, at: f64) -> EventId;
    /// Move a scheduled event. Returns `false` if it is no longer scheduled.
    fn reschedule(&mut self, id: EventId, at: f64) -> bool;
    fn cancel(&mut self, id: EventId) -> Option<ClockEvent>;
    fn start(&mut self);
    /// Stop and drop everything scheduled.
    fn stop(&mut self);
    fn is_running(&self) -> bool;
    fn offset(&self) -> f64;
    /// Take the earliest event due at or before `until`, moving the clock to
    /// its time. Events at equal times come out in scheduling order.
    fn pop_due(&mut self, until: f64) -> Option<(EventId, ClockEvent, f64)>;
    /// Move the clock to `offset` without firing anything.
    fn seek(&mut self, offset: f64);
}

/// Deterministic clock advanced explicitly.
#[derive(Debug, Clone, Default)]
pub struct TransportClock {
    offset: f64,
    running: bool,
    next_id: u64,
    events: BTreeMap<EventId, (f64, ClockEvent)>,
}

impl TransportClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scheduled(&self) -> usize {
        self.events.len()
    }

    /// When an event is due, if it is scheduled.
    pub fn due_at(&self, id: EventId) -> Option<f64> {
        self.events.get(&id).map(|(at, _)| *at)
    }
}

impl Clock for TransportClock {
    fn schedule(&mut self, event: ClockEvent, at: f64) -> EventId {
        let id = EventId(self.next_id);
        self.next_id += 1;
        self.events.insert(id, (at, event));
        id
    }

    fn reschedule(&mut self, id: EventId, at: f64) -> bool {
        match self.events.get_mut(&id) {
            Some(entry) => {
                entry.0 = at;
                true
            }
            None => false,
        }
    }

    fn cancel(&mut self, id: EventId) -> Option<ClockEvent> {
        self.events.remove(&id).map(|(_, event)| event)
    }

    fn start(&mut self) {
        self.running = true;
    }

    fn stop(&mut self) {
        self.running = false;
        self.events.clear();
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn offset(&self) -> f64 {
        self.offset
    }

    fn pop_due(&mut self, until: f64) -> Option<(EventId, ClockEvent, f64)> {
        if !self.running {
            return None;
        }
        let (id, at) = self
            .events
            .iter()
            .filter(|(_, (at, _))| *at <= until)
            .min_by(|a, b| a.1 .0.total_cmp(&b.1 .0).then(a.0.cmp(b.0)))
            .map(|(id, (at, _))| (*id, *at))?;
        let (_, event) = self.events.remove(&id)?;
        self.offset = self.offset.max(at);
        Some((id, event, at))
    }

    fn seek(&mut self, offset: f64) {
        self.offset = offset;
    }
}

#[derive(Debug, Clone)]
pub struct Transport {
    tempo: f64,
    time_signature: (u32, u32),
    is_looping: bool,
    loop_points: (f64, f64),
    clock: TransportClock,
    tick: Option<EventId>,
}

impl Transport {
    pub fn new(tempo: f64, time_signature: (u32, u32)) -> Self {
        Self {
            tempo,
            time_signature,
            is_looping: false,
            loop_points: (0.0, 1.0),
            clock: TransportClock::new(),
            tick: None,
        }
    }

    pub fn tempo(&self) -> f64 {
        self.tempo
    }

    pub fn set_tempo(&mut self, tempo: f64) -> Result<()> {
        if !(tempo > 0.0 && tempo.is_finite()) {
            return Err(ValidationError::InvalidTempo(tempo).into());
        }
        self.tempo = tempo;
        Ok(())
    }

    pub fn time_signature(&self) -> (u32, u32) {
        self.time_signature
    }

    pub fn set_time_signature(&mut self, numerator: u32, denominator: u32) -> Result<()> {
        if numerator < 1 || denominator < 1 {
            return Err(ValidationError::InvalidTimeSignature(numerator, denominator).into());
        }
        self.time_signature = (numerator, denominator);
        Ok(())
    }

    pub fn is_looping(&self) -> bool {
        self.is_looping
    }

    pub fn set_looping(&mut self, looping: bool) {
        self.is_looping = looping;
    }

    pub fn loop_points(&self) -> (f64, f64) {
        self.loop_points
    }

    pub fn set_loop_points(&mut self, start: f64, stop: f64) -> Result<()> {
        if !(start >= 0.0 && start < stop && stop.is_finite()) {
            return Err(ValidationError::InvalidLoopPoints { start, stop }.into());
        }
        self.loop_points = (start, stop);
        Ok(())
    }

    /// Distance between ticks: a sixteenth of the meter's beat.
    pub fn tick_interval(&self) -> f64 {
        1.0 / self.time_signature.1 as f64 / 4.0
    }

    pub fn is_running(&self) -> bool {
        self.clock.is_running()
    }

    pub fn offset(&self) -> f64 {
        self.clock.offset()
    }

    pub fn moment(&self) -> Moment {
        self.moment_at(self.clock.offset())
    }

    pub fn moment_at(&self, offset: f64) -> Moment {
        Moment::at(offset, self.tempo, self.time_signature)
    }

    /// Seconds from the transport origin to `offset` at the current tempo.
    pub fn seconds_at(&self, offset: f64) -> f64 {
        offset * 4.0 * 60.0 / self.tempo
    }

    /// Start the clock with a tick at the current offset. Returns `false` if
    /// it was already running.
    pub fn start(&mut self) -> bool {
        if self.clock.is_running() {
            return false;
        }
        self.clock.start();
        let now = self.clock.offset();
        self.tick = Some(self.clock.schedule(ClockEvent::Tick, now));
        log::debug!(target: "transport", "started at {}", now);
        true
    }

    /// Stop the clock, dropping every scheduled event. Returns `false` if it
    /// was not running.
    pub fn stop(&mut self) -> bool {
        if !self.clock.is_running() {
            return false;
        }
        self.clock.stop();
        self.tick = None;
        log::debug!(target: "transport", "stopped at {}", self.clock.offset());
        true
    }

    /// Re-arm the tick after it fired at `at`.
    pub(crate) fn rearm_tick(&mut self, at: f64) {
        let next = at + self.tick_interval();
        self.tick = Some(self.clock.schedule(ClockEvent::Tick, next));
    }

    pub fn clock(&self) -> &TransportClock {
        &self.clock
    }

    pub fn clock_mut(&mut self) -> &mut TransportClock {
        &mut self.clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_fire_in_time_then_schedule_order() {
        let mut clock = TransportClock::new();
        clock.start();
        let late = clock.schedule(ClockEvent::Tick, 1.0);
        let first = clock.schedule(ClockEvent::ClipPerform(NodeId(3)), 0.5);
        let second = clock.schedule(ClockEvent::ClipPerform(NodeId(4)), 0.5);
        assert_eq!(clock.pop_due(2.0).map(|e| e.0), Some(first));
        assert_eq!(clock.pop_due(2.0).map(|e| e.0), Some(second));
        assert_eq!(clock.offset(), 0.5);
        assert_eq!(clock.pop_due(0.75), None);
        assert_eq!(clock.pop_due(2.0).map(|e| e.0), Some(late));
    }

    #[test]
    fn reschedule_moves_without_duplicating() {
        let mut clock = TransportClock::new();
        clock.start();
        let id = clock.schedule(ClockEvent::Tick, 1.0);
        assert!(clock.reschedule(id, 0.25));
        assert_eq!(clock.scheduled(), 1);
        assert_eq!(clock.due_at(id), Some(0.25));
        clock.cancel(id);
        assert!(!clock.reschedule(id, 0.5));
    }

    #[test]
    fn stopped_clock_fires_nothing() {
        let mut clock = TransportClock::new();
        clock.schedule(ClockEvent::Tick, 0.0);
        assert!(clock.pop_due(1.0).is_none());
    }

    #[test]
    fn validation() {
        let mut transport = Transport::new(120.0, (4, 4));
        assert!(transport.set_tempo(0.0).is_err());
        assert!(transport.set_tempo(-10.0).is_err());
        assert!(transport.set_time_signature(0, 4).is_err());
        assert!(transport.set_loop_points(1.0, 1.0).is_err());
        assert!(transport.set_loop_points(-1.0, 1.0).is_err());
        assert!(transport.set_loop_points(0.5, 2.0).is_ok());
        assert_eq!(transport.tempo(), 120.0);
        assert_eq!(transport.loop_points(), (0.5, 2.0));
    }

    #[test]
    fn tick_interval_follows_denominator() {
        let mut transport = Transport::new(120.0, (4, 4));
        assert_eq!(transport.tick_interval(), 1.0 / 16.0);
        transport.set_time_signature(6, 8).unwrap();
        assert_eq!(transport.tick_interval(), 1.0 / 32.0);
    }

    #[test]
    fn start_schedules_a_tick() {
        let mut transport = Transport::new(120.0, (4, 4));
        assert!(transport.start());
        assert!(!transport.start());
        assert_eq!(transport.clock().scheduled(), 1);
        assert!(transport.stop());
        assert_eq!(transport.clock().scheduled(), 0);
    }
}

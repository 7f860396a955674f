//! Notifications published by the application to its subscribers.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::EntityKind;
use crate::note::MidiMessage;
use crate::status::BackendStatus;

/// Musical position of the transport, handed to every scheduled callback.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Moment {
    /// Elapsed time in whole notes since the transport origin.
    pub offset: f64,
    pub seconds: f64,
    /// 1-based measure number.
    pub measure: u32,
    /// Whole notes elapsed since the start of the current measure.
    pub measure_offset: f64,
    pub tempo: f64,
    pub time_signature: (u32, u32),
}

impl Moment {
    /// Compute the musical position for an offset under a fixed tempo and meter.
    pub fn at(offset: f64, tempo: f64, time_signature: (u32, u32)) -> Self {
        let (numerator, denominator) = time_signature;
        let measure_length = numerator as f64 / denominator.max(1) as f64;
        let completed = if measure_length > 0.0 {
            (offset / measure_length).floor().max(0.0)
        } else {
            0.0
        };
        Self {
            offset,
            seconds: offset * 4.0 * 60.0 / tempo,
            measure: completed as u32 + 1,
            measure_offset: offset - completed * measure_length,
            tempo,
            time_signature,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Booting,
    Booted,
    Quitting,
    Quit,
    StatusRefreshed {
        context: Uuid,
        status: BackendStatus,
    },
    EntityAdded {
        uuid: Uuid,
        kind: EntityKind,
    },
    EntityRemoved {
        uuid: Uuid,
        kind: EntityKind,
    },
    ChannelCountChanged {
        uuid: Uuid,
        channel_count: u8,
    },
    MixerChanged {
        uuid: Uuid,
        muted: bool,
        soloed: bool,
        cued: bool,
    },
    TempoChanged {
        tempo: f64,
    },
    TimeSignatureChanged {
        time_signature: (u32, u32),
    },
    LoopingChanged {
        looping: bool,
    },
    LoopPointsChanged {
        start: f64,
        stop: f64,
    },
    TransportStarted,
    TransportStopped,
    TransportTicked(Moment),
    ClipModified {
        clip: Uuid,
    },
    ClipLaunched {
        clip: Uuid,
    },
    SlotFired {
        slot: Uuid,
    },
    TrackPerformed {
        track: Uuid,
        offset: f64,
        messages: Vec<MidiMessage>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moment_in_four_four() {
        let moment = Moment::at(1.25, 120.0, (4, 4));
        assert_eq!(moment.measure, 2);
        assert!((moment.measure_offset - 0.25).abs() < 1e-9);
        assert!((moment.seconds - 2.5).abs() < 1e-9);
    }

    #[test]
    fn moment_in_three_four() {
        let moment = Moment::at(1.5, 60.0, (3, 4));
        assert_eq!(moment.measure, 3);
        assert!(moment.measure_offset.abs() < 1e-9);
        assert!((moment.seconds - 6.0).abs() < 1e-9);
    }
}

use std::fmt;

use serde::{Deserialize, Serialize};

/// Tag naming the type of a persisted entity.
///
/// Containers are structural only and never persisted, so they have no kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Application,
    Controller,
    Scene,
    Context,
    Track,
    MasterTrack,
    CueTrack,
    Chain,
    EffectDevice,
    InstrumentDevice,
    RackDevice,
    Send,
    Receive,
    Parameter,
    Slot,
    Clip,
}

impl EntityKind {
    pub const ALL: [EntityKind; 16] = [
        EntityKind::Application,
        EntityKind::Controller,
        EntityKind::Scene,
        EntityKind::Context,
        EntityKind::Track,
        EntityKind::MasterTrack,
        EntityKind::CueTrack,
        EntityKind::Chain,
        EntityKind::EffectDevice,
        EntityKind::InstrumentDevice,
        EntityKind::RackDevice,
        EntityKind::Send,
        EntityKind::Receive,
        EntityKind::Parameter,
        EntityKind::Slot,
        EntityKind::Clip,
    ];

    /// Track-like kinds own a bus, a device chain and fader sends.
    pub fn is_track_like(self) -> bool {
        matches!(
            self,
            EntityKind::Track | EntityKind::MasterTrack | EntityKind::CueTrack | EntityKind::Chain
        )
    }

    pub fn is_device(self) -> bool {
        matches!(
            self,
            EntityKind::EffectDevice | EntityKind::InstrumentDevice | EntityKind::RackDevice
        )
    }

    /// Kinds that may be the destination of a send.
    pub fn is_routable(self) -> bool {
        self.is_track_like() || self.is_device()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Application => "Application",
            EntityKind::Controller => "Controller",
            EntityKind::Scene => "Scene",
            EntityKind::Context => "Context",
            EntityKind::Track => "Track",
            EntityKind::MasterTrack => "MasterTrack",
            EntityKind::CueTrack => "CueTrack",
            EntityKind::Chain => "Chain",
            EntityKind::EffectDevice => "EffectDevice",
            EntityKind::InstrumentDevice => "InstrumentDevice",
            EntityKind::RackDevice => "RackDevice",
            EntityKind::Send => "Send",
            EntityKind::Receive => "Receive",
            EntityKind::Parameter => "Parameter",
            EntityKind::Slot => "Slot",
            EntityKind::Clip => "Clip",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tap point of a send on its owning track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaderPoint {
    PreFader,
    #[default]
    PostFader,
}

impl FaderPoint {
    pub fn is_post_fader(&self) -> bool {
        *self == FaderPoint::PostFader
    }
}

/// What a non-rack device does with the signal and MIDI passing through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceRole {
    /// Processes audio in place; passes MIDI through.
    Effect,
    /// Consumes MIDI and produces audio voices.
    Instrument,
}

impl DeviceRole {
    pub fn kind(self) -> EntityKind {
        match self {
            DeviceRole::Effect => EntityKind::EffectDevice,
            DeviceRole::Instrument => EntityKind::InstrumentDevice,
        }
    }
}

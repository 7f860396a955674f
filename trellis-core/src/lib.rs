//! # trellis-core
//!
//! Object tree for an audio and MIDI mixing application. Contexts hold
//! tracks, tracks hold devices, sends and clips, and every context can be
//! bound to a synthesis server that mirrors the tree as groups, buses and
//! synths.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use trellis_core::{Application, Config, DeviceSpec};
//!
//! let config = Config::load();
//! let mut app = Application::from_config(&config);
//!
//! let context = app.add_context(Some("main")).await?;
//! let track = app.add_track(context, Some("lead"))?;
//! app.add_device(track, DeviceSpec::instrument("default"), None)?;
//! app.boot().await?;
//!
//! let slot = app.slots(track)[0];
//! app.add_clip(slot, 1.0, true, &notes)?;
//! app.fire_slot(slot)?;
//! ```
//!
//! ## Module Overview
//!
//! - [`application`]: the `Application` handle; every mutation goes through it
//! - [`tree`]: arena of entities and their fixed container layouts
//! - [`routing`]: send and receive endpoints, default destinations, cycle checks
//! - [`channels`]: effective channel count resolution
//! - [`mixer`]: mute, solo and cue switches
//! - [`provider`]: per-context server state and command batching
//! - [`reconcile`]: diffs the tree against a provider's server state
//! - [`clip`]: notes in time and what a clip plays at a given offset
//! - [`transport`]: tempo, meter and the scheduling clock
//! - [`serialize`]: flat documents with forward reference resolution
//! - [`events`]: fan-out of application events to subscribers
//! - [`config`]: settings loaded from TOML

pub mod application;
pub mod channels;
pub mod clip;
pub mod config;
pub mod error;
pub mod events;
pub mod mixer;
pub mod provider;
pub mod reconcile;
pub mod routing;
pub mod serialize;
pub mod transport;
pub mod tree;

pub use application::{Application, DeviceSpec, TrackPlayback};
pub use clip::Clip;
pub use config::{Config, Settings};
pub use error::{Error, Result, StateError, ValidationError};
pub use events::EventBus;
pub use mixer::MixerState;
pub use transport::{Clock, ClockEvent, EventId, Transport, TransportClock};
pub use tree::{ContainerRole, NodeId, Payload, Tree};

pub use trellis_types::{
    ApplicationStatus, BackendStatus, DeviceRole, Document, EntityKind, Event, FaderPoint, MidiMessage, Moment,
    Note, ServerNode, Uuid,
};

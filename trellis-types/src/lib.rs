//! Shared types for the trellis workspace.
//!
//! This crate contains the vocabulary used across trellis crates: entity
//! kinds, notes and MIDI messages, persisted document records, lifecycle
//! events and status types. It has no behavior beyond small helpers so it
//! can be depended on by both the backend and the core crates.

pub mod entity;
pub mod event;
pub mod note;
pub mod record;
pub mod status;

pub use entity::{DeviceRole, EntityKind, FaderPoint};
pub use event::{Event, Moment};
pub use note::{MidiMessage, Note, NoteMoment};
pub use record::{Document, EntityMeta, EntityRecord, EntitySpec};
pub use status::{ApplicationStatus, BackendStatus, ServerNode};

pub use uuid::Uuid;

/// Lowest accepted channel count for any node.
pub const MIN_CHANNEL_COUNT: u8 = 1;

/// Highest accepted channel count for any node.
pub const MAX_CHANNEL_COUNT: u8 = 8;

//! Error taxonomy for application operations.

use thiserror::Error;
use trellis_audio::BackendError;
use trellis_types::{EntityKind, Uuid};

/// Result type for application operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// The operation is not allowed in the application's current status.
    #[error(transparent)]
    State(#[from] StateError),

    /// Malformed input; nothing was changed.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The backend refused a command or could not be reached.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// Some contexts could not be bound after exhausting their retries.
    /// Contexts not listed here booted normally.
    #[error("failed to boot {}", .failed.join(", "))]
    Boot { failed: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StateError {
    #[error("operation not allowed while rendering")]
    NonRealtime,

    #[error("operation requires the application to be offline")]
    NotOffline,

    #[error("application has no contexts to boot")]
    NoContexts,

    #[error("{0} is not attached to the application")]
    Detached(Uuid),

    #[error("context {0} is not bound to a backend")]
    NotBound(Uuid),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("note must start before it stops ({start} >= {stop})")]
    ZeroLengthNote { start: f64, stop: f64 },

    #[error("pitch {0} is out of range")]
    InvalidPitch(u8),

    #[error("channel count {0} is out of range")]
    InvalidChannelCount(u8),

    #[error("invalid loop points {start}..{stop}")]
    InvalidLoopPoints { start: f64, stop: f64 },

    #[error("tempo must be positive, got {0}")]
    InvalidTempo(f64),

    #[error("invalid time signature {0}/{1}")]
    InvalidTimeSignature(u32, u32),

    #[error("clip duration must be positive, got {0}")]
    InvalidDuration(f64),

    #[error("routing {from} to {to} would create a cycle")]
    RoutingCycle { from: Uuid, to: Uuid },

    #[error("{0} cannot route to itself")]
    SelfRouting(Uuid),

    #[error("routing target {0} is not attached")]
    DetachedTarget(Uuid),

    #[error("routing target {0} lives in another context")]
    CrossContext(Uuid),

    #[error("{kind} cannot be a routing endpoint")]
    InvalidEndpoint { kind: EntityKind },

    #[error("{node} is not in the {container} of {owner}")]
    NotInContainer {
        node: Uuid,
        owner: Uuid,
        container: &'static str,
    },

    #[error("{child} cannot be placed under {parent}")]
    InvalidParent { parent: String, child: String },

    #[error("no node with index {0}")]
    UnknownNode(usize),

    #[error("no entity with uuid {0}")]
    UnknownEntity(Uuid),

    #[error("no parameter named {name:?} on {owner}")]
    UnknownParameter { owner: Uuid, name: String },

    #[error("{0} is already attached")]
    AlreadyAttached(Uuid),

    #[error("an entity with uuid {0} already exists")]
    DuplicateEntity(Uuid),

    #[error("{0} cannot be removed on its own")]
    NotRemovable(EntityKind),

    #[error("{kind} does not support {operation}")]
    Unsupported {
        kind: EntityKind,
        operation: &'static str,
    },

    #[error("{owner} already has a parameter named {name:?}")]
    DuplicateParameter { owner: Uuid, name: String },

    #[error("scene index {0} is out of range")]
    InvalidSceneIndex(usize),

    #[error("malformed {kind} record {uuid}: {reason}")]
    MalformedRecord {
        kind: EntityKind,
        uuid: Uuid,
        reason: String,
    },

    #[error("malformed document: {0}")]
    MalformedDocument(String),
}

//! Backend side of trellis: the command surface for a synthesis server,
//! its OSC implementation, and the stand-ins used for tests and offline
//! rendering.

pub mod backend;
pub mod bus_allocator;
pub mod connector;
pub mod node_registry;
pub mod node_tree;
pub mod osc_client;
pub mod score;

pub use backend::{
    AudioBackend, BackendError, BackendMessage, BackendResult, RawArg, ScBackend, SharedTestBackend,
    TestBackend, BUNDLE_IMMEDIATE,
};
pub use bus_allocator::{AudioBus, BusAllocator};
pub use connector::{ConnectRequest, Connector, ScConnector, TestConnector};
pub use node_registry::NodeRegistry;
pub use node_tree::{NodeTree, ROOT_GROUP};
pub use score::{Score, ScoreBackend, ScoreEntry, SharedScore};

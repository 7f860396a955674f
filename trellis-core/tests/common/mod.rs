#![allow(dead_code)]
//! Test harness utilities for trellis-core integration tests.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;
use trellis_audio::{TestBackend, TestConnector};
use trellis_core::{Application, Event, Note, NodeId, Settings};

/// Default settings with a short retry pause so failing boots finish quickly.
pub fn settings() -> Settings {
    Settings {
        retry_backoff: Duration::from_millis(1),
        ..Settings::default()
    }
}

/// An application wired to a `TestConnector`.
pub struct Harness {
    pub app: Application,
    pub connector: Arc<TestConnector>,
}

impl Harness {
    pub fn new() -> Self {
        let connector = Arc::new(TestConnector::new());
        let app = Application::new(settings(), connector.clone());
        Self { app, connector }
    }

    /// A harness with one offline context named `name`.
    pub async fn with_context(name: &str) -> (Self, NodeId) {
        let mut harness = Self::new();
        let context = harness
            .app
            .add_context(Some(name))
            .await
            .expect("add context");
        (harness, context)
    }

    /// The backend most recently handed to the context named `name`.
    pub fn backend(&self, name: &str) -> Arc<TestBackend> {
        self.connector
            .backend(name)
            .unwrap_or_else(|| panic!("no backend for {}", name))
    }
}

/// Every event already published on `events`.
pub fn drain(events: &Receiver<Event>) -> Vec<Event> {
    events.try_iter().collect()
}

pub fn note(start: f64, stop: f64, pitch: u8) -> Note {
    Note::new(start, stop, pitch, 100.0)
}

/// Position of a server node in execution order.
pub fn execution_position(order: &[i32], id: i32) -> usize {
    order
        .iter()
        .position(|n| *n == id)
        .unwrap_or_else(|| panic!("node {} not on the server", id))
}

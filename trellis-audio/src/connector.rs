//! Establishing backend connections.
//!
//! A `Connector` opens one exclusive connection per context. Connecting is
//! blocking (socket setup plus a round trip to the server), so callers run
//! it off the async executor.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::backend::{lock, AudioBackend, BackendError, BackendResult, ScBackend, SharedTestBackend, TestBackend};
use crate::osc_client::OscClient;

/// What a connector needs to know about the context asking for a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub context: String,
    /// Position of the context in the application, used to keep connections apart.
    pub index: usize,
}

pub trait Connector: Send + Sync {
    fn connect(&self, request: &ConnectRequest) -> BackendResult<Box<dyn AudioBackend>>;
}

// ─── SuperCollider Connector ────────────────────────────────────────

/// Connects each context to its own server, one UDP port per context
/// counting up from `base_port`.
pub struct ScConnector {
    host: String,
    base_port: u16,
    reply_timeout: Duration,
}

impl ScConnector {
    pub fn new(host: &str, base_port: u16, reply_timeout: Duration) -> Self {
        Self {
            host: host.to_string(),
            base_port,
            reply_timeout,
        }
    }

    fn address_for(&self, request: &ConnectRequest) -> BackendResult<String> {
        let port = u16::try_from(request.index)
            .ok()
            .and_then(|offset| self.base_port.checked_add(offset))
            .ok_or_else(|| BackendError(format!("no port available for context {}", request.context)))?;
        Ok(format!("{}:{}", self.host, port))
    }
}

impl Connector for ScConnector {
    fn connect(&self, request: &ConnectRequest) -> BackendResult<Box<dyn AudioBackend>> {
        let addr = self.address_for(request)?;
        log::debug!(target: "audio::osc", "connecting {} to {}", request.context, addr);
        let client = OscClient::new(&addr, self.reply_timeout)?;
        client.notify()?;
        let status = client.query_status()?;
        log::info!(
            target: "audio::osc",
            "{} connected to {} ({} synths, {} groups)",
            request.context, addr, status.synths, status.groups
        );
        Ok(Box::new(ScBackend::new(client)))
    }
}

// ─── Test Connector ─────────────────────────────────────────────────

/// Hands out `TestBackend`s and can be told to fail, so boot retries and
/// partial boot failures can be exercised without a server.
pub struct TestConnector {
    failures: Mutex<HashMap<String, usize>>,
    attempts: Mutex<HashMap<String, usize>>,
    backends: Mutex<Vec<(String, Arc<TestBackend>)>>,
}

/// Sentinel failure count meaning "never connect".
const ALWAYS: usize = usize::MAX;

impl TestConnector {
    pub fn new() -> Self {
        Self {
            failures: Mutex::new(HashMap::new()),
            attempts: Mutex::new(HashMap::new()),
            backends: Mutex::new(Vec::new()),
        }
    }

    /// The next `count` attempts for `context` fail.
    pub fn fail_times(&self, context: &str, count: usize) {
        lock(&self.failures).insert(context.to_string(), count);
    }

    /// Every attempt for `context` fails.
    pub fn always_fail(&self, context: &str) {
        lock(&self.failures).insert(context.to_string(), ALWAYS);
    }

    /// Number of connection attempts made for `context`.
    pub fn attempts(&self, context: &str) -> usize {
        lock(&self.attempts).get(context).copied().unwrap_or(0)
    }

    /// The most recent backend handed to `context`.
    pub fn backend(&self, context: &str) -> Option<Arc<TestBackend>> {
        lock(&self.backends)
            .iter()
            .rev()
            .find(|(name, _)| name == context)
            .map(|(_, backend)| Arc::clone(backend))
    }

    /// Every backend handed out, oldest first.
    pub fn backends(&self) -> Vec<(String, Arc<TestBackend>)> {
        lock(&self.backends).clone()
    }
}

impl Default for TestConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for TestConnector {
    fn connect(&self, request: &ConnectRequest) -> BackendResult<Box<dyn AudioBackend>> {
        *lock(&self.attempts).entry(request.context.clone()).or_insert(0) += 1;
        {
            let mut failures = lock(&self.failures);
            if let Some(remaining) = failures.get_mut(&request.context) {
                if *remaining == ALWAYS {
                    return Err(BackendError(format!("{} is unreachable", request.context)));
                }
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(BackendError(format!("{} refused connection", request.context)));
                }
            }
        }
        let backend = Arc::new(TestBackend::new());
        lock(&self.backends).push((request.context.clone(), Arc::clone(&backend)));
        Ok(Box::new(SharedTestBackend(backend)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(context: &str) -> ConnectRequest {
        ConnectRequest {
            context: context.to_string(),
            index: 0,
        }
    }

    #[test]
    fn test_connector_fails_then_connects() {
        let connector = TestConnector::new();
        connector.fail_times("a", 2);
        assert!(connector.connect(&request("a")).is_err());
        assert!(connector.connect(&request("a")).is_err());
        assert!(connector.connect(&request("a")).is_ok());
        assert_eq!(connector.attempts("a"), 3);
        assert!(connector.backend("a").is_some());
        assert!(connector.backend("b").is_none());
    }

    #[test]
    fn always_fail_never_connects() {
        let connector = TestConnector::new();
        connector.always_fail("a");
        for _ in 0..5 {
            assert!(connector.connect(&request("a")).is_err());
        }
        assert_eq!(connector.attempts("a"), 5);
    }

    #[test]
    fn sc_connector_assigns_port_per_context() {
        let connector = ScConnector::new("127.0.0.1", 57110, Duration::from_millis(10));
        let addr = connector
            .address_for(&ConnectRequest {
                context: "b".to_string(),
                index: 2,
            })
            .unwrap();
        assert_eq!(addr, "127.0.0.1:57112");
    }
}

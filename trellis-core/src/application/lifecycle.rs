//! Binding contexts to backends: boot, quit, context management and
//! offline rendering.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use trellis_audio::{
    AudioBackend, BackendError, BackendResult, ConnectRequest, Connector, Score, ScoreBackend, SharedScore,
};
use trellis_types::{ApplicationStatus, BackendStatus, EntityKind, Event, ServerNode};

use super::{Application, RenderSession};
use crate::error::{Error, Result, StateError, ValidationError};
use crate::provider::Provider;
use crate::tree::{ContainerRole, NodeId};

/// Try to connect, retrying with a pause in between. The blocking connect
/// runs on the blocking pool.
async fn connect_with_retries(
    connector: Arc<dyn Connector>,
    request: ConnectRequest,
    attempts: u32,
    backoff: Duration,
) -> BackendResult<Box<dyn AudioBackend>> {
    let attempts = attempts.max(1);
    let mut last = BackendError(format!("{}: no connection attempted", request.context));
    for attempt in 1..=attempts {
        let connector = Arc::clone(&connector);
        let req = request.clone();
        match tokio::task::spawn_blocking(move || connector.connect(&req)).await {
            Ok(Ok(backend)) => return Ok(backend),
            Ok(Err(e)) => {
                log::warn!(
                    target: "provider",
                    "{}: connection attempt {}/{} failed: {}",
                    request.context, attempt, attempts, e
                );
                last = e;
            }
            Err(e) => last = BackendError(format!("{}: connect task failed: {}", request.context, e)),
        }
        if attempt < attempts {
            tokio::time::sleep(backoff).await;
        }
    }
    Err(last)
}

impl Application {
    /// Bind every context to a live backend and replay its state.
    ///
    /// Contexts connect concurrently. Those that cannot connect after the
    /// configured retries are reported in [`Error::Boot`]; the rest stay
    /// bound and the application is Realtime.
    pub async fn boot(&mut self) -> Result<()> {
        match self.status {
            ApplicationStatus::Realtime => return Ok(()),
            ApplicationStatus::NonRealtime => return Err(StateError::NonRealtime.into()),
            ApplicationStatus::Offline => {}
        }
        let contexts = self.contexts();
        if contexts.is_empty() {
            return Err(StateError::NoContexts.into());
        }

        log::info!(target: "provider", "booting {} contexts", contexts.len());
        self.emit(Event::Booting);
        let failed = self.bind_contexts(&contexts).await;
        if failed.len() == contexts.len() {
            log::warn!(target: "provider", "boot failed for every context");
            return Err(Error::Boot { failed });
        }

        self.status = ApplicationStatus::Realtime;
        log::info!(target: "provider", "booted");
        self.emit(Event::Booted);
        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::Boot { failed })
        }
    }

    /// Connect the given contexts concurrently and bind those that connect.
    /// Returns the labels of the contexts left unbound.
    async fn bind_contexts(&mut self, contexts: &[NodeId]) -> Vec<String> {
        let attempts = self.settings.boot_retries;
        let backoff = self.settings.retry_backoff;
        let all = self.contexts();

        let mut set = JoinSet::new();
        for context in contexts {
            let request = ConnectRequest {
                context: self.context_label(*context),
                index: all.iter().position(|c| c == context).unwrap_or(0),
            };
            let connector = Arc::clone(&self.connector);
            let context = *context;
            set.spawn(async move { (context, connect_with_retries(connector, request, attempts, backoff).await) });
        }

        let mut connected = Vec::new();
        let mut failed = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((context, Ok(backend))) => connected.push((context, backend)),
                Ok((context, Err(e))) => {
                    log::warn!(target: "provider", "{}: giving up: {}", self.context_label(context), e);
                    failed.push(context);
                }
                Err(e) => log::warn!(target: "provider", "connect task failed: {}", e),
            }
        }

        connected.sort_by_key(|(context, _)| self.tree.graph_order(*context));
        for (context, backend) in connected {
            if let Err(e) = self.bind(context, backend) {
                log::warn!(target: "provider", "{}: replay rejected: {}", self.context_label(context), e);
                failed.push(context);
            }
        }
        for context in contexts {
            if !self.providers.contains_key(context) && !failed.contains(context) {
                failed.push(*context);
            }
        }
        failed.sort_by_key(|context| self.tree.graph_order(*context));
        failed.into_iter().map(|context| self.context_label(context)).collect()
    }

    /// Attach a provider to a context and replay the context onto it.
    fn bind(&mut self, context: NodeId, backend: Box<dyn AudioBackend>) -> Result<()> {
        let provider = Provider::new(self.context_label(context), backend, &self.settings);
        self.providers.insert(context, provider);
        if let Err(e) = self.grouped(|_| Ok(())) {
            self.providers.remove(&context);
            return Err(e);
        }
        log::info!(target: "provider", "{}: bound", self.context_label(context));
        Ok(())
    }

    /// Tear down every context's backend state and close the connections.
    pub async fn quit(&mut self) -> Result<()> {
        match self.status {
            ApplicationStatus::Offline => return Ok(()),
            ApplicationStatus::NonRealtime => return Err(StateError::NonRealtime.into()),
            ApplicationStatus::Realtime => {}
        }
        log::info!(target: "provider", "quitting");
        self.emit(Event::Quitting);
        if let Err(e) = self.stop() {
            log::warn!(target: "provider", "stopping playback before quit failed: {}", e);
        }
        for context in self.contexts() {
            self.unbind(context);
        }
        self.status = ApplicationStatus::Offline;
        log::info!(target: "provider", "quit");
        self.emit(Event::Quit);
        Ok(())
    }

    /// Send a context's teardown and drop its provider.
    fn unbind(&mut self, context: NodeId) {
        if let Some(provider) = self.providers.remove(&context) {
            let label = provider.name().to_string();
            if let Err(e) = provider.teardown(&self.tree, context) {
                log::warn!(target: "provider", "{}: teardown incomplete: {}", label, e);
            }
        }
    }

    /// Add a context. While Realtime it is booted straight away; a failed
    /// boot leaves it in the tree, unbound, and returns [`Error::Boot`].
    pub async fn add_context(&mut self, name: Option<&str>) -> Result<NodeId> {
        self.require_not_rendering()?;
        let context = self.create_context(name)?;
        if self.status == ApplicationStatus::Realtime {
            let failed = self.bind_contexts(&[context]).await;
            if !failed.is_empty() {
                return Err(Error::Boot { failed });
            }
        }
        Ok(context)
    }

    /// Quit and remove contexts. Fails without changing anything if any of
    /// them is not one of the application's contexts.
    pub async fn remove_contexts(&mut self, contexts: &[NodeId]) -> Result<()> {
        self.require_not_rendering()?;
        for context in contexts {
            self.tree.check(*context)?;
            if !self.tree.members(NodeId::ROOT, ContainerRole::Contexts).contains(context) {
                return Err(ValidationError::NotInContainer {
                    node: self.tree.uuid(*context),
                    owner: self.uuid(),
                    container: ContainerRole::Contexts.name(),
                }
                .into());
            }
        }
        for context in contexts {
            for track in self.tree.descendants(*context) {
                self.cancel_playback(track);
            }
            self.unbind(*context);
        }
        self.grouped(|app| {
            for context in contexts {
                if app.tree.is_attached(*context) {
                    app.detach_node(*context)?;
                }
            }
            Ok(())
        })?;
        if self.contexts().is_empty() && self.status != ApplicationStatus::Offline {
            log::info!(target: "provider", "last context removed, going offline");
            self.status = ApplicationStatus::Offline;
        }
        Ok(())
    }

    /// Status of a bound context's server, also published to subscribers.
    pub fn refresh_status(&mut self, context: NodeId) -> Result<BackendStatus> {
        let provider = self.bound_provider(context)?;
        let status = provider.status()?;
        let uuid = self.tree.uuid(context);
        self.emit(Event::StatusRefreshed { context: uuid, status });
        Ok(status)
    }

    /// The live server tree of a bound context.
    pub fn query_tree(&self, context: NodeId) -> Result<ServerNode> {
        Ok(self.bound_provider(context)?.query_tree()?)
    }

    fn bound_provider(&self, context: NodeId) -> Result<&Provider> {
        self.tree.check(context)?;
        if self.tree.kind(context) != Some(EntityKind::Context) {
            let kind = self.tree.kind(context).unwrap_or(EntityKind::Application);
            return Err(ValidationError::Unsupported {
                kind,
                operation: "backend queries",
            }
            .into());
        }
        self.providers
            .get(&context)
            .ok_or_else(|| StateError::NotBound(self.tree.uuid(context)).into())
    }

    /// Render `duration` whole notes offline into a score.
    ///
    /// Every context is bound to a score recorder, the transport runs from
    /// its current offset, and everything is torn down at the end. The
    /// application is Offline again afterwards, whether or not it succeeded.
    pub async fn render(&mut self, duration: f64) -> Result<Score> {
        if self.status != ApplicationStatus::Offline {
            return Err(StateError::NotOffline.into());
        }
        if !(duration > 0.0 && duration.is_finite()) {
            return Err(ValidationError::InvalidDuration(duration).into());
        }
        let contexts = self.contexts();
        if contexts.is_empty() {
            return Err(StateError::NoContexts.into());
        }

        self.status = ApplicationStatus::NonRealtime;
        let origin = self.transport.offset();
        let scores: Vec<Arc<ScoreBackend>> = contexts.iter().map(|_| Arc::new(ScoreBackend::new())).collect();
        self.render = Some(RenderSession {
            origin,
            scores: scores.clone(),
        });
        log::info!(target: "provider", "rendering {} whole notes", duration);

        let result = self.run_render(&contexts, &scores, origin + duration);

        for context in &contexts {
            self.unbind(*context);
        }
        self.render = None;
        self.status = ApplicationStatus::Offline;
        result?;

        let mut score = Score::default();
        for recorded in scores {
            score.merge(recorded.score());
        }
        log::info!(target: "provider", "rendered {} messages", score.message_count());
        Ok(score)
    }

    fn run_render(&mut self, contexts: &[NodeId], scores: &[Arc<ScoreBackend>], until: f64) -> Result<()> {
        for (context, score) in contexts.iter().zip(scores) {
            self.bind(*context, Box::new(SharedScore(Arc::clone(score))))?;
        }
        self.start()?;
        self.advance_to(until)?;
        self.stop()?;
        Ok(())
    }
}

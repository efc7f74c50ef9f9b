//! Opening sessions: fresh ones, and re-attaches to stored history.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use agentwire_agent::{CircuitBreaker, RateLimiter, TurnLoop};
use agentwire_config::AppConfig;
use agentwire_core::error::SessionError;
use agentwire_core::event::EventBus;
use agentwire_core::history::History;
use agentwire_core::model::ModelClient;
use agentwire_core::repository::{SessionRepository, StoredSession};
use agentwire_core::tool::ToolRegistry;
use agentwire_tools::executor_from_config;

use crate::registry::SessionRegistry;
use crate::session::{Conversation, SessionActor, SessionDeps, SessionHandle};

/// Builds sessions that share one turn loop, registry, and event bus.
pub struct SessionManager {
    deps: Arc<SessionDeps>,
    registry: Arc<SessionRegistry>,
}

impl SessionManager {
    /// Wire a manager from configuration. The model also serves as the
    /// summarizer for the summarizing context policy.
    pub fn new(config: AppConfig, model: Arc<dyn ModelClient>, tools: ToolRegistry) -> Self {
        let event_bus = Arc::new(EventBus::default());
        let mut turn_loop = TurnLoop::new(
            Arc::clone(&model),
            Arc::new(tools),
            executor_from_config(&config.executor),
            Arc::clone(&event_bus),
        )
        .configured(&config)
        .with_circuit_breaker(Arc::new(CircuitBreaker::from_config(
            &config.circuit_breaker,
        )));
        if let Some(rate_limit) = &config.rate_limit {
            turn_loop = turn_loop.with_rate_limiter(Arc::new(RateLimiter::from_config(rate_limit)));
        }
        Self::from_parts(config, Arc::new(turn_loop), event_bus).with_summarizer(model)
    }

    /// Use an already built turn loop. The event bus should be the one the
    /// turn loop publishes to.
    pub fn from_parts(config: AppConfig, turn_loop: Arc<TurnLoop>, event_bus: Arc<EventBus>) -> Self {
        Self {
            deps: Arc::new(SessionDeps {
                config: Arc::new(config),
                turn_loop,
                summarizer: None,
                repository: None,
                event_bus,
            }),
            registry: Arc::new(SessionRegistry::new()),
        }
    }

    pub fn with_repository(mut self, repository: Arc<dyn SessionRepository>) -> Self {
        Arc::make_mut(&mut self.deps).repository = Some(repository);
        self
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn ModelClient>) -> Self {
        Arc::make_mut(&mut self.deps).summarizer = Some(summarizer);
        self
    }

    pub fn with_registry(mut self, registry: Arc<SessionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.deps.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.deps.event_bus
    }

    /// Open a session. With `resume`, re-attach to that id's stored history;
    /// an id with nothing stored starts empty under that id.
    pub async fn open(&self, resume: Option<String>) -> Result<SessionHandle, SessionError> {
        let session_id = resume
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let buffer = self.deps.config.session.outbound_buffer.max(1);
        let (outbound_tx, outbound_rx) = mpsc::channel(buffer);
        let registration = self.registry.register(&session_id, outbound_tx.clone())?;

        let stored = match resume {
            Some(_) => self.load(&session_id).await,
            None => None,
        };
        let resumed = stored.is_some();
        let StoredSession {
            mut history,
            removed_count,
        } = stored.unwrap_or_default();

        if history.is_empty() {
            if let Some(prompt) = &self.deps.config.model.system_prompt {
                history = History::with_system(prompt.clone());
            }
        }
        let conversation = Conversation {
            history,
            context: self.deps.context_manager(removed_count),
        };
        debug!(session_id = %session_id, resumed, "Opening session");

        Ok(SessionActor::spawn(
            Arc::clone(&self.deps),
            registration,
            conversation,
            resumed,
            self.registry.shutdown_token(),
            outbound_tx,
            outbound_rx,
        ))
    }

    async fn load(&self, session_id: &str) -> Option<StoredSession> {
        let repository = self.deps.repository.as_ref()?;
        match repository.load(session_id).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(session_id, error = %e, "Failed to load stored session, starting fresh");
                None
            }
        }
    }
}

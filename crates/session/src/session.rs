//! The bidirectional session: one actor task per connection.
//!
//! The actor owns the conversation and multiplexes three sources:
//! inbound transport frames, events from the turn in flight, and timers
//! (heartbeat and shutdown grace). A turn runs on its own task with the
//! conversation moved into it; the task hands the conversation back when the
//! turn ends, so only one turn ever touches the history at a time.
//!
//! Outbound envelopes go through a bounded queue the transport drains. Events
//! of a turn carry `metadata.turn_id`, and `end` is always the last one.

use chrono::Utc;
use serde::Serialize;
use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use agentwire_agent::{
    ContextManager, PendingInput, TurnContext, TurnControl, TurnEvent, TurnLoop, TurnOutcome,
    TurnSink, build_context_manager,
};
use agentwire_config::{AppConfig, BusyPolicy};
use agentwire_core::envelope::{ControlAction, EndReason, Envelope, InboundEvent, OutboundEvent};
use agentwire_core::error::{ErrorCode, ProtocolError, SessionError};
use agentwire_core::event::{DomainEvent, EventBus};
use agentwire_core::history::History;
use agentwire_core::message::Message;
use agentwire_core::model::ModelClient;
use agentwire_core::repository::SessionRepository;
use agentwire_core::tool::{ToolResult, ToolStatus};

use crate::registry::Registration;
use crate::state::{CloseReason, SessionState};

/// What a transport feeds into a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One text frame holding an inbound envelope.
    Frame(String),
    /// A frame the transport could not turn into text.
    Unreadable(String),
    /// The peer closed the connection.
    Disconnected,
    /// The transport broke.
    Failed(String),
}

/// Returned when a session task ends.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub reason: CloseReason,
    pub turns: u64,
    pub messages: usize,
}

/// The transport's side of a running session.
///
/// Dropping the inbound side is read as a client disconnect; the outbound
/// side yields `None` once the session has closed.
pub struct SessionHandle {
    session_id: String,
    resumed: bool,
    inbound: mpsc::Sender<TransportEvent>,
    outbound: mpsc::Receiver<Envelope<OutboundEvent>>,
    task: JoinHandle<SessionSummary>,
}

impl SessionHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Whether the session was re-attached to stored history.
    pub fn resumed(&self) -> bool {
        self.resumed
    }

    /// Feed one raw inbound frame.
    pub async fn send_frame(&self, text: impl Into<String>) -> Result<(), SessionError> {
        self.inbound
            .send(TransportEvent::Frame(text.into()))
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Wrap an event in a fresh envelope and feed it.
    pub async fn send(&self, event: InboundEvent) -> Result<(), SessionError> {
        let text = Envelope::new(event)
            .encode()
            .map_err(|e| SessionError::Transport(e.to_string()))?;
        self.send_frame(text).await
    }

    pub async fn recv(&mut self) -> Option<Envelope<OutboundEvent>> {
        self.outbound.recv().await
    }

    /// Close from the client side and wait for the session to finish.
    pub async fn disconnect(self) -> Result<SessionSummary, SessionError> {
        let (inbound, outbound, task) = self.into_parts();
        drop(outbound);
        let _ = inbound.send(TransportEvent::Disconnected).await;
        drop(inbound);
        task.await.map_err(|e| SessionError::Transport(e.to_string()))
    }

    /// Wait for the session to end on its own.
    pub async fn closed(self) -> Result<SessionSummary, SessionError> {
        self.task
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))
    }

    pub fn into_parts(
        self,
    ) -> (
        mpsc::Sender<TransportEvent>,
        mpsc::Receiver<Envelope<OutboundEvent>>,
        JoinHandle<SessionSummary>,
    ) {
        (self.inbound, self.outbound, self.task)
    }
}

/// Collaborators every session of a manager shares.
#[derive(Clone)]
pub(crate) struct SessionDeps {
    pub config: Arc<AppConfig>,
    pub turn_loop: Arc<TurnLoop>,
    pub summarizer: Option<Arc<dyn ModelClient>>,
    pub repository: Option<Arc<dyn SessionRepository>>,
    pub event_bus: Arc<EventBus>,
}

impl SessionDeps {
    pub(crate) fn context_manager(&self, removed: u64) -> Box<dyn ContextManager> {
        let mut context = build_context_manager(&self.config.context, self.summarizer.clone());
        context.restore_removed_count(removed);
        context
    }
}

/// The history and the policy that bounds it.
pub(crate) struct Conversation {
    pub history: History,
    pub context: Box<dyn ContextManager>,
}

impl Conversation {
    fn turn_context<'a>(&'a mut self, turn_id: &'a str, control: &'a TurnControl) -> TurnContext<'a> {
        TurnContext {
            turn_id,
            history: &mut self.history,
            context: self.context.as_mut(),
            control,
        }
    }
}

struct ActiveTurn {
    turn_id: String,
    control: TurnControl,
    events: mpsc::Receiver<TurnEvent>,
    task: JoinHandle<(TurnOutcome, Conversation)>,
    /// History as it was before the turn, restored if the task dies.
    snapshot: History,
    removed: u64,
    /// Set once the client cancels; only `end` is forwarded afterwards.
    cancel_requested: bool,
}

enum TurnStep {
    Event(TurnEvent),
    Finished(Result<(TurnOutcome, Conversation), JoinError>),
}

impl ActiveTurn {
    async fn next(&mut self) -> TurnStep {
        tokio::select! {
            biased;
            Some(event) = self.events.recv() => TurnStep::Event(event),
            joined = &mut self.task => TurnStep::Finished(joined),
        }
    }
}

async fn next_step(active: &mut Option<ActiveTurn>) -> TurnStep {
    match active {
        Some(turn) => turn.next().await,
        None => std::future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

enum TurnInput {
    Chat(String),
    Resume(PendingInput),
}

/// A turn suspended on client-side tool results.
struct SuspendedTurn {
    turn_id: String,
    pending: PendingInput,
}

pub(crate) struct SessionActor {
    id: String,
    resumed: bool,
    deps: Arc<SessionDeps>,
    registration: Registration,
    state: SessionState,
    inbound: mpsc::Receiver<TransportEvent>,
    outbound: mpsc::Sender<Envelope<OutboundEvent>>,
    conversation: Option<Conversation>,
    active: Option<ActiveTurn>,
    suspended: Option<SuspendedTurn>,
    queue: VecDeque<String>,
    paused: bool,
    turns: u64,
    last_inbound: Instant,
    awaiting_pong: Option<Instant>,
    shutdown: CancellationToken,
    shutting_down: bool,
    grace_deadline: Option<Instant>,
    lost: Option<CloseReason>,
}

impl SessionActor {
    /// Start the actor task for a registered session.
    pub(crate) fn spawn(
        deps: Arc<SessionDeps>,
        registration: Registration,
        conversation: Conversation,
        resumed: bool,
        shutdown: CancellationToken,
        outbound_tx: mpsc::Sender<Envelope<OutboundEvent>>,
        outbound_rx: mpsc::Receiver<Envelope<OutboundEvent>>,
    ) -> SessionHandle {
        let (inbound_tx, inbound_rx) = mpsc::channel(deps.config.session.outbound_buffer.max(1));
        let id = registration.session_id().to_string();
        let actor = SessionActor {
            id: id.clone(),
            resumed,
            deps,
            registration,
            state: SessionState::Connecting,
            inbound: inbound_rx,
            outbound: outbound_tx,
            conversation: Some(conversation),
            active: None,
            suspended: None,
            queue: VecDeque::new(),
            paused: false,
            turns: 0,
            last_inbound: Instant::now(),
            awaiting_pong: None,
            shutdown,
            shutting_down: false,
            grace_deadline: None,
            lost: None,
        };
        let task = tokio::spawn(actor.run());
        SessionHandle {
            session_id: id,
            resumed,
            inbound: inbound_tx,
            outbound: outbound_rx,
            task,
        }
    }

    async fn run(mut self) -> SessionSummary {
        self.open().await;

        let reason = loop {
            if let Some(reason) = self.lost {
                break reason;
            }
            let heartbeat = self.next_heartbeat();
            let grace = self.grace_deadline;

            let flow = tokio::select! {
                biased;
                _ = self.shutdown.cancelled(), if !self.shutting_down => self.begin_shutdown().await,
                frame = self.inbound.recv() => self.on_transport(frame).await,
                step = next_step(&mut self.active) => self.on_turn_step(step).await,
                _ = wait_until(grace) => self.force_shutdown().await,
                _ = wait_until(heartbeat) => self.on_heartbeat().await,
            };
            if let ControlFlow::Break(reason) = flow {
                break reason;
            }
        };

        self.close(reason).await
    }

    async fn open(&mut self) {
        if let Err(e) = self.state.transition(SessionState::Open) {
            error!(session_id = %self.id, "{e}");
        }
        self.registration.update(|s| s.state = SessionState::Open);

        let message_count = self.history_len();
        self.send(Envelope::new(OutboundEvent::SessionOpened {
            session_id: self.id.clone(),
            resumed: self.resumed,
            message_count,
        }))
        .await;
        self.deps.event_bus.publish(DomainEvent::SessionOpened {
            session_id: self.id.clone(),
            resumed: self.resumed,
            timestamp: Utc::now(),
        });
        info!(
            session_id = %self.id,
            resumed = self.resumed,
            messages = message_count,
            "Session opened"
        );
    }

    fn history_len(&self) -> usize {
        self.conversation.as_ref().map_or(0, |c| c.history.len())
    }

    // ── outbound ──────────────────────────────────────────────────────────

    /// Queue an envelope for the transport. A closed or stalled queue marks
    /// the session lost.
    async fn send(&mut self, envelope: Envelope<OutboundEvent>) {
        if self.lost.is_some() {
            return;
        }
        let result = match self.stall_limit() {
            Some(limit) => match tokio::time::timeout(limit, self.outbound.send(envelope)).await {
                Ok(sent) => sent.map_err(|_| CloseReason::ClientClosed),
                Err(_) => Err(CloseReason::TransportError),
            },
            None => self
                .outbound
                .send(envelope)
                .await
                .map_err(|_| CloseReason::ClientClosed),
        };
        if let Err(reason) = result {
            warn!(session_id = %self.id, %reason, "Outbound delivery failed");
            self.lost = Some(reason);
        }
    }

    /// How long a full outbound queue may block before the peer counts as
    /// gone. Unbounded without heartbeats.
    fn stall_limit(&self) -> Option<Duration> {
        let heartbeat = &self.deps.config.heartbeat;
        heartbeat
            .enabled
            .then(|| heartbeat.interval() + heartbeat.timeout())
    }

    /// Queue without waiting. Used while closing, when nobody may be reading.
    fn send_now(&self, envelope: Envelope<OutboundEvent>) {
        if self.lost.is_none() && self.outbound.try_send(envelope).is_err() {
            debug!(session_id = %self.id, "Dropped outbound event while closing");
        }
    }

    async fn send_error(&mut self, code: ErrorCode, message: impl Into<String>, recoverable: bool) {
        self.send(Envelope::new(OutboundEvent::error(code, message, recoverable)))
            .await;
    }

    async fn forward(&mut self, event: TurnEvent) {
        let Some((turn_id, suppress)) = self
            .active
            .as_ref()
            .map(|t| (t.turn_id.clone(), t.cancel_requested))
        else {
            return;
        };
        self.forward_for(&turn_id, suppress, event).await;
    }

    async fn forward_for(&mut self, turn_id: &str, suppress: bool, event: TurnEvent) {
        if suppress && !matches!(event, TurnEvent::End { .. }) {
            return;
        }
        self.send(Envelope::new(OutboundEvent::from(event)).with_turn_id(turn_id))
            .await;
    }

    // ── inbound ───────────────────────────────────────────────────────────

    async fn on_transport(&mut self, frame: Option<TransportEvent>) -> ControlFlow<CloseReason> {
        match frame {
            None | Some(TransportEvent::Disconnected) => ControlFlow::Break(CloseReason::ClientClosed),
            Some(TransportEvent::Failed(reason)) => {
                warn!(session_id = %self.id, "Transport failed: {reason}");
                ControlFlow::Break(CloseReason::TransportError)
            }
            Some(TransportEvent::Frame(text)) => {
                self.last_inbound = Instant::now();
                self.registration.update(|s| s.last_activity_at = Utc::now());
                self.on_frame(&text).await
            }
            Some(TransportEvent::Unreadable(reason)) => {
                self.last_inbound = Instant::now();
                let e = ProtocolError::Malformed(reason);
                warn!(session_id = %self.id, error = %e, "Rejected inbound frame");
                self.send_error(e.code(), e.to_string(), true).await;
                ControlFlow::Continue(())
            }
        }
    }

    async fn on_frame(&mut self, text: &str) -> ControlFlow<CloseReason> {
        let max = self.deps.config.session.max_message_bytes;
        let envelope = match Envelope::<InboundEvent>::decode(text, max) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "Rejected inbound frame");
                self.send_error(e.code(), e.to_string(), true).await;
                return ControlFlow::Continue(());
            }
        };
        debug!(session_id = %self.id, event = envelope.event_type(), "Inbound event");

        match envelope.event {
            InboundEvent::Ping => self.send(Envelope::pong(&envelope.id)).await,
            InboundEvent::Pong => self.awaiting_pong = None,
            InboundEvent::Chat { content, .. } => self.on_chat(content).await,
            InboundEvent::Control { action } => return self.on_control(action).await,
            InboundEvent::ToolResult {
                tool_id,
                result,
                status,
            } => self.on_tool_result(tool_id, result, status).await,
        }
        ControlFlow::Continue(())
    }

    async fn on_chat(&mut self, content: String) {
        if content.trim().is_empty() {
            let e = ProtocolError::EmptyContent;
            self.send_error(e.code(), e.to_string(), true).await;
            return;
        }
        if self.shutting_down {
            let e = SessionError::ShuttingDown;
            self.send_error(e.code(), e.to_string(), false).await;
            return;
        }
        if self.active.is_some() || self.suspended.is_some() {
            let session = &self.deps.config.session;
            if session.busy_policy == BusyPolicy::Queue && self.queue.len() < session.max_queued_chats {
                self.queue.push_back(content);
                debug!(session_id = %self.id, queued = self.queue.len(), "Chat queued behind turn in flight");
            } else {
                let e = SessionError::Busy;
                self.send_error(e.code(), e.to_string(), true).await;
            }
            return;
        }
        self.start_turn(content).await;
    }

    async fn on_control(&mut self, action: ControlAction) -> ControlFlow<CloseReason> {
        match action {
            ControlAction::Cancel => {
                if let Some(turn) = self.active.as_mut() {
                    info!(session_id = %self.id, turn_id = %turn.turn_id, "Cancelling turn");
                    turn.cancel_requested = true;
                    turn.control.cancel();
                } else if let Some(suspended) = self.suspended.take() {
                    info!(
                        session_id = %self.id,
                        turn_id = %suspended.turn_id,
                        "Cancelling turn awaiting client input"
                    );
                    return self.end_suspended(suspended).await;
                } else {
                    debug!(session_id = %self.id, "Cancel with no turn in flight");
                }
            }
            ControlAction::Pause => {
                self.paused = true;
                if let Some(turn) = &self.active {
                    turn.control.pause();
                }
                debug!(session_id = %self.id, "Session paused");
            }
            ControlAction::Resume => {
                self.paused = false;
                if let Some(turn) = &self.active {
                    turn.control.resume();
                }
                debug!(session_id = %self.id, "Session resumed");
            }
        }
        ControlFlow::Continue(())
    }

    async fn on_tool_result(&mut self, tool_id: String, result: serde_json::Value, status: ToolStatus) {
        let mut tool_result = ToolResult::success(&tool_id, InboundEvent::result_blocks(&result));
        tool_result.status = status;

        let resolved = match self.suspended.as_mut() {
            Some(suspended) => suspended.pending.resolve(tool_result).is_ok(),
            None => false,
        };
        if !resolved {
            self.send_error(
                ErrorCode::UnknownToolResult,
                format!("No pending tool invocation with id {tool_id}"),
                true,
            )
            .await;
            return;
        }

        if self.suspended.as_ref().is_some_and(|s| s.pending.is_complete()) {
            if let Some(suspended) = self.suspended.take() {
                self.resume_turn(suspended).await;
            }
        }
    }

    // ── turns ─────────────────────────────────────────────────────────────

    async fn start_turn(&mut self, content: String) {
        let turn_id = Uuid::new_v4().to_string();
        self.launch(turn_id, TurnInput::Chat(content)).await;
    }

    async fn resume_turn(&mut self, suspended: SuspendedTurn) {
        self.launch(suspended.turn_id, TurnInput::Resume(suspended.pending))
            .await;
    }

    /// Move the conversation onto a new turn task.
    async fn launch(&mut self, turn_id: String, input: TurnInput) {
        let Some(mut conversation) = self.conversation.take() else {
            error!(session_id = %self.id, "No conversation available for a new turn");
            self.send_error(ErrorCode::InternalError, "Session has no conversation", false)
                .await;
            return;
        };

        let control = TurnControl::new(self.paused);
        let (tx, rx) = mpsc::channel(self.deps.config.session.outbound_buffer.max(1));
        let snapshot = conversation.history.clone();
        let removed = conversation.context.removed_message_count();
        let turn_loop = Arc::clone(&self.deps.turn_loop);

        let task = {
            let control = control.clone();
            let turn_id = turn_id.clone();
            tokio::spawn(async move {
                let ctx = conversation.turn_context(&turn_id, &control);
                let sink = TurnSink::new(tx);
                let outcome = match input {
                    TurnInput::Chat(content) => {
                        turn_loop.run_turn(Message::user(content), ctx, sink).await
                    }
                    TurnInput::Resume(pending) => turn_loop.resume(pending, ctx, sink).await,
                };
                (outcome, conversation)
            })
        };

        debug!(session_id = %self.id, turn_id = %turn_id, "Turn dispatched");
        self.registration.update(|s| s.turn_in_flight = true);
        self.active = Some(ActiveTurn {
            turn_id,
            control,
            events: rx,
            task,
            snapshot,
            removed,
            cancel_requested: false,
        });
    }

    async fn on_turn_step(&mut self, step: TurnStep) -> ControlFlow<CloseReason> {
        match step {
            TurnStep::Event(event) => {
                self.forward(event).await;
                ControlFlow::Continue(())
            }
            TurnStep::Finished(joined) => {
                let Some(mut turn) = self.active.take() else {
                    return ControlFlow::Continue(());
                };
                while let Ok(event) = turn.events.try_recv() {
                    self.forward_for(&turn.turn_id, turn.cancel_requested, event)
                        .await;
                }

                let outcome = match joined {
                    Ok((outcome, conversation)) => {
                        self.conversation = Some(conversation);
                        outcome
                    }
                    Err(e) => {
                        error!(session_id = %self.id, turn_id = %turn.turn_id, "Turn task failed: {e}");
                        self.restore(turn.snapshot, turn.removed);
                        let code = ErrorCode::InternalError;
                        self.send(
                            Envelope::new(OutboundEvent::error(code, "Internal error", false))
                                .with_turn_id(&turn.turn_id),
                        )
                        .await;
                        self.send(
                            Envelope::new(OutboundEvent::End {
                                reason: EndReason::Error,
                            })
                            .with_turn_id(&turn.turn_id),
                        )
                        .await;
                        TurnOutcome::Failed { code }
                    }
                };
                self.finish_turn(turn.turn_id, outcome).await
            }
        }
    }

    /// Rebuild the conversation from the pre-turn snapshot.
    fn restore(&mut self, history: History, removed: u64) {
        self.conversation = Some(Conversation {
            history,
            context: self.deps.context_manager(removed),
        });
    }

    async fn finish_turn(&mut self, turn_id: String, outcome: TurnOutcome) -> ControlFlow<CloseReason> {
        if let TurnOutcome::AwaitingInput(pending) = outcome {
            self.suspended = Some(SuspendedTurn { turn_id, pending });
            return ControlFlow::Continue(());
        }

        self.turns += 1;
        let iterations = match outcome {
            TurnOutcome::Completed { iterations } => iterations,
            _ => 0,
        };
        self.deps.event_bus.publish(DomainEvent::TurnCompleted {
            session_id: self.id.clone(),
            turn_id,
            outcome: outcome.label().to_string(),
            iterations,
            timestamp: Utc::now(),
        });
        let turns = self.turns;
        self.registration.update(|s| {
            s.turns = turns;
            s.turn_in_flight = false;
        });
        self.persist().await;

        if self.shutting_down {
            return ControlFlow::Break(CloseReason::ServerShutdown);
        }
        if let Some(next) = self.queue.pop_front() {
            self.start_turn(next).await;
        }
        ControlFlow::Continue(())
    }

    /// End a suspended turn without resuming it. The history was never
    /// touched, so only the terminal event is owed.
    async fn end_suspended(&mut self, suspended: SuspendedTurn) -> ControlFlow<CloseReason> {
        self.send(
            Envelope::new(OutboundEvent::End {
                reason: EndReason::Cancelled,
            })
            .with_turn_id(&suspended.turn_id),
        )
        .await;
        self.finish_turn(suspended.turn_id, TurnOutcome::Cancelled)
            .await
    }

    async fn persist(&self) {
        let (Some(repository), Some(conversation)) =
            (&self.deps.repository, self.conversation.as_ref())
        else {
            return;
        };
        let removed = conversation.context.removed_message_count();
        if let Err(e) = repository
            .save(&self.id, &conversation.history, removed)
            .await
        {
            warn!(session_id = %self.id, error = %e, "Failed to save session history");
        }
    }

    // ── timers ────────────────────────────────────────────────────────────

    fn next_heartbeat(&self) -> Option<Instant> {
        let heartbeat = &self.deps.config.heartbeat;
        if !heartbeat.enabled {
            return None;
        }
        Some(
            self.awaiting_pong
                .unwrap_or(self.last_inbound + heartbeat.interval()),
        )
    }

    async fn on_heartbeat(&mut self) -> ControlFlow<CloseReason> {
        if self.awaiting_pong.is_some() {
            let timeout = self.deps.config.heartbeat.timeout();
            warn!(session_id = %self.id, "Heartbeat not answered, closing");
            let e = SessionError::HeartbeatTimeout(timeout.as_millis() as u64);
            self.send_now(Envelope::new(OutboundEvent::error(e.code(), e.to_string(), false)));
            return ControlFlow::Break(CloseReason::HeartbeatTimeout);
        }
        self.send(Envelope::new(OutboundEvent::Ping)).await;
        self.awaiting_pong = Some(Instant::now() + self.deps.config.heartbeat.timeout());
        ControlFlow::Continue(())
    }

    async fn begin_shutdown(&mut self) -> ControlFlow<CloseReason> {
        self.shutting_down = true;
        self.queue.clear();
        let grace = self.deps.config.session.shutdown_grace();
        info!(session_id = %self.id, grace_ms = grace.as_millis() as u64, "Server shutdown, draining session");
        self.send(Envelope::new(OutboundEvent::ServerShutdown {
            grace_ms: grace.as_millis() as u64,
        }))
        .await;

        if self.active.is_none() && self.suspended.is_none() {
            return ControlFlow::Break(CloseReason::ServerShutdown);
        }
        self.grace_deadline = Some(Instant::now() + grace);
        ControlFlow::Continue(())
    }

    async fn force_shutdown(&mut self) -> ControlFlow<CloseReason> {
        self.grace_deadline = None;
        if let Some(turn) = self.active.as_mut() {
            warn!(session_id = %self.id, turn_id = %turn.turn_id, "Shutdown grace expired, cancelling turn");
            turn.cancel_requested = true;
            turn.control.cancel();
            return ControlFlow::Continue(());
        }
        if let Some(suspended) = self.suspended.take() {
            return self.end_suspended(suspended).await;
        }
        ControlFlow::Break(CloseReason::ServerShutdown)
    }

    // ── close ─────────────────────────────────────────────────────────────

    async fn close(mut self, reason: CloseReason) -> SessionSummary {
        if let Err(e) = self.state.transition(SessionState::Closing) {
            error!(session_id = %self.id, "{e}");
        }
        self.registration.update(|s| s.state = SessionState::Closing);

        if let Some(turn) = self.active.take() {
            self.wind_down(turn).await;
        }
        if let Some(suspended) = self.suspended.take() {
            self.send_now(
                Envelope::new(OutboundEvent::End {
                    reason: EndReason::Cancelled,
                })
                .with_turn_id(&suspended.turn_id),
            );
            self.turns += 1;
        }
        self.persist().await;

        if let Err(e) = self.state.transition(SessionState::Closed) {
            error!(session_id = %self.id, "{e}");
        }
        self.deps.event_bus.publish(DomainEvent::SessionClosed {
            session_id: self.id.clone(),
            reason: reason.to_string(),
            turns: self.turns,
            timestamp: Utc::now(),
        });
        if reason.is_abnormal() {
            warn!(session_id = %self.id, %reason, turns = self.turns, "Session closed abnormally");
        } else {
            info!(session_id = %self.id, %reason, turns = self.turns, "Session closed");
        }

        SessionSummary {
            session_id: self.id.clone(),
            reason,
            turns: self.turns,
            messages: self.history_len(),
        }
    }

    /// Cancel the turn in flight and take the conversation back. Events are
    /// drained so the turn never blocks on a full queue; only its `end` is
    /// passed on.
    async fn wind_down(&mut self, mut turn: ActiveTurn) {
        turn.control.cancel();
        let joined = loop {
            tokio::select! {
                biased;
                Some(event) = turn.events.recv() => {
                    if matches!(event, TurnEvent::End { .. }) {
                        self.send_now(
                            Envelope::new(OutboundEvent::from(event)).with_turn_id(&turn.turn_id),
                        );
                    }
                }
                joined = &mut turn.task => break joined,
            }
        };
        while let Ok(event) = turn.events.try_recv() {
            if matches!(event, TurnEvent::End { .. }) {
                self.send_now(Envelope::new(OutboundEvent::from(event)).with_turn_id(&turn.turn_id));
            }
        }
        match joined {
            Ok((_, conversation)) => self.conversation = Some(conversation),
            Err(e) => {
                error!(session_id = %self.id, "Turn task failed while closing: {e}");
                self.restore(turn.snapshot, turn.removed);
            }
        }
        self.turns += 1;
    }
}

//! The turn loop: one user message in, a stream of turn events out.
//!
//! Each iteration calls the model, streams its text, dispatches any tool
//! invocations through the executor, appends the results to the history, and
//! loops until the model answers without tools. Client-side tools suspend the
//! turn with a [`PendingInput`] that the session resolves and hands back to
//! [`TurnLoop::resume`].

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use agentwire_config::{AppConfig, ManagementCadence};
use agentwire_core::control::{Cancelled, TurnControl};
use agentwire_core::envelope::EndReason;
use agentwire_core::error::{ErrorCode, ModelError};
use agentwire_core::event::{DomainEvent, EventBus};
use agentwire_core::history::History;
use agentwire_core::message::Message;
use agentwire_core::model::{ModelClient, ModelEvent, ModelRequest, Usage};
use agentwire_core::tool::{ToolInvocationRequest, ToolLocation, ToolRegistry, ToolResult};
use agentwire_tools::{ExecutionEvent, ToolExecutor};

use crate::context::ContextManager;
use crate::resilience::{CircuitBreaker, RateLimiter, RetryPolicy};
use crate::stream_event::{TurnEvent, TurnSink};

/// How a turn ended.
#[derive(Debug)]
pub enum TurnOutcome {
    Completed { iterations: u32 },
    Cancelled,
    Failed { code: ErrorCode },
    /// Suspended on client-side tools. No `end` has been sent yet.
    AwaitingInput(PendingInput),
}

impl TurnOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            TurnOutcome::Completed { .. } => "complete",
            TurnOutcome::Cancelled => "cancelled",
            TurnOutcome::Failed { .. } => "error",
            TurnOutcome::AwaitingInput(_) => "awaiting_input",
        }
    }
}

/// A model response whose tool invocations are not all answered yet.
///
/// Nothing of the response is in the history until every invocation has a
/// result; then the tool use and all results are appended together, in the
/// order the model asked for them.
#[derive(Debug, Clone)]
pub struct PendingInput {
    iteration: u32,
    text: String,
    requests: Vec<ToolInvocationRequest>,
    results: HashMap<String, ToolResult>,
}

impl PendingInput {
    fn new(
        iteration: u32,
        text: String,
        requests: Vec<ToolInvocationRequest>,
        local_results: Vec<ToolResult>,
    ) -> Self {
        let results = local_results
            .into_iter()
            .map(|r| (r.tool_call_id.clone(), r))
            .collect();
        Self {
            iteration,
            text,
            requests,
            results,
        }
    }

    /// Invocations still waiting for a client result, in request order.
    pub fn awaiting(&self) -> Vec<&ToolInvocationRequest> {
        self.requests
            .iter()
            .filter(|r| !self.results.contains_key(&r.tool_call_id))
            .collect()
    }

    pub fn is_awaiting(&self, tool_call_id: &str) -> bool {
        self.requests.iter().any(|r| r.tool_call_id == tool_call_id)
            && !self.results.contains_key(tool_call_id)
    }

    /// Record a client result. Hands the result back if nothing is waiting
    /// on its id.
    pub fn resolve(&mut self, result: ToolResult) -> Result<(), ToolResult> {
        if !self.is_awaiting(&result.tool_call_id) {
            return Err(result);
        }
        self.results.insert(result.tool_call_id.clone(), result);
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.requests
            .iter()
            .all(|r| self.results.contains_key(&r.tool_call_id))
    }
}

/// What a turn borrows from its session.
pub struct TurnContext<'a> {
    pub turn_id: &'a str,
    pub history: &'a mut History,
    pub context: &'a mut dyn ContextManager,
    pub control: &'a TurnControl,
}

#[derive(Debug, Default)]
struct ModelResponse {
    text: String,
    tool_calls: Vec<ToolInvocationRequest>,
    usage: Option<Usage>,
}

enum StreamFailure {
    Cancelled { partial: String },
    Model { error: ModelError, emitted: bool },
}

enum CallFailure {
    Cancelled { partial: String },
    Fatal { code: ErrorCode, message: String },
}

/// The model/tool loop for a session's turns.
pub struct TurnLoop {
    model: Arc<dyn ModelClient>,
    tools: Arc<ToolRegistry>,
    executor: Arc<dyn ToolExecutor>,
    event_bus: Arc<EventBus>,
    max_iterations: u32,
    model_timeout: Duration,
    retry: RetryPolicy,
    rate_limiter: Option<Arc<RateLimiter>>,
    breaker: Option<Arc<CircuitBreaker>>,
    cadence: ManagementCadence,
}

impl TurnLoop {
    pub fn new(
        model: Arc<dyn ModelClient>,
        tools: Arc<ToolRegistry>,
        executor: Arc<dyn ToolExecutor>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            model,
            tools,
            executor,
            event_bus,
            max_iterations: 25,
            model_timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
            rate_limiter: None,
            breaker: None,
            cadence: ManagementCadence::Disabled,
        }
    }

    /// Apply limits, retry policy, and cadence from configuration. The rate
    /// limiter and breaker are shared objects and are set separately.
    pub fn configured(self, config: &AppConfig) -> Self {
        self.with_max_iterations(config.model.max_iterations)
            .with_model_timeout(config.model.timeout())
            .with_retry_policy(RetryPolicy::from_config(&config.retry))
            .with_cadence(config.context.cadence)
    }

    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max.max(1);
        self
    }

    pub fn with_model_timeout(mut self, timeout: Duration) -> Self {
        self.model_timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Also run context management after loop iterations.
    pub fn with_cadence(mut self, cadence: ManagementCadence) -> Self {
        self.cadence = cadence;
        self
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    /// Run a turn for a new user message.
    pub async fn run_turn(
        &self,
        user_message: Message,
        mut ctx: TurnContext<'_>,
        sink: TurnSink,
    ) -> TurnOutcome {
        info!(turn_id = %ctx.turn_id, history = ctx.history.len(), "Turn started");
        ctx.history.push(user_message);
        self.drive(&mut ctx, sink, 0).await
    }

    /// Continue a turn once every pending invocation has a result.
    pub async fn resume(
        &self,
        pending: PendingInput,
        mut ctx: TurnContext<'_>,
        sink: TurnSink,
    ) -> TurnOutcome {
        if !pending.is_complete() {
            return TurnOutcome::AwaitingInput(pending);
        }
        if ctx.control.is_cancelled() {
            return self.cancel(&mut ctx, sink, "").await;
        }
        debug!(turn_id = %ctx.turn_id, "Resuming turn with client tool results");

        let PendingInput {
            iteration,
            text,
            requests,
            mut results,
        } = pending;
        commit(ctx.history, text, &requests, &mut results);
        self.after_iteration(&mut ctx, iteration, false).await;
        self.drive(&mut ctx, sink, iteration).await
    }

    async fn drive(
        &self,
        ctx: &mut TurnContext<'_>,
        sink: TurnSink,
        mut iteration: u32,
    ) -> TurnOutcome {
        loop {
            if iteration >= self.max_iterations {
                let message = format!(
                    "Turn stopped after {} model calls without a final answer",
                    self.max_iterations
                );
                return self.fail(ctx, sink, ErrorCode::MaxIterations, message).await;
            }
            iteration += 1;
            debug!(turn_id = %ctx.turn_id, iteration, "Turn loop iteration");

            if ctx.control.checkpoint().await.is_err() {
                return self.cancel(ctx, sink, "").await;
            }

            let (response, reactive) = match self.call_model(ctx, &sink).await {
                Ok(r) => r,
                Err(CallFailure::Cancelled { partial }) => {
                    return self.cancel(ctx, sink, &partial).await;
                }
                Err(CallFailure::Fatal { code, message }) => {
                    return self.fail(ctx, sink, code, message).await;
                }
            };
            if let Some(usage) = response.usage {
                debug!(
                    input_tokens = usage.input_tokens,
                    output_tokens = usage.output_tokens,
                    "Model usage"
                );
            }

            if response.tool_calls.is_empty() {
                if !response.text.is_empty() {
                    ctx.history.push(Message::assistant(response.text));
                }
                self.manage(ctx).await;
                info!(turn_id = %ctx.turn_id, iterations = iteration, "Turn completed");
                sink.finish(EndReason::Complete).await;
                return TurnOutcome::Completed {
                    iterations: iteration,
                };
            }

            for request in &response.tool_calls {
                if ctx.control.checkpoint().await.is_err() {
                    return self.cancel(ctx, sink, &response.text).await;
                }
                sink.emit(TurnEvent::ToolUse(request.clone())).await;
            }

            let (client, local): (Vec<_>, Vec<_>) = response
                .tool_calls
                .iter()
                .cloned()
                .partition(|r| self.tools.location(&r.tool_name) == ToolLocation::Client);

            let local_results = if local.is_empty() {
                Vec::new()
            } else {
                match self.dispatch(local, ctx.control, &sink).await {
                    Ok(results) => results,
                    Err(Cancelled) => return self.cancel(ctx, sink, &response.text).await,
                }
            };

            if !client.is_empty() {
                info!(
                    turn_id = %ctx.turn_id,
                    pending = client.len(),
                    "Turn awaiting client tool results"
                );
                sink.emit(TurnEvent::AwaitingInput { requests: client }).await;
                return TurnOutcome::AwaitingInput(PendingInput::new(
                    iteration,
                    response.text,
                    response.tool_calls,
                    local_results,
                ));
            }

            let mut results = local_results
                .into_iter()
                .map(|r| (r.tool_call_id.clone(), r))
                .collect();
            commit(ctx.history, response.text, &response.tool_calls, &mut results);
            self.after_iteration(ctx, iteration, reactive).await;
        }
    }

    /// One model call with retries and reactive context reduction. Returns
    /// the response and whether the context was reduced along the way.
    async fn call_model(
        &self,
        ctx: &mut TurnContext<'_>,
        sink: &TurnSink,
    ) -> Result<(ModelResponse, bool), CallFailure> {
        let definitions = self.tools.definitions();
        let max_attempts = self.retry.max_attempts;
        let mut attempt = 1;
        let mut reactive = false;

        loop {
            if let Some(breaker) = &self.breaker {
                if let Err(e) = breaker.check() {
                    return Err(CallFailure::Fatal {
                        code: e.code(),
                        message: e.to_string(),
                    });
                }
            }
            if let Some(limiter) = &self.rate_limiter {
                tokio::select! {
                    biased;
                    _ = ctx.control.cancelled() => {
                        return Err(CallFailure::Cancelled { partial: String::new() });
                    }
                    _ = limiter.acquire() => {}
                }
            }

            let request = ModelRequest {
                messages: ctx.history.messages().to_vec(),
                tools: definitions.clone(),
            };
            let error = match self.stream_model(request, ctx.control, sink).await {
                Ok(response) => {
                    if let Some(breaker) = &self.breaker {
                        breaker.record_success();
                    }
                    return Ok((response, reactive));
                }
                Err(StreamFailure::Cancelled { partial }) => {
                    return Err(CallFailure::Cancelled { partial });
                }
                Err(StreamFailure::Model { error, emitted }) => {
                    if let (Some(breaker), false) = (
                        &self.breaker,
                        matches!(error, ModelError::ContextOverflow { .. }),
                    ) {
                        breaker.record_failure();
                    }
                    if emitted || attempt >= max_attempts {
                        return Err(self.fatal(ctx, error));
                    }
                    error
                }
            };

            match &error {
                ModelError::RateLimited { retry_after_ms } => {
                    let delay = self
                        .retry
                        .delay_for(attempt, retry_after_ms.map(Duration::from_millis));
                    attempt += 1;
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Model rate limited, retrying"
                    );
                    sink.emit(TurnEvent::Retry {
                        attempt,
                        max_attempts,
                        reason: error.to_string(),
                        delay_ms: delay.as_millis() as u64,
                    })
                    .await;
                    tokio::select! {
                        biased;
                        _ = ctx.control.cancelled() => {
                            return Err(CallFailure::Cancelled { partial: String::new() });
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                ModelError::ContextOverflow { .. } => {
                    let before = ctx.history.len();
                    if let Err(e) = ctx.context.reduce_context(ctx.history, Some(&error)).await {
                        warn!(error = %e, "Context reduction failed");
                        return Err(CallFailure::Fatal {
                            code: ErrorCode::ContextExhausted,
                            message: format!("{error}; {e}"),
                        });
                    }
                    reactive = true;
                    self.publish_reduction(ctx, before);
                    attempt += 1;
                    warn!(
                        attempt,
                        max_attempts,
                        remaining = ctx.history.len(),
                        "Context overflow, reduced history and retrying"
                    );
                    sink.emit(TurnEvent::Retry {
                        attempt,
                        max_attempts,
                        reason: error.to_string(),
                        delay_ms: 0,
                    })
                    .await;
                }
                _ => return Err(self.fatal(ctx, error)),
            }
        }
    }

    fn fatal(&self, ctx: &TurnContext<'_>, error: ModelError) -> CallFailure {
        let code = error.code();
        debug!(turn_id = %ctx.turn_id, %code, "Model call failed");
        CallFailure::Fatal {
            code,
            message: error.to_string(),
        }
    }

    /// Stream one model response, forwarding text as it arrives. The timeout
    /// covers the whole call but not time spent paused.
    async fn stream_model(
        &self,
        request: ModelRequest,
        control: &TurnControl,
        sink: &TurnSink,
    ) -> Result<ModelResponse, StreamFailure> {
        let mut deadline = Instant::now() + self.model_timeout;
        let timed_out = || ModelError::Timeout(format!("no response within {:?}", self.model_timeout));

        let invoked = tokio::select! {
            biased;
            _ = control.cancelled() => {
                return Err(StreamFailure::Cancelled { partial: String::new() });
            }
            invoked = tokio::time::timeout_at(deadline, self.model.invoke(request)) => invoked,
        };
        let mut stream = match invoked {
            Err(_) => {
                return Err(StreamFailure::Model {
                    error: timed_out(),
                    emitted: false,
                });
            }
            Ok(Err(error)) => return Err(StreamFailure::Model { error, emitted: false }),
            Ok(Ok(stream)) => stream,
        };

        let mut response = ModelResponse::default();
        loop {
            let next = tokio::select! {
                biased;
                _ = control.cancelled() => {
                    return Err(StreamFailure::Cancelled { partial: response.text });
                }
                next = tokio::time::timeout_at(deadline, stream.recv()) => next,
            };
            let event = match next {
                Err(_) => {
                    return Err(StreamFailure::Model {
                        error: timed_out(),
                        emitted: !response.text.is_empty(),
                    });
                }
                Ok(None) => break,
                Ok(Some(Err(error))) => {
                    return Err(StreamFailure::Model {
                        error,
                        emitted: !response.text.is_empty(),
                    });
                }
                Ok(Some(Ok(event))) => event,
            };

            match event {
                ModelEvent::ContentDelta(delta) => {
                    if delta.is_empty() {
                        continue;
                    }
                    match control.checkpoint().await {
                        Ok(paused) => deadline += paused,
                        Err(Cancelled) => {
                            return Err(StreamFailure::Cancelled { partial: response.text });
                        }
                    }
                    sink.emit(TurnEvent::Content {
                        data: delta.clone(),
                    })
                    .await;
                    response.text.push_str(&delta);
                }
                ModelEvent::ToolCall(request) => response.tool_calls.push(request),
                ModelEvent::Done { usage } => {
                    response.usage = usage;
                    break;
                }
            }
        }
        Ok(response)
    }

    /// Run local tools on a detached task, forwarding progress and results.
    /// On cancel the task is left to finish the tools already running; the
    /// executor starts no new ones.
    async fn dispatch(
        &self,
        requests: Vec<ToolInvocationRequest>,
        control: &TurnControl,
        sink: &TurnSink,
    ) -> Result<Vec<ToolResult>, Cancelled> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let executor = self.executor.clone();
        let registry = self.tools.clone();
        let batch = requests.clone();
        let gate = control.clone();
        debug!(
            count = requests.len(),
            executor = executor.name(),
            "Dispatching tool invocations"
        );
        let mut handle =
            tokio::spawn(async move { executor.execute(&batch, &registry, &gate, &tx).await });

        let joined = loop {
            tokio::select! {
                biased;
                _ = control.cancelled() => {
                    debug!("Turn cancelled during tool execution");
                    return Err(Cancelled);
                }
                Some(event) = rx.recv() => self.forward(event, control, sink).await?,
                joined = &mut handle => break joined,
            }
        };
        while let Some(event) = rx.recv().await {
            self.forward(event, control, sink).await?;
        }

        match joined {
            Ok(results) => Ok(results),
            Err(e) => {
                error!(error = %e, "Tool executor task failed");
                let results: Vec<_> = requests
                    .iter()
                    .map(|r| ToolResult::error(&r.tool_call_id, format!("Tool executor failed: {e}")))
                    .collect();
                for result in &results {
                    sink.emit(TurnEvent::ToolResult(result.clone())).await;
                }
                Ok(results)
            }
        }
    }

    async fn forward(
        &self,
        event: ExecutionEvent,
        control: &TurnControl,
        sink: &TurnSink,
    ) -> Result<(), Cancelled> {
        match event {
            ExecutionEvent::Started { .. } => {}
            ExecutionEvent::Progress(progress) => {
                control.checkpoint().await?;
                sink.emit(TurnEvent::Progress(progress)).await;
            }
            ExecutionEvent::Finished {
                tool_name,
                result,
                duration_ms,
            } => {
                self.event_bus.publish(DomainEvent::ToolExecuted {
                    tool_name,
                    success: !result.is_error(),
                    duration_ms,
                    timestamp: Utc::now(),
                });
                control.checkpoint().await?;
                sink.emit(TurnEvent::ToolResult(result)).await;
            }
        }
        Ok(())
    }

    /// Per-iteration management. Skipped when the iteration already reduced
    /// reactively.
    async fn after_iteration(&self, ctx: &mut TurnContext<'_>, iteration: u32, reactive: bool) {
        if !reactive && self.cadence.fires_after(iteration) {
            self.manage(ctx).await;
        }
    }

    async fn manage(&self, ctx: &mut TurnContext<'_>) {
        let before = ctx.history.len();
        ctx.context.apply_management(ctx.history).await;
        self.publish_reduction(ctx, before);
    }

    fn publish_reduction(&self, ctx: &TurnContext<'_>, before: usize) {
        let after = ctx.history.len();
        if after != before {
            debug!(
                strategy = ctx.context.name(),
                before, after, "Context reduced"
            );
            self.event_bus.publish(DomainEvent::ContextReduced {
                strategy: ctx.context.name().to_string(),
                before,
                after,
                timestamp: Utc::now(),
            });
        }
    }

    /// Partial text already streamed stays in the history, marked cancelled.
    /// Unanswered tool invocations are dropped.
    async fn cancel(&self, ctx: &mut TurnContext<'_>, sink: TurnSink, partial: &str) -> TurnOutcome {
        if !partial.is_empty() {
            ctx.history.push(
                Message::assistant(partial).with_metadata("cancelled", serde_json::Value::Bool(true)),
            );
        }
        self.manage(ctx).await;
        info!(turn_id = %ctx.turn_id, "Turn cancelled");
        sink.finish(EndReason::Cancelled).await;
        TurnOutcome::Cancelled
    }

    async fn fail(
        &self,
        ctx: &mut TurnContext<'_>,
        sink: TurnSink,
        code: ErrorCode,
        message: String,
    ) -> TurnOutcome {
        error!(turn_id = %ctx.turn_id, %code, "Turn failed: {message}");
        self.event_bus.publish(DomainEvent::ErrorOccurred {
            context: format!("turn {}", ctx.turn_id),
            error_message: message.clone(),
            timestamp: Utc::now(),
        });
        self.manage(ctx).await;
        sink.emit(TurnEvent::Error {
            code,
            message,
            recoverable: false,
        })
        .await;
        sink.finish(EndReason::Error).await;
        TurnOutcome::Failed { code }
    }
}

/// Append a tool use and its results, in request order.
fn commit(
    history: &mut History,
    text: String,
    requests: &[ToolInvocationRequest],
    results: &mut HashMap<String, ToolResult>,
) {
    history.push(Message::tool_use(text, requests));
    for request in requests {
        let result = results.remove(&request.tool_call_id).unwrap_or_else(|| {
            ToolResult::error(&request.tool_call_id, "No result was produced")
        });
        history.push(Message::tool_result(&result));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{NullContextManager, SlidingWindowManager};
    use crate::test_helpers::{ScriptedModel, Step};
    use agentwire_core::message::ResultBlock;
    use agentwire_core::tool::ToolStatus;
    use agentwire_tools::{ConcurrentExecutor, FnTool, SequentialExecutor};
    use async_trait::async_trait;
    use serde_json::{Value, json};

    fn registry() -> Arc<ToolRegistry> {
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(FnTool::new(
            "sleep",
            "Sleep for ms milliseconds",
            json!({"type": "object"}),
            |input: Value, _| async move {
                let ms = input["ms"].as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(vec![ResultBlock::text(format!("slept {ms}"))])
            },
        )));
        tools.register(Arc::new(FnTool::new(
            "fail",
            "Always fails",
            json!({"type": "object"}),
            |_: Value, _| async move {
                Err(agentwire_core::error::ToolError::ExecutionFailed {
                    tool_name: "fail".into(),
                    reason: "disk full".into(),
                })
            },
        )));
        tools.register(Arc::new(FnTool::client(
            "confirm",
            "Ask the user",
            json!({"type": "object"}),
        )));
        Arc::new(tools)
    }

    fn turn_loop(model: Arc<ScriptedModel>) -> TurnLoop {
        TurnLoop::new(
            model,
            registry(),
            Arc::new(ConcurrentExecutor::new(Duration::from_secs(30))),
            Arc::new(EventBus::default()),
        )
        .with_retry_policy(RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            multiplier: 2.0,
        })
    }

    async fn run(
        turn_loop: &TurnLoop,
        history: &mut History,
        context: &mut dyn ContextManager,
        text: &str,
    ) -> (TurnOutcome, Vec<TurnEvent>) {
        let (tx, mut rx) = mpsc::channel(256);
        let control = TurnControl::new(false);
        let ctx = TurnContext {
            turn_id: "t1",
            history,
            context,
            control: &control,
        };
        let outcome = turn_loop
            .run_turn(Message::user(text), ctx, TurnSink::new(tx))
            .await;
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (outcome, events)
    }

    fn types(events: &[TurnEvent]) -> Vec<&'static str> {
        events.iter().map(TurnEvent::event_type).collect()
    }

    #[tokio::test]
    async fn text_only_turn_streams_and_completes() {
        let model = Arc::new(ScriptedModel::chunks(&["The answer", " is 4."]));
        let tl = turn_loop(model.clone());
        let mut history = History::new();
        let mut context = NullContextManager::new();

        let (outcome, events) = run(&tl, &mut history, &mut context, "What is 2+2?").await;

        assert!(matches!(outcome, TurnOutcome::Completed { iterations: 1 }));
        assert_eq!(types(&events), vec!["content", "content", "end"]);
        assert_eq!(
            events.last(),
            Some(&TurnEvent::End {
                reason: EndReason::Complete
            })
        );
        assert_eq!(history.len(), 2);
        assert_eq!(history.messages()[1].text(), "The answer is 4.");
        assert_eq!(model.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_tools_then_answer() {
        let model = Arc::new(ScriptedModel::new(vec![
            vec![
                Step::call("a", "sleep", json!({"ms": 200})),
                Step::call("b", "sleep", json!({"ms": 100})),
            ],
            vec![Step::text("done")],
        ]));
        let tl = turn_loop(model.clone());
        let mut history = History::new();
        let mut context = NullContextManager::new();

        let started = Instant::now();
        let (outcome, events) = run(&tl, &mut history, &mut context, "go").await;
        let elapsed = started.elapsed();

        assert!(matches!(outcome, TurnOutcome::Completed { iterations: 2 }));
        assert_eq!(
            types(&events),
            vec!["tool_use", "tool_use", "tool_result", "tool_result", "content", "end"]
        );
        // b finishes first
        match &events[2] {
            TurnEvent::ToolResult(r) => assert_eq!(r.tool_call_id, "b"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(elapsed < Duration::from_millis(300), "took {elapsed:?}");

        // user, tool use, result a, result b, answer
        assert_eq!(history.len(), 5);
        assert!(history.is_well_paired());
        assert_eq!(history.messages()[2].content.len(), 1);
        let second_request = &model.requests()[1];
        assert_eq!(second_request.messages.len(), 4);
    }

    #[tokio::test]
    async fn failing_tool_does_not_abort_siblings() {
        let model = Arc::new(ScriptedModel::new(vec![
            vec![
                Step::call("a", "fail", json!({})),
                Step::call("b", "sleep", json!({"ms": 0})),
                Step::call("c", "nope", json!({})),
            ],
            vec![Step::text("handled")],
        ]));
        let tl = turn_loop(model);
        let mut history = History::new();
        let mut context = NullContextManager::new();

        let (outcome, events) = run(&tl, &mut history, &mut context, "go").await;
        assert!(matches!(outcome, TurnOutcome::Completed { .. }));

        let results: HashMap<_, _> = events
            .iter()
            .filter_map(|e| match e {
                TurnEvent::ToolResult(r) => Some((r.tool_call_id.clone(), r.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(results.len(), 3);
        assert_eq!(results["a"].status, ToolStatus::Error);
        assert_eq!(results["b"].status, ToolStatus::Success);
        assert!(results["c"].output_text().contains("Tool not found"));
        assert!(history.is_well_paired());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_is_retried_with_backoff() {
        let model = Arc::new(ScriptedModel::new(vec![
            vec![Step::Reject(ModelError::RateLimited {
                retry_after_ms: Some(2000),
            })],
            vec![Step::text("ok")],
        ]));
        let tl = turn_loop(model.clone());
        let mut history = History::new();
        let mut context = NullContextManager::new();

        let started = Instant::now();
        let (outcome, events) = run(&tl, &mut history, &mut context, "hi").await;

        assert!(matches!(outcome, TurnOutcome::Completed { .. }));
        assert_eq!(types(&events), vec!["retry", "content", "end"]);
        match &events[0] {
            TurnEvent::Retry {
                attempt, delay_ms, ..
            } => {
                assert_eq!(*attempt, 2);
                assert_eq!(*delay_ms, 2000);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(model.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_exhaustion_fails_the_turn() {
        let limited = || {
            vec![Step::Reject(ModelError::RateLimited {
                retry_after_ms: None,
            })]
        };
        let model = Arc::new(ScriptedModel::new(vec![limited(), limited(), limited()]));
        let tl = turn_loop(model.clone());
        let mut history = History::new();
        let mut context = NullContextManager::new();

        let (outcome, events) = run(&tl, &mut history, &mut context, "hi").await;

        assert!(matches!(
            outcome,
            TurnOutcome::Failed {
                code: ErrorCode::RateLimited
            }
        ));
        assert_eq!(types(&events), vec!["retry", "retry", "error", "end"]);
        assert_eq!(model.call_count(), 3);
    }

    #[tokio::test]
    async fn no_retry_after_content_was_streamed() {
        let model = Arc::new(ScriptedModel::new(vec![
            vec![
                Step::text("partial"),
                Step::Fail(ModelError::RateLimited {
                    retry_after_ms: None,
                }),
            ],
            vec![Step::text("never")],
        ]));
        let tl = turn_loop(model.clone());
        let mut history = History::new();
        let mut context = NullContextManager::new();

        let (outcome, events) = run(&tl, &mut history, &mut context, "hi").await;
        assert!(matches!(outcome, TurnOutcome::Failed { .. }));
        assert_eq!(types(&events), vec!["content", "error", "end"]);
        assert_eq!(model.call_count(), 1);
        // partial text of a failed turn is not kept
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn overflow_reduces_context_and_retries() {
        let model = Arc::new(ScriptedModel::new(vec![
            vec![Step::Reject(ModelError::ContextOverflow {
                message: "too long".into(),
                excess_tokens: None,
            })],
            vec![Step::text("fits now")],
        ]));
        let tl = turn_loop(model.clone());
        let mut history = History::new();
        for i in 0..10 {
            history.push(Message::user(format!("old {i}")));
        }
        let mut context = SlidingWindowManager::new(6);

        let (outcome, events) = run(&tl, &mut history, &mut context, "new").await;

        assert!(matches!(outcome, TurnOutcome::Completed { .. }));
        assert_eq!(types(&events), vec!["retry", "content", "end"]);
        let requests = model.requests();
        assert_eq!(requests[0].messages.len(), 11);
        assert!(requests[1].messages.len() < 11);
        assert_eq!(requests[1].messages.last().map(|m| m.text()).as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn overflow_without_reduction_is_context_exhausted() {
        let model = Arc::new(ScriptedModel::new(vec![vec![Step::Reject(
            ModelError::ContextOverflow {
                message: "too long".into(),
                excess_tokens: Some(500),
            },
        )]]));
        let tl = turn_loop(model);
        let mut history = History::new();
        let mut context = NullContextManager::new();

        let (outcome, events) = run(&tl, &mut history, &mut context, "hi").await;
        assert!(matches!(
            outcome,
            TurnOutcome::Failed {
                code: ErrorCode::ContextExhausted
            }
        ));
        assert_eq!(types(&events), vec!["error", "end"]);
    }

    #[tokio::test]
    async fn iteration_ceiling_ends_with_error() {
        let looping = |id: &str| vec![Step::call(id, "sleep", json!({"ms": 0}))];
        let model = Arc::new(ScriptedModel::new(vec![
            looping("1"),
            looping("2"),
            looping("3"),
        ]));
        let tl = turn_loop(model.clone()).with_max_iterations(2);
        let mut history = History::new();
        let mut context = NullContextManager::new();

        let (outcome, events) = run(&tl, &mut history, &mut context, "loop").await;

        assert!(matches!(
            outcome,
            TurnOutcome::Failed {
                code: ErrorCode::MaxIterations
            }
        ));
        assert_eq!(model.call_count(), 2);
        let tail: Vec<_> = types(&events).into_iter().rev().take(2).collect();
        assert_eq!(tail, vec!["end", "error"]);
        assert!(history.is_well_paired());
    }

    #[tokio::test(start_paused = true)]
    async fn model_timeout_is_terminal() {
        let model = Arc::new(ScriptedModel::new(vec![vec![
            Step::text("thinking"),
            Step::sleep_ms(3_600_000),
        ]]));
        let tl = turn_loop(model).with_model_timeout(Duration::from_secs(5));
        let mut history = History::new();
        let mut context = NullContextManager::new();

        let (outcome, events) = run(&tl, &mut history, &mut context, "hi").await;
        assert!(matches!(
            outcome,
            TurnOutcome::Failed {
                code: ErrorCode::ModelTimeout
            }
        ));
        assert_eq!(types(&events), vec!["content", "error", "end"]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_mid_stream_keeps_partial_text() {
        let model = Arc::new(ScriptedModel::new(vec![vec![
            Step::text("first"),
            Step::sleep_ms(1000),
            Step::text("second"),
        ]]));
        let tl = Arc::new(turn_loop(model));
        let control = TurnControl::new(false);
        let (tx, mut rx) = mpsc::channel(64);

        let task = {
            let tl = tl.clone();
            let control = control.clone();
            tokio::spawn(async move {
                let mut history = History::new();
                let mut context = NullContextManager::new();
                let ctx = TurnContext {
                    turn_id: "t1",
                    history: &mut history,
                    context: &mut context,
                    control: &control,
                };
                let outcome = tl.run_turn(Message::user("hi"), ctx, TurnSink::new(tx)).await;
                (outcome, history)
            })
        };

        assert_eq!(rx.recv().await.unwrap().event_type(), "content");
        control.cancel();
        assert_eq!(
            rx.recv().await,
            Some(TurnEvent::End {
                reason: EndReason::Cancelled
            })
        );
        assert!(rx.recv().await.is_none());

        let (outcome, history) = task.await.unwrap();
        assert!(matches!(outcome, TurnOutcome::Cancelled));
        assert_eq!(history.len(), 2);
        assert_eq!(history.messages()[1].text(), "first");
        assert_eq!(history.messages()[1].metadata["cancelled"], true);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_sequential_tools_starts_no_more_tools() {
        let starts = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut tools = ToolRegistry::new();
        for name in ["screenshot", "email"] {
            let starts = starts.clone();
            tools.register(Arc::new(FnTool::new(
                name,
                "Records that it ran",
                json!({"type": "object"}),
                move |_: Value, _| {
                    let starts = starts.clone();
                    async move {
                        starts.lock().unwrap().push(name);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(vec![ResultBlock::text(format!("{name} done"))])
                    }
                },
            )));
        }
        let model = Arc::new(ScriptedModel::new(vec![vec![
            Step::call("c1", "screenshot", json!({})),
            Step::call("c2", "email", json!({})),
        ]]));
        let tl = Arc::new(TurnLoop::new(
            model.clone(),
            Arc::new(tools),
            Arc::new(SequentialExecutor::new(Duration::from_secs(30))),
            Arc::new(EventBus::default()),
        ));
        let control = TurnControl::new(false);
        let (tx, mut rx) = mpsc::channel(64);

        let task = {
            let tl = tl.clone();
            let control = control.clone();
            tokio::spawn(async move {
                let mut history = History::new();
                let mut context = NullContextManager::new();
                let ctx = TurnContext {
                    turn_id: "t1",
                    history: &mut history,
                    context: &mut context,
                    control: &control,
                };
                let outcome = tl.run_turn(Message::user("go"), ctx, TurnSink::new(tx)).await;
                (outcome, history)
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        control.cancel();
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        let (outcome, history) = task.await.unwrap();
        // Let the detached executor run past where the second tool would start.
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(matches!(outcome, TurnOutcome::Cancelled));
        assert_eq!(types(&events), vec!["tool_use", "tool_use", "end"]);
        assert_eq!(*starts.lock().unwrap(), vec!["screenshot"]);
        assert!(history.is_well_paired());
        assert_eq!(model.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn paused_turn_emits_nothing_until_resumed() {
        let model = Arc::new(ScriptedModel::chunks(&["hello"]));
        let tl = Arc::new(turn_loop(model));
        let control = TurnControl::new(true);
        let (tx, mut rx) = mpsc::channel(64);

        let task = {
            let tl = tl.clone();
            let control = control.clone();
            tokio::spawn(async move {
                let mut history = History::new();
                let mut context = NullContextManager::new();
                let ctx = TurnContext {
                    turn_id: "t1",
                    history: &mut history,
                    context: &mut context,
                    control: &control,
                };
                tl.run_turn(Message::user("hi"), ctx, TurnSink::new(tx)).await
            })
        };

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());

        control.resume();
        assert_eq!(rx.recv().await.unwrap().event_type(), "content");
        assert_eq!(rx.recv().await.unwrap().event_type(), "end");
        assert!(matches!(task.await.unwrap(), TurnOutcome::Completed { .. }));
    }

    #[tokio::test]
    async fn client_tool_suspends_and_resumes() {
        let model = Arc::new(ScriptedModel::new(vec![
            vec![
                Step::text("Let me check."),
                Step::call("ask", "confirm", json!({"question": "proceed?"})),
                Step::call("local", "sleep", json!({"ms": 0})),
            ],
            vec![Step::text("Confirmed.")],
        ]));
        let tl = turn_loop(model.clone());
        let mut history = History::new();
        let mut context = NullContextManager::new();

        let (outcome, events) = run(&tl, &mut history, &mut context, "do it").await;
        assert_eq!(
            types(&events),
            vec!["content", "tool_use", "tool_use", "tool_result", "awaiting_input"]
        );
        let mut pending = match outcome {
            TurnOutcome::AwaitingInput(p) => p,
            other => panic!("unexpected: {other:?}"),
        };
        // nothing committed while suspended
        assert_eq!(history.len(), 1);
        assert!(pending.is_awaiting("ask"));
        assert!(!pending.is_awaiting("local"));
        assert_eq!(pending.awaiting().len(), 1);

        let stray = ToolResult::success_text("other", "x");
        assert!(pending.resolve(stray).is_err());
        pending
            .resolve(ToolResult::success_text("ask", "yes"))
            .unwrap();
        assert!(pending.is_complete());

        let (tx, mut rx) = mpsc::channel(64);
        let control = TurnControl::new(false);
        let ctx = TurnContext {
            turn_id: "t1",
            history: &mut history,
            context: &mut context,
            control: &control,
        };
        let outcome = tl.resume(pending, ctx, TurnSink::new(tx)).await;
        assert!(matches!(outcome, TurnOutcome::Completed { iterations: 2 }));
        assert_eq!(rx.recv().await.unwrap().event_type(), "content");
        assert_eq!(rx.recv().await.unwrap().event_type(), "end");

        // user, tool use, result ask, result local, answer
        assert_eq!(history.len(), 5);
        assert!(history.is_well_paired());
        assert_eq!(history.messages()[2].text(), "yes");
        assert_eq!(model.call_count(), 2);
    }

    struct CountingManager {
        applied: u32,
    }

    #[async_trait]
    impl ContextManager for CountingManager {
        fn name(&self) -> &str {
            "counting"
        }

        async fn apply_management(&mut self, _history: &mut History) {
            self.applied += 1;
        }

        async fn reduce_context(
            &mut self,
            history: &mut History,
            _cause: Option<&ModelError>,
        ) -> Result<(), crate::context::ContextError> {
            history.remove_range(0..1);
            Ok(())
        }

        fn removed_message_count(&self) -> u64 {
            0
        }

        fn restore_removed_count(&mut self, _count: u64) {}
    }

    #[tokio::test]
    async fn cadence_runs_after_iterations_unless_reduced_reactively() {
        let script = || {
            vec![
                vec![Step::call("a", "sleep", json!({"ms": 0}))],
                vec![Step::text("done")],
            ]
        };

        let tl = turn_loop(Arc::new(ScriptedModel::new(script())))
            .with_cadence(ManagementCadence::EveryIteration);
        let mut history = History::new();
        let mut context = CountingManager { applied: 0 };
        run(&tl, &mut history, &mut context, "go").await;
        // after the tool iteration, then at the end of the turn
        assert_eq!(context.applied, 2);

        let mut overflowing = script();
        overflowing.insert(
            0,
            vec![Step::Reject(ModelError::ContextOverflow {
                message: "big".into(),
                excess_tokens: None,
            })],
        );
        let tl = turn_loop(Arc::new(ScriptedModel::new(overflowing)))
            .with_cadence(ManagementCadence::EveryIteration);
        let mut history = History::new();
        history.push(Message::user("old"));
        let mut context = CountingManager { applied: 0 };
        run(&tl, &mut history, &mut context, "go").await;
        assert_eq!(context.applied, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_fails_fast() {
        let breaker = Arc::new(CircuitBreaker::new(1, Duration::from_secs(60)));
        breaker.record_failure();
        let model = Arc::new(ScriptedModel::chunks(&["unreachable"]));
        let tl = turn_loop(model.clone()).with_circuit_breaker(breaker);
        let mut history = History::new();
        let mut context = NullContextManager::new();

        let (outcome, _) = run(&tl, &mut history, &mut context, "hi").await;
        assert!(matches!(
            outcome,
            TurnOutcome::Failed {
                code: ErrorCode::CircuitOpen
            }
        ));
        assert_eq!(model.call_count(), 0);
    }
}

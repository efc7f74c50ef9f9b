//! Tool executor: runs the tool invocations of one model response.
//!
//! Every request yields exactly one terminal [`ToolResult`], in request
//! order, whatever happens to the tool body: unknown names, `Err` returns,
//! panics and timeouts all become `status = error` results. Progress reported
//! by a tool body is forwarded as an [`ExecutionEvent`] the moment it arrives,
//! and a tool's `Finished` event is always sent after its last `Progress`.
//!
//! Every request passes the turn's [`TurnControl`] before it is dispatched:
//! a paused turn starts nothing new until resumed, and once the turn is
//! cancelled the requests not yet started get error results without running.
//! Tools already running are left to finish.

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, warn};

use agentwire_config::{ExecutionMode, ExecutorConfig};
use agentwire_core::control::TurnControl;
use agentwire_core::error::ToolError;
use agentwire_core::tool::{
    ProgressReporter, ToolInvocationRequest, ToolProgress, ToolRegistry, ToolResult,
};

/// Observable steps of an execution, in the order they happen per tool.
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    Started {
        tool_call_id: String,
        tool_name: String,
    },
    Progress(ToolProgress),
    Finished {
        tool_name: String,
        result: ToolResult,
        duration_ms: u64,
    },
}

/// Where execution events go. Sends to a closed channel are dropped.
pub type ExecutionEvents = mpsc::UnboundedSender<ExecutionEvent>;

/// A dispatch strategy for the tool invocations of one model response.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Human-readable strategy name for logging.
    fn name(&self) -> &str;

    /// Run every request and return one result per request, in request order.
    async fn execute(
        &self,
        requests: &[ToolInvocationRequest],
        registry: &ToolRegistry,
        control: &TurnControl,
        events: &ExecutionEvents,
    ) -> Vec<ToolResult>;
}

/// Dispatches all requests at once and fans in.
pub struct ConcurrentExecutor {
    timeout: Duration,
    limit: Option<Arc<Semaphore>>,
}

impl ConcurrentExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            limit: None,
        }
    }

    /// Cap how many tool bodies run at the same time.
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.limit = Some(Arc::new(Semaphore::new(max.max(1))));
        self
    }
}

#[async_trait]
impl ToolExecutor for ConcurrentExecutor {
    fn name(&self) -> &str {
        "concurrent"
    }

    async fn execute(
        &self,
        requests: &[ToolInvocationRequest],
        registry: &ToolRegistry,
        control: &TurnControl,
        events: &ExecutionEvents,
    ) -> Vec<ToolResult> {
        let tasks = requests.iter().map(|request| {
            let limit = self.limit.clone();
            async move {
                let _permit = match limit {
                    Some(semaphore) => semaphore.acquire_owned().await.ok(),
                    None => None,
                };
                if let Err(skipped) = admit(request, control).await {
                    return skipped;
                }
                run_one(request, registry, self.timeout, events).await
            }
        });
        join_all(tasks).await
    }
}

/// Dispatches one request at a time, strictly in request order.
pub struct SequentialExecutor {
    timeout: Duration,
}

impl SequentialExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ToolExecutor for SequentialExecutor {
    fn name(&self) -> &str {
        "sequential"
    }

    async fn execute(
        &self,
        requests: &[ToolInvocationRequest],
        registry: &ToolRegistry,
        control: &TurnControl,
        events: &ExecutionEvents,
    ) -> Vec<ToolResult> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            let result = match admit(request, control).await {
                Ok(()) => run_one(request, registry, self.timeout, events).await,
                Err(skipped) => skipped,
            };
            results.push(result);
        }
        results
    }
}

/// The dispatch gate. Waits while the turn is paused; once it is cancelled
/// the request is answered with an error result instead of being run.
async fn admit(request: &ToolInvocationRequest, control: &TurnControl) -> Result<(), ToolResult> {
    match control.checkpoint().await {
        Ok(_) => Ok(()),
        Err(_) => {
            debug!(
                tool = %request.tool_name,
                call_id = %request.tool_call_id,
                "Turn cancelled, tool not dispatched"
            );
            let e = ToolError::Cancelled(request.tool_name.clone());
            Err(ToolResult::error(&request.tool_call_id, e.to_string()))
        }
    }
}

/// Build the executor selected by configuration.
pub fn executor_from_config(config: &ExecutorConfig) -> Arc<dyn ToolExecutor> {
    match config.mode {
        ExecutionMode::Concurrent => {
            let mut executor = ConcurrentExecutor::new(config.tool_timeout());
            if let Some(max) = config.max_concurrency {
                executor = executor.with_max_concurrency(max);
            }
            Arc::new(executor)
        }
        ExecutionMode::Sequential => Arc::new(SequentialExecutor::new(config.tool_timeout())),
    }
}

/// Run a single invocation to its terminal result.
///
/// The tool body runs in its own task so a panic is caught as a `JoinError`
/// and a timeout can abort it without touching sibling invocations.
pub async fn run_one(
    request: &ToolInvocationRequest,
    registry: &ToolRegistry,
    timeout: Duration,
    events: &ExecutionEvents,
) -> ToolResult {
    let started = Instant::now();
    let call_id = request.tool_call_id.clone();
    let tool_name = request.tool_name.clone();

    let _ = events.send(ExecutionEvent::Started {
        tool_call_id: call_id.clone(),
        tool_name: tool_name.clone(),
    });
    debug!(tool = %tool_name, call_id = %call_id, "Executing tool");

    let outcome = match registry.resolve(&tool_name) {
        Err(e) => Err(e),
        Ok(tool) => {
            let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
            let reporter = ProgressReporter::new(call_id.clone(), progress_tx);
            let input = request.input.clone();
            let mut handle = tokio::spawn(async move { tool.invoke(input, reporter).await });
            let deadline = tokio::time::sleep(timeout);
            tokio::pin!(deadline);

            let outcome = loop {
                tokio::select! {
                    biased;
                    Some(progress) = progress_rx.recv() => {
                        let _ = events.send(ExecutionEvent::Progress(progress));
                    }
                    joined = &mut handle => {
                        break match joined {
                            Ok(result) => result,
                            Err(e) if e.is_panic() => Err(ToolError::Panicked(panic_message(e.into_panic()))),
                            Err(e) => Err(ToolError::ExecutionFailed {
                                tool_name: tool_name.clone(),
                                reason: e.to_string(),
                            }),
                        };
                    }
                    _ = &mut deadline => {
                        handle.abort();
                        break Err(ToolError::Timeout {
                            tool_name: tool_name.clone(),
                            timeout_ms: timeout.as_millis() as u64,
                        });
                    }
                }
            };

            // Progress sent just before the body returned is still queued.
            while let Ok(progress) = progress_rx.try_recv() {
                let _ = events.send(ExecutionEvent::Progress(progress));
            }
            outcome
        }
    };

    let result = match outcome {
        Ok(content) => ToolResult::success(call_id, content),
        Err(e) => {
            warn!(tool = %tool_name, error = %e, "Tool invocation failed");
            ToolResult::error(call_id, e.to_string())
        }
    };

    let duration_ms = started.elapsed().as_millis() as u64;
    let _ = events.send(ExecutionEvent::Finished {
        tool_name,
        result: result.clone(),
        duration_ms,
    });
    result
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "tool body panicked".into()
    }
}

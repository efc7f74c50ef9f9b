//! Turn-level streaming events.
//!
//! `TurnEvent` is what the turn loop produces while it runs. The session maps
//! each one onto an outbound envelope:
//! - `content`: partial text from the model
//! - `tool_use`: a tool invocation is being dispatched
//! - `tool_result`: a tool invocation finished
//! - `progress`: a running tool reported progress
//! - `retry`: the model call is being retried
//! - `awaiting_input`: the turn is suspended on client-side tools
//! - `error`: the turn failed
//! - `end`: the turn's stream is over

use tokio::sync::mpsc;
use tracing::debug;

use agentwire_core::envelope::{EndReason, OutboundEvent};
use agentwire_core::error::ErrorCode;
use agentwire_core::tool::{ToolInvocationRequest, ToolProgress, ToolResult};

#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    Content {
        data: String,
    },
    ToolUse(ToolInvocationRequest),
    ToolResult(ToolResult),
    Progress(ToolProgress),
    Retry {
        attempt: u32,
        max_attempts: u32,
        reason: String,
        delay_ms: u64,
    },
    AwaitingInput {
        requests: Vec<ToolInvocationRequest>,
    },
    Error {
        code: ErrorCode,
        message: String,
        recoverable: bool,
    },
    End {
        reason: EndReason,
    },
}

impl TurnEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Content { .. } => "content",
            Self::ToolUse(_) => "tool_use",
            Self::ToolResult(_) => "tool_result",
            Self::Progress(_) => "progress",
            Self::Retry { .. } => "retry",
            Self::AwaitingInput { .. } => "awaiting_input",
            Self::Error { .. } => "error",
            Self::End { .. } => "end",
        }
    }
}

impl From<TurnEvent> for OutboundEvent {
    fn from(event: TurnEvent) -> Self {
        match event {
            TurnEvent::Content { data } => OutboundEvent::Content {
                data,
                role: Some("assistant".into()),
            },
            TurnEvent::ToolUse(request) => OutboundEvent::ToolUse {
                tool_name: request.tool_name,
                tool_id: request.tool_call_id,
                input: request.input,
            },
            TurnEvent::ToolResult(result) => OutboundEvent::ToolResult {
                tool_id: result.tool_call_id,
                output: result.content,
                status: result.status,
            },
            TurnEvent::Progress(progress) => OutboundEvent::Progress {
                tool_id: progress.tool_call_id,
                data: progress.data,
            },
            TurnEvent::Retry {
                attempt,
                max_attempts,
                reason,
                delay_ms,
            } => OutboundEvent::Retry {
                attempt,
                max_attempts,
                reason,
                delay_ms,
            },
            TurnEvent::AwaitingInput { requests } => OutboundEvent::AwaitingInput { requests },
            TurnEvent::Error {
                code,
                message,
                recoverable,
            } => OutboundEvent::error(code, message, recoverable),
            TurnEvent::End { reason } => OutboundEvent::End { reason },
        }
    }
}

/// The outbound side of one turn.
///
/// `end` can only be sent through [`TurnSink::finish`], which consumes the
/// sink, so nothing for the turn can follow it.
#[derive(Debug)]
pub struct TurnSink {
    tx: mpsc::Sender<TurnEvent>,
}

impl TurnSink {
    pub fn new(tx: mpsc::Sender<TurnEvent>) -> Self {
        Self { tx }
    }

    /// Emit a non-terminal event. A closed receiver drops the event.
    pub async fn emit(&self, event: TurnEvent) {
        debug_assert!(!matches!(event, TurnEvent::End { .. }));
        if self.tx.send(event).await.is_err() {
            debug!("Turn event receiver closed, dropping event");
        }
    }

    /// Emit the terminal `end` event and close the sink.
    pub async fn finish(self, reason: EndReason) {
        let _ = self.tx.send(TurnEvent::End { reason }).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_use_maps_to_wire_names() {
        let event = TurnEvent::ToolUse(ToolInvocationRequest::new(
            "call_1",
            "weather",
            json!({"city": "Oslo"}),
        ));
        assert_eq!(event.event_type(), "tool_use");
        match OutboundEvent::from(event) {
            OutboundEvent::ToolUse {
                tool_name,
                tool_id,
                input,
            } => {
                assert_eq!(tool_name, "weather");
                assert_eq!(tool_id, "call_1");
                assert_eq!(input["city"], "Oslo");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn error_carries_numeric_code() {
        let event = TurnEvent::Error {
            code: ErrorCode::MaxIterations,
            message: "too many".into(),
            recoverable: false,
        };
        match OutboundEvent::from(event) {
            OutboundEvent::Error { number, .. } => assert_eq!(number, 4006),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn finish_sends_end_last() {
        let (tx, mut rx) = mpsc::channel(4);
        let sink = TurnSink::new(tx);
        sink.emit(TurnEvent::Content { data: "hi".into() }).await;
        sink.finish(EndReason::Complete).await;

        assert_eq!(rx.recv().await.unwrap().event_type(), "content");
        assert_eq!(
            rx.recv().await.unwrap(),
            TurnEvent::End {
                reason: EndReason::Complete
            }
        );
        assert!(rx.recv().await.is_none());
    }
}

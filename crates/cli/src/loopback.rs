//! A model that needs no network: it streams the user's words back.
//!
//! A message of the form `/tool_name {json}` naming a registered tool becomes
//! a tool call instead, so every part of the protocol (progress, client-side
//! tools, cancellation mid-stream) can be driven from a plain WebSocket
//! client.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use agentwire_core::error::{ModelError, ToolError};
use agentwire_core::message::{ResultBlock, Role};
use agentwire_core::model::{ModelClient, ModelEvent, ModelRequest, ModelStream};
use agentwire_core::tool::{ToolInvocationRequest, ToolRegistry};
use agentwire_tools::FnTool;

pub struct LoopbackModel {
    word_delay: Duration,
}

impl LoopbackModel {
    pub fn new(word_delay: Duration) -> Self {
        Self { word_delay }
    }
}

enum Reply {
    Text(String),
    Call(ToolInvocationRequest),
}

fn reply_for(request: &ModelRequest) -> Reply {
    let Some(last) = request.messages.last() else {
        return Reply::Text("Hello!".into());
    };

    if last.role == Role::Tool {
        let mut outputs: Vec<String> = request
            .messages
            .iter()
            .rev()
            .take_while(|m| m.role == Role::Tool)
            .map(|m| m.text())
            .collect();
        outputs.reverse();
        return Reply::Text(format!("Tool said: {}", outputs.join("; ")));
    }

    let text = last.text();
    if let Some(command) = text.trim().strip_prefix('/') {
        let (name, args) = command.split_once(' ').unwrap_or((command, ""));
        if request.tools.iter().any(|t| t.name == name) {
            let args = args.trim();
            let input = if args.is_empty() {
                json!({})
            } else {
                serde_json::from_str(args).unwrap_or_else(|_| json!({ "text": args }))
            };
            let id = format!("call_{}", Uuid::new_v4().simple());
            return Reply::Call(ToolInvocationRequest::new(id, name, input));
        }
    }

    if text.trim().is_empty() {
        Reply::Text("(nothing to echo)".into())
    } else {
        Reply::Text(text)
    }
}

#[async_trait]
impl ModelClient for LoopbackModel {
    fn name(&self) -> &str {
        "loopback"
    }

    async fn invoke(&self, request: ModelRequest) -> Result<ModelStream, ModelError> {
        let reply = reply_for(&request);
        let delay = self.word_delay;
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            match reply {
                Reply::Call(call) => {
                    if tx.send(Ok(ModelEvent::ToolCall(call))).await.is_err() {
                        return;
                    }
                }
                Reply::Text(text) => {
                    for (i, word) in text.split_inclusive(' ').enumerate() {
                        if i > 0 && !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        if tx
                            .send(Ok(ModelEvent::ContentDelta(word.to_string())))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                }
            }
            let _ = tx.send(Ok(ModelEvent::Done { usage: None })).await;
        });

        Ok(rx)
    }
}

/// Tools for exercising the protocol by hand.
pub fn demo_tools() -> ToolRegistry {
    let mut tools = ToolRegistry::new();

    tools.register(Arc::new(FnTool::new(
        "clock",
        "Current UTC time",
        json!({"type": "object", "properties": {}}),
        |_: Value, _| async move {
            Ok(vec![ResultBlock::text(chrono::Utc::now().to_rfc3339())])
        },
    )));

    tools.register(Arc::new(FnTool::new(
        "countdown",
        "Count down from `from`, reporting progress once per second",
        json!({
            "type": "object",
            "properties": {"from": {"type": "integer", "minimum": 0, "maximum": 30}}
        }),
        |input: Value, progress| async move {
            let from = input["from"].as_u64().unwrap_or(3).min(30);
            for remaining in (1..=from).rev() {
                progress.report(json!({ "remaining": remaining }));
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Ok(vec![ResultBlock::text("liftoff")])
        },
    )));

    tools.register(Arc::new(FnTool::new(
        "fail",
        "Always fails",
        json!({"type": "object"}),
        |_: Value, _| async move {
            Err(ToolError::ExecutionFailed {
                tool_name: "fail".into(),
                reason: "this tool always fails".into(),
            })
        },
    )));

    tools.register(Arc::new(FnTool::client(
        "confirm",
        "Ask the user to confirm; answered by the client",
        json!({"type": "object", "properties": {"question": {"type": "string"}}}),
    )));

    tools
}

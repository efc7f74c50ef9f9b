#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use agentwire_config::AppConfig;
use agentwire_core::envelope::{Envelope, InboundEvent, OutboundEvent};
use agentwire_core::error::{ModelError, ToolError};
use agentwire_core::message::ResultBlock;
use agentwire_core::model::{ModelClient, ModelEvent, ModelRequest, ModelStream};
use agentwire_core::tool::{ToolInvocationRequest, ToolRegistry};
use agentwire_session::{SessionHandle, SessionManager};
use agentwire_tools::FnTool;

#[derive(Debug, Clone)]
pub enum Step {
    Text(String),
    Call(ToolInvocationRequest),
    Sleep(Duration),
}

pub fn text(s: &str) -> Step {
    Step::Text(s.to_string())
}

pub fn call(id: &str, tool: &str, input: Value) -> Step {
    Step::Call(ToolInvocationRequest::new(id, tool, input))
}

pub fn sleep_ms(ms: u64) -> Step {
    Step::Sleep(Duration::from_millis(ms))
}

/// Plays one script per model call.
#[derive(Default)]
pub struct ScriptedModel {
    scripts: Mutex<VecDeque<Vec<Step>>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new(scripts: Vec<Vec<Step>>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(&self, request: ModelRequest) -> Result<ModelStream, ModelError> {
        self.requests.lock().unwrap().push(request);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(ModelError::Api {
                status_code: 500,
                message: "script exhausted".into(),
            })?;
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for step in script {
                let event = match step {
                    Step::Text(t) => ModelEvent::ContentDelta(t),
                    Step::Call(r) => ModelEvent::ToolCall(r),
                    Step::Sleep(d) => {
                        tokio::time::sleep(d).await;
                        continue;
                    }
                };
                if tx.send(Ok(event)).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(Ok(ModelEvent::Done { usage: None })).await;
        });
        Ok(rx)
    }
}

pub fn tools() -> ToolRegistry {
    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(FnTool::new(
        "sleep",
        "Sleep for `ms` milliseconds",
        json!({"type": "object", "properties": {"ms": {"type": "integer"}}}),
        |input: Value, _| async move {
            let ms = input["ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(vec![ResultBlock::text(format!("slept {ms}ms"))])
        },
    )));
    tools.register(Arc::new(FnTool::new(
        "explode",
        "Always fails",
        json!({"type": "object"}),
        |_: Value, _| async move {
            Err(ToolError::ExecutionFailed {
                tool_name: "explode".into(),
                reason: "boom".into(),
            })
        },
    )));
    tools.register(Arc::new(FnTool::client(
        "confirm",
        "Ask the user to confirm",
        json!({"type": "object"}),
    )));
    tools
}

/// Defaults with heartbeats off, so virtual time only moves for the test.
pub fn config() -> AppConfig {
    let mut config = AppConfig::default();
    config.heartbeat.enabled = false;
    config
}

pub fn manager(config: AppConfig, model: Arc<ScriptedModel>) -> SessionManager {
    SessionManager::new(config, model, tools())
}

/// Open a session and consume its `session_opened` event.
pub async fn open(manager: &SessionManager, resume: Option<String>) -> SessionHandle {
    let mut handle = manager.open(resume).await.unwrap();
    let opened = next(&mut handle).await;
    assert_eq!(opened.event_type(), "session_opened");
    handle
}

pub async fn next(handle: &mut SessionHandle) -> Envelope<OutboundEvent> {
    tokio::time::timeout(Duration::from_secs(600), handle.recv())
        .await
        .expect("timed out waiting for an outbound event")
        .expect("session closed")
}

/// Nothing arrives within `ms` milliseconds.
pub async fn quiet_for(handle: &mut SessionHandle, ms: u64) -> bool {
    tokio::time::timeout(Duration::from_millis(ms), handle.recv())
        .await
        .is_err()
}

/// Collect events up to and including the next `end`.
pub async fn until_end(handle: &mut SessionHandle) -> Vec<Envelope<OutboundEvent>> {
    let mut events = Vec::new();
    loop {
        let event = next(handle).await;
        let done = event.is_terminal();
        events.push(event);
        if done {
            return events;
        }
    }
}

pub fn types(events: &[Envelope<OutboundEvent>]) -> Vec<&'static str> {
    events.iter().map(|e| e.event_type()).collect()
}

pub async fn chat(handle: &SessionHandle, content: &str) {
    handle
        .send(InboundEvent::Chat {
            content: content.into(),
            attachments: vec![],
        })
        .await
        .unwrap();
}

//! Shared test helpers: a scripted model collaborator.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

use agentwire_core::error::ModelError;
use agentwire_core::model::{ModelClient, ModelEvent, ModelRequest, ModelStream};
use agentwire_core::tool::ToolInvocationRequest;

/// One scripted step of a model response.
#[derive(Debug, Clone)]
pub enum Step {
    Delta(String),
    Call(ToolInvocationRequest),
    Sleep(Duration),
    /// Fail the call before any stream is returned.
    Reject(ModelError),
    /// Break the stream with an error.
    Fail(ModelError),
}

impl Step {
    pub fn text(text: &str) -> Self {
        Step::Delta(text.to_string())
    }

    pub fn call(id: &str, tool: &str, input: serde_json::Value) -> Self {
        Step::Call(ToolInvocationRequest::new(id, tool, input))
    }

    pub fn sleep_ms(ms: u64) -> Self {
        Step::Sleep(Duration::from_millis(ms))
    }
}

/// A model that plays back one script per call, in order.
///
/// Calls beyond the script fail with an API error.
pub struct ScriptedModel {
    scripts: Mutex<VecDeque<Vec<Step>>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new(scripts: Vec<Vec<Step>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A model that answers once with the given chunks.
    pub fn chunks(chunks: &[&str]) -> Self {
        Self::new(vec![chunks.iter().map(|c| Step::text(c)).collect()])
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(&self, request: ModelRequest) -> Result<ModelStream, ModelError> {
        self.requests.lock().unwrap().push(request);
        let script = self.scripts.lock().unwrap().pop_front().ok_or(ModelError::Api {
            status_code: 500,
            message: "script exhausted".into(),
        })?;

        if let Some(Step::Reject(e)) = script.first() {
            return Err(e.clone());
        }

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for step in script {
                let event = match step {
                    Step::Delta(text) => Ok(ModelEvent::ContentDelta(text)),
                    Step::Call(request) => Ok(ModelEvent::ToolCall(request)),
                    Step::Sleep(d) => {
                        tokio::time::sleep(d).await;
                        continue;
                    }
                    Step::Reject(e) | Step::Fail(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                };
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(Ok(ModelEvent::Done { usage: None })).await;
        });
        Ok(rx)
    }
}

//! Model collaborator: the abstraction over language-model inference.
//!
//! A [`ModelClient`] takes the current history and the available tool
//! definitions and returns a stream of [`ModelEvent`]s: text deltas, tool-call
//! requests, and one terminal `Done`. Errors arrive either up front (the call
//! could not start) or in-stream (the call broke partway).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ModelError;
use crate::message::Message;
use crate::tool::{ToolDefinition, ToolInvocationRequest};

/// What the turn loop sends to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRequest {
    pub messages: Vec<Message>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// One item of a model response stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    /// A chunk of generated text.
    ContentDelta(String),
    /// The model wants a tool invoked.
    ToolCall(ToolInvocationRequest),
    /// The response is complete.
    Done { usage: Option<Usage> },
}

/// The stream half of a model call.
pub type ModelStream = mpsc::Receiver<Result<ModelEvent, ModelError>>;

#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Human-readable name for logging.
    fn name(&self) -> &str;

    /// Start one inference call.
    async fn invoke(&self, request: ModelRequest) -> Result<ModelStream, ModelError>;
}

/// Drain a stream and concatenate its text deltas. Tool calls are ignored.
pub async fn collect_text(mut stream: ModelStream) -> Result<String, ModelError> {
    let mut text = String::new();
    while let Some(event) = stream.recv().await {
        match event? {
            ModelEvent::ContentDelta(delta) => text.push_str(&delta),
            ModelEvent::ToolCall(_) => {}
            ModelEvent::Done { .. } => break,
        }
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedModel;

    #[async_trait]
    impl ModelClient for FixedModel {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn invoke(&self, _request: ModelRequest) -> Result<ModelStream, ModelError> {
            let (tx, rx) = mpsc::channel(8);
            tokio::spawn(async move {
                let _ = tx.send(Ok(ModelEvent::ContentDelta("Hello, ".into()))).await;
                let _ = tx.send(Ok(ModelEvent::ContentDelta("world".into()))).await;
                let _ = tx.send(Ok(ModelEvent::Done { usage: None })).await;
            });
            Ok(rx)
        }
    }

    #[tokio::test]
    async fn collect_text_concatenates_deltas() {
        let stream = FixedModel
            .invoke(ModelRequest {
                messages: vec![Message::user("hi")],
                tools: vec![],
            })
            .await
            .unwrap();
        assert_eq!(collect_text(stream).await.unwrap(), "Hello, world");
    }

    #[tokio::test]
    async fn collect_text_surfaces_stream_errors() {
        let (tx, rx) = mpsc::channel(2);
        tx.send(Ok(ModelEvent::ContentDelta("partial".into())))
            .await
            .unwrap();
        tx.send(Err(ModelError::Stream("reset".into()))).await.unwrap();
        drop(tx);
        assert!(matches!(
            collect_text(rx).await,
            Err(ModelError::Stream(_))
        ));
    }
}

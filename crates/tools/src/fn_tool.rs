//! Closure-backed tools.
//!
//! A capability that owns a shared resource (a connection handle, a cache)
//! exposes several registry entries by building one [`FnTool`] per operation,
//! each closing over a clone of the same `Arc`.

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;

use agentwire_core::error::ToolError;
use agentwire_core::message::ResultBlock;
use agentwire_core::tool::{ProgressReporter, Tool, ToolLocation};

type Handler = dyn Fn(serde_json::Value, ProgressReporter) -> BoxFuture<'static, Result<Vec<ResultBlock>, ToolError>>
    + Send
    + Sync;

pub struct FnTool {
    name: String,
    description: String,
    schema: serde_json::Value,
    location: ToolLocation,
    handler: Arc<Handler>,
}

impl FnTool {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: serde_json::Value,
        handler: F,
    ) -> Self
    where
        F: Fn(serde_json::Value, ProgressReporter) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<ResultBlock>, ToolError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
            location: ToolLocation::Local,
            handler: Arc::new(move |input, progress| handler(input, progress).boxed()),
        }
    }

    /// A tool answered by the client. Its body is never run by the executor;
    /// invoking it directly is an error.
    pub fn client(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: serde_json::Value,
    ) -> Self {
        let name = name.into();
        let tool_name = name.clone();
        let mut tool = Self::new(name, description, schema, move |_input, _progress| {
            let tool_name = tool_name.clone();
            async move {
                Err(ToolError::ExecutionFailed {
                    tool_name,
                    reason: "answered by the client".into(),
                })
            }
        });
        tool.location = ToolLocation::Client;
        tool
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> serde_json::Value {
        self.schema.clone()
    }

    fn location(&self) -> ToolLocation {
        self.location
    }

    async fn invoke(
        &self,
        input: serde_json::Value,
        progress: ProgressReporter,
    ) -> Result<Vec<ResultBlock>, ToolError> {
        (self.handler)(input, progress).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentwire_core::tool::ToolRegistry;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Two tools over one shared counter.
    fn counter_tools() -> (FnTool, FnTool) {
        let counter = Arc::new(AtomicU64::new(0));
        let inc = {
            let counter = counter.clone();
            FnTool::new(
                "counter_increment",
                "Add one",
                json!({"type": "object"}),
                move |_input, _progress| {
                    let counter = counter.clone();
                    async move {
                        let value = counter.fetch_add(1, Ordering::SeqCst) + 1;
                        Ok(vec![ResultBlock::Json {
                            value: json!({ "value": value }),
                        }])
                    }
                },
            )
        };
        let read = FnTool::new(
            "counter_read",
            "Current value",
            json!({"type": "object"}),
            move |_input, _progress| {
                let counter = counter.clone();
                async move {
                    Ok(vec![ResultBlock::text(
                        counter.load(Ordering::SeqCst).to_string(),
                    )])
                }
            },
        );
        (inc, read)
    }

    #[tokio::test]
    async fn tools_share_one_resource() {
        let (inc, read) = counter_tools();
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(inc));
        registry.register(Arc::new(read));

        let inc = registry.resolve("counter_increment").unwrap();
        inc.invoke(json!({}), ProgressReporter::noop("1")).await.unwrap();
        inc.invoke(json!({}), ProgressReporter::noop("2")).await.unwrap();

        let out = registry
            .resolve("counter_read")
            .unwrap()
            .invoke(json!({}), ProgressReporter::noop("3"))
            .await
            .unwrap();
        assert_eq!(out, vec![ResultBlock::text("2")]);
    }

    #[tokio::test]
    async fn client_tool_is_marked_and_refuses_local_runs() {
        let tool = FnTool::client("approve", "Ask the user", json!({"type": "object"}));
        assert_eq!(tool.location(), ToolLocation::Client);
        assert_eq!(tool.to_definition().name, "approve");
        assert!(
            tool.invoke(json!({}), ProgressReporter::noop("x"))
                .await
                .is_err()
        );
    }
}

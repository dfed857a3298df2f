//! Built-in agent that echoes its inputs back.
//!
//! Useful for exercising the engine end to end without an external model.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use super::{Agent, EventSink, RunContext};

/// Echoes text inputs as tokens around an `echo` tool call
#[derive(Debug, Clone, Default)]
pub struct EchoAgent;

impl EchoAgent {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Agent for EchoAgent {
    fn name(&self) -> &str {
        "echo"
    }

    async fn run(&self, ctx: &RunContext, sink: &dyn EventSink) -> Result<()> {
        let texts: Vec<(&str, &str)> = ctx
            .inputs
            .iter()
            .filter_map(|(field, value)| value.as_text().map(|text| (field.as_str(), text)))
            .collect();
        let files: Vec<String> = ctx
            .inputs
            .values()
            .flat_map(|value| value.files())
            .map(|file| file.original_name.clone())
            .collect();

        debug!(run_id = %ctx.run_id, fields = texts.len(), "Echoing inputs");

        sink.emit_tool_start("echo", json!({ "fields": texts.len(), "files": files }))
            .await?;

        let mut response = String::new();
        for (field, text) in &texts {
            sink.emit_token(text).await?;
            response.push_str(&format!("## {}\n\n{}\n\n", field, text));
        }

        sink.emit_tool_end("echo", json!({ "bytes": response.len() }))
            .await?;

        let artifact = ctx
            .write_artifact("response.md", response.as_bytes())
            .await
            .context("Failed to write response artifact")?;

        let text: Vec<&str> = texts.iter().map(|(_, text)| *text).collect();
        sink.emit_final(&text.join("\n"), vec![artifact]).await?;

        Ok(())
    }
}

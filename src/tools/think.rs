//! Think 工具：不产生副作用，仅让模型记录思考过程

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::tools::schema::input_schema;
use crate::tools::{Tool, ToolOutput};

#[derive(Deserialize, JsonSchema)]
struct ThinkArgs {
    /// A thought to think about.
    thought: String,
}

pub struct ThinkTool;

#[async_trait]
impl Tool for ThinkTool {
    fn name(&self) -> &str {
        "think"
    }

    fn description(&self) -> &str {
        "Use the tool to think about something. It will not obtain new information or change \
         anything, but just append the thought to the log. Use it when complex reasoning or \
         some cache memory is needed."
    }

    fn input_schema(&self) -> Value {
        input_schema::<ThinkArgs>()
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, String> {
        let args: ThinkArgs = serde_json::from_value(args).map_err(|e| e.to_string())?;
        tracing::debug!(chars = args.thought.len(), "think");
        Ok(ToolOutput::text("Thinking complete!"))
    }
}

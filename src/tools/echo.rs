//! Echo 工具（测试用）

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::tools::{schema_of, Tool};

#[derive(Debug, Deserialize, JsonSchema)]
pub struct EchoArgs {
    /// 要回显的文本
    pub text: String,
}

/// Echo 工具：回显文本
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the given text back (for testing)."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<EchoArgs>()
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let args: EchoArgs = serde_json::from_value(args).map_err(|e| e.to_string())?;
        Ok(Value::String(args.text))
    }
}

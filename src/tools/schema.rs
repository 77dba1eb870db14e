//! 工具参数 Schema：schemars 生成、jsonschema 校验

use schemars::{schema_for, JsonSchema};
use serde_json::Value;

/// 由参数结构体生成 JSON Schema
pub fn schema_of<T: JsonSchema>() -> Value {
    serde_json::to_value(schema_for!(T)).unwrap_or_else(|_| serde_json::json!({"type": "object"}))
}

/// 按工具声明的 schema 校验参数；返回所有违例拼成的说明
pub fn validate_arguments(schema: &Value, args: &Value) -> Result<(), String> {
    if !args.is_object() {
        return Err(format!("arguments must be a JSON object, got: {args}"));
    }

    let validator = match jsonschema::validator_for(schema) {
        Ok(v) => v,
        Err(e) => {
            // 工具自身的 schema 有误时不拦截调用
            tracing::warn!(error = %e, "tool schema is not a valid JSON Schema, skipping validation");
            return Ok(());
        }
    };

    let errors: Vec<String> = validator
        .iter_errors(args)
        .map(|e| e.to_string())
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

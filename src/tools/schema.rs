//! 工具输入 JSON Schema 生成（schemars 自动生成工具 Schema）
//!
//! 本地工具以参数结构体派生 JsonSchema，去掉 $schema / title 后作为 input_schema 声明给模型。

use schemars::{schema_for, JsonSchema};
use serde_json::Value;

/// 返回参数结构体 T 的 input_schema
pub fn input_schema<T: JsonSchema>() -> Value {
    let schema = schema_for!(T);
    let mut value = serde_json::to_value(&schema).unwrap_or_else(|_| {
        serde_json::json!({"type": "object", "properties": {}})
    });
    if let Some(obj) = value.as_object_mut() {
        obj.remove("$schema");
        obj.remove("title");
    }
    value
}

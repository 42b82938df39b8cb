//! 模型回复的 JSON Schema 生成
//!
//! Planner 与 Router 的回复结构都派生 JsonSchema；生成的 Schema 拼入 prompt，
//! 减少模型输出格式错误。

use schemars::{schema_for, JsonSchema};

/// 返回类型 T 的 JSON Schema 字符串，可拼入 prompt
pub fn reply_schema<T: JsonSchema>() -> String {
    let schema = schema_for!(T);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

/// 标准的「仅按此 Schema 回复」提示块
pub fn schema_block<T: JsonSchema>() -> String {
    format!(
        "Respond with ONE JSON object matching this JSON Schema:\n```json\n{}\n```",
        reply_schema::<T>()
    )
}

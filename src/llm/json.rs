//! 模型 JSON 输出解析
//!
//! 模型常把 JSON 包在 ```json 围栏里或前后夹带文字：先取围栏内容，否则取第一个 `{`
//! 到最后一个 `}`。解析失败一律返回 None，由调用方降级为空 / 低置信度结果。

use serde::de::DeserializeOwned;
use serde_json::Value;

/// 从模型输出中截取 JSON 对象文本
pub fn extract_json_object(output: &str) -> Option<&str> {
    let trimmed = output.trim();

    let body = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```").map(|end| &rest[..end]).unwrap_or(rest)
    } else if let Some(start) = trimmed.find("```") {
        let rest = &trimmed[start + 3..];
        rest.find("```").map(|end| &rest[..end]).unwrap_or(rest)
    } else {
        trimmed
    };

    let start = body.find('{')?;
    let end = body.rfind('}')?;
    (end > start).then(|| body[start..=end].trim())
}

/// 解析为任意 JSON 对象
pub fn parse_object(output: &str) -> Option<serde_json::Map<String, Value>> {
    let text = extract_json_object(output)?;
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// 解析为目标结构
pub fn parse_reply<T: DeserializeOwned>(output: &str) -> Option<T> {
    let text = extract_json_object(output)?;
    match serde_json::from_str(text) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::debug!(error = %e, "unparsable model reply");
            None
        }
    }
}

//! 最终回复生成
//!
//! 输入：来源 Planner、Planner 文本、执行结果、找到的数据、用户上下文、是否澄清。
//! 执行结果先去掉 id 类字段，UTC 时间戳换成用户时区；模型输出再清掉 UUID 与 JSON 片段。
//! format 永不失败：任何内部错误都换成固定的安全文本。

pub mod combiner;

use std::sync::{Arc, OnceLock};

use chrono::NaiveDateTime;
use chrono_tz::Tz;
use regex::{Captures, Regex};
use serde_json::{json, Value};

use crate::core::PipelineError;
use crate::llm::LlmClient;
use crate::memory::Message;
use crate::planners::UserContext;
use crate::tools::ActionResult;

pub use combiner::{combine, CombinedOutcome};

pub const FALLBACK_REPLY: &str =
    "I seem to have run into an unexpected problem. My developers have been notified and are looking into it.";

const SAFETY: &str = "Never show raw JSON, internal system details, database ids, user ids or your thinking process. \
Strictly avoid harmful, unethical or offensive content.";

/// 澄清提问模板
pub fn clarification_text(command: &str) -> String {
    format!("I need a bit more information. Could you please clarify what you mean by '{command}'? 🤔")
}

/// 一次回复生成所需的全部输入
#[derive(Debug, Clone, Copy)]
pub struct AnswerInput<'a> {
    pub source: &'a str,
    pub command: &'a str,
    pub raw_text: &'a str,
    pub results: &'a [ActionResult],
    pub found_data: &'a [Value],
    pub context: &'a UserContext,
    pub clarification: bool,
}

struct Patterns {
    timestamp: Regex,
    uuid: Regex,
    fence: Regex,
    blank_lines: Regex,
}

fn patterns() -> Option<&'static Patterns> {
    static PATTERNS: OnceLock<Option<Patterns>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            Some(Patterns {
                timestamp: Regex::new(r"\b(\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2})Z\b").ok()?,
                uuid: Regex::new(r"(?i)\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b").ok()?,
                fence: Regex::new(r"(?s)```(?:json)?\s*[\[{].*?```").ok()?,
                blank_lines: Regex::new(r"\n{3,}").ok()?,
            })
        })
        .as_ref()
}

/// 文本中的 UTC 时间戳换成用户时区的 `%Y-%m-%d %H:%M (TZ)`
pub fn localize_timestamps(text: &str, tz: Tz) -> String {
    let Some(p) = patterns() else {
        return text.to_string();
    };
    p.timestamp
        .replace_all(text, |caps: &Captures| {
            match NaiveDateTime::parse_from_str(&caps[1], "%Y-%m-%dT%H:%M:%S") {
                Ok(naive) => {
                    let local = naive.and_utc().with_timezone(&tz);
                    format!("{} ({})", local.format("%Y-%m-%d %H:%M"), tz.name())
                }
                Err(_) => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// 找到与 text[start] 处 `{` 匹配的 `}`（忽略字符串内的括号）
fn matching_brace(text: &str, start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }
    None
}

/// 去掉可解析为 JSON 对象的片段
fn strip_json_objects(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    while let Some(rel) = text[cursor..].find('{') {
        let start = cursor + rel;
        out.push_str(&text[cursor..start]);
        match matching_brace(text, start) {
            Some(end) if serde_json::from_str::<Value>(&text[start..=end]).is_ok_and(|v| v.is_object()) => {
                cursor = end + 1;
            }
            _ => {
                out.push('{');
                cursor = start + 1;
            }
        }
    }
    out.push_str(&text[cursor..]);
    out
}

/// 清理对用户可见的文本：JSON 片段、UUID、多余空行
pub fn scrub(text: &str) -> String {
    let Some(p) = patterns() else {
        return text.trim().to_string();
    };
    let text = p.fence.replace_all(text, "");
    let text = strip_json_objects(&text);
    let text = p.uuid.replace_all(&text, "");
    p.blank_lines.replace_all(text.trim(), "\n\n").into_owned()
}

/// 递归去掉 id / user_id / *_id 字段
pub fn strip_identifiers(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !(k.as_str() == "id" || k.as_str() == "user_id" || k.ends_with("_id") || k.ends_with("_ids")))
                .map(|(k, v)| (k.clone(), strip_identifiers(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(strip_identifiers).collect()),
        other => other.clone(),
    }
}

pub struct AnsweringFormatter {
    llm: Arc<dyn LlmClient>,
}

impl AnsweringFormatter {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// 生成最终回复；永不失败
    pub async fn format(&self, input: AnswerInput<'_>) -> String {
        let tz = input.context.tz();
        if input.clarification {
            let text = if input.raw_text.trim().is_empty() {
                clarification_text(input.command)
            } else {
                input.raw_text.to_string()
            };
            return scrub(&localize_timestamps(&text, tz));
        }

        // 没有执行结果也没有数据时 Planner 文本就是最终回复
        if input.results.is_empty() && input.found_data.is_empty() {
            let text = scrub(&localize_timestamps(input.raw_text, tz));
            return if text.is_empty() { FALLBACK_REPLY.to_string() } else { text };
        }

        match self.synthesize(input, tz).await {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(error = %e, source = input.source, "answer formatting failed");
                self.fallback(input, tz)
            }
        }
    }

    fn fallback(&self, input: AnswerInput<'_>, tz: Tz) -> String {
        let summary = scrub(&localize_timestamps(input.raw_text, tz));
        if summary.is_empty() {
            FALLBACK_REPLY.to_string()
        } else {
            format!("I apologize, there was an error processing your request. Here's a summary: {summary}")
        }
    }

    async fn synthesize(&self, input: AnswerInput<'_>, tz: Tz) -> Result<String, PipelineError> {
        let results: Vec<Value> = input
            .results
            .iter()
            .map(|r| {
                json!({
                    "tool": r.tool,
                    "success": r.success,
                    "data": r.data.as_ref().map(strip_identifiers),
                    "error": r.error,
                })
            })
            .collect();
        let found: Vec<Value> = input.found_data.iter().map(strip_identifiers).collect();
        let info = json!({
            "source": input.source,
            "original_command": input.command,
            "summary_of_outcomes": input.raw_text,
            "execution_results": results,
            "found_data": found,
        });
        let info_text = localize_timestamps(&serde_json::to_string_pretty(&info).unwrap_or_default(), tz);

        let style = input
            .context
            .communication_style()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "Respond helpfully, briefly and in a friendly tone.".to_string());
        let system = format!(
            r#"### ANSWER SYNTHESIS
You are a helpful personal assistant. Turn the information below into a clear, friendly reply for the user.

COMMUNICATION STYLE:
{style}

SAFETY GUIDELINES:
{SAFETY}

RULES:
- All times are already in the user's timezone ({}); keep them as given.
- If several outcomes are listed, give a brief summary of everything that was done.
- Mention failures honestly but without technical details.
- For search results, be detailed and include the links.
- Be as brief as possible without dropping any core information.

INFORMATION TO DELIVER:
{info_text}"#,
            tz.name()
        );
        let messages = [Message::system(system), Message::user(input.command)];
        let reply = self.llm.complete(&messages).await?;
        let text = scrub(&localize_timestamps(&reply, tz));
        if text.is_empty() {
            return Err(PipelineError::Formatter("empty answer".to_string()));
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, MockLlmClient};

    fn input<'a>(ctx: &'a UserContext, results: &'a [ActionResult]) -> AnswerInput<'a> {
        AnswerInput {
            source: "TaskAgent",
            command: "add buy milk",
            raw_text: "Okay, I've added the task 'Buy milk' to your 'shopping' category.",
            results,
            found_data: &[],
            context: ctx,
            clarification: false,
        }
    }

    fn created() -> Vec<ActionResult> {
        vec![ActionResult {
            tool: "create_task".into(),
            success: true,
            data: Some(json!({"id": "0b7c6e0e-1d2a-4f43-9a51-2f0f3c1d9e11", "user_id": "u1", "title": "Buy milk", "due_date": "2025-03-11T10:00:00Z"})),
            error: None,
        }]
    }

    #[test]
    fn test_timestamps_converted_to_user_zone() {
        let out = localize_timestamps("due 2025-03-11T10:00:00Z!", chrono_tz::Asia::Jakarta);
        assert_eq!(out, "due 2025-03-11 17:00 (Asia/Jakarta)!");
    }

    #[test]
    fn test_scrub_removes_ids_and_json() {
        let text = "Done! {\"id\": \"t1\", \"title\": \"x\"}\nTask 0b7c6e0e-1d2a-4f43-9a51-2f0f3c1d9e11 saved {not json}.";
        let out = scrub(text);
        assert!(!out.contains("\"id\""));
        assert!(!out.contains("0b7c6e0e"));
        assert!(out.contains("{not json}"));
    }

    #[test]
    fn test_identifiers_stripped_recursively() {
        let v = strip_identifiers(&json!({"id": 1, "task_id": "a", "items": [{"user_id": "u", "title": "t"}]}));
        assert_eq!(v, json!({"items": [{"title": "t"}]}));
    }

    #[tokio::test]
    async fn test_results_reach_model_without_ids_and_in_local_time() {
        let llm = Arc::new(MockLlmClient::new().with_default("Added 'Buy milk', due 2025-03-11 17:00 (Asia/Jakarta)."));
        let formatter = AnsweringFormatter::new(llm.clone());
        let mut ctx = UserContext::for_user("u1");
        ctx.timezone = "Asia/Jakarta".into();
        let results = created();
        let out = formatter.format(input(&ctx, &results)).await;
        assert_eq!(out, "Added 'Buy milk', due 2025-03-11 17:00 (Asia/Jakarta).");
        let prompt = &llm.prompts()[0];
        assert!(!prompt.contains("0b7c6e0e"));
        assert!(prompt.contains("2025-03-11 17:00 (Asia/Jakarta)"));
    }

    #[tokio::test]
    async fn test_model_failure_uses_safe_summary() {
        let llm = Arc::new(MockLlmClient::new().with_failure("ANSWER SYNTHESIS", LlmError::Timeout));
        let formatter = AnsweringFormatter::new(llm);
        let ctx = UserContext::for_user("u1");
        let results = created();
        let out = formatter.format(input(&ctx, &results)).await;
        assert!(out.starts_with("I apologize, there was an error processing your request."));
    }

    #[tokio::test]
    async fn test_json_only_reply_falls_back() {
        let llm = Arc::new(MockLlmClient::new().with_default(r#"{"response": "ok"}"#));
        let formatter = AnsweringFormatter::new(llm);
        let ctx = UserContext::for_user("u1");
        let results = created();
        let mut i = input(&ctx, &results);
        i.raw_text = "";
        assert_eq!(formatter.format(i).await, FALLBACK_REPLY);
    }

    #[tokio::test]
    async fn test_clarification_uses_template() {
        let formatter = AnsweringFormatter::new(Arc::new(MockLlmClient::new()));
        let ctx = UserContext::for_user("u1");
        let mut i = input(&ctx, &[]);
        i.raw_text = "";
        i.command = "do the thing";
        i.clarification = true;
        assert_eq!(
            formatter.format(i).await,
            "I need a bit more information. Could you please clarify what you mean by 'do the thing'? 🤔"
        );
    }
}

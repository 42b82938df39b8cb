//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / 轮换代理 / Mock）实现 LlmClient：complete 接收消息列表并返回文本。
//! 错误统一为 LlmError，其中配额与权限类错误可触发凭证轮换。

use async_trait::async_trait;
use thiserror::Error;

use crate::memory::Message;

/// LLM 调用错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    /// 配额耗尽 / 限流（429、resource exhausted）
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// 凭证无效或无权限（401 / 403）
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("request timed out")]
    Timeout,

    #[error("api error: {0}")]
    Api(String),

    #[error("empty response")]
    EmptyResponse,

    /// 从未配置任何凭证
    #[error("no API credentials configured")]
    NoCredentials,

    /// 所有凭证都已失效
    #[error("all {attempts} credentials exhausted, last error: {last}")]
    CredentialsExhausted { attempts: usize, last: Box<LlmError> },
}

impl LlmError {
    /// 是否应标记当前凭证失效并轮换
    pub fn is_rotatable(&self) -> bool {
        matches!(self, LlmError::QuotaExceeded(_) | LlmError::PermissionDenied(_))
    }

    /// 根据后端返回的错误文本归类
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if lower.contains("429")
            || lower.contains("quota")
            || lower.contains("rate limit")
            || lower.contains("resource exhausted")
            || lower.contains("resource_exhausted")
        {
            LlmError::QuotaExceeded(message)
        } else if lower.contains("401")
            || lower.contains("403")
            || lower.contains("invalid api key")
            || lower.contains("invalid_api_key")
            || lower.contains("permission")
        {
            LlmError::PermissionDenied(message)
        } else if lower.contains("timed out") || lower.contains("timeout") {
            LlmError::Timeout
        } else {
            LlmError::Api(message)
        }
    }
}

/// 逻辑 Agent 身份与输出约束（同一凭证池下按 Agent 名创建多个句柄）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelProfile {
    pub agent_name: String,
    /// 是否要求只输出一个 JSON 对象
    pub structured_output: bool,
}

impl ModelProfile {
    pub fn structured(agent_name: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            structured_output: true,
        }
    }

    pub fn chat(agent_name: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            structured_output: false,
        }
    }
}

pub const JSON_ONLY_INSTRUCTION: &str =
    "Respond with ONLY one valid JSON object. Do not add explanations or markdown outside the JSON.";

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError>;

    /// 单条 prompt 的便捷入口
    async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        self.complete(&[Message::user(prompt)]).await
    }

    /// 累计调用次数，默认 0
    fn call_count(&self) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_quota() {
        assert!(matches!(
            LlmError::classify("429 Too Many Requests"),
            LlmError::QuotaExceeded(_)
        ));
        assert!(matches!(
            LlmError::classify("You exceeded your current quota"),
            LlmError::QuotaExceeded(_)
        ));
    }

    #[test]
    fn test_classify_permission() {
        let err = LlmError::classify("Incorrect API key provided: invalid_api_key");
        assert!(matches!(err, LlmError::PermissionDenied(_)));
        assert!(err.is_rotatable());
    }

    #[test]
    fn test_classify_other_not_rotatable() {
        let err = LlmError::classify("model overloaded");
        assert!(matches!(err, LlmError::Api(_)));
        assert!(!err.is_rotatable());
        assert!(!LlmError::Timeout.is_rotatable());
    }
}

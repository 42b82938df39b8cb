//! 流水线错误分类
//!
//! Orchestrator 以下的失败都在本层就地恢复成用户可读文本；
//! user_message 给出每类错误对外的措辞，不泄露内部细节。

use thiserror::Error;

use crate::llm::LlmError;
use crate::memory::StoreError;
use crate::tools::ToolError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// 路由置信度过低
    #[error("Routing ambiguity (confidence {confidence:.2})")]
    RoutingAmbiguity { confidence: f64 },

    /// Planner 拒绝执行（缺少目标、频率不允许、超出配额等）
    #[error("{0}")]
    PlannerValidation(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {0}")]
    ToolExecution(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    /// 所有凭证都已失效，或从未配置
    #[error("Credential exhaustion: {0}")]
    CredentialExhaustion(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Formatter failure: {0}")]
    Formatter(String),
}

impl PipelineError {
    /// 对用户展示的文本
    pub fn user_message(&self) -> String {
        match self {
            PipelineError::RoutingAmbiguity { .. } => {
                "I'm not sure what you meant. Could you rephrase that?".to_string()
            }
            PipelineError::PlannerValidation(msg) => msg.clone(),
            PipelineError::ToolNotFound(_) | PipelineError::ToolExecution(_) | PipelineError::ToolTimeout(_) => {
                "Something went wrong while carrying that out.".to_string()
            }
            PipelineError::CredentialExhaustion(_) => {
                "I'm having trouble reaching my language service right now. Please try again in a moment."
                    .to_string()
            }
            PipelineError::Storage(_) => "I couldn't access your data right now. Please try again.".to_string(),
            PipelineError::Formatter(_) => {
                "I seem to have run into an unexpected problem. Please try again.".to_string()
            }
        }
    }
}

impl From<LlmError> for PipelineError {
    /// 超时、API 错误对用户同样表现为服务暂不可用
    fn from(e: LlmError) -> Self {
        PipelineError::CredentialExhaustion(e.to_string())
    }
}

impl From<StoreError> for PipelineError {
    fn from(e: StoreError) -> Self {
        PipelineError::Storage(e.to_string())
    }
}

impl From<ToolError> for PipelineError {
    fn from(e: ToolError) -> Self {
        match e {
            ToolError::NotFound(name) => PipelineError::ToolNotFound(name),
            ToolError::Timeout(name) => PipelineError::ToolTimeout(name),
            other => PipelineError::ToolExecution(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_llm_errors_map_to_credential_exhaustion() {
        let e: PipelineError = LlmError::NoCredentials.into();
        assert!(matches!(e, PipelineError::CredentialExhaustion(_)));
        assert!(e.user_message().contains("language service"));
    }

    #[test]
    fn test_tool_errors_keep_their_class() {
        let e: PipelineError = ToolError::NotFound("x".into()).into();
        assert_eq!(e, PipelineError::ToolNotFound("x".into()));
        let e: PipelineError = ToolError::Timeout("y".into()).into();
        assert_eq!(e, PipelineError::ToolTimeout("y".into()));
    }

    #[test]
    fn test_validation_message_passes_through() {
        let e = PipelineError::PlannerValidation("You have reached the maximum of 10 active schedules.".into());
        assert_eq!(e.user_message(), "You have reached the maximum of 10 active schedules.");
    }
}

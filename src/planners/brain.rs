//! 偏好 Planner：维护 brain 中的 communication_style 记忆
//!
//! 模型拿到当前风格对象与用户指令，返回合并后的完整对象（保留未提及的键、冲突时以新指令为准、
//! 要求删除的键去掉）；只是查看偏好时 style 为空，不产生动作。

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::{ask_json, Destination, Planner, PlannerOutcome, PlannerRequest};
use crate::core::PipelineError;
use crate::llm::LlmClient;
use crate::memory::Store;
use crate::tools::{schema_block, KnownAction};

pub const STYLE_MEMORY: &str = "communication_style";

const FAILURE: &str = "An error occurred while processing your preference request.";

#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
struct BrainReply {
    /// 给用户的确认或偏好列表
    #[serde(default)]
    response: String,
    /// 合并后的完整风格对象；只查看时为 null
    #[serde(default)]
    style: Option<Map<String, Value>>,
    /// 一句话概括当前风格
    #[serde(default)]
    summary: Option<String>,
}

pub struct BrainPlanner {
    llm: Arc<dyn LlmClient>,
    store: Arc<dyn Store>,
}

impl BrainPlanner {
    pub fn new(llm: Arc<dyn LlmClient>, store: Arc<dyn Store>) -> Self {
        Self { llm, store }
    }

    async fn current_style(&self, req: &PlannerRequest) -> Value {
        match self.store.list_memories(&req.context.user_id, Some(STYLE_MEMORY), 1).await {
            Ok(mut found) if !found.is_empty() => found.remove(0).data,
            Ok(_) => req.context.communication_style().cloned().unwrap_or_else(|| Value::Object(Map::new())),
            Err(e) => {
                tracing::warn!(error = %e, "could not load communication style");
                req.context.communication_style().cloned().unwrap_or_else(|| Value::Object(Map::new()))
            }
        }
    }

    async fn plan_inner(&self, req: &PlannerRequest) -> Result<PlannerOutcome, PipelineError> {
        let current = self.current_style(req).await;
        let system = format!(
            r#"### BRAIN PREFERENCES
You maintain the user's communication style preferences as one JSON object
(keys such as tone, verbosity, language, emoji, format, nickname).
Rules:
- Preserve every existing key the user does not mention and merge the new preferences in.
- On conflict the latest instruction wins.
- If the user asks to stop or remove a preference, delete that key.
- If the user only asks what their preferences are, set `style` to null and list them in `response`.
Return the COMPLETE merged object in `style`, and a short friendly confirmation in `response`.

Current communication_style: {}

{}"#,
            serde_json::to_string_pretty(&current).unwrap_or_default(),
            schema_block::<BrainReply>()
        );
        let Some(reply) = ask_json::<BrainReply>(&self.llm, &system, &req.command).await? else {
            return Ok(PlannerOutcome::error(FAILURE));
        };
        if reply.response.trim().is_empty() {
            return Ok(PlannerOutcome::error(FAILURE));
        }

        let actions = match reply.style {
            Some(style) => {
                tracing::info!(user_id = %req.context.user_id, keys = style.len(), "communication style updated");
                vec![KnownAction::CreateOrUpdateMemory {
                    memory_type: STYLE_MEMORY.to_string(),
                    data: Some(Value::Object(style)),
                    content: reply.summary.filter(|s| !s.trim().is_empty()),
                    importance: None,
                }
                .into()]
            }
            None => Vec::new(),
        };
        Ok(PlannerOutcome::ok(reply.response, actions))
    }
}

#[async_trait]
impl Planner for BrainPlanner {
    fn destination(&self) -> Destination {
        Destination::Brain
    }

    async fn plan(&self, request: &PlannerRequest) -> PlannerOutcome {
        match self.plan_inner(request).await {
            Ok(outcome) => outcome,
            Err(e) => PlannerOutcome::from_error(&e),
        }
    }
}

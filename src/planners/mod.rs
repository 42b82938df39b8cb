//! 专家 Planner：把澄清后的指令与用户上下文变成 {回复文本, 动作列表}
//!
//! 每个 Planner 只规划不执行；动作交给 ActionExecutor。内部失败一律就地转成
//! 零动作的错误回复（`❌ ...`），不向 Orchestrator 抛出。

pub mod brain;
pub mod fallback;
pub mod finding;
pub mod journal;
pub mod resolve;
pub mod schedule;
pub mod task;
pub mod timeparse;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::PipelineError;
use crate::llm::{parse_reply, LlmClient};
use crate::memory::{EntityRef, MemoryRecord, Message, TaskRecord};
use crate::tools::Action;

pub use brain::BrainPlanner;
pub use fallback::FallbackPlanner;
pub use finding::FindingPlanner;
pub use journal::JournalPlanner;
pub use schedule::SchedulePlanner;
pub use task::TaskPlanner;

/// 路由去向：固定的 Planner 集合加一个兜底对话去向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Destination {
    #[serde(rename = "TaskAgent")]
    Task,
    #[serde(rename = "JournalAgent")]
    Journal,
    #[serde(rename = "BrainAgent")]
    Brain,
    #[serde(rename = "ScheduleAgent")]
    Schedule,
    #[serde(rename = "FindingAgent")]
    Finding,
    #[serde(rename = "GeneralFallbackAgent")]
    Fallback,
}

impl Destination {
    pub const ALL: [Destination; 6] = [
        Destination::Task,
        Destination::Journal,
        Destination::Brain,
        Destination::Schedule,
        Destination::Finding,
        Destination::Fallback,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Destination::Task => "TaskAgent",
            Destination::Journal => "JournalAgent",
            Destination::Brain => "BrainAgent",
            Destination::Schedule => "ScheduleAgent",
            Destination::Finding => "FindingAgent",
            Destination::Fallback => "GeneralFallbackAgent",
        }
    }

    /// 宽松解析（大小写、去掉 Agent 后缀、常见别名）
    pub fn parse(s: &str) -> Option<Self> {
        let key = s.trim().to_lowercase();
        let key = key.strip_suffix("agent").unwrap_or(&key).trim_end_matches('_');
        match key {
            "task" | "tasks" => Some(Destination::Task),
            "journal" | "note" | "notes" => Some(Destination::Journal),
            "brain" | "preference" | "preferences" => Some(Destination::Brain),
            "schedule" | "reminder" | "reminders" => Some(Destination::Schedule),
            "finding" | "find" | "search" => Some(Destination::Finding),
            "generalfallback" | "general_fallback" | "general" | "fallback" => Some(Destination::Fallback),
            _ => None,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Planner 可见的用户上下文（由 Orchestrator 每轮组装）
#[derive(Debug, Clone, Default)]
pub struct UserContext {
    pub user_id: String,
    pub timezone: String,
    pub open_tasks: Vec<TaskRecord>,
    pub brain: Vec<MemoryRecord>,
    pub recent_refs: Vec<EntityRef>,
    /// 渲染好的最近交互
    pub history: String,
}

impl UserContext {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            timezone: "UTC".to_string(),
            ..Self::default()
        }
    }

    /// 用户时区；非法名称回退到 UTC
    pub fn tz(&self) -> Tz {
        self.timezone.parse::<Tz>().unwrap_or(Tz::UTC)
    }

    /// brain 中的沟通风格偏好
    pub fn communication_style(&self) -> Option<&Value> {
        self.brain
            .iter()
            .find(|m| m.memory_type == "communication_style")
            .map(|m| &m.data)
    }
}

/// 单次规划请求
#[derive(Debug, Clone)]
pub struct PlannerRequest {
    pub command: String,
    pub context: UserContext,
    pub now: DateTime<Utc>,
}

impl PlannerRequest {
    pub fn new(command: impl Into<String>, context: UserContext) -> Self {
        Self {
            command: command.into(),
            context,
            now: Utc::now(),
        }
    }

    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    pub fn now_iso(&self) -> String {
        self.now.format(crate::memory::ISO_UTC_FORMAT).to_string()
    }
}

/// 本轮新出现、后续指代可能用到的实体
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContextUpdate {
    pub refs: Vec<EntityRef>,
}

/// Planner 输出
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PlannerOutcome {
    pub success: bool,
    pub response: String,
    pub actions: Vec<Action>,
    pub requires_clarification: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_update: Option<ContextUpdate>,
    /// Planner 自己查到、直接回给用户的数据（不经 Executor）
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub found_data: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PlannerOutcome {
    pub fn ok(response: impl Into<String>, actions: Vec<Action>) -> Self {
        Self {
            success: true,
            response: response.into(),
            actions,
            ..Self::default()
        }
    }

    /// 零动作的澄清回复
    pub fn clarify(response: impl Into<String>) -> Self {
        Self {
            success: true,
            response: response.into(),
            requires_clarification: true,
            ..Self::default()
        }
    }

    /// 零动作的错误回复
    pub fn error(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            success: false,
            response: format!("❌ {message}"),
            error: Some(message),
            ..Self::default()
        }
    }

    pub fn from_error(e: &PipelineError) -> Self {
        tracing::warn!(error = %e, "planner degraded to error response");
        Self::error(e.user_message())
    }

    pub fn with_refs(mut self, refs: Vec<EntityRef>) -> Self {
        if !refs.is_empty() {
            self.context_update = Some(ContextUpdate { refs });
        }
        self
    }
}

/// 单个子意图的处理结果：累积到本轮输出，或让整轮停在澄清 / 错误上
pub(crate) enum Step {
    Done {
        response: String,
        actions: Vec<Action>,
        refs: Vec<EntityRef>,
    },
    Halt(PlannerOutcome),
}

impl Step {
    pub(crate) fn done(response: impl Into<String>, actions: Vec<Action>) -> Self {
        Step::Done {
            response: response.into(),
            actions,
            refs: Vec::new(),
        }
    }
}

/// 合并子意图结果；任一 Halt 时整轮只返回它（零动作），全部为空时返回 None
pub(crate) fn combine_steps(steps: Vec<Step>) -> Option<PlannerOutcome> {
    let mut responses = Vec::new();
    let mut actions = Vec::new();
    let mut refs = Vec::new();
    for step in steps {
        match step {
            Step::Halt(outcome) => return Some(outcome),
            Step::Done {
                response,
                actions: a,
                refs: r,
            } => {
                responses.push(response);
                actions.extend(a);
                refs.extend(r);
            }
        }
    }
    if responses.is_empty() {
        return None;
    }
    Some(PlannerOutcome::ok(responses.join("\n"), actions).with_refs(refs))
}

#[async_trait]
pub trait Planner: Send + Sync {
    fn destination(&self) -> Destination;

    /// 规划；永不失败，内部错误转为错误回复
    async fn plan(&self, request: &PlannerRequest) -> PlannerOutcome;
}

/// 一次结构化调用：system + user 两条消息，回复解析为 T；无法解析时为 None
pub(crate) async fn ask_json<T: DeserializeOwned>(
    llm: &Arc<dyn LlmClient>,
    system: &str,
    user: &str,
) -> Result<Option<T>, PipelineError> {
    let messages = [Message::system(system), Message::user(user)];
    let reply = llm.complete(&messages).await?;
    Ok(parse_reply(&reply))
}

/// 数组形式的回复：允许裸数组，或包在对象的 key 中
pub(crate) async fn ask_json_list<T: DeserializeOwned>(
    llm: &Arc<dyn LlmClient>,
    system: &str,
    user: &str,
    key: &str,
) -> Result<Option<Vec<T>>, PipelineError> {
    let messages = [Message::system(system), Message::user(user)];
    let reply = llm.complete(&messages).await?;
    Ok(parse_list(&reply, key))
}

pub(crate) fn parse_list<T: DeserializeOwned>(reply: &str, key: &str) -> Option<Vec<T>> {
    let trimmed = reply.trim();
    let body = trimmed
        .find('[')
        .zip(trimmed.rfind(']'))
        .filter(|(s, e)| e > s)
        .map(|(s, e)| &trimmed[s..=e]);
    if let Some(obj) = crate::llm::parse_object(trimmed) {
        if let Some(v) = obj.get(key) {
            return serde_json::from_value(v.clone()).ok();
        }
    }
    body.and_then(|b| serde_json::from_str(b).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_parse_is_lenient() {
        assert_eq!(Destination::parse("TaskAgent"), Some(Destination::Task));
        assert_eq!(Destination::parse("schedule_agent"), Some(Destination::Schedule));
        assert_eq!(Destination::parse("GeneralFallbackAgent"), Some(Destination::Fallback));
        assert_eq!(Destination::parse("NEEDS_CLARIFICATION"), None);
        for d in Destination::ALL {
            assert_eq!(Destination::parse(d.as_str()), Some(d));
        }
    }

    #[test]
    fn test_error_outcome_shape() {
        let o = PlannerOutcome::error("You have reached the maximum of 10 active schedules.");
        assert!(!o.success);
        assert!(o.actions.is_empty());
        assert_eq!(o.response, "❌ You have reached the maximum of 10 active schedules.");
        assert!(o.error.is_some());
    }

    #[test]
    fn test_parse_list_variants() {
        let bare: Vec<u32> = parse_list("```json\n[1, 2]\n```", "items").unwrap();
        assert_eq!(bare, vec![1, 2]);
        let wrapped: Vec<u32> = parse_list(r#"{"items": [3]}"#, "items").unwrap();
        assert_eq!(wrapped, vec![3]);
        assert!(parse_list::<u32>("nothing", "items").is_none());
    }

    #[test]
    fn test_user_context_timezone_fallback() {
        let mut ctx = UserContext::for_user("u");
        ctx.timezone = "Not/AZone".into();
        assert_eq!(ctx.tz(), Tz::UTC);
        ctx.timezone = "Asia/Jakarta".into();
        assert_eq!(ctx.tz(), chrono_tz::Asia::Jakarta);
    }
}

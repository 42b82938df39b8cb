//! 意图路由
//!
//! 先做快速关键词匹配（不调用 LLM），置信度足够高时直接采用；否则交给模型，
//! 模型给出一条或多条 {route_to, clarified_command, confidence, rationale}。
//! 复合指令拆成多条路由，由 Orchestrator 依次分派。
//! 无法解析、未知去向或 NEEDS_CLARIFICATION 一律视为置信度 0。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::core::PipelineError;
use crate::llm::{parse_reply, LlmClient};
use crate::memory::{Message, ISO_UTC_FORMAT};
use crate::planners::Destination;
use crate::tools::schema_block;

pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.4;
/// 快速匹配结果被采用的最低置信度
pub const FAST_MATCH_ADOPT: f64 = 0.8;
/// 模型没给置信度时使用的值
const UNSTATED_CONFIDENCE: f64 = 0.75;
const NEEDS_CLARIFICATION: &str = "NEEDS_CLARIFICATION";

/// 路由结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutingDecision {
    pub clarified_command: String,
    /// None 表示需要澄清
    pub destination: Option<Destination>,
    pub confidence: f64,
    pub rationale: String,
}

impl RoutingDecision {
    pub fn unclear(command: impl Into<String>, rationale: impl Into<String>) -> Self {
        Self {
            clarified_command: command.into(),
            destination: None,
            confidence: 0.0,
            rationale: rationale.into(),
        }
    }

    /// 是否应转为澄清而不是分派
    pub fn needs_clarification(&self, threshold: f64) -> bool {
        self.destination.is_none() || self.confidence < threshold
    }
}

#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
struct RouteReply {
    /// TaskAgent | JournalAgent | BrainAgent | ScheduleAgent | FindingAgent | GeneralFallbackAgent
    #[serde(default)]
    route_to: Option<String>,
    /// 自包含、无指代的指令；无法理解时为 "NEEDS_CLARIFICATION"
    #[serde(default)]
    clarified_command: Option<String>,
    /// 0.0 - 1.0
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    rationale: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
struct RouteList {
    routes: Vec<RouteReply>,
}

/// 强信号（前缀）与弱信号（包含）关键词
struct KeywordRule {
    destination: Destination,
    prefixes: &'static [&'static str],
    contains: &'static [&'static str],
}

const RULES: &[KeywordRule] = &[
    KeywordRule {
        destination: Destination::Schedule,
        prefixes: &["remind me", "set a reminder", "schedule a", "schedule reminder"],
        contains: &["reminder", "remind me", "every morning", "every evening", "my schedules"],
    },
    KeywordRule {
        destination: Destination::Task,
        prefixes: &["add task", "add a task", "new task", "todo:", "task:"],
        contains: &["my tasks", "to-do list", "todo list", " as done", " as complete"],
    },
    KeywordRule {
        destination: Destination::Journal,
        prefixes: &["note:", "note that", "write down", "save a note", "journal:"],
        contains: &["my notes", "my journal", "take a note"],
    },
    KeywordRule {
        destination: Destination::Finding,
        prefixes: &["find my", "where did i put", "look up my", "search my notes"],
        contains: &["what's my", "what is my", "find my"],
    },
    KeywordRule {
        destination: Destination::Brain,
        prefixes: &["from now on", "call me ", "always respond", "always reply"],
        contains: &["respond in", "reply in", "my preferences", "talk to me in"],
    },
];

/// 复合指令的连接词；出现时跳过快速匹配，交给模型拆分
const COMPOUND_MARKERS: &[&str] = &[" and also ", " and then ", " then also ", "; "];

pub struct IntentRouter {
    llm: Arc<dyn LlmClient>,
    threshold: f64,
    enable_fast_match: bool,
}

impl IntentRouter {
    pub fn new(llm: Arc<dyn LlmClient>, threshold: f64) -> Self {
        Self {
            llm,
            threshold,
            enable_fast_match: true,
        }
    }

    pub fn with_fast_match(mut self, enabled: bool) -> Self {
        self.enable_fast_match = enabled;
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// 解析一条原始输入；总是返回至少一条路由
    pub async fn resolve(
        &self,
        raw_command: &str,
        history: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<RoutingDecision>, PipelineError> {
        let raw = raw_command.trim();
        if raw.is_empty() {
            return Ok(vec![RoutingDecision::unclear(raw, "empty input")]);
        }

        if self.enable_fast_match {
            if let Some(decision) = fast_match(raw).filter(|d| d.confidence >= FAST_MATCH_ADOPT) {
                tracing::info!(
                    destination = ?decision.destination,
                    confidence = decision.confidence,
                    "fast route"
                );
                return Ok(vec![decision]);
            }
        }

        let decisions = self.llm_route(raw, history, now).await?;
        for d in &decisions {
            tracing::info!(
                destination = ?d.destination,
                confidence = d.confidence,
                clarified = %d.clarified_command,
                "routed"
            );
        }
        Ok(decisions)
    }

    async fn llm_route(
        &self,
        raw: &str,
        history: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<RoutingDecision>, PipelineError> {
        let system = format!(
            r#"### INTENT ROUTER
You are the routing brain of a personal assistant. Turn the user's message into one or more self-contained commands and pick the agent for each.

Agents:
- TaskAgent: creating, listing, updating, completing or deleting to-do tasks.
- JournalAgent: saving, updating, deleting or reading notes and personal information.
- BrainAgent: the user's preferences about how the assistant communicates (language, tone, nickname).
- ScheduleAgent: reminders and scheduled or recurring automations.
- FindingAgent: finding a specific piece of information, first in the user's notes, then on the web.
- GeneralFallbackAgent: conversation, advice, creative writing and general questions.

Rules:
1. Resolve pronouns ("it", "that", "them") from the recent conversation; the clarified_command must be understandable without any history.
2. Strip filler ("please", "can you") but never invent actions.
3. If the message contains several independent requests for different agents, return one route per request, in the order given.
4. If you cannot understand the message, set clarified_command to "NEEDS_CLARIFICATION".
5. confidence is your certainty between 0.0 and 1.0.

Current UTC time: {}
Recent conversation:
{}

{}"#,
            now.format(ISO_UTC_FORMAT),
            if history.is_empty() { "(none)" } else { history },
            schema_block::<RouteList>()
        );
        let messages = [Message::system(system), Message::user(format!("User message: \"{raw}\""))];
        let reply = self.llm.complete(&messages).await?;

        let routes = crate::planners::parse_list::<RouteReply>(&reply, "routes")
            .or_else(|| parse_reply::<RouteReply>(&reply).map(|r| vec![r]))
            .unwrap_or_default();
        let decisions: Vec<RoutingDecision> = routes.into_iter().map(|r| to_decision(r, raw)).collect();
        if decisions.is_empty() {
            tracing::warn!("unparsable routing reply");
            return Ok(vec![RoutingDecision::unclear(raw, "unparsable routing reply")]);
        }
        Ok(decisions)
    }
}

fn to_decision(reply: RouteReply, raw: &str) -> RoutingDecision {
    let rationale = reply.rationale.unwrap_or_default();
    let clarified = match reply.clarified_command {
        Some(c) if c.trim().eq_ignore_ascii_case(NEEDS_CLARIFICATION) => {
            return RoutingDecision::unclear(raw, rationale);
        }
        Some(c) if !c.trim().is_empty() => c.trim().to_string(),
        _ => raw.to_string(),
    };
    let Some(destination) = reply.route_to.as_deref().and_then(Destination::parse) else {
        return RoutingDecision::unclear(clarified, rationale);
    };
    RoutingDecision {
        clarified_command: clarified,
        destination: Some(destination),
        confidence: reply.confidence.unwrap_or(UNSTATED_CONFIDENCE).clamp(0.0, 1.0),
        rationale,
    }
}

/// 关键词打分：前缀 0.9，包含每项 0.3，封顶 0.95；多个去向都命中时不给结果
pub fn fast_match(input: &str) -> Option<RoutingDecision> {
    let lower = input.trim().to_lowercase();
    if COMPOUND_MARKERS.iter().any(|m| lower.contains(m)) {
        return None;
    }

    let scored: Vec<(Destination, f64)> = RULES
        .iter()
        .map(|rule| {
            let mut score = 0.0;
            if rule.prefixes.iter().any(|p| lower.starts_with(p)) {
                score += 0.9;
            }
            score += 0.3 * rule.contains.iter().filter(|c| lower.contains(*c)).count() as f64;
            (rule.destination, score.min(0.95))
        })
        .filter(|(_, score)| *score > 0.0)
        .collect();

    match scored.as_slice() {
        [(destination, confidence)] => Some(RoutingDecision {
            clarified_command: input.trim().to_string(),
            destination: Some(*destination),
            confidence: *confidence,
            rationale: "keyword match".to_string(),
        }),
        _ => None,
    }
}

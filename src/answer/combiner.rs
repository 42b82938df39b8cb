//! 多个 Planner 输出合并为一份：回复以空行连接，动作按顺序拼接

use serde_json::Value;

use crate::memory::EntityRef;
use crate::planners::{Destination, PlannerOutcome};
use crate::tools::Action;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CombinedOutcome {
    pub sources: Vec<Destination>,
    pub response: String,
    pub actions: Vec<Action>,
    pub found_data: Vec<Value>,
    pub refs: Vec<EntityRef>,
    /// 至少一个 Planner 成功
    pub any_success: bool,
    pub requires_clarification: bool,
}

impl CombinedOutcome {
    /// 回复的来源标识：单个 Planner 时为其名称
    pub fn source_label(&self) -> &'static str {
        match self.sources.as_slice() {
            [single] => single.as_str(),
            _ => "MultiAgentExecution",
        }
    }
}

pub fn combine(outcomes: Vec<(Destination, PlannerOutcome)>) -> CombinedOutcome {
    let mut combined = CombinedOutcome::default();
    let mut responses = Vec::with_capacity(outcomes.len());
    for (destination, outcome) in outcomes {
        combined.sources.push(destination);
        if !outcome.response.trim().is_empty() {
            responses.push(outcome.response.trim().to_string());
        }
        combined.actions.extend(outcome.actions);
        combined.found_data.extend(outcome.found_data);
        if let Some(update) = outcome.context_update {
            combined.refs.extend(update.refs);
        }
        combined.any_success |= outcome.success;
        combined.requires_clarification |= outcome.requires_clarification;
    }
    combined.response = responses.join("\n\n");
    combined
}

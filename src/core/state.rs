//! 单条指令的处理阶段
//!
//! Received → Routed → (Clarifying | Dispatched) → Executed → Answered。
//! Clarifying 之后直接 Answered；Answered 总会到达，保证用户总能收到文本。

use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum PipelineStage {
    Received,
    Routed,
    Clarifying,
    Dispatched,
    Executed,
    Answered,
}

impl PipelineStage {
    /// 允许的下一阶段；任何阶段都可以直接进入 Answered
    pub fn can_advance_to(self, next: PipelineStage) -> bool {
        use PipelineStage::*;
        matches!(
            (self, next),
            (Received, Routed)
                | (Routed, Clarifying)
                | (Routed, Dispatched)
                | (Dispatched, Executed)
                | (Received | Routed | Clarifying | Dispatched | Executed, Answered)
        )
    }
}

/// 一轮处理的阶段记录
#[derive(Clone, Debug, Serialize)]
pub struct StageTrace {
    stages: Vec<PipelineStage>,
}

impl Default for StageTrace {
    fn default() -> Self {
        Self {
            stages: vec![PipelineStage::Received],
        }
    }
}

impl StageTrace {
    pub fn current(&self) -> PipelineStage {
        self.stages.last().copied().unwrap_or(PipelineStage::Received)
    }

    /// 推进到下一阶段；不合法的跳转只记日志，不改变状态
    pub fn advance(&mut self, next: PipelineStage) -> bool {
        let current = self.current();
        if current.can_advance_to(next) {
            self.stages.push(next);
            true
        } else {
            tracing::warn!(from = ?current, to = ?next, "illegal pipeline transition ignored");
            false
        }
    }

    pub fn stages(&self) -> &[PipelineStage] {
        &self.stages
    }
}

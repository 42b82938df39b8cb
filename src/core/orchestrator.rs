//! 编排器：一条用户指令的完整处理
//!
//! 路由 → Planner（按路由顺序逐个调用）→ 合并 → 一次执行全部动作 → 生成回复 → 写回会话。
//! 每个用户同一时刻只处理一条指令；process 永不失败，任何阶段出错（含 panic）都会落到一段可读文本上。
//! 取消与超时只作用于执行之前的阶段；动作开始执行后本轮会完整跑完。会话变更在回复生成后一次写回。

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::answer::{clarification_text, combine, AnswerInput, AnsweringFormatter, CombinedOutcome, FALLBACK_REPLY};
use crate::core::session::{Session, SessionManager};
use crate::core::state::{PipelineStage, StageTrace};
use crate::core::PipelineError;
use crate::memory::{
    EntityKind, EntityRef, ScheduleRecord, ScheduleStatus, ScheduleType, Store, TaskQuery, ISO_UTC_FORMAT,
};
use crate::notify::Notifier;
use crate::planners::timeparse::next_cron_run;
use crate::planners::{Destination, Planner, PlannerOutcome, PlannerRequest, UserContext};
use crate::router::{IntentRouter, RoutingDecision};
use crate::tools::{Action, ActionExecutor, ActionResult, ToolContext};

const CANCELLED_REPLY: &str = "Okay, I've stopped working on that.";
const TIMEOUT_REPLY: &str = "Sorry, that took too long to process. Please try again.";
const OPEN_TASKS_IN_CONTEXT: usize = 25;
const BRAIN_MEMORIES_IN_CONTEXT: usize = 25;

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub default_timezone: String,
    pub request_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            default_timezone: "UTC".to_string(),
            request_timeout: Duration::from_secs(90),
        }
    }
}

/// 一轮处理的结果
#[derive(Debug, Clone)]
pub struct TurnReport {
    pub reply: String,
    pub decisions: Vec<RoutingDecision>,
    pub outcome: CombinedOutcome,
    pub results: Vec<ActionResult>,
    pub stages: Vec<PipelineStage>,
}

/// 本轮对会话的变更，按发生顺序记录
#[derive(Debug)]
enum RefChange {
    Remember(EntityRef),
    Forget(EntityKind, String),
}

#[derive(Debug, Default)]
struct SessionUpdate {
    refs: Vec<RefChange>,
    /// (原始输入, 澄清后输入, 去向, 回复)
    history: Option<(String, String, String, String)>,
}

impl SessionUpdate {
    fn answered(text: &str, clarified: &str, source: &str, reply: &str) -> Self {
        Self {
            refs: Vec::new(),
            history: Some((text.to_string(), clarified.to_string(), source.to_string(), reply.to_string())),
        }
    }

    fn apply(self, session: &mut Session) {
        for change in self.refs {
            match change {
                RefChange::Remember(r) => session.refs.remember(r),
                RefChange::Forget(kind, id) => session.refs.forget(kind, &id),
            }
        }
        if let Some((text, clarified, source, reply)) = self.history {
            session.history.push(text, clarified, source, reply);
        }
    }
}

/// 规划完成、尚未执行的一轮
struct PlannedTurn {
    text: String,
    user_id: String,
    context: UserContext,
    decisions: Vec<RoutingDecision>,
    outcome: CombinedOutcome,
    trace: StageTrace,
}

enum Prepared {
    /// 路由失败或需要澄清：回复已生成
    Finished(TurnReport, SessionUpdate),
    Planned(PlannedTurn),
}

pub struct Orchestrator {
    router: IntentRouter,
    planners: HashMap<Destination, Arc<dyn Planner>>,
    executor: ActionExecutor,
    formatter: AnsweringFormatter,
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    sessions: SessionManager,
    settings: OrchestratorSettings,
    fixed_now: Option<DateTime<Utc>>,
}

impl Orchestrator {
    pub fn new(
        router: IntentRouter,
        executor: ActionExecutor,
        formatter: AnsweringFormatter,
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
        sessions: SessionManager,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            router,
            planners: HashMap::new(),
            executor,
            formatter,
            store,
            notifier,
            sessions,
            settings,
            fixed_now: None,
        }
    }

    /// 注册 Planner；同一去向后注册的覆盖先注册的
    pub fn with_planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planners.insert(planner.destination(), planner);
        self
    }

    /// 固定当前时间（测试用）
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.fixed_now = Some(now);
        self
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn executor(&self) -> &ActionExecutor {
        &self.executor
    }

    fn now(&self) -> DateTime<Utc> {
        self.fixed_now.unwrap_or_else(Utc::now)
    }

    /// 处理一条指令并返回回复文本
    pub async fn process(&self, user_id: &str, text: &str) -> String {
        self.process_with_cancel(user_id, text, CancellationToken::new()).await
    }

    /// 可取消的 process
    ///
    /// 等待会话锁、路由与规划期间可被取消或超时，此时会话与存储都保持不变；
    /// 动作开始执行后不再响应取消，回复与会话变更对应已生效的动作。
    pub async fn process_with_cancel(&self, user_id: &str, text: &str, cancel: CancellationToken) -> String {
        let prepare = async {
            let handle = self.sessions.session(user_id).await;
            let session = handle.lock_owned().await;
            let prepared = AssertUnwindSafe(self.prepare(&session, text)).catch_unwind().await;
            (session, prepared)
        };
        let (mut session, prepared) = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!(user_id = %user_id, "turn cancelled");
                return CANCELLED_REPLY.to_string();
            }
            prepared = tokio::time::timeout(self.settings.request_timeout, prepare) => match prepared {
                Ok(prepared) => prepared,
                Err(_) => {
                    tracing::warn!(user_id = %user_id, timeout = ?self.settings.request_timeout, "turn timed out");
                    return TIMEOUT_REPLY.to_string();
                }
            },
        };

        let finished = match prepared {
            Ok(Prepared::Finished(report, update)) => Ok((report, update)),
            Ok(Prepared::Planned(planned)) => AssertUnwindSafe(self.commit(planned)).catch_unwind().await,
            Err(panic) => Err(panic),
        };
        match finished {
            Ok((report, update)) => {
                update.apply(&mut session);
                report.reply
            }
            Err(_) => {
                tracing::error!(user_id = %user_id, "turn panicked");
                FALLBACK_REPLY.to_string()
            }
        }
    }

    /// 处理一条指令并返回完整过程记录；内部 panic 时回复为通用致歉
    pub async fn process_detailed(&self, user_id: &str, text: &str) -> TurnReport {
        let handle = self.sessions.session(user_id).await;
        let mut session = handle.lock().await;
        match AssertUnwindSafe(self.run_turn(&session, text)).catch_unwind().await {
            Ok((report, update)) => {
                update.apply(&mut session);
                report
            }
            Err(_) => {
                tracing::error!(user_id = %user_id, "turn panicked");
                TurnReport {
                    reply: FALLBACK_REPLY.to_string(),
                    decisions: Vec::new(),
                    outcome: CombinedOutcome::default(),
                    results: Vec::new(),
                    stages: vec![PipelineStage::Received],
                }
            }
        }
    }

    async fn user_context(&self, session: &Session) -> UserContext {
        let user_id = session.user_id.as_str();
        let mut ctx = UserContext::for_user(user_id);
        ctx.timezone = self.settings.default_timezone.clone();

        match self
            .store
            .list_tasks(
                user_id,
                &TaskQuery {
                    limit: OPEN_TASKS_IN_CONTEXT,
                    order_by: "due_date".to_string(),
                    ascending: true,
                    ..TaskQuery::default()
                },
            )
            .await
        {
            Ok(tasks) => ctx.open_tasks = tasks.into_iter().filter(|t| t.status != "done").collect(),
            Err(e) => tracing::warn!(user_id = %user_id, error = %e, "could not load open tasks"),
        }
        match self.store.list_memories(user_id, None, BRAIN_MEMORIES_IN_CONTEXT).await {
            Ok(memories) => ctx.brain = memories,
            Err(e) => tracing::warn!(user_id = %user_id, error = %e, "could not load brain memories"),
        }
        if let Some(tz) = ctx
            .brain
            .iter()
            .find(|m| m.memory_type == "user_info")
            .and_then(|m| m.data.get("timezone"))
            .and_then(Value::as_str)
            .filter(|tz| tz.parse::<chrono_tz::Tz>().is_ok())
        {
            ctx.timezone = tz.to_string();
        }
        ctx.recent_refs = session.refs.all();
        ctx.history = session.history.render();
        ctx
    }

    async fn run_turn(&self, session: &Session, text: &str) -> (TurnReport, SessionUpdate) {
        match self.prepare(session, text).await {
            Prepared::Finished(report, update) => (report, update),
            Prepared::Planned(planned) => self.commit(planned).await,
        }
    }

    /// 路由与规划；不产生任何副作用
    async fn prepare(&self, session: &Session, text: &str) -> Prepared {
        let now = self.now();
        let mut trace = StageTrace::default();
        let context = self.user_context(session).await;
        let user_id = session.user_id.clone();
        tracing::info!(user_id = %user_id, turn = session.turn() + 1, "received");

        let decisions = match self.router.resolve(text, &context.history, now).await {
            Ok(decisions) => decisions,
            Err(e) => {
                tracing::error!(user_id = %user_id, error = %e, "routing failed");
                let reply = e.user_message();
                trace.advance(PipelineStage::Answered);
                let update = SessionUpdate::answered(text, text, "RoutingFailure", &reply);
                let report = TurnReport {
                    reply,
                    decisions: Vec::new(),
                    outcome: CombinedOutcome::default(),
                    results: Vec::new(),
                    stages: trace.stages().to_vec(),
                };
                return Prepared::Finished(report, update);
            }
        };
        trace.advance(PipelineStage::Routed);

        let threshold = self.router.threshold();
        if let Some(unclear) = decisions.iter().find(|d| d.needs_clarification(threshold)) {
            tracing::info!(
                user_id = %user_id,
                confidence = unclear.confidence,
                rationale = %unclear.rationale,
                "routing ambiguity, asking for clarification"
            );
            trace.advance(PipelineStage::Clarifying);
            let reply = self
                .formatter
                .format(AnswerInput {
                    source: "IntentRouter",
                    command: text,
                    raw_text: &clarification_text(text),
                    results: &[],
                    found_data: &[],
                    context: &context,
                    clarification: true,
                })
                .await;
            trace.advance(PipelineStage::Answered);
            let update = SessionUpdate::answered(text, text, "NEEDS_CLARIFICATION", &reply);
            let report = TurnReport {
                reply,
                decisions,
                outcome: CombinedOutcome::default(),
                results: Vec::new(),
                stages: trace.stages().to_vec(),
            };
            return Prepared::Finished(report, update);
        }

        trace.advance(PipelineStage::Dispatched);
        let mut outcomes = Vec::with_capacity(decisions.len());
        for decision in &decisions {
            let destination = decision.destination.unwrap_or(Destination::Fallback);
            let outcome = self.dispatch(destination, &decision.clarified_command, &context, now).await;
            outcomes.push((destination, outcome));
        }
        Prepared::Planned(PlannedTurn {
            text: text.to_string(),
            user_id,
            context,
            decisions,
            outcome: combine(outcomes),
            trace,
        })
    }

    /// 执行动作并生成回复
    async fn commit(&self, planned: PlannedTurn) -> (TurnReport, SessionUpdate) {
        let PlannedTurn {
            text,
            user_id,
            context,
            decisions,
            outcome,
            mut trace,
        } = planned;

        let results = if outcome.actions.is_empty() {
            Vec::new()
        } else {
            let ctx = ToolContext::for_user(&user_id);
            let results = self.executor.execute_all(outcome.actions.clone(), &ctx).await;
            let failed = results.iter().filter(|r| !r.success).count();
            tracing::info!(user_id = %user_id, actions = results.len(), failed, "executed");
            results
        };
        trace.advance(PipelineStage::Executed);

        let mut update = SessionUpdate::default();
        update.refs.extend(outcome.refs.iter().cloned().map(RefChange::Remember));
        update.refs.extend(result_refs(&outcome.actions, &results));

        let clarified = decisions
            .iter()
            .map(|d| d.clarified_command.as_str())
            .collect::<Vec<_>>()
            .join(" | ");
        let reply = self
            .formatter
            .format(AnswerInput {
                source: outcome.source_label(),
                command: &clarified,
                raw_text: &outcome.response,
                results: &results,
                found_data: &outcome.found_data,
                context: &context,
                clarification: outcome.requires_clarification && results.is_empty(),
            })
            .await;
        trace.advance(PipelineStage::Answered);

        update.history = Some((text, clarified, outcome.source_label().to_string(), reply.clone()));
        let report = TurnReport {
            reply,
            decisions,
            outcome,
            results,
            stages: trace.stages().to_vec(),
        };
        (report, update)
    }

    async fn dispatch(
        &self,
        destination: Destination,
        command: &str,
        context: &UserContext,
        now: DateTime<Utc>,
    ) -> PlannerOutcome {
        let planner = self
            .planners
            .get(&destination)
            .or_else(|| self.planners.get(&Destination::Fallback));
        let Some(planner) = planner else {
            tracing::error!(destination = %destination, "no planner registered");
            return PlannerOutcome::error(FALLBACK_REPLY);
        };
        let request = PlannerRequest::new(command, context.clone()).at(now);
        let outcome = planner.plan(&request).await;
        tracing::info!(
            agent = %planner.destination(),
            success = outcome.success,
            actions = outcome.actions.len(),
            clarification = outcome.requires_clarification,
            "planned"
        );
        outcome
    }

    /// 外部调度器在日程到点时调用：执行日程动作、通知用户、推进下一次运行时间
    pub async fn fire_due_schedule(&self, user_id: &str, schedule: &ScheduleRecord) -> Result<String, PipelineError> {
        if schedule.status != ScheduleStatus::Active {
            return Err(PipelineError::PlannerValidation(format!(
                "Schedule '{}' is no longer active.",
                schedule.label()
            )));
        }
        let payload = schedule.action_payload.as_object().cloned().unwrap_or_default();
        let text = match schedule.action_type.as_str() {
            "send_notification" => payload
                .get("message")
                .and_then(Value::as_str)
                .map(|m| format!("⏰ Reminder: {m}"))
                .unwrap_or_else(|| format!("⏰ Reminder: {}", schedule.label())),
            "create_task" => {
                let result = self
                    .executor
                    .execute_action(Action::raw("create_task", payload), &ToolContext::for_user(user_id))
                    .await;
                if !result.success {
                    return Err(PipelineError::ToolExecution(result.error.unwrap_or_default()));
                }
                let title = result
                    .data
                    .as_ref()
                    .and_then(|d| d.get("title"))
                    .and_then(Value::as_str)
                    .unwrap_or("new task");
                format!("I've added the scheduled task '{title}' to your list.")
            }
            "execute_prompt" => {
                let prompt = payload
                    .get("prompt")
                    .or_else(|| payload.get("message"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| PipelineError::PlannerValidation("Scheduled prompt is empty.".into()))?;
                self.process(user_id, prompt).await
            }
            "daily_summary" => self.daily_summary(user_id).await?,
            other => {
                return Err(PipelineError::PlannerValidation(format!("Unknown scheduled action '{other}'.")));
            }
        };

        if let Err(e) = self.notifier.send(user_id, &text).await {
            tracing::warn!(user_id = %user_id, schedule = %schedule.id, error = %e, "notification failed");
        }
        self.advance_schedule(user_id, schedule).await?;
        Ok(text)
    }

    async fn daily_summary(&self, user_id: &str) -> Result<String, PipelineError> {
        let stats = self.store.task_stats(user_id).await?;
        let tasks = self
            .store
            .list_tasks(
                user_id,
                &TaskQuery {
                    status: Some("todo".to_string()),
                    limit: 5,
                    order_by: "due_date".to_string(),
                    ascending: true,
                    ..TaskQuery::default()
                },
            )
            .await?;
        let mut text = format!(
            "Here's your daily summary: {} open task(s), {} overdue, {} high priority.",
            stats.todo + stats.in_progress,
            stats.overdue,
            stats.high_priority_open
        );
        for task in tasks {
            text.push_str(&format!("\n- {}", task.title));
        }
        Ok(text)
    }

    /// 周期日程推进到下一次运行；一次性日程标记为完成
    async fn advance_schedule(&self, user_id: &str, schedule: &ScheduleRecord) -> Result<(), PipelineError> {
        let mut patch = Map::new();
        match schedule.schedule_type {
            ScheduleType::OneTime => {
                patch.insert("status".into(), Value::String("completed".into()));
            }
            ScheduleType::Recurring => {
                let tz = schedule.timezone.parse::<chrono_tz::Tz>().unwrap_or(chrono_tz::Tz::UTC);
                match next_cron_run(&schedule.schedule_value, tz, self.now()) {
                    Some(next) => {
                        patch.insert("next_run_at".into(), Value::String(next.format(ISO_UTC_FORMAT).to_string()));
                    }
                    None => {
                        tracing::warn!(schedule = %schedule.id, value = %schedule.schedule_value, "cron has no next run");
                        patch.insert("status".into(), Value::String("completed".into()));
                    }
                }
            }
        }
        self.store.update_schedule(user_id, &schedule.id, &patch).await?;
        Ok(())
    }
}

/// 按执行结果更新最近实体：新建、修改的记住，删除的忘掉
fn result_refs(actions: &[Action], results: &[ActionResult]) -> Vec<RefChange> {
    let mut changes = Vec::new();
    for (action, result) in actions.iter().zip(results) {
        if !result.success {
            continue;
        }
        let tool = action.tool_name();
        let Some(data) = result.data.as_ref() else {
            continue;
        };
        let kind = match tool.as_str() {
            "create_task" | "update_task" | "delete_task" => EntityKind::Task,
            "create_journal_entry" | "update_journal_entry" | "delete_journal_entry" => EntityKind::Journal,
            "create_schedule" | "update_schedule" | "delete_schedule" => EntityKind::Schedule,
            "create_or_update_memory" | "delete_memory" => EntityKind::Memory,
            _ => continue,
        };
        let Some(id) = data.get("id").and_then(Value::as_str) else {
            continue;
        };
        if tool.starts_with("delete_") {
            changes.push(RefChange::Forget(kind, id.to_string()));
            continue;
        }
        let title = match kind {
            EntityKind::Schedule => serde_json::from_value::<ScheduleRecord>(data.clone())
                .map(|s| s.label())
                .unwrap_or_default(),
            EntityKind::Memory => data.get("memory_type").and_then(Value::as_str).unwrap_or_default().to_string(),
            _ => data.get("title").and_then(Value::as_str).unwrap_or_default().to_string(),
        };
        changes.push(RefChange::Remember(EntityRef {
            kind,
            id: id.to_string(),
            title,
        }));
    }
    changes
}

//! 日程 Planner
//!
//! 子意图 create / list / find / update / delete。创建前先查活跃日程数是否已到上限，
//! 再解析时间：非周期表达先走确定性解析，含周期关键词或解析失败时交给模型产出 cron。
//! 周期日程不允许比每天一次更频繁（短语判定 + cron 相邻两次运行间隔判定）；一次性日程不限。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::resolve::{resolve, Candidate, Resolution};
use super::timeparse::{
    has_recurring_keyword, is_sub_daily_phrase, min_cron_gap, next_cron_run, normalize_cron, parse_iso_utc,
    parse_when,
};
use super::{ask_json, combine_steps, Destination, Planner, PlannerOutcome, PlannerRequest, Step};
use crate::core::PipelineError;
use crate::llm::LlmClient;
use crate::memory::{
    EntityKind, EntityRef, ScheduleRecord, ScheduleStatus, ScheduleType, Store, ISO_UTC_FORMAT,
};
use crate::tools::{schema_block, Action, KnownAction};

pub const ACTION_TYPES: &[&str] = &["send_notification", "create_task", "execute_prompt", "daily_summary"];

const TOO_FREQUENT: &str = "Recurring schedules can run at most once per day.";
const UNPARSABLE_TIME: &str = "I couldn't figure out the exact time for that schedule.";
const ALREADY_PASSED: &str = "That time has already passed.";
const FETCH_LIMIT: usize = 50;

/// 频率与数量限制
#[derive(Debug, Clone)]
pub struct ScheduleRules {
    pub max_active: usize,
    pub min_recurring_interval: Duration,
}

impl Default for ScheduleRules {
    fn default() -> Self {
        Self {
            max_active: 10,
            min_recurring_interval: Duration::hours(24),
        }
    }
}

/// 子意图
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ScheduleOp {
    /// create | list | find | update | delete
    pub intent: String,
    /// (create) send_notification | create_task | execute_prompt | daily_summary
    #[serde(default)]
    pub action_type: Option<String>,
    /// (create) 动作参数，如 {"message": "..."} 或 {"title": "..."}
    #[serde(default)]
    pub action_payload: Option<Value>,
    /// (create) 用户原话中的时间部分
    #[serde(default)]
    pub schedule_str: Option<String>,
    /// (find / update / delete) 目标日程的描述
    #[serde(default)]
    pub query: Option<String>,
    /// (update) 变更；改时间时放 schedule_str
    #[serde(default)]
    pub patch: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
struct OpList {
    operations: Vec<ScheduleOp>,
}

/// 模型的时间解析结果
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
struct TimeParseReply {
    /// one_time | recurring
    #[serde(default)]
    schedule_type: String,
    /// one_time: ISO 8601 UTC；recurring: 5 段 cron
    #[serde(default)]
    schedule_value: String,
    #[serde(default)]
    next_run_at: Option<String>,
    #[serde(default)]
    is_valid: bool,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
struct MatchReply {
    #[serde(default)]
    match_id: Option<String>,
}

/// 解析出的触发时间
#[derive(Debug, Clone, PartialEq)]
pub struct Timing {
    pub schedule_type: ScheduleType,
    pub schedule_value: String,
    pub next_run_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TimingVerdict {
    Valid(Timing),
    Invalid(String),
}

impl TimingVerdict {
    pub fn is_valid(&self) -> bool {
        matches!(self, TimingVerdict::Valid(_))
    }
}

pub struct SchedulePlanner {
    llm: Arc<dyn LlmClient>,
    store: Arc<dyn Store>,
    rules: ScheduleRules,
}

fn schedule_type_str(t: ScheduleType) -> &'static str {
    match t {
        ScheduleType::OneTime => "one_time",
        ScheduleType::Recurring => "recurring",
    }
}

fn status_str(s: ScheduleStatus) -> &'static str {
    match s {
        ScheduleStatus::Active => "active",
        ScheduleStatus::Completed => "completed",
        ScheduleStatus::Cancelled => "cancelled",
    }
}

/// find 回复里的时间描述
fn describe_timing(record: &ScheduleRecord) -> String {
    let next = record.next_run_at.clone().unwrap_or_else(|| "an unknown time".to_string());
    match record.schedule_type {
        ScheduleType::OneTime => format!("It is set to run once at {next}."),
        ScheduleType::Recurring => format!(
            "It repeats on the schedule '{}' and next runs at {next}.",
            record.schedule_value
        ),
    }
}

impl SchedulePlanner {
    pub fn new(llm: Arc<dyn LlmClient>, store: Arc<dyn Store>, rules: ScheduleRules) -> Self {
        Self { llm, store, rules }
    }

    pub async fn decompose(&self, command: &str, req: &PlannerRequest) -> Result<Vec<ScheduleOp>, PipelineError> {
        let system = format!(
            r#"### SCHEDULE INTENT ANALYSIS
Classify the user's scheduling command into a list of operations.
- `create`: a new reminder or automation. Set `action_type` (one of {}), `action_payload` (e.g. {{"message": "call mom"}} for send_notification, {{"title": "..."}} for create_task, {{"prompt": "..."}} for execute_prompt) and `schedule_str` (only the time words, e.g. "in 10 minutes", "every monday at 9am").
- `list`: show active schedules.
- `find`, `update`, `delete`: an existing schedule described by `query`; for `update` put the changes in `patch` (use the key "schedule_str" for a new time, "message" for a new text).
Current UTC time: {}. User's timezone: {}.

{}"#,
            ACTION_TYPES.join(", "),
            req.now_iso(),
            req.context.timezone,
            schema_block::<OpList>()
        );
        let messages = [
            crate::memory::Message::system(&system),
            crate::memory::Message::user(format!("User Command: \"{command}\"")),
        ];
        let reply = self.llm.complete(&messages).await?;
        Ok(super::parse_list::<ScheduleOp>(&reply, "operations")
            .or_else(|| crate::llm::parse_reply::<ScheduleOp>(&reply).map(|op| vec![op]))
            .unwrap_or_default())
    }

    async fn active_schedules(&self, user_id: &str) -> Result<Vec<ScheduleRecord>, PipelineError> {
        Ok(self
            .store
            .list_schedules(user_id, Some(ScheduleStatus::Active), FETCH_LIMIT.max(self.rules.max_active + 1))
            .await?)
    }

    /// 时间解析与频率校验
    pub async fn parse_timing(&self, phrase: &str, req: &PlannerRequest) -> Result<TimingVerdict, PipelineError> {
        let tz = req.context.tz();
        if is_sub_daily_phrase(phrase) {
            return Ok(TimingVerdict::Invalid(TOO_FREQUENT.to_string()));
        }
        if !has_recurring_keyword(phrase) {
            if let Some(at) = parse_when(phrase, req.now, tz) {
                if at < req.now {
                    return Ok(TimingVerdict::Invalid(ALREADY_PASSED.to_string()));
                }
                return Ok(TimingVerdict::Valid(Timing {
                    schedule_type: ScheduleType::OneTime,
                    schedule_value: at.format(ISO_UTC_FORMAT).to_string(),
                    next_run_at: at,
                }));
            }
        }

        let system = format!(
            r#"### SCHEDULE TIME PARSE
Convert the user's time expression into a schedule.
- One-time: schedule_type "one_time", schedule_value and next_run_at are the ISO 8601 UTC timestamp ({ISO_UTC_FORMAT}).
- Recurring: schedule_type "recurring", schedule_value is a standard 5-field cron expression in the user's local time (minute hour day month weekday, Sunday = 0), next_run_at is the next occurrence in UTC.
Recurring schedules may run at most once per day: anything more frequent must have is_valid false with a short reason.
Current UTC time: {}. User's timezone: {}. Dates without a time default to 5 PM local time.

{}"#,
            req.now_iso(),
            req.context.timezone,
            schema_block::<TimeParseReply>()
        );
        let Some(reply) = ask_json::<TimeParseReply>(&self.llm, &system, &format!("Time expression: \"{phrase}\"")).await?
        else {
            return Ok(TimingVerdict::Invalid(UNPARSABLE_TIME.to_string()));
        };
        if !reply.is_valid {
            let reason = reply.reason.filter(|r| !r.trim().is_empty()).unwrap_or_else(|| UNPARSABLE_TIME.to_string());
            return Ok(TimingVerdict::Invalid(reason));
        }

        let verdict = match reply.schedule_type.as_str() {
            "recurring" | "cron" => {
                let Some(cron) = normalize_cron(&reply.schedule_value) else {
                    return Ok(TimingVerdict::Invalid(UNPARSABLE_TIME.to_string()));
                };
                let gap = min_cron_gap(&cron, tz, req.now);
                if gap.is_some_and(|g| g < self.rules.min_recurring_interval) {
                    tracing::info!(cron = %cron, "recurring schedule rejected as too frequent");
                    return Ok(TimingVerdict::Invalid(TOO_FREQUENT.to_string()));
                }
                match next_cron_run(&cron, tz, req.now) {
                    Some(next) => TimingVerdict::Valid(Timing {
                        schedule_type: ScheduleType::Recurring,
                        schedule_value: cron,
                        next_run_at: next,
                    }),
                    None => TimingVerdict::Invalid(UNPARSABLE_TIME.to_string()),
                }
            }
            _ => {
                let at = reply
                    .next_run_at
                    .as_deref()
                    .and_then(parse_iso_utc)
                    .or_else(|| parse_iso_utc(&reply.schedule_value));
                match at {
                    Some(at) if at < req.now => TimingVerdict::Invalid(ALREADY_PASSED.to_string()),
                    Some(at) => TimingVerdict::Valid(Timing {
                        schedule_type: ScheduleType::OneTime,
                        schedule_value: at.format(ISO_UTC_FORMAT).to_string(),
                        next_run_at: at,
                    }),
                    None => TimingVerdict::Invalid(UNPARSABLE_TIME.to_string()),
                }
            }
        };
        Ok(verdict)
    }

    /// planned：本条指令中已接受、尚未落库的创建数
    async fn create(&self, op: &ScheduleOp, req: &PlannerRequest, planned: usize) -> Result<Step, PipelineError> {
        let active = self.active_schedules(&req.context.user_id).await?.len() + planned;
        if active >= self.rules.max_active {
            tracing::info!(user_id = %req.context.user_id, active, "schedule ceiling reached");
            return Ok(Step::Halt(PlannerOutcome::error(format!(
                "You have reached the maximum of {} active schedules.",
                self.rules.max_active
            ))));
        }

        let phrase = op
            .schedule_str
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| req.command.clone());
        let timing = match self.parse_timing(&phrase, req).await? {
            TimingVerdict::Valid(t) => t,
            TimingVerdict::Invalid(reason) => return Ok(Step::Halt(PlannerOutcome::error(reason))),
        };

        let action_type = op
            .action_type
            .clone()
            .filter(|t| ACTION_TYPES.contains(&t.as_str()))
            .unwrap_or_else(|| "send_notification".to_string());
        let mut payload = match op.action_payload.clone() {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        if action_type == "send_notification" && !payload.contains_key("message") {
            payload.insert("message".into(), json!(req.command));
        }

        let action = KnownAction::CreateSchedule {
            action_type,
            action_payload: Value::Object(payload),
            schedule_type: schedule_type_str(timing.schedule_type).to_string(),
            schedule_value: timing.schedule_value,
            timezone: Some(req.context.timezone.clone()),
            next_run_at: Some(timing.next_run_at.format(ISO_UTC_FORMAT).to_string()),
        };
        Ok(Step::done("Okay, I've scheduled that for you!", vec![action.into()]))
    }

    /// 消解目标日程：先按名称匹配，匹配不到再让模型在已取回的日程中挑 id
    async fn locate(&self, op: &ScheduleOp, req: &PlannerRequest) -> Result<Result<ScheduleRecord, Step>, PipelineError> {
        let query = op.query.clone().unwrap_or_default();
        let schedules = self.active_schedules(&req.context.user_id).await?;
        if schedules.is_empty() {
            return Ok(Err(Step::done("You don't have any active schedules.", Vec::new())));
        }

        let candidates: Vec<Candidate> = schedules.iter().map(|s| Candidate::new(&s.id, s.label())).collect();
        let recent: Vec<EntityRef> = req
            .context
            .recent_refs
            .iter()
            .filter(|r| r.kind == EntityKind::Schedule)
            .cloned()
            .collect();
        let by_id = |id: &str| schedules.iter().find(|s| s.id == id).cloned();

        match resolve(&query, &candidates, &recent) {
            Resolution::Found(c) => {
                if let Some(record) = by_id(&c.id) {
                    return Ok(Ok(record));
                }
            }
            Resolution::Ambiguous(options) => {
                let names: Vec<String> = options.into_iter().map(|c| c.title).collect();
                return Ok(Err(Step::Halt(PlannerOutcome::clarify(format!(
                    "I found a few similar schedules. Which one did you mean?\n- '{}'",
                    names.join("', '")
                )))));
            }
            Resolution::NotFound => {}
        }

        let listing: Vec<Value> = schedules
            .iter()
            .map(|s| json!({"id": s.id, "label": s.label(), "action_type": s.action_type, "schedule_value": s.schedule_value, "next_run_at": s.next_run_at}))
            .collect();
        let system = r#"### SCHEDULE MATCH
Pick the ONE schedule from the list that the user is referring to.
Respond with ONLY a JSON object: {"match_id": "<id>"}; use null when nothing matches."#;
        let user = format!(
            "User's description: \"{query}\"\nSchedules:\n{}",
            serde_json::to_string_pretty(&listing).unwrap_or_default()
        );
        let matched = ask_json::<MatchReply>(&self.llm, system, &user)
            .await?
            .and_then(|m| m.match_id)
            .and_then(|id| by_id(&id));
        Ok(matched.ok_or_else(|| {
            Step::Halt(PlannerOutcome::error(format!("I couldn't find a schedule matching '{query}'.")))
        }))
    }

    fn with_ref(step: Step, record: &ScheduleRecord) -> Step {
        match step {
            Step::Done { response, actions, mut refs } => {
                refs.push(EntityRef {
                    kind: EntityKind::Schedule,
                    id: record.id.clone(),
                    title: record.label(),
                });
                Step::Done { response, actions, refs }
            }
            halt => halt,
        }
    }

    async fn find(&self, op: &ScheduleOp, req: &PlannerRequest) -> Result<Step, PipelineError> {
        let record = match self.locate(op, req).await? {
            Ok(record) => record,
            Err(step) => return Ok(step),
        };
        let response = format!(
            "I found it! Your schedule for '{}'.\n{}\nIts status is currently '{}'.",
            record.label(),
            describe_timing(&record),
            status_str(record.status)
        );
        Ok(Self::with_ref(Step::done(response, Vec::new()), &record))
    }

    async fn update(&self, op: &ScheduleOp, req: &PlannerRequest) -> Result<Step, PipelineError> {
        let Some(mut patch) = op.patch.clone().filter(|p| !p.is_empty()) else {
            return Ok(Step::Halt(PlannerOutcome::error(
                "What would you like to change about that schedule?",
            )));
        };
        let record = match self.locate(op, req).await? {
            Ok(record) => record,
            Err(step) => return Ok(step),
        };

        if let Some(Value::String(phrase)) = patch.remove("schedule_str") {
            match self.parse_timing(&phrase, req).await? {
                TimingVerdict::Valid(t) => {
                    patch.insert("schedule_type".into(), json!(schedule_type_str(t.schedule_type)));
                    patch.insert("schedule_value".into(), json!(t.schedule_value));
                    patch.insert("next_run_at".into(), json!(t.next_run_at.format(ISO_UTC_FORMAT).to_string()));
                }
                TimingVerdict::Invalid(reason) => return Ok(Step::Halt(PlannerOutcome::error(reason))),
            }
        }
        if let Some(message) = patch.remove("message") {
            let mut payload = match record.action_payload.clone() {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            payload.insert("message".into(), message);
            patch.insert("action_payload".into(), Value::Object(payload));
        }

        let action = KnownAction::UpdateSchedule {
            schedule_id: record.id.clone(),
            patch,
        };
        Ok(Self::with_ref(
            Step::done("Okay, I'll update that schedule.", vec![action.into()]),
            &record,
        ))
    }

    async fn delete(&self, op: &ScheduleOp, req: &PlannerRequest) -> Result<Step, PipelineError> {
        let record = match self.locate(op, req).await? {
            Ok(record) => record,
            Err(step) => return Ok(step),
        };
        let action = KnownAction::DeleteSchedule {
            schedule_id: record.id.clone(),
        };
        Ok(Self::with_ref(
            Step::done("Okay, I've cancelled that schedule.", vec![action.into()]),
            &record,
        ))
    }

    async fn plan_inner(&self, req: &PlannerRequest) -> Result<PlannerOutcome, PipelineError> {
        let ops = self.decompose(&req.command, req).await?;
        tracing::info!(
            user_id = %req.context.user_id,
            ops = ?ops.iter().map(|o| o.intent.as_str()).collect::<Vec<_>>(),
            "schedule intents"
        );

        let mut steps = Vec::with_capacity(ops.len());
        let mut planned = 0;
        for op in &ops {
            let step = match op.intent.as_str() {
                "create" => {
                    let step = self.create(op, req, planned).await?;
                    if matches!(step, Step::Done { .. }) {
                        planned += 1;
                    }
                    step
                }
                "list" => {
                    let action = KnownAction::GetSchedules {
                        status: Some("active".into()),
                        limit: Some(FETCH_LIMIT as u32),
                    };
                    Step::done("Let me get a list of your active schedules...", vec![action.into()])
                }
                "find" => self.find(op, req).await?,
                "update" => self.update(op, req).await?,
                "delete" | "cancel" => self.delete(op, req).await?,
                other => {
                    tracing::debug!(intent = %other, "unknown schedule intent");
                    continue;
                }
            };
            steps.push(step);
        }
        Ok(combine_steps(steps)
            .unwrap_or_else(|| PlannerOutcome::error("I'm not sure what you'd like me to do with your schedules.")))
    }
}

#[async_trait]
impl Planner for SchedulePlanner {
    fn destination(&self) -> Destination {
        Destination::Schedule
    }

    async fn plan(&self, request: &PlannerRequest) -> PlannerOutcome {
        match self.plan_inner(request).await {
            Ok(outcome) => outcome,
            Err(e) => PlannerOutcome::from_error(&e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use crate::memory::{InMemoryStore, NewSchedule};
    use crate::planners::UserContext;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap()
    }

    fn request(command: &str) -> PlannerRequest {
        PlannerRequest::new(command, UserContext::for_user("u1")).at(now())
    }

    fn create_op(schedule_str: &str) -> String {
        json!({"operations": [{"intent": "create", "action_type": "send_notification",
            "action_payload": {"message": "drink water"}, "schedule_str": schedule_str}]})
        .to_string()
    }

    async fn seed(store: &InMemoryStore, n: usize) {
        for i in 0..n {
            store
                .create_schedule(
                    "u1",
                    NewSchedule {
                        action_type: "send_notification".into(),
                        action_payload: json!({"message": format!("reminder {i}")}),
                        schedule_type: ScheduleType::OneTime,
                        schedule_value: "2025-03-11T09:00:00Z".into(),
                        timezone: "UTC".into(),
                        next_run_at: Some("2025-03-11T09:00:00Z".into()),
                    },
                    100,
                )
                .await
                .unwrap();
        }
    }

    fn planner(llm: MockLlmClient, store: InMemoryStore) -> SchedulePlanner {
        SchedulePlanner::new(Arc::new(llm), Arc::new(store), ScheduleRules::default())
    }

    #[tokio::test]
    async fn test_hourly_recurring_is_rejected_without_actions() {
        let llm = MockLlmClient::new().with_rule("SCHEDULE INTENT ANALYSIS", create_op("every hour"));
        let p = planner(llm, InMemoryStore::new());
        let verdict = p.parse_timing("every hour", &request("x")).await.unwrap();
        assert!(!verdict.is_valid());

        let outcome = p.plan(&request("remind me to drink water every hour")).await;
        assert!(!outcome.success);
        assert!(outcome.actions.is_empty());
        assert_eq!(outcome.response, format!("❌ {TOO_FREQUENT}"));
    }

    #[tokio::test]
    async fn test_model_cron_more_frequent_than_daily_is_rejected() {
        let llm = MockLlmClient::new().with_rule(
            "SCHEDULE TIME PARSE",
            r#"{"schedule_type": "recurring", "schedule_value": "0 */6 * * *", "is_valid": true}"#,
        );
        let p = planner(llm, InMemoryStore::new());
        let verdict = p.parse_timing("every day at breakfast, lunch and dinner", &request("x")).await.unwrap();
        assert_eq!(verdict, TimingVerdict::Invalid(TOO_FREQUENT.to_string()));
    }

    #[tokio::test]
    async fn test_one_time_in_one_minute_is_valid() {
        let llm = MockLlmClient::new().with_rule("SCHEDULE INTENT ANALYSIS", create_op("in 1 minute"));
        let p = planner(llm, InMemoryStore::new());
        let verdict = p.parse_timing("in 1 minute", &request("x")).await.unwrap();
        assert!(verdict.is_valid());

        let outcome = p.plan(&request("remind me to drink water in 1 minute")).await;
        assert!(outcome.success);
        assert_eq!(outcome.response, "Okay, I've scheduled that for you!");
        let (tool, params) = outcome.actions[0].clone().into_call();
        assert_eq!(tool, "create_schedule");
        assert_eq!(params["schedule_type"], "one_time");
        assert_eq!(params["next_run_at"], "2025-03-10T12:01:00Z");
    }

    #[tokio::test]
    async fn test_daily_recurring_uses_model_cron() {
        let llm = MockLlmClient::new()
            .with_rule("SCHEDULE INTENT ANALYSIS", create_op("every day at 9am"))
            .with_rule(
                "SCHEDULE TIME PARSE",
                r#"{"schedule_type": "recurring", "schedule_value": "0 9 * * *", "is_valid": true}"#,
            );
        let p = planner(llm, InMemoryStore::new());
        let outcome = p.plan(&request("remind me to drink water every day at 9am")).await;
        let (_, params) = outcome.actions[0].clone().into_call();
        assert_eq!(params["schedule_type"], "recurring");
        assert_eq!(params["schedule_value"], "0 0 9 * * *");
        assert_eq!(params["next_run_at"], "2025-03-11T09:00:00Z");
    }

    #[tokio::test]
    async fn test_ceiling_blocks_before_time_parsing() {
        let store = InMemoryStore::new();
        seed(&store, 10).await;
        let llm = Arc::new(MockLlmClient::new().with_rule("SCHEDULE INTENT ANALYSIS", create_op("in 1 minute")));
        let p = SchedulePlanner::new(llm.clone(), Arc::new(store), ScheduleRules::default());
        let outcome = p.plan(&request("remind me in 1 minute")).await;
        assert!(outcome.actions.is_empty());
        assert_eq!(outcome.response, "❌ You have reached the maximum of 10 active schedules.");
        assert_eq!(llm.call_count(), 1);
    }

    #[tokio::test]
    async fn test_past_one_time_is_rejected_on_fast_path() {
        let p = planner(MockLlmClient::new(), InMemoryStore::new());
        let verdict = p.parse_timing("on 2020-01-01 09:00", &request("x")).await.unwrap();
        assert_eq!(verdict, TimingVerdict::Invalid(ALREADY_PASSED.to_string()));
        let verdict = p.parse_timing("today at 9am", &request("x")).await.unwrap();
        assert_eq!(verdict, TimingVerdict::Invalid(ALREADY_PASSED.to_string()));
        assert!(p.parse_timing("today at 3pm", &request("x")).await.unwrap().is_valid());
    }

    #[tokio::test]
    async fn test_past_reminder_plans_no_action() {
        let llm = MockLlmClient::new().with_rule("SCHEDULE INTENT ANALYSIS", create_op("on 2020-01-01 09:00"));
        let p = planner(llm, InMemoryStore::new());
        let outcome = p.plan(&request("remind me to drink water on 2020-01-01 09:00")).await;
        assert!(outcome.actions.is_empty());
        assert_eq!(outcome.response, format!("❌ {ALREADY_PASSED}"));
    }

    #[tokio::test]
    async fn test_ceiling_counts_creates_in_same_command() {
        let store = InMemoryStore::new();
        seed(&store, 9).await;
        let llm = MockLlmClient::new().with_rule(
            "SCHEDULE INTENT ANALYSIS",
            json!({"operations": [
                {"intent": "create", "action_payload": {"message": "stretch"}, "schedule_str": "in 5 minutes"},
                {"intent": "create", "action_payload": {"message": "drink water"}, "schedule_str": "in 10 minutes"}
            ]})
            .to_string(),
        );
        let p = planner(llm, store);
        let outcome = p.plan(&request("remind me to stretch in 5 minutes and drink water in 10 minutes")).await;
        assert!(!outcome.success);
        assert!(outcome.actions.is_empty());
        assert_eq!(outcome.response, "❌ You have reached the maximum of 10 active schedules.");
    }

    #[tokio::test]
    async fn test_delete_by_label() {
        let store = InMemoryStore::new();
        seed(&store, 2).await;
        let llm = MockLlmClient::new().with_rule(
            "SCHEDULE INTENT ANALYSIS",
            r#"{"operations": [{"intent": "delete", "query": "reminder 1"}]}"#,
        );
        let p = planner(llm, store);
        let outcome = p.plan(&request("cancel reminder 1")).await;
        assert_eq!(outcome.response, "Okay, I've cancelled that schedule.");
        assert_eq!(outcome.actions[0].tool_name(), "delete_schedule");
        assert_eq!(outcome.context_update.unwrap().refs[0].title, "reminder 1");
    }

    #[tokio::test]
    async fn test_model_match_id_must_exist() {
        let store = InMemoryStore::new();
        seed(&store, 1).await;
        let llm = MockLlmClient::new()
            .with_rule("SCHEDULE INTENT ANALYSIS", r#"{"intent": "find", "query": "the gym one"}"#)
            .with_rule("SCHEDULE MATCH", r#"{"match_id": "not-a-real-id"}"#);
        let p = planner(llm, store);
        let outcome = p.plan(&request("when is the gym one")).await;
        assert_eq!(outcome.response, "❌ I couldn't find a schedule matching 'the gym one'.");
    }

    #[tokio::test]
    async fn test_find_describes_schedule() {
        let store = InMemoryStore::new();
        seed(&store, 1).await;
        let llm = MockLlmClient::new().with_rule(
            "SCHEDULE INTENT ANALYSIS",
            r#"{"operations": [{"intent": "find", "query": "reminder 0"}]}"#,
        );
        let p = planner(llm, store);
        let outcome = p.plan(&request("when is reminder 0")).await;
        assert!(outcome.actions.is_empty());
        assert_eq!(
            outcome.response,
            "I found it! Your schedule for 'reminder 0'.\nIt is set to run once at 2025-03-11T09:00:00Z.\nIts status is currently 'active'."
        );
    }

    #[tokio::test]
    async fn test_list_and_empty_lookup() {
        let llm = MockLlmClient::new().with_rule(
            "SCHEDULE INTENT ANALYSIS",
            r#"{"operations": [{"intent": "list"}, {"intent": "delete", "query": "anything"}]}"#,
        );
        let p = planner(llm, InMemoryStore::new());
        let outcome = p.plan(&request("show my schedules and delete anything")).await;
        assert_eq!(
            outcome.response,
            "Let me get a list of your active schedules...\nYou don't have any active schedules."
        );
        assert_eq!(outcome.actions.len(), 1);
    }
}

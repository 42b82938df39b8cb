//! 任务 Planner
//!
//! 第一次模型调用把指令拆成子意图列表（create / list / update / complete / delete / batch）；
//! 所有新建任务合并成一次分析调用（分类 + 截止时间归一化），优先复用用户已有分类。
//! 按名称指代的任务先查最近出现过的实体，再模糊匹配；多个候选时返回澄清。

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::resolve::{resolve, Candidate, Resolution};
use super::timeparse::{parse_iso_utc, parse_when};
use super::{ask_json, ask_json_list, combine_steps, Destination, Planner, PlannerOutcome, PlannerRequest, Step};
use crate::core::PipelineError;
use crate::llm::LlmClient;
use crate::memory::{EntityKind, EntityRef, Message, Store, TaskQuery, TaskRecord, ISO_UTC_FORMAT};
use crate::tools::{schema_block, Action, KnownAction};

pub const BASE_CATEGORIES: &[&str] = &["work", "personal", "health", "finance", "home", "learning", "shopping"];

const URGENT_WORDS: &[&str] = &["urgent", "asap", "critical", "important", "emergency"];

/// 新建任务的描述
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct NewTaskSpec {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    /// 用户原话中的截止时间（如 "tomorrow at 10am"）
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TaskFilters {
    /// 要匹配的任务的自然语言描述
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// 子意图
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TaskIntent {
    /// create_task | list_tasks | update_task | complete_task | delete_task | batch_operation
    pub intent: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    /// 单任务操作的目标标题
    #[serde(default)]
    pub title_match: Option<String>,
    #[serde(default)]
    pub patch: Option<Map<String, Value>>,
    /// 批量操作：create | delete | complete | update
    #[serde(default)]
    pub operation: Option<String>,
    #[serde(default)]
    pub tasks_to_create: Vec<NewTaskSpec>,
    #[serde(default)]
    pub filters: Option<TaskFilters>,
}

#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
struct IntentList {
    intents: Vec<TaskIntent>,
}

/// 批量分析的单项结果
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
struct TaskAnalysis {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    normalized_due_date: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
struct FilterReply {
    #[serde(default)]
    task_ids: Vec<Value>,
}

pub struct TaskPlanner {
    llm: Arc<dyn LlmClient>,
    store: Arc<dyn Store>,
}

/// 启发式优先级
pub fn heuristic_priority(title: &str, description: &str, has_due_date: bool) -> &'static str {
    let content = format!("{title} {description}").to_lowercase();
    if URGENT_WORDS.iter().any(|w| content.contains(w)) {
        "high"
    } else if has_due_date {
        "medium"
    } else {
        "low"
    }
}

fn id_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn task_ref(task: &TaskRecord) -> EntityRef {
    EntityRef {
        kind: EntityKind::Task,
        id: task.id.clone(),
        title: task.title.clone(),
    }
}

impl TaskPlanner {
    pub fn new(llm: Arc<dyn LlmClient>, store: Arc<dyn Store>) -> Self {
        Self { llm, store }
    }

    fn intent_prompt() -> String {
        format!(
            r#"### TASK INTENT ANALYSIS
Analyze the user's command for task management and decompose it into a list of sub-intents.

**CRITICAL GOAL:** distinguish a command for a SINGLE task from a command for MULTIPLE tasks. Commands listing several items separated by commas or "and", or using "all"/"every", are a `batch_operation`.

Definitions:
- `intent`: one of create_task, list_tasks, update_task, complete_task, delete_task, batch_operation.
- `title`: (create_task) the main subject. `due_date`: the user's raw time words.
- `title_match`: (single task ops) the title of the task to modify.
- `patch`: (update_task) a dictionary of changes.
- `operation`: (batch) create, delete, complete or update.
- `tasks_to_create`: (batch create) list of new task objects with `title` and optional `due_date`.
- `filters`: {{"description": "...", "status": "todo"}} describing the tasks to find.

Examples:
- "buy milk, walk the dog" -> {{"intents": [{{"intent": "batch_operation", "operation": "create", "tasks_to_create": [{{"title": "buy milk"}}, {{"title": "walk the dog"}}]}}]}}
- "mark 'Finalize slides' as done" -> {{"intents": [{{"intent": "complete_task", "title_match": "Finalize slides"}}]}}
- "delete all tasks about Project X" -> {{"intents": [{{"intent": "batch_operation", "operation": "delete", "filters": {{"description": "tasks about Project X", "status": "todo"}}}}]}}
- "show me my high priority tasks" -> {{"intents": [{{"intent": "list_tasks", "filters": {{"description": "high priority tasks", "status": "todo"}}}}]}}

{}"#,
            schema_block::<IntentList>()
        )
    }

    /// 第一次调用：子意图列表；无法解析时按新建单个任务处理
    pub async fn decompose(&self, command: &str) -> Result<Vec<TaskIntent>, PipelineError> {
        let system = Self::intent_prompt();
        let user = format!("User Command: \"{command}\"");
        let messages = [Message::system(&system), Message::user(&user)];
        let reply = self.llm.complete(&messages).await?;

        let intents = super::parse_list::<TaskIntent>(&reply, "intents")
            .or_else(|| crate::llm::parse_reply::<TaskIntent>(&reply).map(|i| vec![i]))
            .filter(|list| !list.is_empty());
        Ok(intents.unwrap_or_else(|| {
            tracing::warn!("could not parse task intent, defaulting to create_task");
            vec![TaskIntent {
                intent: "create_task".into(),
                title: Some(command.to_string()),
                ..TaskIntent::default()
            }]
        }))
    }

    async fn vocabulary(&self, user_id: &str) -> Vec<String> {
        let mut set: BTreeSet<String> = BASE_CATEGORIES.iter().map(|s| s.to_string()).collect();
        match self.store.categories(user_id).await {
            Ok(index) => set.extend(index.tasks.into_iter().map(|c| c.to_lowercase())),
            Err(e) => tracing::warn!(error = %e, "could not load task categories"),
        }
        set.into_iter().collect()
    }

    async fn open_tasks(&self, user_id: &str, status: &str) -> Result<Vec<TaskRecord>, PipelineError> {
        let query = TaskQuery {
            status: Some(status.to_string()),
            limit: 200,
            ..TaskQuery::default()
        };
        Ok(self.store.list_tasks(user_id, &query).await?)
    }

    /// 所有新建任务一次分析
    async fn create_tasks(&self, specs: Vec<NewTaskSpec>, req: &PlannerRequest) -> Result<Step, PipelineError> {
        let specs: Vec<NewTaskSpec> = specs.into_iter().filter(|s| !s.title.trim().is_empty()).collect();
        if specs.is_empty() {
            return Ok(Step::Halt(PlannerOutcome::error("I couldn't parse any valid tasks from your request.")));
        }
        let tz = req.context.tz();

        let needs_analysis = specs.iter().any(|s| {
            s.category.is_none() || s.due_date.as_deref().is_some_and(|d| parse_when(d, req.now, tz).is_none())
        });
        let analyses: Vec<TaskAnalysis> = if needs_analysis {
            let vocabulary = self.vocabulary(&req.context.user_id).await;
            let system = format!(
                r#"### TASK BATCH ANALYSIS
Analyze a list of new tasks and return a JSON array with one analysis object per task, in the same order.
Categorization rules:
1. If the user specified a category for a task, keep it.
2. Otherwise reuse one of the user's existing categories when it fits: {}
3. Only if nothing fits, create a new, specific, project-focused category.
Due date: if a task has a `due_date` string, convert it to an ISO 8601 UTC timestamp ({}). Current time: {}. User's timezone: {}. Use 5 PM local time for dates without times. If invalid, use null.
Respond with ONLY a JSON array of objects with keys "title", "category", "normalized_due_date"."#,
                serde_json::to_string(&vocabulary).unwrap_or_default(),
                ISO_UTC_FORMAT,
                req.now_iso(),
                req.context.timezone,
            );
            let user = serde_json::to_string_pretty(&specs).unwrap_or_default();
            match ask_json_list::<TaskAnalysis>(&self.llm, &system, &user, "tasks").await? {
                Some(list) if list.len() == specs.len() => list,
                _ => {
                    tracing::warn!(count = specs.len(), "task analysis unusable, using defaults");
                    vec![TaskAnalysis::default(); specs.len()]
                }
            }
        } else {
            vec![TaskAnalysis::default(); specs.len()]
        };

        let mut actions = Vec::with_capacity(specs.len());
        let mut summary = Vec::new();
        for (spec, analysis) in specs.into_iter().zip(analyses) {
            let category = spec
                .category
                .clone()
                .or(analysis.category)
                .map(|c| c.trim().to_lowercase())
                .filter(|c| !c.is_empty())
                .unwrap_or_else(|| "general".to_string());
            let due_date = spec
                .due_date
                .as_deref()
                .and_then(|d| parse_when(d, req.now, tz).or_else(|| parse_iso_utc(d)))
                .or_else(|| {
                    spec.due_date
                        .as_ref()
                        .and(analysis.normalized_due_date.as_deref())
                        .and_then(parse_iso_utc)
                })
                .map(|t| t.format(ISO_UTC_FORMAT).to_string());
            let description = spec.description.clone().unwrap_or_default();
            let priority = heuristic_priority(&spec.title, &description, due_date.is_some());
            summary.push((spec.title.clone(), category.clone()));
            actions.push(Action::from(KnownAction::CreateTask {
                title: spec.title,
                description: Some(description),
                notes: Some(spec.notes.unwrap_or_default()),
                priority: Some(priority.to_string()),
                due_date,
                category: Some(category),
            }));
        }

        let response = match summary.as_slice() {
            [(title, category)] => format!("Okay, I've added the task '{title}' to your '{category}' category."),
            many => format!("Okay, I've added {} new tasks to your list.", many.len()),
        };
        Ok(Step::Done {
            response,
            actions,
            refs: Vec::new(),
        })
    }

    /// 用模型从候选任务中挑出符合描述的 id（只接受候选中存在的 id）
    async fn filter_tasks(
        &self,
        description: &str,
        candidates: &[TaskRecord],
        req: &PlannerRequest,
    ) -> Result<Vec<TaskRecord>, PipelineError> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let listing: Vec<Value> = candidates
            .iter()
            .map(|t| json!({"id": t.id, "title": t.title, "category": t.category, "description": t.description, "due_date": t.due_date, "priority": t.priority}))
            .collect();
        let system = format!(
            r#"### TASK FILTER
You are a smart task filter. Select ALL tasks from the candidate list that match the user's request.
Current UTC time: {}. User's timezone: {}.
Respond with ONLY a JSON object: {{"task_ids": ["<id>", ...]}}; use an empty list when nothing matches."#,
            req.now_iso(),
            req.context.timezone
        );
        let user = format!(
            "Filter request: \"{description}\"\nCandidate tasks:\n{}",
            serde_json::to_string_pretty(&listing).unwrap_or_default()
        );
        let reply: FilterReply = ask_json(&self.llm, &system, &user).await?.unwrap_or_default();
        let wanted: BTreeSet<String> = reply.task_ids.iter().filter_map(id_string).collect();
        Ok(candidates.iter().filter(|t| wanted.contains(&t.id)).cloned().collect())
    }

    async fn list_tasks(&self, intent: &TaskIntent, req: &PlannerRequest) -> Result<Step, PipelineError> {
        let filters = intent.filters.clone().unwrap_or_default();
        let status = filters.status.unwrap_or_else(|| "todo".to_string());
        let stats = Action::from(KnownAction::GetTaskStats {});

        let Some(description) = filters.description.filter(|d| !d.trim().is_empty()) else {
            let list = Action::from(KnownAction::GetTasks {
                status: Some(status.clone()),
                priority: None,
                category: None,
                limit: Some(15),
                order_by: Some("due_date".into()),
                ascending: Some(true),
                task_ids: None,
            });
            return Ok(Step::Done {
                response: format!("Let me get your current {status} tasks..."),
                actions: vec![list, stats],
                refs: Vec::new(),
            });
        };

        let candidates = self.open_tasks(&req.context.user_id, &status).await?;
        let matched = self.filter_tasks(&description, &candidates, req).await?;
        if matched.is_empty() {
            return Ok(Step::done(
                format!("I couldn't find any {status} tasks matching your description."),
                Vec::new(),
            ));
        }
        let list = Action::from(KnownAction::GetTasks {
            status: None,
            priority: None,
            category: None,
            limit: None,
            order_by: Some("due_date".into()),
            ascending: Some(true),
            task_ids: Some(matched.iter().map(|t| t.id.clone()).collect()),
        });
        Ok(Step::Done {
            response: format!("Here are the {status} tasks I found related to your request..."),
            actions: vec![list, stats],
            refs: matched.iter().map(task_ref).collect(),
        })
    }

    /// 截止时间归一化：确定性解析 → 已是 ISO → 模型解析
    async fn normalize_due(&self, raw: &str, req: &PlannerRequest) -> Result<Option<String>, PipelineError> {
        let tz = req.context.tz();
        if let Some(t) = parse_when(raw, req.now, tz).or_else(|| parse_iso_utc(raw)) {
            return Ok(Some(t.format(ISO_UTC_FORMAT).to_string()));
        }
        let system = format!(
            r#"### TIME NORMALIZATION
Convert the user's time expression into a single ISO 8601 UTC timestamp ({ISO_UTC_FORMAT}).
Current UTC time: {}. User's timezone: {}. For dates without times use 5 PM local time.
If the expression is not a date, respond "Error". Respond with ONLY the timestamp string or "Error"."#,
            req.now_iso(),
            req.context.timezone
        );
        let messages = [Message::system(&system), Message::user(raw)];
        let reply = self.llm.complete(&messages).await?;
        Ok(parse_iso_utc(reply.trim().trim_matches('"')).map(|t| t.format(ISO_UTC_FORMAT).to_string()))
    }

    async fn modify_one(&self, intent: &TaskIntent, mode: &str, req: &PlannerRequest) -> Result<Step, PipelineError> {
        let Some(target) = intent.title_match.clone().or_else(|| intent.title.clone()) else {
            return Ok(Step::Halt(PlannerOutcome::error(format!("Which task would you like to {mode}?"))));
        };
        let tasks = self.open_tasks(&req.context.user_id, "todo").await?;
        let candidates: Vec<Candidate> = tasks.iter().map(|t| Candidate::new(&t.id, &t.title)).collect();
        let recent: Vec<EntityRef> = req
            .context
            .recent_refs
            .iter()
            .filter(|r| r.kind == EntityKind::Task)
            .cloned()
            .collect();

        let matched = match resolve(&target, &candidates, &recent) {
            Resolution::Found(c) => c,
            Resolution::Ambiguous(options) => {
                let names: Vec<String> = options.into_iter().map(|c| c.title).collect();
                return Ok(Step::Halt(PlannerOutcome::clarify(format!(
                    "I found a few similar tasks. Which one did you mean?\n- '{}'",
                    names.join("', '")
                ))));
            }
            Resolution::NotFound => {
                return Ok(Step::Halt(PlannerOutcome::error(format!(
                    "I couldn't find an active task that matches '{target}'."
                ))));
            }
        };
        let refs = vec![EntityRef {
            kind: EntityKind::Task,
            id: matched.id.clone(),
            title: matched.title.clone(),
        }];

        let (action, response) = match mode {
            "complete" => {
                let mut patch = Map::new();
                patch.insert("status".into(), json!("done"));
                (
                    KnownAction::UpdateTask {
                        task_id: matched.id.clone(),
                        patch,
                    },
                    format!("Great job! Marking '{}' as complete.", matched.title),
                )
            }
            "delete" => (
                KnownAction::DeleteTask {
                    task_id: matched.id.clone(),
                },
                format!("Okay, deleting '{}'.", matched.title),
            ),
            _ => {
                let Some(mut patch) = intent.patch.clone().filter(|p| !p.is_empty()) else {
                    return Ok(Step::Halt(PlannerOutcome::error("What change would you like to make to the task?")));
                };
                if let Some(Value::String(raw)) = patch.get("due_date").cloned() {
                    if let Some(iso) = self.normalize_due(&raw, req).await? {
                        patch.insert("due_date".into(), json!(iso));
                    }
                }
                (
                    KnownAction::UpdateTask {
                        task_id: matched.id.clone(),
                        patch,
                    },
                    format!("I'll update the task '{}'.", matched.title),
                )
            }
        };
        Ok(Step::Done {
            response,
            actions: vec![action.into()],
            refs,
        })
    }

    async fn batch_modify(&self, intent: &TaskIntent, operation: &str, req: &PlannerRequest) -> Result<Step, PipelineError> {
        let filters = intent.filters.clone().unwrap_or_default();
        let status = filters.status.unwrap_or_else(|| "todo".to_string());
        let Some(description) = filters.description.filter(|d| !d.trim().is_empty()) else {
            return Ok(Step::Halt(PlannerOutcome::error(
                "I'm not sure which tasks you want to modify. Please be more specific.",
            )));
        };
        if operation == "complete" && status != "todo" {
            return Ok(Step::Halt(PlannerOutcome::error("You can only mark active (todo) tasks as complete.")));
        }
        let patch = intent.patch.clone().filter(|p| !p.is_empty());
        if operation == "update" && patch.is_none() {
            return Ok(Step::Halt(PlannerOutcome::error(
                "You asked to update multiple tasks, but didn't specify the change.",
            )));
        }
        if !matches!(operation, "delete" | "complete" | "update") {
            return Ok(Step::Halt(PlannerOutcome::error(format!(
                "The batch operation '{operation}' is not supported for existing tasks."
            ))));
        }

        let candidates = self.open_tasks(&req.context.user_id, &status).await?;
        let matched = self.filter_tasks(&description, &candidates, req).await?;
        if matched.is_empty() {
            return Ok(Step::Halt(PlannerOutcome::error(format!(
                "I couldn't find any {status} tasks that match your criteria."
            ))));
        }

        let n = matched.len();
        let actions: Vec<Action> = matched
            .iter()
            .map(|t| match operation {
                "delete" => KnownAction::DeleteTask { task_id: t.id.clone() },
                "complete" => {
                    let mut done = Map::new();
                    done.insert("status".into(), json!("done"));
                    KnownAction::UpdateTask {
                        task_id: t.id.clone(),
                        patch: done,
                    }
                }
                _ => KnownAction::UpdateTask {
                    task_id: t.id.clone(),
                    patch: patch.clone().unwrap_or_default(),
                },
            })
            .map(Action::from)
            .collect();
        let response = match operation {
            "delete" => format!("Okay, I've deleted {n} {status} task(s) that matched your criteria."),
            "complete" => format!("Done! I've marked {n} task(s) as complete."),
            _ => format!("Okay, I've updated {n} task(s) that matched your criteria."),
        };
        Ok(Step::Done {
            response,
            actions,
            refs: matched.iter().map(task_ref).collect(),
        })
    }

    async fn plan_inner(&self, req: &PlannerRequest) -> Result<PlannerOutcome, PipelineError> {
        let intents = self.decompose(&req.command).await?;
        tracing::info!(
            user_id = %req.context.user_id,
            intents = ?intents.iter().map(|i| i.intent.as_str()).collect::<Vec<_>>(),
            "task intents"
        );

        let mut creates = Vec::new();
        let mut others = Vec::new();
        for intent in intents {
            let is_batch_create = intent.intent == "batch_operation" && intent.operation.as_deref() == Some("create");
            if intent.intent == "create_task" {
                creates.push(NewTaskSpec {
                    title: intent.title.clone().unwrap_or_else(|| req.command.clone()),
                    description: intent.description.clone(),
                    notes: intent.notes.clone(),
                    due_date: intent.due_date.clone(),
                    category: intent.category.clone(),
                });
            } else if is_batch_create {
                if intent.tasks_to_create.is_empty() {
                    return Ok(PlannerOutcome::error(
                        "You asked to add multiple tasks, but didn't specify which ones.",
                    ));
                }
                creates.extend(intent.tasks_to_create.clone());
            } else {
                others.push(intent);
            }
        }

        let mut steps = Vec::new();

        if !creates.is_empty() {
            steps.push(self.create_tasks(creates, req).await?);
        }
        for intent in &others {
            let step = match intent.intent.as_str() {
                "list_tasks" => self.list_tasks(intent, req).await?,
                "update_task" => self.modify_one(intent, "update", req).await?,
                "complete_task" => self.modify_one(intent, "complete", req).await?,
                "delete_task" => self.modify_one(intent, "delete", req).await?,
                "batch_operation" => match intent.operation.as_deref() {
                    Some(op) => self.batch_modify(intent, op, req).await?,
                    None => Step::Halt(PlannerOutcome::error("I'm not sure which action to perform on the tasks.")),
                },
                other => {
                    tracing::debug!(intent = %other, "unknown task intent");
                    continue;
                }
            };
            steps.push(step);
        }

        Ok(combine_steps(steps)
            .unwrap_or_else(|| PlannerOutcome::error("I'm not sure what you'd like me to do with your tasks.")))
    }
}

#[async_trait]
impl Planner for TaskPlanner {
    fn destination(&self) -> Destination {
        Destination::Task
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
    use crate::llm::{LlmError, MockLlmClient};
    use crate::memory::{InMemoryStore, NewTask};
    use crate::planners::UserContext;
    use chrono::{TimeZone, Utc};

    fn request(command: &str) -> PlannerRequest {
        PlannerRequest::new(command, UserContext::for_user("u1")).at(Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap())
    }

    async fn store_with(titles: &[&str]) -> Arc<dyn Store> {
        let store = InMemoryStore::new();
        for t in titles {
            store
                .create_task(
                    "u1",
                    NewTask {
                        title: t.to_string(),
                        priority: "low".into(),
                        category: "personal".into(),
                        ..NewTask::default()
                    },
                )
                .await
                .unwrap();
        }
        Arc::new(store)
    }

    fn tool_and_params(action: &Action) -> (String, Map<String, Value>) {
        action.clone().into_call()
    }

    #[tokio::test]
    async fn test_single_create_with_explicit_category_skips_analysis() {
        let llm = Arc::new(MockLlmClient::new().with_rule(
            "TASK INTENT ANALYSIS",
            r#"{"intents": [{"intent": "create_task", "title": "Buy milk", "category": "Shopping", "due_date": "tomorrow"}]}"#,
        ));
        let planner = TaskPlanner::new(llm.clone(), store_with(&[]).await);
        let outcome = planner.plan(&request("add buy milk to shopping for tomorrow")).await;
        assert!(outcome.success);
        assert_eq!(outcome.response, "Okay, I've added the task 'Buy milk' to your 'shopping' category.");
        let (tool, params) = tool_and_params(&outcome.actions[0]);
        assert_eq!(tool, "create_task");
        assert_eq!(params["due_date"], "2025-03-11T17:00:00Z");
        assert_eq!(params["priority"], "medium");
        assert_eq!(llm.call_count(), 1);
    }

    #[tokio::test]
    async fn test_batch_create_uses_one_analysis_call() {
        let llm = Arc::new(
            MockLlmClient::new()
                .with_rule(
                    "TASK INTENT ANALYSIS",
                    r#"{"intents": [{"intent": "batch_operation", "operation": "create", "tasks_to_create": [{"title": "buy milk"}, {"title": "urgent: pay rent"}]}]}"#,
                )
                .with_rule(
                    "TASK BATCH ANALYSIS",
                    r#"[{"category": "shopping"}, {"category": "finance"}]"#,
                ),
        );
        let planner = TaskPlanner::new(llm.clone(), store_with(&[]).await);
        let outcome = planner.plan(&request("buy milk, urgent: pay rent")).await;
        assert_eq!(outcome.actions.len(), 2);
        assert_eq!(outcome.response, "Okay, I've added 2 new tasks to your list.");
        let (_, second) = tool_and_params(&outcome.actions[1]);
        assert_eq!(second["category"], "finance");
        assert_eq!(second["priority"], "high");
        assert_eq!(llm.call_count(), 2);
    }

    #[tokio::test]
    async fn test_complete_resolves_fuzzy_title() {
        let llm = Arc::new(MockLlmClient::new().with_rule(
            "TASK INTENT ANALYSIS",
            r#"{"intents": [{"intent": "complete_task", "title_match": "milk"}]}"#,
        ));
        let store = store_with(&["Buy milk", "Walk the dog"]).await;
        let planner = TaskPlanner::new(llm, store);
        let outcome = planner.plan(&request("I bought the milk")).await;
        assert_eq!(outcome.response, "Great job! Marking 'Buy milk' as complete.");
        let (tool, params) = tool_and_params(&outcome.actions[0]);
        assert_eq!(tool, "update_task");
        assert_eq!(params["patch"], json!({"status": "done"}));
        assert_eq!(outcome.context_update.unwrap().refs[0].title, "Buy milk");
    }

    #[tokio::test]
    async fn test_ambiguous_target_asks_for_clarification() {
        let llm = Arc::new(MockLlmClient::new().with_rule(
            "TASK INTENT ANALYSIS",
            r#"{"intents": [{"intent": "delete_task", "title_match": "call"}]}"#,
        ));
        let planner = TaskPlanner::new(llm, store_with(&["Call mom", "Call dad"]).await);
        let outcome = planner.plan(&request("delete the call task")).await;
        assert!(outcome.requires_clarification);
        assert!(outcome.actions.is_empty());
        assert!(outcome.response.starts_with("I found a few similar tasks. Which one did you mean?"));
    }

    #[tokio::test]
    async fn test_list_defaults_to_todo_with_stats() {
        let llm = Arc::new(MockLlmClient::new().with_rule("TASK INTENT ANALYSIS", r#"{"intent": "list_tasks"}"#));
        let planner = TaskPlanner::new(llm, store_with(&[]).await);
        let outcome = planner.plan(&request("what's on my list")).await;
        let tools: Vec<String> = outcome.actions.iter().map(Action::tool_name).collect();
        assert_eq!(tools, vec!["get_tasks", "get_task_stats"]);
        let (_, params) = tool_and_params(&outcome.actions[0]);
        assert_eq!(params["status"], "todo");
        assert_eq!(params["limit"], 15);
    }

    #[tokio::test]
    async fn test_batch_delete_only_uses_known_ids() {
        let store = store_with(&["Project X kickoff", "Project X review", "Groceries"]).await;
        let tasks = store.list_tasks("u1", &TaskQuery::default()).await.unwrap();
        let ids: Vec<String> = tasks.iter().filter(|t| t.title.starts_with("Project")).map(|t| t.id.clone()).collect();
        let filter_reply = json!({"task_ids": [ids[0], ids[1], "made-up-id"]}).to_string();
        let llm = Arc::new(
            MockLlmClient::new()
                .with_rule(
                    "TASK INTENT ANALYSIS",
                    r#"{"intents": [{"intent": "batch_operation", "operation": "delete", "filters": {"description": "Project X tasks"}}]}"#,
                )
                .with_rule("TASK FILTER", filter_reply),
        );
        let planner = TaskPlanner::new(llm, store);
        let outcome = planner.plan(&request("delete all Project X tasks")).await;
        assert_eq!(outcome.actions.len(), 2);
        assert_eq!(outcome.response, "Okay, I've deleted 2 todo task(s) that matched your criteria.");
    }

    #[tokio::test]
    async fn test_decomposition_is_deterministic_with_stubbed_model() {
        let reply = r#"{"intents": [{"intent": "create_task", "title": "a"}, {"intent": "list_tasks"}]}"#;
        let llm = Arc::new(MockLlmClient::new().with_rule("TASK INTENT ANALYSIS", reply));
        let planner = TaskPlanner::new(llm, store_with(&[]).await);
        let first = planner.decompose("add a and show my tasks").await.unwrap();
        let second = planner.decompose("add a and show my tasks").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
    }

    #[tokio::test]
    async fn test_unparsable_intent_defaults_to_create() {
        let llm = Arc::new(MockLlmClient::new().with_default("not json at all"));
        let planner = TaskPlanner::new(llm, store_with(&[]).await);
        let intents = planner.decompose("water the plants").await.unwrap();
        assert_eq!(intents[0].intent, "create_task");
        assert_eq!(intents[0].title.as_deref(), Some("water the plants"));
    }

    #[tokio::test]
    async fn test_model_failure_degrades_to_apology() {
        let llm = Arc::new(MockLlmClient::new().with_failure(
            "TASK INTENT ANALYSIS",
            LlmError::CredentialsExhausted {
                attempts: 2,
                last: Box::new(LlmError::QuotaExceeded("429".into())),
            },
        ));
        let planner = TaskPlanner::new(llm, store_with(&[]).await);
        let outcome = planner.plan(&request("add milk")).await;
        assert!(!outcome.success);
        assert!(outcome.actions.is_empty());
        assert!(outcome.response.starts_with("❌ "));
    }

    #[test]
    fn test_priority_heuristic() {
        assert_eq!(heuristic_priority("URGENT fix", "", false), "high");
        assert_eq!(heuristic_priority("fix", "", true), "medium");
        assert_eq!(heuristic_priority("fix", "", false), "low");
    }
}

//! 查找 Planner：先在用户自己的任务与笔记里找，找不到再转网络搜索
//!
//! 两轮候选：先按模型给出的相关分类取（上限 25），没有命中再取最近的条目（上限 20）；
//! 每轮由一次语义匹配调用挑出相关条目，返回的 id 必须在候选中。

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{ask_json, Destination, Planner, PlannerOutcome, PlannerRequest};
use crate::core::PipelineError;
use crate::llm::LlmClient;
use crate::memory::{EntityKind, EntityRef, JournalQuery, Store, TaskQuery};
use crate::tools::{schema_block, KnownAction};

/// 两轮候选的数量上限
#[derive(Debug, Clone)]
pub struct FindingLimits {
    pub category_search: usize,
    pub recency_search: usize,
}

impl Default for FindingLimits {
    fn default() -> Self {
        Self {
            category_search: 25,
            recency_search: 20,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
struct SearchPlan {
    /// 要找的核心内容
    #[serde(default)]
    search_term: Option<String>,
    /// 可能存放该内容的分类
    #[serde(default)]
    relevant_categories: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
struct MatchedItem {
    id: String,
    /// task | journal
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
struct MatchReply {
    #[serde(default)]
    matched_items: Vec<MatchedItem>,
}

/// 候选条目（task 或 journal），只保留给模型与用户看的字段
#[derive(Debug, Clone)]
struct Item {
    kind: EntityKind,
    id: String,
    title: String,
    view: Value,
}

pub struct FindingPlanner {
    llm: Arc<dyn LlmClient>,
    store: Arc<dyn Store>,
    limits: FindingLimits,
}

impl FindingPlanner {
    pub fn new(llm: Arc<dyn LlmClient>, store: Arc<dyn Store>, limits: FindingLimits) -> Self {
        Self { llm, store, limits }
    }

    async fn search_plan(&self, req: &PlannerRequest) -> Result<SearchPlan, PipelineError> {
        let categories = match self.store.categories(&req.context.user_id).await {
            Ok(index) => {
                let mut all = index.tasks;
                all.extend(index.journals);
                all.sort();
                all.dedup();
                all
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not load categories");
                Vec::new()
            }
        };
        let system = format!(
            r#"### FINDING SEARCH PLAN
The user wants to find a piece of information they saved earlier (a phone number, a password location, a plan...).
Extract the `search_term` (what they are looking for, a few words) and pick `relevant_categories` from the user's categories: {}

{}"#,
            serde_json::to_string(&categories).unwrap_or_default(),
            schema_block::<SearchPlan>()
        );
        Ok(ask_json::<SearchPlan>(&self.llm, &system, &req.command).await?.unwrap_or_default())
    }

    async fn candidates(&self, user_id: &str, categories: &[String], limit: usize) -> Result<Vec<Item>, PipelineError> {
        let tasks = self
            .store
            .list_tasks(
                user_id,
                &TaskQuery {
                    categories: categories.to_vec(),
                    limit,
                    ..TaskQuery::default()
                },
            )
            .await?;
        let journals = self
            .store
            .list_journals(
                user_id,
                &JournalQuery {
                    categories: categories.to_vec(),
                    limit,
                    ..JournalQuery::default()
                },
            )
            .await?;

        let mut items: Vec<Item> = tasks
            .into_iter()
            .map(|t| Item {
                kind: EntityKind::Task,
                view: json!({"type": "task", "title": t.title, "description": t.description, "notes": t.notes,
                    "category": t.category, "status": t.status, "due_date": t.due_date}),
                id: t.id,
                title: t.title,
            })
            .collect();
        items.extend(journals.into_iter().map(|j| Item {
            kind: EntityKind::Journal,
            view: json!({"type": "journal", "title": j.title, "content": j.content, "category": j.category,
                "created_at": j.created_at}),
            id: j.id,
            title: j.title,
        }));
        Ok(items)
    }

    /// 语义匹配；只接受候选中存在的 (id, type)
    async fn semantic_match(&self, term: &str, items: &[Item]) -> Result<Vec<Item>, PipelineError> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let listing: Vec<Value> = items
            .iter()
            .map(|i| {
                let mut v = i.view.clone();
                if let Value::Object(map) = &mut v {
                    map.insert("id".into(), json!(i.id));
                }
                v
            })
            .collect();
        let system = format!(
            r#"### FINDING SEMANTIC MATCH
Select every item that contains or directly answers what the user is looking for: "{term}".
Ignore items that only share a word without being relevant.

{}"#,
            schema_block::<MatchReply>()
        );
        let user = serde_json::to_string_pretty(&listing).unwrap_or_default();
        let reply = ask_json::<MatchReply>(&self.llm, &system, &user).await?.unwrap_or_default();

        let wanted: HashSet<(String, String)> = reply
            .matched_items
            .into_iter()
            .map(|m| (m.id, m.kind.to_lowercase()))
            .collect();
        Ok(items
            .iter()
            .filter(|i| {
                let kind = if i.kind == EntityKind::Task { "task" } else { "journal" };
                wanted.contains(&(i.id.clone(), kind.to_string()))
            })
            .cloned()
            .collect())
    }

    async fn plan_inner(&self, req: &PlannerRequest) -> Result<PlannerOutcome, PipelineError> {
        let plan = self.search_plan(req).await?;
        let Some(term) = plan.search_term.filter(|t| !t.trim().is_empty()) else {
            return Ok(PlannerOutcome::clarify(
                "I'm not quite sure what you're asking me to find. Could you be more specific?",
            ));
        };
        let user_id = &req.context.user_id;

        let mut found = Vec::new();
        if !plan.relevant_categories.is_empty() {
            let items = self
                .candidates(user_id, &plan.relevant_categories, self.limits.category_search)
                .await?;
            found = self.semantic_match(&term, &items).await?;
        }
        if found.is_empty() {
            let items = self.candidates(user_id, &[], self.limits.recency_search).await?;
            found = self.semantic_match(&term, &items).await?;
        }
        tracing::info!(user_id = %user_id, term = %term, found = found.len(), "personal search");

        if found.is_empty() {
            let action = KnownAction::InternetSearch {
                query: term.clone(),
                num_results: None,
            };
            return Ok(PlannerOutcome::ok(
                format!("I couldn't find anything about '{term}' in your personal notes, so I'm searching the web for you."),
                vec![action.into()],
            ));
        }

        let refs: Vec<EntityRef> = found
            .iter()
            .map(|i| EntityRef {
                kind: i.kind,
                id: i.id.clone(),
                title: i.title.clone(),
            })
            .collect();
        let mut outcome = PlannerOutcome::ok(
            format!(
                "I searched your personal database and found {} item(s) related to '{term}'.",
                found.len()
            ),
            Vec::new(),
        )
        .with_refs(refs);
        outcome.found_data = found.into_iter().map(|i| i.view).collect();
        Ok(outcome)
    }
}

#[async_trait]
impl Planner for FindingPlanner {
    fn destination(&self) -> Destination {
        Destination::Finding
    }

    async fn plan(&self, request: &PlannerRequest) -> PlannerOutcome {
        match self.plan_inner(request).await {
            Ok(outcome) => outcome,
            Err(e) => PlannerOutcome::from_error(&e),
        }
    }
}

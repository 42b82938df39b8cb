//! 兜底对话 Planner
//!
//! 先做一次分诊：回答需要用户自己的数据、网络搜索，还是都不需要；取回数据后再用对话模型综合作答。
//! 只读，不产生动作。

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{ask_json, Destination, Planner, PlannerOutcome, PlannerRequest};
use crate::core::PipelineError;
use crate::llm::LlmClient;
use crate::memory::{JournalQuery, Message, Store, TaskQuery};
use crate::tools::{schema_block, SearchHit, WebSearch};

const SYNTHESIS_FAILURE: &str = "I successfully gathered the information, but encountered an issue while synthesizing the final answer. Please try rephrasing your question.";
const PERSONAL_LIMIT: usize = 10;

#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
struct Triage {
    #[serde(default)]
    thought: String,
    /// personal_data | web_search；不需要数据时为空
    #[serde(default)]
    data_needed: Vec<String>,
    #[serde(default)]
    search_query: Option<String>,
}

pub struct FallbackPlanner {
    llm: Arc<dyn LlmClient>,
    chat: Arc<dyn LlmClient>,
    store: Arc<dyn Store>,
    search: Arc<dyn WebSearch>,
    max_results: usize,
}

impl FallbackPlanner {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        chat: Arc<dyn LlmClient>,
        store: Arc<dyn Store>,
        search: Arc<dyn WebSearch>,
        max_results: usize,
    ) -> Self {
        Self {
            llm,
            chat,
            store,
            search,
            max_results,
        }
    }

    async fn triage(&self, req: &PlannerRequest) -> Result<Triage, PipelineError> {
        let system = format!(
            r#"### GENERAL TRIAGE
Decide what information is needed to answer the user's message.
- "personal_data": the answer depends on the user's own tasks or notes.
- "web_search": the answer needs current or factual information from the internet; give a concise `search_query`.
- Leave `data_needed` empty for small talk or questions you can answer directly.
Current UTC time: {}.

{}"#,
            req.now_iso(),
            schema_block::<Triage>()
        );
        let triage = ask_json::<Triage>(&self.llm, &system, &req.command).await?;
        Ok(triage.unwrap_or_else(|| {
            tracing::debug!("triage unparsable, answering directly");
            Triage::default()
        }))
    }

    async fn personal_data(&self, user_id: &str) -> Value {
        let tasks = self
            .store
            .list_tasks(
                user_id,
                &TaskQuery {
                    limit: PERSONAL_LIMIT,
                    ..TaskQuery::default()
                },
            )
            .await;
        let journals = self
            .store
            .list_journals(
                user_id,
                &JournalQuery {
                    limit: PERSONAL_LIMIT,
                    ..JournalQuery::default()
                },
            )
            .await;
        let tasks: Vec<Value> = match tasks {
            Ok(list) => list
                .into_iter()
                .map(|t| json!({"title": t.title, "status": t.status, "priority": t.priority, "category": t.category, "due_date": t.due_date}))
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "could not load tasks for fallback");
                Vec::new()
            }
        };
        let journals: Vec<Value> = match journals {
            Ok(list) => list
                .into_iter()
                .map(|j| json!({"title": j.title, "content": j.content, "category": j.category}))
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "could not load journals for fallback");
                Vec::new()
            }
        };
        json!({"recent_tasks": tasks, "recent_journals": journals})
    }

    async fn web_data(&self, query: &str) -> Value {
        match self.search.search(query, self.max_results).await {
            Ok(hits) => json!(hits
                .into_iter()
                .map(|SearchHit { title, link, snippet }| json!({"title": title, "link": link, "snippet": snippet}))
                .collect::<Vec<_>>()),
            Err(e) => {
                tracing::warn!(error = %e, query = %query, "web search failed");
                json!({"error": "The web search could not be completed."})
            }
        }
    }

    async fn plan_inner(&self, req: &PlannerRequest) -> Result<PlannerOutcome, PipelineError> {
        let triage = self.triage(req).await?;
        tracing::debug!(thought = %triage.thought, needed = ?triage.data_needed, "fallback triage");

        let mut gathered = serde_json::Map::new();
        if triage.data_needed.iter().any(|d| d == "personal_data") {
            gathered.insert("personal_data".into(), self.personal_data(&req.context.user_id).await);
        }
        if triage.data_needed.iter().any(|d| d == "web_search") {
            let query = triage
                .search_query
                .clone()
                .filter(|q| !q.trim().is_empty())
                .unwrap_or_else(|| req.command.clone());
            gathered.insert("web_search".into(), self.web_data(&query).await);
        }

        let style = req
            .context
            .communication_style()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "friendly and concise".to_string());
        let system = format!(
            "### GENERAL ASSISTANT\nYou are a helpful personal assistant. Answer the user's message using the gathered data when present.\n\
             When you use web results, cite them with their links. Never invent personal data.\n\
             Communication style: {style}\nCurrent UTC time: {}\nRecent conversation:\n{}\n\nGathered data:\n{}",
            req.now_iso(),
            if req.context.history.is_empty() { "(none)" } else { req.context.history.as_str() },
            serde_json::to_string_pretty(&Value::Object(gathered)).unwrap_or_default()
        );
        let messages = [Message::system(system), Message::user(&req.command)];
        match self.chat.complete(&messages).await {
            Ok(answer) if !answer.trim().is_empty() => Ok(PlannerOutcome::ok(answer.trim(), Vec::new())),
            Ok(_) => Ok(PlannerOutcome::error(SYNTHESIS_FAILURE)),
            Err(e) => {
                tracing::warn!(error = %e, "fallback synthesis failed");
                Ok(PlannerOutcome::error(SYNTHESIS_FAILURE))
            }
        }
    }
}

#[async_trait]
impl Planner for FallbackPlanner {
    fn destination(&self) -> Destination {
        Destination::Fallback
    }

    async fn plan(&self, request: &PlannerRequest) -> PlannerOutcome {
        match self.plan_inner(request).await {
            Ok(outcome) => outcome,
            Err(e) => PlannerOutcome::from_error(&e),
        }
    }
}

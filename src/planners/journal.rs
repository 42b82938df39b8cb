//! 日记 / 笔记 Planner
//!
//! 子意图 upsert / search / update / delete。同一轮的所有新笔记合并成一次模型调用，
//! 生成展示标题并归类；分类词表取用户已有的日记分类加 "general"，优先复用。

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::resolve::{resolve, Candidate, Resolution};
use super::{ask_json_list, combine_steps, Destination, Planner, PlannerOutcome, PlannerRequest, Step};
use crate::core::PipelineError;
use crate::llm::LlmClient;
use crate::memory::{EntityKind, EntityRef, JournalQuery, JournalRecord, Message, Store};
use crate::tools::{schema_block, Action, KnownAction};

const SEARCH_LIMIT: u32 = 10;
const TITLE_CHARS: usize = 40;

/// 子意图
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JournalOp {
    /// upsert | search | update | delete
    pub intent: String,
    /// (upsert / update) 笔记正文
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    /// (update / delete，或追加到已有笔记的 upsert) 目标笔记标题
    #[serde(default)]
    pub title_match: Option<String>,
    /// (search) 搜索词
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub patch: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
struct OpList {
    operations: Vec<JournalOp>,
}

#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
struct NoteLabel {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    category: Option<String>,
}

pub struct JournalPlanner {
    llm: Arc<dyn LlmClient>,
    store: Arc<dyn Store>,
}

fn fallback_title(content: &str) -> String {
    let head: String = content.chars().take(TITLE_CHARS).collect();
    if content.chars().count() > TITLE_CHARS {
        format!("Note: {}...", head.trim_end())
    } else {
        format!("Note: {head}")
    }
}

fn journal_ref(entry: &JournalRecord) -> EntityRef {
    EntityRef {
        kind: EntityKind::Journal,
        id: entry.id.clone(),
        title: entry.title.clone(),
    }
}

impl JournalPlanner {
    pub fn new(llm: Arc<dyn LlmClient>, store: Arc<dyn Store>) -> Self {
        Self { llm, store }
    }

    pub async fn decompose(&self, command: &str) -> Result<Vec<JournalOp>, PipelineError> {
        let system = format!(
            r#"### JOURNAL INTENT ANALYSIS
Decompose the user's command about their notes and journal into a list of operations.
- `upsert`: save new information. Put the text to keep in `content`; set `title_match` only when the user wants to add to an existing note.
- `search`: look something up in the notes; put the search words in `query`.
- `update`: change an existing note named by `title_match`; put the new text in `content` or the changes in `patch`.
- `delete`: remove the note named by `title_match`.
Several pieces of information in one message become several `upsert` operations.

{}"#,
            schema_block::<OpList>()
        );
        let messages = [Message::system(system), Message::user(format!("User Command: \"{command}\""))];
        let reply = self.llm.complete(&messages).await?;
        let ops = super::parse_list::<JournalOp>(&reply, "operations")
            .or_else(|| crate::llm::parse_reply::<JournalOp>(&reply).map(|op| vec![op]))
            .filter(|ops| !ops.is_empty());
        Ok(ops.unwrap_or_else(|| {
            tracing::warn!("could not parse journal intent, saving as a note");
            vec![JournalOp {
                intent: "upsert".into(),
                content: Some(command.to_string()),
                ..JournalOp::default()
            }]
        }))
    }

    async fn entries(&self, user_id: &str) -> Result<Vec<JournalRecord>, PipelineError> {
        let query = JournalQuery {
            limit: 200,
            ..JournalQuery::default()
        };
        Ok(self.store.list_journals(user_id, &query).await?)
    }

    /// 一次调用为所有新笔记生成标题与分类
    async fn label_batch(&self, contents: &[String], user_id: &str) -> Result<Vec<NoteLabel>, PipelineError> {
        let mut vocabulary: BTreeSet<String> = BTreeSet::from(["general".to_string()]);
        match self.store.categories(user_id).await {
            Ok(index) => vocabulary.extend(index.journals.into_iter().map(|c| c.to_lowercase())),
            Err(e) => tracing::warn!(error = %e, "could not load journal categories"),
        }
        let system = format!(
            r#"### JOURNAL BATCH CATEGORIZE
For each note, produce a short display title (max 8 words) and a category.
Prefer one of the user's existing categories: {}
Create a new lowercase category only if none fits.
Respond with ONLY a JSON array with one {{"title": "...", "category": "..."}} object per note, in the same order."#,
            serde_json::to_string(&vocabulary).unwrap_or_default()
        );
        let user = serde_json::to_string_pretty(contents).unwrap_or_default();
        let labels = ask_json_list::<NoteLabel>(&self.llm, &system, &user, "notes").await?;
        Ok(match labels {
            Some(list) if list.len() == contents.len() => list,
            _ => {
                tracing::warn!(count = contents.len(), "journal labels unusable, using defaults");
                vec![NoteLabel::default(); contents.len()]
            }
        })
    }

    async fn save_notes(&self, notes: Vec<&JournalOp>, req: &PlannerRequest) -> Result<Step, PipelineError> {
        let notes: Vec<&JournalOp> = notes
            .into_iter()
            .filter(|op| op.content.as_deref().is_some_and(|c| !c.trim().is_empty()))
            .collect();
        if notes.is_empty() {
            return Ok(Step::Halt(PlannerOutcome::error("What would you like me to note down?")));
        }
        let contents: Vec<String> = notes.iter().map(|op| op.content.clone().unwrap_or_default()).collect();
        let labels = self.label_batch(&contents, &req.context.user_id).await?;

        let mut actions = Vec::new();
        let mut saved = Vec::new();
        for ((op, content), label) in notes.into_iter().zip(contents).zip(labels) {
            let title = op
                .title
                .clone()
                .or(label.title)
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| fallback_title(&content));
            let category = label
                .category
                .map(|c| c.trim().to_lowercase())
                .filter(|c| !c.is_empty())
                .unwrap_or_else(|| "general".to_string());
            actions.push(Action::from(KnownAction::CreateJournalEntry {
                title: Some(title.clone()),
                content: Some(content),
                category: Some(category.clone()),
                entry_type: Some("free_form".into()),
            }));
            saved.push((title, category));
        }

        let response = match saved.as_slice() {
            [(title, category)] => format!("Got it, I've saved your note '{title}' under '{category}'."),
            many => format!("Got it, I've saved {} notes.", many.len()),
        };
        Ok(Step::done(response, actions))
    }

    fn locate(&self, name: &str, entries: &[JournalRecord], req: &PlannerRequest) -> Result<JournalRecord, Step> {
        let candidates: Vec<Candidate> = entries.iter().map(|e| Candidate::new(&e.id, &e.title)).collect();
        let recent: Vec<EntityRef> = req
            .context
            .recent_refs
            .iter()
            .filter(|r| r.kind == EntityKind::Journal)
            .cloned()
            .collect();
        match resolve(name, &candidates, &recent) {
            Resolution::Found(c) => entries
                .iter()
                .find(|e| e.id == c.id)
                .cloned()
                .ok_or_else(|| Step::Halt(PlannerOutcome::error(format!("I couldn't find a note matching '{name}'.")))),
            Resolution::Ambiguous(options) => {
                let names: Vec<String> = options.into_iter().map(|c| c.title).collect();
                Err(Step::Halt(PlannerOutcome::clarify(format!(
                    "I found a few similar notes. Which one did you mean?\n- '{}'",
                    names.join("', '")
                ))))
            }
            Resolution::NotFound => Err(Step::Halt(PlannerOutcome::error(format!(
                "I couldn't find a note matching '{name}'."
            )))),
        }
    }

    fn modify(&self, op: &JournalOp, entries: &[JournalRecord], req: &PlannerRequest) -> Step {
        let name = op.title_match.clone().or_else(|| op.title.clone()).unwrap_or_default();
        let entry = match self.locate(&name, entries, req) {
            Ok(entry) => entry,
            Err(step) => return step,
        };

        let (action, response) = if op.intent == "delete" {
            (
                KnownAction::DeleteJournalEntry {
                    id: Some(entry.id.clone()),
                    title_match: None,
                },
                format!("Okay, deleting your note '{}'.", entry.title),
            )
        } else {
            let mut patch = op.patch.clone().unwrap_or_default();
            if let Some(content) = op.content.clone().filter(|c| !c.trim().is_empty()) {
                // upsert 到已有笔记时追加，update 时替换
                let merged = if op.intent == "upsert" {
                    format!("{}\n{}", entry.content, content)
                } else {
                    content
                };
                patch.insert("content".into(), json!(merged));
            }
            if patch.is_empty() {
                return Step::Halt(PlannerOutcome::error("What change would you like to make to the note?"));
            }
            (
                KnownAction::UpdateJournalEntry {
                    patch,
                    id: Some(entry.id.clone()),
                    title_match: None,
                },
                format!("Okay, I'll update your note '{}'.", entry.title),
            )
        };
        Step::Done {
            response,
            actions: vec![action.into()],
            refs: vec![journal_ref(&entry)],
        }
    }

    async fn plan_inner(&self, req: &PlannerRequest) -> Result<PlannerOutcome, PipelineError> {
        let ops = self.decompose(&req.command).await?;
        tracing::info!(
            user_id = %req.context.user_id,
            ops = ?ops.iter().map(|o| o.intent.as_str()).collect::<Vec<_>>(),
            "journal intents"
        );

        let targets_existing = |op: &JournalOp| op.intent != "search" && (op.intent != "upsert" || op.title_match.is_some());
        let entries = if ops.iter().any(targets_existing) {
            self.entries(&req.context.user_id).await?
        } else {
            Vec::new()
        };

        let new_notes: Vec<&JournalOp> = ops
            .iter()
            .filter(|op| op.intent == "upsert" && op.title_match.is_none())
            .collect();
        let mut steps = Vec::new();
        if !new_notes.is_empty() {
            steps.push(self.save_notes(new_notes, req).await?);
        }

        for op in &ops {
            let step = match op.intent.as_str() {
                "upsert" if op.title_match.is_some() => self.modify(op, &entries, req),
                "upsert" => continue,
                "search" => {
                    let query = op.query.clone().or_else(|| op.content.clone()).unwrap_or_else(|| req.command.clone());
                    let action = KnownAction::SearchJournalEntries {
                        query: Some(query.clone()),
                        titles: None,
                        category: None,
                        limit: Some(SEARCH_LIMIT),
                    };
                    Step::done(format!("Let me look through your notes for '{query}'..."), vec![action.into()])
                }
                "update" | "delete" => self.modify(op, &entries, req),
                other => {
                    tracing::debug!(intent = %other, "unknown journal intent");
                    continue;
                }
            };
            steps.push(step);
        }

        Ok(combine_steps(steps)
            .unwrap_or_else(|| PlannerOutcome::error("I'm not sure what you'd like me to do with your notes.")))
    }
}

#[async_trait]
impl Planner for JournalPlanner {
    fn destination(&self) -> Destination {
        Destination::Journal
    }

    async fn plan(&self, request: &PlannerRequest) -> PlannerOutcome {
        match self.plan_inner(request).await {
            Ok(outcome) => outcome,
            Err(e) => PlannerOutcome::from_error(&e),
        }
    }
}

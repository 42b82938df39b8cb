//! 内置工具表
//!
//! 启动时一次性注册全部工具：任务、日记、记忆、日程四类存储工具与网络搜索。
//! 除 internet_search 外，每个工具都从上下文自动注入 user_id。

use std::future::Future;
use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::memory::{
    JournalQuery, NewJournal, NewMemory, NewSchedule, NewTask, ScheduleStatus, ScheduleType, Store,
    StoreError, TaskQuery,
};
use crate::tools::{FnHandler, ToolDescriptor, ToolError, ToolHandler, ToolRegistry, WebSearch};

/// 工具表的可配置项
#[derive(Debug, Clone)]
pub struct CatalogueSettings {
    pub search_max_results: usize,
    pub max_active_schedules: usize,
    pub default_timezone: String,
}

impl Default for CatalogueSettings {
    fn default() -> Self {
        Self {
            search_max_results: 5,
            max_active_schedules: 10,
            default_timezone: "UTC".to_string(),
        }
    }
}

type Args = Map<String, Value>;

fn store_err(e: StoreError) -> ToolError {
    ToolError::Execution(e.to_string())
}

fn str_arg(args: &Args, key: &str) -> Option<String> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn req_str(args: &Args, key: &str) -> Result<String, ToolError> {
    str_arg(args, key).ok_or_else(|| ToolError::InvalidParams(format!("'{key}' must be a non-empty string")))
}

fn usize_arg(args: &Args, key: &str, default: usize) -> usize {
    args.get(key)
        .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
        .map(|n| n as usize)
        .unwrap_or(default)
}

fn patch_arg(args: &Args) -> Result<Args, ToolError> {
    match args.get("patch") {
        Some(Value::Object(m)) if !m.is_empty() => Ok(m.clone()),
        _ => Err(ToolError::InvalidParams("'patch' must be a non-empty object".into())),
    }
}

fn str_list(args: &Args, key: &str) -> Vec<String> {
    match args.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    }
}

fn to_data<T: serde::Serialize>(value: T) -> Result<Value, ToolError> {
    serde_json::to_value(value).map_err(|e| ToolError::Execution(e.to_string()))
}

/// 绑定存储句柄的处理函数
fn with_store<F, Fut>(store: &Arc<dyn Store>, f: F) -> impl ToolHandler
where
    F: Fn(Arc<dyn Store>, Args) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
{
    let store = store.clone();
    FnHandler(move |args: Args| f(store.clone(), args))
}

// ---------------------------------------------------------------- tasks

async fn create_task(store: Arc<dyn Store>, args: Args) -> Result<Value, ToolError> {
    let user_id = req_str(&args, "user_id")?;
    let task = NewTask {
        title: req_str(&args, "title")?,
        description: str_arg(&args, "description").unwrap_or_default(),
        notes: str_arg(&args, "notes").unwrap_or_default(),
        priority: str_arg(&args, "priority").unwrap_or_else(|| "medium".into()),
        category: str_arg(&args, "category").unwrap_or_else(|| "general".into()),
        due_date: str_arg(&args, "due_date"),
    };
    to_data(store.create_task(&user_id, task).await.map_err(store_err)?)
}

async fn update_task(store: Arc<dyn Store>, args: Args) -> Result<Value, ToolError> {
    let user_id = req_str(&args, "user_id")?;
    let id = req_str(&args, "task_id")?;
    let patch = patch_arg(&args)?;
    to_data(store.update_task(&user_id, &id, &patch).await.map_err(store_err)?)
}

async fn delete_task(store: Arc<dyn Store>, args: Args) -> Result<Value, ToolError> {
    let user_id = req_str(&args, "user_id")?;
    let id = req_str(&args, "task_id")?;
    let task = store.delete_task(&user_id, &id).await.map_err(store_err)?;
    Ok(json!({"deleted": task.id, "title": task.title}))
}

async fn get_tasks(store: Arc<dyn Store>, args: Args) -> Result<Value, ToolError> {
    let user_id = req_str(&args, "user_id")?;
    let defaults = TaskQuery::default();
    let query = TaskQuery {
        status: str_arg(&args, "status").filter(|s| s != "all"),
        priority: str_arg(&args, "priority"),
        category: str_arg(&args, "category"),
        categories: Vec::new(),
        task_ids: str_list(&args, "task_ids"),
        limit: usize_arg(&args, "limit", defaults.limit),
        order_by: str_arg(&args, "order_by").unwrap_or(defaults.order_by),
        ascending: args
            .get("ascending")
            .and_then(Value::as_bool)
            .unwrap_or(defaults.ascending),
    };
    to_data(store.list_tasks(&user_id, &query).await.map_err(store_err)?)
}

async fn get_task_stats(store: Arc<dyn Store>, args: Args) -> Result<Value, ToolError> {
    let user_id = req_str(&args, "user_id")?;
    to_data(store.task_stats(&user_id).await.map_err(store_err)?)
}

// ---------------------------------------------------------------- journal

async fn create_journal_entry(store: Arc<dyn Store>, args: Args) -> Result<Value, ToolError> {
    let user_id = req_str(&args, "user_id")?;
    let title = str_arg(&args, "title");
    let content = str_arg(&args, "content");
    if title.is_none() && content.is_none() {
        return Err(ToolError::InvalidParams(
            "create_journal_entry requires a title or content".into(),
        ));
    }
    let content = content.unwrap_or_default();
    let title = title.unwrap_or_else(|| {
        let head: String = content.chars().take(40).collect();
        format!("Note: {head}...")
    });
    let entry = NewJournal {
        title,
        content,
        category: str_arg(&args, "category").unwrap_or_else(|| "general".into()),
        entry_type: str_arg(&args, "entry_type").unwrap_or_else(|| "free_form".into()),
    };
    to_data(store.create_journal(&user_id, entry).await.map_err(store_err)?)
}

async fn search_journal_entries(store: Arc<dyn Store>, args: Args) -> Result<Value, ToolError> {
    let user_id = req_str(&args, "user_id")?;
    let query = JournalQuery {
        query: str_arg(&args, "query"),
        titles: str_list(&args, "titles"),
        categories: str_list(&args, "category"),
        ids: Vec::new(),
        limit: usize_arg(&args, "limit", 10),
    };
    to_data(store.list_journals(&user_id, &query).await.map_err(store_err)?)
}

/// id 优先，否则按 titleMatch 取最新的一条匹配
async fn resolve_journal_id(store: &Arc<dyn Store>, user_id: &str, args: &Args) -> Result<String, ToolError> {
    if let Some(id) = str_arg(args, "id") {
        return Ok(id);
    }
    let Some(title) = str_arg(args, "titleMatch") else {
        return Err(ToolError::InvalidParams("either 'id' or 'titleMatch' is required".into()));
    };
    let query = JournalQuery {
        titles: vec![title.clone()],
        limit: 1,
        ..JournalQuery::default()
    };
    store
        .list_journals(user_id, &query)
        .await
        .map_err(store_err)?
        .into_iter()
        .next()
        .map(|j| j.id)
        .ok_or_else(|| ToolError::Execution(format!("No journal entry matching '{title}'.")))
}

async fn update_journal_entry(store: Arc<dyn Store>, args: Args) -> Result<Value, ToolError> {
    let user_id = req_str(&args, "user_id")?;
    let patch = patch_arg(&args)?;
    let id = resolve_journal_id(&store, &user_id, &args).await?;
    to_data(store.update_journal(&user_id, &id, &patch).await.map_err(store_err)?)
}

async fn delete_journal_entry(store: Arc<dyn Store>, args: Args) -> Result<Value, ToolError> {
    let user_id = req_str(&args, "user_id")?;
    let id = resolve_journal_id(&store, &user_id, &args).await?;
    let entry = store.delete_journal(&user_id, &id).await.map_err(store_err)?;
    Ok(json!({"deleted": entry.id, "title": entry.title}))
}

// ---------------------------------------------------------------- memory

async fn create_or_update_memory(store: Arc<dyn Store>, args: Args) -> Result<Value, ToolError> {
    let user_id = req_str(&args, "user_id")?;
    let memory = NewMemory {
        memory_type: req_str(&args, "memory_type")?,
        data: args.get("data").cloned().unwrap_or_else(|| json!({})),
        content: str_arg(&args, "content").unwrap_or_default(),
        importance: args.get("importance").and_then(Value::as_i64).unwrap_or(10),
    };
    to_data(store.upsert_memory(&user_id, memory).await.map_err(store_err)?)
}

async fn get_memories(store: Arc<dyn Store>, args: Args) -> Result<Value, ToolError> {
    let user_id = req_str(&args, "user_id")?;
    let memory_type = str_arg(&args, "memory_type");
    let limit = usize_arg(&args, "limit", 25);
    to_data(
        store
            .list_memories(&user_id, memory_type.as_deref(), limit)
            .await
            .map_err(store_err)?,
    )
}

async fn delete_memory(store: Arc<dyn Store>, args: Args) -> Result<Value, ToolError> {
    let user_id = req_str(&args, "user_id")?;
    let id = req_str(&args, "memory_id")?;
    let memory = store.delete_memory(&user_id, &id).await.map_err(store_err)?;
    Ok(json!({"deleted": memory.id, "memory_type": memory.memory_type}))
}

// ---------------------------------------------------------------- schedules

async fn create_schedule(
    store: Arc<dyn Store>,
    args: Args,
    max_active: usize,
    default_tz: String,
) -> Result<Value, ToolError> {
    let user_id = req_str(&args, "user_id")?;
    let schedule_type: ScheduleType = args
        .get("schedule_type")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| ToolError::InvalidParams(format!("schedule_type: {e}")))?
        .unwrap_or(ScheduleType::OneTime);
    let schedule = NewSchedule {
        action_type: req_str(&args, "action_type")?,
        action_payload: args.get("action_payload").cloned().unwrap_or_else(|| json!({})),
        schedule_type,
        schedule_value: req_str(&args, "schedule_value")?,
        timezone: str_arg(&args, "timezone").unwrap_or(default_tz),
        next_run_at: str_arg(&args, "next_run_at"),
    };
    match store.create_schedule(&user_id, schedule, max_active).await {
        Ok(record) => to_data(record),
        Err(StoreError::LimitReached(n)) => Err(ToolError::Execution(format!(
            "You have reached the maximum of {n} active schedules."
        ))),
        Err(e) => Err(store_err(e)),
    }
}

async fn get_schedules(store: Arc<dyn Store>, args: Args) -> Result<Value, ToolError> {
    let user_id = req_str(&args, "user_id")?;
    let status = match str_arg(&args, "status") {
        Some(s) if s == "all" => None,
        Some(s) => Some(
            ScheduleStatus::parse(&s)
                .ok_or_else(|| ToolError::InvalidParams(format!("unknown schedule status '{s}'")))?,
        ),
        None => None,
    };
    let limit = usize_arg(&args, "limit", 50);
    to_data(store.list_schedules(&user_id, status, limit).await.map_err(store_err)?)
}

async fn update_schedule(store: Arc<dyn Store>, args: Args) -> Result<Value, ToolError> {
    let user_id = req_str(&args, "user_id")?;
    let id = req_str(&args, "schedule_id")?;
    let patch = patch_arg(&args)?;
    to_data(store.update_schedule(&user_id, &id, &patch).await.map_err(store_err)?)
}

async fn delete_schedule(store: Arc<dyn Store>, args: Args) -> Result<Value, ToolError> {
    let user_id = req_str(&args, "user_id")?;
    let id = req_str(&args, "schedule_id")?;
    to_data(store.delete_schedule(&user_id, &id).await.map_err(store_err)?)
}

// ---------------------------------------------------------------- web

async fn internet_search(search: Arc<dyn WebSearch>, args: Args) -> Result<Value, ToolError> {
    let query = req_str(&args, "query")?;
    let n = usize_arg(&args, "num_results", 5);
    let hits = search.search(&query, n).await.map_err(|e| {
        tracing::error!(query = %query, error = %e, "web search failed");
        ToolError::Execution(format!(
            "The web search library failed to execute for the query '{query}'. Please try a different query."
        ))
    })?;
    if hits.is_empty() {
        return Ok(json!({"summary": format!("No search results found for '{query}'."), "results": []}));
    }
    Ok(json!({
        "summary": format!("Found {} relevant results for '{query}'.", hits.len()),
        "results": hits,
    }))
}

/// 注册全部内置工具
pub fn register_builtin_tools(
    registry: &mut ToolRegistry,
    store: Arc<dyn Store>,
    search: Arc<dyn WebSearch>,
    settings: &CatalogueSettings,
) {
    let s = &store;
    let nil = Value::Null;

    let search_handler = FnHandler(move |args: Args| internet_search(search.clone(), args));
    registry.register(
        ToolDescriptor::new("internet_search", "web", search_handler)
            .describe("Searches the web using DuckDuckGo for up-to-date information.")
            .required(&["query"])
            .optional("num_results", json!(settings.search_max_results)),
    );

    // tasks
    registry.register(
        ToolDescriptor::new("create_task", "tasks", with_store(s, create_task))
            .describe("Create a task.")
            .required(&["user_id", "title"])
            .optional("description", json!(""))
            .optional("notes", json!(""))
            .optional("priority", json!("medium"))
            .optional("due_date", nil.clone())
            .optional("category", json!("general"))
            .inject("user_id"),
    );
    registry.register(
        ToolDescriptor::new("update_task", "tasks", with_store(s, update_task))
            .describe("Apply a patch to a task.")
            .required(&["user_id", "task_id", "patch"])
            .inject("user_id"),
    );
    registry.register(
        ToolDescriptor::new("delete_task", "tasks", with_store(s, delete_task))
            .describe("Delete a task.")
            .required(&["user_id", "task_id"])
            .inject("user_id"),
    );
    registry.register(
        ToolDescriptor::new("get_tasks", "tasks", with_store(s, get_tasks))
            .describe("List tasks with optional filters.")
            .required(&["user_id"])
            .optional("status", nil.clone())
            .optional("priority", nil.clone())
            .optional("category", nil.clone())
            .optional("limit", json!(25))
            .optional("order_by", json!("created_at"))
            .optional("ascending", json!(false))
            .optional("task_ids", nil.clone())
            .inject("user_id"),
    );
    registry.register(
        ToolDescriptor::new("get_task_stats", "tasks", with_store(s, get_task_stats))
            .describe("Summary counts of the user's tasks.")
            .required(&["user_id"])
            .inject("user_id"),
    );

    // journal
    registry.register(
        ToolDescriptor::new("create_journal_entry", "journal", with_store(s, create_journal_entry))
            .describe("Save a note or journal entry; needs a title or content.")
            .required(&["user_id"])
            .optional("content", nil.clone())
            .optional("title", nil.clone())
            .optional("category", json!("general"))
            .optional("entry_type", json!("free_form"))
            .inject("user_id"),
    );
    registry.register(
        ToolDescriptor::new("search_journal_entries", "journal", with_store(s, search_journal_entries))
            .describe("Search notes by text, titles or category.")
            .required(&["user_id"])
            .optional("query", nil.clone())
            .optional("titles", nil.clone())
            .optional("category", nil.clone())
            .optional("limit", json!(10))
            .inject("user_id"),
    );
    registry.register(
        ToolDescriptor::new("update_journal_entry", "journal", with_store(s, update_journal_entry))
            .describe("Patch a note by id or titleMatch.")
            .required(&["user_id", "patch"])
            .optional("id", nil.clone())
            .optional("titleMatch", nil.clone())
            .inject("user_id"),
    );
    registry.register(
        ToolDescriptor::new("delete_journal_entry", "journal", with_store(s, delete_journal_entry))
            .describe("Delete a note by id or titleMatch.")
            .required(&["user_id"])
            .optional("id", nil.clone())
            .optional("titleMatch", nil.clone())
            .inject("user_id"),
    );

    // memory
    registry.register(
        ToolDescriptor::new("create_or_update_memory", "memory", with_store(s, create_or_update_memory))
            .describe("Upsert a long-term memory by memory_type.")
            .required(&["user_id", "memory_type"])
            .optional("data", nil.clone())
            .optional("content", nil.clone())
            .optional("importance", json!(10))
            .inject("user_id"),
    );
    registry.register(
        ToolDescriptor::new("get_memories", "memory", with_store(s, get_memories))
            .describe("List long-term memories.")
            .required(&["user_id"])
            .optional("memory_type", nil.clone())
            .optional("limit", json!(25))
            .inject("user_id"),
    );
    registry.register(
        ToolDescriptor::new("delete_memory", "memory", with_store(s, delete_memory))
            .describe("Delete a memory.")
            .required(&["user_id", "memory_id"])
            .inject("user_id"),
    );

    // schedules
    let max_active = settings.max_active_schedules;
    let default_tz = settings.default_timezone.clone();
    registry.register(
        ToolDescriptor::new(
            "create_schedule",
            "schedules",
            with_store(s, move |store, args| create_schedule(store, args, max_active, default_tz.clone())),
        )
        .describe("Create a one-time or recurring schedule.")
        .required(&["user_id", "action_type", "action_payload", "schedule_type", "schedule_value"])
        .optional("timezone", json!(settings.default_timezone))
        .optional("next_run_at", nil.clone())
        .inject("user_id"),
    );
    registry.register(
        ToolDescriptor::new("get_schedules", "schedules", with_store(s, get_schedules))
            .describe("List schedules by status.")
            .required(&["user_id"])
            .optional("status", json!("active"))
            .optional("limit", json!(50))
            .inject("user_id"),
    );
    registry.register(
        ToolDescriptor::new("update_schedule", "schedules", with_store(s, update_schedule))
            .describe("Patch a schedule.")
            .required(&["user_id", "schedule_id", "patch"])
            .inject("user_id"),
    );
    registry.register(
        ToolDescriptor::new("delete_schedule", "schedules", with_store(s, delete_schedule))
            .describe("Cancel a schedule.")
            .required(&["user_id", "schedule_id"])
            .inject("user_id"),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;
    use crate::tools::{SearchHit, StaticSearch, ToolContext};

    fn registry_with(search: StaticSearch) -> (ToolRegistry, Arc<dyn Store>) {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let mut registry = ToolRegistry::new();
        register_builtin_tools(&mut registry, store.clone(), Arc::new(search), &CatalogueSettings::default());
        (registry, store)
    }

    fn args(v: Value) -> Args {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_catalogue_is_complete() {
        let (registry, _) = registry_with(StaticSearch::default());
        assert_eq!(registry.tool_names().len(), 17);
        assert_eq!(
            registry.list_categories(),
            vec!["journal", "memory", "schedules", "tasks", "web"]
        );
        assert!(registry.get("internet_search").unwrap().auto_inject.is_empty());
        assert!(registry
            .tool_names()
            .iter()
            .filter(|n| *n != "internet_search")
            .all(|n| registry.get(n).unwrap().auto_inject == vec!["user_id".to_string()]));
    }

    #[tokio::test]
    async fn test_create_task_applies_defaults() {
        let (registry, store) = registry_with(StaticSearch::default());
        let result = registry
            .execute("create_task", args(json!({"title": "Buy milk"})), &ToolContext::for_user("u1"))
            .await;
        assert!(result.success, "{:?}", result.error);
        let data = result.data.unwrap();
        assert_eq!(data["priority"], "medium");
        assert_eq!(data["category"], "general");
        let tasks = store.list_tasks("u1", &TaskQuery::default()).await.unwrap();
        assert_eq!(tasks.len(), 1);
    }

    #[tokio::test]
    async fn test_journal_requires_title_or_content_and_defaults_title() {
        let (registry, _) = registry_with(StaticSearch::default());
        let ctx = ToolContext::for_user("u1");
        let empty = registry.execute("create_journal_entry", Map::new(), &ctx).await;
        assert!(!empty.success);

        let content = "Dentist phone number is 555-0100, call before noon on weekdays";
        let result = registry
            .execute("create_journal_entry", args(json!({"content": content})), &ctx)
            .await;
        let title = result.data.unwrap()["title"].as_str().unwrap().to_string();
        assert!(title.starts_with("Note: Dentist phone number"));
        assert!(title.ends_with("..."));
    }

    #[tokio::test]
    async fn test_journal_update_by_title_match() {
        let (registry, store) = registry_with(StaticSearch::default());
        let ctx = ToolContext::for_user("u1");
        registry
            .execute(
                "create_journal_entry",
                args(json!({"title": "Dentist", "content": "555-0100"})),
                &ctx,
            )
            .await;
        let result = registry
            .execute(
                "update_journal_entry",
                args(json!({"titleMatch": "dentist", "patch": {"content": "555-0199"}})),
                &ctx,
            )
            .await;
        assert!(result.success, "{:?}", result.error);
        let entries = store.list_journals("u1", &JournalQuery::default()).await.unwrap();
        assert_eq!(entries[0].content, "555-0199");
    }

    #[tokio::test]
    async fn test_schedule_ceiling_reported_as_failure() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let mut registry = ToolRegistry::new();
        let settings = CatalogueSettings {
            max_active_schedules: 1,
            ..CatalogueSettings::default()
        };
        register_builtin_tools(&mut registry, store, Arc::new(StaticSearch::default()), &settings);
        let ctx = ToolContext::for_user("u1");
        let call = args(json!({
            "action_type": "send_notification",
            "action_payload": {"message": "stretch"},
            "schedule_type": "one_time",
            "schedule_value": "2030-01-01T09:00:00Z",
        }));
        assert!(registry.execute("create_schedule", call.clone(), &ctx).await.success);
        let second = registry.execute("create_schedule", call, &ctx).await;
        assert_eq!(
            second.error.as_deref(),
            Some("You have reached the maximum of 1 active schedules.")
        );
    }

    #[tokio::test]
    async fn test_internet_search_summaries() {
        let hit = SearchHit {
            title: "Smile Dental".into(),
            link: "https://example.com".into(),
            snippet: "555-0100".into(),
        };
        let (registry, _) = registry_with(StaticSearch::new(vec![hit]));
        let ctx = ToolContext::for_user("u1");
        let found = registry
            .execute("internet_search", args(json!({"query": "dentist"})), &ctx)
            .await;
        let data = found.data.unwrap();
        assert_eq!(data["summary"], "Found 1 relevant results for 'dentist'.");
        assert!(data.get("user_id").is_none());

        let (registry, _) = registry_with(StaticSearch::default());
        let none = registry
            .execute("internet_search", args(json!({"query": "x"})), &ctx)
            .await;
        assert_eq!(none.data.unwrap()["summary"], "No search results found for 'x'.");

        let (registry, _) = registry_with(StaticSearch::failing());
        let failed = registry
            .execute("internet_search", args(json!({"query": "x"})), &ctx)
            .await;
        assert!(!failed.success);
    }
}

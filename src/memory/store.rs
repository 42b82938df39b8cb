//! 存储协作者接口
//!
//! 按 (user_id, entity_id) 读写任务、日记、记忆、日程四类实体，返回普通记录。
//! 实现方负责按用户隔离数据；本 crate 只附带内存实现 InMemoryStore。

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("invalid record: {0}")]
    Invalid(String),

    /// 活跃日程数已达上限
    #[error("active schedule limit of {0} reached")]
    LimitReached(usize),

    #[error("storage backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRecord {
    pub id: String,
    pub user_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub notes: String,
    pub priority: String,
    pub category: String,
    pub status: String,
    pub due_date: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTask {
    pub title: String,
    pub description: String,
    pub notes: String,
    pub priority: String,
    pub category: String,
    pub due_date: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JournalRecord {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub content: String,
    pub category: String,
    pub entry_type: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewJournal {
    pub title: String,
    pub content: String,
    pub category: String,
    pub entry_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryRecord {
    pub id: String,
    pub user_id: String,
    pub memory_type: String,
    pub data: Value,
    pub content: String,
    pub importance: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMemory {
    pub memory_type: String,
    pub data: Value,
    pub content: String,
    pub importance: i64,
}

/// 日程类型；模型常输出 "cron"，按 recurring 处理
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    OneTime,
    #[serde(alias = "cron")]
    Recurring,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Active,
    Completed,
    Cancelled,
}

impl ScheduleStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleRecord {
    pub id: String,
    pub user_id: String,
    pub action_type: String,
    pub action_payload: Value,
    pub schedule_type: ScheduleType,
    pub schedule_value: String,
    pub timezone: String,
    pub next_run_at: Option<String>,
    pub status: ScheduleStatus,
    pub created_at: String,
}

impl ScheduleRecord {
    /// 给用户看的简短描述（payload 的 message / title，否则动作类型）
    pub fn label(&self) -> String {
        ["message", "title", "prompt"]
            .iter()
            .find_map(|k| self.action_payload.get(*k).and_then(Value::as_str))
            .map(str::to_string)
            .unwrap_or_else(|| self.action_type.replace('_', " "))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSchedule {
    pub action_type: String,
    pub action_payload: Value,
    pub schedule_type: ScheduleType,
    pub schedule_value: String,
    pub timezone: String,
    pub next_run_at: Option<String>,
}

/// 任务查询条件
#[derive(Debug, Clone)]
pub struct TaskQuery {
    pub status: Option<String>,
    pub priority: Option<String>,
    pub category: Option<String>,
    /// 非空时只取这些分类
    pub categories: Vec<String>,
    /// 非空时只取这些 id
    pub task_ids: Vec<String>,
    pub limit: usize,
    pub order_by: String,
    pub ascending: bool,
}

impl Default for TaskQuery {
    fn default() -> Self {
        Self {
            status: None,
            priority: None,
            category: None,
            categories: Vec::new(),
            task_ids: Vec::new(),
            limit: 25,
            order_by: "created_at".to_string(),
            ascending: false,
        }
    }
}

/// 日记查询条件；query 对标题与正文做不区分大小写的包含匹配
#[derive(Debug, Clone)]
pub struct JournalQuery {
    pub query: Option<String>,
    pub titles: Vec<String>,
    pub categories: Vec<String>,
    pub ids: Vec<String>,
    pub limit: usize,
}

impl Default for JournalQuery {
    fn default() -> Self {
        Self {
            query: None,
            titles: Vec::new(),
            categories: Vec::new(),
            ids: Vec::new(),
            limit: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskStats {
    pub total: usize,
    pub todo: usize,
    pub in_progress: usize,
    pub done: usize,
    pub overdue: usize,
    pub high_priority_open: usize,
}

/// 用户已有的分类词表
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CategoryIndex {
    pub tasks: Vec<String>,
    pub journals: Vec<String>,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn create_task(&self, user_id: &str, task: NewTask) -> Result<TaskRecord, StoreError>;
    async fn update_task(
        &self,
        user_id: &str,
        task_id: &str,
        patch: &Map<String, Value>,
    ) -> Result<TaskRecord, StoreError>;
    async fn delete_task(&self, user_id: &str, task_id: &str) -> Result<TaskRecord, StoreError>;
    async fn list_tasks(&self, user_id: &str, query: &TaskQuery) -> Result<Vec<TaskRecord>, StoreError>;
    async fn task_stats(&self, user_id: &str) -> Result<TaskStats, StoreError>;

    async fn create_journal(&self, user_id: &str, entry: NewJournal) -> Result<JournalRecord, StoreError>;
    async fn update_journal(
        &self,
        user_id: &str,
        id: &str,
        patch: &Map<String, Value>,
    ) -> Result<JournalRecord, StoreError>;
    async fn delete_journal(&self, user_id: &str, id: &str) -> Result<JournalRecord, StoreError>;
    async fn list_journals(
        &self,
        user_id: &str,
        query: &JournalQuery,
    ) -> Result<Vec<JournalRecord>, StoreError>;

    /// 同一 memory_type 只保留一条，已存在则覆盖
    async fn upsert_memory(&self, user_id: &str, memory: NewMemory) -> Result<MemoryRecord, StoreError>;
    async fn list_memories(
        &self,
        user_id: &str,
        memory_type: Option<&str>,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>, StoreError>;
    async fn delete_memory(&self, user_id: &str, id: &str) -> Result<MemoryRecord, StoreError>;

    /// 活跃日程数达到 max_active 时返回 LimitReached
    async fn create_schedule(
        &self,
        user_id: &str,
        schedule: NewSchedule,
        max_active: usize,
    ) -> Result<ScheduleRecord, StoreError>;
    async fn list_schedules(
        &self,
        user_id: &str,
        status: Option<ScheduleStatus>,
        limit: usize,
    ) -> Result<Vec<ScheduleRecord>, StoreError>;
    async fn update_schedule(
        &self,
        user_id: &str,
        id: &str,
        patch: &Map<String, Value>,
    ) -> Result<ScheduleRecord, StoreError>;

    /// 取消日程（状态置为 cancelled）
    async fn delete_schedule(&self, user_id: &str, id: &str) -> Result<ScheduleRecord, StoreError> {
        let mut patch = Map::new();
        patch.insert("status".into(), Value::String("cancelled".into()));
        self.update_schedule(user_id, id, &patch).await
    }

    async fn categories(&self, user_id: &str) -> Result<CategoryIndex, StoreError> {
        let tasks = self
            .list_tasks(
                user_id,
                &TaskQuery {
                    limit: usize::MAX,
                    ..TaskQuery::default()
                },
            )
            .await?;
        let journals = self
            .list_journals(
                user_id,
                &JournalQuery {
                    limit: usize::MAX,
                    ..JournalQuery::default()
                },
            )
            .await?;
        let tasks: BTreeSet<String> = tasks.into_iter().map(|t| t.category).collect();
        let journals: BTreeSet<String> = journals.into_iter().map(|j| j.category).collect();
        Ok(CategoryIndex {
            tasks: tasks.into_iter().filter(|c| !c.is_empty()).collect(),
            journals: journals.into_iter().filter(|c| !c.is_empty()).collect(),
        })
    }
}

/// 用 patch 中的字段覆盖记录；id、user_id、created_at 不可改
pub fn apply_patch<T>(record: &T, patch: &Map<String, Value>) -> Result<T, StoreError>
where
    T: Serialize + serde::de::DeserializeOwned,
{
    let mut value = serde_json::to_value(record).map_err(|e| StoreError::Invalid(e.to_string()))?;
    if let Value::Object(map) = &mut value {
        for (key, v) in patch {
            if matches!(key.as_str(), "id" | "user_id" | "created_at") {
                continue;
            }
            if map.contains_key(key) {
                map.insert(key.clone(), v.clone());
            }
        }
        if map.contains_key("updated_at") {
            map.insert("updated_at".into(), Value::String(crate::memory::now_iso()));
        }
    }
    serde_json::from_value(value).map_err(|e| StoreError::Invalid(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task() -> TaskRecord {
        TaskRecord {
            id: "t1".into(),
            user_id: "u1".into(),
            title: "Buy milk".into(),
            description: String::new(),
            notes: String::new(),
            priority: "low".into(),
            category: "shopping".into(),
            status: "todo".into(),
            due_date: None,
            created_at: "2025-01-01T00:00:00Z".into(),
            updated_at: "2025-01-01T00:00:00Z".into(),
        }
    }

    #[test]
    fn test_apply_patch_updates_known_fields_only() {
        let patch = json!({"status": "done", "id": "evil", "unknown": 1})
            .as_object()
            .cloned()
            .unwrap();
        let patched = apply_patch(&task(), &patch).unwrap();
        assert_eq!(patched.status, "done");
        assert_eq!(patched.id, "t1");
        assert_ne!(patched.updated_at, "2025-01-01T00:00:00Z");
    }

    #[test]
    fn test_apply_patch_rejects_wrong_types() {
        let patch = json!({"title": 42}).as_object().cloned().unwrap();
        assert!(matches!(apply_patch(&task(), &patch), Err(StoreError::Invalid(_))));
    }

    #[test]
    fn test_schedule_type_accepts_cron_alias() {
        let t: ScheduleType = serde_json::from_value(json!("cron")).unwrap();
        assert_eq!(t, ScheduleType::Recurring);
        assert_eq!(ScheduleStatus::parse("Canceled"), Some(ScheduleStatus::Cancelled));
    }
}

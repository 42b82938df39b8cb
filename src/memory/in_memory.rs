//! 内存存储：按用户分区的 HashMap，供测试与本地运行使用

use std::cmp::Ordering;
use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use super::store::{
    apply_patch, JournalQuery, JournalRecord, MemoryRecord, NewJournal, NewMemory, NewSchedule,
    NewTask, ScheduleRecord, ScheduleStatus, Store, StoreError, TaskQuery, TaskRecord, TaskStats,
};
use super::now_iso;

#[derive(Default)]
struct UserData {
    tasks: Vec<TaskRecord>,
    journals: Vec<JournalRecord>,
    memories: Vec<MemoryRecord>,
    schedules: Vec<ScheduleRecord>,
}

#[derive(Default)]
pub struct InMemoryStore {
    users: RwLock<HashMap<String, UserData>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn priority_rank(p: &str) -> u8 {
    match p {
        "high" => 3,
        "medium" => 2,
        "low" => 1,
        _ => 0,
    }
}

fn compare_tasks(a: &TaskRecord, b: &TaskRecord, order_by: &str) -> Ordering {
    match order_by {
        // 没有截止日期的排在最后
        "due_date" => match (&a.due_date, &b.due_date) {
            (Some(x), Some(y)) => x.cmp(y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        },
        "priority" => priority_rank(&a.priority).cmp(&priority_rank(&b.priority)),
        "title" => a.title.to_lowercase().cmp(&b.title.to_lowercase()),
        "updated_at" => a.updated_at.cmp(&b.updated_at),
        _ => a.created_at.cmp(&b.created_at),
    }
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create_task(&self, user_id: &str, task: NewTask) -> Result<TaskRecord, StoreError> {
        if task.title.trim().is_empty() {
            return Err(StoreError::Invalid("task title is required".into()));
        }
        let now = now_iso();
        let record = TaskRecord {
            id: new_id(),
            user_id: user_id.to_string(),
            title: task.title.trim().to_string(),
            description: task.description,
            notes: task.notes,
            priority: task.priority,
            category: task.category,
            status: "todo".to_string(),
            due_date: task.due_date,
            created_at: now.clone(),
            updated_at: now,
        };
        let mut users = self.users.write().await;
        users.entry(user_id.to_string()).or_default().tasks.push(record.clone());
        Ok(record)
    }

    async fn update_task(
        &self,
        user_id: &str,
        task_id: &str,
        patch: &Map<String, Value>,
    ) -> Result<TaskRecord, StoreError> {
        let mut users = self.users.write().await;
        let slot = users
            .get_mut(user_id)
            .and_then(|u| u.tasks.iter_mut().find(|t| t.id == task_id))
            .ok_or_else(|| StoreError::NotFound { kind: "task", id: task_id.to_string() })?;
        let updated = apply_patch(&*slot, patch)?;
        *slot = updated.clone();
        Ok(updated)
    }

    async fn delete_task(&self, user_id: &str, task_id: &str) -> Result<TaskRecord, StoreError> {
        let mut users = self.users.write().await;
        let tasks = &mut users
            .get_mut(user_id)
            .ok_or_else(|| StoreError::NotFound { kind: "task", id: task_id.to_string() })?
            .tasks;
        let pos = tasks
            .iter()
            .position(|t| t.id == task_id)
            .ok_or_else(|| StoreError::NotFound { kind: "task", id: task_id.to_string() })?;
        Ok(tasks.remove(pos))
    }

    async fn list_tasks(&self, user_id: &str, query: &TaskQuery) -> Result<Vec<TaskRecord>, StoreError> {
        let users = self.users.read().await;
        let Some(data) = users.get(user_id) else {
            return Ok(Vec::new());
        };
        let mut rows: Vec<(usize, &TaskRecord)> = data
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| query.status.as_deref().map_or(true, |s| t.status == s))
            .filter(|(_, t)| query.priority.as_deref().map_or(true, |p| t.priority == p))
            .filter(|(_, t)| query.category.as_deref().map_or(true, |c| t.category.eq_ignore_ascii_case(c)))
            .filter(|(_, t)| {
                query.categories.is_empty()
                    || query.categories.iter().any(|c| t.category.eq_ignore_ascii_case(c))
            })
            .filter(|(_, t)| query.task_ids.is_empty() || query.task_ids.contains(&t.id))
            .collect();

        // 插入序作为次序键，保证同一时间戳下「越晚越新」
        rows.sort_by(|(ia, a), (ib, b)| {
            let ord = compare_tasks(a, b, &query.order_by).then(ia.cmp(ib));
            if query.ascending {
                ord
            } else {
                ord.reverse()
            }
        });
        Ok(rows.into_iter().take(query.limit).map(|(_, t)| t.clone()).collect())
    }

    async fn task_stats(&self, user_id: &str) -> Result<TaskStats, StoreError> {
        let users = self.users.read().await;
        let now = now_iso();
        let mut stats = TaskStats::default();
        for t in users.get(user_id).map(|u| u.tasks.as_slice()).unwrap_or_default() {
            stats.total += 1;
            match t.status.as_str() {
                "done" => stats.done += 1,
                "in_progress" => stats.in_progress += 1,
                _ => stats.todo += 1,
            }
            if t.status != "done" {
                if t.due_date.as_deref().is_some_and(|d| d < now.as_str()) {
                    stats.overdue += 1;
                }
                if t.priority == "high" {
                    stats.high_priority_open += 1;
                }
            }
        }
        Ok(stats)
    }

    async fn create_journal(&self, user_id: &str, entry: NewJournal) -> Result<JournalRecord, StoreError> {
        if entry.title.trim().is_empty() && entry.content.trim().is_empty() {
            return Err(StoreError::Invalid("journal entry needs a title or content".into()));
        }
        let now = now_iso();
        let record = JournalRecord {
            id: new_id(),
            user_id: user_id.to_string(),
            title: entry.title,
            content: entry.content,
            category: entry.category,
            entry_type: entry.entry_type,
            created_at: now.clone(),
            updated_at: now,
        };
        let mut users = self.users.write().await;
        users.entry(user_id.to_string()).or_default().journals.push(record.clone());
        Ok(record)
    }

    async fn update_journal(
        &self,
        user_id: &str,
        id: &str,
        patch: &Map<String, Value>,
    ) -> Result<JournalRecord, StoreError> {
        let mut users = self.users.write().await;
        let slot = users
            .get_mut(user_id)
            .and_then(|u| u.journals.iter_mut().find(|j| j.id == id))
            .ok_or_else(|| StoreError::NotFound { kind: "journal entry", id: id.to_string() })?;
        let updated = apply_patch(&*slot, patch)?;
        *slot = updated.clone();
        Ok(updated)
    }

    async fn delete_journal(&self, user_id: &str, id: &str) -> Result<JournalRecord, StoreError> {
        let mut users = self.users.write().await;
        let journals = &mut users
            .get_mut(user_id)
            .ok_or_else(|| StoreError::NotFound { kind: "journal entry", id: id.to_string() })?
            .journals;
        let pos = journals
            .iter()
            .position(|j| j.id == id)
            .ok_or_else(|| StoreError::NotFound { kind: "journal entry", id: id.to_string() })?;
        Ok(journals.remove(pos))
    }

    async fn list_journals(
        &self,
        user_id: &str,
        query: &JournalQuery,
    ) -> Result<Vec<JournalRecord>, StoreError> {
        let users = self.users.read().await;
        let Some(data) = users.get(user_id) else {
            return Ok(Vec::new());
        };
        Ok(data
            .journals
            .iter()
            .rev()
            .filter(|j| query.ids.is_empty() || query.ids.contains(&j.id))
            .filter(|j| {
                query.categories.is_empty()
                    || query.categories.iter().any(|c| j.category.eq_ignore_ascii_case(c))
            })
            .filter(|j| query.titles.is_empty() || query.titles.iter().any(|t| contains_ci(&j.title, t)))
            .filter(|j| {
                query
                    .query
                    .as_deref()
                    .map_or(true, |q| contains_ci(&j.title, q) || contains_ci(&j.content, q))
            })
            .take(query.limit)
            .cloned()
            .collect())
    }

    async fn upsert_memory(&self, user_id: &str, memory: NewMemory) -> Result<MemoryRecord, StoreError> {
        if memory.memory_type.trim().is_empty() {
            return Err(StoreError::Invalid("memory_type is required".into()));
        }
        let now = now_iso();
        let mut users = self.users.write().await;
        let data = users.entry(user_id.to_string()).or_default();
        if let Some(existing) = data.memories.iter_mut().find(|m| m.memory_type == memory.memory_type) {
            existing.data = memory.data;
            existing.content = memory.content;
            existing.importance = memory.importance;
            existing.updated_at = now;
            return Ok(existing.clone());
        }
        let record = MemoryRecord {
            id: new_id(),
            user_id: user_id.to_string(),
            memory_type: memory.memory_type,
            data: memory.data,
            content: memory.content,
            importance: memory.importance,
            created_at: now.clone(),
            updated_at: now,
        };
        data.memories.push(record.clone());
        Ok(record)
    }

    async fn list_memories(
        &self,
        user_id: &str,
        memory_type: Option<&str>,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>, StoreError> {
        let users = self.users.read().await;
        Ok(users
            .get(user_id)
            .map(|u| {
                u.memories
                    .iter()
                    .rev()
                    .filter(|m| memory_type.map_or(true, |t| m.memory_type == t))
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_memory(&self, user_id: &str, id: &str) -> Result<MemoryRecord, StoreError> {
        let mut users = self.users.write().await;
        let memories = &mut users
            .get_mut(user_id)
            .ok_or_else(|| StoreError::NotFound { kind: "memory", id: id.to_string() })?
            .memories;
        let pos = memories
            .iter()
            .position(|m| m.id == id)
            .ok_or_else(|| StoreError::NotFound { kind: "memory", id: id.to_string() })?;
        Ok(memories.remove(pos))
    }

    async fn create_schedule(
        &self,
        user_id: &str,
        schedule: NewSchedule,
        max_active: usize,
    ) -> Result<ScheduleRecord, StoreError> {
        let mut users = self.users.write().await;
        let data = users.entry(user_id.to_string()).or_default();
        let active = data
            .schedules
            .iter()
            .filter(|s| s.status == ScheduleStatus::Active)
            .count();
        if active >= max_active {
            return Err(StoreError::LimitReached(max_active));
        }
        let record = ScheduleRecord {
            id: new_id(),
            user_id: user_id.to_string(),
            action_type: schedule.action_type,
            action_payload: schedule.action_payload,
            schedule_type: schedule.schedule_type,
            schedule_value: schedule.schedule_value,
            timezone: schedule.timezone,
            next_run_at: schedule.next_run_at,
            status: ScheduleStatus::Active,
            created_at: now_iso(),
        };
        data.schedules.push(record.clone());
        Ok(record)
    }

    async fn list_schedules(
        &self,
        user_id: &str,
        status: Option<ScheduleStatus>,
        limit: usize,
    ) -> Result<Vec<ScheduleRecord>, StoreError> {
        let users = self.users.read().await;
        Ok(users
            .get(user_id)
            .map(|u| {
                u.schedules
                    .iter()
                    .filter(|s| status.map_or(true, |st| s.status == st))
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn update_schedule(
        &self,
        user_id: &str,
        id: &str,
        patch: &Map<String, Value>,
    ) -> Result<ScheduleRecord, StoreError> {
        let mut users = self.users.write().await;
        let slot = users
            .get_mut(user_id)
            .and_then(|u| u.schedules.iter_mut().find(|s| s.id == id))
            .ok_or_else(|| StoreError::NotFound { kind: "schedule", id: id.to_string() })?;
        let updated = apply_patch(&*slot, patch)?;
        *slot = updated.clone();
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::store::ScheduleType;
    use serde_json::json;

    fn new_task(title: &str, category: &str) -> NewTask {
        NewTask {
            title: title.into(),
            priority: "low".into(),
            category: category.into(),
            ..NewTask::default()
        }
    }

    #[tokio::test]
    async fn test_tasks_are_isolated_per_user() {
        let store = InMemoryStore::new();
        store.create_task("alice", new_task("Buy milk", "shopping")).await.unwrap();
        store.create_task("bob", new_task("Gym", "health")).await.unwrap();

        let alice = store.list_tasks("alice", &TaskQuery::default()).await.unwrap();
        assert_eq!(alice.len(), 1);
        assert_eq!(alice[0].title, "Buy milk");

        let err = store.delete_task("bob", &alice[0].id).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_list_tasks_newest_first_and_filters() {
        let store = InMemoryStore::new();
        for (t, c) in [("a", "work"), ("b", "home"), ("c", "work")] {
            store.create_task("u", new_task(t, c)).await.unwrap();
        }
        let all = store.list_tasks("u", &TaskQuery::default()).await.unwrap();
        assert_eq!(all.iter().map(|t| t.title.as_str()).collect::<Vec<_>>(), vec!["c", "b", "a"]);

        let work = store
            .list_tasks(
                "u",
                &TaskQuery {
                    categories: vec!["Work".into()],
                    limit: 1,
                    ..TaskQuery::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(work.len(), 1);
        assert_eq!(work[0].title, "c");
    }

    #[tokio::test]
    async fn test_task_stats() {
        let store = InMemoryStore::new();
        let t = store.create_task("u", new_task("a", "work")).await.unwrap();
        store.create_task("u", new_task("b", "work")).await.unwrap();
        let patch = json!({"status": "done"}).as_object().cloned().unwrap();
        store.update_task("u", &t.id, &patch).await.unwrap();
        let stats = store.task_stats("u").await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.done, 1);
        assert_eq!(stats.todo, 1);
    }

    #[tokio::test]
    async fn test_memory_upsert_by_type() {
        let store = InMemoryStore::new();
        let m = NewMemory {
            memory_type: "communication_style".into(),
            data: json!({"tone": "casual"}),
            content: "casual".into(),
            importance: 10,
        };
        let first = store.upsert_memory("u", m.clone()).await.unwrap();
        let second = store
            .upsert_memory(
                "u",
                NewMemory {
                    data: json!({"tone": "formal"}),
                    ..m
                },
            )
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        let all = store.list_memories("u", None, 25).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].data["tone"], "formal");
    }

    #[tokio::test]
    async fn test_schedule_ceiling_and_cancel() {
        let store = InMemoryStore::new();
        let make = || NewSchedule {
            action_type: "send_notification".into(),
            action_payload: json!({"message": "hi"}),
            schedule_type: ScheduleType::OneTime,
            schedule_value: "2030-01-01T00:00:00Z".into(),
            timezone: "UTC".into(),
            next_run_at: Some("2030-01-01T00:00:00Z".into()),
        };
        let first = store.create_schedule("u", make(), 2).await.unwrap();
        store.create_schedule("u", make(), 2).await.unwrap();
        assert_eq!(
            store.create_schedule("u", make(), 2).await.unwrap_err(),
            StoreError::LimitReached(2)
        );

        let cancelled = store.delete_schedule("u", &first.id).await.unwrap();
        assert_eq!(cancelled.status, ScheduleStatus::Cancelled);
        store.create_schedule("u", make(), 2).await.unwrap();
        let active = store.list_schedules("u", Some(ScheduleStatus::Active), 50).await.unwrap();
        assert_eq!(active.len(), 2);
    }

    #[tokio::test]
    async fn test_journal_search_and_categories() {
        let store = InMemoryStore::new();
        store
            .create_journal(
                "u",
                NewJournal {
                    title: "Dentist".into(),
                    content: "Dr. Lee 555-0100".into(),
                    category: "health".into(),
                    entry_type: "free_form".into(),
                },
            )
            .await
            .unwrap();
        store.create_task("u", new_task("Buy milk", "shopping")).await.unwrap();

        let hits = store
            .list_journals(
                "u",
                &JournalQuery {
                    query: Some("555".into()),
                    ..JournalQuery::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);

        let cats = store.categories("u").await.unwrap();
        assert_eq!(cats.tasks, vec!["shopping"]);
        assert_eq!(cats.journals, vec!["health"]);
    }
}

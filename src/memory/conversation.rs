//! 短期记忆：消息类型与滚动交互历史
//!
//! ConversationHistory 只保留最近 N 次交互（原始输入、澄清后的指令、去向、回复），
//! 供 Router 消解「它」「那个任务」之类的指代。

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 单条消息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// 一次完整交互
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Interaction {
    pub turn: u64,
    pub user_input: String,
    pub clarified_input: String,
    pub destination: String,
    pub response: String,
    pub timestamp: String,
}

/// 实体种类
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Task,
    Journal,
    Schedule,
    Memory,
}

/// 最近在对话中出现过的实体（消解指代时优先匹配）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: String,
    pub title: String,
}

/// 最近实体列表：新的在前，同 id 去重，超出容量丢弃最旧的
#[derive(Clone, Debug, Default)]
pub struct RecentRefs {
    refs: VecDeque<EntityRef>,
    capacity: usize,
}

impl RecentRefs {
    pub fn new(capacity: usize) -> Self {
        Self {
            refs: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn remember(&mut self, entity: EntityRef) {
        self.refs.retain(|r| !(r.kind == entity.kind && r.id == entity.id));
        self.refs.push_front(entity);
        self.refs.truncate(self.capacity);
    }

    pub fn forget(&mut self, kind: EntityKind, id: &str) {
        self.refs.retain(|r| !(r.kind == kind && r.id == id));
    }

    pub fn of_kind(&self, kind: EntityKind) -> Vec<EntityRef> {
        self.refs.iter().filter(|r| r.kind == kind).cloned().collect()
    }

    pub fn all(&self) -> Vec<EntityRef> {
        self.refs.iter().cloned().collect()
    }
}

/// 滚动交互历史：超出 max_items 时丢弃最旧的
#[derive(Clone, Debug)]
pub struct ConversationHistory {
    items: VecDeque<Interaction>,
    max_items: usize,
    turn: u64,
}

impl ConversationHistory {
    pub fn new(max_items: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(max_items),
            max_items: max_items.max(1),
            turn: 0,
        }
    }

    pub fn push(
        &mut self,
        user_input: impl Into<String>,
        clarified_input: impl Into<String>,
        destination: impl Into<String>,
        response: impl Into<String>,
    ) {
        self.turn += 1;
        self.items.push_back(Interaction {
            turn: self.turn,
            user_input: user_input.into(),
            clarified_input: clarified_input.into(),
            destination: destination.into(),
            response: response.into(),
            timestamp: crate::memory::now_iso(),
        });
        while self.items.len() > self.max_items {
            self.items.pop_front();
        }
    }

    pub fn items(&self) -> impl Iterator<Item = &Interaction> {
        self.items.iter()
    }

    pub fn last(&self) -> Option<&Interaction> {
        self.items.back()
    }

    /// 累计轮数（含已被剪掉的）
    pub fn turn(&self) -> u64 {
        self.turn
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// 拼入 prompt 的文本形式
    pub fn render(&self) -> String {
        if self.items.is_empty() {
            return "(no previous conversation)".to_string();
        }
        self.items
            .iter()
            .map(|i| {
                format!(
                    "Turn {}:\n  User: {}\n  Understood as: {}\n  Assistant: {}",
                    i.turn, i.user_input, i.clarified_input, i.response
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_keeps_last_n() {
        let mut h = ConversationHistory::new(5);
        for i in 0..7 {
            h.push(format!("u{i}"), format!("c{i}"), "TaskAgent", format!("r{i}"));
        }
        assert_eq!(h.len(), 5);
        assert_eq!(h.turn(), 7);
        assert_eq!(h.items().next().unwrap().user_input, "u2");
        assert_eq!(h.last().unwrap().turn, 7);
    }

    #[test]
    fn test_recent_refs_dedup_and_order() {
        let mut refs = RecentRefs::new(3);
        let task = |id: &str| EntityRef {
            kind: EntityKind::Task,
            id: id.into(),
            title: format!("task {id}"),
        };
        refs.remember(task("1"));
        refs.remember(task("2"));
        refs.remember(task("1"));
        refs.remember(EntityRef {
            kind: EntityKind::Journal,
            id: "j".into(),
            title: "note".into(),
        });
        refs.remember(task("3"));
        let ids: Vec<String> = refs.all().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["3", "j", "1"]);
        assert_eq!(refs.of_kind(EntityKind::Task).len(), 2);
        refs.forget(EntityKind::Task, "3");
        assert_eq!(refs.of_kind(EntityKind::Task).len(), 1);
    }

    #[test]
    fn test_render() {
        let mut h = ConversationHistory::new(5);
        assert!(h.render().contains("no previous"));
        h.push("add milk", "Create a task: buy milk", "TaskAgent", "Added.");
        let text = h.render();
        assert!(text.contains("Turn 1"));
        assert!(text.contains("Create a task: buy milk"));
    }
}

//! 会话：每个用户的交互历史与最近实体引用
//!
//! 会话表用 RwLock 保护，单个会话用 Mutex 保护；一轮处理全程持有该用户的 Mutex，
//! 同一用户的指令因此串行执行，不同用户互不阻塞。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::memory::{ConversationHistory, EntityRef, RecentRefs};

/// 保留的最近实体引用数
const RECENT_REFS: usize = 10;

#[derive(Debug)]
pub struct Session {
    pub user_id: String,
    pub history: ConversationHistory,
    pub refs: RecentRefs,
}

impl Session {
    pub fn new(user_id: impl Into<String>, history_turns: usize) -> Self {
        Self {
            user_id: user_id.into(),
            history: ConversationHistory::new(history_turns),
            refs: RecentRefs::new(RECENT_REFS),
        }
    }

    pub fn remember_all(&mut self, refs: impl IntoIterator<Item = EntityRef>) {
        for r in refs {
            self.refs.remember(r);
        }
    }

    pub fn turn(&self) -> u64 {
        self.history.turn()
    }
}

pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
    history_turns: usize,
}

impl SessionManager {
    pub fn new(history_turns: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            history_turns,
        }
    }

    /// 取得（必要时创建）用户会话
    pub async fn session(&self, user_id: &str) -> Arc<Mutex<Session>> {
        if let Some(s) = self.sessions.read().await.get(user_id) {
            return s.clone();
        }
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Session::new(user_id, self.history_turns))))
            .clone()
    }

    /// 清空某用户的会话
    pub async fn reset(&self, user_id: &str) -> bool {
        self.sessions.write().await.remove(user_id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

//! Mock LLM 客户端（用于测试与无 Key 的本地运行）
//!
//! 回复来源按优先级：预置队列 → 关键词规则（prompt 含该片段即命中，按注册顺序）→ 默认回复。
//! 记录每次收到的 prompt，便于断言。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError};
use crate::memory::Message;

/// 可编排的 Mock 客户端
#[derive(Debug)]
pub struct MockLlmClient {
    rules: Vec<(String, Result<String, LlmError>)>,
    queue: Mutex<VecDeque<String>>,
    default_reply: String,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            queue: Mutex::new(VecDeque::new()),
            default_reply: "{}".to_string(),
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// prompt 中出现 needle 时返回 reply
    pub fn with_rule(mut self, needle: impl Into<String>, reply: impl Into<String>) -> Self {
        self.rules.push((needle.into(), Ok(reply.into())));
        self
    }

    /// prompt 中出现 needle 时返回错误
    pub fn with_failure(mut self, needle: impl Into<String>, err: LlmError) -> Self {
        self.rules.push((needle.into(), Err(err)));
        self
    }

    /// 依次返回的回复（优先于规则）
    pub fn with_replies<I, S>(self, replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Ok(mut q) = self.queue.lock() {
            q.extend(replies.into_iter().map(Into::into));
        }
        self
    }

    pub fn with_default(mut self, reply: impl Into<String>) -> Self {
        self.default_reply = reply.into();
        self
    }

    /// 已收到的 prompt（多条消息以换行拼接）
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let prompt = messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        if let Ok(mut p) = self.prompts.lock() {
            p.push(prompt.clone());
        }

        if let Some(reply) = self.queue.lock().ok().and_then(|mut q| q.pop_front()) {
            return Ok(reply);
        }

        if let Some((_, outcome)) = self.rules.iter().find(|(needle, _)| prompt.contains(needle.as_str())) {
            return outcome.clone();
        }

        Ok(self.default_reply.clone())
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

//! 凭证轮换代理
//!
//! 多个 API Key 组成循环凭证池；调用遇到配额 / 权限错误时原子地标记当前 Key 失效，
//! 前移到下一个可用 Key 并重试。重试次数以代理创建时的可用 Key 数为上限；
//! 其它错误立即向上传播，不触发轮换。失效标记在进程内永久有效。

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use super::{LlmClient, LlmError, ModelProfile, JSON_ONLY_INSTRUCTION};
use crate::memory::{Message, Role};

/// 单个 API 凭证
#[derive(Debug)]
pub struct ApiCredential {
    value: String,
    broken: AtomicBool,
}

impl ApiCredential {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            broken: AtomicBool::new(false),
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    /// 标记为失效；返回 true 表示本次调用完成了翻转（并发重复标记返回 false）
    pub fn mark_broken(&self) -> bool {
        self.broken
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// 日志用的脱敏显示，如 `sk-a…9f`
    pub fn masked(&self) -> String {
        let chars: Vec<char> = self.value.chars().collect();
        if chars.len() <= 8 {
            return "****".to_string();
        }
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 2..].iter().collect();
        format!("{head}…{tail}")
    }
}

/// 循环凭证池：所有 Agent 共享同一实例
#[derive(Debug, Default)]
pub struct CredentialPool {
    credentials: Vec<ApiCredential>,
    cursor: AtomicUsize,
}

impl CredentialPool {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut credentials: Vec<ApiCredential> = Vec::new();
        for key in keys {
            let key: String = key.into();
            let key = key.trim();
            if key.is_empty() || credentials.iter().any(|c| c.value == key) {
                continue;
            }
            credentials.push(ApiCredential::new(key));
        }
        Self {
            credentials,
            cursor: AtomicUsize::new(0),
        }
    }

    /// 从逗号分隔的环境变量读取（如 `TODOWA_API_KEYS=k1,k2`）
    pub fn from_env(var: &str) -> Self {
        let raw = std::env::var(var).unwrap_or_default();
        Self::new(raw.split(','))
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    pub fn valid_count(&self) -> usize {
        self.credentials.iter().filter(|c| !c.is_broken()).count()
    }

    pub fn broken_count(&self) -> usize {
        self.len() - self.valid_count()
    }

    /// 从游标开始循环查找第一个未失效的凭证，并把游标停在该处
    pub fn current(&self) -> Option<(usize, &ApiCredential)> {
        let n = self.credentials.len();
        if n == 0 {
            return None;
        }
        let start = self.cursor.load(Ordering::Acquire) % n;
        (0..n)
            .map(|offset| (start + offset) % n)
            .find(|&i| !self.credentials[i].is_broken())
            .map(|i| {
                self.cursor.store(i, Ordering::Release);
                (i, &self.credentials[i])
            })
    }

    /// 标记 idx 失效并前移到下一个可用凭证；没有可用凭证时返回 None
    pub fn rotate_from(&self, idx: usize) -> Option<(usize, &ApiCredential)> {
        let n = self.credentials.len();
        let credential = self.credentials.get(idx)?;
        if credential.mark_broken() {
            tracing::warn!(
                credential = %credential.masked(),
                remaining = self.valid_count(),
                "credential marked broken"
            );
        }
        self.cursor.store((idx + 1) % n, Ordering::Release);
        self.current()
    }
}

/// 后端：用给定 Key 构造一个实际的模型客户端
pub trait CredentialBackend: Send + Sync {
    fn connect(&self, api_key: &str, profile: &ModelProfile) -> Arc<dyn LlmClient>;
}

/// 带凭证轮换的模型句柄
pub struct RotatingLlmClient {
    pool: Arc<CredentialPool>,
    backend: Arc<dyn CredentialBackend>,
    profile: ModelProfile,
    /// 创建时可用的凭证数，即单次调用的最大尝试次数
    max_attempts: usize,
    calls: AtomicUsize,
}

impl RotatingLlmClient {
    pub fn new(
        pool: Arc<CredentialPool>,
        backend: Arc<dyn CredentialBackend>,
        profile: ModelProfile,
    ) -> Self {
        let max_attempts = pool.valid_count();
        Self {
            pool,
            backend,
            profile,
            max_attempts,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn profile(&self) -> &ModelProfile {
        &self.profile
    }

    fn prepare(&self, messages: &[Message]) -> Vec<Message> {
        if !self.profile.structured_output {
            return messages.to_vec();
        }
        let mut out = Vec::with_capacity(messages.len() + 1);
        match messages.first() {
            Some(first) if first.role == Role::System => {
                out.push(Message::system(format!(
                    "{}\n\n{}",
                    first.content, JSON_ONLY_INSTRUCTION
                )));
                out.extend_from_slice(&messages[1..]);
            }
            _ => {
                out.push(Message::system(JSON_ONLY_INSTRUCTION));
                out.extend_from_slice(messages);
            }
        }
        out
    }
}

#[async_trait]
impl LlmClient for RotatingLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        if self.pool.is_empty() {
            return Err(LlmError::NoCredentials);
        }
        self.calls.fetch_add(1, Ordering::Relaxed);
        let messages = self.prepare(messages);

        let mut attempts = 0usize;
        let mut last = LlmError::Api("no valid credential remaining".to_string());
        let mut slot = self.pool.current();

        while attempts < self.max_attempts {
            let Some((idx, credential)) = slot else {
                break;
            };
            attempts += 1;
            let client = self.backend.connect(credential.value(), &self.profile);
            match client.complete(&messages).await {
                Ok(text) => return Ok(text),
                Err(err) if err.is_rotatable() => {
                    tracing::warn!(
                        agent = %self.profile.agent_name,
                        credential = %credential.masked(),
                        error = %err,
                        "rotating credential"
                    );
                    last = err;
                    slot = self.pool.rotate_from(idx);
                }
                Err(err) => return Err(err),
            }
        }

        tracing::error!(
            agent = %self.profile.agent_name,
            attempts,
            "all credentials exhausted"
        );
        Err(LlmError::CredentialsExhausted {
            attempts,
            last: Box::new(last),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

/// 按 Agent 名创建轮换句柄；所有句柄共享同一凭证池
#[derive(Clone)]
pub struct ModelFactory {
    pool: Arc<CredentialPool>,
    backend: Arc<dyn CredentialBackend>,
}

impl ModelFactory {
    pub fn new(pool: Arc<CredentialPool>, backend: Arc<dyn CredentialBackend>) -> Self {
        Self { pool, backend }
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    /// JSON 输出句柄
    pub fn structured(&self, agent_name: &str) -> Arc<dyn LlmClient> {
        Arc::new(RotatingLlmClient::new(
            self.pool.clone(),
            self.backend.clone(),
            ModelProfile::structured(agent_name),
        ))
    }

    /// 自由文本句柄
    pub fn chat(&self, agent_name: &str) -> Arc<dyn LlmClient> {
        Arc::new(RotatingLlmClient::new(
            self.pool.clone(),
            self.backend.clone(),
            ModelProfile::chat(agent_name),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// 按 Key 返回预设结果的后端，并记录使用过的 Key
    struct ScriptedBackend {
        outcomes: HashMap<String, Result<String, LlmError>>,
        used: Arc<Mutex<Vec<String>>>,
    }

    struct ScriptedClient {
        key: String,
        outcome: Result<String, LlmError>,
        used: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl LlmClient for ScriptedClient {
        async fn complete(&self, _messages: &[Message]) -> Result<String, LlmError> {
            self.used.lock().unwrap().push(self.key.clone());
            self.outcome.clone()
        }
    }

    impl CredentialBackend for ScriptedBackend {
        fn connect(&self, api_key: &str, _profile: &ModelProfile) -> Arc<dyn LlmClient> {
            let outcome = self
                .outcomes
                .get(api_key)
                .cloned()
                .unwrap_or_else(|| Ok("default".to_string()));
            Arc::new(ScriptedClient {
                key: api_key.to_string(),
                outcome,
                used: self.used.clone(),
            })
        }
    }

    fn backend(
        outcomes: Vec<(&str, Result<String, LlmError>)>,
    ) -> (Arc<ScriptedBackend>, Arc<Mutex<Vec<String>>>) {
        let used = Arc::new(Mutex::new(Vec::new()));
        let backend = ScriptedBackend {
            outcomes: outcomes
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            used: used.clone(),
        };
        (Arc::new(backend), used)
    }

    #[tokio::test]
    async fn test_quota_failure_rotates_to_next_key() {
        let pool = Arc::new(CredentialPool::new(["key-one-aaaa", "key-two-bbbb", "key-three-cc"]));
        let (backend, used) = backend(vec![
            ("key-one-aaaa", Err(LlmError::QuotaExceeded("429".into()))),
            ("key-two-bbbb", Ok("hello".into())),
        ]);
        let client = RotatingLlmClient::new(pool.clone(), backend, ModelProfile::chat("TaskAgent"));

        let out = client.generate("hi").await.unwrap();
        assert_eq!(out, "hello");
        assert_eq!(pool.broken_count(), 1);
        assert_eq!(*used.lock().unwrap(), vec!["key-one-aaaa", "key-two-bbbb"]);

        // 失效的 Key 不再被使用
        client.generate("again").await.unwrap();
        assert_eq!(used.lock().unwrap().last().unwrap(), "key-two-bbbb");
        assert!(!used.lock().unwrap()[2..].contains(&"key-one-aaaa".to_string()));
    }

    #[tokio::test]
    async fn test_all_keys_failing_yields_single_terminal_error() {
        let pool = Arc::new(CredentialPool::new(["k1-xxxxxxx", "k2-xxxxxxx", "k3-xxxxxxx"]));
        let (backend, used) = backend(vec![
            ("k1-xxxxxxx", Err(LlmError::QuotaExceeded("a".into()))),
            ("k2-xxxxxxx", Err(LlmError::PermissionDenied("b".into()))),
            ("k3-xxxxxxx", Err(LlmError::QuotaExceeded("c".into()))),
        ]);
        let client = RotatingLlmClient::new(pool.clone(), backend, ModelProfile::chat("BrainAgent"));

        let err = client.generate("hi").await.unwrap_err();
        match err {
            LlmError::CredentialsExhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert_eq!(*last, LlmError::QuotaExceeded("c".into()));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(used.lock().unwrap().len(), 3);
        assert_eq!(pool.valid_count(), 0);

        // 之后的调用不再尝试任何 Key
        let err = client.generate("hi").await.unwrap_err();
        assert!(matches!(err, LlmError::CredentialsExhausted { attempts: 0, .. }));
        assert_eq!(used.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_non_rotatable_error_propagates_immediately() {
        let pool = Arc::new(CredentialPool::new(["k1-xxxxxxx", "k2-xxxxxxx"]));
        let (backend, used) = backend(vec![("k1-xxxxxxx", Err(LlmError::Api("boom".into())))]);
        let client = RotatingLlmClient::new(pool.clone(), backend, ModelProfile::chat("X"));

        let err = client.generate("hi").await.unwrap_err();
        assert_eq!(err, LlmError::Api("boom".into()));
        assert_eq!(pool.broken_count(), 0);
        assert_eq!(used.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_pool_reports_no_credentials() {
        let pool = Arc::new(CredentialPool::new(Vec::<String>::new()));
        let (backend, _) = backend(vec![]);
        let client = RotatingLlmClient::new(pool, backend, ModelProfile::chat("X"));
        assert_eq!(client.generate("hi").await.unwrap_err(), LlmError::NoCredentials);
    }

    #[test]
    fn test_double_mark_is_tolerated() {
        let cred = ApiCredential::new("abcdefghijkl");
        assert!(cred.mark_broken());
        assert!(!cred.mark_broken());
        assert!(cred.is_broken());
        assert_eq!(cred.masked(), "abcd…kl");
    }

    #[test]
    fn test_pool_skips_blank_and_duplicate_keys() {
        let pool = CredentialPool::new(["a-key-1234", " ", "a-key-1234", "b-key-5678"]);
        assert_eq!(pool.len(), 2);
        let (idx, _) = pool.current().unwrap();
        assert_eq!(idx, 0);
        let (next, cred) = pool.rotate_from(0).unwrap();
        assert_eq!(next, 1);
        assert_eq!(cred.value(), "b-key-5678");
        assert!(pool.rotate_from(1).is_none());
    }

    #[test]
    fn test_structured_profile_prepends_json_instruction() {
        let pool = Arc::new(CredentialPool::new(["k1-xxxxxxx"]));
        let (backend, _) = backend(vec![]);
        let client = RotatingLlmClient::new(pool, backend, ModelProfile::structured("Router"));
        let prepared = client.prepare(&[Message::system("route it"), Message::user("x")]);
        assert_eq!(prepared.len(), 2);
        assert!(prepared[0].content.starts_with("route it"));
        assert!(prepared[0].content.contains("ONLY one valid JSON object"));
    }
}

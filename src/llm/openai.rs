//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）。
//! 每个凭证对应一个 OpenAiClient；OpenAiBackend 供轮换代理按 Key 构造客户端。

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::llm::rotation::CredentialBackend;
use crate::llm::{LlmClient, LlmError, ModelProfile};
use crate::memory::{Message, Role};

/// Token 使用统计（累计值，跨客户端共享）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
    }

    /// (prompt, completion, total)
    pub fn get(&self) -> (u64, u64, u64) {
        let p = self.prompt_tokens.load(Ordering::Relaxed);
        let c = self.completion_tokens.load(Ordering::Relaxed);
        (p, c, p + c)
    }
}

/// OpenAI 兼容客户端：单个 Key + 模型名
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    timeout: Duration,
    usage: TokenUsage,
    calls: AtomicUsize,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: &str, timeout: Duration) -> Self {
        let config = match base_url {
            Some(url) => OpenAIConfig::new().with_api_base(url).with_api_key(api_key),
            None => OpenAIConfig::new().with_api_key(api_key),
        };
        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            timeout,
            usage: TokenUsage::default(),
            calls: AtomicUsize::new(0),
        }
    }

    fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }

    fn to_openai_messages(
        &self,
        messages: &[Message],
    ) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
        messages
            .iter()
            .map(|m| {
                let built = match m.role {
                    Role::System => ChatCompletionRequestSystemMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map(ChatCompletionRequestMessage::System),
                    Role::User => ChatCompletionRequestUserMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map(ChatCompletionRequestMessage::User),
                    Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map(ChatCompletionRequestMessage::Assistant),
                };
                built.map_err(|e| LlmError::Api(e.to_string()))
            })
            .collect()
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(self.to_openai_messages(messages)?)
            .build()
            .map_err(|e| LlmError::Api(e.to_string()))?;

        let response = tokio::time::timeout(self.timeout, self.client.chat().create(request))
            .await
            .map_err(|_| LlmError::Timeout)?
            .map_err(|e| LlmError::classify(e.to_string()))?;

        if let Some(usage) = &response.usage {
            self.usage
                .add(usage.prompt_tokens as u64, usage.completion_tokens as u64);
        }

        response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .filter(|s| !s.trim().is_empty())
            .ok_or(LlmError::EmptyResponse)
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

/// 轮换代理使用的后端：结构化句柄用 model，对话句柄用 chat_model
pub struct OpenAiBackend {
    base_url: Option<String>,
    model: String,
    chat_model: String,
    timeout: Duration,
    usage: TokenUsage,
}

impl OpenAiBackend {
    pub fn new(
        base_url: Option<String>,
        model: impl Into<String>,
        chat_model: impl Into<String>,
        timeout_secs: u64,
    ) -> Self {
        Self {
            base_url,
            model: model.into(),
            chat_model: chat_model.into(),
            timeout: Duration::from_secs(timeout_secs),
            usage: TokenUsage::default(),
        }
    }

    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }
}

impl CredentialBackend for OpenAiBackend {
    fn connect(&self, api_key: &str, profile: &ModelProfile) -> Arc<dyn LlmClient> {
        let model = if profile.structured_output {
            &self.model
        } else {
            &self.chat_model
        };
        Arc::new(
            OpenAiClient::new(self.base_url.as_deref(), model, api_key, self.timeout)
                .with_usage(self.usage.clone()),
        )
    }
}

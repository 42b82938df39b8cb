//! LLM 层：客户端抽象、凭证轮换代理、OpenAI 兼容后端、Mock、JSON 回复解析

pub mod json;
pub mod mock;
pub mod openai;
pub mod rotation;
pub mod traits;

pub use json::{extract_json_object, parse_object, parse_reply};
pub use mock::MockLlmClient;
pub use openai::{OpenAiBackend, OpenAiClient, TokenUsage};
pub use rotation::{ApiCredential, CredentialBackend, CredentialPool, ModelFactory, RotatingLlmClient};
pub use traits::{LlmClient, LlmError, ModelProfile, JSON_ONLY_INSTRUCTION};

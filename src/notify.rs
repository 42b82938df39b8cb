//! 通知协作者
//!
//! 日程到点后由外部调度器回调核心，核心再通过 Notifier 把文本发给用户。
//! 发送失败只记日志，不影响回复主流程。

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("notification transport error: {0}")]
    Transport(String),

    #[error("notification rejected: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, address: &str, text: &str) -> Result<(), NotifyError>;
}

/// 只写日志的通知器（本地运行与测试）
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, address: &str, text: &str) -> Result<(), NotifyError> {
        tracing::info!(address = %address, chars = text.chars().count(), "notification: {}", text);
        Ok(())
    }
}

/// 单条消息的最大字符数，超出时分段发送
const WHATSAPP_MAX_CHARS: usize = 4000;

#[derive(Serialize)]
struct TextBody<'a> {
    body: &'a str,
}

#[derive(Serialize)]
struct SendMessageRequest<'a> {
    messaging_product: &'static str,
    to: String,
    #[serde(rename = "type")]
    msg_type: &'static str,
    text: TextBody<'a>,
}

/// WhatsApp Cloud API 通知器
pub struct WhatsappNotifier {
    client: reqwest::Client,
    access_token: String,
    phone_number_id: String,
}

impl WhatsappNotifier {
    pub fn new(access_token: impl Into<String>, phone_number_id: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            access_token: access_token.into(),
            phone_number_id: phone_number_id.into(),
        }
    }
}

/// 按字符切分长消息
fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= max_chars {
        return vec![text.to_string()];
    }
    chars.chunks(max_chars).map(|c| c.iter().collect()).collect()
}

#[async_trait]
impl Notifier for WhatsappNotifier {
    async fn send(&self, address: &str, text: &str) -> Result<(), NotifyError> {
        let url = format!("https://graph.facebook.com/v18.0/{}/messages", self.phone_number_id);
        for chunk in chunk_text(text, WHATSAPP_MAX_CHARS) {
            let req = SendMessageRequest {
                messaging_product: "whatsapp",
                to: address.replace('+', ""),
                msg_type: "text",
                text: TextBody { body: &chunk },
            };
            let resp = self
                .client
                .post(&url)
                .bearer_auth(&self.access_token)
                .json(&req)
                .send()
                .await
                .map_err(|e| NotifyError::Transport(e.to_string()))?;
            if !resp.status().is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(NotifyError::Rejected(body));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_long_text_is_chunked_on_char_boundaries() {
        let text = "日".repeat(9);
        let chunks = chunk_text(&text, 4);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2], "日");
        assert_eq!(chunk_text("short", 4000), vec!["short".to_string()]);
    }

    #[tokio::test]
    async fn test_log_notifier_always_succeeds() {
        assert!(LogNotifier.send("u1", "Time to call mom").await.is_ok());
    }
}

//! Chat transport: Telegram Bot API client + Markdown escaping.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "sor-transport";

/// Telegram chat id; negative values address groups and channels.
pub type ChatId = i64;

/// Markup mode a message is rendered in. User-supplied text must be escaped
/// with [`escape_markdown`] before being embedded in `Markdown` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Markup {
    Plain,
    Markdown,
}

impl Markup {
    pub fn parse_mode(self) -> Option<&'static str> {
        match self {
            Markup::Plain => None,
            Markup::Markdown => Some("Markdown"),
        }
    }
}

/// Escape the reserved characters of Telegram's legacy Markdown mode.
/// Unescaped `*`/`_`/`` ` ``/`[` inside a field breaks the whole message.
pub fn escape_markdown(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(ch, '*' | '_' | '`' | '[') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("transport rejected message: {0}")]
    Rejected(String),
}

/// Consumed chat contract: send one formatted text message to a destination
/// and report success or failure. A confirmed `Ok` is the only signal that
/// commits posted state upstream.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_message(
        &self,
        destination: ChatId,
        text: &str,
        markup: Markup,
    ) -> Result<(), TransportError>;
}

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub api_base: String,
    pub timeout: Duration,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            api_base: "https://api.telegram.org".to_string(),
            timeout: Duration::from_secs(35),
        }
    }
}

/// Telegram Bot API client over HTTPS.
#[derive(Debug)]
pub struct TelegramClient {
    config: TelegramConfig,
    client: reqwest::Client,
}

impl TelegramClient {
    pub fn new(config: TelegramConfig) -> anyhow::Result<Self> {
        if config.bot_token.trim().is_empty() {
            anyhow::bail!("bot token missing; refusing to initialize transport client");
        }
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self { config, client })
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.config.api_base, self.config.bot_token, method
        )
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<T, TransportError> {
        let response = self
            .client
            .post(self.api_url(method))
            .json(&body)
            .send()
            .await?;
        let envelope: ApiResponse<T> = response.json().await?;
        if !envelope.ok {
            return Err(TransportError::Rejected(format!(
                "{method}: {}",
                envelope.description.unwrap_or_default()
            )));
        }
        envelope
            .result
            .ok_or_else(|| TransportError::Rejected(format!("{method}: empty result")))
    }

    /// Identity check; also a cheap startup credential probe.
    pub async fn get_me(&self) -> Result<BotUser, TransportError> {
        self.call("getMe", serde_json::json!({})).await
    }

    /// Long-poll for updates after `offset`, blocking up to `timeout_secs`.
    pub async fn get_updates(
        &self,
        offset: i64,
        timeout_secs: u64,
    ) -> Result<Vec<Update>, TransportError> {
        self.call(
            "getUpdates",
            serde_json::json!({
                "offset": offset,
                "timeout": timeout_secs,
                "allowed_updates": ["message"],
            }),
        )
        .await
    }
}

#[async_trait]
impl ChatTransport for TelegramClient {
    async fn send_message(
        &self,
        destination: ChatId,
        text: &str,
        markup: Markup,
    ) -> Result<(), TransportError> {
        let mut body = serde_json::json!({
            "chat_id": destination,
            "text": text,
        });
        if let Some(mode) = markup.parse_mode() {
            body["parse_mode"] = serde_json::Value::String(mode.to_string());
        }
        let _sent: serde_json::Value = self.call("sendMessage", body).await?;
        debug!(destination, "message delivered");
        Ok(())
    }
}

// --- Telegram wire types ---

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub from: Option<BotUser>,
    pub chat: Chat,
    pub text: Option<String>,
    pub date: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotUser {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    pub first_name: String,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: ChatId,
    #[serde(rename = "type")]
    pub chat_type: String,
    pub title: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_characters_are_escaped() {
        assert_eq!(escape_markdown("a*b_c`d[e"), "a\\*b\\_c\\`d\\[e");
        assert_eq!(escape_markdown("plain text, no markup."), "plain text, no markup.");
        assert_eq!(escape_markdown("50% off (terms apply)"), "50% off (terms apply)");
    }

    #[test]
    fn parse_mode_only_set_for_markdown() {
        assert_eq!(Markup::Markdown.parse_mode(), Some("Markdown"));
        assert_eq!(Markup::Plain.parse_mode(), None);
    }

    #[test]
    fn empty_token_refuses_to_initialize() {
        let err = TelegramClient::new(TelegramConfig::default()).unwrap_err();
        assert!(err.to_string().contains("bot token"));
    }

    #[test]
    fn update_envelope_deserializes() {
        let payload = serde_json::json!({
            "ok": true,
            "result": [{
                "update_id": 42,
                "message": {
                    "message_id": 7,
                    "from": {"id": 11, "is_bot": false, "first_name": "Ada"},
                    "chat": {"id": -100123, "type": "supergroup", "title": "Scholars"},
                    "text": "/post nigeria",
                    "date": 1735689600,
                },
            }],
        });
        let envelope: ApiResponse<Vec<Update>> = serde_json::from_value(payload).unwrap();
        assert!(envelope.ok);
        let updates = envelope.result.unwrap();
        assert_eq!(updates.len(), 1);
        let message = updates[0].message.as_ref().unwrap();
        assert_eq!(message.chat.id, -100123);
        assert_eq!(message.text.as_deref(), Some("/post nigeria"));
    }

    #[test]
    fn rejected_response_carries_description() {
        let payload = serde_json::json!({
            "ok": false,
            "description": "Bad Request: chat not found",
        });
        let envelope: ApiResponse<serde_json::Value> = serde_json::from_value(payload).unwrap();
        assert!(!envelope.ok);
        assert_eq!(
            envelope.description.as_deref(),
            Some("Bad Request: chat not found")
        );
    }
}

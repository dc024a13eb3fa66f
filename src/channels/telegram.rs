//! Telegram channel — long-polls the Bot API for updates.
//!
//! Native Rust Telegram Bot API client. Inbound text messages become
//! [`InboundMessage`]s; replies, typing indicators and forwards go out
//! through the `ReplySender` and `MessageForwarder` traits.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::Stream;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

use crate::error::ChannelError;
use crate::pipeline::types::{InboundMessage, MessageForwarder, ReplySender};

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

/// Long-poll timeout passed to getUpdates.
const POLL_TIMEOUT_SECS: u64 = 30;

/// Per-request limit for every Bot API call except long polls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Back-off after a failed poll.
const POLL_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Stream of inbound messages from a channel.
pub type MessageStream = Pin<Box<dyn Stream<Item = InboundMessage> + Send>>;

/// Telegram channel — connects to the Bot API via long-polling.
pub struct TelegramChannel {
    bot_token: SecretString,
    client: reqwest::Client,
    offset: AtomicI64,
}

impl TelegramChannel {
    pub fn new(bot_token: SecretString) -> Self {
        Self {
            bot_token,
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            offset: AtomicI64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        "telegram"
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "https://api.telegram.org/bot{}/{method}",
            self.bot_token.expose_secret()
        )
    }

    fn send_failed(reason: impl Into<String>) -> ChannelError {
        ChannelError::SendFailed {
            name: "telegram".into(),
            reason: reason.into(),
        }
    }

    /// Verify the token with getMe.
    pub async fn health_check(&self) -> Result<(), ChannelError> {
        let resp = self
            .client
            .get(self.api_url("getMe"))
            .send()
            .await
            .map_err(|e| ChannelError::StartupFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(ChannelError::StartupFailed {
                name: "telegram".into(),
                reason: format!("getMe returned {}", resp.status()),
            })
        }
    }

    /// One getUpdates long-poll. Advances the offset past every update seen,
    /// including ones that are not text messages.
    pub async fn fetch_updates(&self) -> Result<Vec<InboundMessage>, ChannelError> {
        let body = serde_json::json!({
            "offset": self.offset.load(Ordering::SeqCst),
            "timeout": POLL_TIMEOUT_SECS,
            "allowed_updates": ["message"]
        });

        let data: Value = self
            .client
            .post(self.api_url("getUpdates"))
            .timeout(Duration::from_secs(POLL_TIMEOUT_SECS + 10))
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::Http(e.to_string()))?
            .json()
            .await
            .map_err(|e| ChannelError::InvalidMessage(e.to_string()))?;

        let Some(results) = data.get("result").and_then(Value::as_array) else {
            return Err(ChannelError::InvalidMessage(format!(
                "getUpdates returned no result: {data}"
            )));
        };

        let mut messages = Vec::new();
        for update in results {
            if let Some(uid) = update.get("update_id").and_then(Value::as_i64) {
                self.offset.fetch_max(uid + 1, Ordering::SeqCst);
            }
            if let Some(message) = parse_update(update) {
                messages.push(message);
            }
        }
        Ok(messages)
    }

    /// Poll forever on a background task, yielding messages as they arrive.
    pub fn listen(self: Arc<Self>) -> MessageStream {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        tokio::spawn(async move {
            tracing::info!("Telegram channel listening for messages...");
            loop {
                match self.fetch_updates().await {
                    Ok(messages) => {
                        for message in messages {
                            if tx.send(message).is_err() {
                                tracing::info!("Telegram listener channel closed");
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Telegram poll error");
                        tokio::time::sleep(POLL_RETRY_DELAY).await;
                    }
                }
            }
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        });
        Box::pin(stream)
    }

    /// Send a text message, trying Markdown first with plain text fallback.
    /// Splits long messages that exceed Telegram's 4096 char limit.
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        reply_to: Option<i64>,
    ) -> Result<(), ChannelError> {
        for (i, chunk) in split_message(text, TELEGRAM_MAX_MESSAGE_LENGTH).iter().enumerate() {
            // Only the first chunk threads onto the original message.
            let reply_to = if i == 0 { reply_to } else { None };
            self.send_message_chunk(chat_id, chunk, reply_to).await?;
        }
        Ok(())
    }

    async fn send_message_chunk(
        &self,
        chat_id: i64,
        text: &str,
        reply_to: Option<i64>,
    ) -> Result<(), ChannelError> {
        let mut body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
        });
        if let Some(id) = reply_to {
            body["reply_to_message_id"] = Value::from(id);
            body["allow_sending_without_reply"] = Value::Bool(true);
        }

        let mut markdown_body = body.clone();
        markdown_body["parse_mode"] = Value::from("Markdown");

        let markdown_resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&markdown_body)
            .send()
            .await
            .map_err(|e| Self::send_failed(e.to_string()))?;

        if markdown_resp.status().is_success() {
            return Ok(());
        }

        let markdown_status = markdown_resp.status();
        tracing::warn!(
            status = ?markdown_status,
            "Telegram sendMessage with Markdown failed; retrying without parse_mode"
        );

        let plain_resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&body)
            .send()
            .await
            .map_err(|e| Self::send_failed(e.to_string()))?;

        if !plain_resp.status().is_success() {
            let plain_err = plain_resp.text().await.unwrap_or_default();
            return Err(Self::send_failed(format!(
                "sendMessage failed (markdown: {markdown_status}, plain: {plain_err})"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ReplySender for TelegramChannel {
    async fn send_reply(&self, original: &InboundMessage, text: &str) -> Result<(), ChannelError> {
        self.send_message(original.chat_id, text, Some(original.message_id))
            .await
    }

    async fn send_typing(&self, original: &InboundMessage) -> Result<(), ChannelError> {
        let resp = self
            .client
            .post(self.api_url("sendChatAction"))
            .json(&serde_json::json!({
                "chat_id": original.chat_id,
                "action": "typing"
            }))
            .send()
            .await
            .map_err(|e| Self::send_failed(e.to_string()))?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(Self::send_failed(format!("sendChatAction returned {}", resp.status())))
        }
    }
}

#[async_trait]
impl MessageForwarder for TelegramChannel {
    async fn forward(&self, message_id: i64, source_chat_id: i64, destination_chat_id: &str) -> bool {
        let body = serde_json::json!({
            "chat_id": destination_value(destination_chat_id),
            "from_chat_id": source_chat_id,
            "message_id": message_id,
        });

        match self
            .client
            .post(self.api_url("forwardMessage"))
            .json(&body)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                let status = resp.status();
                let err = resp.text().await.unwrap_or_default();
                tracing::warn!(
                    destination = destination_chat_id,
                    status = ?status,
                    error = %err,
                    "Telegram forwardMessage rejected"
                );
                false
            }
            Err(e) => {
                tracing::warn!(destination = destination_chat_id, error = %e, "Telegram forwardMessage failed");
                false
            }
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Numeric chat IDs go out as integers, `@channel` names as strings.
fn destination_value(destination: &str) -> Value {
    let trimmed = destination.trim();
    match trimmed.parse::<i64>() {
        Ok(id) => Value::from(id),
        Err(_) => Value::from(trimmed),
    }
}

/// Convert one getUpdates entry into an inbound message. Non-text updates
/// yield `None`.
fn parse_update(update: &Value) -> Option<InboundMessage> {
    let update_id = update.get("update_id").and_then(Value::as_i64)?;
    let message = update.get("message")?;
    let text = message.get("text").and_then(Value::as_str)?;
    let chat_id = message
        .get("chat")
        .and_then(|c| c.get("id"))
        .and_then(Value::as_i64)?;
    let message_id = message.get("message_id").and_then(Value::as_i64)?;

    let from = message.get("from");
    let sender_id = from
        .and_then(|f| f.get("id"))
        .and_then(Value::as_i64)
        .unwrap_or(chat_id);
    let sender_name = from
        .and_then(|f| f.get("first_name").or_else(|| f.get("username")))
        .and_then(Value::as_str)
        .map(String::from);

    let received_at = message
        .get("date")
        .and_then(Value::as_i64)
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .unwrap_or_else(Utc::now);

    Some(InboundMessage {
        id: format!("telegram-{update_id}"),
        channel: "telegram".into(),
        chat_id,
        message_id,
        sender_id,
        sender_name,
        text: text.to_string(),
        received_at,
    })
}

/// Split a message into chunks that fit Telegram's character limit.
/// Tries to split on newlines, then spaces, then hard-cuts.
fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut remaining = text;

    loop {
        // Byte offset of the first char past the limit, if any.
        let Some((cut, _)) = remaining.char_indices().nth(max_chars) else {
            chunks.push(remaining.to_string());
            break;
        };

        let window = &remaining[..cut];
        let split_at = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .filter(|&i| i > 0)
            .unwrap_or(cut);

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
        if remaining.is_empty() {
            break;
        }
    }

    chunks
}

// ── Tests ───────────────────────────────────────────────────────────

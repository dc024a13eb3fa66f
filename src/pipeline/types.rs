//! Shared types for the message processing pipeline.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ChannelError, LlmError, RetrievalError};

// ── Inbound message ─────────────────────────────────────────────────

/// Unified inbound chat message.
///
/// Channel adapters convert their native format into this struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Unique ID (channel-native or generated UUID).
    pub id: String,
    /// Source channel: "telegram", "test", etc.
    pub channel: String,
    /// Chat the message arrived in.
    pub chat_id: i64,
    /// Channel-native message ID, used for forwarding and threading replies.
    pub message_id: i64,
    /// Sender's user ID.
    pub sender_id: i64,
    /// Human-readable sender name (if available).
    pub sender_name: Option<String>,
    /// Message body.
    pub text: String,
    /// When the message was received.
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    /// Key under which this sender's transcript is kept.
    pub fn conversation_id(&self) -> String {
        format!("{}:{}", self.channel, self.sender_id)
    }

    /// Bot command name without the slash and any `@botname` suffix.
    pub fn command(&self) -> Option<&str> {
        let first = self.text.trim_start().split_whitespace().next()?;
        let name = first.strip_prefix('/')?;
        let name = name.split('@').next().unwrap_or(name);
        (!name.is_empty()).then_some(name)
    }
}

/// Who said a line in a conversation transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Assistant,
}

impl Speaker {
    pub fn label(&self) -> &'static str {
        match self {
            Self::User => "User",
            Self::Assistant => "Assistant",
        }
    }
}

/// Result of the language pre-filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageVerdict {
    pub is_english: bool,
    #[serde(default)]
    pub detected_language: Option<String>,
}

impl LanguageVerdict {
    pub fn english() -> Self {
        Self {
            is_english: true,
            detected_language: None,
        }
    }
}

// ── Collaborators ───────────────────────────────────────────────────

/// Sends text back to the chat a message came from.
#[async_trait]
pub trait ReplySender: Send + Sync {
    /// Reply to `original` in its chat.
    async fn send_reply(&self, original: &InboundMessage, text: &str) -> Result<(), ChannelError>;

    /// Show a "typing" indicator while a slow answer is prepared.
    async fn send_typing(&self, _original: &InboundMessage) -> Result<(), ChannelError> {
        Ok(())
    }
}

/// Forwards a message to another chat.
#[async_trait]
pub trait MessageForwarder: Send + Sync {
    /// Returns `false` when the forward did not happen.
    async fn forward(&self, message_id: i64, source_chat_id: i64, destination_chat_id: &str)
    -> bool;
}

/// Per-conversation transcript store.
#[async_trait]
pub trait ConversationMemory: Send + Sync {
    /// The transcript rendered as `User: ...` / `Assistant: ...` lines.
    /// Empty when there is no history.
    async fn history_as_text(&self, conversation_id: &str) -> String;

    async fn add_message(&self, conversation_id: &str, speaker: Speaker, text: &str);

    async fn clear(&self, conversation_id: &str);
}

/// Knowledge-base lookup.
#[async_trait]
pub trait ContextRetriever: Send + Sync {
    /// Context relevant to `query`, or `None` when nothing relevant exists.
    async fn retrieve_context(&self, query: &str) -> Result<Option<String>, RetrievalError>;
}

/// Turns an assembled prompt into the final answer text.
#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, LlmError>;
}

/// Classifies the language of a message.
#[async_trait]
pub trait LanguageGate: Send + Sync {
    async fn check(&self, text: &str) -> Result<LanguageVerdict, LlmError>;
}

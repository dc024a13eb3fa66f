//! Bounded in-memory conversation transcripts.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::pipeline::types::{ConversationMemory, Speaker};

/// One line of a transcript.
#[derive(Debug, Clone)]
pub struct TranscriptEntry {
    pub speaker: Speaker,
    pub text: String,
    pub at: DateTime<Utc>,
}

/// Keeps the last `max_messages` lines of each conversation.
///
/// Nothing is persisted; a restart starts every conversation fresh.
#[derive(Debug)]
pub struct InMemoryConversationMemory {
    conversations: RwLock<HashMap<String, VecDeque<TranscriptEntry>>>,
    max_messages: usize,
}

impl InMemoryConversationMemory {
    pub fn new(max_messages: usize) -> Self {
        Self {
            conversations: RwLock::new(HashMap::new()),
            max_messages,
        }
    }

    /// Copy of a conversation's transcript, oldest first.
    pub async fn entries(&self, conversation_id: &str) -> Vec<TranscriptEntry> {
        self.conversations
            .read()
            .await
            .get(conversation_id)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ConversationMemory for InMemoryConversationMemory {
    async fn history_as_text(&self, conversation_id: &str) -> String {
        let conversations = self.conversations.read().await;
        let Some(entries) = conversations.get(conversation_id) else {
            return String::new();
        };
        entries
            .iter()
            .map(|e| format!("{}: {}", e.speaker.label(), e.text))
            .collect::<Vec<_>>()
            .join("\n")
    }

    async fn add_message(&self, conversation_id: &str, speaker: Speaker, text: &str) {
        if self.max_messages == 0 {
            return;
        }
        let mut conversations = self.conversations.write().await;
        let entries = conversations.entry(conversation_id.to_string()).or_default();
        entries.push_back(TranscriptEntry {
            speaker,
            text: text.to_string(),
            at: Utc::now(),
        });
        while entries.len() > self.max_messages {
            entries.pop_front();
        }
    }

    async fn clear(&self, conversation_id: &str) {
        self.conversations.write().await.remove(conversation_id);
    }
}

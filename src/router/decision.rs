//! The resolver's output: one decision per inbound message.

use serde::{Deserialize, Serialize};

use crate::error::DecisionParseError;

// ── Action ──────────────────────────────────────────────────────────

/// What to do with a message.
///
/// `Unknown` holds an action string that no variant recognises. It only
/// arises from externally produced decisions and is dispatched as a
/// protocol violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RouterAction {
    Reply,
    Forward,
    Drop,
    DefaultReply,
    Unknown(String),
}

impl RouterAction {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Reply => "reply",
            Self::Forward => "forward",
            Self::Drop => "drop",
            Self::DefaultReply => "default_reply",
            Self::Unknown(_) => "unknown",
        }
    }
}

impl From<String> for RouterAction {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "reply" => Self::Reply,
            "forward" => Self::Forward,
            "drop" => Self::Drop,
            "default_reply" | "defaultreply" => Self::DefaultReply,
            _ => Self::Unknown(value),
        }
    }
}

impl From<RouterAction> for String {
    fn from(action: RouterAction) -> Self {
        match action {
            RouterAction::Unknown(raw) => raw,
            known => known.label().to_string(),
        }
    }
}

// ── Params ──────────────────────────────────────────────────────────

/// Parameters carried by a decision. Which fields are meaningful depends on
/// the action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt_key: Option<String>,
    /// Prompts of every matched rule, in evaluation order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub behavioral_prompts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_chat_id: Option<String>,
    /// The matched terminal rule's instruction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
}

// ── Decision ────────────────────────────────────────────────────────

/// A resolved routing decision. Created fresh per message, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterDecision {
    pub action: RouterAction,
    /// `None` when no terminal rule matched and the default path was taken.
    #[serde(default)]
    pub matched_rule_id: Option<String>,
    /// Every matched behavioral rule, in evaluation order.
    #[serde(default)]
    pub behavioral_rule_ids: Vec<String>,
    #[serde(default)]
    pub params: DecisionParams,
}

impl RouterDecision {
    pub fn new(action: RouterAction) -> Self {
        Self {
            action,
            matched_rule_id: None,
            behavioral_rule_ids: Vec::new(),
            params: DecisionParams::default(),
        }
    }

    /// True when the default path was taken.
    pub fn is_default(&self) -> bool {
        self.matched_rule_id.is_none()
    }

    /// Read a decision produced outside the resolver, e.g. by a model.
    ///
    /// Accepts bare JSON or JSON inside a markdown code fence. Blank string
    /// fields are treated as absent.
    pub fn from_llm_output(raw: &str) -> Result<Self, DecisionParseError> {
        if raw.trim().is_empty() {
            return Err(DecisionParseError::Empty);
        }
        let mut decision: Self = serde_json::from_str(&extract_json_object(raw))?;
        decision.params.normalize();
        if decision
            .matched_rule_id
            .as_deref()
            .is_some_and(|id| id.trim().is_empty())
        {
            decision.matched_rule_id = None;
        }
        Ok(decision)
    }
}

impl DecisionParams {
    fn normalize(&mut self) {
        for field in [
            &mut self.response_text,
            &mut self.system_prompt_key,
            &mut self.destination_chat_id,
            &mut self.instruction,
        ] {
            if field.as_deref().is_some_and(|s| s.trim().is_empty()) {
                *field = None;
            }
        }
        self.behavioral_prompts.retain(|p| !p.trim().is_empty());
    }
}

/// Extract a JSON object from model output (handles markdown wrapping).
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}

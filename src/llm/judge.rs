//! Free-text condition judgment backed by a language model.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::MatchError;
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::rules::{FreeTextCondition, MatchJudge};

/// Deterministic-ish: the answer should not vary between runs.
const JUDGE_TEMPERATURE: f32 = 0.0;

/// A yes/no answer needs very few tokens.
const JUDGE_MAX_TOKENS: u32 = 8;

const JUDGE_SYSTEM_PROMPT: &str = "\
You decide whether a chat message matches a routing condition.
Read the conversation history for context, but judge the latest message.
Answer with exactly one word: yes or no.";

/// Asks the model one strict yes/no question per free-text condition.
pub struct LlmMatchJudge {
    llm: Arc<dyn LlmProvider>,
}

impl LlmMatchJudge {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }
}

fn build_judge_prompt(condition: &FreeTextCondition, message: &str, history: &str) -> String {
    let history = if history.trim().is_empty() {
        "No history available."
    } else {
        history
    };
    format!(
        "<history>\n{history}\n</history>\n\n\
         Condition: {}\n\n\
         Latest message: {message}\n\n\
         Does the latest message match the condition?",
        condition.description
    )
}

/// Read a yes/no verdict from free-form model output.
fn parse_verdict(output: &str) -> Option<bool> {
    let word: String = output
        .trim()
        .chars()
        .take_while(|c| c.is_alphabetic())
        .collect::<String>()
        .to_lowercase();
    match word.as_str() {
        "yes" | "true" => Some(true),
        "no" | "false" => Some(false),
        _ => None,
    }
}

#[async_trait]
impl MatchJudge for LlmMatchJudge {
    async fn matches(
        &self,
        condition: &FreeTextCondition,
        message: &str,
        history: &str,
    ) -> Result<bool, MatchError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(JUDGE_SYSTEM_PROMPT),
            ChatMessage::user(build_judge_prompt(condition, message, history)),
        ])
        .with_temperature(JUDGE_TEMPERATURE)
        .with_max_tokens(JUDGE_MAX_TOKENS);

        let response = self
            .llm
            .complete(request)
            .await
            .map_err(|e| MatchError::JudgeFailed(e.to_string()))?;

        let verdict = parse_verdict(&response.content).ok_or_else(|| {
            MatchError::JudgeFailed(format!("unreadable verdict: '{}'", response.content.trim()))
        })?;
        debug!(condition = %condition.description, verdict, "Match judge verdict");
        Ok(verdict)
    }
}

//! English-only language gate backed by a language model.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::LlmError;
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::pipeline::types::{LanguageGate, LanguageVerdict};

const LANGUAGE_SYSTEM_PROMPT: &str = r#"You are a language-detection service.
You receive one short user message and decide whether its predominant language is English.

Rules:
1. If at least 80% of the alphabetic words are English, the message is English.
2. Otherwise name the single language with the largest share.
3. If the top two languages are within 10% of each other and one is English, choose English.
4. Mentions of a language by name ("in Russian") do not count as that language.

Return only one JSON object, with no markdown and no commentary:
{"is_english": true, "detected_language": null}
or
{"is_english": false, "detected_language": "<English name of the language>"}"#;

pub struct LlmLanguageGate {
    llm: Arc<dyn LlmProvider>,
}

impl LlmLanguageGate {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl LanguageGate for LlmLanguageGate {
    async fn check(&self, text: &str) -> Result<LanguageVerdict, LlmError> {
        if text.trim().is_empty() {
            return Ok(LanguageVerdict::english());
        }

        let request = CompletionRequest::new(vec![
            ChatMessage::system(LANGUAGE_SYSTEM_PROMPT),
            ChatMessage::user(text),
        ])
        .with_temperature(0.0)
        .with_max_tokens(64);

        let response = self.llm.complete(request).await?;
        parse_verdict(&response.content).map_err(|e| LlmError::InvalidResponse {
            provider: self.llm.model_name().to_string(),
            reason: format!("language verdict: {e}"),
        })
    }
}

fn parse_verdict(output: &str) -> Result<LanguageVerdict, serde_json::Error> {
    let trimmed = output.trim();
    let json = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if end > start => &trimmed[start..=end],
        _ => trimmed,
    };
    let mut verdict: LanguageVerdict = serde_json::from_str(json)?;
    if verdict
        .detected_language
        .as_deref()
        .is_some_and(|l| l.trim().is_empty())
    {
        verdict.detected_language = None;
    }
    Ok(verdict)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::provider::CompletionResponse;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubLlm {
        reply: &'static str,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmProvider for StubLlm {
        fn model_name(&self) -> &str {
            "stub"
        }

        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(CompletionResponse {
                content: self.reply.to_string(),
            })
        }
    }

    fn gate(reply: &'static str) -> (Arc<StubLlm>, LlmLanguageGate) {
        let llm = Arc::new(StubLlm {
            reply,
            calls: AtomicUsize::new(0),
        });
        (llm.clone(), LlmLanguageGate::new(llm))
    }

    #[tokio::test]
    async fn blank_input_passes_without_a_call() {
        let (llm, gate) = gate("garbage");
        assert_eq!(gate.check("   ").await.unwrap(), LanguageVerdict::english());
        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn non_english_verdict() {
        let (_, gate) = gate(r#"```json
{"is_english": false, "detected_language": "Spanish"}
```"#);
        let verdict = gate.check("Hola, ¿cómo estás?").await.unwrap();
        assert!(!verdict.is_english);
        assert_eq!(verdict.detected_language.as_deref(), Some("Spanish"));
    }

    #[tokio::test]
    async fn malformed_verdict_is_an_error() {
        let (_, gate) = gate("English, probably");
        assert!(matches!(
            gate.check("hello").await,
            Err(LlmError::InvalidResponse { .. })
        ));
    }
}

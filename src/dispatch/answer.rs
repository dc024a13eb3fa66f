//! Answer assembly for generation-based replies.
//!
//! Merges the rule instruction, behavioral prompts, conversation history,
//! retrieved context and the user's message into one prompt, then hands it
//! to the [`AnswerGenerator`]. Missing history or context degrades to a
//! placeholder; only generation failure is an error.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::DispatchError;
use crate::pipeline::types::{AnswerGenerator, ContextRetriever, ConversationMemory, InboundMessage};
use crate::prompts::{DEFAULT_PROMPT_KEY, PromptLibrary};
use crate::router::RouterDecision;

const NO_HISTORY: &str = "No history available.";
const NO_CONTEXT: &str = "No additional context provided.";

/// Everything that goes into one generation prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerRequest {
    pub system_prompt: String,
    /// Rule instruction first, then behavioral prompts in evaluation order.
    pub instructions: Vec<String>,
    pub history: Option<String>,
    pub context: Option<String>,
    pub question: String,
}

impl AnswerRequest {
    /// Render the prompt handed to the generator.
    pub fn render(&self) -> String {
        let mut prompt = String::with_capacity(self.system_prompt.len() + self.question.len() + 256);
        prompt.push_str(self.system_prompt.trim_end());
        prompt.push_str("\n\n");

        if !self.instructions.is_empty() {
            prompt.push_str("### Additional Instructions:\n");
            for instruction in &self.instructions {
                prompt.push_str("- ");
                prompt.push_str(instruction);
                prompt.push('\n');
            }
            prompt.push('\n');
        }

        prompt.push_str("### Conversation History:\n");
        prompt.push_str(self.history.as_deref().unwrap_or(NO_HISTORY));
        prompt.push_str("\n\n### Provided Context from Knowledge Base:\n");
        prompt.push_str(self.context.as_deref().unwrap_or(NO_CONTEXT));
        prompt.push_str("\n\n### User's Question:\n");
        prompt.push_str(&self.question);
        prompt.push('\n');
        prompt
    }
}

/// Builds prompts and runs the generator with bounded timeouts.
pub struct AnswerAssembler {
    prompts: Arc<PromptLibrary>,
    generator: Arc<dyn AnswerGenerator>,
    retriever: Option<Arc<dyn ContextRetriever>>,
    memory: Option<Arc<dyn ConversationMemory>>,
    retrieval_timeout: Duration,
    generation_timeout: Duration,
}

impl AnswerAssembler {
    pub fn new(prompts: Arc<PromptLibrary>, generator: Arc<dyn AnswerGenerator>) -> Self {
        Self {
            prompts,
            generator,
            retriever: None,
            memory: None,
            retrieval_timeout: Duration::from_secs(10),
            generation_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_retriever(mut self, retriever: Arc<dyn ContextRetriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn ConversationMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_timeouts(mut self, retrieval: Duration, generation: Duration) -> Self {
        self.retrieval_timeout = retrieval;
        self.generation_timeout = generation;
        self
    }

    /// Gather the pieces of the prompt for one message.
    pub async fn assemble(&self, message: &InboundMessage, decision: &RouterDecision) -> AnswerRequest {
        let key = decision
            .params
            .system_prompt_key
            .as_deref()
            .unwrap_or(DEFAULT_PROMPT_KEY);

        let instructions = decision
            .params
            .instruction
            .iter()
            .chain(decision.params.behavioral_prompts.iter())
            .cloned()
            .collect();

        let history = match &self.memory {
            Some(memory) => Some(memory.history_as_text(&message.conversation_id()).await)
                .filter(|h| !h.trim().is_empty()),
            None => None,
        };

        AnswerRequest {
            system_prompt: self.prompts.get(key).to_string(),
            instructions,
            history,
            context: self.retrieve(&message.text).await,
            question: message.text.clone(),
        }
    }

    /// Assemble a prompt and generate the answer text.
    pub async fn answer(
        &self,
        message: &InboundMessage,
        decision: &RouterDecision,
    ) -> Result<String, DispatchError> {
        let request = self.assemble(message, decision).await;
        let prompt = request.render();
        debug!(id = %message.id, prompt = %prompt, "Assembled answer prompt");

        let answer = tokio::time::timeout(self.generation_timeout, self.generator.generate(&prompt))
            .await
            .map_err(|_| DispatchError::Timeout {
                operation: "answer generation",
                timeout: self.generation_timeout,
            })??;

        info!(
            target: "interaction",
            conversation = %message.conversation_id(),
            matched_rule = decision.matched_rule_id.as_deref().unwrap_or("-"),
            action = decision.action.label(),
            has_context = request.context.is_some(),
            question = %message.text,
            answer = %answer,
            "Generated answer"
        );
        Ok(answer)
    }

    async fn retrieve(&self, query: &str) -> Option<String> {
        let retriever = self.retriever.as_ref()?;
        match tokio::time::timeout(self.retrieval_timeout, retriever.retrieve_context(query)).await {
            Ok(Ok(context)) => context.filter(|c| !c.trim().is_empty()),
            Ok(Err(e)) => {
                warn!(error = %e, "Context retrieval failed; answering without context");
                None
            }
            Err(_) => {
                warn!(timeout = ?self.retrieval_timeout, "Context retrieval timed out; answering without context");
                None
            }
        }
    }
}

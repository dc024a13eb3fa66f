//! Executes a resolved decision.
//!
//! Every decision ends in exactly one outcome. Failures are never retried
//! and never shown raw: each becomes one fixed apology.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::dispatch::answer::AnswerAssembler;
use crate::error::DispatchError;
use crate::pipeline::types::{
    ConversationMemory, InboundMessage, MessageForwarder, ReplySender, Speaker,
};
use crate::router::{RouterAction, RouterDecision};

/// User-visible apologies, one per failure mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Apology {
    ForwardFailed,
    MissingDestination,
    MissingReplyInfo,
    UnknownAction,
    GenerationFailed,
}

impl Apology {
    pub fn text(&self) -> &'static str {
        match self {
            Self::ForwardFailed => "Sorry, I could not forward your message at this time.",
            Self::MissingDestination => {
                "Sorry, I was asked to forward your message, but the destination is unclear."
            }
            Self::MissingReplyInfo => {
                "Sorry, I was asked to reply, but I don't have the required information."
            }
            Self::UnknownAction => {
                "Sorry, I received an unknown instruction from the routing system."
            }
            Self::GenerationFailed => {
                "Sorry, I encountered an error while generating a detailed response."
            }
        }
    }
}

/// What a dispatch did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Dropped,
    Forwarded { destination: String },
    Replied { text: String, generated: bool },
    Apologized(Apology),
}

impl DispatchOutcome {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Dropped => "dropped",
            Self::Forwarded { .. } => "forwarded",
            Self::Replied { .. } => "replied",
            Self::Apologized(_) => "apologized",
        }
    }
}

pub struct ActionDispatcher {
    sender: Arc<dyn ReplySender>,
    forwarder: Arc<dyn MessageForwarder>,
    answers: AnswerAssembler,
    memory: Option<Arc<dyn ConversationMemory>>,
    forward_timeout: Duration,
}

impl ActionDispatcher {
    pub fn new(
        sender: Arc<dyn ReplySender>,
        forwarder: Arc<dyn MessageForwarder>,
        answers: AnswerAssembler,
    ) -> Self {
        Self {
            sender,
            forwarder,
            answers,
            memory: None,
            forward_timeout: Duration::from_secs(15),
        }
    }

    pub fn with_forward_timeout(mut self, timeout: Duration) -> Self {
        self.forward_timeout = timeout;
        self
    }

    /// Record every reply sent in this conversation memory.
    pub fn with_memory(mut self, memory: Arc<dyn ConversationMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Carry out `decision` for `message`.
    pub async fn dispatch(&self, message: &InboundMessage, decision: &RouterDecision) -> DispatchOutcome {
        let rule = decision.matched_rule_id.as_deref().unwrap_or("-");

        match &decision.action {
            RouterAction::Drop => {
                info!(id = %message.id, matched_rule = rule, "Dropping message");
                DispatchOutcome::Dropped
            }
            RouterAction::Forward => self.forward(message, decision).await,
            RouterAction::Reply | RouterAction::DefaultReply => self.reply(message, decision).await,
            RouterAction::Unknown(raw) => {
                error!(
                    id = %message.id,
                    matched_rule = rule,
                    action = %raw,
                    "Protocol violation: unknown action in decision"
                );
                self.apologize(message, Apology::UnknownAction).await
            }
        }
    }

    async fn forward(&self, message: &InboundMessage, decision: &RouterDecision) -> DispatchOutcome {
        let rule = decision.matched_rule_id.as_deref().unwrap_or("-");
        let Some(destination) = decision
            .params
            .destination_chat_id
            .as_deref()
            .filter(|d| !d.trim().is_empty())
        else {
            error!(id = %message.id, matched_rule = rule, "Forward decision has no destination");
            return self.apologize(message, Apology::MissingDestination).await;
        };

        match self.try_forward(message, destination).await {
            Ok(()) => {
                info!(id = %message.id, matched_rule = rule, destination, "Message forwarded");
                DispatchOutcome::Forwarded {
                    destination: destination.to_string(),
                }
            }
            Err(e) => {
                warn!(id = %message.id, matched_rule = rule, error = %e, "Forward failed");
                self.apologize(message, Apology::ForwardFailed).await
            }
        }
    }

    async fn try_forward(&self, message: &InboundMessage, destination: &str) -> Result<(), DispatchError> {
        let forwarded = tokio::time::timeout(
            self.forward_timeout,
            self.forwarder
                .forward(message.message_id, message.chat_id, destination),
        )
        .await
        .map_err(|_| DispatchError::Timeout {
            operation: "forward",
            timeout: self.forward_timeout,
        })?;

        if forwarded {
            Ok(())
        } else {
            Err(DispatchError::Forward {
                destination: destination.to_string(),
            })
        }
    }

    async fn reply(&self, message: &InboundMessage, decision: &RouterDecision) -> DispatchOutcome {
        let params = &decision.params;
        let rule = decision.matched_rule_id.as_deref().unwrap_or("-");

        if let Some(text) = params.response_text.as_deref().filter(|t| !t.trim().is_empty()) {
            info!(id = %message.id, matched_rule = rule, "Replying with fixed text");
            self.send(message, text).await;
            return DispatchOutcome::Replied {
                text: text.to_string(),
                generated: false,
            };
        }

        let can_generate = params.system_prompt_key.is_some()
            || !params.behavioral_prompts.is_empty()
            || decision.action == RouterAction::DefaultReply;
        if !can_generate {
            error!(id = %message.id, matched_rule = rule, "Reply decision has neither text nor prompt key");
            return self.apologize(message, Apology::MissingReplyInfo).await;
        }

        if let Err(e) = self.sender.send_typing(message).await {
            debug!(id = %message.id, error = %e, "Typing indicator failed");
        }

        match self.answers.answer(message, decision).await {
            Ok(text) => {
                self.send(message, &text).await;
                DispatchOutcome::Replied {
                    text,
                    generated: true,
                }
            }
            Err(e) => {
                error!(id = %message.id, matched_rule = rule, error = %e, "Answer generation failed");
                self.apologize(message, Apology::GenerationFailed).await
            }
        }
    }

    async fn apologize(&self, message: &InboundMessage, apology: Apology) -> DispatchOutcome {
        self.send(message, apology.text()).await;
        DispatchOutcome::Apologized(apology)
    }

    /// Send and record a reply. A send failure is logged; there is nobody
    /// left to tell.
    async fn send(&self, message: &InboundMessage, text: &str) {
        if let Err(e) = self.try_send(message, text).await {
            error!(id = %message.id, error = %e, "Failed to send reply");
        }
    }

    async fn try_send(&self, message: &InboundMessage, text: &str) -> Result<(), DispatchError> {
        self.sender.send_reply(message, text).await?;
        if let Some(memory) = &self.memory {
            memory
                .add_message(&message.conversation_id(), Speaker::Assistant, text)
                .await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ChannelError, LlmError};
    use crate::memory::InMemoryConversationMemory;
    use crate::pipeline::types::AnswerGenerator;
    use crate::prompts::PromptLibrary;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<String>>,
        typing: Mutex<usize>,
    }

    #[async_trait]
    impl ReplySender for RecordingSender {
        async fn send_reply(&self, _original: &InboundMessage, text: &str) -> Result<(), ChannelError> {
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }

        async fn send_typing(&self, _original: &InboundMessage) -> Result<(), ChannelError> {
            *self.typing.lock().unwrap() += 1;
            Ok(())
        }
    }

    struct StubForwarder {
        succeed: bool,
        calls: Mutex<Vec<(i64, i64, String)>>,
    }

    #[async_trait]
    impl MessageForwarder for StubForwarder {
        async fn forward(&self, message_id: i64, source_chat_id: i64, destination_chat_id: &str) -> bool {
            self.calls
                .lock()
                .unwrap()
                .push((message_id, source_chat_id, destination_chat_id.to_string()));
            self.succeed
        }
    }

    /// Forwarder whose call never completes.
    struct StalledForwarder;

    #[async_trait]
    impl MessageForwarder for StalledForwarder {
        async fn forward(&self, _message_id: i64, _source_chat_id: i64, _destination_chat_id: &str) -> bool {
            futures::future::pending().await
        }
    }

    /// Sender that always fails.
    struct BrokenSender;

    #[async_trait]
    impl ReplySender for BrokenSender {
        async fn send_reply(&self, _original: &InboundMessage, _text: &str) -> Result<(), ChannelError> {
            Err(ChannelError::SendFailed {
                name: "test".into(),
                reason: "chat not found".into(),
            })
        }
    }

    /// Generator that outlives any reasonable timeout.
    struct SlowGenerator;

    #[async_trait]
    impl AnswerGenerator for SlowGenerator {
        async fn generate(&self, _prompt: &str) -> Result<String, LlmError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("too late".into())
        }
    }

    struct StubGenerator {
        fail: bool,
    }

    #[async_trait]
    impl AnswerGenerator for StubGenerator {
        async fn generate(&self, _prompt: &str) -> Result<String, LlmError> {
            if self.fail {
                Err(LlmError::RequestFailed {
                    provider: "stub".into(),
                    reason: "internal: quota exceeded".into(),
                })
            } else {
                Ok("Here is a detailed answer.".into())
            }
        }
    }

    struct Harness {
        sender: Arc<RecordingSender>,
        forwarder: Arc<StubForwarder>,
        memory: Arc<InMemoryConversationMemory>,
        dispatcher: ActionDispatcher,
    }

    fn harness(forward_ok: bool, generation_fails: bool) -> Harness {
        let sender = Arc::new(RecordingSender::default());
        let forwarder = Arc::new(StubForwarder {
            succeed: forward_ok,
            calls: Mutex::new(Vec::new()),
        });
        let memory = Arc::new(InMemoryConversationMemory::new(10));
        let answers = AnswerAssembler::new(
            Arc::new(PromptLibrary::default()),
            Arc::new(StubGenerator {
                fail: generation_fails,
            }),
        );
        let dispatcher = ActionDispatcher::new(sender.clone(), forwarder.clone(), answers)
            .with_memory(memory.clone());
        Harness {
            sender,
            forwarder,
            memory,
            dispatcher,
        }
    }

    fn message() -> InboundMessage {
        InboundMessage {
            id: "m1".into(),
            channel: "test".into(),
            chat_id: 500,
            message_id: 77,
            sender_id: 42,
            sender_name: None,
            text: "I need help".into(),
            received_at: Utc::now(),
        }
    }

    fn decision(action: RouterAction) -> RouterDecision {
        let mut decision = RouterDecision::new(action);
        decision.matched_rule_id = Some("R".into());
        decision
    }

    #[tokio::test]
    async fn drop_has_no_effect() {
        let h = harness(true, false);
        let outcome = h.dispatcher.dispatch(&message(), &decision(RouterAction::Drop)).await;
        assert_eq!(outcome, DispatchOutcome::Dropped);
        assert!(h.sender.sent.lock().unwrap().is_empty());
        assert!(h.forwarder.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn forward_passes_message_refs() {
        let h = harness(true, false);
        let mut d = decision(RouterAction::Forward);
        d.params.destination_chat_id = Some("@support".into());

        let outcome = h.dispatcher.dispatch(&message(), &d).await;
        assert_eq!(
            outcome,
            DispatchOutcome::Forwarded {
                destination: "@support".into()
            }
        );
        assert_eq!(
            h.forwarder.calls.lock().unwrap().as_slice(),
            &[(77, 500, "@support".to_string())]
        );
        assert!(h.sender.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn forward_failure_apologizes_once() {
        let h = harness(false, false);
        let mut d = decision(RouterAction::Forward);
        d.params.destination_chat_id = Some("-100123".into());

        let outcome = h.dispatcher.dispatch(&message(), &d).await;
        assert_eq!(outcome, DispatchOutcome::Apologized(Apology::ForwardFailed));
        assert_eq!(h.forwarder.calls.lock().unwrap().len(), 1);
        assert_eq!(
            h.sender.sent.lock().unwrap().as_slice(),
            &[Apology::ForwardFailed.text().to_string()]
        );
    }

    #[tokio::test]
    async fn forward_without_destination_apologizes() {
        let h = harness(true, false);
        let outcome = h.dispatcher.dispatch(&message(), &decision(RouterAction::Forward)).await;
        assert_eq!(outcome, DispatchOutcome::Apologized(Apology::MissingDestination));
        assert!(h.forwarder.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn literal_reply_skips_generation() {
        let h = harness(true, true);
        let mut d = decision(RouterAction::Reply);
        d.params.response_text = Some("Goodbye!".into());
        d.params.system_prompt_key = Some("ignored".into());

        let outcome = h.dispatcher.dispatch(&message(), &d).await;
        assert_eq!(
            outcome,
            DispatchOutcome::Replied {
                text: "Goodbye!".into(),
                generated: false
            }
        );
        assert_eq!(*h.sender.typing.lock().unwrap(), 0);
        assert_eq!(h.memory.history_as_text("test:42").await, "Assistant: Goodbye!");
    }

    #[tokio::test]
    async fn prompt_key_reply_generates() {
        let h = harness(true, false);
        let mut d = decision(RouterAction::Reply);
        d.params.system_prompt_key = Some("support".into());

        let outcome = h.dispatcher.dispatch(&message(), &d).await;
        assert_eq!(
            outcome,
            DispatchOutcome::Replied {
                text: "Here is a detailed answer.".into(),
                generated: true
            }
        );
        assert_eq!(*h.sender.typing.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn generation_failure_hides_error_text() {
        let h = harness(true, true);
        let mut d = decision(RouterAction::DefaultReply);
        d.matched_rule_id = None;
        d.params.system_prompt_key = Some("default_prompt".into());

        let outcome = h.dispatcher.dispatch(&message(), &d).await;
        assert_eq!(outcome, DispatchOutcome::Apologized(Apology::GenerationFailed));

        let sent = h.sender.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert!(!sent[0].contains("quota"));
        assert_eq!(
            h.memory.history_as_text("test:42").await,
            format!("Assistant: {}", Apology::GenerationFailed.text())
        );
    }

    #[tokio::test]
    async fn empty_reply_is_a_protocol_defect() {
        let h = harness(true, false);
        let outcome = h.dispatcher.dispatch(&message(), &decision(RouterAction::Reply)).await;
        assert_eq!(outcome, DispatchOutcome::Apologized(Apology::MissingReplyInfo));
    }

    #[tokio::test]
    async fn unknown_action_apologizes_and_next_message_still_works() {
        let h = harness(true, false);
        let outcome = h
            .dispatcher
            .dispatch(&message(), &decision(RouterAction::Unknown("escalate".into())))
            .await;
        assert_eq!(outcome, DispatchOutcome::Apologized(Apology::UnknownAction));

        let mut d = decision(RouterAction::Reply);
        d.params.response_text = Some("Still here".into());
        let outcome = h.dispatcher.dispatch(&message(), &d).await;
        assert_eq!(outcome.label(), "replied");
    }

    #[tokio::test]
    async fn stalled_forward_times_out_and_apologizes() {
        let sender = Arc::new(RecordingSender::default());
        let answers = AnswerAssembler::new(
            Arc::new(PromptLibrary::default()),
            Arc::new(StubGenerator { fail: false }),
        );
        let dispatcher = ActionDispatcher::new(sender.clone(), Arc::new(StalledForwarder), answers)
            .with_forward_timeout(Duration::from_millis(50));
        let mut d = decision(RouterAction::Forward);
        d.params.destination_chat_id = Some("@x".into());

        let outcome = tokio::time::timeout(Duration::from_secs(3), dispatcher.dispatch(&message(), &d))
            .await
            .expect("dispatch must not hang on a stalled forward");
        assert_eq!(outcome, DispatchOutcome::Apologized(Apology::ForwardFailed));
        assert_eq!(
            sender.sent.lock().unwrap().as_slice(),
            &[Apology::ForwardFailed.text().to_string()]
        );
    }

    #[tokio::test]
    async fn forward_failure_is_reported_as_forward_error() {
        let h = harness(false, false);
        let err = h.dispatcher.try_forward(&message(), "@billing").await.unwrap_err();
        assert!(matches!(err, DispatchError::Forward { ref destination } if destination == "@billing"));
    }

    #[tokio::test]
    async fn slow_generation_sends_one_apology() {
        let sender = Arc::new(RecordingSender::default());
        let forwarder = Arc::new(StubForwarder {
            succeed: true,
            calls: Mutex::new(Vec::new()),
        });
        let answers = AnswerAssembler::new(Arc::new(PromptLibrary::default()), Arc::new(SlowGenerator))
            .with_timeouts(Duration::from_millis(50), Duration::from_millis(50));
        let dispatcher = ActionDispatcher::new(sender.clone(), forwarder, answers);
        let mut d = decision(RouterAction::Reply);
        d.params.system_prompt_key = Some("support".into());

        let outcome = dispatcher.dispatch(&message(), &d).await;
        assert_eq!(outcome, DispatchOutcome::Apologized(Apology::GenerationFailed));
        assert_eq!(
            sender.sent.lock().unwrap().as_slice(),
            &[Apology::GenerationFailed.text().to_string()]
        );
    }

    #[tokio::test]
    async fn send_failure_is_not_recorded() {
        let memory = Arc::new(InMemoryConversationMemory::new(10));
        let forwarder = Arc::new(StubForwarder {
            succeed: true,
            calls: Mutex::new(Vec::new()),
        });
        let answers = AnswerAssembler::new(
            Arc::new(PromptLibrary::default()),
            Arc::new(StubGenerator { fail: false }),
        );
        let dispatcher = ActionDispatcher::new(Arc::new(BrokenSender), forwarder, answers)
            .with_memory(memory.clone());

        let err = dispatcher.try_send(&message(), "Hello").await.unwrap_err();
        assert!(matches!(err, DispatchError::Send(_)));
        assert_eq!(memory.history_as_text("test:42").await, "");
    }
}

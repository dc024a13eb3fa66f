//! Message processor — runs one inbound message through the router.
//!
//! Flow:
//! 1. Bot commands (`/start`, `/help`, `/reload_rules`) → fixed replies
//! 2. Record the message in conversation memory
//! 3. Language gate (optional) → may short-circuit with a rephrase request
//! 4. Decision resolver → one `RouterDecision`
//! 5. Action dispatcher → exactly one outcome

use std::sync::Arc;

use futures::StreamExt;
use tracing::{error, info, warn};

use crate::dispatch::{ActionDispatcher, DispatchOutcome};
use crate::pipeline::types::{
    ConversationMemory, InboundMessage, LanguageGate, ReplySender, Speaker,
};
use crate::router::{DecisionResolver, RouterDecision};

const START_REPLY: &str = "Hello! I am a support bot. How can I help you?";
const HELP_REPLY: &str = "You can ask me any questions, and I will do my best to help you.";
const ADMINS_NOT_CONFIGURED: &str = "Command not configured: the admin list is not defined.";
const NOT_AUTHORIZED: &str = "You do not have permission to run this command.";
const RELOAD_FAILED: &str =
    "Failed to reload rules. Error details have been logged. The previous rules were kept.";
const LANGUAGE_CHECK_FAILED: &str = "Sorry, I had trouble processing the language of your message.";

/// What happened to one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// A bot command was answered.
    Command { name: String },
    /// A command the bot does not know; nothing was sent.
    IgnoredCommand { name: String },
    /// The language gate rejected the message.
    LanguageRejected { language: Option<String> },
    /// The language gate failed; an apology was sent.
    LanguageCheckFailed,
    /// The message was resolved and dispatched.
    Routed {
        decision: RouterDecision,
        outcome: DispatchOutcome,
    },
}

impl ProcessOutcome {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Command { .. } => "command",
            Self::IgnoredCommand { .. } => "ignored_command",
            Self::LanguageRejected { .. } => "language_rejected",
            Self::LanguageCheckFailed => "language_check_failed",
            Self::Routed { outcome, .. } => outcome.label(),
        }
    }
}

/// Message processor — owns the per-message flow.
pub struct MessageProcessor {
    resolver: DecisionResolver,
    dispatcher: ActionDispatcher,
    sender: Arc<dyn ReplySender>,
    memory: Option<Arc<dyn ConversationMemory>>,
    language_gate: Option<Arc<dyn LanguageGate>>,
    admin_user_ids: Vec<i64>,
}

impl MessageProcessor {
    pub fn new(
        resolver: DecisionResolver,
        dispatcher: ActionDispatcher,
        sender: Arc<dyn ReplySender>,
    ) -> Self {
        Self {
            resolver,
            dispatcher,
            sender,
            memory: None,
            language_gate: None,
            admin_user_ids: Vec::new(),
        }
    }

    /// Record inbound messages and command replies, and read history from here.
    pub fn with_memory(mut self, memory: Arc<dyn ConversationMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Reject non-English messages before routing.
    pub fn with_language_gate(mut self, gate: Arc<dyn LanguageGate>) -> Self {
        self.language_gate = Some(gate);
        self
    }

    /// Users allowed to run `/reload_rules`.
    pub fn with_admins(mut self, admin_user_ids: Vec<i64>) -> Self {
        self.admin_user_ids = admin_user_ids;
        self
    }

    /// Process a single inbound message through the full pipeline.
    pub async fn handle_message(&self, message: &InboundMessage) -> ProcessOutcome {
        info!(
            id = %message.id,
            channel = %message.channel,
            sender = message.sender_id,
            "Processing inbound message"
        );

        if let Some(name) = message.command() {
            return self.handle_command(message, name).await;
        }

        let conversation = message.conversation_id();
        if let Some(memory) = &self.memory {
            memory
                .add_message(&conversation, Speaker::User, &message.text)
                .await;
        }

        if let Some(outcome) = self.check_language(message).await {
            return outcome;
        }

        let history = match &self.memory {
            Some(memory) => memory.history_as_text(&conversation).await,
            None => String::new(),
        };

        let decision = self.resolver.resolve(&message.text, &history).await;
        let outcome = self.dispatcher.dispatch(message, &decision).await;

        info!(
            id = %message.id,
            conversation = %conversation,
            action = decision.action.label(),
            matched_rule = decision.matched_rule_id.as_deref().unwrap_or("-"),
            outcome = outcome.label(),
            "Message processed"
        );

        ProcessOutcome::Routed { decision, outcome }
    }

    /// Process a batch of messages concurrently, at most `limit` at a time.
    ///
    /// Outcomes are returned in input order.
    pub async fn process_batch(
        &self,
        messages: Vec<InboundMessage>,
        limit: usize,
    ) -> Vec<ProcessOutcome> {
        let count = messages.len();
        info!(count, "Processing message batch");

        let results = tokio::sync::Mutex::new(Vec::with_capacity(count));
        futures::stream::iter(messages.iter().enumerate())
            .for_each_concurrent(limit.max(1), |(index, message)| {
                let results = &results;
                async move {
                    let outcome = self.handle_message(message).await;
                    results.lock().await.push((index, outcome));
                }
            })
            .await;

        let mut results = results.into_inner();
        results.sort_by_key(|(index, _)| *index);
        info!(total = count, "Batch processing complete");
        results.into_iter().map(|(_, outcome)| outcome).collect()
    }

    // ── Commands ────────────────────────────────────────────────────

    async fn handle_command(&self, message: &InboundMessage, name: &str) -> ProcessOutcome {
        info!(command = name, sender = message.sender_id, "Received command");

        let reply = match name {
            "start" => START_REPLY.to_string(),
            "help" => HELP_REPLY.to_string(),
            "reload_rules" => self.reload_rules(message).await,
            _ => {
                return ProcessOutcome::IgnoredCommand {
                    name: name.to_string(),
                };
            }
        };

        self.reply(message, &reply).await;
        ProcessOutcome::Command {
            name: name.to_string(),
        }
    }

    async fn reload_rules(&self, message: &InboundMessage) -> String {
        if self.admin_user_ids.is_empty() {
            warn!(
                sender = message.sender_id,
                "/reload_rules called but no admin user IDs are configured"
            );
            return ADMINS_NOT_CONFIGURED.to_string();
        }
        if !self.admin_user_ids.contains(&message.sender_id) {
            warn!(sender = message.sender_id, "Unauthorized /reload_rules attempt");
            return NOT_AUTHORIZED.to_string();
        }

        let store = Arc::clone(self.resolver.store());
        let report = match tokio::task::spawn_blocking(move || store.reload()).await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "Rule reload task failed");
                return RELOAD_FAILED.to_string();
            }
        };
        if report.success {
            info!(
                sender = message.sender_id,
                rules = report.rule_count,
                "Rules reloaded by admin"
            );
            format!(
                "Rules reloaded successfully. Now routing with {} rules.",
                report.rule_count
            )
        } else {
            RELOAD_FAILED.to_string()
        }
    }

    // ── Language gate ───────────────────────────────────────────────

    async fn check_language(&self, message: &InboundMessage) -> Option<ProcessOutcome> {
        let gate = self.language_gate.as_ref()?;

        match gate.check(&message.text).await {
            Ok(verdict) if verdict.is_english => None,
            Ok(verdict) => {
                let language = verdict
                    .detected_language
                    .as_deref()
                    .unwrap_or("an unknown language");
                info!(
                    id = %message.id,
                    language,
                    "Message rejected by language gate"
                );
                let reply = format!(
                    "This chat is for English language communication. You texted me in {language}. Please rephrase your question in English."
                );
                self.reply(message, &reply).await;
                Some(ProcessOutcome::LanguageRejected {
                    language: verdict.detected_language,
                })
            }
            Err(e) => {
                error!(id = %message.id, error = %e, "Language validation failed");
                self.reply(message, LANGUAGE_CHECK_FAILED).await;
                Some(ProcessOutcome::LanguageCheckFailed)
            }
        }
    }

    async fn reply(&self, message: &InboundMessage, text: &str) {
        if let Err(e) = self.sender.send_reply(message, text).await {
            error!(id = %message.id, error = %e, "Failed to send reply");
            return;
        }
        if let Some(memory) = &self.memory {
            memory
                .add_message(&message.conversation_id(), Speaker::Assistant, text)
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Utc;

    use crate::dispatch::AnswerAssembler;
    use crate::error::{ChannelError, LlmError};
    use crate::memory::InMemoryConversationMemory;
    use crate::pipeline::types::{AnswerGenerator, LanguageVerdict, MessageForwarder};
    use crate::prompts::PromptLibrary;
    use crate::router::{NoMatchPolicy, RouterAction};
    use crate::rules::{ConditionMatcher, RuleSet, RuleStore};

    const RULES: &str = r#"
rules:
  - rule_id: SPAM
    priority: 1
    conditions:
      - type: keyword_match
        keywords: [casino]
    action: drop
  - rule_id: HOURS
    priority: 10
    conditions:
      - type: keyword_match
        keywords: [hours]
    action: reply
    action_params:
      response_text: "We are open 9 to 5."
"#;

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ReplySender for RecordingSender {
        async fn send_reply(&self, _original: &InboundMessage, text: &str) -> Result<(), ChannelError> {
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    struct NoForwarder;

    #[async_trait]
    impl MessageForwarder for NoForwarder {
        async fn forward(&self, _message_id: i64, _source: i64, _destination: &str) -> bool {
            false
        }
    }

    struct EchoGenerator;

    #[async_trait]
    impl AnswerGenerator for EchoGenerator {
        async fn generate(&self, _prompt: &str) -> Result<String, LlmError> {
            Ok("generated answer".into())
        }
    }

    struct StaticGate(Result<LanguageVerdict, ()>);

    #[async_trait]
    impl LanguageGate for StaticGate {
        async fn check(&self, _text: &str) -> Result<LanguageVerdict, LlmError> {
            self.0.clone().map_err(|_| LlmError::InvalidResponse {
                provider: "stub".into(),
                reason: "boom".into(),
            })
        }
    }

    struct Harness {
        sender: Arc<RecordingSender>,
        memory: Arc<InMemoryConversationMemory>,
        processor: MessageProcessor,
    }

    fn harness(policy: NoMatchPolicy) -> Harness {
        let store = Arc::new(RuleStore::with_rules(
            "unused.yaml",
            RuleSet::from_yaml_str(RULES).unwrap(),
        ));
        harness_with_store(policy, store)
    }

    fn harness_with_store(policy: NoMatchPolicy, store: Arc<RuleStore>) -> Harness {
        let sender = Arc::new(RecordingSender::default());
        let memory = Arc::new(InMemoryConversationMemory::new(10));
        let answers = AnswerAssembler::new(
            Arc::new(PromptLibrary::new(Default::default())),
            Arc::new(EchoGenerator),
        )
        .with_memory(memory.clone());
        let dispatcher = ActionDispatcher::new(sender.clone(), Arc::new(NoForwarder), answers)
            .with_memory(memory.clone());
        let resolver = DecisionResolver::new(store, ConditionMatcher::local_only(), policy);
        let processor = MessageProcessor::new(resolver, dispatcher, sender.clone())
            .with_memory(memory.clone());
        Harness {
            sender,
            memory,
            processor,
        }
    }

    fn message(text: &str, sender_id: i64) -> InboundMessage {
        InboundMessage {
            id: format!("test-{text}"),
            channel: "test".into(),
            chat_id: 500,
            message_id: 1,
            sender_id,
            sender_name: None,
            text: text.into(),
            received_at: Utc::now(),
        }
    }

    fn sent(h: &Harness) -> Vec<String> {
        h.sender.sent.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn start_and_help_are_answered_and_remembered() {
        let h = harness(NoMatchPolicy::Suppress);
        let outcome = h.processor.handle_message(&message("/start", 7)).await;
        assert_eq!(outcome, ProcessOutcome::Command { name: "start".into() });
        h.processor.handle_message(&message("/help@support_bot", 7)).await;

        assert_eq!(sent(&h), vec![START_REPLY, HELP_REPLY]);
        let history = h.memory.history_as_text("test:7").await;
        assert!(history.contains(START_REPLY));
        assert!(!history.contains("User: /start"));
    }

    #[tokio::test]
    async fn unknown_command_is_ignored() {
        let h = harness(NoMatchPolicy::Suppress);
        let outcome = h.processor.handle_message(&message("/casino", 7)).await;
        assert_eq!(outcome.label(), "ignored_command");
        assert!(sent(&h).is_empty());
    }

    #[tokio::test]
    async fn routed_reply_records_both_sides() {
        let h = harness(NoMatchPolicy::Suppress);
        let outcome = h.processor.handle_message(&message("what are your hours?", 7)).await;

        let ProcessOutcome::Routed { decision, outcome } = outcome else {
            panic!("expected routed outcome");
        };
        assert_eq!(decision.matched_rule_id.as_deref(), Some("HOURS"));
        assert_eq!(outcome.label(), "replied");
        assert_eq!(sent(&h), vec!["We are open 9 to 5."]);
        assert_eq!(
            h.memory.history_as_text("test:7").await,
            "User: what are your hours?\nAssistant: We are open 9 to 5."
        );
    }

    #[tokio::test]
    async fn drop_sends_nothing() {
        let h = harness(NoMatchPolicy::Suppress);
        let outcome = h.processor.handle_message(&message("free casino chips", 7)).await;
        assert_eq!(outcome.label(), "dropped");
        assert!(sent(&h).is_empty());
    }

    #[tokio::test]
    async fn no_match_uses_default_reply() {
        let h = harness(NoMatchPolicy::DefaultReply {
            prompt_key: "default_prompt".into(),
        });
        let outcome = h.processor.handle_message(&message("tell me a joke", 7)).await;
        let ProcessOutcome::Routed { decision, .. } = outcome else {
            panic!("expected routed outcome");
        };
        assert_eq!(decision.action, RouterAction::DefaultReply);
        assert_eq!(sent(&h), vec!["generated answer"]);
    }

    #[tokio::test]
    async fn reload_requires_configured_admins() {
        let h = harness(NoMatchPolicy::Suppress);
        h.processor.handle_message(&message("/reload_rules", 7)).await;
        assert_eq!(sent(&h), vec![ADMINS_NOT_CONFIGURED]);
    }

    #[tokio::test]
    async fn reload_rejects_non_admin() {
        let mut h = harness(NoMatchPolicy::Suppress);
        h.processor = h.processor.with_admins(vec![1]);
        h.processor.handle_message(&message("/reload_rules", 7)).await;
        assert_eq!(sent(&h), vec![NOT_AUTHORIZED]);
    }

    #[tokio::test]
    async fn failed_reload_keeps_rules_and_says_so() {
        let mut h = harness(NoMatchPolicy::Suppress);
        h.processor = h.processor.with_admins(vec![7]);
        // The store's source does not exist on disk.
        h.processor.handle_message(&message("/reload_rules", 7)).await;
        assert_eq!(sent(&h), vec![RELOAD_FAILED]);
        assert_eq!(h.processor.resolver.store().snapshot().len(), 2);
    }

    #[tokio::test]
    async fn admin_reload_picks_up_edited_rules() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.yaml");
        std::fs::write(&path, RULES).unwrap();
        let store = Arc::new(RuleStore::open(&path).unwrap());
        let mut h = harness_with_store(NoMatchPolicy::Suppress, store);
        h.processor = h.processor.with_admins(vec![7]);

        let hours_only = RULES.split("  - rule_id: HOURS").nth(1).unwrap();
        std::fs::write(&path, format!("rules:\n  - rule_id: HOURS{hours_only}")).unwrap();
        h.processor.handle_message(&message("/reload_rules", 7)).await;

        assert_eq!(sent(&h), vec!["Rules reloaded successfully. Now routing with 1 rules."]);
        assert_eq!(h.processor.resolver.store().snapshot().len(), 1);
    }

    #[tokio::test]
    async fn language_gate_rejects_non_english() {
        let mut h = harness(NoMatchPolicy::Suppress);
        h.processor = h.processor.with_language_gate(Arc::new(StaticGate(Ok(LanguageVerdict {
            is_english: false,
            detected_language: Some("Spanish".into()),
        }))));
        let outcome = h.processor.handle_message(&message("hola, horario?", 7)).await;
        assert_eq!(
            outcome,
            ProcessOutcome::LanguageRejected {
                language: Some("Spanish".into())
            }
        );
        assert_eq!(
            sent(&h),
            vec![
                "This chat is for English language communication. You texted me in Spanish. Please rephrase your question in English."
            ]
        );
    }

    #[tokio::test]
    async fn language_gate_unknown_language_and_failure() {
        let mut h = harness(NoMatchPolicy::Suppress);
        h.processor = h.processor.with_language_gate(Arc::new(StaticGate(Ok(LanguageVerdict {
            is_english: false,
            detected_language: None,
        }))));
        h.processor.handle_message(&message("???", 7)).await;
        assert!(sent(&h)[0].contains("You texted me in an unknown language."));

        let mut h = harness(NoMatchPolicy::Suppress);
        h.processor = h.processor.with_language_gate(Arc::new(StaticGate(Err(()))));
        let outcome = h.processor.handle_message(&message("hours", 7)).await;
        assert_eq!(outcome, ProcessOutcome::LanguageCheckFailed);
        assert_eq!(sent(&h), vec![LANGUAGE_CHECK_FAILED]);
    }

    #[tokio::test]
    async fn language_gate_passes_english_through() {
        let mut h = harness(NoMatchPolicy::Suppress);
        h.processor = h
            .processor
            .with_language_gate(Arc::new(StaticGate(Ok(LanguageVerdict::english()))));
        let outcome = h.processor.handle_message(&message("opening hours", 7)).await;
        assert_eq!(outcome.label(), "replied");
    }

    #[tokio::test]
    async fn batch_preserves_input_order() {
        let h = harness(NoMatchPolicy::Suppress);
        let batch = vec![
            message("casino", 1),
            message("hours", 2),
            message("/start", 3),
            message("nothing relevant", 4),
        ];
        let outcomes = h.processor.process_batch(batch, 3).await;
        let labels: Vec<_> = outcomes.iter().map(ProcessOutcome::label).collect();
        assert_eq!(labels, vec!["dropped", "replied", "command", "dropped"]);
    }
}

//! Decision resolution: one ordered pass over the active rule set.
//!
//! Behavioral rules that match add their prompts and the pass continues.
//! The first terminal rule that matches fixes the action and ends the pass.
//! With no terminal match the configured [`NoMatchPolicy`] applies.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::router::decision::{DecisionParams, RouterAction, RouterDecision};
use crate::rules::{ConditionMatcher, Rule, RuleAction, RuleStore};

/// What to do when no terminal rule matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoMatchPolicy {
    /// Do nothing: resolve to `drop`.
    Suppress,
    /// Generate an answer with the named system prompt.
    DefaultReply { prompt_key: String },
}

impl NoMatchPolicy {
    pub fn from_flag(reply_on_no_match: bool, prompt_key: impl Into<String>) -> Self {
        if reply_on_no_match {
            Self::DefaultReply {
                prompt_key: prompt_key.into(),
            }
        } else {
            Self::Suppress
        }
    }
}

/// Resolves messages into [`RouterDecision`]s against the store's active set.
pub struct DecisionResolver {
    store: Arc<RuleStore>,
    matcher: ConditionMatcher,
    no_match: NoMatchPolicy,
}

impl DecisionResolver {
    pub fn new(store: Arc<RuleStore>, matcher: ConditionMatcher, no_match: NoMatchPolicy) -> Self {
        Self {
            store,
            matcher,
            no_match,
        }
    }

    pub fn store(&self) -> &Arc<RuleStore> {
        &self.store
    }

    /// Resolve one message. Never fails: a rule whose matching fails is
    /// logged and treated as not matched.
    ///
    /// The pass runs against one snapshot of the rule set, so a concurrent
    /// reload never shows it a mix of old and new rules.
    pub async fn resolve(&self, message: &str, history: &str) -> RouterDecision {
        let rules = self.store.snapshot();

        let mut behavioral_prompts = Vec::new();
        let mut behavioral_rule_ids = Vec::new();
        let mut terminal: Option<&Rule> = None;

        for rule in rules.rules() {
            match self.matcher.rule_matches(rule, message, history).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!(rule_id = %rule.id, error = %e, "Rule matching failed; treating as no match");
                    continue;
                }
            }

            behavioral_prompts.extend(rule.behavioral_prompts.iter().cloned());
            if rule.is_behavioral {
                debug!(rule_id = %rule.id, "Behavioral rule matched");
                behavioral_rule_ids.push(rule.id.clone());
                continue;
            }

            terminal = Some(rule);
            break;
        }

        let mut decision = match terminal {
            Some(rule) => decision_for_rule(rule, behavioral_prompts),
            None => self.default_decision(behavioral_prompts),
        };
        decision.behavioral_rule_ids = behavioral_rule_ids;

        info!(
            action = decision.action.label(),
            matched_rule = decision.matched_rule_id.as_deref().unwrap_or("-"),
            behavioral_rules = ?decision.behavioral_rule_ids,
            "Router decision"
        );
        decision
    }

    fn default_decision(&self, behavioral_prompts: Vec<String>) -> RouterDecision {
        match &self.no_match {
            NoMatchPolicy::Suppress => {
                let mut decision = RouterDecision::new(RouterAction::Drop);
                decision.params.behavioral_prompts = behavioral_prompts;
                decision
            }
            NoMatchPolicy::DefaultReply { prompt_key } => {
                let mut decision = RouterDecision::new(RouterAction::DefaultReply);
                decision.params = DecisionParams {
                    system_prompt_key: Some(prompt_key.clone()),
                    behavioral_prompts,
                    ..DecisionParams::default()
                };
                decision
            }
        }
    }
}

fn decision_for_rule(rule: &Rule, behavioral_prompts: Vec<String>) -> RouterDecision {
    let mut params = DecisionParams {
        behavioral_prompts,
        instruction: rule.instruction.clone(),
        ..DecisionParams::default()
    };

    let action = match &rule.action {
        Some(RuleAction::Reply(reply)) => {
            params.response_text = reply.response_text.clone();
            params.system_prompt_key = reply.system_prompt_key.clone();
            RouterAction::Reply
        }
        Some(RuleAction::Forward(forward)) => {
            params.destination_chat_id = Some(forward.destination_chat_id.clone());
            RouterAction::Forward
        }
        Some(RuleAction::Drop) => RouterAction::Drop,
        // Rejected at load time; dispatched as a protocol violation.
        None => RouterAction::Unknown(String::new()),
    };

    RouterDecision {
        action,
        matched_rule_id: Some(rule.id.clone()),
        behavioral_rule_ids: Vec::new(),
        params,
    }
}

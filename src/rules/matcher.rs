//! Condition matchers.
//!
//! Keyword and regex conditions are matched locally and are pure. Free-text
//! conditions are delegated to an injected [`MatchJudge`], which may be
//! slow or fail. Its call carries a bounded timeout.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::MatchError;
use crate::rules::model::{
    Condition, FreeTextCondition, KeywordCondition, KeywordMode, RegexCondition, Rule,
};

/// Pluggable judgment for free-text conditions (e.g. backed by an LLM).
#[async_trait]
pub trait MatchJudge: Send + Sync {
    /// Does `message`, read in the light of `history`, satisfy `condition`?
    async fn matches(
        &self,
        condition: &FreeTextCondition,
        message: &str,
        history: &str,
    ) -> Result<bool, MatchError>;
}

/// Keyword match. Substring semantics, case folded unless `case_sensitive`.
pub fn keyword_matches(condition: &KeywordCondition, message: &str) -> bool {
    if message.trim().is_empty() {
        return false;
    }

    let haystack = if condition.case_sensitive {
        message.to_string()
    } else {
        message.to_lowercase()
    };
    let contains = |keyword: &String| {
        if condition.case_sensitive {
            haystack.contains(keyword.as_str())
        } else {
            haystack.contains(&keyword.to_lowercase())
        }
    };

    match condition.mode {
        KeywordMode::Any => condition.keywords.iter().any(contains),
        KeywordMode::All => condition.keywords.iter().all(contains),
    }
}

/// Regex match: at least one match anywhere in the message.
pub fn regex_matches(condition: &RegexCondition, message: &str) -> bool {
    !message.trim().is_empty() && condition.regex().is_match(message)
}

/// Evaluates a rule's conditions against one message.
#[derive(Clone)]
pub struct ConditionMatcher {
    judge: Option<Arc<dyn MatchJudge>>,
    judge_timeout: Duration,
}

impl ConditionMatcher {
    pub fn new(judge: Option<Arc<dyn MatchJudge>>, judge_timeout: Duration) -> Self {
        Self {
            judge,
            judge_timeout,
        }
    }

    /// Matcher with only local (keyword and regex) judgment.
    pub fn local_only() -> Self {
        Self::new(None, Duration::from_secs(15))
    }

    /// True iff every condition of `rule` matches.
    ///
    /// Local conditions are checked first so the judge is only consulted
    /// when the rule can still match. A blank message matches nothing.
    pub async fn rule_matches(
        &self,
        rule: &Rule,
        message: &str,
        history: &str,
    ) -> Result<bool, MatchError> {
        if message.trim().is_empty() {
            return Ok(false);
        }

        let mut free_text = Vec::new();
        for condition in &rule.conditions {
            let matched = match condition {
                Condition::Keyword(c) => keyword_matches(c, message),
                Condition::Regex(c) => regex_matches(c, message),
                Condition::FreeText(c) => {
                    free_text.push(c);
                    continue;
                }
            };
            if !matched {
                debug!(rule_id = %rule.id, condition = condition.label(), "Condition not matched");
                return Ok(false);
            }
        }

        for condition in free_text {
            if !self.judge(condition, message, history).await? {
                debug!(rule_id = %rule.id, condition = "description_match", "Condition not matched");
                return Ok(false);
            }
        }

        Ok(true)
    }

    async fn judge(
        &self,
        condition: &FreeTextCondition,
        message: &str,
        history: &str,
    ) -> Result<bool, MatchError> {
        let judge = self.judge.as_ref().ok_or(MatchError::JudgeUnavailable)?;
        tokio::time::timeout(
            self.judge_timeout,
            judge.matches(condition, message, history),
        )
        .await
        .map_err(|_| MatchError::Timeout(self.judge_timeout))?
    }
}

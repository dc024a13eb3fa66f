//! Routing rules: the typed rule model, the hot-reloadable store, and the
//! per-condition matchers.

pub mod matcher;
pub mod model;
pub mod store;

pub use matcher::{ConditionMatcher, MatchJudge, keyword_matches, regex_matches};
pub use model::{
    Condition, ForwardParams, FreeTextCondition, KeywordCondition, KeywordMode, RegexCondition,
    ReplyParams, Rule, RuleAction,
};
pub use store::{ReloadReport, RuleSet, RuleStore};

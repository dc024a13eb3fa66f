//! Rule and condition types, plus parsing of the declarative rules document.
//!
//! The document is parsed in two steps. First it is read as loose YAML so
//! that every entry's `rule_id` can be recovered for error messages. Then
//! each entry is deserialized into a raw record and validated into a typed
//! [`Rule`]. Any invalid entry fails the whole document.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::error::LoadError;

// ── Conditions ──────────────────────────────────────────────────────

/// How a keyword condition combines its keywords.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeywordMode {
    /// At least one keyword must be present.
    #[default]
    Any,
    /// Every keyword must be present.
    All,
}

/// Match on the presence of keywords in the message text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeywordCondition {
    pub keywords: Vec<String>,
    pub mode: KeywordMode,
    pub case_sensitive: bool,
}

/// Match on a regular expression, compiled once at load time.
#[derive(Debug, Clone)]
pub struct RegexCondition {
    pattern: String,
    case_sensitive: bool,
    regex: Regex,
}

impl RegexCondition {
    /// Compile a regex condition. Case-insensitive unless `case_sensitive`.
    pub fn new(pattern: &str, case_sensitive: bool) -> Result<Self, regex::Error> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(!case_sensitive)
            .build()?;
        Ok(Self {
            pattern: pattern.to_string(),
            case_sensitive,
            regex,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    pub fn regex(&self) -> &Regex {
        &self.regex
    }
}

/// Match judged by an external [`MatchJudge`](crate::rules::MatchJudge)
/// against a free-text description of the intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeTextCondition {
    pub description: String,
}

/// A single predicate of a rule. A rule matches iff all its conditions do.
#[derive(Debug, Clone)]
pub enum Condition {
    Keyword(KeywordCondition),
    Regex(RegexCondition),
    FreeText(FreeTextCondition),
}

impl Condition {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Keyword(_) => "keyword_match",
            Self::Regex(_) => "regex_match",
            Self::FreeText(_) => "description_match",
        }
    }
}

// ── Actions ─────────────────────────────────────────────────────────

/// Parameters of a `reply` rule. Behavioral prompts live on the [`Rule`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt_key: Option<String>,
}

/// Parameters of a `forward` rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardParams {
    pub destination_chat_id: String,
}

/// The terminal action a rule carries, with its action-specific parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleAction {
    Reply(ReplyParams),
    Forward(ForwardParams),
    Drop,
}

impl RuleAction {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Reply(_) => "reply",
            Self::Forward(_) => "forward",
            Self::Drop => "drop",
        }
    }
}

// ── Rule ────────────────────────────────────────────────────────────

/// One unit of routing policy. Immutable once loaded into a rule set.
#[derive(Debug, Clone)]
pub struct Rule {
    /// Unique within a rule set.
    pub id: String,
    /// Lower value is evaluated earlier.
    pub priority: i64,
    /// Behavioral rules only contribute prompts and never end a pass.
    pub is_behavioral: bool,
    /// Non-empty. All must match.
    pub conditions: Vec<Condition>,
    /// `None` only for behavioral rules declared without an action.
    pub action: Option<RuleAction>,
    /// Side-instructions contributed whenever this rule matches.
    pub behavioral_prompts: Vec<String>,
    /// Surfaced to answer generation when this is the matched terminal rule.
    pub instruction: Option<String>,
}

impl Rule {
    pub fn is_terminal(&self) -> bool {
        !self.is_behavioral
    }
}

// ── Raw document ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRule {
    #[serde(alias = "id")]
    rule_id: String,
    priority: i64,
    #[serde(default)]
    is_behavioral: bool,
    #[serde(default)]
    conditions: Vec<RawCondition>,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    action_params: Option<RawActionParams>,
    #[serde(default)]
    instruction: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
enum RawCondition {
    KeywordMatch {
        keywords: Vec<String>,
        #[serde(default)]
        match_type: KeywordMode,
        #[serde(default)]
        case_sensitive: bool,
    },
    RegexMatch {
        pattern: String,
        #[serde(default)]
        case_sensitive: bool,
    },
    #[serde(alias = "free_text_match")]
    DescriptionMatch { description: String },
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawActionParams {
    #[serde(default)]
    response_text: Option<String>,
    #[serde(default)]
    system_prompt_key: Option<String>,
    #[serde(default)]
    behavioral_prompts: Option<Vec<String>>,
    #[serde(default)]
    destination_chat_id: Option<String>,
}

/// Parse a rules document into validated rules, in declaration order.
///
/// An empty document, a document without a `rules` key, or an empty list
/// all yield zero rules.
pub(crate) fn parse_rules_document(
    text: &str,
    source_name: &str,
) -> Result<Vec<Rule>, LoadError> {
    let document: serde_yaml::Value =
        serde_yaml::from_str(text).map_err(|e| LoadError::Parse {
            source_name: source_name.to_string(),
            reason: e.to_string(),
        })?;

    let entries = match document {
        serde_yaml::Value::Null => return Ok(Vec::new()),
        serde_yaml::Value::Mapping(ref map) => match map.get("rules") {
            None | Some(serde_yaml::Value::Null) => return Ok(Vec::new()),
            Some(serde_yaml::Value::Sequence(entries)) => entries.clone(),
            Some(_) => {
                return Err(LoadError::Parse {
                    source_name: source_name.to_string(),
                    reason: "`rules` must be a list".to_string(),
                });
            }
        },
        _ => {
            return Err(LoadError::Parse {
                source_name: source_name.to_string(),
                reason: "top level must be a mapping with a `rules` list".to_string(),
            });
        }
    };

    entries
        .into_iter()
        .enumerate()
        .map(|(index, entry)| parse_rule_entry(index, entry))
        .collect()
}

fn parse_rule_entry(index: usize, entry: serde_yaml::Value) -> Result<Rule, LoadError> {
    let declared_id = entry_rule_id(&entry);
    let raw: RawRule = serde_yaml::from_value(entry).map_err(|e| LoadError::Validation {
        rule_id: declared_id.clone(),
        reason: match declared_id {
            Some(_) => e.to_string(),
            None => format!("rule #{}: {e}", index + 1),
        },
    })?;
    raw.into_rule()
}

/// Best-effort ID of a not-yet-validated rule entry.
fn entry_rule_id(entry: &serde_yaml::Value) -> Option<String> {
    let value = entry.get("rule_id").or_else(|| entry.get("id"))?;
    match value {
        serde_yaml::Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

impl RawRule {
    fn into_rule(self) -> Result<Rule, LoadError> {
        let id = self.rule_id.trim().to_string();
        if id.is_empty() {
            return Err(LoadError::Validation {
                rule_id: None,
                reason: "rule_id must not be empty".to_string(),
            });
        }

        if self.conditions.is_empty() {
            return Err(LoadError::invalid_rule(id, "at least one condition is required"));
        }
        let conditions = self
            .conditions
            .into_iter()
            .map(|c| c.into_condition(&id))
            .collect::<Result<Vec<_>, _>>()?;

        let params = self.action_params.unwrap_or_default();
        let behavioral_prompts: Vec<String> = params
            .behavioral_prompts
            .unwrap_or_default()
            .into_iter()
            .filter(|p| !p.trim().is_empty())
            .collect();
        let response_text = non_blank(params.response_text);
        let system_prompt_key = non_blank(params.system_prompt_key);
        let destination = params.destination_chat_id;

        let action = match self.action.as_deref() {
            Some("reply") => {
                if destination.is_some() {
                    return Err(LoadError::invalid_rule(
                        id,
                        "destination_chat_id is not allowed on a reply action",
                    ));
                }
                if response_text.is_none()
                    && system_prompt_key.is_none()
                    && behavioral_prompts.is_empty()
                {
                    return Err(LoadError::invalid_rule(
                        id,
                        "a reply action needs at least one of response_text, \
                         system_prompt_key or behavioral_prompts",
                    ));
                }
                Some(RuleAction::Reply(ReplyParams {
                    response_text,
                    system_prompt_key,
                }))
            }
            Some("forward") => {
                if response_text.is_some() || system_prompt_key.is_some() {
                    return Err(LoadError::invalid_rule(
                        id,
                        "response_text and system_prompt_key are not allowed on a forward action",
                    ));
                }
                let Some(destination_chat_id) = non_blank(destination) else {
                    return Err(LoadError::invalid_rule(
                        id,
                        "a forward action needs a non-empty destination_chat_id",
                    ));
                };
                Some(RuleAction::Forward(ForwardParams {
                    destination_chat_id: destination_chat_id.trim().to_string(),
                }))
            }
            Some("drop") => {
                if response_text.is_some() || system_prompt_key.is_some() || destination.is_some()
                {
                    return Err(LoadError::invalid_rule(
                        id,
                        "a drop action only accepts behavioral_prompts",
                    ));
                }
                Some(RuleAction::Drop)
            }
            Some(other) => {
                return Err(LoadError::invalid_rule(
                    id,
                    format!("unknown action '{other}' (expected reply, forward or drop)"),
                ));
            }
            None if self.is_behavioral => {
                if response_text.is_some() || system_prompt_key.is_some() || destination.is_some()
                {
                    return Err(LoadError::invalid_rule(
                        id,
                        "a behavioral rule without an action only accepts behavioral_prompts",
                    ));
                }
                None
            }
            None => {
                return Err(LoadError::invalid_rule(
                    id,
                    "a terminal rule must declare an action",
                ));
            }
        };

        Ok(Rule {
            id,
            priority: self.priority,
            is_behavioral: self.is_behavioral,
            conditions,
            action,
            behavioral_prompts,
            instruction: non_blank(self.instruction),
        })
    }
}

impl RawCondition {
    fn into_condition(self, rule_id: &str) -> Result<Condition, LoadError> {
        match self {
            Self::KeywordMatch {
                keywords,
                match_type,
                case_sensitive,
            } => {
                if keywords.is_empty() {
                    return Err(LoadError::invalid_rule(
                        rule_id,
                        "keyword_match needs at least one keyword",
                    ));
                }
                if keywords.iter().any(|k| k.trim().is_empty()) {
                    return Err(LoadError::invalid_rule(
                        rule_id,
                        "keyword_match keywords must not be empty",
                    ));
                }
                Ok(Condition::Keyword(KeywordCondition {
                    keywords,
                    mode: match_type,
                    case_sensitive,
                }))
            }
            Self::RegexMatch {
                pattern,
                case_sensitive,
            } => RegexCondition::new(&pattern, case_sensitive)
                .map(Condition::Regex)
                .map_err(|e| {
                    LoadError::invalid_rule(rule_id, format!("invalid regex '{pattern}': {e}"))
                }),
            Self::DescriptionMatch { description } => {
                if description.trim().is_empty() {
                    return Err(LoadError::invalid_rule(
                        rule_id,
                        "description_match needs a non-empty description",
                    ));
                }
                Ok(Condition::FreeText(FreeTextCondition { description }))
            }
        }
    }
}

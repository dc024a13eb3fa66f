//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::prompts::DEFAULT_PROMPT_KEY;
use crate::router::NoMatchPolicy;

/// Router configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Telegram bot token.
    pub telegram_token: SecretString,
    /// API key for the model provider.
    pub llm_api_key: SecretString,
    /// Model used for judging, answering and language checks.
    pub model: String,
    /// Declarative rules document.
    pub rules_path: PathBuf,
    /// System-prompt templates.
    pub prompts_path: PathBuf,
    /// Generate a default reply when no terminal rule matches.
    pub reply_on_no_match: bool,
    /// Template used for default replies.
    pub default_prompt_key: String,
    /// Users allowed to run `/reload_rules`.
    pub admin_user_ids: Vec<i64>,
    /// Messages kept per conversation.
    pub history_length: usize,
    pub judge_timeout: Duration,
    pub retrieval_timeout: Duration,
    pub generation_timeout: Duration,
    pub forward_timeout: Duration,
    /// Reject non-English messages before routing.
    pub language_gate: bool,
    /// Messages resolved at the same time.
    pub max_concurrent: usize,
    /// Directory for a daily rolling log file, in addition to stderr.
    pub log_dir: Option<PathBuf>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            telegram_token: SecretString::from(String::new()),
            llm_api_key: SecretString::from(String::new()),
            model: "gpt-4o-mini".to_string(),
            rules_path: PathBuf::from("rules.yaml"),
            prompts_path: PathBuf::from("prompts.yaml"),
            reply_on_no_match: true,
            default_prompt_key: DEFAULT_PROMPT_KEY.to_string(),
            admin_user_ids: Vec::new(),
            history_length: 10,
            judge_timeout: Duration::from_secs(15),
            retrieval_timeout: Duration::from_secs(10),
            generation_timeout: Duration::from_secs(60),
            forward_timeout: Duration::from_secs(15),
            language_gate: false,
            max_concurrent: 16,
            log_dir: None,
        }
    }
}

impl RouterConfig {
    /// Read configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`, which returns a variable's value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &str| get(key).ok_or_else(|| ConfigError::MissingEnvVar(key.into()));
        let defaults = Self::default();

        let model = get("ROUTER_MODEL").unwrap_or(defaults.model);
        let api_key_var = if model.starts_with("claude") {
            "ANTHROPIC_API_KEY"
        } else {
            "OPENAI_API_KEY"
        };

        Ok(Self {
            telegram_token: SecretString::from(required("TELEGRAM_BOT_TOKEN")?),
            llm_api_key: SecretString::from(required(api_key_var)?),
            model,
            rules_path: get("ROUTER_RULES_PATH").map_or(defaults.rules_path, PathBuf::from),
            prompts_path: get("ROUTER_PROMPTS_PATH").map_or(defaults.prompts_path, PathBuf::from),
            reply_on_no_match: parse_bool("REPLY_ON_NO_MATCH", get("REPLY_ON_NO_MATCH"))?
                .unwrap_or(defaults.reply_on_no_match),
            default_prompt_key: get("ROUTER_DEFAULT_PROMPT_KEY")
                .unwrap_or(defaults.default_prompt_key),
            admin_user_ids: parse_id_list("ADMIN_USER_IDS", get("ADMIN_USER_IDS"))?,
            history_length: parse("ROUTER_HISTORY_LENGTH", get("ROUTER_HISTORY_LENGTH"))?
                .unwrap_or(defaults.history_length),
            judge_timeout: parse_secs("ROUTER_JUDGE_TIMEOUT_SECS", get("ROUTER_JUDGE_TIMEOUT_SECS"))?
                .unwrap_or(defaults.judge_timeout),
            retrieval_timeout: parse_secs(
                "ROUTER_RETRIEVAL_TIMEOUT_SECS",
                get("ROUTER_RETRIEVAL_TIMEOUT_SECS"),
            )?
            .unwrap_or(defaults.retrieval_timeout),
            generation_timeout: parse_secs(
                "ROUTER_GENERATION_TIMEOUT_SECS",
                get("ROUTER_GENERATION_TIMEOUT_SECS"),
            )?
            .unwrap_or(defaults.generation_timeout),
            forward_timeout: parse_secs("ROUTER_FORWARD_TIMEOUT_SECS", get("ROUTER_FORWARD_TIMEOUT_SECS"))?
                .unwrap_or(defaults.forward_timeout),
            language_gate: parse_bool("ROUTER_LANGUAGE_GATE", get("ROUTER_LANGUAGE_GATE"))?
                .unwrap_or(defaults.language_gate),
            max_concurrent: parse("ROUTER_MAX_CONCURRENT", get("ROUTER_MAX_CONCURRENT"))?
                .unwrap_or(defaults.max_concurrent)
                .max(1),
            log_dir: get("ROUTER_LOG_DIR").map(PathBuf::from),
        })
    }

    pub fn no_match_policy(&self) -> NoMatchPolicy {
        NoMatchPolicy::from_flag(self.reply_on_no_match, self.default_prompt_key.clone())
    }
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

fn parse<T: FromStr>(key: &str, value: Option<String>) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .map(|v| v.trim().parse::<T>().map_err(|e| invalid(key, e.to_string())))
        .transpose()
}

fn parse_secs(key: &str, value: Option<String>) -> Result<Option<Duration>, ConfigError> {
    match parse::<u64>(key, value)? {
        Some(0) => Err(invalid(key, "timeout must be at least one second")),
        secs => Ok(secs.map(Duration::from_secs)),
    }
}

fn parse_bool(key: &str, value: Option<String>) -> Result<Option<bool>, ConfigError> {
    value
        .map(|v| match v.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            other => Err(invalid(key, format!("expected a boolean, got '{other}'"))),
        })
        .transpose()
}

fn parse_id_list(key: &str, value: Option<String>) -> Result<Vec<i64>, ConfigError> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<i64>()
                .map_err(|_| invalid(key, format!("'{s}' is not a numeric user ID")))
        })
        .collect()
}

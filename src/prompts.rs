//! Named system-prompt templates.
//!
//! Loaded once from a YAML map of `key: prompt text`. Lookups never fail:
//! an unknown key falls back to the `default_prompt` entry, and then to a
//! built-in one-liner.

use std::collections::HashMap;
use std::path::Path;

use tracing::{error, info, warn};

/// Key of the fallback template.
pub const DEFAULT_PROMPT_KEY: &str = "default_prompt";

/// Used when the library has no `default_prompt` either.
pub const BUILTIN_PROMPT: &str = "You are a helpful assistant.";

#[derive(Debug, Clone, Default)]
pub struct PromptLibrary {
    prompts: HashMap<String, String>,
}

impl PromptLibrary {
    pub fn new(prompts: HashMap<String, String>) -> Self {
        if !prompts.is_empty() && !prompts.contains_key(DEFAULT_PROMPT_KEY) {
            warn!(
                key = DEFAULT_PROMPT_KEY,
                "Prompt library has no default prompt; unknown keys use the built-in prompt"
            );
        }
        Self { prompts }
    }

    /// Load templates from a YAML file.
    ///
    /// A missing or malformed file gives an empty library; the failure is
    /// logged, not returned.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                error!(path = %path.display(), error = %e, "Cannot read prompts file; no prompts loaded");
                return Self::default();
            }
        };

        match Self::from_yaml_str(&text) {
            Ok(library) => {
                info!(path = %path.display(), prompts = library.len(), "Prompts loaded");
                library
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "Prompts file is not a valid map; no prompts loaded");
                Self::default()
            }
        }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, serde_yaml::Error> {
        let prompts: Option<HashMap<String, String>> = serde_yaml::from_str(text)?;
        Ok(Self::new(prompts.unwrap_or_default()))
    }

    /// Template for `key`, falling back to the default.
    pub fn get(&self, key: &str) -> &str {
        if let Some(prompt) = self.prompts.get(key) {
            return prompt;
        }
        warn!(key, "Prompt key not found; falling back to default prompt");
        self.prompts
            .get(DEFAULT_PROMPT_KEY)
            .map(String::as_str)
            .unwrap_or(BUILTIN_PROMPT)
    }

    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }
}

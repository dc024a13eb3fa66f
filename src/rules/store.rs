//! Rule set loading and the hot-reloadable active set.
//!
//! A [`RuleSet`] is an immutable, priority-sorted snapshot. The
//! [`RuleStore`] holds the active snapshot behind an `Arc` that is swapped
//! wholesale on a successful reload. Readers clone the `Arc` and never hold
//! the lock while evaluating rules.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, error, info, warn};

use crate::error::LoadError;
use crate::rules::model::{Rule, parse_rules_document};

/// An immutable, validated collection of rules sorted by ascending priority.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
    index: HashMap<String, usize>,
}

impl RuleSet {
    /// Build a rule set from rules in declaration order.
    ///
    /// Rejects duplicate IDs, then stable-sorts by priority so ties keep
    /// their declaration order.
    pub fn from_rules(mut rules: Vec<Rule>) -> Result<Self, LoadError> {
        let mut seen = HashSet::with_capacity(rules.len());
        for rule in &rules {
            if !seen.insert(rule.id.as_str()) {
                return Err(LoadError::invalid_rule(
                    rule.id.clone(),
                    "duplicate rule_id",
                ));
            }
        }

        rules.sort_by_key(|r| r.priority);

        let index = rules
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id.clone(), i))
            .collect();

        Ok(Self { rules, index })
    }

    /// Parse and validate a rules document held in memory.
    pub fn from_yaml_str(text: &str) -> Result<Self, LoadError> {
        Self::from_rules(parse_rules_document(text, "<inline>")?)
    }

    /// Read, parse and validate a rules document from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading rules");

        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LoadError::NotFound {
                    path: path.to_path_buf(),
                });
            }
            Err(e) => return Err(LoadError::Io(e)),
        };

        let rules = parse_rules_document(&text, &path.display().to_string())?;
        if rules.is_empty() {
            warn!(path = %path.display(), "Rules file has no rules; loading empty rule set");
        }
        Self::from_rules(rules)
    }

    /// Rules in evaluation order.
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn get(&self, id: &str) -> Option<&Rule> {
        self.index.get(id).map(|&i| &self.rules[i])
    }

    /// Rule IDs in evaluation order.
    pub fn ids(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Outcome of an operator-triggered reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReloadReport {
    pub success: bool,
    /// Number of rules active after the call, whether or not it succeeded.
    pub rule_count: usize,
}

/// Holds the active rule set for a declarative source on disk.
pub struct RuleStore {
    source: PathBuf,
    active: RwLock<Arc<RuleSet>>,
}

impl RuleStore {
    /// Load the initial rule set. Fails if the source cannot be loaded.
    pub fn open(source: impl Into<PathBuf>) -> Result<Self, LoadError> {
        let source = source.into();
        let set = RuleSet::load(&source)?;
        info!(
            path = %source.display(),
            rules = set.len(),
            "Rule store initialized"
        );
        Ok(Self {
            source,
            active: RwLock::new(Arc::new(set)),
        })
    }

    /// Wrap an already-built rule set. `reload` re-reads `source`.
    pub fn with_rules(source: impl Into<PathBuf>, set: RuleSet) -> Self {
        Self {
            source: source.into(),
            active: RwLock::new(Arc::new(set)),
        }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    /// The current rule set as one consistent snapshot.
    pub fn snapshot(&self) -> Arc<RuleSet> {
        // The guarded value is an immutable Arc, so a poisoned lock still
        // holds a complete set.
        Arc::clone(&self.active.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Active rules, priority ascending.
    pub fn get_rules(&self) -> Vec<Rule> {
        self.snapshot().rules().to_vec()
    }

    /// Look up a rule by ID in the active set.
    pub fn get_rule_by_id(&self, id: &str) -> Option<Rule> {
        self.snapshot().get(id).cloned()
    }

    /// Reload from the source and swap it in atomically.
    ///
    /// On any load failure the active set is left exactly as it was.
    pub fn reload(&self) -> ReloadReport {
        info!(path = %self.source.display(), "Reloading rules");

        match RuleSet::load(&self.source) {
            Ok(set) => {
                let rule_count = set.len();
                *self.active.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(set);
                info!(rules = rule_count, "Rules reloaded successfully");
                ReloadReport {
                    success: true,
                    rule_count,
                }
            }
            Err(e) => {
                let rule_count = self.snapshot().len();
                error!(
                    error = %e,
                    rule_id = e.rule_id().unwrap_or("-"),
                    kept_rules = rule_count,
                    "Failed to reload rules; previous rule set remains active"
                );
                ReloadReport {
                    success: false,
                    rule_count,
                }
            }
        }
    }
}

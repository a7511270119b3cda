//! Replication Filter
//!
//! Decides which databases and tables participate in replication and how
//! database names are renamed on the replica. Readers take an `Arc`
//! snapshot and evaluate it without holding any lock; writers build a new
//! rule set and swap it in under the write lock.

mod rules;

pub use rules::{FilterDescription, FilterRules, Rule, RuleSet, WildPattern};

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Rule lists as written in configuration files and admin requests
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FilterConfig {
    pub do_db: Vec<String>,
    pub ignore_db: Vec<String>,
    pub do_table: Vec<String>,
    pub ignore_table: Vec<String>,
    pub wild_do_table: Vec<String>,
    pub wild_ignore_table: Vec<String>,
    /// `from->to` pairs
    pub rewrite_db: Vec<String>,
}

impl FilterConfig {
    fn entries(&self) -> [(RuleSet, &Vec<String>); 7] {
        [
            (RuleSet::DoDb, &self.do_db),
            (RuleSet::IgnoreDb, &self.ignore_db),
            (RuleSet::DoTable, &self.do_table),
            (RuleSet::IgnoreTable, &self.ignore_table),
            (RuleSet::WildDoTable, &self.wild_do_table),
            (RuleSet::WildIgnoreTable, &self.wild_ignore_table),
            (RuleSet::RewriteDb, &self.rewrite_db),
        ]
    }

    /// Compile into a rule snapshot, rejecting the first invalid rule
    pub fn compile(&self) -> Result<FilterRules> {
        let mut rules = FilterRules::new();
        for (set, values) in self.entries() {
            for value in values {
                rules.add(Rule::parse(set, value)?)?;
            }
        }
        Ok(rules)
    }
}

/// Shared handle to a link's current filter snapshot
#[derive(Debug, Clone, Default)]
pub struct ReplicationFilter {
    current: Arc<RwLock<Arc<FilterRules>>>,
}

impl ReplicationFilter {
    pub fn new(rules: FilterRules) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(rules))),
        }
    }

    pub fn from_config(config: &FilterConfig) -> Result<Self> {
        Ok(Self::new(config.compile()?))
    }

    /// Current immutable rule snapshot
    pub fn snapshot(&self) -> Arc<FilterRules> {
        Arc::clone(&self.current.read())
    }

    /// Add one rule, publishing a new snapshot
    pub fn add_rule(&self, rule: Rule) -> Result<()> {
        let mut guard = self.current.write();
        let mut next = FilterRules::clone(&guard);
        next.add(rule)?;
        *guard = Arc::new(next);
        Ok(())
    }

    /// Replace one rule collection with `values`
    ///
    /// All values are validated before anything is published.
    pub fn replace_rule_set(&self, set: RuleSet, values: &[String]) -> Result<()> {
        let parsed = values
            .iter()
            .map(|v| Rule::parse(set, v))
            .collect::<Result<Vec<_>>>()?;

        let mut guard = self.current.write();
        let mut next = FilterRules::clone(&guard);
        next.clear(set);
        for rule in parsed {
            next.add(rule)?;
        }
        *guard = Arc::new(next);
        tracing::info!("Replaced {:?} filter rules ({} entries)", set, values.len());
        Ok(())
    }

    /// Replace every collection at once
    pub fn replace_all(&self, config: &FilterConfig) -> Result<()> {
        let next = config.compile()?;
        *self.current.write() = Arc::new(next);
        Ok(())
    }

    pub fn should_replicate(&self, db: &str, table: Option<&str>) -> bool {
        self.snapshot().should_replicate(db, table)
    }
}

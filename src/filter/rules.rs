//! Filter Rule Sets
//!
//! Immutable rule collections evaluated per event. A [`FilterRules`] value
//! is never mutated once published; edits build a new value.

use std::collections::HashSet;

use regex::Regex;
use serde::Serialize;

use crate::error::{Error, Result};

/// Rule collection selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleSet {
    DoDb,
    IgnoreDb,
    DoTable,
    IgnoreTable,
    WildDoTable,
    WildIgnoreTable,
    RewriteDb,
}

/// A single rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rule {
    DoDb(String),
    IgnoreDb(String),
    /// `db.table`
    DoTable(String),
    /// `db.table`
    IgnoreTable(String),
    /// `db_glob.table_glob`
    WildDoTable(String),
    /// `db_glob.table_glob`
    WildIgnoreTable(String),
    RewriteDb { from: String, to: String },
}

impl Rule {
    /// Parse the textual form used by configuration files and the admin API
    ///
    /// Rewrite rules are written `from->to`.
    pub fn parse(set: RuleSet, value: &str) -> Result<Self> {
        let value = value.trim();
        Ok(match set {
            RuleSet::DoDb => Rule::DoDb(value.to_string()),
            RuleSet::IgnoreDb => Rule::IgnoreDb(value.to_string()),
            RuleSet::DoTable => Rule::DoTable(value.to_string()),
            RuleSet::IgnoreTable => Rule::IgnoreTable(value.to_string()),
            RuleSet::WildDoTable => Rule::WildDoTable(value.to_string()),
            RuleSet::WildIgnoreTable => Rule::WildIgnoreTable(value.to_string()),
            RuleSet::RewriteDb => {
                let (from, to) = value.split_once("->").ok_or_else(|| {
                    Error::Filter(format!("rewrite rule '{}' must look like from->to", value))
                })?;
                Rule::RewriteDb {
                    from: from.trim().to_string(),
                    to: to.trim().to_string(),
                }
            }
        })
    }

    pub fn set(&self) -> RuleSet {
        match self {
            Rule::DoDb(_) => RuleSet::DoDb,
            Rule::IgnoreDb(_) => RuleSet::IgnoreDb,
            Rule::DoTable(_) => RuleSet::DoTable,
            Rule::IgnoreTable(_) => RuleSet::IgnoreTable,
            Rule::WildDoTable(_) => RuleSet::WildDoTable,
            Rule::WildIgnoreTable(_) => RuleSet::WildIgnoreTable,
            Rule::RewriteDb { .. } => RuleSet::RewriteDb,
        }
    }
}

/// Compiled `db.table` shell-glob pattern
#[derive(Debug, Clone)]
pub struct WildPattern {
    pattern: String,
    db: Regex,
    table: Regex,
}

impl WildPattern {
    pub fn new(pattern: &str) -> Result<Self> {
        let (db, table) = split_qualified(pattern)?;
        Ok(Self {
            pattern: pattern.to_string(),
            db: glob_to_regex(db)?,
            table: glob_to_regex(table)?,
        })
    }

    pub fn matches(&self, db: &str, table: &str) -> bool {
        self.db.is_match(db) && self.table.is_match(table)
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }
}

/// Translate `*` and `?` into an anchored regex
fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let escaped = regex::escape(pattern);
    let translated = escaped.replace(r"\*", ".*").replace(r"\?", ".");
    Regex::new(&format!("^{}$", translated))
        .map_err(|e| Error::Filter(format!("invalid pattern '{}': {}", pattern, e)))
}

fn split_qualified(name: &str) -> Result<(&str, &str)> {
    match name.split_once('.') {
        Some((db, table)) if !db.is_empty() && !table.is_empty() => Ok((db, table)),
        _ => Err(Error::Filter(format!(
            "'{}' is not a qualified db.table name",
            name
        ))),
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Filter("empty database name".into()));
    }
    Ok(())
}

/// Snapshot of every rule collection
#[derive(Debug, Clone, Default)]
pub struct FilterRules {
    do_db: HashSet<String>,
    ignore_db: HashSet<String>,
    do_table: HashSet<String>,
    ignore_table: HashSet<String>,
    wild_do_table: Vec<WildPattern>,
    wild_ignore_table: Vec<WildPattern>,
    rewrite_db: Vec<(String, String)>,
}

impl FilterRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule after validating it
    pub fn add(&mut self, rule: Rule) -> Result<()> {
        match rule {
            Rule::DoDb(db) => {
                check_name(&db)?;
                self.do_db.insert(db);
            }
            Rule::IgnoreDb(db) => {
                check_name(&db)?;
                self.ignore_db.insert(db);
            }
            Rule::DoTable(name) => {
                split_qualified(&name)?;
                self.do_table.insert(name);
            }
            Rule::IgnoreTable(name) => {
                split_qualified(&name)?;
                self.ignore_table.insert(name);
            }
            Rule::WildDoTable(pattern) => self.wild_do_table.push(WildPattern::new(&pattern)?),
            Rule::WildIgnoreTable(pattern) => {
                self.wild_ignore_table.push(WildPattern::new(&pattern)?)
            }
            Rule::RewriteDb { from, to } => {
                check_name(&from)?;
                check_name(&to)?;
                self.rewrite_db.push((from, to));
            }
        }
        Ok(())
    }

    /// Empty one collection
    pub fn clear(&mut self, set: RuleSet) {
        match set {
            RuleSet::DoDb => self.do_db.clear(),
            RuleSet::IgnoreDb => self.ignore_db.clear(),
            RuleSet::DoTable => self.do_table.clear(),
            RuleSet::IgnoreTable => self.ignore_table.clear(),
            RuleSet::WildDoTable => self.wild_do_table.clear(),
            RuleSet::WildIgnoreTable => self.wild_ignore_table.clear(),
            RuleSet::RewriteDb => self.rewrite_db.clear(),
        }
    }

    /// Decide whether an event on `db` (and optionally `table`) is applied
    pub fn should_replicate(&self, db: &str, table: Option<&str>) -> bool {
        if let Some(table) = table {
            if !self.do_table.is_empty() || !self.wild_do_table.is_empty() {
                return self.do_table.contains(&qualified(db, table))
                    || self.wild_do_table.iter().any(|p| p.matches(db, table));
            }
            if self.ignore_table.contains(&qualified(db, table))
                || self.wild_ignore_table.iter().any(|p| p.matches(db, table))
            {
                return false;
            }
        }

        if !self.do_db.is_empty() {
            return self.do_db.contains(db);
        }
        !self.ignore_db.contains(db)
    }

    /// Schema name to use when applying, after the first matching rename
    pub fn rewrite<'a>(&'a self, db: &'a str) -> &'a str {
        self.rewrite_db
            .iter()
            .find(|(from, _)| from == db)
            .map_or(db, |(_, to)| to.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.do_db.is_empty()
            && self.ignore_db.is_empty()
            && self.do_table.is_empty()
            && self.ignore_table.is_empty()
            && self.wild_do_table.is_empty()
            && self.wild_ignore_table.is_empty()
            && self.rewrite_db.is_empty()
    }

    /// Serializable listing for status reports
    pub fn describe(&self) -> FilterDescription {
        let sorted = |set: &HashSet<String>| {
            let mut v: Vec<String> = set.iter().cloned().collect();
            v.sort();
            v
        };
        FilterDescription {
            do_db: sorted(&self.do_db),
            ignore_db: sorted(&self.ignore_db),
            do_table: sorted(&self.do_table),
            ignore_table: sorted(&self.ignore_table),
            wild_do_table: self.wild_do_table.iter().map(|p| p.as_str().to_string()).collect(),
            wild_ignore_table: self
                .wild_ignore_table
                .iter()
                .map(|p| p.as_str().to_string())
                .collect(),
            rewrite_db: self
                .rewrite_db
                .iter()
                .map(|(from, to)| format!("{}->{}", from, to))
                .collect(),
        }
    }
}

fn qualified(db: &str, table: &str) -> String {
    format!("{}.{}", db, table)
}

/// Rule listing as reported by `SHOW STATUS`
#[derive(Debug, Clone, Default, Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct FilterDescription {
    pub do_db: Vec<String>,
    pub ignore_db: Vec<String>,
    pub do_table: Vec<String>,
    pub ignore_table: Vec<String>,
    pub wild_do_table: Vec<String>,
    pub wild_ignore_table: Vec<String>,
    pub rewrite_db: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(list: &[Rule]) -> FilterRules {
        let mut r = FilterRules::new();
        for rule in list {
            r.add(rule.clone()).unwrap();
        }
        r
    }

    #[test]
    fn test_empty_rules_replicate_everything() {
        let r = FilterRules::new();
        assert!(r.should_replicate("any", Some("table")));
        assert!(r.should_replicate("any", None));
    }

    #[test]
    fn test_do_table_beats_ignore_table() {
        let r = rules(&[
            Rule::DoTable("shop.orders".into()),
            Rule::IgnoreTable("shop.orders".into()),
        ]);
        assert!(r.should_replicate("shop", Some("orders")));
        assert!(!r.should_replicate("shop", Some("customers")));
    }

    #[test]
    fn test_ignore_table_then_db_rules() {
        let r = rules(&[
            Rule::IgnoreTable("shop.audit".into()),
            Rule::IgnoreDb("scratch".into()),
        ]);
        assert!(!r.should_replicate("shop", Some("audit")));
        assert!(r.should_replicate("shop", Some("orders")));
        assert!(!r.should_replicate("scratch", Some("tmp")));
    }

    #[test]
    fn test_do_db_restricts_databases() {
        let r = rules(&[Rule::DoDb("shop".into()), Rule::IgnoreDb("shop".into())]);
        assert!(r.should_replicate("shop", None));
        assert!(!r.should_replicate("other", None));
    }

    #[test]
    fn test_wild_patterns_use_glob_semantics() {
        let r = rules(&[Rule::WildIgnoreTable("shop.tmp_*".into())]);
        assert!(!r.should_replicate("shop", Some("tmp_orders")));
        assert!(r.should_replicate("shop", Some("orders")));

        let r = rules(&[Rule::WildDoTable("app?.*".into())]);
        assert!(r.should_replicate("app1", Some("users")));
        assert!(!r.should_replicate("app12", Some("users")));
        assert!(!r.should_replicate("other", Some("users")));

        // Regex metacharacters other than the glob ones are literal
        let r = rules(&[Rule::WildDoTable("a+b.t".into())]);
        assert!(r.should_replicate("a+b", Some("t")));
        assert!(!r.should_replicate("aab", Some("t")));
    }

    #[test]
    fn test_rewrite_first_match_wins() {
        let r = rules(&[
            Rule::RewriteDb { from: "prod".into(), to: "replica".into() },
            Rule::RewriteDb { from: "prod".into(), to: "ignored".into() },
        ]);
        assert_eq!(r.rewrite("prod"), "replica");
        assert_eq!(r.rewrite("other"), "other");
    }

    #[test]
    fn test_invalid_rules_are_rejected() {
        let mut r = FilterRules::new();
        assert!(r.add(Rule::DoTable("no_dot".into())).is_err());
        assert!(r.add(Rule::WildDoTable(".orders".into())).is_err());
        assert!(r.add(Rule::DoDb(String::new())).is_err());
        assert!(Rule::parse(RuleSet::RewriteDb, "a=b").is_err());
        assert_eq!(
            Rule::parse(RuleSet::RewriteDb, "a -> b").unwrap(),
            Rule::RewriteDb { from: "a".into(), to: "b".into() }
        );
    }
}

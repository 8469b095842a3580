//! Declarative rules and the ordered table that resolves operations to them.

use crate::error::ConfigError;
use crate::operation::Operation;

/// How one declared label is matched against an operation value.
///
/// The variant set is closed; there is no general glob or regex support.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    /// Literal equality.
    Exact(String),
    /// Matches any value, including a missing label.
    Any,
    /// Matches values beginning with the prefix.
    Prefix(String),
}

impl Pattern {
    /// Derive a pattern from a config value.
    ///
    /// A trailing `*` makes a prefix pattern; a bare `*` (and the degenerate
    /// empty prefix) normalize to [`Pattern::Any`].
    pub fn from_value(value: &str) -> Pattern {
        match value.strip_suffix('*') {
            Some("") => Pattern::Any,
            Some(prefix) => Pattern::Prefix(prefix.to_string()),
            None => Pattern::Exact(value.to_string()),
        }
    }

    /// Test an observed value. Missing labels are tested as the empty string.
    pub fn matches(&self, value: &str) -> bool {
        match self {
            Pattern::Exact(expected) => value == expected,
            Pattern::Any => true,
            Pattern::Prefix(prefix) => value.starts_with(prefix),
        }
    }

    /// Whether this pattern matches every value.
    pub fn is_any(&self) -> bool {
        matches!(self, Pattern::Any)
    }

    /// Source form of the pattern as written in a section header.
    fn source(&self) -> String {
        match self {
            Pattern::Exact(value) => value.clone(),
            Pattern::Any => "*".to_string(),
            Pattern::Prefix(prefix) => format!("{}*", prefix),
        }
    }
}

/// One immutable rate-limit rule.
///
/// A rule matches an operation when every label it declares matches; labels
/// the rule does not declare are ignored. The rule with an empty operation is
/// the default catch-all.
#[derive(Debug, Clone)]
pub struct Rule {
    operation: Vec<(String, Pattern)>,
    credit_limit: u64,
    reset_seconds: u64,
    actor_field: Option<String>,
    comment: Option<String>,
    source: String,
}

impl Rule {
    /// Build a rule from declared `label → value` pairs, deriving a pattern
    /// from each value. An empty pair set yields the default rule.
    pub fn new<K, V, I>(pairs: I) -> Rule
    where
        K: Into<String>,
        V: AsRef<str>,
        I: IntoIterator<Item = (K, V)>,
    {
        let operation: Vec<(String, Pattern)> = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), Pattern::from_value(v.as_ref())))
            .collect();
        let source = if operation.is_empty() {
            "default".to_string()
        } else {
            operation
                .iter()
                .map(|(k, p)| format!("{}={}", k, p.source()))
                .collect::<Vec<_>>()
                .join(" ")
        };
        Rule {
            operation,
            credit_limit: 0,
            reset_seconds: 0,
            actor_field: None,
            comment: None,
            source,
        }
    }

    /// The default catch-all rule (empty operation).
    pub fn default_rule() -> Rule {
        Rule::new(std::iter::empty::<(String, &str)>())
    }

    /// Set the credit budget (operations per window).
    pub fn with_credit_limit(mut self, limit: u64) -> Rule {
        self.credit_limit = limit;
        self
    }

    /// Set the window length in seconds.
    pub fn with_reset_seconds(mut self, seconds: u64) -> Rule {
        self.reset_seconds = seconds;
        self
    }

    /// Name the label whose value partitions this rule's budget.
    pub fn with_actor_field(mut self, field: impl Into<String>) -> Rule {
        let field = field.into();
        self.actor_field = if field.is_empty() { None } else { Some(field) };
        self
    }

    /// Attach a diagnostic comment.
    pub fn with_comment(mut self, comment: impl Into<String>) -> Rule {
        self.comment = Some(comment.into());
        self
    }

    /// Credit budget per window.
    pub fn credit_limit(&self) -> u64 {
        self.credit_limit
    }

    /// Window length in seconds.
    pub fn reset_seconds(&self) -> u64 {
        self.reset_seconds
    }

    /// Label partitioning the budget, if any.
    pub fn actor_field(&self) -> Option<&str> {
        self.actor_field.as_deref()
    }

    /// Diagnostic comment, if any.
    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    /// Declared labels and their patterns, in declaration order.
    pub fn declared(&self) -> impl Iterator<Item = (&str, &Pattern)> {
        self.operation.iter().map(|(k, p)| (k.as_str(), p))
    }

    /// Canonical source form of the operation, stable across restarts.
    ///
    /// Doubles as the rule discriminator in bucket key derivation: two rules
    /// with different shapes but identical projections must not share
    /// buckets.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether this is the default catch-all rule.
    pub fn is_default(&self) -> bool {
        self.operation.is_empty()
    }

    /// Whether every declared label matches the operation. Missing labels
    /// are tested as the empty string; undeclared labels are ignored.
    pub fn matches(&self, op: &Operation) -> bool {
        self.operation
            .iter()
            .all(|(k, p)| p.matches(op.get(k).unwrap_or("")))
    }

    /// Whether this rule declares the given label.
    fn declares(&self, label: &str) -> bool {
        self.operation.iter().any(|(k, _)| k == label)
    }

    /// The candidate's own operation as a concrete probe: only its declared
    /// labels, each carrying the pattern value as written in the source.
    fn probe_operation(&self) -> Operation {
        self.operation
            .iter()
            .map(|(k, p)| (k.clone(), p.source()))
            .collect()
    }

    /// Whether `candidate` is unreachable behind this rule.
    ///
    /// The candidate's operation, concretized to its source values, is run
    /// through the ordinary matcher. A candidate that constrains a label
    /// this rule does not test may legitimately follow it.
    fn masks(&self, candidate: &Rule) -> bool {
        if candidate
            .operation
            .iter()
            .any(|(label, _)| !self.declares(label))
        {
            return false;
        }
        self.matches(&candidate.probe_operation())
    }
}

/// Ordered rule table with first-match resolution.
///
/// Construction is append-only; the table is immutable once built. The
/// default rule is held apart from the ordered list and consulted last, so
/// declaring `[default]` first in a document does not swallow every rule
/// after it.
#[derive(Debug, Clone, Default)]
pub struct RuleTable {
    rules: Vec<Rule>,
    default_rule: Option<Rule>,
}

impl RuleTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a rule, rejecting it if an existing rule already masks it.
    ///
    /// The probe is the candidate's own operation treated as concrete
    /// values, resolved through the ordinary matcher: `a=1` after `a=*`,
    /// `a=foo*` after `a=f*`, and exact duplicates are all caught. A
    /// narrower rule that constrains a label an earlier rule does not test
    /// is accepted.
    pub fn add_rule(&mut self, rule: Rule) -> Result<(), ConfigError> {
        if let Some(masking) = self.rules.iter().find(|existing| existing.masks(&rule)) {
            return Err(ConfigError::UnreachableRule {
                rule: rule.source().to_string(),
                masked_by: masking.source().to_string(),
            });
        }
        if rule.is_default() {
            if let Some(existing) = &self.default_rule {
                return Err(ConfigError::UnreachableRule {
                    rule: rule.source().to_string(),
                    masked_by: existing.source().to_string(),
                });
            }
            self.default_rule = Some(rule);
        } else {
            self.rules.push(rule);
        }
        Ok(())
    }

    /// Resolve an operation to its governing rule: first declared match,
    /// then the default rule, then nothing.
    pub fn find_rule(&self, op: &Operation) -> Option<&Rule> {
        self.rules
            .iter()
            .find(|rule| rule.matches(op))
            .or(self.default_rule.as_ref())
    }

    /// Number of rules, counting the default.
    pub fn len(&self) -> usize {
        self.rules.len() + usize::from(self.default_rule.is_some())
    }

    /// Whether the table holds no rules at all.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty() && self.default_rule.is_none()
    }

    /// Iterate the ordered rules, default last.
    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter().chain(self.default_rule.as_ref())
    }
}

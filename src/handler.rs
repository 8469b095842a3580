//! The decision path for a parsed `HIT`: match, project, derive the bucket
//! key, consume credit, reply.

use std::sync::Arc;
use std::time::Instant;

use sha1::{Digest, Sha1};
use tracing::warn;

use crate::backend::Backend;
use crate::metrics::{increment, timing, MetricsSink};
use crate::operation::Operation;
use crate::rules::{Rule, RuleTable};
use crate::wire::Reply;

/// Sentinel credit reported when no rule governs an operation.
pub const UNMATCHED_CREDIT: i64 = -1;

/// What to reply when the backend errors or times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Allow the operation (`OK true 0 0`). The default.
    #[default]
    Open,
    /// Deny the operation (`OK false 0 0`).
    Closed,
}

/// Joins the rule table, the backend, and the metrics sink.
pub struct HitHandler<S> {
    table: Arc<RuleTable>,
    backend: Arc<dyn Backend>,
    sink: S,
    policy: FailurePolicy,
}

impl<S> HitHandler<S>
where
    S: MetricsSink,
    S::Future: Send + 'static,
{
    /// Create a handler with the fail-open policy.
    pub fn new(table: Arc<RuleTable>, backend: Arc<dyn Backend>, sink: S) -> Self {
        Self { table, backend, sink, policy: FailurePolicy::default() }
    }

    /// Override the backend failure policy.
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Decide one operation and produce its reply line.
    ///
    /// Never fails: backend errors resolve through the failure policy, and
    /// the unmatched case allows with a sentinel credit.
    pub async fn handle(&self, op: Operation) -> Reply {
        let started = Instant::now();

        let Some(rule) = self.table.find_rule(&op) else {
            self.record_outcome("accepted", "none", started).await;
            return Reply::ok(true, UNMATCHED_CREDIT, 0);
        };

        let projected = project(rule, &op);
        let actor = rule
            .actor_field()
            .and_then(|field| op.get(field))
            .unwrap_or("");
        let key = bucket_key(rule, &projected, actor);

        match self.backend.hit(&key, rule.credit_limit(), rule.reset_seconds()).await {
            Ok(outcome) => {
                let verdict = if outcome.is_allowed { "accepted" } else { "rejected" };
                let match_type = if rule.is_default() { "default" } else { "rule" };
                self.record_outcome(verdict, match_type, started).await;
                Reply::ok(outcome.is_allowed, outcome.current_credit, outcome.next_reset_seconds)
            }
            Err(error) => {
                warn!(%error, operation = %op, "backend hit failed");
                increment(&self.sink, "error.backend-unavailable").await;
                match self.policy {
                    FailurePolicy::Open => Reply::ok(true, 0, 0),
                    FailurePolicy::Closed => Reply::ok(false, 0, 0),
                }
            }
        }
    }

    async fn record_outcome(&self, verdict: &str, match_type: &str, started: Instant) {
        increment(&self.sink, format!("hit.{}", verdict)).await;
        increment(&self.sink, format!("hit.{}.{}", verdict, match_type)).await;
        timing(&self.sink, "hit", started.elapsed().as_millis() as u64).await;
    }
}

/// Project an operation onto a rule: keep only the labels the rule declares,
/// substituting the literal `*` for labels matched by an any-pattern.
///
/// The projection pins the bucket to the rule's shape: the actor value does
/// not leak into the key, and undeclared labels never influence it.
pub fn project(rule: &Rule, op: &Operation) -> Operation {
    rule.declared()
        .map(|(label, pattern)| {
            let value = if pattern.is_any() {
                "*"
            } else {
                op.get(label).unwrap_or("")
            };
            (label, value)
        })
        .collect()
}

/// Derive the stable bucket key for (rule, projected operation, actor).
///
/// The canonical form sorts projected labels by name and prepends the rule's
/// source operation, so rules with different shapes but identical
/// projections cannot collide. The hex digest is what the backend sees.
pub fn bucket_key(rule: &Rule, projected: &Operation, actor: &str) -> String {
    let mut pairs: Vec<(&str, &str)> = projected.iter().collect();
    pairs.sort_unstable();

    let mut canonical = String::new();
    canonical.push_str(rule.source());
    canonical.push('\n');
    for (i, (label, value)) in pairs.iter().enumerate() {
        if i > 0 {
            canonical.push(',');
        }
        canonical.push_str(label);
        canonical.push('=');
        canonical.push_str(value);
    }
    canonical.push_str("|actor=");
    canonical.push_str(actor);

    hex::encode(Sha1::digest(canonical.as_bytes()))
}

//! Policy composition.
//!
//! For one collection, command and phase, the applicable policies are split
//! into permissive and restrictive sets. The permissive predicates are
//! OR-folded (identity FALSE, so no permissive policy means deny) and the
//! restrictive predicates are AND-folded on top (identity TRUE).
//!
//! The engine does not look at enforcement modes or bypass; that is the
//! gate's job. Every call reads exactly one store snapshot.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::claims::ClaimsContext;
use crate::config::EngineConfig;
use crate::error::EvaluationError;
use crate::expr::{Evaluator, Expr, Truth};
use crate::policy::{Command, Phase, Policy, PolicyType};
use crate::store::{PolicySnapshot, PolicyStore};
use crate::value::Row;

/// Outcome of one policy in a traced decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Predicate was TRUE, or the policy has no predicate.
    Pass,
    /// Predicate was FALSE.
    Fail,
    /// Predicate was UNKNOWN (NULL involved); counts as a fail.
    Unknown,
    /// Predicate failed to evaluate; counts as a fail.
    Error(String),
}

impl Outcome {
    /// Check if the outcome admits the row.
    pub fn passed(&self) -> bool {
        matches!(self, Outcome::Pass)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Pass => f.write_str("pass"),
            Outcome::Fail => f.write_str("fail"),
            Outcome::Unknown => f.write_str("unknown"),
            Outcome::Error(message) => write!(f, "error: {}", message),
        }
    }
}

/// One applicable policy and how it evaluated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyOutcome {
    pub policy: String,
    pub policy_type: PolicyType,
    pub outcome: Outcome,
}

/// Explanation of a single-phase decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionTrace {
    pub collection: String,
    pub command: Command,
    pub phase: Phase,
    /// Snapshot version the decision was made against.
    pub version: u64,
    /// Applicable policies in registration order.
    pub policies: Vec<PolicyOutcome>,
    /// OR of the permissive outcomes.
    pub permissive: bool,
    /// AND of the restrictive outcomes.
    pub restrictive: bool,
    /// No policy at all exists for the command.
    pub lockout: bool,
    /// Final decision.
    pub allowed: bool,
}

impl fmt::Display for DecisionTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} {} on '{}' (snapshot v{}): {}",
            self.command,
            self.phase,
            self.collection,
            self.version,
            if self.allowed { "ALLOW" } else { "DENY" }
        )?;
        if self.lockout {
            writeln!(f, "  no policies exist for {}", self.command)?;
        }
        for p in &self.policies {
            let kind = match p.policy_type {
                PolicyType::Permissive => "permissive",
                PolicyType::Restrictive => "restrictive",
            };
            writeln!(f, "  {} [{}]: {}", p.policy, kind, p.outcome)?;
        }
        write!(
            f,
            "  permissive={} restrictive={}",
            self.permissive, self.restrictive
        )
    }
}

/// A read predicate with request constants bound, for storage pushdown.
#[derive(Debug, Clone, PartialEq)]
pub struct Pushdown {
    /// Combined predicate. Only row columns remain unresolved.
    pub predicate: Expr,
    /// Row columns the predicate references.
    pub columns: BTreeSet<String>,
    /// Names of the policies folded into the predicate.
    pub policies: Vec<String>,
}

impl fmt::Display for Pushdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.predicate)
    }
}

/// Combines applicable policies into one decision per row.
pub struct PolicyEngine {
    store: Arc<PolicyStore>,
    /// Snapshot version at which each lockout was last reported.
    reported_lockouts: DashMap<(String, Command), u64>,
}

impl PolicyEngine {
    /// Create an engine over a policy store.
    pub fn new(store: Arc<PolicyStore>) -> Self {
        Self {
            store,
            reported_lockouts: DashMap::new(),
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<PolicyStore> {
        &self.store
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        self.store.config()
    }

    /// Decide whether `command` is allowed on `row`.
    ///
    /// Evaluates every phase the command has against the same row: SELECT
    /// and DELETE use `USING`, INSERT uses `WITH CHECK`, UPDATE uses both.
    pub fn decide(&self, collection: &str, command: Command, ctx: &ClaimsContext, row: &Row) -> bool {
        let snapshot = self.store.snapshot();
        self.decide_in(&snapshot, collection, command, ctx, row)
    }

    /// Decide a single phase of a command.
    pub fn decide_phase(
        &self,
        collection: &str,
        command: Command,
        phase: Phase,
        ctx: &ClaimsContext,
        row: &Row,
    ) -> bool {
        let snapshot = self.store.snapshot();
        self.phase_in(&snapshot, collection, command, phase, ctx, row)
    }

    /// Decide an update: `USING` on the existing row and `WITH CHECK` on the
    /// proposed row. Both must pass.
    pub fn decide_update(
        &self,
        collection: &str,
        ctx: &ClaimsContext,
        existing: &Row,
        proposed: &Row,
    ) -> bool {
        let snapshot = self.store.snapshot();
        self.update_in(&snapshot, collection, ctx, existing, proposed)
    }

    /// Explain a single-phase decision, evaluating every applicable policy.
    pub fn trace(
        &self,
        collection: &str,
        command: Command,
        phase: Phase,
        ctx: &ClaimsContext,
        row: &Row,
    ) -> DecisionTrace {
        let snapshot = self.store.snapshot();
        let policies = snapshot.policies_for(collection, command, ctx.role());

        let outcomes: Vec<PolicyOutcome> = policies
            .iter()
            .map(|policy| {
                let outcome = match policy.expr_for(phase) {
                    None => Outcome::Pass,
                    Some(expr) => match Evaluator::try_evaluate(expr, row, ctx) {
                        Ok(Truth::True) => Outcome::Pass,
                        Ok(Truth::False) => Outcome::Fail,
                        Ok(Truth::Unknown) => Outcome::Unknown,
                        Err(e) => Outcome::Error(e.to_string()),
                    },
                };
                PolicyOutcome {
                    policy: policy.name.clone(),
                    policy_type: policy.policy_type,
                    outcome,
                }
            })
            .collect();

        let permissive = outcomes
            .iter()
            .filter(|o| o.policy_type == PolicyType::Permissive)
            .fold(false, |acc, o| acc || o.outcome.passed());
        let restrictive = outcomes
            .iter()
            .filter(|o| o.policy_type == PolicyType::Restrictive)
            .fold(true, |acc, o| acc && o.outcome.passed());

        DecisionTrace {
            collection: collection.to_string(),
            command,
            phase,
            version: snapshot.version(),
            lockout: !snapshot.has_policies(collection, command),
            allowed: permissive && restrictive,
            policies: outcomes,
            permissive,
            restrictive,
        }
    }

    /// Build the read predicate for a request, with claims, principal and
    /// role bound to literals.
    ///
    /// A policy whose claims cannot be resolved contributes FALSE. The result
    /// never admits a row that [`decide`](Self::decide) rejects, though it may
    /// reject rows that `decide` admits through short-circuiting.
    pub fn pushdown(&self, collection: &str, command: Command, ctx: &ClaimsContext) -> Pushdown {
        let phase = match command {
            Command::Insert => Phase::Check,
            _ => Phase::Using,
        };
        let snapshot = self.store.snapshot();
        let policies = snapshot.policies_for(collection, command, ctx.role());

        let mut permissive = Vec::new();
        let mut restrictive = Vec::new();
        for policy in &policies {
            let bound = match policy.expr_for(phase) {
                None => Expr::lit(true),
                Some(expr) => bind(expr, ctx).unwrap_or_else(|e| {
                    debug!(collection = %collection, policy = %policy.name, error = %e, "Policy unresolvable for pushdown");
                    Expr::lit(false)
                }),
            };
            if policy.is_restrictive() {
                restrictive.push(bound);
            } else {
                permissive.push(bound);
            }
        }

        let predicate = if permissive.is_empty() {
            Expr::lit(false)
        } else {
            let granted = match permissive.len() {
                1 => permissive.remove(0),
                _ => Expr::Or(permissive),
            };
            if restrictive.is_empty() {
                granted
            } else {
                let mut all = vec![granted];
                all.extend(restrictive);
                Expr::And(all)
            }
        };

        Pushdown {
            columns: predicate.columns(),
            policies: policies.iter().map(|p| p.name.clone()).collect(),
            predicate,
        }
    }

    pub(crate) fn decide_in(
        &self,
        snapshot: &PolicySnapshot,
        collection: &str,
        command: Command,
        ctx: &ClaimsContext,
        row: &Row,
    ) -> bool {
        command
            .phases()
            .iter()
            .all(|&phase| self.phase_in(snapshot, collection, command, phase, ctx, row))
    }

    pub(crate) fn update_in(
        &self,
        snapshot: &PolicySnapshot,
        collection: &str,
        ctx: &ClaimsContext,
        existing: &Row,
        proposed: &Row,
    ) -> bool {
        self.phase_in(snapshot, collection, Command::Update, Phase::Using, ctx, existing)
            && self.phase_in(snapshot, collection, Command::Update, Phase::Check, ctx, proposed)
    }

    fn phase_in(
        &self,
        snapshot: &PolicySnapshot,
        collection: &str,
        command: Command,
        phase: Phase,
        ctx: &ClaimsContext,
        row: &Row,
    ) -> bool {
        let policies = snapshot.policies_for(collection, command, ctx.role());
        if policies.is_empty() {
            if !snapshot.has_policies(collection, command) {
                self.report_lockout(snapshot, collection, command);
            }
            debug!(
                collection = %collection,
                command = %command,
                role = %ctx.role(),
                "No applicable policies; denied"
            );
            return false;
        }

        let (restrictive, permissive): (Vec<&Arc<Policy>>, Vec<&Arc<Policy>>) =
            policies.iter().partition(|p| p.is_restrictive());

        let granted = permissive
            .iter()
            .any(|p| self.admits(p, phase, ctx, row));
        let allowed = granted && restrictive.iter().all(|p| self.admits(p, phase, ctx, row));

        debug!(
            collection = %collection,
            command = %command,
            phase = %phase,
            permissive = permissive.len(),
            restrictive = restrictive.len(),
            granted,
            allowed,
            "Policy decision"
        );
        allowed
    }

    fn admits(&self, policy: &Policy, phase: Phase, ctx: &ClaimsContext, row: &Row) -> bool {
        let Some(expr) = policy.expr_for(phase) else {
            return true;
        };
        match Evaluator::try_evaluate(expr, row, ctx) {
            Ok(truth) => truth.is_true(),
            Err(e) => {
                self.report_error(policy, phase, &e);
                false
            }
        }
    }

    fn report_error(&self, policy: &Policy, phase: Phase, error: &EvaluationError) {
        if self.config().log_evaluation_errors {
            warn!(
                collection = %policy.collection,
                policy = %policy.name,
                phase = %phase,
                error = %error,
                "Policy evaluation failed; row denied"
            );
        }
    }

    fn report_lockout(&self, snapshot: &PolicySnapshot, collection: &str, command: Command) {
        if !self.config().warn_on_lockout {
            return;
        }
        let version = snapshot.version();
        let fresh = match self.reported_lockouts.entry((collection.to_string(), command)) {
            Entry::Occupied(mut entry) => {
                if *entry.get() == version {
                    false
                } else {
                    entry.insert(version);
                    true
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(version);
                true
            }
        };
        if fresh {
            warn!(
                collection = %collection,
                command = %command,
                version,
                "Row-level security is enforced but no policy exists; every {} is denied",
                command
            );
        }
    }
}

/// Replace request-constant operands with literals.
fn bind(expr: &Expr, ctx: &ClaimsContext) -> Result<Expr, EvaluationError> {
    let bind_all = |items: &[Expr]| -> Result<Vec<Expr>, EvaluationError> {
        items.iter().map(|item| bind(item, ctx)).collect()
    };
    Ok(match expr {
        Expr::Claim(_) | Expr::HasClaim(_) | Expr::PrincipalId | Expr::Role => {
            Expr::Literal(Evaluator::resolve_constant(expr, ctx)?)
        }
        Expr::Literal(_) | Expr::Column(_) => expr.clone(),
        Expr::List(items) => Expr::List(bind_all(items)?),
        Expr::Compare { op, left, right } => {
            Expr::compare(*op, bind(left, ctx)?, bind(right, ctx)?)
        }
        Expr::In {
            needle,
            haystack,
            negated,
        } => Expr::In {
            needle: Box::new(bind(needle, ctx)?),
            haystack: Box::new(bind(haystack, ctx)?),
            negated: *negated,
        },
        Expr::IsNull { operand, negated } => Expr::IsNull {
            operand: Box::new(bind(operand, ctx)?),
            negated: *negated,
        },
        Expr::Not(inner) => Expr::not(bind(inner, ctx)?),
        Expr::And(items) => Expr::And(bind_all(items)?),
        Expr::Or(items) => Expr::Or(bind_all(items)?),
    })
}

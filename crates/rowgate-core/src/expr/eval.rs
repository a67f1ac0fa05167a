//! Predicate evaluation against a row and a claims context.
//!
//! Evaluation uses three-valued logic internally: comparisons involving NULL
//! are UNKNOWN, and AND/OR/NOT follow Kleene's tables. The public entry
//! point collapses UNKNOWN and every evaluation error to `false`.

use std::borrow::Cow;

use super::ast::{CompareOp, Expr};
use crate::claims::{ClaimLookup, ClaimsContext};
use crate::error::EvaluationError;
use crate::value::{Comparison, Row, Value};

static NULL: Value = Value::Null;

/// Three-valued truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Truth {
    True,
    False,
    Unknown,
}

impl Truth {
    fn not(self) -> Self {
        match self {
            Truth::True => Truth::False,
            Truth::False => Truth::True,
            Truth::Unknown => Truth::Unknown,
        }
    }

    fn from_bool(b: bool) -> Self {
        if b {
            Truth::True
        } else {
            Truth::False
        }
    }

    /// Collapse for filtering: only TRUE admits a row.
    pub(crate) fn is_true(self) -> bool {
        self == Truth::True
    }
}

/// Evaluates policy predicates.
pub struct Evaluator;

impl Evaluator {
    /// Evaluate a predicate. Total: never panics, never errors.
    ///
    /// Returns `true` only if the predicate is definitely TRUE. UNKNOWN and
    /// any evaluation error (type mismatch, missing claim, malformed path)
    /// yield `false`.
    pub fn evaluate(expr: &Expr, row: &Row, ctx: &ClaimsContext) -> bool {
        matches!(Self::try_evaluate(expr, row, ctx), Ok(Truth::True))
    }

    /// Evaluate without collapsing, for diagnostics inside the crate.
    pub(crate) fn try_evaluate(
        expr: &Expr,
        row: &Row,
        ctx: &ClaimsContext,
    ) -> Result<Truth, EvaluationError> {
        Scope { row, ctx }.truth(expr)
    }

    /// Resolve an operand to a value (claims and principal only, no row).
    ///
    /// Used to bind request-constant parts of a predicate before pushing it
    /// down to storage.
    pub(crate) fn resolve_constant(
        expr: &Expr,
        ctx: &ClaimsContext,
    ) -> Result<Value, EvaluationError> {
        let empty = Row::new();
        Scope { row: &empty, ctx }
            .value(expr)
            .map(Cow::into_owned)
    }
}

struct Scope<'a> {
    row: &'a Row,
    ctx: &'a ClaimsContext,
}

impl<'a> Scope<'a> {
    fn truth(&self, expr: &'a Expr) -> Result<Truth, EvaluationError> {
        match expr {
            // Identity TRUE, short-circuit on FALSE.
            Expr::And(items) => {
                let mut acc = Truth::True;
                for item in items {
                    match self.truth(item)? {
                        Truth::False => return Ok(Truth::False),
                        Truth::Unknown => acc = Truth::Unknown,
                        Truth::True => {}
                    }
                }
                Ok(acc)
            }
            // Identity FALSE, short-circuit on TRUE.
            Expr::Or(items) => {
                let mut acc = Truth::False;
                for item in items {
                    match self.truth(item)? {
                        Truth::True => return Ok(Truth::True),
                        Truth::Unknown => acc = Truth::Unknown,
                        Truth::False => {}
                    }
                }
                Ok(acc)
            }
            Expr::Not(inner) => Ok(self.truth(inner)?.not()),
            Expr::Compare { op, left, right } => {
                let left = self.value(left)?;
                let right = self.value(right)?;
                Self::compare(*op, &left, &right)
            }
            Expr::In {
                needle,
                haystack,
                negated,
            } => {
                let needle = self.value(needle)?;
                let haystack = self.value(haystack)?;
                let result = Self::membership(&needle, &haystack)?;
                Ok(if *negated { result.not() } else { result })
            }
            Expr::IsNull { operand, negated } => {
                let is_null = self.value(operand)?.is_null();
                Ok(Truth::from_bool(is_null != *negated))
            }
            Expr::HasClaim(path) => match self.ctx.claim_path(path) {
                ClaimLookup::Present(_) => Ok(Truth::True),
                ClaimLookup::Absent => Ok(Truth::False),
                ClaimLookup::Malformed => Err(EvaluationError::MalformedPath(path.clone())),
            },
            Expr::Literal(_)
            | Expr::Column(_)
            | Expr::Claim(_)
            | Expr::PrincipalId
            | Expr::Role
            | Expr::List(_) => match self.value(expr)?.as_ref() {
                Value::Bool(b) => Ok(Truth::from_bool(*b)),
                Value::Null => Ok(Truth::Unknown),
                other => Err(EvaluationError::NotBoolean(other.kind())),
            },
        }
    }

    fn value(&self, expr: &'a Expr) -> Result<Cow<'a, Value>, EvaluationError> {
        match expr {
            Expr::Literal(v) => Ok(Cow::Borrowed(v)),
            Expr::Column(name) => Ok(Cow::Borrowed(self.row.get(name).unwrap_or(&NULL))),
            Expr::Claim(path) => match self.ctx.claim_path(path) {
                ClaimLookup::Present(v) => Ok(Cow::Borrowed(v)),
                ClaimLookup::Absent => Err(EvaluationError::MissingClaim(path.clone())),
                ClaimLookup::Malformed => Err(EvaluationError::MalformedPath(path.clone())),
            },
            // An empty principal id is the anonymous principal and matches nothing.
            Expr::PrincipalId => Ok(match self.ctx.principal_id() {
                "" => Cow::Borrowed(&NULL),
                id => Cow::Owned(Value::String(id.to_string())),
            }),
            Expr::Role => Ok(Cow::Owned(Value::String(self.ctx.role().to_string()))),
            Expr::List(items) => {
                let values = items
                    .iter()
                    .map(|item| self.value(item).map(Cow::into_owned))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Cow::Owned(Value::Array(values)))
            }
            _ => Ok(Cow::Owned(match self.truth(expr)? {
                Truth::True => Value::Bool(true),
                Truth::False => Value::Bool(false),
                Truth::Unknown => Value::Null,
            })),
        }
    }

    fn compare(op: CompareOp, left: &Value, right: &Value) -> Result<Truth, EvaluationError> {
        let cmp = if op.is_equality() {
            left.equals(right)
        } else {
            left.order(right)
        };
        match cmp {
            Comparison::Ordered(ord) => Ok(Truth::from_bool(op.accepts(ord))),
            Comparison::Unknown => Ok(Truth::Unknown),
            Comparison::Mismatch(l, r) => Err(EvaluationError::TypeMismatch {
                op: op.symbol(),
                left: l,
                right: r,
            }),
        }
    }

    /// SQL-style membership: TRUE on a match, UNKNOWN if no match but the
    /// list holds a NULL, FALSE otherwise. Elements of another kind never match.
    fn membership(needle: &Value, haystack: &Value) -> Result<Truth, EvaluationError> {
        let items = match haystack {
            Value::Array(items) => items,
            Value::Null => return Ok(Truth::Unknown),
            other => return Err(EvaluationError::NotAList(other.kind())),
        };
        if needle.is_null() {
            return Ok(Truth::Unknown);
        }

        let mut saw_null = false;
        for item in items {
            match needle.equals(item) {
                Comparison::Ordered(ord) if ord.is_eq() => return Ok(Truth::True),
                Comparison::Unknown => saw_null = true,
                _ => {}
            }
        }
        Ok(if saw_null { Truth::Unknown } else { Truth::False })
    }
}

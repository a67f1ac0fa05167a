//! Policy expression AST.

use std::collections::BTreeSet;
use std::fmt;

use crate::value::Value;

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    /// Operator as written in canonical source.
    pub fn symbol(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }

    /// Whether an ordering satisfies this operator.
    pub fn accepts(self, ord: std::cmp::Ordering) -> bool {
        match self {
            CompareOp::Eq => ord.is_eq(),
            CompareOp::Ne => ord.is_ne(),
            CompareOp::Lt => ord.is_lt(),
            CompareOp::Le => ord.is_le(),
            CompareOp::Gt => ord.is_gt(),
            CompareOp::Ge => ord.is_ge(),
        }
    }

    /// Whether the operator only needs equality (not ordering).
    pub fn is_equality(self) -> bool {
        matches!(self, CompareOp::Eq | CompareOp::Ne)
    }
}

/// A boolean policy predicate, or a value-producing operand inside one.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Constant value.
    Literal(Value),
    /// Row column reference. Missing columns read as NULL.
    Column(String),
    /// Dotted claim path. A missing claim is an evaluation error.
    Claim(String),
    /// Presence test for a claim path. Never errors on absence.
    HasClaim(String),
    /// The acting principal's identifier (`auth.uid()`).
    PrincipalId,
    /// The acting principal's role (`auth.role()`).
    Role,
    /// List of operands, usable as the right side of `IN`.
    List(Vec<Expr>),
    /// Binary comparison.
    Compare {
        op: CompareOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// Set membership.
    In {
        needle: Box<Expr>,
        haystack: Box<Expr>,
        negated: bool,
    },
    /// NULL test.
    IsNull { operand: Box<Expr>, negated: bool },
    /// Logical negation.
    Not(Box<Expr>),
    /// Conjunction. Empty is TRUE.
    And(Vec<Expr>),
    /// Disjunction. Empty is FALSE.
    Or(Vec<Expr>),
}

impl Expr {
    /// Constant value.
    pub fn lit(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    /// Row column reference.
    pub fn column(name: impl Into<String>) -> Self {
        Expr::Column(name.into())
    }

    /// Claim path reference.
    pub fn claim(path: impl Into<String>) -> Self {
        Expr::Claim(path.into())
    }

    /// Claim presence test.
    pub fn has_claim(path: impl Into<String>) -> Self {
        Expr::HasClaim(path.into())
    }

    /// Binary comparison.
    pub fn compare(op: CompareOp, left: Expr, right: Expr) -> Self {
        Expr::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// `left = right`.
    pub fn eq(left: Expr, right: Expr) -> Self {
        Self::compare(CompareOp::Eq, left, right)
    }

    /// `needle IN haystack`.
    pub fn in_list(needle: Expr, haystack: Expr) -> Self {
        Expr::In {
            needle: Box::new(needle),
            haystack: Box::new(haystack),
            negated: false,
        }
    }

    /// `operand IS NULL`.
    pub fn is_null(operand: Expr) -> Self {
        Expr::IsNull {
            operand: Box::new(operand),
            negated: false,
        }
    }

    /// Logical negation.
    #[allow(clippy::should_implement_trait)]
    pub fn not(expr: Expr) -> Self {
        Expr::Not(Box::new(expr))
    }

    /// Conjunction.
    pub fn and(exprs: Vec<Expr>) -> Self {
        Expr::And(exprs)
    }

    /// Disjunction.
    pub fn or(exprs: Vec<Expr>) -> Self {
        Expr::Or(exprs)
    }

    /// Row columns referenced anywhere in the expression.
    pub fn columns(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.visit(&mut |e| {
            if let Expr::Column(name) = e {
                out.insert(name.clone());
            }
        });
        out
    }

    /// Claim paths referenced anywhere in the expression.
    pub fn claim_paths(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.visit(&mut |e| {
            if let Expr::Claim(path) | Expr::HasClaim(path) = e {
                out.insert(path.clone());
            }
        });
        out
    }

    /// First literal that has no source text, such as an object or a
    /// non-finite float.
    pub fn unprintable_literal(&self) -> Option<&Value> {
        match self {
            Expr::Literal(value) => (!value.has_source_form()).then_some(value),
            Expr::Column(_)
            | Expr::Claim(_)
            | Expr::HasClaim(_)
            | Expr::PrincipalId
            | Expr::Role => None,
            Expr::List(items) | Expr::And(items) | Expr::Or(items) => {
                items.iter().find_map(Expr::unprintable_literal)
            }
            Expr::Compare { left, right, .. } => left
                .unprintable_literal()
                .or_else(|| right.unprintable_literal()),
            Expr::In {
                needle, haystack, ..
            } => needle
                .unprintable_literal()
                .or_else(|| haystack.unprintable_literal()),
            Expr::IsNull { operand, .. } => operand.unprintable_literal(),
            Expr::Not(inner) => inner.unprintable_literal(),
        }
    }

    /// Pre-order traversal.
    pub fn visit(&self, f: &mut impl FnMut(&Expr)) {
        f(self);
        match self {
            Expr::Literal(_)
            | Expr::Column(_)
            | Expr::Claim(_)
            | Expr::HasClaim(_)
            | Expr::PrincipalId
            | Expr::Role => {}
            Expr::List(items) | Expr::And(items) | Expr::Or(items) => {
                for item in items {
                    item.visit(f);
                }
            }
            Expr::Compare { left, right, .. } => {
                left.visit(f);
                right.visit(f);
            }
            Expr::In {
                needle, haystack, ..
            } => {
                needle.visit(f);
                haystack.visit(f);
            }
            Expr::IsNull { operand, .. } => operand.visit(f),
            Expr::Not(inner) => inner.visit(f),
        }
    }

    /// Binding strength, used to decide where parentheses are needed.
    fn precedence(&self) -> u8 {
        match self {
            Expr::Or(items) if items.len() > 1 => 1,
            Expr::And(items) if items.len() > 1 => 2,
            Expr::Not(_) => 3,
            Expr::Compare { .. } | Expr::In { .. } | Expr::IsNull { .. } => 4,
            _ => 5,
        }
    }

    fn fmt_child(&self, f: &mut fmt::Formatter<'_>, min: u8) -> fmt::Result {
        if self.precedence() < min {
            write!(f, "({})", self)
        } else {
            write!(f, "{}", self)
        }
    }
}

/// Words the parser treats specially and that cannot be bare column names.
pub(crate) const RESERVED: &[&str] = &[
    "and", "or", "not", "in", "is", "null", "true", "false", "row", "claims", "claim",
    "has_claim", "auth",
];

fn is_bare_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let starts_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    starts_ok
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !RESERVED.iter().any(|r| r.eq_ignore_ascii_case(name))
}

/// Array indexes print bare only when the lexer reads them back unchanged.
fn is_path_segment(segment: &str) -> bool {
    let index = !segment.is_empty()
        && segment.len() <= 18
        && segment.chars().all(|c| c.is_ascii_digit())
        && (segment == "0" || !segment.starts_with('0'));
    let ident = segment
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && segment.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    index || ident
}

fn fmt_list(items: &[Expr], f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str("[")?;
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        item.fmt_child(f, 1)?;
    }
    f.write_str("]")
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(value) => write!(f, "{}", value),
            Expr::Column(name) => {
                if is_bare_identifier(name) {
                    f.write_str(name)
                } else {
                    write!(f, "row.{}", Value::from(name.as_str()))
                }
            }
            Expr::Claim(path) => {
                if path.split('.').all(is_path_segment) {
                    write!(f, "claims.{}", path)
                } else {
                    write!(f, "claim({})", Value::from(path.as_str()))
                }
            }
            Expr::HasClaim(path) => write!(f, "has_claim({})", Value::from(path.as_str())),
            Expr::PrincipalId => f.write_str("auth.uid()"),
            Expr::Role => f.write_str("auth.role()"),
            Expr::List(items) => fmt_list(items, f),
            Expr::Compare { op, left, right } => {
                left.fmt_child(f, 5)?;
                write!(f, " {} ", op.symbol())?;
                right.fmt_child(f, 5)
            }
            Expr::In {
                needle,
                haystack,
                negated,
            } => {
                needle.fmt_child(f, 5)?;
                f.write_str(if *negated { " NOT IN " } else { " IN " })?;
                haystack.fmt_child(f, 5)
            }
            Expr::IsNull { operand, negated } => {
                operand.fmt_child(f, 5)?;
                f.write_str(if *negated { " IS NOT NULL" } else { " IS NULL" })
            }
            Expr::Not(inner) => {
                f.write_str("NOT ")?;
                inner.fmt_child(f, 3)
            }
            Expr::And(items) => match items.as_slice() {
                [] => f.write_str("true"),
                [single] => write!(f, "{}", single),
                _ => {
                    for (i, item) in items.iter().enumerate() {
                        if i > 0 {
                            f.write_str(" AND ")?;
                        }
                        item.fmt_child(f, 3)?;
                    }
                    Ok(())
                }
            },
            Expr::Or(items) => match items.as_slice() {
                [] => f.write_str("false"),
                [single] => write!(f, "{}", single),
                _ => {
                    for (i, item) in items.iter().enumerate() {
                        if i > 0 {
                            f.write_str(" OR ")?;
                        }
                        item.fmt_child(f, 2)?;
                    }
                    Ok(())
                }
            },
        }
    }
}

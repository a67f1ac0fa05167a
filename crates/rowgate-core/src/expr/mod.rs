//! Policy expression language: lexer, parser, AST and evaluator.
//!
//! Expressions are written in a small SQL-like syntax:
//!
//! ```text
//! owner_id = auth.uid()
//! team_id IN claims.app_metadata.teams AND deleted_at IS NULL
//! NOT archived OR has_claim('app_metadata.admin')
//! ```

mod ast;
mod error;
mod eval;
mod lexer;
mod parser;

pub use ast::{CompareOp, Expr};
pub use error::{ParseError, Span};
pub use eval::Evaluator;
pub(crate) use eval::Truth;
pub use lexer::{tokenize, SpannedToken, Token};
pub use parser::{parse, Parser};

//! Error types.
//!
//! Configuration errors surface at registration time and always escape.
//! Evaluation errors never escape: they collapse to a deny.

use thiserror::Error;

use crate::expr::ParseError;
use crate::policy::Command;
use crate::value::ValueKind;

/// Raised when a policy or enforcement setting is registered.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// Policy name is empty.
    #[error("policy on '{collection}' has an empty name")]
    EmptyName {
        /// Target collection.
        collection: String,
    },

    /// Collection name is empty.
    #[error("policy '{policy}' has an empty collection name")]
    EmptyCollection {
        /// Policy name.
        policy: String,
    },

    /// A required expression is missing for the policy's command.
    #[error("policy '{policy}' for {command} requires a {clause} expression")]
    MissingExpression {
        /// Policy name.
        policy: String,
        /// Policy command.
        command: Command,
        /// `USING` or `WITH CHECK`.
        clause: &'static str,
    },

    /// An expression was supplied that the command never evaluates.
    #[error("policy '{policy}' for {command} does not accept a {clause} expression")]
    UnexpectedExpression {
        /// Policy name.
        policy: String,
        /// Policy command.
        command: Command,
        /// `USING` or `WITH CHECK`.
        clause: &'static str,
    },

    /// An UPDATE policy defined neither expression.
    #[error("UPDATE policy '{policy}' requires a USING or WITH CHECK expression")]
    EmptyUpdate {
        /// Policy name.
        policy: String,
    },

    /// An ALL policy defined exactly one of its two expressions.
    #[error("ALL policy '{policy}' must define both USING and WITH CHECK, or neither")]
    IncompleteAll {
        /// Policy name.
        policy: String,
    },

    /// Expression source failed to parse.
    #[error("policy '{policy}' has an invalid {clause} expression: {source}")]
    InvalidExpression {
        /// Policy name.
        policy: String,
        /// `USING` or `WITH CHECK`.
        clause: &'static str,
        /// The rejected expression text.
        expression: String,
        /// Underlying parse error.
        #[source]
        source: ParseError,
    },

    /// A literal has no expression text, so the policy cannot be stored.
    #[error("policy '{policy}' has a {clause} literal with no source form: {literal}")]
    UnprintableLiteral {
        /// Policy name.
        policy: String,
        /// `USING` or `WITH CHECK`.
        clause: &'static str,
        /// The offending literal.
        literal: String,
    },

    /// Unknown command keyword.
    #[error("unknown policy command: {0}")]
    UnknownCommand(String),

    /// Unknown enforcement mode keyword.
    #[error("unknown enforcement mode: {0}")]
    UnknownMode(String),

    /// Configuration file could not be read or decoded.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// A write was rejected by policy.
///
/// Expected and caller-visible; not a defect. The write must not be applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("row-level policy denied {command} on '{collection}'")]
pub struct DeniedError {
    /// Target collection.
    pub collection: String,
    /// Rejected command.
    pub command: Command,
}

/// Errors from the persistent policy catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Underlying storage failed.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Stored entry could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A stored policy failed validation when loaded.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

/// Crate-level error.
#[derive(Debug, Error)]
pub enum Error {
    /// Registration-time configuration error.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// Write denied by policy.
    #[error(transparent)]
    Denied(#[from] DeniedError),

    /// Policy catalog error.
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// Result type for rowgate operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Internal evaluation failure. Always collapses to `false`.
#[derive(Debug, Clone, PartialEq, Error)]
pub(crate) enum EvaluationError {
    /// Operands of incompatible kinds.
    #[error("type mismatch: cannot apply '{op}' to {left} and {right}")]
    TypeMismatch {
        op: &'static str,
        left: ValueKind,
        right: ValueKind,
    },

    /// A boolean was required.
    #[error("expected a boolean, found {0}")]
    NotBoolean(ValueKind),

    /// `IN` applied to something that is not a list.
    #[error("IN requires a list, found {0}")]
    NotAList(ValueKind),

    /// Referenced claim does not exist.
    #[error("missing claim: {0}")]
    MissingClaim(String),

    /// Claim path is syntactically invalid.
    #[error("malformed claim path: '{0}'")]
    MalformedPath(String),
}

//! Rowgate Core - row-level authorization policy engine.
//!
//! Given the acting principal's claims and a target collection, rowgate
//! decides which rows are visible and which writes are accepted:
//!
//! - [`ClaimsContext`]: identity, role and verified claims for one request.
//! - [`expr`]: the policy expression language and its evaluator.
//! - [`PolicyStore`]: versioned, copy-on-write registry of policies and modes.
//! - [`PolicyEngine`]: permissive-OR / restrictive-AND composition.
//! - [`AccessGate`]: read filtering and write authorization with bypass rules.
//! - [`PolicyCatalog`]: sled-backed persistence for policy sets.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use rowgate_core::{AccessGate, ClaimsContext, Command, Policy, PolicyStore, Row};
//!
//! let store = Arc::new(PolicyStore::new());
//! store
//!     .register(
//!         Policy::new("owner_can_read", "projects", Command::Select)
//!             .using_source("row.owner_id == claims.sub")
//!             .unwrap(),
//!     )
//!     .unwrap();
//!
//! let gate = AccessGate::new(store);
//! let ctx = ClaimsContext::new("u1", "authenticated").with_claim("sub", "u1");
//! let rows = vec![
//!     Row::new().with("owner_id", "u1"),
//!     Row::new().with("owner_id", "u2"),
//! ];
//! assert_eq!(gate.filter_read("projects", &ctx, rows).len(), 1);
//! ```

pub mod catalog;
pub mod claims;
pub mod config;
pub mod engine;
pub mod error;
pub mod expr;
pub mod gate;
pub mod metrics;
pub mod policy;
pub mod store;
pub mod value;

pub use catalog::PolicyCatalog;
pub use claims::{ClaimLookup, ClaimsContext, ANONYMOUS_ROLE, SERVICE_ROLE};
pub use config::EngineConfig;
pub use engine::{DecisionTrace, Outcome, PolicyEngine, PolicyOutcome, Pushdown};
pub use error::{CatalogError, ConfigurationError, DeniedError, Error, Result};
pub use expr::{parse, CompareOp, Evaluator, Expr, ParseError};
pub use gate::AccessGate;
pub use metrics::{GateMetrics, MetricsSnapshot};
pub use policy::{Command, Phase, Policy, PolicyDef, PolicyType, WriteCommand};
pub use store::{EnforcementMode, LockoutWarning, PolicyBundle, PolicySnapshot, PolicyStore};
pub use value::{Row, Value, ValueKind};

//! Enforcement entry point for collection operations.
//!
//! The gate resolves the collection's enforcement mode, applies the bypass
//! rule and then delegates to the policy engine. Reads return the visible
//! subset of the candidate rows; writes are accepted or rejected as a whole.
//!
//! Bypass rule: enforcement is skipped iff the principal is bypass-capable
//! and the collection is not `FORCED`. A `DISABLED` collection is never
//! enforced.

use std::sync::Arc;

use rayon::prelude::*;
use tracing::debug;

use crate::claims::ClaimsContext;
use crate::engine::PolicyEngine;
use crate::error::DeniedError;
use crate::metrics::GateMetrics;
use crate::policy::{Command, WriteCommand};
use crate::store::{EnforcementMode, PolicySnapshot, PolicyStore};
use crate::value::Row;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Enforcement {
    Enforced,
    /// The collection's mode is `DISABLED`.
    Disabled,
    /// A bypass-capable principal on a collection that is not `FORCED`.
    Bypassed,
}

/// Wraps reads and writes with row-level policy enforcement.
pub struct AccessGate {
    engine: PolicyEngine,
    metrics: GateMetrics,
}

impl AccessGate {
    /// Create a gate over a policy store.
    pub fn new(store: Arc<PolicyStore>) -> Self {
        Self::with_engine(PolicyEngine::new(store))
    }

    /// Create a gate over an existing engine.
    pub fn with_engine(engine: PolicyEngine) -> Self {
        Self {
            engine,
            metrics: GateMetrics::new(),
        }
    }

    /// The policy engine.
    pub fn engine(&self) -> &PolicyEngine {
        &self.engine
    }

    /// The policy store.
    pub fn store(&self) -> &Arc<PolicyStore> {
        self.engine.store()
    }

    /// Enforcement counters.
    pub fn metrics(&self) -> &GateMetrics {
        &self.metrics
    }

    /// Check if a request on a collection is subject to policies.
    pub fn is_enforced(&self, collection: &str, ctx: &ClaimsContext) -> bool {
        let snapshot = self.store().snapshot();
        self.enforcement(&snapshot, collection, ctx) == Enforcement::Enforced
    }

    /// Return the candidate rows the principal may read, in input order.
    pub fn filter_read(&self, collection: &str, ctx: &ClaimsContext, rows: Vec<Row>) -> Vec<Row> {
        let snapshot = self.store().snapshot();
        let examined = rows.len();

        if self.skipped(&snapshot, collection, ctx) {
            self.metrics.record_read(examined as u64, examined as u64);
            return rows;
        }

        let visible: Vec<Row> = if self.engine.config().is_parallel(examined) {
            rows.into_par_iter()
                .filter(|row| {
                    self.engine
                        .decide_in(&snapshot, collection, Command::Select, ctx, row)
                })
                .collect()
        } else {
            rows.into_iter()
                .filter(|row| {
                    self.engine
                        .decide_in(&snapshot, collection, Command::Select, ctx, row)
                })
                .collect()
        };

        debug!(
            collection = %collection,
            role = %ctx.role(),
            examined,
            visible = visible.len(),
            "Filtered read"
        );
        self.metrics
            .record_read(examined as u64, visible.len() as u64);
        visible
    }

    /// Authorize a write of `row`.
    ///
    /// INSERT checks the proposed row, DELETE qualifies the existing row and
    /// UPDATE applies both phases to the same row. Use
    /// [`authorize_update`](Self::authorize_update) when the pre-image is
    /// known.
    pub fn authorize_write(
        &self,
        collection: &str,
        ctx: &ClaimsContext,
        command: WriteCommand,
        row: &Row,
    ) -> Result<(), DeniedError> {
        let snapshot = self.store().snapshot();
        if self.skipped(&snapshot, collection, ctx) {
            self.metrics.record_write(command, true);
            return Ok(());
        }
        let allowed = self
            .engine
            .decide_in(&snapshot, collection, command.into(), ctx, row);
        self.finish_write(collection, ctx, command, allowed)
    }

    /// Authorize an update from `existing` to `proposed`.
    pub fn authorize_update(
        &self,
        collection: &str,
        ctx: &ClaimsContext,
        existing: &Row,
        proposed: &Row,
    ) -> Result<(), DeniedError> {
        let snapshot = self.store().snapshot();
        if self.skipped(&snapshot, collection, ctx) {
            self.metrics.record_write(WriteCommand::Update, true);
            return Ok(());
        }
        let allowed = self
            .engine
            .update_in(&snapshot, collection, ctx, existing, proposed);
        self.finish_write(collection, ctx, WriteCommand::Update, allowed)
    }

    fn finish_write(
        &self,
        collection: &str,
        ctx: &ClaimsContext,
        command: WriteCommand,
        allowed: bool,
    ) -> Result<(), DeniedError> {
        self.metrics.record_write(command, allowed);
        if allowed {
            return Ok(());
        }
        debug!(
            collection = %collection,
            command = %command,
            role = %ctx.role(),
            "Write denied by row-level policy"
        );
        Err(DeniedError {
            collection: collection.to_string(),
            command: command.into(),
        })
    }

    /// Check if enforcement is skipped, counting principal bypasses.
    fn skipped(&self, snapshot: &PolicySnapshot, collection: &str, ctx: &ClaimsContext) -> bool {
        match self.enforcement(snapshot, collection, ctx) {
            Enforcement::Enforced => false,
            Enforcement::Disabled => true,
            Enforcement::Bypassed => {
                self.metrics.record_bypass();
                true
            }
        }
    }

    fn enforcement(
        &self,
        snapshot: &PolicySnapshot,
        collection: &str,
        ctx: &ClaimsContext,
    ) -> Enforcement {
        let mode = snapshot.mode(collection, self.engine.config().default_mode);
        if !mode.enforces() {
            debug!(collection = %collection, "Row-level security disabled; skipping");
            return Enforcement::Disabled;
        }
        if ctx.is_bypass_capable() && mode != EnforcementMode::Forced {
            debug!(collection = %collection, role = %ctx.role(), "Bypass-capable principal; skipping");
            return Enforcement::Bypassed;
        }
        Enforcement::Enforced
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::policy::Policy;

    fn gate() -> AccessGate {
        let store = Arc::new(PolicyStore::new());
        store
            .register(
                Policy::new("owner_can_read", "projects", Command::Select)
                    .using_source("row.owner_id == claims.sub")
                    .unwrap(),
            )
            .unwrap();
        store
            .register(
                Policy::new("owner_can_insert", "projects", Command::Insert)
                    .check_source("owner_id = auth.uid()")
                    .unwrap(),
            )
            .unwrap();
        AccessGate::new(store)
    }

    fn rows() -> Vec<Row> {
        vec![
            Row::new().with("owner_id", "u1"),
            Row::new().with("owner_id", "u2"),
        ]
    }

    fn user() -> ClaimsContext {
        ClaimsContext::new("u1", "authenticated").with_claim("sub", "u1")
    }

    #[test]
    fn test_filter_read() {
        let gate = gate();
        let visible = gate.filter_read("projects", &user(), rows());
        assert_eq!(visible, vec![Row::new().with("owner_id", "u1")]);

        let s = gate.metrics().snapshot();
        assert_eq!((s.rows_examined, s.rows_visible), (2, 1));
    }

    #[test]
    fn test_bypass_and_forced() {
        let gate = gate();
        let admin = user().with_bypass(true);
        assert_eq!(gate.filter_read("projects", &admin, rows()).len(), 2);
        assert_eq!(gate.metrics().snapshot().bypassed, 1);

        gate.store()
            .set_mode("projects", EnforcementMode::Forced)
            .unwrap();
        assert_eq!(gate.filter_read("projects", &admin, rows()).len(), 1);
    }

    #[test]
    fn test_disabled_mode_skips() {
        let gate = gate();
        gate.store()
            .set_mode("projects", EnforcementMode::Disabled)
            .unwrap();
        let stranger = ClaimsContext::new("u9", "authenticated").with_claim("sub", "u9");
        assert_eq!(gate.filter_read("projects", &stranger, rows()).len(), 2);
        assert!(gate
            .authorize_write("projects", &stranger, WriteCommand::Delete, &rows()[0])
            .is_ok());
        assert_eq!(gate.metrics().snapshot().bypassed, 0);

        let admin = user().with_bypass(true);
        gate.filter_read("projects", &admin, rows());
        assert_eq!(gate.metrics().snapshot().bypassed, 0);
    }

    #[test]
    fn test_authorize_write() {
        let gate = gate();
        let ctx = user();
        assert!(gate
            .authorize_write("projects", &ctx, WriteCommand::Insert, &rows()[0])
            .is_ok());

        let err = gate
            .authorize_write("projects", &ctx, WriteCommand::Insert, &rows()[1])
            .unwrap_err();
        assert_eq!(err.collection, "projects");
        assert_eq!(err.command, Command::Insert);

        // No DELETE policy: locked out.
        assert!(gate
            .authorize_write("projects", &ctx, WriteCommand::Delete, &rows()[0])
            .is_err());

        let s = gate.metrics().snapshot();
        assert_eq!((s.writes_allowed, s.writes_denied, s.deletes_denied), (1, 2, 1));
    }

    #[test]
    fn test_authorize_update() {
        let store = Arc::new(PolicyStore::new());
        store
            .register(
                Policy::new("own", "projects", Command::Update)
                    .using_source("owner_id = auth.uid()")
                    .unwrap()
                    .check_source("owner_id = auth.uid()")
                    .unwrap(),
            )
            .unwrap();
        let gate = AccessGate::new(store);
        let ctx = user();
        let mine = Row::new().with("owner_id", "u1");
        let given_away = Row::new().with("owner_id", "u2");

        assert!(gate.authorize_update("projects", &ctx, &mine, &mine).is_ok());
        assert!(gate
            .authorize_update("projects", &ctx, &mine, &given_away)
            .is_err());
        assert!(gate
            .authorize_update("projects", &ctx, &given_away, &mine)
            .is_err());
    }

    #[test]
    fn test_parallel_filter_preserves_order() {
        let store = Arc::new(PolicyStore::with_config(
            EngineConfig::new().with_parallel_threshold(8),
        ));
        store
            .register(
                Policy::new("even", "items", Command::Select)
                    .using_source("parity = 0")
                    .unwrap(),
            )
            .unwrap();
        let gate = AccessGate::new(store);

        let rows: Vec<Row> = (0..1000i64)
            .map(|i| Row::new().with("id", i).with("parity", i % 2))
            .collect();
        let visible = gate.filter_read("items", &user(), rows);

        let ids: Vec<i64> = visible
            .iter()
            .filter_map(|r| match r.get("id") {
                Some(crate::value::Value::Int(i)) => Some(*i),
                _ => None,
            })
            .collect();
        let expected: Vec<i64> = (0..1000).step_by(2).collect();
        assert_eq!(ids, expected);
    }
}

//! Enforcement counters.
//!
//! All counters are lock-free atomics and safe to update from parallel
//! read filtering.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::policy::WriteCommand;

/// Counters maintained by the access gate.
#[derive(Debug, Default)]
pub struct GateMetrics {
    reads: AtomicU64,
    rows_examined: AtomicU64,
    rows_visible: AtomicU64,
    writes_allowed: AtomicU64,
    writes_denied: AtomicU64,
    inserts_denied: AtomicU64,
    updates_denied: AtomicU64,
    deletes_denied: AtomicU64,
    bypassed: AtomicU64,
}

/// Point-in-time copy of the gate counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub reads: u64,
    pub rows_examined: u64,
    pub rows_visible: u64,
    pub writes_allowed: u64,
    pub writes_denied: u64,
    pub inserts_denied: u64,
    pub updates_denied: u64,
    pub deletes_denied: u64,
    pub bypassed: u64,
}

impl GateMetrics {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a filtered read batch.
    pub fn record_read(&self, examined: u64, visible: u64) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.rows_examined.fetch_add(examined, Ordering::Relaxed);
        self.rows_visible.fetch_add(visible, Ordering::Relaxed);
    }

    /// Record a write decision.
    pub fn record_write(&self, command: WriteCommand, allowed: bool) {
        if allowed {
            self.writes_allowed.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.writes_denied.fetch_add(1, Ordering::Relaxed);
        let counter = match command {
            WriteCommand::Insert => &self.inserts_denied,
            WriteCommand::Update => &self.updates_denied,
            WriteCommand::Delete => &self.deletes_denied,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a call that skipped enforcement.
    pub fn record_bypass(&self) {
        self.bypassed.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            rows_examined: self.rows_examined.load(Ordering::Relaxed),
            rows_visible: self.rows_visible.load(Ordering::Relaxed),
            writes_allowed: self.writes_allowed.load(Ordering::Relaxed),
            writes_denied: self.writes_denied.load(Ordering::Relaxed),
            inserts_denied: self.inserts_denied.load(Ordering::Relaxed),
            updates_denied: self.updates_denied.load(Ordering::Relaxed),
            deletes_denied: self.deletes_denied.load(Ordering::Relaxed),
            bypassed: self.bypassed.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        for counter in [
            &self.reads,
            &self.rows_examined,
            &self.rows_visible,
            &self.writes_allowed,
            &self.writes_denied,
            &self.inserts_denied,
            &self.updates_denied,
            &self.deletes_denied,
            &self.bypassed,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Export to Prometheus text format.
    pub fn to_prometheus(&self) -> String {
        let s = self.snapshot();
        let mut out = String::new();

        out.push_str("# HELP rowgate_reads_total Filtered read batches\n");
        out.push_str("# TYPE rowgate_reads_total counter\n");
        out.push_str(&format!("rowgate_reads_total {}\n\n", s.reads));

        out.push_str("# HELP rowgate_rows_examined_total Candidate rows examined\n");
        out.push_str("# TYPE rowgate_rows_examined_total counter\n");
        out.push_str(&format!("rowgate_rows_examined_total {}\n\n", s.rows_examined));

        out.push_str("# HELP rowgate_rows_visible_total Rows returned by read filtering\n");
        out.push_str("# TYPE rowgate_rows_visible_total counter\n");
        out.push_str(&format!("rowgate_rows_visible_total {}\n\n", s.rows_visible));

        out.push_str("# HELP rowgate_writes_allowed_total Writes authorized\n");
        out.push_str("# TYPE rowgate_writes_allowed_total counter\n");
        out.push_str(&format!("rowgate_writes_allowed_total {}\n\n", s.writes_allowed));

        out.push_str("# HELP rowgate_writes_denied_total Writes denied by policy\n");
        out.push_str("# TYPE rowgate_writes_denied_total counter\n");
        out.push_str(&format!(
            "rowgate_writes_denied_total{{command=\"insert\"}} {}\n",
            s.inserts_denied
        ));
        out.push_str(&format!(
            "rowgate_writes_denied_total{{command=\"update\"}} {}\n",
            s.updates_denied
        ));
        out.push_str(&format!(
            "rowgate_writes_denied_total{{command=\"delete\"}} {}\n\n",
            s.deletes_denied
        ));

        out.push_str("# HELP rowgate_bypassed_total Calls skipped for a bypass-capable principal\n");
        out.push_str("# TYPE rowgate_bypassed_total counter\n");
        out.push_str(&format!("rowgate_bypassed_total {}\n", s.bypassed));

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let metrics = GateMetrics::new();
        metrics.record_read(10, 3);
        metrics.record_write(WriteCommand::Insert, true);
        metrics.record_write(WriteCommand::Update, false);
        metrics.record_bypass();

        let s = metrics.snapshot();
        assert_eq!(s.reads, 1);
        assert_eq!(s.rows_examined, 10);
        assert_eq!(s.rows_visible, 3);
        assert_eq!(s.writes_allowed, 1);
        assert_eq!(s.writes_denied, 1);
        assert_eq!(s.updates_denied, 1);
        assert_eq!(s.inserts_denied, 0);
        assert_eq!(s.bypassed, 1);

        metrics.reset();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = GateMetrics::new();
        metrics.record_read(4, 2);
        metrics.record_write(WriteCommand::Delete, false);

        let text = metrics.to_prometheus();
        assert!(text.contains("# TYPE rowgate_rows_examined_total counter"));
        assert!(text.contains("rowgate_rows_visible_total 2"));
        assert!(text.contains("rowgate_writes_denied_total{command=\"delete\"} 1"));
    }
}

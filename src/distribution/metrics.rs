//! Prometheus metrics for the control loop.
//!
//! Metrics cover relocation emission, audit lifecycle, snapshot outcomes,
//! and graph restarts — the events an operator needs to correlate cluster
//! churn with distributor decisions.
//!
//! # Safety
//!
//! All metrics are registered to a custom registry with the "shardwise"
//! prefix to avoid name collisions with other libraries using the default
//! Prometheus registry. Registration errors fall back to an unregistered
//! metric instead of panicking.

use once_cell::sync::Lazy;
use prometheus::{IntCounter, IntCounterVec, Opts, Registry};
use tracing::warn;

/// Custom Prometheus registry for distributor metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("shardwise".to_string()), None).unwrap_or_else(|_| Registry::new())
});

fn register_counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let counter = IntCounterVec::new(Opts::new(name, help), labels)
        .expect("static metric definition is well-formed");
    if let Err(e) = REGISTRY.register(Box::new(counter.clone())) {
        warn!(metric = name, error = %e, "failed to register metric");
    }
    counter
}

fn register_counter(name: &str, help: &str) -> IntCounter {
    let counter =
        IntCounter::new(name, help).expect("static metric definition is well-formed");
    if let Err(e) = REGISTRY.register(Box::new(counter.clone())) {
        warn!(metric = name, error = %e, "failed to register metric");
    }
    counter
}

/// Relocation work items emitted, by reason.
pub static RELOCATIONS_EMITTED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_counter_vec(
        "relocations_emitted_total",
        "Relocation work items emitted by the control core",
        &["reason"],
    )
});

/// Audits launched, by type.
pub static AUDITS_LAUNCHED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_counter_vec(
        "audits_launched_total",
        "Consistency audits launched",
        &["audit_type"],
    )
});

/// Audit supervisor retries.
pub static AUDIT_RETRIES: Lazy<IntCounter> = Lazy::new(|| {
    register_counter(
        "audit_retries_total",
        "Audit runs relaunched after a child failure",
    )
});

/// Snapshot attempts, by outcome.
pub static SNAPSHOTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_counter_vec(
        "snapshots_total",
        "Cluster snapshot attempts",
        &["outcome"],
    )
});

/// Steady-state graph teardowns followed by a rebuild.
pub static GRAPH_RESTARTS: Lazy<IntCounter> = Lazy::new(|| {
    register_counter(
        "graph_restarts_total",
        "Supervision-loop graph rebuilds after a recoverable error",
    )
});

pub(crate) fn relocation_emitted(reason: &str) {
    RELOCATIONS_EMITTED.with_label_values(&[reason]).inc();
}

pub(crate) fn audit_launched(audit_type: &str) {
    AUDITS_LAUNCHED.with_label_values(&[audit_type]).inc();
}

pub(crate) fn audit_retried() {
    AUDIT_RETRIES.inc();
}

pub(crate) fn snapshot_finished(outcome: &str) {
    SNAPSHOTS.with_label_values(&[outcome]).inc();
}

pub(crate) fn graph_restarted() {
    GRAPH_RESTARTS.inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_increment() {
        let before = RELOCATIONS_EMITTED
            .with_label_values(&["recover_move"])
            .get();
        relocation_emitted("recover_move");
        assert_eq!(
            RELOCATIONS_EMITTED
                .with_label_values(&["recover_move"])
                .get(),
            before + 1
        );

        let before = AUDIT_RETRIES.get();
        audit_retried();
        assert_eq!(AUDIT_RETRIES.get(), before + 1);
    }
}

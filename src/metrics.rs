//! Prometheus metrics for syscall enforcement
//!
//! Counters are fed from the userspace side only: the event consumer counts
//! confirmed kills per syscall, and the event channel counts records it had
//! to drop. The interception path itself never touches these. LSM guard
//! denials are counted in a kernel map and copied here on shutdown.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_int_counter, CounterVec,
    Encoder, Gauge, GaugeVec, IntCounter, TextEncoder,
};

use crate::ebpf::Denials;

lazy_static! {
    // ─────────────────────────────────────────────────────────────────────────────
    // Enforcement Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Confirmed kills, by syscall name.
    ///
    /// Incremented once per EventRecord received. Because the event channel
    /// is lossy this is a lower bound on the real number of kills.
    ///
    /// Labels:
    /// - syscall: Name of the blocked syscall (e.g., "mount", "ptrace")
    pub static ref ENFORCED_TOTAL: CounterVec = register_counter_vec!(
        "heimdall_enforced_total",
        "Processes killed for invoking a blocked syscall",
        &["syscall"]
    ).expect("failed to register ENFORCED_TOTAL metric");

    /// Event records lost between the interception point and the consumer.
    pub static ref EVENTS_DROPPED: IntCounter = register_int_counter!(
        "heimdall_events_dropped_total",
        "Enforcement events dropped because the channel was full or detached"
    ).expect("failed to register EVENTS_DROPPED metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Filter State Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Number of (syscall, cgroup) rules currently installed.
    pub static ref RULES_LOADED: Gauge = register_gauge!(
        "heimdall_rules_loaded",
        "Block rules currently installed in the filter map"
    ).expect("failed to register RULES_LOADED metric");

    /// Total denials by the LSM guard, mirrored from its per-CPU counters.
    ///
    /// Labels:
    /// - kind: "file_open" or "privilege"
    pub static ref LSM_DENIED: GaugeVec = register_gauge_vec!(
        "heimdall_lsm_denied_total",
        "Operations denied by the LSM guard",
        &["kind"]
    ).expect("failed to register LSM_DENIED metric");

    /// Whether the kernel program is attached (1) or not (0).
    pub static ref ENFORCEMENT_ENABLED: Gauge = register_gauge!(
        "heimdall_enforcement_enabled",
        "Whether the syscall blocking program is attached (1) or not (0)"
    ).expect("failed to register ENFORCEMENT_ENABLED metric");
}

/// Initialize metrics with default values.
///
/// Called during startup to ensure metrics exist in the registry.
pub fn init() {
    ENFORCEMENT_ENABLED.set(0.0);
    RULES_LOADED.set(0.0);
    let _ = EVENTS_DROPPED.get();
}

/// Mark the kernel program as attached or detached.
pub fn set_enabled(enabled: bool) {
    ENFORCEMENT_ENABLED.set(if enabled { 1.0 } else { 0.0 });
}

/// Update the count of installed rules.
pub fn set_rules_loaded(count: usize) {
    RULES_LOADED.set(count as f64);
}

/// Count one confirmed kill.
pub fn record_enforced(syscall_nr: u32) {
    ENFORCED_TOTAL
        .with_label_values(&[&crate::syscalls::display_name(syscall_nr)])
        .inc();
}

/// Mirror the guard's kernel-side denial counters.
pub fn set_denials(denials: &Denials) {
    LSM_DENIED
        .with_label_values(&["file_open"])
        .set(denials.file_open as f64);
    LSM_DENIED
        .with_label_values(&["privilege"])
        .set(denials.privilege as f64);
}

/// Count records lost in transport.
pub fn record_dropped(count: u64) {
    EVENTS_DROPPED.inc_by(count);
}

/// Render the default registry in the Prometheus text exposition format.
pub fn render() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

//! Prometheus metrics collection for tssd.
//!
//! Tracks enforcement throughput (warns, mutes, incidents), event dispatch
//! outcomes and sweep activity, exposed over the HTTP endpoint for scraping.

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

pub fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

/// Warns issued, labeled by the escalation they triggered ("none" when the
/// total stayed under every threshold).
pub static WARNS_ISSUED: OnceLock<IntCounterVec> = OnceLock::new();

/// Mutes applied, labeled by enforcement method.
pub static MUTES_APPLIED: OnceLock<IntCounterVec> = OnceLock::new();

/// Mutes lifted, labeled by cause (manual vs expired).
pub static MUTES_LIFTED: OnceLock<IntCounterVec> = OnceLock::new();

/// Antinuke incidents opened.
pub static INCIDENTS_OPENED: OnceLock<IntCounter> = OnceLock::new();

/// Containment actions recorded, labeled by kind.
pub static INCIDENT_ACTIONS: OnceLock<IntCounterVec> = OnceLock::new();

/// Events dispatched, labeled by event name and outcome code.
pub static EVENTS_HANDLED: OnceLock<IntCounterVec> = OnceLock::new();

/// Sweep passes run, labeled by sweep name.
pub static SWEEP_RUNS: OnceLock<IntCounterVec> = OnceLock::new();

/// Rows corrected by sweeps, labeled by sweep name.
pub static SWEEP_ITEMS: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize the Prometheus metrics registry.
///
/// Must be called once at daemon startup before any metrics are recorded.
pub fn init() {
    let r = registry();

    // Helper macro to register metric
    macro_rules! register {
        ($metric:ident, $init:expr) => {
            let m = $init.expect(concat!(stringify!($metric), " creation failed"));
            if let Err(e) = r.register(Box::new(m.clone())) {
                tracing::warn!(error = %e, concat!("Failed to register metric ", stringify!($metric)));
            }
            let _ = $metric.set(m);
        };
    }

    register!(
        WARNS_ISSUED,
        IntCounterVec::new(
            Opts::new("tss_warns_issued_total", "Warns issued by escalation outcome"),
            &["action"]
        )
    );
    register!(
        MUTES_APPLIED,
        IntCounterVec::new(
            Opts::new("tss_mutes_applied_total", "Mutes applied by method"),
            &["method"]
        )
    );
    register!(
        MUTES_LIFTED,
        IntCounterVec::new(
            Opts::new("tss_mutes_lifted_total", "Mutes lifted by cause"),
            &["cause"]
        )
    );
    register!(
        INCIDENTS_OPENED,
        IntCounter::new("tss_antinuke_incidents_total", "Antinuke incidents opened")
    );
    register!(
        INCIDENT_ACTIONS,
        IntCounterVec::new(
            Opts::new("tss_antinuke_actions_total", "Containment actions by kind"),
            &["kind"]
        )
    );
    register!(
        EVENTS_HANDLED,
        IntCounterVec::new(
            Opts::new("tss_events_total", "Dispatched events by name and outcome"),
            &["event", "result"]
        )
    );
    register!(
        SWEEP_RUNS,
        IntCounterVec::new(Opts::new("tss_sweep_runs_total", "Sweep passes by name"), &["sweep"])
    );
    register!(
        SWEEP_ITEMS,
        IntCounterVec::new(
            Opts::new("tss_sweep_items_total", "Rows corrected by sweeps"),
            &["sweep"]
        )
    );
}

/// Gather all metrics and encode them in Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode Prometheus metrics");
        return String::new();
    }
    match String::from_utf8(buffer) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "Prometheus metrics were not valid UTF-8");
            String::new()
        }
    }
}

/// Record an issued warn and the escalation it suggested.
#[inline]
pub fn record_warn_issued(action: Option<&str>) {
    if let Some(c) = WARNS_ISSUED.get() {
        c.with_label_values(&[action.unwrap_or("none")]).inc();
    }
}

/// Record an applied mute by method.
#[inline]
pub fn record_mute_applied(method: &str) {
    if let Some(c) = MUTES_APPLIED.get() {
        c.with_label_values(&[method]).inc();
    }
}

/// Record a lifted mute by cause.
#[inline]
pub fn record_mute_lifted(cause: &str) {
    if let Some(c) = MUTES_LIFTED.get() {
        c.with_label_values(&[cause]).inc();
    }
}

/// Record a newly opened incident.
#[inline]
pub fn record_incident_opened() {
    if let Some(c) = INCIDENTS_OPENED.get() {
        c.inc();
    }
}

/// Record a containment action by kind.
#[inline]
pub fn record_incident_action(kind: &str) {
    if let Some(c) = INCIDENT_ACTIONS.get() {
        c.with_label_values(&[kind]).inc();
    }
}

/// Record a dispatched event and its outcome code.
#[inline]
pub fn record_event(event: &str, result: &str) {
    if let Some(c) = EVENTS_HANDLED.get() {
        c.with_label_values(&[event, result]).inc();
    }
}

/// Record one sweep pass and how many rows it corrected.
#[inline]
pub fn record_sweep(sweep: &str, items: usize) {
    if let Some(c) = SWEEP_RUNS.get() {
        c.with_label_values(&[sweep]).inc();
    }
    if items > 0 {
        if let Some(c) = SWEEP_ITEMS.get() {
            c.with_label_values(&[sweep]).inc_by(items as u64);
        }
    }
}

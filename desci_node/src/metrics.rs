//! Prometheus metrics for the sync pipeline

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

// Metrics
lazy_static! {
    pub static ref RPC_RETRIES: IntCounterVec = IntCounterVec::new(
        Opts::new("desci_rpc_retries_total", "Failed RPC attempts that were retried or exhausted"),
        &["call"],
    )
    .unwrap();

    pub static ref EVENTS_PROJECTED: IntCounterVec = IntCounterVec::new(
        Opts::new("desci_events_projected_total", "Events applied to the read model"),
        &["event"],
    )
    .unwrap();

    pub static ref EVENTS_DUPLICATE: IntCounter = IntCounter::new(
        "desci_events_duplicate_total",
        "Events skipped because they were already applied",
    )
    .unwrap();

    pub static ref PROJECTION_CONFLICTS: IntCounterVec = IntCounterVec::new(
        Opts::new("desci_projection_conflicts_total", "Re-emitted keys whose content differs from the stored record"),
        &["entity"],
    )
    .unwrap();

    pub static ref DECODE_ERRORS: IntCounter = IntCounter::new(
        "desci_decode_errors_total",
        "Logs skipped because their payload could not be decoded",
    )
    .unwrap();

    pub static ref LISTENER_CHECKPOINT: IntGaugeVec = IntGaugeVec::new(
        Opts::new("desci_listener_checkpoint_block", "Last fully projected block per listener"),
        &["listener"],
    )
    .unwrap();

    pub static ref LISTENER_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("desci_listener_failures_total", "Failed sync iterations per listener"),
        &["listener"],
    )
    .unwrap();

    static ref REGISTRY: Registry = Registry::new();
}

/// Register all collectors. Safe to call more than once.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(RPC_RETRIES.clone()),
        Box::new(EVENTS_PROJECTED.clone()),
        Box::new(EVENTS_DUPLICATE.clone()),
        Box::new(PROJECTION_CONFLICTS.clone()),
        Box::new(DECODE_ERRORS.clone()),
        Box::new(LISTENER_CHECKPOINT.clone()),
        Box::new(LISTENER_FAILURES.clone()),
    ];
    for collector in collectors {
        match REGISTRY.register(collector) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Text exposition of every registered metric
pub fn gather_text() -> Result<String, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

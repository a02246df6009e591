use lazy_static::lazy_static;
use prometheus::{register_int_counter_vec_with_registry, Encoder, IntCounterVec, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref START_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec_with_registry!(
        "devbox_idler_start_requests_total",
        "Start requests by outcome.",
        &["outcome"],
        REGISTRY
    )
    .unwrap();
    pub static ref ALERT_MESSAGES_TOTAL: IntCounterVec = register_int_counter_vec_with_registry!(
        "devbox_idler_alert_messages_total",
        "Alert notification messages by outcome.",
        &["outcome"],
        REGISTRY
    )
    .unwrap();
    pub static ref INSTANCE_OPERATIONS_TOTAL: IntCounterVec = register_int_counter_vec_with_registry!(
        "devbox_idler_instance_operations_total",
        "Instance start/stop operations by action and result.",
        &["action", "result"],
        REGISTRY
    )
    .unwrap();
}

// Function to gather metrics for exposition
pub fn gather_metrics() -> String {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

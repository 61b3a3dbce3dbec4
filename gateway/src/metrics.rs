use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Histogram, HistogramOpts, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_telemetry_messages_total",
        "Total telemetry messages received from MQTT"
    ))
    .unwrap();
    pub static ref INVALID_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_invalid_messages_total",
        "Total inbound messages dropped as malformed"
    ))
    .unwrap();
    pub static ref STORED_RECORDS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_telemetry_stored_total",
        "Total telemetry records persisted"
    ))
    .unwrap();
    pub static ref DB_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_db_failures_total",
        "Total failed store writes"
    ))
    .unwrap();
    pub static ref INGEST_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "gateway_ingest_latency_seconds",
            "Time taken to normalize and persist one telemetry message"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
    pub static ref COMMANDS_SENT_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_commands_sent_total",
        "Total commands published to devices"
    ))
    .unwrap();
    pub static ref COMMAND_RESPONSES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_command_responses_total",
        "Total command responses that resolved a pending command"
    ))
    .unwrap();
    pub static ref ORPHANED_RESPONSES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_orphaned_responses_total",
        "Total command responses matching no known command"
    ))
    .unwrap();
    pub static ref BROKER_RECONNECTS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_broker_reconnects_total",
        "Total MQTT connection losses followed by a reconnect attempt"
    ))
    .unwrap();
}

pub fn init_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(INVALID_MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(STORED_RECORDS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DB_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(INGEST_LATENCY_SECONDS.clone()))?;
    REGISTRY.register(Box::new(COMMANDS_SENT_TOTAL.clone()))?;
    REGISTRY.register(Box::new(COMMAND_RESPONSES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ORPHANED_RESPONSES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(BROKER_RECONNECTS_TOTAL.clone()))?;
    Ok(())
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

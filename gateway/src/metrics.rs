use crate::errors::Result;
use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref CONNECTIONS_ACCEPTED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_mqtt_connections_accepted_total",
        "Total MQTT clients that completed the TLS handshake and CONNECT"
    ))
    .unwrap();
    pub static ref CONNECTIONS_REFUSED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_mqtt_connections_refused_total",
        "Total MQTT connections refused during TLS or CONNECT"
    ))
    .unwrap();
    pub static ref CONNECTED_CLIENTS: Gauge = Gauge::with_opts(Opts::new(
        "gateway_mqtt_connected_clients",
        "MQTT clients currently connected"
    ))
    .unwrap();
    pub static ref MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_mqtt_messages_total",
        "Total PUBLISH packets received from clients"
    ))
    .unwrap();
    pub static ref READINGS_INGESTED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_readings_ingested_total",
        "Total readings committed to the data store"
    ))
    .unwrap();
    pub static ref READINGS_REJECTED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_readings_rejected_total",
        "Total data-topic messages rejected by validation"
    ))
    .unwrap();
    pub static ref DB_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_db_failures_total",
        "Total data store failures while ingesting"
    ))
    .unwrap();
    pub static ref PERIPHERALS_REGISTERED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_peripherals_registered_total",
        "Total peripherals registered on first sight"
    ))
    .unwrap();
    pub static ref HTTP_REQUESTS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_http_requests_total",
        "Total HTTP requests received"
    ))
    .unwrap();
    pub static ref HTTP_FORBIDDEN_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_http_forbidden_total",
        "Total HTTP requests rejected for a bad API key"
    ))
    .unwrap();
    pub static ref HTTP_RATE_LIMITED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_http_rate_limited_total",
        "Total HTTP requests rejected by the rate limiter"
    ))
    .unwrap();
    pub static ref HTTP_PANICS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_http_panics_total",
        "Total HTTP handler panics recovered"
    ))
    .unwrap();
    pub static ref INGEST_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "gateway_ingest_latency_seconds",
            "Time taken to validate and store one reading"
        )
        .buckets(vec![
            0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5
        ])
    )
    .unwrap();
}

/// Registers every collector with [`REGISTRY`].
///
/// Safe to call more than once; collectors that are already registered are
/// skipped.
pub fn init_metrics() -> Result<()> {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(CONNECTIONS_ACCEPTED_TOTAL.clone()),
        Box::new(CONNECTIONS_REFUSED_TOTAL.clone()),
        Box::new(CONNECTED_CLIENTS.clone()),
        Box::new(MESSAGES_TOTAL.clone()),
        Box::new(READINGS_INGESTED_TOTAL.clone()),
        Box::new(READINGS_REJECTED_TOTAL.clone()),
        Box::new(DB_FAILURES_TOTAL.clone()),
        Box::new(PERIPHERALS_REGISTERED_TOTAL.clone()),
        Box::new(HTTP_REQUESTS_TOTAL.clone()),
        Box::new(HTTP_FORBIDDEN_TOTAL.clone()),
        Box::new(HTTP_RATE_LIMITED_TOTAL.clone()),
        Box::new(HTTP_PANICS_TOTAL.clone()),
        Box::new(INGEST_LATENCY_SECONDS.clone()),
    ];

    for collector in collectors {
        match REGISTRY.register(collector) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

pub fn gather_metrics() -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer)
        .map_err(|e| prometheus::Error::Msg(format!("metrics text is not UTF-8: {}", e)).into())
}

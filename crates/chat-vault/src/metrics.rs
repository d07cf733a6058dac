use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounterVec, IntGauge, Registry, TextEncoder};
use std::sync::OnceLock;
use tracing::error;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}
static REQ_COUNTER: OnceLock<IntCounterVec> = OnceLock::new();
static CONVERSATIONS_STORED: OnceLock<IntGauge> = OnceLock::new();

/// Registers the collectors. Only the first call registers anything.
pub fn init_metrics() -> prometheus::Result<()> {
    if REQ_COUNTER.get().is_none() {
        let counter = IntCounterVec::new(
            prometheus::opts!("requests_total", "Total requests per route"),
            &["route", "status"],
        )?;
        if REQ_COUNTER.set(counter.clone()).is_ok() {
            REGISTRY.register(Box::new(counter))?;
        }
    }

    if CONVERSATIONS_STORED.get().is_none() {
        let gauge = IntGauge::new("conversations_stored", "Conversations in the chat database")?;
        if CONVERSATIONS_STORED.set(gauge.clone()).is_ok() {
            REGISTRY.register(Box::new(gauge))?;
        }
    }
    Ok(())
}

pub fn inc_request(route: &str, status: StatusCode) {
    if let Some(counter) = REQ_COUNTER.get() {
        counter.with_label_values(&[route, status.as_str()]).inc();
    }
}

pub fn set_conversations(count: usize) {
    if let Some(gauge) = CONVERSATIONS_STORED.get() {
        gauge.set(i64::try_from(count).unwrap_or(i64::MAX));
    }
}

pub async fn get_metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return (StatusCode::INTERNAL_SERVER_ERROR, [(header::CONTENT_TYPE, "text/plain")], Vec::new());
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        buffer,
    )
}

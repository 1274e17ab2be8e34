//! Prometheus metrics for the completions gateway.
//!
//! Exposed at `/metrics`. Updated once per call when its audit is recorded.

use once_cell::sync::Lazy;
use prometheus::{
    opts, register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec,
    IntCounterVec, TextEncoder,
};

use crate::models::chat::TokenUsage;

pub struct CompletionMetrics {
    completions_total: IntCounterVec,
    tokens_total: IntCounterVec,
    duration_seconds: HistogramVec,
}

static METRICS: Lazy<CompletionMetrics> = Lazy::new(CompletionMetrics::register);

impl CompletionMetrics {
    fn register() -> Self {
        let completions_total = register_int_counter_vec!(
            opts!("wikigate_completions_total", "Total chat completion calls"),
            &["status_code", "error_kind", "stream"]
        )
        .expect("failed to register wikigate_completions_total");

        let tokens_total = register_int_counter_vec!(
            opts!("wikigate_completion_tokens_total", "Tokens reported by the chat engine"),
            &["type"]
        )
        .expect("failed to register wikigate_completion_tokens_total");

        let duration_seconds = register_histogram_vec!(
            prometheus::histogram_opts!(
                "wikigate_completion_duration_seconds",
                "Completion latency in seconds",
                vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
            ),
            &["status_code"]
        )
        .expect("failed to register wikigate_completion_duration_seconds");

        Self {
            completions_total,
            tokens_total,
            duration_seconds,
        }
    }
}

pub fn record_completion(
    status_code: u16,
    error_kind: &str,
    stream: bool,
    usage: &TokenUsage,
    latency_secs: f64,
) {
    let status = status_code.to_string();
    let kind = if error_kind.is_empty() { "none" } else { error_kind };
    let stream = if stream { "true" } else { "false" };

    METRICS
        .completions_total
        .with_label_values(&[status.as_str(), kind, stream])
        .inc();
    METRICS
        .duration_seconds
        .with_label_values(&[status.as_str()])
        .observe(latency_secs);

    for (label, n) in [
        ("prompt", usage.prompt_tokens),
        ("completion", usage.completion_tokens),
    ] {
        if n > 0 {
            METRICS.tokens_total.with_label_values(&[label]).inc_by(n as u64);
        }
    }
}

/// Text exposition of the default registry.
pub fn encode_metrics() -> anyhow::Result<String> {
    // touch the metrics so they are listed before the first call
    Lazy::force(&METRICS);
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

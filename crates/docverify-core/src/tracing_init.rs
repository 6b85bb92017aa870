//! Shared tracing/logging initialization.
//!
//! Sets up `tracing_subscriber` with an env-filter and optional JSON output.
//! Logs go to stderr; stdout carries the daemon's progress stream.
//! With the `metrics` feature, an `OpenTelemetry` layer can be stacked on top.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn env_filter(default_filter: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    )
}

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set
///   (e.g. `"docverify_daemon=info"`).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let env_filter = env_filter(default_filter);
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Opaque guard returned by [`init_tracing_with_metrics`].
///
/// Holds the OTLP providers when the `metrics` feature is enabled and an
/// endpoint was given; otherwise it is empty.
#[derive(Default)]
pub struct TelemetryGuard {
    #[cfg(feature = "metrics")]
    metrics: Option<crate::metrics::MetricsGuard>,
}

impl TelemetryGuard {
    /// Flush and shut down any exporters held by this guard.
    pub fn shutdown(self) {
        #[cfg(feature = "metrics")]
        if let Some(guard) = self.metrics
            && let Err(e) = guard.shutdown()
        {
            tracing::warn!(error = %e, "OpenTelemetry shutdown failed");
        }
    }
}

/// Initialise tracing and, when possible, the `OpenTelemetry` pipeline.
///
/// Without the `metrics` feature, or when `metrics_endpoint` is `None`, this is
/// equivalent to [`init_tracing`]. If the OTLP exporters cannot be built the
/// subscriber falls back to plain logging and a warning is emitted.
pub fn init_tracing_with_metrics(
    default_filter: &str,
    log_json: bool,
    metrics_endpoint: Option<&str>,
) -> TelemetryGuard {
    #[cfg(feature = "metrics")]
    if let Some(endpoint) = metrics_endpoint {
        match crate::metrics::init_metrics(endpoint) {
            Ok(guard) => {
                let otel_layer = tracing_opentelemetry::layer().with_tracer(guard.tracer());
                let filter = env_filter(default_filter);
                if log_json {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(otel_layer)
                        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                        .init();
                } else {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(otel_layer)
                        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                        .init();
                }
                tracing::info!(endpoint, "OpenTelemetry export enabled");
                return TelemetryGuard {
                    metrics: Some(guard),
                };
            }
            Err(e) => {
                init_tracing(default_filter, log_json);
                tracing::warn!(error = %e, endpoint, "OpenTelemetry init failed, logging only");
                return TelemetryGuard::default();
            }
        }
    }

    #[cfg(not(feature = "metrics"))]
    let _ = metrics_endpoint;

    init_tracing(default_filter, log_json);
    TelemetryGuard::default()
}

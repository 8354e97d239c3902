//! Logging and optional OpenTelemetry export
//!
//! Console logs always go through `tracing-subscriber`. When an OTLP
//! endpoint is configured, spans are also batched to a collector:
//!
//! ```text
//! heimdall → fmt layer (stderr, text or JSON)
//!          → OTLP (gRPC) → OTel Collector → Tempo / Loki
//! ```
//!
//! Set `RUST_LOG` to override the default filter.

use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, trace as sdktrace, Resource};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Filter used when `RUST_LOG` is unset
const DEFAULT_FILTER: &str = "info,heimdall=debug";

/// Initialize logging.
///
/// # Arguments
/// * `service_name` - Name reported to the collector
/// * `otlp_endpoint` - Collector URL; `None` keeps everything local
/// * `json` - Emit log lines as JSON instead of text
///
/// Must be called from inside a tokio runtime when `otlp_endpoint` is set.
pub fn init_tracing(
    service_name: &str,
    otlp_endpoint: Option<&str>,
    json: bool,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let otel_layer = match otlp_endpoint {
        Some(endpoint) => {
            let exporter = opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint);

            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(exporter)
                .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(
                    vec![
                        KeyValue::new("service.name", service_name.to_string()),
                        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                    ],
                )))
                .install_batch(runtime::Tokio)?;

            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    // Logs go to stderr so `--json` event lines own stdout
    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed()
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()?;

    match otlp_endpoint {
        Some(endpoint) => {
            tracing::info!(service = service_name, endpoint, "OpenTelemetry export enabled")
        }
        None => tracing::debug!(service = service_name, "logging initialized"),
    }

    Ok(())
}

/// Flush pending spans. A no-op when export was never enabled.
pub fn shutdown_tracing() {
    opentelemetry::global::shutdown_tracer_provider();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_parses() {
        assert!(DEFAULT_FILTER.parse::<EnvFilter>().is_ok());
    }

    #[test]
    fn test_second_init_fails() {
        // Either this call or an earlier one in the same process installs
        // the global subscriber; a repeat must report an error, not panic.
        let _ = init_tracing("heimdall-test", None, false);
        assert!(init_tracing("heimdall-test", None, true).is_err());
    }
}

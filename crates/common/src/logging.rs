use crate::config::{Environment, LogLevel};
use crate::telemetry::TelemetryGuard;
use opentelemetry::global;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global tracing subscriber.
///
/// Filtering comes from `RUST_LOG` when set, otherwise from `log_level`.
/// Development gets pretty ANSI output, production gets JSON lines.
///
/// The OpenTelemetry layer is always attached to the global tracer; it only
/// exports when a provider has been installed (see [`TelemetryGuard`]).
pub fn setup_logging(
    service_name: &str,
    log_level: LogLevel,
    environment: Environment,
) -> anyhow::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level.as_str()));

    let otel_layer =
        tracing_opentelemetry::layer().with_tracer(global::tracer(service_name.to_string()));

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(otel_layer);

    match environment {
        Environment::Production => {
            registry
                .with(tracing_subscriber::fmt::layer().json().with_level(true))
                .try_init()?;
        }
        Environment::Development => {
            registry
                .with(tracing_subscriber::fmt::layer().pretty().with_ansi(true))
                .try_init()?;
        }
    }

    Ok(())
}

/// Set up logging, and OTLP export when an endpoint is configured.
///
/// Keep the returned guard alive for the lifetime of the process so pending
/// spans and metrics are flushed on shutdown. Must run inside a Tokio runtime
/// when `otel_endpoint` is set.
pub fn init_observability(
    service_name: &str,
    otel_endpoint: Option<&str>,
    log_level: LogLevel,
    environment: Environment,
) -> anyhow::Result<Option<TelemetryGuard>> {
    let telemetry = otel_endpoint
        .map(|endpoint| TelemetryGuard::init(service_name, endpoint))
        .transpose()?;

    setup_logging(service_name, log_level, environment)?;

    if let Some(endpoint) = otel_endpoint {
        tracing::info!(endpoint, "OpenTelemetry export enabled");
    }

    Ok(telemetry)
}

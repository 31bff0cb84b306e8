use anyhow::Context;
use clap::Parser;
use gateway::{AccessGate, AppState, GatewayConfig, build_router};
use std::sync::Arc;
use tagger::{InterrogationService, ModelRegistry, TaggerConfig};
use tokio::net::TcpListener;

const SERVICE_NAME: &str = "gateway";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = GatewayConfig::parse();

    let _telemetry = common::init_observability(
        SERVICE_NAME,
        config.otel_endpoint.as_deref(),
        config.log_level,
        config.environment,
    )?;

    let tagger_config = TaggerConfig::from_env()?;
    let gate = AccessGate::from_config(config.api_auth.as_deref())
        .context("Invalid --api-auth value")?;

    let registry = Arc::new(ModelRegistry::new());
    register_models(&registry, &config, &tagger_config)?;
    if registry.is_empty() {
        tracing::warn!(models_dir = %config.models_dir.display(), "No interrogators registered");
    }

    let service = InterrogationService::new(Arc::clone(&registry), &tagger_config);
    let serialization = service.mode();
    let prefix = config.normalized_prefix();
    let app = build_router(
        AppState::new(service),
        gate.clone(),
        &prefix,
        config.max_body_bytes,
    );

    tracing::info!(
        listen = %config.listen,
        prefix = %prefix,
        models = registry.len(),
        auth = gate.is_required(),
        serialization = ?serialization,
        environment = config.environment.as_str(),
        "Tagger API starting"
    );

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Tagger API stopped");
    Ok(())
}

#[cfg(feature = "ort-backend")]
fn register_models(
    registry: &ModelRegistry,
    config: &GatewayConfig,
    tagger_config: &TaggerConfig,
) -> anyhow::Result<()> {
    use tagger::backend::ort::WaifuDiffusionInterrogator;

    let interrogators = WaifuDiffusionInterrogator::discover(
        &config.models_dir,
        tagger_config.input_size,
        tagger_config.execution_provider,
    )?;

    for interrogator in interrogators {
        tracing::info!(model = interrogator.name(), "Registered interrogator");
        registry.register(interrogator.name().to_string(), interrogator);
    }

    Ok(())
}

#[cfg(not(feature = "ort-backend"))]
fn register_models(
    _registry: &ModelRegistry,
    _config: &GatewayConfig,
    _tagger_config: &TaggerConfig,
) -> anyhow::Result<()> {
    tracing::warn!("Built without the `ort-backend` feature; no model backend available");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

use clap::Parser;
use common::{Environment, LogLevel};
use std::net::SocketAddr;
use std::path::PathBuf;

pub const DEFAULT_PREFIX: &str = "/tagger/v1";
pub const DEFAULT_MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

#[derive(Debug, Clone, Parser)]
#[command(name = "gateway")]
#[command(about = "HTTP interface for image tagging models", long_about = None)]
pub struct GatewayConfig {
    /// Comma-separated `user:password` pairs; empty disables authentication
    #[arg(long, env = "API_AUTH")]
    pub api_auth: Option<String>,

    /// Path prefix for every route
    #[arg(long, env = "TAGGER_PREFIX", default_value = DEFAULT_PREFIX)]
    pub prefix: String,

    #[arg(long, env = "TAGGER_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Directory holding one sub-directory per model
    #[arg(long, env = "TAGGER_MODELS_DIR", default_value = "models")]
    pub models_dir: PathBuf,

    /// Largest accepted request body, base64 included
    #[arg(long, env = "TAGGER_MAX_BODY_BYTES", default_value_t = DEFAULT_MAX_BODY_BYTES)]
    pub max_body_bytes: usize,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: LogLevel,

    /// OTLP collector endpoint; tracing stays local when unset
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub otel_endpoint: Option<String>,

    #[arg(long, env = "ENVIRONMENT", default_value = "development")]
    pub environment: Environment,
}

impl GatewayConfig {
    /// Prefix with a leading slash and no trailing one; `/` collapses to the root.
    pub fn normalized_prefix(&self) -> String {
        normalize_prefix(&self.prefix)
    }
}

pub fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{}", trimmed)
    }
}

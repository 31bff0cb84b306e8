pub mod auth;
pub mod config;
pub mod decode;
pub mod error;
pub mod routes;
pub mod state;

pub use auth::AccessGate;
pub use config::GatewayConfig;
pub use error::ApiError;
pub use routes::build_router;
pub use state::AppState;

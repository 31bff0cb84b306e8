pub mod backend;
pub mod config;
pub mod error;
pub mod filter;
pub mod registry;
pub mod service;

// Re-export commonly used types for convenience
pub use backend::{Interrogation, Interrogator, Scores};
pub use config::{ExecutionProvider, FilterConfig, SerializationMode, TaggerConfig};
pub use error::TaggerError;
pub use filter::{Caption, FilterPolicy, FilterRecord, FilterState, PassThrough, ThresholdPolicy};
pub use registry::{ModelHandle, ModelRegistry};
pub use service::InterrogationService;

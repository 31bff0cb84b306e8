use thiserror::Error;

#[derive(Error, Debug)]
pub enum TaggerError {
    #[error("Image not found")]
    ImageNotFound,

    #[error("Model not found")]
    ModelNotFound(String),

    #[error("Interrogation failed: {0}")]
    Engine(#[source] anyhow::Error),
}

use crate::config::ConfigError;
use crate::outcome::Stage;
use quotelake_core::buffer::BufferSubmissionError;
use quotelake_core::catalog::DdlError;
use quotelake_core::transform::TransformError;
use quotelake_core::validate::ValidationError;
use thiserror::Error;

/// Any failure that ends a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("setup failed: {0}")]
    Setup(String),

    #[error("no symbol could be fetched ({failed} failed)")]
    NothingFetched { failed: usize },

    #[error(transparent)]
    Buffer(#[from] BufferSubmissionError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Cleanup(#[from] DdlError),
}

impl PipelineError {
    /// The stage this error ends the run in.
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::Config(_) | PipelineError::Setup(_) => Stage::Setup,
            PipelineError::NothingFetched { .. } => Stage::Fetch,
            PipelineError::Buffer(_) => Stage::Buffer,
            PipelineError::Transform(_) => Stage::Transform,
            PipelineError::Validation(_) => Stage::Validate,
            PipelineError::Cleanup(_) => Stage::Cleanup,
        }
    }
}

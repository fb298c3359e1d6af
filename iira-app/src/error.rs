use thiserror::Error;

/// Why a resolution stage failed.
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("no applicable procedure found")]
    NotFound,

    #[error("planning failed: {0}")]
    PlanningFailure(String),

    #[error("script resolution failed: {0}")]
    ResolutionFailure(String),

    #[error("Failed to extract required parameters: {}.", missing.join(", "))]
    ParameterFailure { missing: Vec<String> },

    #[error("parameter extraction failed: {0}")]
    ExtractionFailure(String),

    #[error("execution failed: {0}")]
    ExecutionFailure(String),

    #[error("upstream call failed: {0}")]
    TransientUpstream(String),
}

impl ResolutionError {
    pub fn upstream(e: impl std::fmt::Display) -> Self {
        Self::TransientUpstream(e.to_string())
    }
}

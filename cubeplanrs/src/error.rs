use thiserror::Error;

pub type Result<T> = std::result::Result<T, CubePlanError>;

#[derive(Debug, Error)]
pub enum CubePlanError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("config error: {0}")]
    Config(String),
    /// A path, cube or join that the model cannot resolve.
    #[error("schema error: {0}")]
    Schema(String),
    /// A query shape the compiler refuses to compile.
    #[error("validation error: {0}")]
    Validation(String),
    #[error("pre-aggregation error: {0}")]
    PreAggregation(String),
    /// A dialect capability with no safe rendering for the target engine.
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// Broken compiler invariant. Never caused by user input.
    #[error("internal error: {0}")]
    Internal(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CubePlanError {
    /// Errors the API layer should report back to the caller as a bad request.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            CubePlanError::Schema(_)
                | CubePlanError::Validation(_)
                | CubePlanError::PreAggregation(_)
                | CubePlanError::Unsupported(_)
        )
    }
}

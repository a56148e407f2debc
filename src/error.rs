use thiserror::Error;

#[derive(Error, Debug)]
pub enum StateSpaceError {
    #[error("parameter length mismatch: expected {expected}, got {got}")]
    ParamLengthMismatch { expected: usize, got: usize },

    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("EM is not available for this model: {0}")]
    EmNotLegal(String),

    #[error("non-positive one-step prediction variance F[{t}] = {variance}")]
    NonPositivePredictionVariance { t: usize, variance: f64 },

    #[error("singular matrix: {0}")]
    SingularMatrix(String),

    #[error("data error: {0}")]
    DataError(String),

    #[error("optimization failed: {0}")]
    OptimizationFailed(String),
}

pub type Result<T> = std::result::Result<T, StateSpaceError>;

/// Errors surfaced by the tracking forward pass and the predictor.
#[derive(thiserror::Error, Debug)]
pub enum TapNetError {
    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, TapNetError>;

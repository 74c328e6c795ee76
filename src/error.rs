use thiserror::Error;

#[derive(Debug, Error)]
pub enum PrecmlError {
    #[error("base annotation column must be constant 1; block {block}, row {row} is {value}")]
    BaseAnnotationNotConstant {
        block: usize,
        row: usize,
        value: f64,
    },

    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("index out of range: {0}")]
    IndexOutOfRange(String),

    #[error("no blocks left to analyze after filtering")]
    NoBlocks,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, PrecmlError>;

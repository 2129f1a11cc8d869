use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Which half of the training step produced a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Encoder,
    Decoder,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Encoder => f.write_str("encoder"),
            Phase::Decoder => f.write_str("decoder"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("shape mismatch at `{layer}`: expected {expected:?}, got {actual:?}")]
    Shape {
        layer: String,
        expected: Vec<i64>,
        actual: Vec<i64>,
    },
    #[error("checkpoint is missing parameter `{0}`")]
    MissingParameter(String),
    #[error("checkpoint has unexpected parameter `{0}`")]
    UnexpectedParameter(String),
    #[error("checkpoint parameter `{name}` has shape {actual:?}, model expects {expected:?}")]
    ParameterShape {
        name: String,
        expected: Vec<i64>,
        actual: Vec<i64>,
    },
    #[error("{phase} loss is not finite ({value})")]
    NonFinite { phase: Phase, value: f64 },
    #[error(transparent)]
    Torch(#[from] tch::TchError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub(crate) fn config(msg: impl Into<String>) -> Error {
    Error::Config(msg.into())
}

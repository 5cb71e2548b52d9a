use thiserror::Error;

use crate::expr::CompileError;

/// Error taxonomy for the engine. The HTTP facade maps each variant onto a
/// status code: `Compile` and `BadInput` are 400, `OperationNotAllowed` is
/// 401, `InvalidName` is 422.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("eval exception: {0}")]
    Compile(#[from] CompileError),
    #[error("{0}")]
    BadInput(String),
    #[error("operation {op:?} not allowed for dataset {dataset:?}")]
    OperationNotAllowed { op: String, dataset: String },
    #[error("invalid dataset name {0:?}")]
    InvalidName(String),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn bad_input(message: impl Into<String>) -> Self {
        EngineError::BadInput(message.into())
    }
}

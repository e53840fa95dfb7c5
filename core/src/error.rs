//! Crate-level error type.
//!
//! Tensor-level failures surface as [`TensorError`] and are wrapped here; everything that can go
//! wrong while assembling a model or configuring the optimizer is a variant of [`Error`].

use crate::tensor::TensorError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Tensor(#[from] TensorError),

    /// Invalid or inconsistent model configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown optimizer strategy `{0}`")]
    UnknownStrategy(String),

    /// A strategy that needs an argument (`name:arg`) was given none.
    #[error("Strategy `{0}` requires an argument")]
    MissingArgument(String),

    #[error("Invalid threshold `{value}` for strategy `{strategy}`")]
    InvalidThreshold { strategy: String, value: String },

    /// A failure inside a named graph-construction scope.
    #[error("in scope `{scope}`: {source}")]
    Scope {
        scope: String,
        #[source]
        source: Box<Error>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Innermost error, skipping scope wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Error::Scope { source, .. } => source.root(),
            other => other,
        }
    }

    /// Scope names from the outermost to the innermost.
    pub fn scope_path(&self) -> Vec<&str> {
        let mut path = Vec::new();
        let mut current = self;
        while let Error::Scope { scope, source } = current {
            path.push(scope.as_str());
            current = source;
        }
        path
    }
}

impl From<safetensors::SafeTensorError> for Error {
    fn from(err: safetensors::SafeTensorError) -> Self {
        Error::Checkpoint(err.to_string())
    }
}

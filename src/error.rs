//! Library error type.

use std::path::PathBuf;

use thiserror::Error;

/// A sink consumer that did not finish cleanly.
#[derive(Debug, Clone)]
pub struct ConsumerFailure {
    /// Encoded instrumentation key of the failed sink.
    pub key: String,
    /// Rendered failure.
    pub message: String,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("shape mismatch in {context}: expected {expected}, got {actual}")]
    Shape {
        context: &'static str,
        expected: String,
        actual: String,
    },

    #[error("symbol '{0}' is not in the vocabulary")]
    UnknownSymbol(String),

    #[error("unknown instrument '{0}'")]
    UnknownInstrument(String),

    #[error("unknown parameter '{0}'")]
    UnknownParameter(String),

    #[error("model directory '{}' must not be a file", .0.display())]
    DirectoryIsFile(PathBuf),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("{} sink consumer(s) failed: {}", .0.len(), render_failures(.0))]
    Consumers(Vec<ConsumerFailure>),

    #[error("training diverged at epoch {epoch} (loss {loss})")]
    Diverged { epoch: usize, loss: f32 },

    #[error("producer for the {0} pass panicked")]
    Producer(&'static str),
}

impl Error {
    pub(crate) fn shape(
        context: &'static str,
        expected: impl ToString,
        actual: impl ToString,
    ) -> Self {
        Error::Shape {
            context,
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

fn render_failures(failures: &[ConsumerFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({})", f.key, f.message))
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, Error>;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum CorralError {
    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    /// Normalized machine-tool failure: whichever of the runner error's
    /// name/message/stderr were present, one per line.
    #[error("{details}")]
    Machine { details: String },

    /// Raw runner failure, passed through when there was nothing to normalize.
    #[error(transparent)]
    Run(#[from] RunError),

    #[error("connection host error: {message}")]
    Host { message: String },
}

/// Structured failure from one machine-tool invocation.
///
/// All three fields are optional: a spawn failure carries only a message, a
/// non-zero exit usually carries a message plus captured stderr, and a
/// failure surfaced by the tool itself may carry a name as well.
#[derive(Debug, Default, Error)]
#[error("{}", .message.as_deref().or(.name.as_deref()).unwrap_or("machine tool invocation failed"))]
pub struct RunError {
    pub name: Option<String>,
    pub message: Option<String>,
    pub stderr: Option<String>,
}

impl RunError {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::default()
        }
    }
}

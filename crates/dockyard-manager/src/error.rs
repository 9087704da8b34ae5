//! Error type for the manager.

/// The result type used throughout dockyard-manager.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while configuring or running the manager.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An environment variable or flag is missing or malformed.
    #[error("configuration error: {message}")]
    Configuration {
        /// Names the offending variable.
        message: String,
    },

    /// An upload was refused.
    #[error("upload refused: {message}")]
    UploadRefused {
        /// Why the upload was refused.
        message: String,
    },

    /// A local file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File that failed.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// An error from the core crate.
    #[error(transparent)]
    Core(#[from] dockyard_core::Error),

    /// An error from the pipeline.
    #[error(transparent)]
    Flow(#[from] dockyard_flow::Error),
}

impl Error {
    /// Creates a configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates an upload refusal.
    #[must_use]
    pub fn upload_refused(message: impl Into<String>) -> Self {
        Self::UploadRefused {
            message: message.into(),
        }
    }
}

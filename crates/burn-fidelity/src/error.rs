use std::path::PathBuf;

use thiserror::Error;

/// Error type for the [LPIPS](crate::lpips::Lpips) engine.
#[derive(Error, Debug)]
pub enum LpipsError {
    /// An input did not satisfy the contract of the operation.
    ///
    /// Raised before any network forward pass executes.
    #[error("Precondition violated: {0}")]
    Precondition(String),

    /// The configuration is invalid.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The pretrained weights could not be acquired.
    #[error(transparent)]
    Weights(#[from] WeightError),
}

/// Error type for pretrained weight acquisition.
#[derive(Error, Debug)]
pub enum WeightError {
    /// The HTTP request could not be completed.
    #[error("Failed to download `{url}`: {source}")]
    Download {
        /// Source URL.
        url: String,
        /// Underlying transport error.
        #[source]
        source: reqwest::Error,
    },

    /// The server answered with a non-success status.
    #[error("Failed to download `{url}`: HTTP status {status}")]
    Http {
        /// Source URL.
        url: String,
        /// Status code returned by the server.
        status: u16,
    },

    /// I/O operation error.
    #[error("I/O error: `{0}`")]
    Io(#[from] std::io::Error),

    /// A cached or downloaded blob does not hold the expected content.
    #[error("Corrupted weight file `{}`: {reason}", path.display())]
    Corrupt {
        /// Location of the offending file.
        path: PathBuf,
        /// What was detected.
        reason: String,
    },

    /// No cache root was configured and the platform has no user cache directory.
    #[error("Could not determine a cache directory, configure one explicitly")]
    NoCacheDir,
}

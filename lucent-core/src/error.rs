//! Error taxonomy for a prediction.
//!
//! Every variant is terminal for the request that raised it. Cached weights and
//! already-loaded pipelines stay intact for the next request.

use thiserror::Error;

use crate::dispatch::Mode;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Remote fetch or archive extraction failed.
    #[error("failed to download {identifier}: {reason}")]
    Download { identifier: String, reason: String },

    /// Fine-tune bundle is missing a required file or carries tensors that do
    /// not fit the backbone.
    #[error("invalid weight bundle {identifier}: {reason}")]
    InvalidBundle { identifier: String, reason: String },

    /// An adapter entry names a layer that maps to no backbone stage.
    #[error("unrecognized adapter layer {0:?}")]
    UnrecognizedLayer(String),

    /// Every generated image was flagged by the safety checker.
    #[error("NSFW content detected in all {count} outputs. Try running it again, or try a different prompt.")]
    AllOutputsRejected { count: usize },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0} mode is not supported by this backend")]
    UnsupportedMode(Mode),

    /// The safety classifier answered for a different number of images than
    /// it was given.
    #[error("safety checker returned {got} verdicts for {expected} images")]
    SafetyVerdicts { expected: usize, got: usize },

    #[error("{0} lock poisoned")]
    Poisoned(&'static str),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("tokenizer: {0}")]
    Tokenizer(String),
}

impl Error {
    pub(crate) fn download(identifier: &str, reason: impl ToString) -> Self {
        Self::Download {
            identifier: identifier.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn invalid_bundle(identifier: &str, reason: impl ToString) -> Self {
        Self::InvalidBundle {
            identifier: identifier.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether the failure is caused by the caller's input rather than by the
    /// server.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Self::InvalidRequest(_)
                | Self::AllOutputsRejected { .. }
                | Self::UnsupportedMode(_)
        )
    }
}

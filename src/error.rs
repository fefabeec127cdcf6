//! Error types surfaced by the driver.
//!
//! Mirrors the `#[error(transparent)]` / `#[from]` shape used for
//! `ColdVoxError` in the reference pack's `coldvox-foundation` crate, but
//! scoped to the three failure kinds spec.md assigns to this crate
//! (invalid-argument, runtime, propagated).

use thiserror::Error;

/// Failures the driver can return.
#[derive(Debug, Error)]
pub enum DriverError {
    /// A prompt batch violated one of the structural invariants in
    /// `PromptAnalyzer` (missing SOT, or `sot_index`/`prompt_length`
    /// disagreement across the batch), or a non-Whisper model was passed to
    /// the factory.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An operation was attempted that the loaded model does not support,
    /// e.g. `detect_language` on an English-only model.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// Propagated unmodified from a tensor/device/kernel failure.
    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    /// Propagated from the tokenizer.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// Propagated from model-file I/O (config/tokenizer/weights loading).
    #[error("model loading error: {0}")]
    ModelLoad(String),
}

pub type Result<T> = std::result::Result<T, DriverError>;

impl DriverError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::Runtime(msg.into())
    }
}

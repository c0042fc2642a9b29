//! Error types for ctxkeeper.
//!
//! One error hierarchy covers the whole session core. Variants carry the
//! counters involved so a failure can be diagnosed from its message alone.

use thiserror::Error;

use crate::backend::BackendError;
use crate::session::SessionPhase;

/// Result type alias using the ctxkeeper Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Where a decode failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStage {
    Prompt,
    Generation,
    Finalize,
    Sampling,
}

impl std::fmt::Display for DecodeStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DecodeStage::Prompt => "prompt",
            DecodeStage::Generation => "generation",
            DecodeStage::Finalize => "finalize",
            DecodeStage::Sampling => "sampling",
        };
        f.write_str(name)
    }
}

/// Main error type for ctxkeeper.
#[derive(Error, Debug)]
pub enum Error {
    /// An insertion would push the window past its capacity
    #[error("Window overflow: {occupied} occupied + {requested} requested exceeds capacity {capacity}")]
    WindowOverflow {
        occupied: usize,
        requested: usize,
        capacity: usize,
    },

    /// An eviction reached into the anchor or past the occupied span
    #[error("Invalid eviction of {count} tokens: only {evictable} are evictable")]
    InvalidEviction { count: usize, evictable: usize },

    /// The prompt does not fit even after pruning
    #[error("Prompt too large: {prompt_tokens} tokens with {occupied} occupied exceeds limit {limit}")]
    PromptTooLarge {
        prompt_tokens: usize,
        occupied: usize,
        limit: usize,
    },

    /// The prompt produced no tokens
    #[error("Prompt produced no tokens")]
    EmptyPrompt,

    /// The backend failed to decode
    #[error("Decode failed during {stage}: {source}")]
    DecodeFailed {
        stage: DecodeStage,
        #[source]
        source: BackendError,
    },

    /// No model is provisioned
    #[error("No active session")]
    NoActiveSession,

    /// Operation is not valid in the current phase
    #[error("Cannot {operation} while {phase}")]
    InvalidPhase {
        operation: &'static str,
        phase: SessionPhase,
    },

    /// A previous restore failed part way and left memory untrusted
    #[error("Session invalidated by a failed state restore")]
    SessionInvalidated,

    /// The backend did not consume the whole snapshot
    #[error("State mismatch: supplied {supplied} bytes, backend consumed {consumed}")]
    StateMismatch { supplied: usize, consumed: usize },

    /// The backend exposes no memory handle
    #[error("Backend memory handle unavailable")]
    MemoryUnavailable,

    /// Tokenizer failure
    #[error("Tokenization error: {0}")]
    Tokenization(#[from] BackendError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get a recovery suggestion for this error.
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            Error::PromptTooLarge { .. } => Some("Shorten the prompt or reset the conversation"),
            Error::EmptyPrompt => Some("Enter some text before submitting"),
            Error::DecodeFailed { .. } => Some("Retry the turn; the window is unchanged"),
            Error::NoActiveSession => Some("Load a model before starting a conversation"),
            Error::InvalidPhase { .. } => Some("Finalize the current turn first"),
            Error::SessionInvalidated | Error::StateMismatch { .. } => {
                Some("Load a valid snapshot or perform a full reset")
            }
            Error::Config(_) => Some("Check your config file at ~/.config/ctxkeeper/config.toml"),
            Error::Io(_) => Some("Check the snapshot path and its permissions"),
            _ => None,
        }
    }

    /// Errors that indicate a bookkeeping defect rather than bad input.
    pub fn is_logic_defect(&self) -> bool {
        matches!(self, Error::WindowOverflow { .. } | Error::InvalidEviction { .. })
    }

    /// Errors the caller can fix by changing the input.
    pub fn is_user_correctable(&self) -> bool {
        matches!(self, Error::PromptTooLarge { .. } | Error::EmptyPrompt)
    }

    /// Wrap a backend failure for the given stage.
    pub fn decode(stage: DecodeStage, source: BackendError) -> Self {
        Error::DecodeFailed { stage, source }
    }
}

/// Format an error with its recovery suggestion.
pub fn format_error_with_suggestion(error: &Error) -> String {
    let mut output = error.to_string();
    if let Some(suggestion) = error.recovery_suggestion() {
        output.push_str(&format!("\n  Suggestion: {}", suggestion));
    }
    output
}

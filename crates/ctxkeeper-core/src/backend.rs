//! Backend trait definitions.
//!
//! The session core never runs a forward pass, tokenizes text or samples a
//! token itself. Those jobs belong to an inference backend, which plugs in
//! through the traits below.

use thiserror::Error;

/// Vocabulary id of a single token.
pub type Token = i32;

/// Position of a token inside the context window.
pub type Position = i32;

/// Identifier of a logical sequence inside backend memory.
pub type SequenceId = i32;

/// Errors reported by backend implementations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    /// The decode call returned a non-zero status.
    #[error("decode returned status {0}")]
    Status(i32),

    /// Backend memory has no free cells for the batch.
    #[error("no space in backend memory: need {needed} cells, {available} free")]
    NoSpace { needed: usize, available: usize },

    /// No logits are available for sampling.
    #[error("no logits available for sampling")]
    MissingLogits,

    /// Tokenization failed.
    #[error("tokenization failed: {0}")]
    Tokenize(String),

    /// Anything else the backend wants to report.
    #[error("{0}")]
    Other(String),
}

/// One token slot in a decode batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchEntry {
    pub token: Token,
    pub position: Position,
    pub sequence: SequenceId,
    /// Whether the backend should produce logits for this position.
    pub logits: bool,
}

/// Reusable decode batch.
///
/// Allocated once at the window capacity when a session is provisioned and
/// cleared before every decode call.
#[derive(Debug, Clone)]
pub struct DecodeBatch {
    entries: Vec<BatchEntry>,
    capacity: usize,
}

impl DecodeBatch {
    /// Create an empty batch able to hold `capacity` entries without reallocating.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Maximum number of entries this batch was sized for.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop all entries, keeping the allocation.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Append a token. Returns `false` when the batch is full.
    pub fn push(&mut self, token: Token, position: Position, sequence: SequenceId, logits: bool) -> bool {
        if self.entries.len() >= self.capacity {
            return false;
        }
        self.entries.push(BatchEntry {
            token,
            position,
            sequence,
            logits,
        });
        true
    }

    /// Request logits for the last entry only.
    pub fn mark_last_for_sampling(&mut self) {
        for entry in &mut self.entries {
            entry.logits = false;
        }
        if let Some(last) = self.entries.last_mut() {
            last.logits = true;
        }
    }

    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Handle on backend key/value memory.
///
/// Ranges are half-open `[start, end)`; `end == None` means "to the end of
/// the sequence".
pub trait KvMemory {
    /// Remove the cells of `sequence` in the given position range.
    fn remove_range(&mut self, sequence: SequenceId, start: Position, end: Option<Position>) -> bool;

    /// Add `delta` to the position of every cell of `sequence` in the range.
    fn shift_positions(
        &mut self,
        sequence: SequenceId,
        start: Position,
        end: Option<Position>,
        delta: Position,
    );

    /// Highest position held for `sequence`, or `None` if it is empty.
    fn max_position(&self, sequence: SequenceId) -> Option<Position>;
}

/// Inference backend that owns model weights and memory.
pub trait ModelBackend: Send {
    /// Context window size in tokens.
    fn context_size(&self) -> usize;

    /// Run a forward pass over the batch, writing its tokens into memory.
    fn decode(&mut self, batch: &DecodeBatch) -> Result<(), BackendError>;

    /// Logits of the last position that requested them.
    fn logits(&self) -> Option<&[f32]>;

    /// Memory handle, if the backend exposes one.
    fn memory(&mut self) -> Option<&mut dyn KvMemory>;

    /// Size in bytes of the serialized state.
    fn state_size(&self) -> usize;

    /// Serialize the full memory state.
    fn state_bytes(&self) -> Vec<u8>;

    /// Restore state from a blob, returning the number of bytes consumed.
    fn set_state_bytes(&mut self, blob: &[u8]) -> usize;
}

/// Tokenizer and detokenizer for the loaded model.
pub trait Tokenizer: Send {
    fn tokenize(&self, text: &str) -> Result<Vec<Token>, BackendError>;

    /// Raw text bytes for a token. May be a partial UTF-8 sequence.
    fn token_to_piece(&self, token: Token) -> Vec<u8>;

    fn is_end_of_generation(&self, token: Token) -> bool;

    /// Token used to close a turn.
    fn end_of_generation_token(&self) -> Token;
}

/// Token sampler configured by the backend owner.
pub trait Sampler: Send {
    fn sample(&mut self, logits: &[f32]) -> Token;

    /// Feed the chosen token back (penalty history and similar state).
    fn accept(&mut self, token: Token);

    /// Return to the initial state.
    fn reset(&mut self);
}

/// Everything a session needs from a loaded model, owned in one place.
pub struct LoadedModel {
    /// Model name, used when naming snapshot files.
    pub name: String,
    pub backend: Box<dyn ModelBackend>,
    pub tokenizer: Box<dyn Tokenizer>,
    pub sampler: Box<dyn Sampler>,
}

impl LoadedModel {
    pub fn new(
        name: impl Into<String>,
        backend: Box<dyn ModelBackend>,
        tokenizer: Box<dyn Tokenizer>,
        sampler: Box<dyn Sampler>,
    ) -> Self {
        Self {
            name: name.into(),
            backend,
            tokenizer,
            sampler,
        }
    }
}

impl std::fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModel")
            .field("name", &self.name)
            .field("context_size", &self.backend.context_size())
            .finish_non_exhaustive()
    }
}

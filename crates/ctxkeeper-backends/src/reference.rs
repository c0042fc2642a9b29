//! Reference model backend.
//!
//! A deterministic stand-in for a real inference engine. It keeps a bounded
//! cache of cells and predicts the next token by recall: after the last
//! token, repeat whatever followed that token's most recent earlier
//! occurrence, or end the sequence if it never occurred before.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use ctxkeeper_core::{
    BackendError, DecodeBatch, KvMemory, ModelBackend, Position, SequenceId, Token,
};

use crate::cache::{Cell, KvCache};
use crate::tokenizer::{END_OF_SEQUENCE, VOCAB_SIZE};

/// Logit given to the recalled continuation.
const RECALL_LOGIT: f32 = 8.0;

/// Baseline logit for end-of-sequence when a continuation is recalled.
const EOS_BASELINE: f32 = 1.0;

/// Shared switch that makes upcoming decode calls fail.
#[derive(Debug, Clone, Default)]
pub struct FaultHandle(Arc<AtomicUsize>);

impl FaultHandle {
    /// Fail the next `count` decode calls.
    pub fn fail_next(&self, count: usize) {
        self.0.store(count, Ordering::SeqCst);
    }

    fn take(&self) -> bool {
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Serialized backend state.
#[derive(Debug, Serialize, Deserialize)]
struct StateImage {
    cache: KvCache,
    logits: Option<Vec<f32>>,
}

/// In-memory backend with a recall-based next-token rule.
#[derive(Debug)]
pub struct ReferenceBackend {
    context_size: usize,
    cache: KvCache,
    logits: Option<Vec<f32>>,
    faults: FaultHandle,
}

impl ReferenceBackend {
    pub fn new(context_size: usize) -> Self {
        Self {
            context_size,
            cache: KvCache::new(),
            logits: None,
            faults: FaultHandle::default(),
        }
    }

    /// Handle for injecting decode failures after the backend is boxed.
    pub fn fault_handle(&self) -> FaultHandle {
        self.faults.clone()
    }

    pub fn cache(&self) -> &KvCache {
        &self.cache
    }

    fn image(&self) -> StateImage {
        StateImage {
            cache: self.cache.clone(),
            logits: self.logits.clone(),
        }
    }

    /// Logits for the token following `token` at `position`.
    fn recall_logits(&self, sequence: SequenceId, position: Position, token: Token) -> Vec<f32> {
        let history = self.cache.sequence_tokens(sequence);
        let continuation = history
            .iter()
            .enumerate()
            .rev()
            .filter(|(_, cell)| cell.0 < position && cell.1 == token)
            .find_map(|(index, _)| history.get(index + 1))
            .map(|&(_, next)| next);

        let mut logits = vec![0.0; VOCAB_SIZE];
        match continuation {
            Some(next) => {
                logits[END_OF_SEQUENCE as usize] = EOS_BASELINE;
                if let Some(slot) = usize::try_from(next).ok().and_then(|i| logits.get_mut(i)) {
                    *slot = RECALL_LOGIT;
                }
            }
            None => logits[END_OF_SEQUENCE as usize] = RECALL_LOGIT,
        }
        logits
    }
}

impl ModelBackend for ReferenceBackend {
    fn context_size(&self) -> usize {
        self.context_size
    }

    fn decode(&mut self, batch: &DecodeBatch) -> Result<(), BackendError> {
        if self.faults.take() {
            warn!(tokens = batch.len(), "Injected decode failure");
            return Err(BackendError::Status(-1));
        }

        let available = self.context_size.saturating_sub(self.cache.len());
        if batch.len() > available {
            return Err(BackendError::NoSpace {
                needed: batch.len(),
                available,
            });
        }

        for entry in batch.entries() {
            self.cache.insert(Cell {
                token: entry.token,
                position: entry.position,
                sequence: entry.sequence,
            });
        }

        self.logits = batch
            .entries()
            .iter()
            .rev()
            .find(|e| e.logits)
            .map(|e| self.recall_logits(e.sequence, e.position, e.token));

        debug!(tokens = batch.len(), cells = self.cache.len(), "Decoded batch");
        Ok(())
    }

    fn logits(&self) -> Option<&[f32]> {
        self.logits.as_deref()
    }

    fn memory(&mut self) -> Option<&mut dyn KvMemory> {
        Some(&mut self.cache)
    }

    fn state_size(&self) -> usize {
        serde_json::to_vec(&self.image()).map_or(0, |bytes| bytes.len())
    }

    fn state_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&self.image()).unwrap_or_default()
    }

    fn set_state_bytes(&mut self, blob: &[u8]) -> usize {
        let mut stream = serde_json::Deserializer::from_slice(blob).into_iter::<StateImage>();
        let image = match stream.next() {
            Some(Ok(image)) => image,
            Some(Err(err)) => {
                warn!(%err, "Unreadable state image");
                return 0;
            }
            None => return 0,
        };
        if image.cache.len() > self.context_size {
            warn!(
                cells = image.cache.len(),
                context_size = self.context_size,
                "State image larger than context"
            );
            return 0;
        }

        self.cache = image.cache;
        self.logits = image.logits;
        stream.byte_offset()
    }
}

//! Turn orchestration over a loaded model.
//!
//! The controller owns the model, the window counters, the text decoder and
//! the reusable decode batch. Every public operation checks for a loaded
//! model first, then for the lifecycle phase it needs.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};

use ctxkeeper_core::{
    BackendError, ChatTemplate, Config, DecodeBatch, DecodeStage, Error, LoadedModel, Position,
    Result, SessionPhase, StopReason, WindowConfig, WindowUsage,
};

use crate::decoder::StreamDecoder;
use crate::pruning::{PruneOutcome, PruningPolicy};
use crate::snapshot;
use crate::tracker::WindowTracker;

/// Result of one `generate_next` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Generation {
    /// Newly completed text; empty while a character is still incomplete.
    Chunk(String),
    /// The turn produced its last token.
    Finished(StopReason),
}

impl Generation {
    /// The chunk text, or `None` once generation has stopped.
    pub fn into_text(self) -> Option<String> {
        match self {
            Generation::Chunk(text) => Some(text),
            Generation::Finished(_) => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Generation::Finished(_))
    }
}

/// Options for driving a whole turn.
#[derive(Debug, Clone)]
pub struct TurnOptions {
    /// Stop after this many generated tokens.
    pub max_tokens: Option<usize>,
    /// Stop once the response contains this text.
    pub stop_marker: Option<String>,
    /// Close the turn with an end-of-sequence marker.
    pub finalize: bool,
}

impl Default for TurnOptions {
    fn default() -> Self {
        Self {
            max_tokens: None,
            stop_marker: None,
            finalize: true,
        }
    }
}

impl TurnOptions {
    /// Options that stop when the model starts a new user turn on its own.
    pub fn for_template(template: ChatTemplate) -> Self {
        Self {
            stop_marker: Some(template.runaway_marker().to_string()),
            ..Default::default()
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn without_finalize(mut self) -> Self {
        self.finalize = false;
        self
    }
}

/// Summary of a completed turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// Concatenated response text.
    pub text: String,
    /// Tokens in the submitted prompt.
    pub prompt_tokens: usize,
    /// Tokens generated before stopping.
    pub generated_tokens: usize,
    pub stop_reason: StopReason,
    /// Pruning performed before the prompt was inserted.
    pub pruned: Option<PruneOutcome>,
}

/// Session controller for one conversation over one loaded model.
pub struct SessionController {
    window: WindowConfig,
    policy: PruningPolicy,
    tracker: WindowTracker,
    decoder: StreamDecoder,
    batch: DecodeBatch,
    model: Option<LoadedModel>,
    phase: SessionPhase,
    /// Set when a restore failed after the backend had been written to.
    invalidated: bool,
    last_prune: Option<PruneOutcome>,
}

impl SessionController {
    /// Create an unloaded controller.
    pub fn new(window: WindowConfig) -> Self {
        Self {
            policy: PruningPolicy::from_config(&window),
            tracker: WindowTracker::new(0, window.sequence_id),
            decoder: StreamDecoder::new(),
            batch: DecodeBatch::with_capacity(0),
            model: None,
            phase: SessionPhase::Unloaded,
            invalidated: false,
            last_prune: None,
            window,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.window.clone())
    }

    /// Create a controller and provision it in one step.
    pub fn with_model(window: WindowConfig, model: LoadedModel) -> Result<Self> {
        let mut controller = Self::new(window);
        controller.provision(model)?;
        Ok(controller)
    }

    /// Take ownership of a loaded model and start an empty session on it.
    ///
    /// Any previously provisioned model is released first.
    pub fn provision(&mut self, model: LoadedModel) -> Result<()> {
        self.unload();

        let capacity = model.backend.context_size();
        if capacity <= self.policy.overflow_margin() {
            return Err(Error::Config(format!(
                "context size {} leaves no room above the overflow margin {}",
                capacity,
                self.policy.overflow_margin()
            )));
        }
        if capacity != self.window.capacity {
            debug!(
                configured = self.window.capacity,
                backend = capacity,
                "Using the backend's context size"
            );
        }

        self.tracker.begin_session(capacity);
        self.batch = DecodeBatch::with_capacity(capacity);
        self.decoder.clear();
        info!(model = %model.name, capacity, "Model provisioned");
        self.model = Some(model);
        self.phase = SessionPhase::Ready;
        Ok(())
    }

    /// Tokenize and insert a prompt, starting a turn.
    ///
    /// Returns the number of prompt tokens inserted.
    pub fn submit_prompt(&mut self, text: &str) -> Result<usize> {
        self.ensure_usable("submit a prompt", &[SessionPhase::Ready])?;
        let model = self.model.as_mut().ok_or(Error::NoActiveSession)?;

        let tokens = model.tokenizer.tokenize(text)?;
        if tokens.is_empty() {
            return Err(Error::EmptyPrompt);
        }
        let first_insertion = self.tracker.occupied() == 0;

        self.last_prune =
            self.policy
                .make_room(&mut self.tracker, model.backend.memory(), tokens.len())?;

        let sequence = self.tracker.sequence_id();
        let base = self.tracker.next_position();
        self.batch.clear();
        for (offset, &token) in tokens.iter().enumerate() {
            if !self.batch.push(token, base + offset as Position, sequence, false) {
                return Err(Error::PromptTooLarge {
                    prompt_tokens: tokens.len(),
                    occupied: self.tracker.occupied(),
                    limit: self.batch.capacity(),
                });
            }
        }
        self.batch.mark_last_for_sampling();

        if let Err(source) = model.backend.decode(&self.batch) {
            error!(tokens = tokens.len(), %source, "Decode failed on prompt");
            return Err(Error::decode(DecodeStage::Prompt, source));
        }

        if first_insertion && self.tracker.set_anchor_if_unset(tokens.len()) {
            debug!(anchor = tokens.len(), "Anchored system prompt");
        }
        self.tracker.record_insertion(tokens.len())?;
        self.decoder.clear();
        self.phase = SessionPhase::Generating;

        debug!(
            tokens = tokens.len(),
            occupied = self.tracker.occupied(),
            "Prompt inserted"
        );
        Ok(tokens.len())
    }

    /// Sample, insert and decode one token of the current turn.
    pub fn generate_next(&mut self) -> Result<Generation> {
        self.ensure_usable("generate", &[SessionPhase::Generating])?;
        let model = self.model.as_mut().ok_or(Error::NoActiveSession)?;

        if self.tracker.is_full() {
            debug!(occupied = self.tracker.occupied(), "Window full, stopping generation");
            return Ok(Generation::Finished(StopReason::WindowFull));
        }

        let logits = model
            .backend
            .logits()
            .ok_or(Error::decode(DecodeStage::Sampling, BackendError::MissingLogits))?;
        let token = model.sampler.sample(logits);
        model.sampler.accept(token);

        if model.tokenizer.is_end_of_generation(token) {
            debug!(token, "End of generation");
            return Ok(Generation::Finished(StopReason::EndOfGeneration));
        }

        self.batch.clear();
        self.batch.push(
            token,
            self.tracker.next_position(),
            self.tracker.sequence_id(),
            true,
        );
        if let Err(source) = model.backend.decode(&self.batch) {
            error!(token, %source, "Decode failed during generation");
            return Err(Error::decode(DecodeStage::Generation, source));
        }
        self.tracker.record_insertion(1)?;

        let piece = model.tokenizer.token_to_piece(token);
        Ok(Generation::Chunk(self.decoder.feed(&piece)))
    }

    /// Close the current turn with an end-of-sequence marker.
    pub fn finalize_turn(&mut self) -> Result<()> {
        self.ensure_usable(
            "finalize a turn",
            &[SessionPhase::Generating, SessionPhase::Ready],
        )?;
        let model = self.model.as_mut().ok_or(Error::NoActiveSession)?;

        if self.tracker.is_full() {
            warn!("Window full, closing turn without an end-of-turn marker");
            self.phase = SessionPhase::Ready;
            return Ok(());
        }

        let marker = model.tokenizer.end_of_generation_token();
        self.batch.clear();
        self.batch.push(
            marker,
            self.tracker.next_position(),
            self.tracker.sequence_id(),
            false,
        );
        if let Err(source) = model.backend.decode(&self.batch) {
            error!(%source, "Decode failed in finalize_turn");
            return Err(Error::decode(DecodeStage::Finalize, source));
        }
        self.tracker.record_insertion(1)?;
        self.phase = SessionPhase::Ready;
        Ok(())
    }

    /// Drop the conversation back to the anchored system prompt.
    pub fn soft_reset(&mut self) -> Result<()> {
        self.ensure_usable("reset", &[SessionPhase::Ready])?;
        let model = self.model.as_mut().ok_or(Error::NoActiveSession)?;

        let anchor = self.tracker.anchor();
        if anchor == 0 {
            info!("No anchored prompt, nothing to reset");
            return Ok(());
        }

        let memory = model.backend.memory().ok_or(Error::MemoryUnavailable)?;
        memory.remove_range(self.tracker.sequence_id(), anchor as Position, None);
        self.tracker.rewind_to_anchor();
        model.sampler.reset();
        self.decoder.clear();

        info!(anchor, "Soft reset, system prompt preserved");
        Ok(())
    }

    /// Clear the whole sequence, anchor included.
    ///
    /// Also recovers a session invalidated by a failed restore.
    pub fn hard_reset(&mut self) -> Result<()> {
        let model = self.model.as_mut().ok_or(Error::NoActiveSession)?;

        let memory = model.backend.memory().ok_or(Error::MemoryUnavailable)?;
        memory.remove_range(self.tracker.sequence_id(), 0, None);
        let capacity = self.tracker.capacity();
        self.tracker.begin_session(capacity);
        model.sampler.reset();
        self.decoder.clear();
        self.invalidated = false;
        self.phase = SessionPhase::Ready;

        info!("Hard reset, window cleared");
        Ok(())
    }

    /// Run one turn over `system_prompt` so it becomes the anchor.
    pub fn prime(&mut self, system_prompt: &str) -> Result<TurnOutcome> {
        self.prime_with(system_prompt, &TurnOptions::default())
    }

    /// Like [`prime`](Self::prime), bounding the reply with `options`.
    pub fn prime_with(&mut self, system_prompt: &str, options: &TurnOptions) -> Result<TurnOutcome> {
        let outcome = self.run_turn(system_prompt, options)?;
        info!(
            anchor = self.tracker.anchor(),
            discarded = outcome.generated_tokens,
            "Primed system prompt"
        );
        Ok(outcome)
    }

    /// Submit a prompt and generate until a stop condition.
    ///
    /// On error the session stays in whichever phase the failing call left
    /// it; a failed generation step leaves the turn open for `finalize_turn`.
    pub fn run_turn(&mut self, prompt: &str, options: &TurnOptions) -> Result<TurnOutcome> {
        let prompt_tokens = self.submit_prompt(prompt)?;
        let pruned = self.last_prune;

        let mut text = String::new();
        let mut generated_tokens = 0;
        let stop_reason = loop {
            if options.max_tokens.map_or(false, |max| generated_tokens >= max) {
                break StopReason::MaxTokens;
            }
            match self.generate_next()? {
                Generation::Chunk(chunk) => {
                    generated_tokens += 1;
                    text.push_str(&chunk);
                    if let Some(marker) = options.stop_marker.as_deref() {
                        if text.contains(marker) {
                            break StopReason::RunawayMarker;
                        }
                    }
                }
                Generation::Finished(reason) => break reason,
            }
        };

        if options.finalize {
            self.finalize_turn()?;
        }

        Ok(TurnOutcome {
            text,
            prompt_tokens,
            generated_tokens,
            stop_reason,
            pruned,
        })
    }

    /// Write the backend state to `out`, returning the bytes written.
    pub fn save_state<W: Write>(&mut self, out: W) -> Result<usize> {
        let model = self.model.as_ref().ok_or(Error::NoActiveSession)?;
        if self.invalidated {
            return Err(Error::SessionInvalidated);
        }
        snapshot::save(model.backend.as_ref(), out)
    }

    /// Restore backend state from `input` and rebuild the window counters.
    pub fn load_state<R: Read>(&mut self, input: R) -> Result<usize> {
        let model = self.model.as_mut().ok_or(Error::NoActiveSession)?;

        match snapshot::load(model.backend.as_mut(), &mut self.tracker, input) {
            Ok(report) => {
                self.decoder.clear();
                self.invalidated = false;
                self.phase = SessionPhase::Ready;
                Ok(report.bytes)
            }
            // Reading failed before the backend saw any bytes.
            Err(err @ Error::Io(_)) => Err(err),
            Err(err) => {
                error!(%err, "State restore failed, session invalidated");
                self.invalidated = true;
                Err(err)
            }
        }
    }

    /// Save the backend state to a file, creating parent directories.
    pub fn save_state_to_path(&mut self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut writer = BufWriter::new(File::create(path)?);
        let written = self.save_state(&mut writer)?;
        writer.flush()?;
        info!(path = %path.display(), bytes = written, "Snapshot saved");
        Ok(written)
    }

    /// Load the backend state from a file.
    pub fn load_state_from_path(&mut self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path)?);
        let read = self.load_state(reader)?;
        info!(
            path = %path.display(),
            occupied = self.tracker.occupied(),
            "Snapshot loaded"
        );
        Ok(read)
    }

    /// Snapshot file path for a conversation under `dir`.
    pub fn snapshot_path(&self, dir: &Path, conversation_id: &str) -> Result<PathBuf> {
        let model = self.model.as_ref().ok_or(Error::NoActiveSession)?;
        Ok(snapshot::snapshot_path(dir, conversation_id, &model.name))
    }

    /// Release the model and return to `Unloaded`. Safe to call repeatedly.
    pub fn unload(&mut self) {
        if let Some(model) = self.model.take() {
            info!(model = %model.name, "Releasing model resources");
            drop(model);
        }
        self.tracker.begin_session(0);
        self.batch = DecodeBatch::with_capacity(0);
        self.decoder.clear();
        self.invalidated = false;
        self.last_prune = None;
        self.phase = SessionPhase::Unloaded;
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated
    }

    pub fn tracker(&self) -> &WindowTracker {
        &self.tracker
    }

    pub fn usage(&self) -> WindowUsage {
        self.tracker.usage()
    }

    pub fn policy(&self) -> &PruningPolicy {
        &self.policy
    }

    /// Pruning performed by the most recent prompt submission.
    pub fn last_prune(&self) -> Option<PruneOutcome> {
        self.last_prune
    }

    pub fn model_name(&self) -> Option<&str> {
        self.model.as_ref().map(|m| m.name.as_str())
    }

    fn ensure_usable(&self, operation: &'static str, allowed: &[SessionPhase]) -> Result<()> {
        if self.model.is_none() {
            return Err(Error::NoActiveSession);
        }
        if self.invalidated {
            return Err(Error::SessionInvalidated);
        }
        if !allowed.contains(&self.phase) {
            return Err(Error::InvalidPhase {
                operation,
                phase: self.phase,
            });
        }
        Ok(())
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.unload();
    }
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("phase", &self.phase)
            .field("tracker", &self.tracker)
            .field("model", &self.model)
            .field("invalidated", &self.invalidated)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctxkeeper_core::{KvMemory, ModelBackend, Sampler, SequenceId, Token, Tokenizer};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    const EOS: Token = 1000;

    /// Minimal backend: memory is a list of (position, token).
    struct StubBackend {
        capacity: usize,
        cells: Vec<(Position, Token)>,
        logits: Option<Vec<f32>>,
        fail_decodes: Arc<Mutex<usize>>,
    }

    impl KvMemory for StubBackend {
        fn remove_range(&mut self, _: SequenceId, start: Position, end: Option<Position>) -> bool {
            self.cells
                .retain(|&(p, _)| p < start || end.map_or(false, |e| p >= e));
            true
        }

        fn shift_positions(&mut self, _: SequenceId, start: Position, end: Option<Position>, delta: Position) {
            for (p, _) in &mut self.cells {
                if *p >= start && end.map_or(true, |e| *p < e) {
                    *p += delta;
                }
            }
        }

        fn max_position(&self, _: SequenceId) -> Option<Position> {
            self.cells.iter().map(|&(p, _)| p).max()
        }
    }

    impl ModelBackend for StubBackend {
        fn context_size(&self) -> usize {
            self.capacity
        }

        fn decode(&mut self, batch: &DecodeBatch) -> std::result::Result<(), BackendError> {
            let mut failures = self.fail_decodes.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(BackendError::Status(1));
            }
            for entry in batch.entries() {
                self.cells.push((entry.position, entry.token));
            }
            self.logits = Some(vec![0.0]);
            Ok(())
        }

        fn logits(&self) -> Option<&[f32]> {
            self.logits.as_deref()
        }

        fn memory(&mut self) -> Option<&mut dyn KvMemory> {
            Some(self)
        }

        fn state_size(&self) -> usize {
            self.cells.len() * 8
        }

        fn state_bytes(&self) -> Vec<u8> {
            self.cells
                .iter()
                .flat_map(|&(p, t)| p.to_le_bytes().into_iter().chain(t.to_le_bytes()))
                .collect()
        }

        fn set_state_bytes(&mut self, blob: &[u8]) -> usize {
            let chunks = blob.chunks_exact(8);
            let consumed = blob.len() - chunks.remainder().len();
            self.cells = chunks
                .map(|c| {
                    let p = Position::from_le_bytes([c[0], c[1], c[2], c[3]]);
                    let t = Token::from_le_bytes([c[4], c[5], c[6], c[7]]);
                    (p, t)
                })
                .collect();
            consumed
        }
    }

    /// One token per character byte.
    struct StubTokenizer;

    impl Tokenizer for StubTokenizer {
        fn tokenize(&self, text: &str) -> std::result::Result<Vec<Token>, BackendError> {
            Ok(text.bytes().map(Token::from).collect())
        }

        fn token_to_piece(&self, token: Token) -> Vec<u8> {
            if token == EOS {
                Vec::new()
            } else {
                vec![token as u8]
            }
        }

        fn is_end_of_generation(&self, token: Token) -> bool {
            token == EOS
        }

        fn end_of_generation_token(&self) -> Token {
            EOS
        }
    }

    struct StubSampler {
        script: VecDeque<Token>,
        resets: Arc<Mutex<usize>>,
    }

    impl Sampler for StubSampler {
        fn sample(&mut self, _: &[f32]) -> Token {
            self.script.pop_front().unwrap_or(EOS)
        }

        fn accept(&mut self, _: Token) {}

        fn reset(&mut self) {
            *self.resets.lock().unwrap() += 1;
        }
    }

    struct Harness {
        controller: SessionController,
        fail_decodes: Arc<Mutex<usize>>,
        resets: Arc<Mutex<usize>>,
    }

    fn harness(capacity: usize, script: &[u8]) -> Harness {
        let fail_decodes = Arc::new(Mutex::new(0));
        let resets = Arc::new(Mutex::new(0));
        let model = LoadedModel::new(
            "stub",
            Box::new(StubBackend {
                capacity,
                cells: Vec::new(),
                logits: None,
                fail_decodes: fail_decodes.clone(),
            }),
            Box::new(StubTokenizer),
            Box::new(StubSampler {
                script: script.iter().map(|&b| Token::from(b)).collect(),
                resets: resets.clone(),
            }),
        );
        let window = WindowConfig {
            capacity,
            reserve_margin: 2,
            overflow_margin: 1,
            sequence_id: 0,
        };
        Harness {
            controller: SessionController::with_model(window, model).unwrap(),
            fail_decodes,
            resets,
        }
    }

    #[test]
    fn test_operations_require_loaded_model() {
        let mut controller = SessionController::new(WindowConfig::default());
        assert_eq!(controller.phase(), SessionPhase::Unloaded);
        assert!(matches!(controller.submit_prompt("hi"), Err(Error::NoActiveSession)));
        assert!(matches!(controller.generate_next(), Err(Error::NoActiveSession)));
        assert!(matches!(controller.finalize_turn(), Err(Error::NoActiveSession)));
        assert!(matches!(controller.soft_reset(), Err(Error::NoActiveSession)));
        assert!(matches!(controller.save_state(Vec::new()), Err(Error::NoActiveSession)));
        assert!(matches!(controller.load_state(&b""[..]), Err(Error::NoActiveSession)));
    }

    #[test]
    fn test_first_prompt_becomes_anchor() {
        let mut h = harness(8, b"");
        assert_eq!(h.controller.submit_prompt("abc").unwrap(), 3);
        assert_eq!(h.controller.tracker().anchor(), 3);
        assert_eq!(h.controller.phase(), SessionPhase::Generating);

        assert_eq!(h.controller.generate_next().unwrap(), Generation::Finished(StopReason::EndOfGeneration));
        // Skip finalize so the window holds exactly the two prompts.
        h.controller.phase = SessionPhase::Ready;

        h.controller.submit_prompt("de").unwrap();
        assert_eq!(h.controller.tracker().occupied(), 5);
        assert_eq!(h.controller.tracker().anchor(), 3);
        assert!(h.controller.last_prune().is_none());
    }

    #[test]
    fn test_submit_rejected_while_generating() {
        let mut h = harness(32, b"xy");
        h.controller.submit_prompt("hi").unwrap();
        let err = h.controller.submit_prompt("again").unwrap_err();
        assert!(matches!(err, Error::InvalidPhase { phase: SessionPhase::Generating, .. }));
    }

    #[test]
    fn test_failed_prompt_decode_commits_nothing() {
        let mut h = harness(32, b"");
        *h.fail_decodes.lock().unwrap() = 1;

        let err = h.controller.submit_prompt("hello").unwrap_err();
        assert!(matches!(err, Error::DecodeFailed { stage: DecodeStage::Prompt, .. }));
        assert_eq!(h.controller.tracker().occupied(), 0);
        assert_eq!(h.controller.tracker().anchor(), 0);
        assert_eq!(h.controller.phase(), SessionPhase::Ready);

        // The retry anchors normally.
        h.controller.submit_prompt("hello").unwrap();
        assert_eq!(h.controller.tracker().anchor(), 5);
    }

    #[test]
    fn test_empty_prompt() {
        let mut h = harness(32, b"");
        assert!(matches!(h.controller.submit_prompt(""), Err(Error::EmptyPrompt)));
        assert_eq!(h.controller.phase(), SessionPhase::Ready);
    }

    #[test]
    fn test_end_of_generation_then_finalize() {
        let mut h = harness(32, b"");
        h.controller.submit_prompt("sys").unwrap();
        let step = h.controller.generate_next().unwrap();
        assert!(step.is_finished());
        assert_eq!(step.into_text(), None);
        assert_eq!(h.controller.tracker().occupied(), 3);

        h.controller.finalize_turn().unwrap();
        assert_eq!(h.controller.tracker().occupied(), 4);
        assert_eq!(h.controller.phase(), SessionPhase::Ready);
    }

    #[test]
    fn test_generation_streams_text() {
        let mut h = harness(64, b"ok!");
        let outcome = h.controller.run_turn("p", &TurnOptions::default()).unwrap();
        assert_eq!(outcome.text, "ok!");
        assert_eq!(outcome.generated_tokens, 3);
        assert_eq!(outcome.stop_reason, StopReason::EndOfGeneration);
        // prompt + three tokens + end-of-turn marker
        assert_eq!(h.controller.tracker().occupied(), 5);
    }

    #[test]
    fn test_window_full_stops_generation() {
        let mut h = harness(8, b"zzzzzzzzzz");
        h.controller.submit_prompt("abcde").unwrap();
        let mut chunks = Vec::new();
        loop {
            match h.controller.generate_next().unwrap() {
                Generation::Chunk(c) => chunks.push(c),
                Generation::Finished(reason) => {
                    assert_eq!(reason, StopReason::WindowFull);
                    break;
                }
            }
        }
        assert_eq!(chunks.len(), 3);
        assert!(h.controller.tracker().is_full());

        // No room for the marker, but the turn still closes.
        h.controller.finalize_turn().unwrap();
        assert_eq!(h.controller.phase(), SessionPhase::Ready);
        assert_eq!(h.controller.tracker().occupied(), 8);
    }

    #[test]
    fn test_soft_reset_rewinds_to_anchor() {
        let mut h = harness(64, b"abcdef");
        h.controller.run_turn("sys", &TurnOptions::default()).unwrap();
        assert!(h.controller.tracker().occupied() > 3);

        h.controller.soft_reset().unwrap();
        assert_eq!(h.controller.tracker().occupied(), 3);
        assert_eq!(*h.resets.lock().unwrap(), 1);
    }

    #[test]
    fn test_soft_reset_without_anchor_is_noop() {
        let mut h = harness(64, b"");
        h.controller.soft_reset().unwrap();
        assert_eq!(*h.resets.lock().unwrap(), 0);
    }

    #[test]
    fn test_hard_reset_clears_anchor() {
        let mut h = harness(64, b"");
        h.controller.run_turn("system", &TurnOptions::default()).unwrap();
        h.controller.hard_reset().unwrap();
        assert_eq!(h.controller.tracker().occupied(), 0);
        assert_eq!(h.controller.tracker().anchor(), 0);

        h.controller.submit_prompt("new").unwrap();
        assert_eq!(h.controller.tracker().anchor(), 3);
    }

    #[test]
    fn test_max_tokens_stops_turn() {
        let mut h = harness(64, b"abcdefgh");
        let options = TurnOptions::default().with_max_tokens(2).without_finalize();
        let outcome = h.controller.run_turn("p", &options).unwrap();
        assert_eq!(outcome.text, "ab");
        assert_eq!(outcome.stop_reason, StopReason::MaxTokens);
        assert_eq!(h.controller.phase(), SessionPhase::Generating);
    }

    #[test]
    fn test_runaway_marker_stops_turn() {
        let mut h = harness(64, b"hi<|user|>more");
        let options = TurnOptions::for_template(ChatTemplate::Zephyr);
        let outcome = h.controller.run_turn("p", &options).unwrap();
        assert_eq!(outcome.stop_reason, StopReason::RunawayMarker);
        assert_eq!(ChatTemplate::Zephyr.clean_response(&outcome.text), "hi");
        assert_eq!(h.controller.phase(), SessionPhase::Ready);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let mut h = harness(64, b"abc");
        h.controller.run_turn("sys", &TurnOptions::default()).unwrap();
        let occupied = h.controller.tracker().occupied();

        let mut blob = Vec::new();
        let written = h.controller.save_state(&mut blob).unwrap();
        assert_eq!(written, blob.len());

        h.controller.hard_reset().unwrap();
        h.controller.load_state(blob.as_slice()).unwrap();
        assert_eq!(h.controller.tracker().occupied(), occupied);
        assert_eq!(h.controller.tracker().anchor(), occupied);
    }

    #[test]
    fn test_truncated_snapshot_invalidates_session() {
        let mut h = harness(64, b"");
        h.controller.run_turn("sys", &TurnOptions::default()).unwrap();
        let mut blob = Vec::new();
        h.controller.save_state(&mut blob).unwrap();
        blob.push(0xAB);

        let err = h.controller.load_state(blob.as_slice()).unwrap_err();
        assert!(matches!(err, Error::StateMismatch { .. }));
        assert!(h.controller.is_invalidated());
        assert!(matches!(h.controller.submit_prompt("x"), Err(Error::SessionInvalidated)));

        h.controller.hard_reset().unwrap();
        assert!(!h.controller.is_invalidated());
        h.controller.submit_prompt("x").unwrap();
    }

    #[test]
    fn test_unload_is_idempotent() {
        let mut h = harness(16, b"");
        h.controller.unload();
        h.controller.unload();
        assert_eq!(h.controller.phase(), SessionPhase::Unloaded);
        assert!(!h.controller.is_loaded());
        assert!(matches!(h.controller.hard_reset(), Err(Error::NoActiveSession)));
    }
}

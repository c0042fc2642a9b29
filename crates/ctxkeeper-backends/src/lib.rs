//! # ctxkeeper-backends
//!
//! Deterministic in-memory implementations of the ctxkeeper backend traits.
//!
//! This crate provides:
//! - A byte-level tokenizer
//! - A bounded key/value cache with range removal and position shifting
//! - A recall-based reference backend with serializable state
//! - A configurable sampler chain and a scripted sampler for tests
//! - Model lookup by configured name

pub mod cache;
pub mod reference;
pub mod registry;
pub mod sampler;
pub mod tokenizer;

pub use cache::{Cell, KvCache};
pub use reference::{FaultHandle, ReferenceBackend};
pub use registry::{available_models, load_model, reference_model, REFERENCE_MODEL};
pub use sampler::{ChainSampler, ScriptedSampler};
pub use tokenizer::{ByteTokenizer, END_OF_SEQUENCE, VOCAB_SIZE};

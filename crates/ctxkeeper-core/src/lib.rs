//! # ctxkeeper-core
//!
//! Core types and abstractions for ctxkeeper, a context-window session
//! manager for local language-model backends.
//!
//! This crate provides:
//! - Backend, tokenizer and sampler traits
//! - Session lifecycle and window usage types
//! - Chat prompt templates
//! - Configuration system
//! - Common error types

pub mod backend;
pub mod config;
pub mod error;
pub mod session;
pub mod template;

pub use backend::{
    BackendError, BatchEntry, DecodeBatch, KvMemory, LoadedModel, ModelBackend, Position,
    Sampler, SequenceId, Token, Tokenizer,
};
pub use config::{
    Config, IssueSeverity, SamplerStage, SamplingConfig, ValidationIssue, ValidationResult,
    WindowConfig,
};
pub use error::{format_error_with_suggestion, DecodeStage, Error, Result};
pub use session::{SessionPhase, StopReason, WindowUsage};
pub use template::ChatTemplate;

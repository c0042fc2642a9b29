//! # ctxkeeper-session
//!
//! Context window management for a single conversation over a local model.
//!
//! This crate provides:
//! - Window occupancy tracking with a protected system-prompt anchor
//! - Sliding-window pruning that evicts the oldest non-anchored tokens
//! - Incremental UTF-8 reassembly of streamed token pieces
//! - The session controller that drives prompt, generation and finalize steps
//! - Backend state snapshots with window reconstruction
//! - An async streaming adapter for tokio callers
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ctxkeeper_core::{ChatTemplate, Config};
//! use ctxkeeper_session::{SessionController, TurnOptions};
//!
//! let config = Config::load()?;
//! let mut session = SessionController::with_model(config.window.clone(), model)?;
//!
//! let template = config.model.template;
//! session.prime(&template.system_block("You are terse."))?;
//!
//! let outcome = session.run_turn(
//!     &template.user_turn("hello"),
//!     &TurnOptions::for_template(template),
//! )?;
//! println!("{}", template.clean_response(&outcome.text));
//! ```
//!
//! ## Window Layout
//!
//! Positions `[0, anchor)` hold the system prompt and are never pruned.
//! Positions `[anchor, occupied)` hold conversation turns. When a prompt
//! would cross the reserve margin, a quarter of the conversation span is
//! evicted from the front and later positions shift down to close the gap.

pub mod controller;
pub mod decoder;
pub mod pruning;
pub mod snapshot;
pub mod stream;
pub mod tracker;

// Re-export commonly used types
pub use controller::{Generation, SessionController, TurnOptions, TurnOutcome};
pub use decoder::StreamDecoder;
pub use pruning::{EvictionPlan, PruneOutcome, PruningPolicy};
pub use snapshot::{snapshot_file_name, snapshot_path, RestoreReport};
pub use stream::{stream_turn, TurnStream};
pub use tracker::WindowTracker;

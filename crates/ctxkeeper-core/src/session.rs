//! Session lifecycle and window usage types.

use serde::{Deserialize, Serialize};

/// Session state in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    /// No model is provisioned
    Unloaded,
    /// Waiting for a prompt
    Ready,
    /// A turn is producing tokens
    Generating,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionPhase::Unloaded => "unloaded",
            SessionPhase::Ready => "ready",
            SessionPhase::Generating => "generating",
        };
        f.write_str(name)
    }
}

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The sampler produced an end-of-generation token
    EndOfGeneration,
    /// Every window position is occupied
    WindowFull,
    /// The caller's token limit was reached
    MaxTokens,
    /// The response started a new user turn on its own
    RunawayMarker,
}

/// Snapshot of window occupancy for display.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowUsage {
    /// Total window positions.
    pub capacity: usize,
    /// Positions currently holding tokens.
    pub occupied: usize,
    /// Protected leading positions.
    pub anchor: usize,
    /// Positions still free.
    pub free: usize,
    /// Occupied share of the window (0.0-1.0).
    pub usage_percent: f32,
}

impl WindowUsage {
    pub fn new(capacity: usize, occupied: usize, anchor: usize) -> Self {
        let usage_percent = if capacity == 0 {
            0.0
        } else {
            occupied as f32 / capacity as f32
        };
        Self {
            capacity,
            occupied,
            anchor,
            free: capacity.saturating_sub(occupied),
            usage_percent,
        }
    }
}

//! Backend state snapshots.
//!
//! A snapshot is the backend's opaque state blob written as-is. Restoring
//! one rebuilds the window counters from the highest position left in
//! backend memory, and the whole restored window becomes the anchor.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, error, info};

use ctxkeeper_core::{Error, ModelBackend, Result};

use crate::tracker::WindowTracker;

/// What a successful restore rebuilt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoreReport {
    /// Bytes read and accepted by the backend.
    pub bytes: usize,
    /// Occupied positions after the restore.
    pub occupied: usize,
}

/// File name for a conversation's snapshot under a given model.
///
/// Characters outside `[A-Za-z0-9._-]` are replaced so the name is safe on
/// every platform.
pub fn snapshot_file_name(conversation_id: &str, model_name: &str) -> String {
    format!(
        "conv_{}_{}_kvcache.bin",
        sanitize(conversation_id),
        sanitize(model_name)
    )
}

pub fn snapshot_path(dir: &Path, conversation_id: &str, model_name: &str) -> PathBuf {
    dir.join(snapshot_file_name(conversation_id, model_name))
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Write the backend's state blob to `out`.
pub fn save<W: Write>(backend: &dyn ModelBackend, mut out: W) -> Result<usize> {
    let blob = backend.state_bytes();
    debug!(
        expected = backend.state_size(),
        actual = blob.len(),
        "Serialized backend state"
    );
    out.write_all(&blob)?;
    out.flush()?;
    Ok(blob.len())
}

/// Read a state blob from `input`, hand it to the backend and rebuild `tracker`.
///
/// An I/O error means the backend was not touched. Any other error means
/// the backend may hold a partial state.
pub fn load<R: Read>(
    backend: &mut dyn ModelBackend,
    tracker: &mut WindowTracker,
    mut input: R,
) -> Result<RestoreReport> {
    let mut blob = Vec::new();
    input.read_to_end(&mut blob)?;
    debug!(
        bytes = blob.len(),
        capacity = backend.context_size(),
        "Restoring backend state"
    );

    let consumed = backend.set_state_bytes(&blob);
    if consumed != blob.len() {
        error!(supplied = blob.len(), consumed, "Backend rejected state blob");
        return Err(Error::StateMismatch {
            supplied: blob.len(),
            consumed,
        });
    }

    let sequence = tracker.sequence_id();
    let memory = backend.memory().ok_or(Error::MemoryUnavailable)?;
    let occupied = memory
        .max_position(sequence)
        .map_or(0, |max| max as usize + 1);
    tracker.restore(occupied, occupied)?;

    info!(occupied, "Window restored from snapshot");
    Ok(RestoreReport {
        bytes: blob.len(),
        occupied,
    })
}

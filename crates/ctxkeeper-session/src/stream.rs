//! Async streaming over a blocking session.
//!
//! Backend calls block, so a turn runs on tokio's blocking pool and hands
//! text chunks back through a bounded channel.

use std::pin::Pin;
use std::sync::Arc;

use futures::stream::{self, Stream};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use ctxkeeper_core::Result;

use crate::controller::{Generation, SessionController, TurnOptions};

/// Chunks buffered between the generating thread and the consumer.
const CHANNEL_CAPACITY: usize = 32;

/// A stream of response text chunks.
pub type TurnStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Run one turn in the background and stream its text.
///
/// Only non-empty chunks are yielded. Dropping the stream ends generation
/// after the step in progress. The turn is finalized (if `options.finalize`)
/// whenever generation stops without an error; an error is yielded as the
/// last item and leaves the turn open.
///
/// Must be called from within a tokio runtime.
pub fn stream_turn(
    controller: Arc<Mutex<SessionController>>,
    prompt: impl Into<String>,
    options: TurnOptions,
) -> TurnStream {
    let (tx, rx) = mpsc::channel::<Result<String>>(CHANNEL_CAPACITY);
    let prompt = prompt.into();

    tokio::task::spawn_blocking(move || {
        let mut session = controller.lock();
        if let Err(err) = drive_turn(&mut session, &prompt, &options, &tx) {
            let _ = tx.blocking_send(Err(err));
        }
    });

    Box::pin(stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }))
}

fn drive_turn(
    session: &mut SessionController,
    prompt: &str,
    options: &TurnOptions,
    tx: &mpsc::Sender<Result<String>>,
) -> Result<()> {
    session.submit_prompt(prompt)?;

    let mut text = String::new();
    let mut generated = 0usize;
    loop {
        if options.max_tokens.map_or(false, |max| generated >= max) {
            debug!(generated, "Token limit reached");
            break;
        }
        match session.generate_next()? {
            Generation::Chunk(chunk) => {
                generated += 1;
                if chunk.is_empty() {
                    continue;
                }
                text.push_str(&chunk);
                if tx.blocking_send(Ok(chunk)).is_err() {
                    debug!(generated, "Stream dropped, ending turn");
                    break;
                }
                if let Some(marker) = options.stop_marker.as_deref() {
                    if text.contains(marker) {
                        debug!(marker, "Runaway marker in output, ending turn");
                        break;
                    }
                }
            }
            Generation::Finished(reason) => {
                debug!(?reason, generated, "Turn finished");
                break;
            }
        }
    }

    if options.finalize {
        session.finalize_turn()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctxkeeper_backends::{ByteTokenizer, ReferenceBackend, ScriptedSampler};
    use ctxkeeper_core::{ChatTemplate, Error, LoadedModel, SessionPhase, WindowConfig};
    use futures::StreamExt;

    fn shared_session(capacity: usize, script: &str) -> Arc<Mutex<SessionController>> {
        let model = LoadedModel::new(
            "scripted",
            Box::new(ReferenceBackend::new(capacity)),
            Box::new(ByteTokenizer::new()),
            Box::new(ScriptedSampler::from_text(script)),
        );
        let window = WindowConfig {
            capacity,
            ..Default::default()
        };
        Arc::new(Mutex::new(
            SessionController::with_model(window, model).unwrap(),
        ))
    }

    #[tokio::test]
    async fn test_stream_collects_full_response() {
        let session = shared_session(512, "héllo wörld");
        let chunks: Vec<String> = stream_turn(session.clone(), "hi", TurnOptions::default())
            .map(|item| item.unwrap())
            .collect()
            .await;

        assert!(chunks.iter().all(|c| !c.is_empty()));
        assert_eq!(chunks.concat(), "héllo wörld");

        let session = session.lock();
        assert_eq!(session.phase(), SessionPhase::Ready);
        // prompt + generated bytes + end-of-turn marker
        assert_eq!(session.tracker().occupied(), 2 + "héllo wörld".len() + 1);
    }

    #[tokio::test]
    async fn test_stream_stops_at_runaway_marker() {
        let session = shared_session(512, "answer\n<|user|>\nmore text");
        let options = TurnOptions::for_template(ChatTemplate::Zephyr);
        let chunks: Vec<String> = stream_turn(session.clone(), "q", options)
            .map(|item| item.unwrap())
            .collect()
            .await;

        let raw = chunks.concat();
        assert!(raw.ends_with("<|user|>"));
        assert_eq!(ChatTemplate::Zephyr.clean_response(&raw), "answer");
        assert_eq!(session.lock().phase(), SessionPhase::Ready);
    }

    #[tokio::test]
    async fn test_dropping_stream_ends_turn() {
        let script = "x".repeat(200);
        let session = shared_session(1024, &script);
        let mut stream = stream_turn(session.clone(), "go", TurnOptions::default());

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first, "x");
        drop(stream);

        // The lock frees once the blocking task notices the closed channel.
        let session = tokio::task::spawn_blocking(move || {
            let guard = session.lock();
            (guard.phase(), guard.tracker().occupied())
        })
        .await
        .unwrap();
        assert_eq!(session.0, SessionPhase::Ready);
        assert!(session.1 < 2 + 200 + 1);
    }

    #[tokio::test]
    async fn test_error_is_last_item() {
        let session = shared_session(64, "unused");
        let items: Vec<Result<String>> = stream_turn(session, "", TurnOptions::default())
            .collect()
            .await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(Error::EmptyPrompt)));
    }
}

//! Interactive chat REPL.
//!
//! Provides a readline-style loop with:
//! - Input history
//! - Slash commands for resets, snapshots and window usage
//! - Streaming response display

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use uuid::Uuid;

use ctxkeeper_backends::load_model;
use ctxkeeper_core::{format_error_with_suggestion, ChatTemplate};
use ctxkeeper_session::{stream_turn, SessionController, TurnOptions};

use crate::{AppContext, ChatArgs};

mod commands;

/// Per-REPL settings shared with slash commands.
pub struct ChatState {
    pub conversation_id: String,
    pub template: ChatTemplate,
    pub system_prompt: Option<String>,
    pub max_tokens: usize,
    pub snapshot_path: PathBuf,
}

impl ChatState {
    pub fn turn_options(&self) -> TurnOptions {
        TurnOptions::for_template(self.template).with_max_tokens(self.max_tokens)
    }
}

/// Run the interactive REPL.
pub async fn run(args: ChatArgs, ctx: &AppContext) -> anyhow::Result<()> {
    let config = ctx.config.clone().into_validated()?;
    let model = load_model(&config)?;
    let controller = SessionController::with_model(config.window.clone(), model)?;

    let conversation_id = args
        .conversation
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let snapshot_path =
        controller.snapshot_path(&config.snapshot.resolve_directory(), &conversation_id)?;

    let state = ChatState {
        conversation_id,
        template: config.model.template,
        system_prompt: args
            .system
            .or_else(|| config.model.system_prompt.clone())
            .filter(|prompt| !prompt.trim().is_empty()),
        max_tokens: args.max_tokens,
        snapshot_path,
    };
    let session = Arc::new(Mutex::new(controller));

    if args.resume && state.snapshot_path.exists() {
        let bytes = session.lock().load_state_from_path(&state.snapshot_path)?;
        println!("[Restored {} bytes from {}]", bytes, state.snapshot_path.display());
    } else {
        prime(&session, &state)?;
    }

    print_welcome_banner(&state, &session.lock());

    let mut editor = DefaultEditor::new()?;
    let history_path = get_history_path();
    if history_path.exists() {
        let _ = editor.load_history(&history_path);
    }

    loop {
        match editor.readline(">>> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line);

                if line.starts_with('/') {
                    match commands::handle_command(line, &session, &state) {
                        commands::CommandResult::Continue => continue,
                        commands::CommandResult::Exit => break,
                        commands::CommandResult::Error(e) => {
                            eprintln!("Error: {}", e);
                            continue;
                        }
                    }
                }

                if let Err(e) = process_message(line, &session, &state).await {
                    eprintln!("Error: {}", e);
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("\nGoodbye!");
                break;
            }
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        }
    }

    if let Some(parent) = history_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let _ = editor.save_history(&history_path);

    session.lock().unload();
    Ok(())
}

/// Prime the window with the system prompt, if there is one.
pub(crate) fn prime(session: &Mutex<SessionController>, state: &ChatState) -> anyhow::Result<()> {
    if let Some(ref system) = state.system_prompt {
        let prompt = state.template.system_block(system);
        let outcome = session.lock().prime_with(&prompt, &state.turn_options())?;
        tracing::debug!(
            prompt_tokens = outcome.prompt_tokens,
            discarded = outcome.generated_tokens,
            "System prompt primed"
        );
    }
    Ok(())
}

/// Stream one reply to stdout.
async fn process_message(
    line: &str,
    session: &Arc<Mutex<SessionController>>,
    state: &ChatState,
) -> anyhow::Result<()> {
    let prompt = state.template.user_turn(line);
    let marker = state.template.runaway_marker();
    let mut stream = stream_turn(session.clone(), prompt, state.turn_options());

    let mut raw = String::new();
    let mut printed = 0;
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(text) => {
                raw.push_str(&text);
                let visible = visible_prefix(&raw, marker);
                if visible.len() > printed {
                    print!("{}", &visible[printed..]);
                    io::stdout().flush()?;
                    printed = visible.len();
                }
            }
            Err(e) => {
                println!();
                anyhow::bail!(format_error_with_suggestion(&e));
            }
        }
    }

    println!();
    Ok(())
}

/// The part of `raw` that can be shown without leaking `marker`.
///
/// Text from the marker on is hidden, and so is a trailing fragment that
/// could still grow into the marker.
fn visible_prefix<'a>(raw: &'a str, marker: &str) -> &'a str {
    if let Some(index) = raw.find(marker) {
        return &raw[..index];
    }
    for held in (1..marker.len()).rev() {
        if marker.is_char_boundary(held) && raw.ends_with(&marker[..held]) {
            return &raw[..raw.len() - held];
        }
    }
    raw
}

fn print_welcome_banner(state: &ChatState, session: &SessionController) {
    let usage = session.usage();
    println!("ctxkeeper {}", env!("CARGO_PKG_VERSION"));
    println!(
        "[Model: {} | Template: {} | Window: {}/{}]",
        session.model_name().unwrap_or("none"),
        state.template.name(),
        usage.occupied,
        usage.capacity
    );
    println!("[Conversation: {}]", state.conversation_id);
    println!("Type /help for commands, Ctrl+D to exit.");
    println!();
}

fn get_history_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ctxkeeper")
        .join("history.txt")
}

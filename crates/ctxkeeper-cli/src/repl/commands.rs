//! Slash command handling for the REPL.

use std::path::PathBuf;

use parking_lot::Mutex;

use ctxkeeper_core::{format_error_with_suggestion, WindowUsage};
use ctxkeeper_session::SessionController;

use super::ChatState;

/// Result of command execution.
pub enum CommandResult {
    /// Continue the REPL loop
    Continue,
    /// Exit the REPL
    Exit,
    /// An error occurred
    Error(String),
}

impl From<ctxkeeper_core::Error> for CommandResult {
    fn from(err: ctxkeeper_core::Error) -> Self {
        CommandResult::Error(format_error_with_suggestion(&err))
    }
}

/// Handle a slash command.
pub fn handle_command(
    input: &str,
    session: &Mutex<SessionController>,
    state: &ChatState,
) -> CommandResult {
    let parts: Vec<&str> = input.split_whitespace().collect();
    let command = parts.first().copied().unwrap_or("");
    let args = &parts[1..];

    match command {
        "/help" | "/h" | "/?" => {
            print_help();
            CommandResult::Continue
        }
        "/exit" | "/quit" | "/q" => {
            println!("Goodbye!");
            CommandResult::Exit
        }
        "/reset" => match session.lock().soft_reset() {
            Ok(()) => {
                println!("[Conversation cleared, system prompt kept]");
                CommandResult::Continue
            }
            Err(e) => e.into(),
        },
        "/hard-reset" => handle_hard_reset(session, state),
        "/save" => {
            let path = snapshot_target(args, state);
            match session.lock().save_state_to_path(&path) {
                Ok(bytes) => {
                    println!("[Saved {} bytes to {}]", bytes, path.display());
                    CommandResult::Continue
                }
                Err(e) => e.into(),
            }
        }
        "/load" => {
            let path = snapshot_target(args, state);
            let mut session = session.lock();
            match session.load_state_from_path(&path) {
                Ok(bytes) => {
                    println!(
                        "[Loaded {} bytes, {} tokens restored]",
                        bytes,
                        session.usage().occupied
                    );
                    CommandResult::Continue
                }
                Err(e) => e.into(),
            }
        }
        "/usage" => {
            println!("{}", format_usage(&session.lock().usage()));
            CommandResult::Continue
        }
        _ => CommandResult::Error(format!(
            "Unknown command: {}. Type /help for available commands.",
            command
        )),
    }
}

fn handle_hard_reset(session: &Mutex<SessionController>, state: &ChatState) -> CommandResult {
    if let Err(e) = session.lock().hard_reset() {
        return e.into();
    }
    // The anchor went with everything else, so prime again.
    if let Err(e) = super::prime(session, state) {
        return CommandResult::Error(e.to_string());
    }
    println!("[Window cleared]");
    CommandResult::Continue
}

/// Explicit path argument, or the conversation's snapshot file.
fn snapshot_target(args: &[&str], state: &ChatState) -> PathBuf {
    args.first()
        .map(PathBuf::from)
        .unwrap_or_else(|| state.snapshot_path.clone())
}

fn format_usage(usage: &WindowUsage) -> String {
    format!(
        "Window: {}/{} tokens ({:.1}%) | anchor: {} | free: {}",
        usage.occupied,
        usage.capacity,
        usage.usage_percent * 100.0,
        usage.anchor,
        usage.free
    )
}

/// Print help information.
fn print_help() {
    println!("Available commands:");
    println!();
    println!("  /help, /h, /?      Show this help message");
    println!("  /exit, /quit, /q   Exit the REPL");
    println!("  /reset             Clear the conversation, keep the system prompt");
    println!("  /hard-reset        Clear the whole window and prime again");
    println!("  /save [path]       Save the window state");
    println!("  /load [path]       Restore a saved window state");
    println!("  /usage             Show window usage");
    println!();
    println!("Tips:");
    println!("  - Press Ctrl+D to exit");
    println!("  - Start with --resume to restore this conversation's snapshot");
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctxkeeper_backends::{ByteTokenizer, ReferenceBackend, ScriptedSampler};
    use ctxkeeper_core::{ChatTemplate, LoadedModel, WindowConfig};
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> (Mutex<SessionController>, ChatState) {
        let model = LoadedModel::new(
            "reference",
            Box::new(ReferenceBackend::new(256)),
            Box::new(ByteTokenizer::new()),
            Box::new(ScriptedSampler::default()),
        );
        let window = WindowConfig {
            capacity: 256,
            reserve_margin: 16,
            overflow_margin: 4,
            sequence_id: 0,
        };
        let controller = SessionController::with_model(window, model).unwrap();
        let state = ChatState {
            conversation_id: "test".to_string(),
            template: ChatTemplate::Zephyr,
            system_prompt: Some("Be brief.".to_string()),
            max_tokens: 16,
            snapshot_path: dir.path().join("snap.bin"),
        };
        (Mutex::new(controller), state)
    }

    #[test]
    fn test_usage_format() {
        let usage = WindowUsage::new(200, 50, 10);
        let line = format_usage(&usage);
        assert!(line.contains("50/200"));
        assert!(line.contains("25.0%"));
        assert!(line.contains("anchor: 10"));
    }

    #[test]
    fn test_save_then_load_commands() {
        let dir = TempDir::new().unwrap();
        let (session, state) = setup(&dir);
        super::super::prime(&session, &state).unwrap();
        let occupied = session.lock().usage().occupied;

        assert!(matches!(handle_command("/save", &session, &state), CommandResult::Continue));
        assert!(state.snapshot_path.exists());

        assert!(matches!(handle_command("/hard-reset", &session, &state), CommandResult::Continue));
        assert!(matches!(handle_command("/load", &session, &state), CommandResult::Continue));
        assert_eq!(session.lock().usage().occupied, occupied);
    }

    #[test]
    fn test_load_missing_file_reports_error() {
        let dir = TempDir::new().unwrap();
        let (session, state) = setup(&dir);
        let missing = dir.path().join("missing.bin");
        let input = format!("/load {}", missing.display());
        assert!(matches!(handle_command(&input, &session, &state), CommandResult::Error(_)));
    }

    #[test]
    fn test_unknown_and_exit_commands() {
        let dir = TempDir::new().unwrap();
        let (session, state) = setup(&dir);
        assert!(matches!(handle_command("/bogus", &session, &state), CommandResult::Error(_)));
        assert!(matches!(handle_command("/quit", &session, &state), CommandResult::Exit));
    }
}

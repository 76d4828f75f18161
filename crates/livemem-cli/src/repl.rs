//! REPL – interactive question answering over a loaded memory state.
//!
//! Input handling:
//!   exit | quit     – leave the REPL (case insensitive; `/quit` and `/exit` work too)
//!   /stats          – print the current state summary
//!   /save [PATH]    – persist the extended state (default: the loaded file)
//!   /help           – show this list
//!   anything else   – a prompt; the answer is streamed after `Assistant:`
//!
//! Every answered prompt extends the in-memory state.  Nothing is written to
//! disk unless `/save` is used.

use colored::Colorize;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use livemem_memory::{MemoryState, persist};
use livemem_model::{ByteTokenizer, SequenceModel};
use livemem_runtime::{Session, StopReason};
use livemem_types::{LiveMemError, TokenId};
use tracing::debug;

// ─────────────────────────────────────────────────────────────────────────────
// Command parsing
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    Quit,
    Help,
    Stats,
    Save(Option<&'a str>),
    Unknown(&'a str),
    Prompt(&'a str),
}

fn parse_command(input: &str) -> Command<'_> {
    let input = input.trim();
    if input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit") {
        return Command::Quit;
    }
    let Some(rest) = input.strip_prefix('/') else {
        return Command::Prompt(input);
    };
    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, Some(arg.trim()).filter(|a| !a.is_empty())),
        None => (rest, None),
    };
    match name {
        "quit" | "exit" => Command::Quit,
        "help" => Command::Help,
        "stats" => Command::Stats,
        "save" => Command::Save(arg),
        _ => Command::Unknown(input),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Streaming output
// ─────────────────────────────────────────────────────────────────────────────

/// Turns byte tokens into printable text without splitting a UTF-8 sequence
/// across two writes.
#[derive(Debug, Default)]
struct Utf8Stream {
    pending: Vec<u8>,
}

impl Utf8Stream {
    /// Text that became printable after `token`.  Special tokens print nothing.
    fn push(&mut self, token: TokenId) -> String {
        let Ok(byte) = u8::try_from(token) else {
            return String::new();
        };
        self.pending.push(byte);
        match std::str::from_utf8(&self.pending) {
            Ok(text) => {
                let out = text.to_string();
                self.pending.clear();
                out
            }
            // incomplete sequence, wait for more bytes
            Err(e) if e.error_len().is_none() => String::new(),
            Err(_) => self.finish(),
        }
    }

    /// Flush whatever is left, replacing invalid bytes.
    fn finish(&mut self) -> String {
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        out
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// REPL
// ─────────────────────────────────────────────────────────────────────────────

/// Entry point for the interactive REPL.
///
/// `shutdown` is polled before every prompt; when set the REPL exits cleanly.
pub fn run(
    model: &dyn SequenceModel,
    state: MemoryState,
    state_path: &Path,
    max_new_tokens: usize,
    shutdown: Arc<AtomicBool>,
) -> Result<(), LiveMemError> {
    let mut editor = DefaultEditor::new().map_err(|e| LiveMemError::Io(e.to_string()))?;
    let mut session = Session::new(model, Some(state))
        .max_new_tokens(max_new_tokens)
        .eot_token(ByteTokenizer::EOT);
    let mut unsaved_turns = 0usize;

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        let line = match editor.readline(&format!("{} ", "You:".bold().cyan())) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(e) => return Err(LiveMemError::Io(format!("read error: {e}"))),
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        editor.add_history_entry(input).ok();

        match parse_command(input) {
            Command::Quit => break,
            Command::Help => cmd_help(),
            Command::Stats => cmd_stats(&session, unsaved_turns),
            Command::Save(path) => {
                let target = path.map_or_else(|| state_path.to_path_buf(), PathBuf::from);
                if cmd_save(&session, &target) {
                    unsaved_turns = 0;
                }
            }
            Command::Unknown(cmd) => println!(
                "{} '{}'. Type {} for available commands.",
                "Unknown command:".red(),
                cmd.yellow(),
                "/help".bold()
            ),
            Command::Prompt(prompt) => {
                if answer(&mut session, prompt) {
                    unsaved_turns += 1;
                }
            }
        }
    }

    if unsaved_turns > 0 {
        println!(
            "  {} {} turn(s) not saved; the file at {} is unchanged.",
            "Note:".yellow(),
            unsaved_turns,
            state_path.display().to_string().bold()
        );
    }
    println!("{}", "Goodbye.".green());
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Command handlers
// ─────────────────────────────────────────────────────────────────────────────

/// Run one turn and stream the answer.  Returns true when the state changed.
fn answer(session: &mut Session<'_>, prompt: &str) -> bool {
    let tokens = ByteTokenizer.encode(prompt, true);
    let mut stream = Utf8Stream::default();
    let mut stdout = io::stdout();

    print!("{} ", "Assistant:".bold().green());
    stdout.flush().ok();
    let result = session.turn(&tokens, |token| {
        print!("{}", stream.push(token));
        io::stdout().flush().ok();
    });
    println!("{}", stream.finish());

    match result {
        Ok(out) => {
            debug!(
                answer = %ByteTokenizer.decode(&out.tokens),
                stop = ?out.stop,
                traces = out.state.len(),
                "turn answered"
            );
            if out.stop == StopReason::MaxTokens {
                println!("{}", "  [reached the token limit]".dimmed());
            }
            true
        }
        Err(e) => {
            println!("{}: {}", "Generation failed".red(), e);
            !e.generated.is_empty()
        }
    }
}

fn cmd_help() {
    println!();
    println!("{}", "livemem Commands".bold().underline());
    println!("  {}   – print the memory state summary", "/stats".bold().cyan());
    println!("  {} – persist the extended state", "/save [PATH]".bold().cyan());
    println!("  {}    – exit the REPL", "exit  quit".bold().cyan());
    println!("  Anything else is answered from memory.");
    println!();
}

fn cmd_stats(session: &Session<'_>, unsaved_turns: usize) {
    match session.state() {
        Some(state) => {
            println!("  {}", state.summary().to_string().bold());
            println!(
                "  {} turn(s) this session, {} unsaved",
                session.turns(),
                unsaved_turns
            );
        }
        None => println!("  {}", "no state loaded".yellow()),
    }
}

fn cmd_save(session: &Session<'_>, path: &Path) -> bool {
    let Some(state) = session.state() else {
        println!("{}", "Nothing to save.".yellow());
        return false;
    };
    match persist::save(state, path) {
        Ok(()) => {
            println!(
                "{} {} ({} traces)",
                "✓ State saved to".green(),
                path.display().to_string().bold(),
                state.len()
            );
            true
        }
        Err(e) => {
            println!("{}: {}", "Error saving state".red(), e);
            false
        }
    }
}

//! Operator console
//!
//! A line-editing prompt running on its own thread. Each line is parsed into
//! a [`ConsoleCommand`] and forwarded to the main loop.

use anyhow::Result;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tokio::sync::mpsc;
use tracing::debug;

pub const HELP: &str = "commands: connect [PORT] | close | status | play BPM | help | quit";

/// Something the operator asked for
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    /// Connect to the given port, or the configured one
    Connect(Option<String>),
    Close,
    Status,
    /// Feed a reading by hand
    Play(f64),
    Help,
    Quit,
}

/// Parse one console line; `Ok(None)` for blank input
pub fn parse_command(line: &str) -> Result<Option<ConsoleCommand>, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let arg = words.next();
    if words.next().is_some() {
        return Err(format!("too many arguments for '{}'", verb));
    }

    let command = match (verb.to_lowercase().as_str(), arg) {
        ("connect", port) => ConsoleCommand::Connect(port.map(str::to_string)),
        ("close" | "disconnect", None) => ConsoleCommand::Close,
        ("status", None) => ConsoleCommand::Status,
        ("play", Some(bpm)) => match bpm.parse::<f64>() {
            Ok(bpm) if bpm.is_finite() && bpm > 0.0 => ConsoleCommand::Play(bpm),
            _ => return Err(format!("'{}' is not a tempo", bpm)),
        },
        ("play", None) => return Err("play needs a BPM value".to_string()),
        ("help" | "?", None) => ConsoleCommand::Help,
        ("quit" | "exit", None) => ConsoleCommand::Quit,
        (other, _) => return Err(format!("unknown command '{}'", other)),
    };
    Ok(Some(command))
}

/// Run the prompt until EOF, Ctrl-C or `quit`
///
/// Blocking; run it on a dedicated thread.
pub fn run_console(commands: mpsc::Sender<ConsoleCommand>) -> Result<()> {
    let mut rl = DefaultEditor::new()?;
    println!("{}", HELP);

    loop {
        match rl.readline("tempo> ") {
            Ok(line) => {
                let _ = rl.add_history_entry(line.as_str());
                match parse_command(&line) {
                    Ok(Some(command)) => {
                        let quit = command == ConsoleCommand::Quit;
                        if commands.blocking_send(command).is_err() || quit {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => println!("{}\n{}", e, HELP),
                }
            }
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => {
                let _ = commands.blocking_send(ConsoleCommand::Quit);
                break;
            }
            Err(e) => {
                debug!("Console closed: {}", e);
                break;
            }
        }
    }

    Ok(())
}

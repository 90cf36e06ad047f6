//! Stdin console: every line is dispatched as the console sender.

use shard_system::shard_api::CommandSender;
use shard_system::{CommandTable, DispatchError, RouteOutcome};
use std::io::BufRead;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// What one console line resolved to.
#[derive(Debug, PartialEq)]
pub enum ConsoleOutcome {
    Blank,
    Help(Vec<String>),
    Dispatched(RouteOutcome),
    Rejected(String),
}

/// Handles one console line. `help` lists the registered commands.
pub fn handle_line(table: &CommandTable, sender: &CommandSender, line: &str) -> ConsoleOutcome {
    let line = line.trim();
    if line.is_empty() {
        return ConsoleOutcome::Blank;
    }
    if line == "help" || line == "/help" {
        return ConsoleOutcome::Help(table.commands());
    }

    match table.dispatch(sender, line) {
        Ok(outcome) => ConsoleOutcome::Dispatched(outcome),
        Err(DispatchError::UnknownCommand(label)) => {
            ConsoleOutcome::Rejected(format!("Unknown command '{}'. Type 'help' for a list.", label))
        }
        Err(e) => ConsoleOutcome::Rejected(e.to_string()),
    }
}

/// Reads stdin until EOF.
///
/// Lines are read on a dedicated thread: a blocking stdin read inside the
/// runtime would keep the runtime from shutting down. Handlers run inline on
/// the console task.
pub async fn run_console(table: Arc<CommandTable>) -> std::io::Result<()> {
    let sender = CommandSender::console();
    let (tx, mut rx) = mpsc::channel::<std::io::Result<String>>(16);

    std::thread::Builder::new()
        .name("frost-console".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                if tx.blocking_send(line).is_err() {
                    break;
                }
            }
        })?;

    while let Some(line) = rx.recv().await {
        let line = line?;
        match handle_line(&table, &sender, &line) {
            ConsoleOutcome::Blank => {}
            ConsoleOutcome::Help(commands) => {
                info!("Commands: {}", commands.join(", "));
            }
            ConsoleOutcome::Dispatched(RouteOutcome::Executed) => debug!("Executed '{}'", line.trim()),
            ConsoleOutcome::Dispatched(RouteOutcome::Vetoed) => warn!("'{}' was vetoed", line.trim()),
            ConsoleOutcome::Rejected(reason) => warn!("{}", reason),
        }
    }

    info!("Console input closed");
    Ok(())
}

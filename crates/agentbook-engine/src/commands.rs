//! Slash-command dispatcher.
//!
//! Thin, synchronous translation of user command text into document and
//! history operations. Unrecognized commands degrade gracefully: the text
//! becomes a new markdown cell instead of an error.

use agentbook_types::{CellId, CellType};
use tracing::debug;

use crate::history::History;
use crate::notebook::{AddCell, Notebook};

/// A parsed user command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// `/code <content>` — new code cell.
    NewCode(String),
    /// `/markdown <content>` — new markdown cell.
    NewMarkdown(String),
    /// `/clear` — remove all cells (checkpointed for undo).
    Clear,
    /// `/run-all` — execute every code cell in document order.
    RunAll,
    /// Anything else, including unknown slash commands: a markdown cell.
    Freeform(String),
}

impl Command {
    /// Parse user input. Never fails.
    pub fn parse(input: &str) -> Self {
        let trimmed = input.trim();
        if !trimmed.starts_with('/') {
            return Command::Freeform(trimmed.to_string());
        }
        let (verb, rest) = match trimmed.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim_start()),
            None => (trimmed, ""),
        };
        match verb {
            "/code" => Command::NewCode(rest.to_string()),
            "/markdown" | "/md" => Command::NewMarkdown(rest.to_string()),
            "/clear" => Command::Clear,
            "/run-all" | "/runall" => Command::RunAll,
            _ => {
                debug!(input = %trimmed, "unknown command, treating as markdown");
                Command::Freeform(trimmed.to_string())
            }
        }
    }
}

/// What a dispatched command did, for the caller to act on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandOutcome {
    /// A cell was created.
    CellAdded(CellId),
    /// The document was cleared.
    Cleared,
    /// Code cells to run, in document order. Execution is the caller's job
    /// (this layer stays synchronous).
    RunCells(Vec<CellId>),
}

/// Apply one command to the document.
pub fn dispatch(
    notebook: &mut Notebook,
    history: &mut History,
    command: Command,
) -> CommandOutcome {
    match command {
        Command::NewCode(content) => {
            let id = notebook.add_cell(AddCell::new(CellType::Code, content));
            CommandOutcome::CellAdded(id)
        }
        Command::NewMarkdown(content) | Command::Freeform(content) => {
            let id = notebook.add_cell(AddCell::new(CellType::Markdown, content));
            CommandOutcome::CellAdded(id)
        }
        Command::Clear => {
            history.checkpoint(notebook);
            notebook.clear();
            CommandOutcome::Cleared
        }
        Command::RunAll => {
            let cells = notebook
                .cells()
                .iter()
                .filter(|c| c.is_code())
                .map(|c| c.id)
                .collect();
            CommandOutcome::RunCells(cells)
        }
    }
}

//! Shared cell and output types for Agentbook.
//!
//! This crate is the data-model foundation: cell identifiers, the cell
//! record itself, normalized output items, and notebook-level metadata.
//! It has **no internal agentbook dependencies** — a pure leaf crate that
//! the engine builds on.
//!
//! # Entity Overview
//!
//! ```text
//! Notebook (NotebookMetadata)
//!     └── ordered sequence of Cell
//!
//! Cell (CellId)
//!     └── cell_type: code | markdown | thinking
//!     └── role: user | assistant | system
//!     └── metadata.parent forms a one-level grouping relation
//!     └── output: ordered Vec<OutputItem>
//! ```
//!
//! Document order is the sole positional truth; `metadata.parent` is a
//! lookup aid used to find "all cells produced in response to X", never a
//! sort key.

pub mod cell;
pub mod ids;
pub mod metadata;
pub mod output;

// Re-export primary types at crate root for convenience.
pub use cell::{Cell, CellMetadata, CellRole, CellType, ExecutionState};
pub use ids::CellId;
pub use metadata::{KernelSpec, NotebookMetadata};
pub use output::{OutputItem, OutputKind};

/// Current time as Unix milliseconds. Used by constructors throughout the crate.
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

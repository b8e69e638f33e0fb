//! Undo/redo snapshots and the cell clipboard.
//!
//! History is full-state: each checkpoint stores the entire cell sequence
//! (with live editor content merged in), captured immediately before a
//! destructive operation. Undo pushes the current state onto the redo stack
//! and restores the last snapshot; any new checkpoint clears the redo stack.
//!
//! The clipboard holds deep copies. Paste re-mints ids so the same payload
//! can be pasted repeatedly without id collisions.

use tracing::debug;

use agentbook_types::{Cell, CellId};

use crate::notebook::{AddCell, Notebook};

/// Maximum retained undo snapshots. Oldest are dropped beyond this.
const MAX_SNAPSHOTS: usize = 100;

/// Full-state undo/redo stacks for one notebook.
#[derive(Debug, Default)]
pub struct History {
    undo: Vec<Vec<Cell>>,
    redo: Vec<Vec<Cell>>,
}

impl History {
    /// Create empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture the current document state. Call immediately before a
    /// destructive operation. Clears the redo stack.
    pub fn checkpoint(&mut self, notebook: &Notebook) {
        self.undo.push(notebook.current_cells_content());
        if self.undo.len() > MAX_SNAPSHOTS {
            self.undo.remove(0);
        }
        self.redo.clear();
        debug!(depth = self.undo.len(), "history checkpoint");
    }

    /// Restore the last snapshot. The current state moves to the redo stack.
    /// Returns false when there is nothing to undo.
    pub fn undo(&mut self, notebook: &mut Notebook) -> bool {
        let Some(snapshot) = self.undo.pop() else {
            return false;
        };
        self.redo.push(notebook.current_cells_content());
        notebook.restore_cells(snapshot);
        true
    }

    /// Re-apply the last undone state. Returns false when there is nothing
    /// to redo.
    pub fn redo(&mut self, notebook: &mut Notebook) -> bool {
        let Some(snapshot) = self.redo.pop() else {
            return false;
        };
        self.undo.push(notebook.current_cells_content());
        notebook.restore_cells(snapshot);
        true
    }

    /// Check whether undo is available.
    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    /// Check whether redo is available.
    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }
}

/// Deep-copy cell clipboard.
#[derive(Debug, Default)]
pub struct Clipboard {
    cells: Vec<Cell>,
}

impl Clipboard {
    /// Create an empty clipboard.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy cells into the clipboard without touching the document.
    pub fn copy(&mut self, notebook: &Notebook, ids: &[CellId]) {
        self.cells = ids.iter().filter_map(|&id| notebook.get(id).cloned()).collect();
    }

    /// Copy cells then delete them from the document. The caller is expected
    /// to checkpoint history first.
    pub fn cut(&mut self, notebook: &mut Notebook, ids: &[CellId]) {
        self.copy(notebook, ids);
        for &id in ids {
            notebook.delete_cell(id);
        }
    }

    /// Insert clipboard contents after the given cell (or the active cell).
    /// Every pasted cell gets a fresh id, so repeated pastes never collide.
    /// Returns the new ids in insertion order.
    pub fn paste(&mut self, notebook: &mut Notebook, after: Option<CellId>) -> Vec<CellId> {
        let mut anchor = after.or(notebook.active());
        let mut pasted = Vec::with_capacity(self.cells.len());
        for cell in self.cells.clone() {
            let parent = cell.parent();
            let mut spec = AddCell::new(cell.cell_type, cell.content).role(cell.role);
            if let Some(parent) = parent {
                spec = spec.parent(parent);
            }
            if let Some(anchor) = anchor {
                spec = spec.after(anchor);
            }
            let id = notebook.add_cell(spec);
            anchor = Some(id);
            pasted.push(id);
        }
        pasted
    }

    /// Check whether the clipboard has content.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

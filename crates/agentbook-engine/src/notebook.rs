//! The in-memory cell document model.
//!
//! A [`Notebook`] is an ordered sequence of cells plus a parent→children
//! index, an active-cell pointer, and the global execution counter. All
//! mutation goes through the operations here — callers never write cell
//! fields directly — so change events stay accurate and history snapshots
//! stay cheap.
//!
//! # Concurrency Model
//!
//! The notebook itself is a plain synchronous structure. Async collaborators
//! (execution bridge, reconciler) share it behind [`SharedNotebook`] and take
//! the lock only for the duration of one operation, never across an await.
//!
//! # Error policy
//!
//! Mutations addressed to an unknown cell id are silent no-ops — UI
//! responsiveness is prioritized over strict validation. Callers needing
//! existence guarantees query first.

use std::sync::Arc;

use indexmap::IndexMap;
use tokio::sync::broadcast;
use tracing::debug;

use agentbook_types::{
    Cell, CellId, CellRole, CellType, ExecutionState, NotebookMetadata, OutputItem,
};

/// Events broadcast when the document changes.
#[derive(Clone, Debug)]
pub enum NotebookEvent {
    /// A cell was inserted.
    CellAdded { id: CellId },
    /// A cell was removed.
    CellRemoved { id: CellId },
    /// A cell's content, state, outputs, or metadata changed.
    CellUpdated { id: CellId },
    /// The whole document was cleared.
    Cleared,
}

/// Live editor buffers register here so the serialization boundary can see
/// in-progress, uncommitted edits for visible cells.
pub trait ContentOverlay: Send + Sync {
    /// The live (unsaved) content for a cell, if an editor buffer is attached.
    fn live_content(&self, id: CellId) -> Option<String>;
}

/// Insertion request for [`Notebook::add_cell`].
///
/// Placement: immediately after `after` if given and found, else after the
/// current active cell, else at the end. The new cell becomes active.
#[derive(Clone, Debug)]
pub struct AddCell {
    /// Content type for the new cell.
    pub cell_type: CellType,
    /// Initial source text.
    pub content: String,
    /// Provenance. Defaults to user.
    pub role: CellRole,
    /// Insert after this cell, if found.
    pub after: Option<CellId>,
    /// Grouping reference to the causing cell.
    pub parent: Option<CellId>,
    /// Explicit id (bulk load, paste). Generated when absent.
    pub id: Option<CellId>,
}

impl AddCell {
    /// Start an insertion request.
    pub fn new(cell_type: CellType, content: impl Into<String>) -> Self {
        Self {
            cell_type,
            content: content.into(),
            role: CellRole::User,
            after: None,
            parent: None,
            id: None,
        }
    }

    /// Set the provenance role.
    pub fn role(mut self, role: CellRole) -> Self {
        self.role = role;
        self
    }

    /// Insert after a reference cell.
    pub fn after(mut self, id: CellId) -> Self {
        self.after = Some(id);
        self
    }

    /// Set the grouping parent.
    pub fn parent(mut self, id: CellId) -> Self {
        self.parent = Some(id);
        self
    }

    /// Use an explicit id instead of generating one.
    pub fn id(mut self, id: CellId) -> Self {
        self.id = Some(id);
        self
    }
}

/// The ordered cell document.
pub struct Notebook {
    /// Document order is the sole positional truth.
    cells: Vec<Cell>,
    /// Incremental parent → children index (children kept in document order).
    /// Derived from `metadata.parent` of live cells; keys may refer to cells
    /// that no longer exist (dangling parents after a non-cascading delete).
    children: IndexMap<CellId, Vec<CellId>>,
    /// The currently active (focused) cell.
    active: Option<CellId>,
    /// Global execution counter. Strictly increasing, never reused, shared
    /// across the whole document, assigned in completion order.
    execution_counter: u64,
    /// Document-level metadata.
    pub metadata: NotebookMetadata,
    /// Attached live editor buffers, if any.
    overlay: Option<Arc<dyn ContentOverlay>>,
    /// Change event broadcaster.
    event_tx: broadcast::Sender<NotebookEvent>,
}

impl std::fmt::Debug for Notebook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notebook")
            .field("cells", &self.cells.len())
            .field("active", &self.active)
            .field("execution_counter", &self.execution_counter)
            .finish()
    }
}

impl Notebook {
    /// Create an empty notebook.
    pub fn new(metadata: NotebookMetadata) -> Self {
        let (event_tx, _) = broadcast::channel(1024);
        Self {
            cells: Vec::new(),
            children: IndexMap::new(),
            active: None,
            execution_counter: 0,
            metadata,
            overlay: None,
            event_tx,
        }
    }

    /// Subscribe to document change events.
    pub fn subscribe(&self) -> broadcast::Receiver<NotebookEvent> {
        self.event_tx.subscribe()
    }

    /// Attach a live-content overlay (editor buffers).
    pub fn set_overlay(&mut self, overlay: Arc<dyn ContentOverlay>) {
        self.overlay = Some(overlay);
    }

    fn emit(&self, event: NotebookEvent) {
        // Ignore if no subscribers.
        let _ = self.event_tx.send(event);
    }

    // =========================================================================
    // Insertion
    // =========================================================================

    /// Insert a cell. See [`AddCell`] for placement rules. Returns the new id
    /// and sets the new cell active.
    pub fn add_cell(&mut self, spec: AddCell) -> CellId {
        let index = self
            .position_of(spec.after)
            .or_else(|| self.position_of(self.active))
            .map(|i| i + 1)
            .unwrap_or(self.cells.len());
        self.insert_at(index, spec)
    }

    /// Insert a cell immediately before a reference cell. Falls back to the
    /// [`Notebook::add_cell`] placement rules when the reference is missing.
    pub fn add_cell_before(&mut self, spec: AddCell, before: CellId) -> CellId {
        match self.position_of(Some(before)) {
            Some(index) => self.insert_at(index, spec),
            None => self.add_cell(spec),
        }
    }

    fn insert_at(&mut self, index: usize, spec: AddCell) -> CellId {
        let mut cell = Cell::new(spec.cell_type, spec.content, spec.role);
        if let Some(id) = spec.id {
            cell.id = id;
        }
        cell.metadata.parent = spec.parent;
        let id = cell.id;

        self.cells.insert(index.min(self.cells.len()), cell);
        if let Some(parent) = spec.parent {
            self.index_child(parent, id);
        }
        self.active = Some(id);
        self.metadata.touch();
        debug!(cell = %id.short(), index, "cell added");
        self.emit(NotebookEvent::CellAdded { id });
        id
    }

    /// Insert a child id into its parent's index slot, keeping the slot in
    /// document order. O(children) per insert; cells never reorder after
    /// insertion, so the slot stays sorted.
    fn index_child(&mut self, parent: CellId, child: CellId) {
        fn pos(cells: &[Cell], id: CellId) -> Option<usize> {
            cells.iter().position(|c| c.id == id)
        }
        let Some(child_pos) = pos(&self.cells, child) else {
            return;
        };
        let cells = &self.cells;
        let slot = self.children.entry(parent).or_default();
        let insert_at = slot
            .iter()
            .position(|&sibling| pos(cells, sibling).is_some_and(|p| p > child_pos))
            .unwrap_or(slot.len());
        slot.insert(insert_at, child);
    }

    // =========================================================================
    // Deletion
    // =========================================================================

    /// Remove one cell. Children keep their (now dangling) `parent`
    /// reference. If the deleted cell was active, the nearest remaining
    /// neighbor becomes active (same index preferred, else previous).
    pub fn delete_cell(&mut self, id: CellId) {
        let Some(index) = self.position_of(Some(id)) else {
            return;
        };
        let cell = self.cells.remove(index);
        self.unindex_child(cell.parent(), id);
        self.metadata.touch();

        if self.active == Some(id) {
            self.active = self
                .cells
                .get(index)
                .or_else(|| self.cells.get(index.wrapping_sub(1)))
                .map(|c| c.id);
        }
        debug!(cell = %id.short(), "cell removed");
        self.emit(NotebookEvent::CellRemoved { id });
    }

    /// Remove a cell and every cell whose `parent` equals it. One level only:
    /// grandchildren are left with dangling parents. Generalizing to a
    /// transitive cascade would change observable behavior, so the one-level
    /// semantics are kept deliberately.
    pub fn delete_cell_with_children(&mut self, id: CellId) {
        for child in self.children_of(id) {
            self.delete_cell(child);
        }
        self.delete_cell(id);
    }

    fn unindex_child(&mut self, parent: Option<CellId>, child: CellId) {
        if let Some(parent) = parent {
            if let Some(slot) = self.children.get_mut(&parent) {
                slot.retain(|&c| c != child);
                if slot.is_empty() {
                    self.children.shift_remove(&parent);
                }
            }
        }
    }

    /// Remove every cell and reset the active pointer. The execution counter
    /// survives: counter values are never reused, even across a clear.
    pub fn clear(&mut self) {
        self.cells.clear();
        self.children.clear();
        self.active = None;
        self.metadata.touch();
        self.emit(NotebookEvent::Cleared);
    }

    // =========================================================================
    // Targeted mutations (unknown id => no-op)
    // =========================================================================

    /// Replace a cell's source text.
    pub fn update_cell_content(&mut self, id: CellId, content: impl Into<String>) {
        if let Some(cell) = self.cells.iter_mut().find(|c| c.id == id) {
            cell.content = content.into();
            self.metadata.touch();
            self.emit(NotebookEvent::CellUpdated { id });
        }
    }

    /// Append streamed text to a cell's source.
    pub fn append_cell_content(&mut self, id: CellId, delta: &str) {
        if let Some(cell) = self.cells.iter_mut().find(|c| c.id == id) {
            cell.content.push_str(delta);
            self.emit(NotebookEvent::CellUpdated { id });
        }
    }

    /// Set a cell's execution state, optionally replacing its outputs.
    pub fn update_cell_execution_state(
        &mut self,
        id: CellId,
        state: ExecutionState,
        outputs: Option<Vec<OutputItem>>,
    ) {
        if let Some(cell) = self.cells.iter_mut().find(|c| c.id == id) {
            cell.execution_state = state;
            if let Some(outputs) = outputs {
                cell.output = outputs;
            }
            self.emit(NotebookEvent::CellUpdated { id });
        }
    }

    /// Append one output item, preserving arrival order.
    pub fn append_output(&mut self, id: CellId, item: OutputItem) {
        if let Some(cell) = self.cells.iter_mut().find(|c| c.id == id) {
            cell.output.push(item);
            self.emit(NotebookEvent::CellUpdated { id });
        }
    }

    /// Assign the next execution counter value to a cell. Counter values are
    /// handed out strictly in completion order and never reused.
    pub fn assign_execution_count(&mut self, id: CellId) -> Option<u64> {
        let cell = self.cells.iter_mut().find(|c| c.id == id)?;
        self.execution_counter += 1;
        cell.execution_count = Some(self.execution_counter);
        self.emit(NotebookEvent::CellUpdated { id });
        Some(self.execution_counter)
    }

    /// Toggle markdown raw-edit vs rendered mode.
    pub fn toggle_cell_editing(&mut self, id: CellId) {
        if let Some(cell) = self.cells.iter_mut().find(|c| c.id == id) {
            if cell.cell_type == CellType::Markdown {
                let editing = cell.metadata.is_editing.unwrap_or(false);
                cell.metadata.is_editing = Some(!editing);
                self.emit(NotebookEvent::CellUpdated { id });
            }
        }
    }

    /// Toggle code visibility. This is a user action: it sets
    /// `user_modified`, which wins over auto-collapse automation.
    pub fn toggle_code_visibility(&mut self, id: CellId) {
        if let Some(cell) = self.cells.iter_mut().find(|c| c.id == id) {
            let visible = cell.code_visible();
            cell.metadata.is_code_visible = Some(!visible);
            cell.metadata.user_modified = true;
            self.emit(NotebookEvent::CellUpdated { id });
        }
    }

    /// Toggle output visibility. Also a user action (sets `user_modified`).
    pub fn toggle_output_visibility(&mut self, id: CellId) {
        if let Some(cell) = self.cells.iter_mut().find(|c| c.id == id) {
            let visible = cell.output_visible();
            cell.metadata.is_output_visible = Some(!visible);
            cell.metadata.user_modified = true;
            self.emit(NotebookEvent::CellUpdated { id });
        }
    }

    /// Set visibility flags without touching `user_modified` — for
    /// automation (force-expand, auto-collapse, staging).
    pub fn set_visibility(&mut self, id: CellId, code: Option<bool>, output: Option<bool>) {
        if let Some(cell) = self.cells.iter_mut().find(|c| c.id == id) {
            if let Some(code) = code {
                cell.metadata.is_code_visible = Some(code);
            }
            if let Some(output) = output {
                cell.metadata.is_output_visible = Some(output);
            }
            self.emit(NotebookEvent::CellUpdated { id });
        }
    }

    /// Mark that the user changed this cell's visibility by hand.
    pub fn mark_user_modified(&mut self, id: CellId) {
        if let Some(cell) = self.cells.iter_mut().find(|c| c.id == id) {
            cell.metadata.user_modified = true;
        }
    }

    /// Set the staging partition flag decided at finalization.
    pub fn set_staged(&mut self, id: CellId, staged: bool) {
        if let Some(cell) = self.cells.iter_mut().find(|c| c.id == id) {
            cell.metadata.staged = Some(staged);
            self.emit(NotebookEvent::CellUpdated { id });
        }
    }

    /// Change a cell's provenance role.
    pub fn update_cell_role(&mut self, id: CellId, role: CellRole) {
        if let Some(cell) = self.cells.iter_mut().find(|c| c.id == id) {
            cell.role = role;
            self.emit(NotebookEvent::CellUpdated { id });
        }
    }

    /// Change a cell's content type (convert code <-> markdown, or turn a
    /// thinking placeholder into a real cell).
    pub fn change_cell_type(&mut self, id: CellId, cell_type: CellType) {
        if let Some(cell) = self.cells.iter_mut().find(|c| c.id == id) {
            cell.cell_type = cell_type;
            self.emit(NotebookEvent::CellUpdated { id });
        }
    }

    /// Set the active (focused) cell. Unknown ids clear nothing.
    pub fn set_active(&mut self, id: CellId) {
        if self.position_of(Some(id)).is_some() {
            self.active = Some(id);
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// The active (focused) cell id.
    pub fn active(&self) -> Option<CellId> {
        self.active
    }

    /// All cells in document order.
    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    /// Look up one cell by id.
    pub fn get(&self, id: CellId) -> Option<&Cell> {
        self.cells.iter().find(|c| c.id == id)
    }

    /// Document index of a cell.
    pub fn position_of(&self, id: Option<CellId>) -> Option<usize> {
        let id = id?;
        self.cells.iter().position(|c| c.id == id)
    }

    /// First cell matching a predicate, in document order.
    pub fn find_cell(&self, pred: impl Fn(&Cell) -> bool) -> Option<&Cell> {
        self.cells.iter().find(|c| pred(c))
    }

    /// Last cell matching a predicate.
    pub fn find_last_cell(&self, pred: impl Fn(&Cell) -> bool) -> Option<&Cell> {
        self.cells.iter().rev().find(|c| pred(c))
    }

    /// Ids of all cells whose `parent` equals the target, in document order.
    /// Served from the incremental index, not a document scan.
    pub fn children_of(&self, parent: CellId) -> Vec<CellId> {
        self.children.get(&parent).cloned().unwrap_or_default()
    }

    /// The child cells themselves, in document order.
    pub fn find_children_cells(&self, parent: CellId) -> Vec<&Cell> {
        self.children_of(parent)
            .into_iter()
            .filter_map(|id| self.get(id))
            .collect()
    }

    /// Id of the cell following the given one in document order.
    pub fn next_cell(&self, id: CellId) -> Option<CellId> {
        let pos = self.position_of(Some(id))?;
        self.cells.get(pos + 1).map(|c| c.id)
    }

    /// Number of cells.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Check if the document has no cells.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// The live content for one cell: the attached editor buffer when the
    /// cell's code is visible, else the stored value. Hidden cells are
    /// assumed not actively edited.
    pub fn live_content(&self, id: CellId) -> Option<String> {
        let cell = self.get(id)?;
        if cell.code_visible() {
            if let Some(live) = self.overlay.as_ref().and_then(|o| o.live_content(id)) {
                return Some(live);
            }
        }
        Some(cell.content.clone())
    }

    /// Materialize the document with live editable content merged in. This is
    /// the serialization boundary used by save, execute, and history
    /// snapshotting.
    pub fn current_cells_content(&self) -> Vec<Cell> {
        self.cells
            .iter()
            .map(|cell| {
                let mut out = cell.clone();
                if let Some(live) = self.live_content(cell.id) {
                    out.content = live;
                }
                out
            })
            .collect()
    }

    /// Replace the whole cell sequence (undo/redo restore, bulk load).
    /// Rebuilds the index; clears the active pointer if its target is gone.
    pub fn restore_cells(&mut self, cells: Vec<Cell>) {
        self.cells = cells;
        self.rebuild_index();
        if let Some(active) = self.active {
            if self.position_of(Some(active)).is_none() {
                self.active = self.cells.last().map(|c| c.id);
            }
        }
        self.emit(NotebookEvent::Cleared);
    }

    fn rebuild_index(&mut self) {
        self.children.clear();
        let pairs: Vec<(CellId, CellId)> = self
            .cells
            .iter()
            .filter_map(|c| c.parent().map(|p| (p, c.id)))
            .collect();
        for (parent, child) in pairs {
            // Document-order iteration keeps each slot sorted.
            self.children.entry(parent).or_default().push(child);
        }
    }
}

impl Default for Notebook {
    fn default() -> Self {
        Self::new(NotebookMetadata::default())
    }
}

/// Thread-safe handle to a notebook. Locked per-operation, never across an
/// await.
pub type SharedNotebook = Arc<parking_lot::RwLock<Notebook>>;

/// Create a new shared notebook.
pub fn shared_notebook(metadata: NotebookMetadata) -> SharedNotebook {
    Arc::new(parking_lot::RwLock::new(Notebook::new(metadata)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nb() -> Notebook {
        Notebook::default()
    }

    #[test]
    fn test_add_cell_at_end_and_active() {
        let mut nb = nb();
        let a = nb.add_cell(AddCell::new(CellType::Markdown, "a"));
        let b = nb.add_cell(AddCell::new(CellType::Code, "b"));
        assert_eq!(nb.len(), 2);
        assert_eq!(nb.active(), Some(b));
        assert_eq!(nb.cells()[0].id, a);
        assert_eq!(nb.cells()[1].id, b);
    }

    #[test]
    fn test_add_cell_after_reference() {
        let mut nb = nb();
        let a = nb.add_cell(AddCell::new(CellType::Markdown, "a"));
        let _c = nb.add_cell(AddCell::new(CellType::Markdown, "c"));
        let b = nb.add_cell(AddCell::new(CellType::Markdown, "b").after(a));
        assert_eq!(nb.cells()[1].id, b);
    }

    #[test]
    fn test_add_cell_after_active_when_no_reference() {
        let mut nb = nb();
        let a = nb.add_cell(AddCell::new(CellType::Markdown, "a"));
        let _b = nb.add_cell(AddCell::new(CellType::Markdown, "b"));
        nb.set_active(a);
        let c = nb.add_cell(AddCell::new(CellType::Markdown, "c"));
        assert_eq!(nb.cells()[1].id, c);
    }

    #[test]
    fn test_add_cell_before() {
        let mut nb = nb();
        let a = nb.add_cell(AddCell::new(CellType::Markdown, "a"));
        let b = nb.add_cell_before(AddCell::new(CellType::Markdown, "b"), a);
        assert_eq!(nb.cells()[0].id, b);
        assert_eq!(nb.cells()[1].id, a);
    }

    #[test]
    fn test_explicit_id_respected() {
        let mut nb = nb();
        let id = CellId::new();
        let got = nb.add_cell(AddCell::new(CellType::Code, "x").id(id));
        assert_eq!(got, id);
        assert!(nb.get(id).is_some());
    }

    #[test]
    fn test_delete_cell_activates_neighbor() {
        let mut nb = nb();
        let a = nb.add_cell(AddCell::new(CellType::Markdown, "a"));
        let b = nb.add_cell(AddCell::new(CellType::Markdown, "b"));
        let c = nb.add_cell(AddCell::new(CellType::Markdown, "c"));
        nb.set_active(b);
        nb.delete_cell(b);
        // Same index preferred: c took b's slot.
        assert_eq!(nb.active(), Some(c));
        nb.set_active(c);
        nb.delete_cell(c);
        // No cell at that index anymore: previous wins.
        assert_eq!(nb.active(), Some(a));
    }

    #[test]
    fn test_delete_unknown_is_noop() {
        let mut nb = nb();
        nb.add_cell(AddCell::new(CellType::Markdown, "a"));
        nb.delete_cell(CellId::new());
        assert_eq!(nb.len(), 1);
    }

    #[test]
    fn test_delete_with_children_one_level() {
        let mut nb = nb();
        let x = nb.add_cell(AddCell::new(CellType::Markdown, "x"));
        let a = nb.add_cell(AddCell::new(CellType::Code, "a").parent(x));
        let b = nb.add_cell(AddCell::new(CellType::Code, "b").parent(x));
        // Grandchild parented to a, not x.
        let g = nb.add_cell(AddCell::new(CellType::Code, "g").parent(a));
        let other = nb.add_cell(AddCell::new(CellType::Markdown, "other"));

        nb.delete_cell_with_children(x);
        assert!(nb.get(x).is_none());
        assert!(nb.get(a).is_none());
        assert!(nb.get(b).is_none());
        // One level only: grandchild survives with a dangling parent.
        assert!(nb.get(g).is_some());
        assert_eq!(nb.get(g).unwrap().parent(), Some(a));
        assert!(nb.get(other).is_some());
    }

    #[test]
    fn test_delete_only_leaves_dangling_parent() {
        let mut nb = nb();
        let x = nb.add_cell(AddCell::new(CellType::Markdown, "x"));
        let a = nb.add_cell(AddCell::new(CellType::Code, "a").parent(x));
        nb.delete_cell(x);
        assert!(nb.get(x).is_none());
        let a_cell = nb.get(a).unwrap();
        assert_eq!(a_cell.parent(), Some(x));
        // The index still resolves the dangling parent to its orphans.
        assert_eq!(nb.children_of(x), vec![a]);
    }

    #[test]
    fn test_children_in_document_order() {
        let mut nb = nb();
        let x = nb.add_cell(AddCell::new(CellType::Markdown, "x"));
        let a = nb.add_cell(AddCell::new(CellType::Code, "a").parent(x));
        let c = nb.add_cell(AddCell::new(CellType::Code, "c").parent(x));
        // Inserted positionally between a and c, indexed later than both.
        let b = nb.add_cell(AddCell::new(CellType::Code, "b").parent(x).after(a));
        assert_eq!(nb.children_of(x), vec![a, b, c]);
    }

    #[test]
    fn test_mutations_on_unknown_id_are_noops() {
        let mut nb = nb();
        let ghost = CellId::new();
        nb.update_cell_content(ghost, "x");
        nb.update_cell_execution_state(ghost, ExecutionState::Running, None);
        nb.append_output(ghost, OutputItem::stdout("x"));
        nb.toggle_cell_editing(ghost);
        nb.toggle_code_visibility(ghost);
        nb.update_cell_role(ghost, CellRole::System);
        nb.change_cell_type(ghost, CellType::Code);
        assert!(nb.is_empty());
        assert_eq!(nb.assign_execution_count(ghost), None);
    }

    #[test]
    fn test_execution_counter_monotonic_and_never_reused() {
        let mut nb = nb();
        let a = nb.add_cell(AddCell::new(CellType::Code, "a"));
        let b = nb.add_cell(AddCell::new(CellType::Code, "b"));
        assert_eq!(nb.assign_execution_count(a), Some(1));
        assert_eq!(nb.assign_execution_count(b), Some(2));
        nb.delete_cell(a);
        let c = nb.add_cell(AddCell::new(CellType::Code, "c"));
        assert_eq!(nb.assign_execution_count(c), Some(3));
        // Counter survives a clear as well.
        nb.clear();
        let d = nb.add_cell(AddCell::new(CellType::Code, "d"));
        assert_eq!(nb.assign_execution_count(d), Some(4));
    }

    #[test]
    fn test_assign_in_completion_order() {
        let mut nb = nb();
        let slow = nb.add_cell(AddCell::new(CellType::Code, "slow"));
        let fast = nb.add_cell(AddCell::new(CellType::Code, "fast"));
        // fast finishes first despite starting second.
        assert_eq!(nb.assign_execution_count(fast), Some(1));
        assert_eq!(nb.assign_execution_count(slow), Some(2));
    }

    #[test]
    fn test_toggle_code_visibility_sets_user_modified() {
        let mut nb = nb();
        let a = nb.add_cell(AddCell::new(CellType::Code, "a"));
        assert!(nb.get(a).unwrap().code_visible());
        nb.toggle_code_visibility(a);
        let cell = nb.get(a).unwrap();
        assert!(!cell.code_visible());
        assert!(cell.metadata.user_modified);
    }

    #[test]
    fn test_set_visibility_is_automation() {
        let mut nb = nb();
        let a = nb.add_cell(AddCell::new(CellType::Code, "a"));
        nb.set_visibility(a, Some(false), Some(true));
        let cell = nb.get(a).unwrap();
        assert!(!cell.code_visible());
        assert!(cell.output_visible());
        assert!(!cell.metadata.user_modified);
    }

    #[test]
    fn test_toggle_editing_markdown_only() {
        let mut nb = nb();
        let md = nb.add_cell(AddCell::new(CellType::Markdown, "m"));
        let code = nb.add_cell(AddCell::new(CellType::Code, "c"));
        nb.toggle_cell_editing(md);
        assert_eq!(nb.get(md).unwrap().metadata.is_editing, Some(true));
        nb.toggle_cell_editing(code);
        assert_eq!(nb.get(code).unwrap().metadata.is_editing, None);
    }

    #[test]
    fn test_find_queries() {
        let mut nb = nb();
        let _a = nb.add_cell(AddCell::new(CellType::Markdown, "first"));
        let b = nb.add_cell(AddCell::new(CellType::Code, "second"));
        let c = nb.add_cell(AddCell::new(CellType::Code, "third"));
        assert_eq!(nb.find_cell(|c| c.is_code()).unwrap().id, b);
        assert_eq!(nb.find_last_cell(|c| c.is_code()).unwrap().id, c);
        assert!(nb.find_cell(|c| c.is_thinking()).is_none());
    }

    struct FixedOverlay {
        id: CellId,
        text: &'static str,
    }

    impl ContentOverlay for FixedOverlay {
        fn live_content(&self, id: CellId) -> Option<String> {
            (id == self.id).then(|| self.text.to_string())
        }
    }

    #[test]
    fn test_live_content_prefers_overlay_for_visible_cells() {
        let mut nb = nb();
        let a = nb.add_cell(AddCell::new(CellType::Code, "stored"));
        nb.set_overlay(Arc::new(FixedOverlay { id: a, text: "live" }));
        assert_eq!(nb.live_content(a).as_deref(), Some("live"));

        // Hidden cells serialize their stored value.
        nb.set_visibility(a, Some(false), None);
        assert_eq!(nb.live_content(a).as_deref(), Some("stored"));
    }

    #[test]
    fn test_current_cells_content_merges_overlay() {
        let mut nb = nb();
        let a = nb.add_cell(AddCell::new(CellType::Code, "stored"));
        let b = nb.add_cell(AddCell::new(CellType::Markdown, "prose"));
        nb.set_overlay(Arc::new(FixedOverlay { id: a, text: "live" }));
        let snapshot = nb.current_cells_content();
        assert_eq!(snapshot[0].content, "live");
        assert_eq!(snapshot[1].content, "prose");
        // The stored document itself is untouched.
        assert_eq!(nb.get(a).unwrap().content, "stored");
        assert_eq!(nb.get(b).unwrap().content, "prose");
    }

    #[test]
    fn test_restore_cells_rebuilds_index() {
        let mut nb = nb();
        let x = nb.add_cell(AddCell::new(CellType::Markdown, "x"));
        let a = nb.add_cell(AddCell::new(CellType::Code, "a").parent(x));
        let snapshot = nb.cells().to_vec();
        nb.clear();
        assert!(nb.children_of(x).is_empty());
        nb.restore_cells(snapshot);
        assert_eq!(nb.children_of(x), vec![a]);
        assert_eq!(nb.len(), 2);
    }

    #[tokio::test]
    async fn test_event_subscription() {
        let mut nb = nb();
        let mut rx = nb.subscribe();
        let a = nb.add_cell(AddCell::new(CellType::Code, "a"));
        match rx.try_recv().unwrap() {
            NotebookEvent::CellAdded { id } => assert_eq!(id, a),
            other => panic!("expected CellAdded, got {other:?}"),
        }
        nb.update_cell_content(a, "b");
        assert!(matches!(
            rx.try_recv().unwrap(),
            NotebookEvent::CellUpdated { .. }
        ));
        nb.delete_cell(a);
        assert!(matches!(
            rx.try_recv().unwrap(),
            NotebookEvent::CellRemoved { .. }
        ));
    }
}

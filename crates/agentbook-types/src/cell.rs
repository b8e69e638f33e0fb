//! The cell record: the atomic document unit.
//!
//! A cell is code, markdown, or a transient thinking placeholder. Provenance
//! (`role`) is independent of type: the reconciler produces assistant code
//! cells, the user produces user markdown cells, and so on.
//!
//! ## Staging
//!
//! Assistant-produced child cells carry `metadata.staged`: `Some(true)` means
//! "produced during a turn but not declared used in the final answer" —
//! kept visible (collapsed) but excluded from replayed history.
//! `Some(false)` means committed. `None` means the partition has not been
//! decided yet (mid-turn).

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::EnumString;

use crate::ids::CellId;
use crate::output::OutputItem;

/// What a cell *is* (content type).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum CellType {
    /// Executable code.
    Code,
    /// Markdown prose (rendered or raw-edit).
    #[default]
    Markdown,
    /// Transient "agent is working" placeholder. Never persisted.
    Thinking,
}

impl CellType {
    /// Parse from string (case-insensitive).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        <Self as FromStr>::from_str(s).ok()
    }

    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            CellType::Code => "code",
            CellType::Markdown => "markdown",
            CellType::Thinking => "thinking",
        }
    }

    /// Check if cells of this type survive persistence.
    pub fn is_persistable(&self) -> bool {
        !matches!(self, CellType::Thinking)
    }
}

impl std::fmt::Display for CellType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Provenance of a cell, independent of its type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum CellRole {
    /// The person at the keyboard.
    #[default]
    #[strum(serialize = "user", serialize = "human")]
    User,
    /// The AI agent.
    #[strum(serialize = "assistant", serialize = "model", serialize = "agent")]
    Assistant,
    /// System-generated (errors, notifications).
    System,
}

impl CellRole {
    /// Parse from string (case-insensitive). Supports aliases:
    /// "human" -> User, "model"/"agent" -> Assistant.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        <Self as FromStr>::from_str(s).ok()
    }

    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            CellRole::User => "user",
            CellRole::Assistant => "assistant",
            CellRole::System => "system",
        }
    }
}

impl std::fmt::Display for CellRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Execution state of a code cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum ExecutionState {
    /// Not executing.
    #[default]
    Idle,
    /// The execution bridge is processing this cell.
    Running,
    /// Last execution completed without an error event.
    Success,
    /// Last execution observed an error event or infrastructure failure.
    Error,
}

impl ExecutionState {
    /// Parse from string (case-insensitive).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        <Self as FromStr>::from_str(s).ok()
    }

    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Idle => "idle",
            ExecutionState::Running => "running",
            ExecutionState::Success => "success",
            ExecutionState::Error => "error",
        }
    }

    /// Check if this state indicates completion (Success or Error).
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionState::Success | ExecutionState::Error)
    }

    /// Check if this state indicates active work.
    pub fn is_active(&self) -> bool {
        matches!(self, ExecutionState::Running)
    }
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-cell metadata: grouping, staging, and visibility flags.
///
/// Visibility flags are `Option` so "never touched" is distinguishable from
/// an explicit toggle; `user_modified` records that the user toggled
/// visibility by hand, which always wins over automation (auto-collapse).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CellMetadata {
    /// Id of the cell that *caused* this cell to exist. A grouping/lookup
    /// relation, not an ownership edge. May dangle after a non-cascading
    /// delete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<CellId>,
    /// Staging partition decided at finalization. See module docs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staged: Option<bool>,
    /// Whether code source is shown (code cells).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_code_visible: Option<bool>,
    /// Whether outputs are shown (code cells).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_output_visible: Option<bool>,
    /// Markdown raw-edit vs rendered mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_editing: Option<bool>,
    /// The user toggled visibility by hand; automation must not override.
    #[serde(default, skip_serializing_if = "is_false")]
    pub user_modified: bool,
}

/// Helper for `#[serde(skip_serializing_if)]` on bool fields.
fn is_false(v: &bool) -> bool {
    !v
}

/// The atomic document unit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    /// Opaque unique identifier, stable for the cell's lifetime.
    pub id: CellId,
    /// Content type (code, markdown, thinking).
    #[serde(rename = "type")]
    pub cell_type: CellType,
    /// Source text, mutable by user edit or by the reconciler while streaming.
    pub content: String,
    /// Provenance of the cell.
    pub role: CellRole,
    /// Execution state (meaningful for code cells).
    #[serde(default, skip_serializing_if = "execution_state_is_idle")]
    pub execution_state: ExecutionState,
    /// Global completion-order counter value, assigned at successful
    /// completion. Never reused, even after cell deletion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_count: Option<u64>,
    /// Ordered execution outputs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output: Vec<OutputItem>,
    /// Grouping, staging, and visibility metadata.
    #[serde(default)]
    pub metadata: CellMetadata,
    /// When the cell was created (Unix millis).
    pub created_at: u64,
}

fn execution_state_is_idle(s: &ExecutionState) -> bool {
    *s == ExecutionState::Idle
}

impl Cell {
    /// Create a cell of an arbitrary type.
    pub fn new(cell_type: CellType, content: impl Into<String>, role: CellRole) -> Self {
        Self {
            id: CellId::new(),
            cell_type,
            content: content.into(),
            role,
            execution_state: ExecutionState::Idle,
            execution_count: None,
            output: Vec::new(),
            metadata: CellMetadata::default(),
            created_at: crate::now_millis(),
        }
    }

    /// Create a code cell.
    pub fn code(content: impl Into<String>, role: CellRole) -> Self {
        Self::new(CellType::Code, content, role)
    }

    /// Create a markdown cell.
    pub fn markdown(content: impl Into<String>, role: CellRole) -> Self {
        Self::new(CellType::Markdown, content, role)
    }

    /// Create a transient thinking placeholder, parented to the triggering cell.
    pub fn thinking(parent: CellId) -> Self {
        let mut cell = Self::new(CellType::Thinking, "", CellRole::Assistant);
        cell.metadata.parent = Some(parent);
        cell
    }

    /// Override the generated id (bulk load, paste with explicit ids).
    pub fn with_id(mut self, id: CellId) -> Self {
        self.id = id;
        self
    }

    /// Set the parent grouping reference.
    pub fn with_parent(mut self, parent: CellId) -> Self {
        self.metadata.parent = Some(parent);
        self
    }

    /// Check if this is the transient placeholder type.
    pub fn is_thinking(&self) -> bool {
        self.cell_type == CellType::Thinking
    }

    /// Check if this is a code cell.
    pub fn is_code(&self) -> bool {
        self.cell_type == CellType::Code
    }

    /// The parent grouping reference, if any.
    pub fn parent(&self) -> Option<CellId> {
        self.metadata.parent
    }

    /// Check if this cell was demoted at finalization.
    pub fn is_staged(&self) -> bool {
        self.metadata.staged == Some(true)
    }

    /// Whether code source is currently shown. Defaults to visible.
    pub fn code_visible(&self) -> bool {
        self.metadata.is_code_visible.unwrap_or(true)
    }

    /// Whether outputs are currently shown. Defaults to visible.
    pub fn output_visible(&self) -> bool {
        self.metadata.is_output_visible.unwrap_or(true)
    }
}

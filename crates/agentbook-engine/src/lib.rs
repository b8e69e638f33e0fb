//! # agentbook-engine
//!
//! Cell management and agentic-response reconciliation for agentbook.
//!
//! The engine owns everything between the UI and the outside world:
//!
//! - [`notebook`] — the ordered cell document, parent index, active pointer,
//!   execution counter, and change events
//! - [`history`] — undo/redo snapshots and the cell clipboard
//! - [`execute`] — the bridge from interpreter event streams to output items
//!   and per-cell state transitions
//! - [`reconciler`] — the turn state machine: thinking placeholder, streamed
//!   text, tool-call materialization, staging/commit, abort
//! - [`transport`] — the two conversational adapters (realtime duplex,
//!   request/response polling) behind one contract
//! - [`tools`] — the live-swappable tool registry and the `run_code` builtin
//! - [`interchange`] — nbformat JSON load/save
//! - [`commands`] — the slash-command dispatcher
//!
//! Data flow: a transport emits [`reconciler::TurnEvent`]s → the reconciler
//! mutates the shared [`notebook::Notebook`] (directly, or through the
//! [`execute::ExecutionBridge`] for code) → the UI re-renders from notebook
//! change events. User-driven edits and executions share the same document
//! and the same invariants.

pub mod commands;
pub mod execute;
pub mod history;
pub mod interchange;
pub mod notebook;
pub mod reconciler;
pub mod tools;
pub mod transport;

pub use commands::{dispatch, Command, CommandOutcome};
pub use execute::{
    classify_event, CodeKernel, ExecuteOpts, ExecutionBridge, KernelEvent, NoopKernel, StreamName,
};
pub use history::{Clipboard, History};
pub use interchange::{load, load_into, save, InterchangeError};
pub use notebook::{
    shared_notebook, AddCell, ContentOverlay, Notebook, NotebookEvent, SharedNotebook,
};
pub use reconciler::{
    turn_event_channel, Reconciler, ToolReply, TurnError, TurnEvent, TurnSession, TurnState,
};
pub use tools::{
    invoke_tool, run_code_tool, shared_registry, SharedToolRegistry, ToolRegistry, ToolSpec,
    CODE_TOOL,
};
pub use transport::{
    polling::{AgentInput, AgentReply, AgentRequest, PollBackend, PollingTransport, ReplyItem},
    realtime::{ClientFrame, RealtimeChannel, RealtimeTransport, ServerFrame},
    conversation_history, ConnectionState, HistoryMessage, Transport, TurnConfig,
};

// Re-export the data model for downstream convenience.
pub use agentbook_types::{
    Cell, CellId, CellMetadata, CellRole, CellType, ExecutionState, KernelSpec, NotebookMetadata,
    OutputItem, OutputKind,
};

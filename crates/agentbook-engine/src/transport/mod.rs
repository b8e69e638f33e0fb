//! Conversational transport adapters.
//!
//! A transport carries one agent conversation and emits the shared
//! [`TurnEvent`](crate::reconciler::TurnEvent) vocabulary into the sink the
//! caller hands it at start. Protocol framing (wire event names, argument
//! fragment assembly, polling cadence) stays inside the adapter; the
//! reconciler sees only turn events.
//!
//! Two adapters ship: [`realtime::RealtimeTransport`] for duplex streaming
//! sessions and [`polling::PollingTransport`] for request/response backends.
//! Both expose the same observable surface, including the uniform
//! `streaming_text` contract: the partial assistant text accumulates during
//! a message and resets to `None` at message boundaries.

pub mod polling;
pub mod realtime;

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use agentbook_types::CellRole;

use crate::reconciler::TurnEvent;
use crate::tools::SharedToolRegistry;

/// Connection lifecycle of a transport.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl ConnectionState {
    /// String form for status display.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One prior conversation message replayed at session start. Staged cells
/// are excluded by the caller before building history.
#[derive(Clone, Debug)]
pub struct HistoryMessage {
    pub role: CellRole,
    pub content: String,
}

impl HistoryMessage {
    pub fn new(role: CellRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Build replayable history from a document: non-empty persistable cells in
/// document order. Staged cells were not part of the committed answer and
/// are excluded; thinking cells never replay.
pub fn conversation_history(notebook: &crate::notebook::Notebook) -> Vec<HistoryMessage> {
    notebook
        .cells()
        .iter()
        .filter(|cell| {
            cell.cell_type.is_persistable() && !cell.is_staged() && !cell.content.is_empty()
        })
        .map(|cell| HistoryMessage::new(cell.role, cell.content.clone()))
        .collect()
}

/// Per-turn session configuration handed to [`Transport::start`].
#[derive(Clone)]
pub struct TurnConfig {
    /// Where turn events are delivered.
    pub events: futures::channel::mpsc::UnboundedSender<TurnEvent>,
    /// System instructions for the session.
    pub instructions: String,
    /// Model identifier, when the backend supports selection.
    pub model: Option<String>,
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Tools available this session. Shared handle: registrations swap live.
    pub tools: SharedToolRegistry,
    /// Prior conversation to replay.
    pub history: Vec<HistoryMessage>,
}

impl TurnConfig {
    /// Config with an event sink and defaults for everything else.
    pub fn new(events: futures::channel::mpsc::UnboundedSender<TurnEvent>) -> Self {
        Self {
            events,
            instructions: String::new(),
            model: None,
            temperature: None,
            tools: crate::tools::shared_registry(),
            history: Vec::new(),
        }
    }

    /// Set the system instructions.
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    /// Select a model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set the sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Use an existing tool registry.
    pub fn with_tools(mut self, tools: SharedToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    /// Replay prior conversation history.
    pub fn with_history(mut self, history: Vec<HistoryMessage>) -> Self {
        self.history = history;
        self
    }
}

/// A conversational transport. `start`/`stop` are idempotent; `send_text`
/// while inactive logs and drops rather than failing the caller.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the session and begin emitting turn events into the sink.
    async fn start(&self, config: TurnConfig) -> anyhow::Result<()>;

    /// Tear the session down. Safe to call repeatedly or when never started.
    async fn stop(&self) -> anyhow::Result<()>;

    /// Suspend input capture without tearing the session down.
    fn pause(&self);

    /// Resume input capture.
    fn resume(&self);

    /// Send user text into the session.
    fn send_text(&self, text: &str);

    /// Human-readable phase text.
    fn status(&self) -> String;

    /// Last failure, if the transport is in a failed state.
    fn error(&self) -> Option<String>;

    /// Connection lifecycle state.
    fn connection_state(&self) -> ConnectionState;

    /// Partial assistant text: accumulates during a message, `None` at
    /// boundaries. Identical semantics on every adapter.
    fn streaming_text(&self) -> Option<String>;
}

/// Observable state shared by both adapters.
#[derive(Default)]
pub(crate) struct AdapterState {
    state: parking_lot::Mutex<ConnectionState>,
    status: parking_lot::Mutex<String>,
    error: parking_lot::Mutex<Option<String>>,
    streaming: parking_lot::Mutex<Option<String>>,
    paused: AtomicBool,
}

impl AdapterState {
    pub(crate) fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
        self.set_status(state.as_str());
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub(crate) fn set_status(&self, status: &str) {
        *self.status.lock() = status.to_string();
    }

    pub(crate) fn status(&self) -> String {
        self.status.lock().clone()
    }

    /// Record a failure and move to the failed state.
    pub(crate) fn fail(&self, message: &str) {
        *self.error.lock() = Some(message.to_string());
        self.set_state(ConnectionState::Failed);
    }

    pub(crate) fn clear_error(&self) {
        *self.error.lock() = None;
    }

    pub(crate) fn error(&self) -> Option<String> {
        self.error.lock().clone()
    }

    pub(crate) fn append_streaming(&self, text: &str) {
        let mut streaming = self.streaming.lock();
        streaming.get_or_insert_with(String::new).push_str(text);
    }

    pub(crate) fn reset_streaming(&self) {
        *self.streaming.lock() = None;
    }

    pub(crate) fn streaming(&self) -> Option<String> {
        self.streaming.lock().clone()
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

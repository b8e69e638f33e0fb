//! Conversation reconciler: agent turn events → document mutations.
//!
//! One turn runs from a user input to a settled assistant answer:
//!
//! ```text
//! idle → thinking → (streaming-text | streaming-tool-calls)* → finalizing → idle
//!                         └──────────── aborted (absorbing) ────────────┘
//! ```
//!
//! The reconciler consumes a [`TurnEvent`] stream produced by a transport
//! adapter and applies it to the shared notebook: a transient thinking cell
//! appears right after the triggering user cell, tool calls materialize as
//! code cells keyed by call id and run through the execution bridge, and at
//! finalization the answer becomes a markdown cell while intermediate cells
//! are partitioned into committed (output shown) and staged (hidden).
//!
//! Guarantees that hold on every exit path:
//! - the thinking cell never survives a turn unless it was converted into
//!   the final markdown cell;
//! - the turn guard is released, so the next turn can always start;
//! - abort is cooperative and prompt, bounded by transport chunk size.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use agentbook_types::{CellId, CellRole, CellType, ExecutionState, OutputItem};

use crate::execute::{ExecuteOpts, ExecutionBridge};
use crate::notebook::{AddCell, SharedNotebook};
use crate::tools::CODE_TOOL;

/// Default settle delay between stopping a previous turn and starting the
/// next, guaranteeing teardown ordering.
const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(200);

/// Default bound on how long a start attempt may hold the connection flag
/// before another attempt is allowed to steal it.
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Event and state vocabulary
// =============================================================================

/// Transport-agnostic events describing one agent turn. Protocol framing
/// never appears here.
#[derive(Clone, Debug)]
pub enum TurnEvent {
    /// A new protocol item opened (used for scroll/presence, no mutation).
    ItemCreated,
    /// Assistant text, accumulated onto the current agent cell.
    StreamDelta { text: String },
    /// Message boundary: the next delta replaces instead of appending.
    /// Emitted by polling transports which deliver full messages atomically.
    StreamReset,
    /// The model opened (or re-sent) a tool call. Re-entrant per `call_id`.
    /// For the code tool the reconciler answers through `reply` with the
    /// executed cell's outputs; that answer is the only execution.
    ToolCallStarted {
        call_id: String,
        name: String,
        arguments: serde_json::Value,
        reply: ToolReply,
    },
    /// The tool finished and its output went back to the model.
    ToolCallCompleted { call_id: String, output: String },
    /// The turn settled with a final answer. `committed` lists the call ids
    /// or cell ids whose results the answer declares as used.
    Finalized {
        message: String,
        committed: Vec<String>,
    },
    /// Transport or protocol failure.
    Errored { message: String },
    /// The remote side acknowledged an abort.
    Aborted,
}

/// One-shot slot carrying a tool output from the reconciler back to the
/// transport that relayed the call. Cloning shares the slot; the first
/// `send` wins and later sends are no-ops.
#[derive(Clone, Debug, Default)]
pub struct ToolReply {
    slot: Arc<parking_lot::Mutex<Option<tokio::sync::oneshot::Sender<String>>>>,
}

impl ToolReply {
    /// A connected slot/receiver pair. The receiver errors if every clone
    /// of the slot is dropped unanswered.
    pub fn channel() -> (Self, tokio::sync::oneshot::Receiver<String>) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        (
            Self {
                slot: Arc::new(parking_lot::Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// A slot nobody is waiting on, for calls that are invoked elsewhere.
    pub fn ignored() -> Self {
        Self::default()
    }

    /// Deliver the output. A missing or gone receiver is a no-op.
    pub fn send(&self, output: String) {
        if let Some(tx) = self.slot.lock().take() {
            let _ = tx.send(output);
        }
    }
}

/// Phase of the current turn.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TurnState {
    #[default]
    Idle,
    Thinking,
    Streaming,
    Finalizing,
    Aborted,
}

/// Working state for one turn.
#[derive(Debug)]
pub struct TurnSession {
    /// The triggering user cell.
    pub last_user_cell: CellId,
    /// The cell currently receiving assistant content.
    pub current_agent_cell: Option<CellId>,
    /// The transient placeholder, until converted or deleted.
    pub thinking_cell: Option<CellId>,
    /// Tool call id → materialized code cell.
    pub code_cells: HashMap<String, CellId>,
    /// Current phase.
    pub state: TurnState,
    /// Failure message, when the turn ended in error.
    pub error: Option<String>,
}

impl TurnSession {
    fn new(last_user_cell: CellId) -> Self {
        Self {
            last_user_cell,
            current_agent_cell: None,
            thinking_cell: None,
            code_cells: HashMap::new(),
            state: TurnState::Idle,
            error: None,
        }
    }
}

/// Reconciler failures that prevent a turn from starting. Failures during a
/// turn are folded into the returned session instead.
#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    /// Another turn is starting or running; this attempt was ignored.
    #[error("a turn is already in progress")]
    TurnInProgress,
    /// The triggering user cell does not exist.
    #[error("unknown cell: {0}")]
    UnknownCell(CellId),
}

// =============================================================================
// Turn guard
// =============================================================================

/// Single-active-turn guard. The connection flag is held from start attempt
/// to turn end; a stuck attempt auto-releases after `lock_timeout` so a
/// hang can never lock the user out permanently.
struct TurnGuard {
    connecting_since: Option<Instant>,
    active: Option<(u64, CancellationToken)>,
    next_id: u64,
}

impl TurnGuard {
    fn new() -> Self {
        Self {
            connecting_since: None,
            active: None,
            next_id: 0,
        }
    }
}

enum Outcome {
    Finalized,
    Errored(String),
    Aborted,
}

// =============================================================================
// Reconciler
// =============================================================================

/// Maps turn events onto notebook mutations. One instance per notebook.
pub struct Reconciler {
    notebook: SharedNotebook,
    bridge: Arc<ExecutionBridge>,
    guard: parking_lot::Mutex<TurnGuard>,
    status: parking_lot::Mutex<String>,
    settle_delay: Duration,
    lock_timeout: Duration,
}

impl Reconciler {
    /// Create a reconciler over a notebook and its execution bridge.
    pub fn new(notebook: SharedNotebook, bridge: Arc<ExecutionBridge>) -> Self {
        Self {
            notebook,
            bridge,
            guard: parking_lot::Mutex::new(TurnGuard::new()),
            status: parking_lot::Mutex::new("Idle".to_string()),
            settle_delay: DEFAULT_SETTLE_DELAY,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Override the stop-to-start settle delay.
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Override the connection-flag auto-release bound.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Transient phase text for status display.
    pub fn status(&self) -> String {
        self.status.lock().clone()
    }

    fn set_status(&self, text: &str) {
        *self.status.lock() = text.to_string();
    }

    /// Whether a turn is currently active.
    pub fn is_active(&self) -> bool {
        self.guard.lock().active.is_some()
    }

    /// Cancel the in-flight turn, if any. Cooperative: the turn observes the
    /// token at its next event boundary. Does not interrupt a running
    /// interpreter statement; that is an explicit bridge interrupt.
    pub fn abort(&self) {
        if let Some((_, token)) = &self.guard.lock().active {
            token.cancel();
        }
    }

    /// Acquire the turn slot. Stops a previous turn first (with settle
    /// delay); returns None while another start attempt is in-flight and
    /// fresh.
    async fn acquire(&self) -> Option<(u64, CancellationToken)> {
        let previous = {
            let mut guard = self.guard.lock();
            if let Some(since) = guard.connecting_since {
                if since.elapsed() < self.lock_timeout {
                    return None;
                }
                warn!("stale turn-start attempt, stealing connection flag");
            }
            guard.connecting_since = Some(Instant::now());
            guard.active.take()
        };
        if let Some((id, token)) = previous {
            debug!(turn = id, "stopping previous turn");
            token.cancel();
            tokio::time::sleep(self.settle_delay).await;
        }
        let mut guard = self.guard.lock();
        let id = guard.next_id;
        guard.next_id += 1;
        let token = CancellationToken::new();
        guard.active = Some((id, token.clone()));
        // Start complete: the flag only guards the start window itself, so a
        // later attempt can stop this (now running) turn instead of being
        // ignored.
        guard.connecting_since = None;
        Some((id, token))
    }

    /// Release the slot, but only if it still belongs to this turn (it may
    /// have been stolen by a newer start).
    fn release(&self, id: u64) {
        let mut guard = self.guard.lock();
        if guard.active.as_ref().is_some_and(|(a, _)| *a == id) {
            guard.active = None;
            guard.connecting_since = None;
        }
    }

    /// Run one turn: consume the event stream and reconcile it onto the
    /// document. Returns the settled session; transport failures and aborts
    /// are recorded on it rather than raised.
    pub async fn run_turn<S>(
        &self,
        user_cell: CellId,
        events: S,
    ) -> Result<TurnSession, TurnError>
    where
        S: Stream<Item = TurnEvent> + Unpin,
    {
        let (turn_id, token) = self.acquire().await.ok_or(TurnError::TurnInProgress)?;

        let result = self.drive(user_cell, events, &token).await;
        self.release(turn_id);
        result
    }

    async fn drive<S>(
        &self,
        user_cell: CellId,
        mut events: S,
        token: &CancellationToken,
    ) -> Result<TurnSession, TurnError>
    where
        S: Stream<Item = TurnEvent> + Unpin,
    {
        let mut session = TurnSession::new(user_cell);

        // Turn start: thinking placeholder right after the user cell.
        {
            let mut nb = self.notebook.write();
            if nb.get(user_cell).is_none() {
                return Err(TurnError::UnknownCell(user_cell));
            }
            let thinking = nb.add_cell(
                AddCell::new(CellType::Thinking, "")
                    .role(CellRole::Assistant)
                    .after(user_cell)
                    .parent(user_cell),
            );
            session.thinking_cell = Some(thinking);
            session.current_agent_cell = Some(thinking);
        }
        session.state = TurnState::Thinking;
        self.set_status("Thinking…");
        info!(user = %user_cell.short(), "turn started");

        let outcome = loop {
            tokio::select! {
                _ = token.cancelled() => break Outcome::Aborted,
                event = events.next() => match event {
                    // Stream ended without a Finalized event: settle with
                    // whatever partial content exists, nothing committed.
                    None => {
                        self.finalize(&mut session, None, &[]);
                        break Outcome::Finalized;
                    }
                    Some(TurnEvent::ItemCreated) => {
                        debug!("item created");
                    }
                    Some(TurnEvent::StreamDelta { text }) => {
                        session.state = TurnState::Streaming;
                        let cell = self.stream_target(&mut session);
                        self.notebook.write().append_cell_content(cell, &text);
                    }
                    Some(TurnEvent::StreamReset) => {
                        let cell = self.stream_target(&mut session);
                        self.notebook.write().update_cell_content(cell, "");
                    }
                    Some(TurnEvent::ToolCallStarted { call_id, name, arguments, reply }) => {
                        session.state = TurnState::Streaming;
                        self.set_status("Executing…");
                        let cell = self.materialize_tool_call(
                            &mut session, &call_id, &name, &arguments,
                        );
                        if name == CODE_TOOL {
                            // Observe abort between stream chunks: dropping
                            // the execute future leaves the cell running
                            // with whatever output already streamed.
                            tokio::select! {
                                _ = token.cancelled() => break Outcome::Aborted,
                                res = self.bridge.execute_cell(cell, ExecuteOpts::agent_run()) => {
                                    if let Err(err) = res {
                                        warn!(error = %err, "bridge execution failed");
                                    }
                                }
                            }
                            // The one execution answers the protocol call.
                            reply.send(self.cell_output_text(cell));
                        }
                    }
                    Some(TurnEvent::ToolCallCompleted { call_id, output }) => {
                        self.complete_tool_call(&session, &call_id, &output);
                    }
                    Some(TurnEvent::Finalized { message, committed }) => {
                        session.state = TurnState::Finalizing;
                        self.finalize(&mut session, Some(&message), &committed);
                        break Outcome::Finalized;
                    }
                    Some(TurnEvent::Errored { message }) => break Outcome::Errored(message),
                    Some(TurnEvent::Aborted) => break Outcome::Aborted,
                }
            }
        };

        // Unconditional cleanup: a thinking cell that was not converted into
        // the final answer must never survive, on any exit path.
        if let Some(thinking) = session.thinking_cell.take() {
            self.notebook.write().delete_cell(thinking);
            if session.current_agent_cell == Some(thinking) {
                session.current_agent_cell = None;
            }
        }

        match outcome {
            Outcome::Finalized => {
                session.state = TurnState::Idle;
                self.set_status("Idle");
                info!(user = %user_cell.short(), "turn finalized");
            }
            Outcome::Errored(message) => {
                warn!(error = %message, "turn errored");
                session.state = TurnState::Idle;
                session.error = Some(message);
                self.set_status("Error occurred");
            }
            Outcome::Aborted => {
                session.state = TurnState::Aborted;
                self.set_status("Stopped");
                info!(user = %user_cell.short(), "turn aborted");
            }
        }
        Ok(session)
    }

    /// The cell receiving streamed text. Code cells never take prose: when
    /// the current agent cell is a materialized tool call, text is routed
    /// to a fresh markdown cell after it instead of the code source.
    fn stream_target(&self, session: &mut TurnSession) -> CellId {
        let mut nb = self.notebook.write();
        if let Some(current) = session.current_agent_cell {
            let is_code = nb
                .get(current)
                .is_some_and(|c| c.cell_type == CellType::Code);
            if !is_code {
                return current;
            }
        }
        let mut spec = AddCell::new(CellType::Markdown, "")
            .role(CellRole::Assistant)
            .parent(session.last_user_cell);
        if let Some(current) = session.current_agent_cell {
            spec = spec.after(current);
        }
        let cell = nb.add_cell(spec);
        session.current_agent_cell = Some(cell);
        cell
    }

    /// Textual form of a cell's outputs, for the protocol-level function
    /// output.
    fn cell_output_text(&self, cell: CellId) -> String {
        let nb = self.notebook.read();
        let Some(cell) = nb.get(cell) else {
            return String::new();
        };
        let mut out = String::new();
        for item in &cell.output {
            out.push_str(&item.content);
            if !item.content.ends_with('\n') {
                out.push('\n');
            }
        }
        if out.is_empty() {
            out.push_str("(no output)");
        }
        out
    }

    /// Create or update the code cell for a tool call. Re-entrant per call
    /// id: repeated events update the same cell in place.
    fn materialize_tool_call(
        &self,
        session: &mut TurnSession,
        call_id: &str,
        name: &str,
        arguments: &serde_json::Value,
    ) -> CellId {
        let content = if name == CODE_TOOL {
            arguments
                .get("code")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        } else {
            serde_json::to_string_pretty(arguments).unwrap_or_default()
        };

        let mut nb = self.notebook.write();
        if let Some(&cell) = session.code_cells.get(call_id) {
            nb.update_cell_content(cell, content);
            session.current_agent_cell = Some(cell);
            return cell;
        }

        let mut spec = AddCell::new(CellType::Code, content)
            .role(CellRole::Assistant)
            .parent(session.last_user_cell);
        if let Some(current) = session.current_agent_cell {
            spec = spec.after(current);
        }
        let cell = nb.add_cell(spec);
        session.code_cells.insert(call_id.to_string(), cell);
        session.current_agent_cell = Some(cell);
        debug!(call = call_id, cell = %cell.short(), "tool call materialized");
        cell
    }

    /// Record completion for a non-executing tool cell. Code cells already
    /// carry the bridge's outputs; duplicating the transport echo would
    /// double-render them.
    fn complete_tool_call(&self, session: &TurnSession, call_id: &str, output: &str) {
        let Some(&cell) = session.code_cells.get(call_id) else {
            return;
        };
        let mut nb = self.notebook.write();
        let Some(existing) = nb.get(cell) else { return };
        if existing.execution_state == ExecutionState::Idle {
            nb.append_output(cell, OutputItem::result(output.to_string()));
            nb.update_cell_execution_state(cell, ExecutionState::Success, None);
        }
    }

    /// Write the final answer and partition the turn's children into
    /// committed (output shown) and staged (hidden).
    fn finalize(&self, session: &mut TurnSession, message: Option<&str>, committed: &[String]) {
        let mut nb = self.notebook.write();

        let final_cell = match message {
            None => None,
            Some(message) => {
                // Prefer reusing the cell already holding assistant text:
                // the thinking placeholder (converted in place) or a
                // streamed markdown cell. Code cells are never the answer.
                let reuse = session.current_agent_cell.and_then(|current| {
                    let cell = nb.get(current)?;
                    if session.thinking_cell == Some(current) {
                        Some((current, true))
                    } else if cell.cell_type == CellType::Markdown
                        && cell.role == CellRole::Assistant
                    {
                        Some((current, false))
                    } else {
                        None
                    }
                });
                let cell = match reuse {
                    Some((cell, true)) => {
                        nb.change_cell_type(cell, CellType::Markdown);
                        nb.update_cell_content(cell, message);
                        session.thinking_cell = None; // converted, not deleted
                        cell
                    }
                    Some((cell, false)) => {
                        nb.update_cell_content(cell, message);
                        cell
                    }
                    None => {
                        let mut spec = AddCell::new(CellType::Markdown, message)
                            .role(CellRole::Assistant)
                            .parent(session.last_user_cell);
                        if let Some(current) = session.current_agent_cell {
                            spec = spec.after(current);
                        }
                        nb.add_cell(spec)
                    }
                };
                session.current_agent_cell = Some(cell);
                Some(cell)
            }
        };

        for child in nb.children_of(session.last_user_cell) {
            if Some(child) == final_cell || Some(child) == session.thinking_cell {
                continue;
            }
            let is_committed = committed.iter().any(|key| {
                key == &child.to_string()
                    || key == &child.to_hex()
                    || session.code_cells.get(key) == Some(&child)
            });
            nb.set_staged(child, !is_committed);
            if is_committed {
                nb.set_visibility(child, Some(false), Some(true));
            } else {
                nb.set_visibility(child, Some(false), Some(false));
            }
        }
    }

    /// Re-run a user prompt: the cell's one-level children are deleted, the
    /// same content is re-inserted as a fresh cell at the same document
    /// position, and a new turn runs from it.
    pub async fn regenerate<S>(
        &self,
        user_cell: CellId,
        events: S,
    ) -> Result<TurnSession, TurnError>
    where
        S: Stream<Item = TurnEvent> + Unpin,
    {
        let (content, role, successor) = {
            let nb = self.notebook.read();
            let cell = nb.get(user_cell).ok_or(TurnError::UnknownCell(user_cell))?;
            let position = nb.position_of(Some(user_cell)).unwrap_or_default();
            let doomed: Vec<CellId> = nb.children_of(user_cell);
            // First cell after the user cell that survives the deletion —
            // the re-inserted cell lands just before it.
            let successor = nb.cells()[position + 1..]
                .iter()
                .map(|c| c.id)
                .find(|id| !doomed.contains(id));
            (cell.content.clone(), cell.role, successor)
        };

        let new_cell = {
            let mut nb = self.notebook.write();
            nb.delete_cell_with_children(user_cell);
            let spec = AddCell::new(CellType::Markdown, content).role(role);
            match successor {
                Some(successor) => nb.add_cell_before(spec, successor),
                None => nb.add_cell(spec),
            }
        };
        info!(old = %user_cell.short(), new = %new_cell.short(), "regenerating turn");

        self.run_turn(new_cell, events).await
    }
}

/// Channel for feeding turn events from a transport to the reconciler.
pub fn turn_event_channel() -> (
    futures::channel::mpsc::UnboundedSender<TurnEvent>,
    futures::channel::mpsc::UnboundedReceiver<TurnEvent>,
) {
    futures::channel::mpsc::unbounded()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execute::{CodeKernel, KernelEvent};
    use crate::notebook::shared_notebook;
    use agentbook_types::NotebookMetadata;
    use async_trait::async_trait;
    use futures::stream::BoxStream;

    struct EchoKernel;

    #[async_trait]
    impl CodeKernel for EchoKernel {
        fn name(&self) -> &str {
            "echo"
        }

        async fn execute(&self, code: &str) -> anyhow::Result<BoxStream<'static, KernelEvent>> {
            let out = format!("ran: {code}");
            Ok(futures::stream::iter(vec![KernelEvent::stdout(out)]).boxed())
        }

        async fn interrupt(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn is_available(&self) -> bool {
            true
        }
    }

    fn setup() -> (SharedNotebook, Reconciler, CellId) {
        let notebook = shared_notebook(NotebookMetadata::default());
        let user = notebook
            .write()
            .add_cell(AddCell::new(CellType::Markdown, "compute 2+2"));
        let bridge = Arc::new(
            ExecutionBridge::new(notebook.clone())
                .with_settle_delay(Duration::from_millis(1)),
        );
        bridge.attach_kernel(Arc::new(EchoKernel));
        let reconciler = Reconciler::new(notebook.clone(), bridge)
            .with_settle_delay(Duration::from_millis(1));
        (notebook, reconciler, user)
    }

    fn scripted(events: Vec<TurnEvent>) -> impl Stream<Item = TurnEvent> + Unpin {
        futures::stream::iter(events)
    }

    #[tokio::test]
    async fn test_text_only_turn_converts_thinking_cell() {
        let (notebook, reconciler, user) = setup();
        let session = reconciler
            .run_turn(
                user,
                scripted(vec![
                    TurnEvent::StreamDelta { text: "The answer ".into() },
                    TurnEvent::StreamDelta { text: "is 4.".into() },
                    TurnEvent::Finalized {
                        message: "The answer is 4.".into(),
                        committed: vec![],
                    },
                ]),
            )
            .await
            .unwrap();

        assert_eq!(session.state, TurnState::Idle);
        let nb = notebook.read();
        assert_eq!(nb.len(), 2);
        let answer = nb.cells().last().unwrap();
        assert_eq!(answer.cell_type, CellType::Markdown);
        assert_eq!(answer.role, CellRole::Assistant);
        assert_eq!(answer.content, "The answer is 4.");
        assert_eq!(answer.parent(), Some(user));
        assert!(nb.find_cell(|c| c.is_thinking()).is_none());
    }

    #[tokio::test]
    async fn test_tool_call_materializes_and_executes() {
        let (notebook, reconciler, user) = setup();
        let session = reconciler
            .run_turn(
                user,
                scripted(vec![
                    TurnEvent::ToolCallStarted {
                        call_id: "call-1".into(),
                        name: "run_code".into(),
                        arguments: serde_json::json!({"code": "2+2"}),
                        reply: ToolReply::ignored(),
                    },
                    TurnEvent::ToolCallCompleted {
                        call_id: "call-1".into(),
                        output: "4".into(),
                    },
                    TurnEvent::Finalized {
                        message: "It is 4.".into(),
                        committed: vec!["call-1".into()],
                    },
                ]),
            )
            .await
            .unwrap();

        let nb = notebook.read();
        let code = nb.get(session.code_cells["call-1"]).unwrap();
        assert_eq!(code.cell_type, CellType::Code);
        assert_eq!(code.content, "2+2");
        assert_eq!(code.execution_state, ExecutionState::Success);
        assert_eq!(code.output[0].content, "ran: 2+2");
        // Committed: output stays visible, code collapses, not staged.
        assert!(!code.is_staged());
        assert!(!code.code_visible());
        assert!(code.output_visible());
        assert!(nb.find_cell(|c| c.is_thinking()).is_none());
    }

    #[tokio::test]
    async fn test_uncommitted_tool_cell_is_staged() {
        let (notebook, reconciler, user) = setup();
        let session = reconciler
            .run_turn(
                user,
                scripted(vec![
                    TurnEvent::ToolCallStarted {
                        call_id: "call-1".into(),
                        name: "run_code".into(),
                        arguments: serde_json::json!({"code": "scratch()"}),
                        reply: ToolReply::ignored(),
                    },
                    TurnEvent::Finalized {
                        message: "Done without it.".into(),
                        committed: vec![],
                    },
                ]),
            )
            .await
            .unwrap();

        let nb = notebook.read();
        let code = nb.get(session.code_cells["call-1"]).unwrap();
        assert!(code.is_staged());
        assert!(!code.code_visible());
        assert!(!code.output_visible());
    }

    #[tokio::test]
    async fn test_reentrant_tool_call_updates_in_place() {
        let (notebook, reconciler, user) = setup();
        let session = reconciler
            .run_turn(
                user,
                scripted(vec![
                    TurnEvent::ToolCallStarted {
                        call_id: "call-1".into(),
                        name: "run_code".into(),
                        arguments: serde_json::json!({"code": "draft"}),
                        reply: ToolReply::ignored(),
                    },
                    TurnEvent::ToolCallStarted {
                        call_id: "call-1".into(),
                        name: "run_code".into(),
                        arguments: serde_json::json!({"code": "final"}),
                        reply: ToolReply::ignored(),
                    },
                    TurnEvent::Finalized {
                        message: "ok".into(),
                        committed: vec![],
                    },
                ]),
            )
            .await
            .unwrap();

        let nb = notebook.read();
        assert_eq!(session.code_cells.len(), 1);
        assert_eq!(nb.get(session.code_cells["call-1"]).unwrap().content, "final");
    }

    #[tokio::test]
    async fn test_code_call_answered_with_cell_outputs() {
        let (_notebook, reconciler, user) = setup();
        let (reply, rx) = ToolReply::channel();
        reconciler
            .run_turn(
                user,
                scripted(vec![
                    TurnEvent::ToolCallStarted {
                        call_id: "c1".into(),
                        name: "run_code".into(),
                        arguments: serde_json::json!({"code": "2+2"}),
                        reply,
                    },
                    TurnEvent::Finalized {
                        message: "ok".into(),
                        committed: vec![],
                    },
                ]),
            )
            .await
            .unwrap();
        // The bridge run is the only execution; its outputs answer the call.
        assert_eq!(rx.await.unwrap(), "ran: 2+2\n");
    }

    #[tokio::test]
    async fn test_prose_after_tool_call_lands_in_fresh_markdown_cell() {
        let (notebook, reconciler, user) = setup();
        let session = reconciler
            .run_turn(
                user,
                scripted(vec![
                    TurnEvent::ToolCallStarted {
                        call_id: "c1".into(),
                        name: "run_code".into(),
                        arguments: serde_json::json!({"code": "print(2+2)"}),
                        reply: ToolReply::ignored(),
                    },
                    TurnEvent::StreamDelta { text: "The answer is 4.".into() },
                    TurnEvent::Finalized {
                        message: "The answer is 4.".into(),
                        committed: vec!["c1".into()],
                    },
                ]),
            )
            .await
            .unwrap();

        let nb = notebook.read();
        // The code cell keeps its source; the prose went elsewhere.
        let code = nb.get(session.code_cells["c1"]).unwrap();
        assert_eq!(code.content, "print(2+2)");
        // user + code + answer, with the streamed cell reused as the answer.
        assert_eq!(nb.len(), 3);
        let answer = nb.cells().last().unwrap();
        assert_eq!(answer.cell_type, CellType::Markdown);
        assert_eq!(answer.role, CellRole::Assistant);
        assert_eq!(answer.content, "The answer is 4.");
    }

    #[tokio::test]
    async fn test_errored_turn_cleans_thinking_cell() {
        let (notebook, reconciler, user) = setup();
        let session = reconciler
            .run_turn(
                user,
                scripted(vec![
                    TurnEvent::StreamDelta { text: "partial".into() },
                    TurnEvent::Errored { message: "connection lost".into() },
                ]),
            )
            .await
            .unwrap();

        assert_eq!(session.error.as_deref(), Some("connection lost"));
        assert_eq!(reconciler.status(), "Error occurred");
        let nb = notebook.read();
        assert!(nb.find_cell(|c| c.is_thinking()).is_none());
        // No finalization cell either.
        assert_eq!(nb.len(), 1);
    }

    #[tokio::test]
    async fn test_stream_end_without_finalize_settles() {
        let (notebook, reconciler, user) = setup();
        let session = reconciler
            .run_turn(user, scripted(vec![TurnEvent::ItemCreated]))
            .await
            .unwrap();
        assert_eq!(session.state, TurnState::Idle);
        assert!(notebook.read().find_cell(|c| c.is_thinking()).is_none());
    }

    #[tokio::test]
    async fn test_abort_event_removes_thinking_no_finalization() {
        let (notebook, reconciler, user) = setup();
        let session = reconciler
            .run_turn(
                user,
                scripted(vec![
                    TurnEvent::StreamDelta { text: "thinking about it".into() },
                    TurnEvent::Aborted,
                ]),
            )
            .await
            .unwrap();

        assert_eq!(session.state, TurnState::Aborted);
        let nb = notebook.read();
        assert_eq!(nb.len(), 1);
        assert!(nb.find_cell(|c| c.is_thinking()).is_none());
    }

    #[tokio::test]
    async fn test_abort_handle_cancels_pending_turn() {
        let (notebook, reconciler, user) = setup();
        let reconciler = Arc::new(reconciler);
        // A stream that never yields: the turn only ends via the token.
        let events = futures::stream::pending::<TurnEvent>();

        let runner = {
            let reconciler = reconciler.clone();
            tokio::spawn(async move { reconciler.run_turn(user, events).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(reconciler.is_active());
        reconciler.abort();

        let session = runner.await.unwrap().unwrap();
        assert_eq!(session.state, TurnState::Aborted);
        assert!(!reconciler.is_active());
        assert!(notebook.read().find_cell(|c| c.is_thinking()).is_none());
    }

    #[tokio::test]
    async fn test_second_turn_stops_first() {
        let (_notebook, reconciler, user) = setup();
        let reconciler = Arc::new(reconciler);
        let first = {
            let reconciler = reconciler.clone();
            tokio::spawn(async move {
                reconciler
                    .run_turn(user, futures::stream::pending::<TurnEvent>())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = reconciler
            .run_turn(
                user,
                scripted(vec![TurnEvent::Finalized {
                    message: "second".into(),
                    committed: vec![],
                }]),
            )
            .await
            .unwrap();
        assert_eq!(second.state, TurnState::Idle);

        let first = first.await.unwrap().unwrap();
        assert_eq!(first.state, TurnState::Aborted);
    }

    #[tokio::test]
    async fn test_unknown_user_cell_rejected() {
        let (_notebook, reconciler, _user) = setup();
        let err = reconciler
            .run_turn(CellId::new(), scripted(vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, TurnError::UnknownCell(_)));
        // Guard released even on the failure path.
        assert!(!reconciler.is_active());
    }

    #[tokio::test]
    async fn test_regenerate_reinserts_at_same_position() {
        let (notebook, reconciler, user) = setup();
        // Prior turn left an answer child, plus an unrelated trailing cell.
        let old_answer = notebook.write().add_cell(
            AddCell::new(CellType::Markdown, "old answer")
                .role(CellRole::Assistant)
                .after(user)
                .parent(user),
        );
        let trailing = notebook
            .write()
            .add_cell(AddCell::new(CellType::Markdown, "trailing"));

        let session = reconciler
            .regenerate(
                user,
                scripted(vec![TurnEvent::Finalized {
                    message: "new answer".into(),
                    committed: vec![],
                }]),
            )
            .await
            .unwrap();

        let nb = notebook.read();
        assert!(nb.get(user).is_none());
        assert!(nb.get(old_answer).is_none());
        // Fresh cell, same content, at the old position (index 0).
        let new_user = nb.get(session.last_user_cell).unwrap();
        assert_ne!(new_user.id, user);
        assert_eq!(new_user.content, "compute 2+2");
        assert_eq!(nb.position_of(Some(new_user.id)), Some(0));
        assert!(nb.get(trailing).is_some());
    }

    #[tokio::test]
    async fn test_stream_reset_replaces_content() {
        let (notebook, reconciler, user) = setup();
        reconciler
            .run_turn(
                user,
                scripted(vec![
                    TurnEvent::StreamDelta { text: "first message".into() },
                    TurnEvent::StreamReset,
                    TurnEvent::StreamDelta { text: "second message".into() },
                    TurnEvent::Finalized {
                        message: "second message".into(),
                        committed: vec![],
                    },
                ]),
            )
            .await
            .unwrap();

        let nb = notebook.read();
        let answer = nb.cells().last().unwrap();
        assert_eq!(answer.content, "second message");
    }

    #[tokio::test]
    async fn test_finalize_creates_cell_when_thinking_not_current() {
        let (notebook, reconciler, user) = setup();
        let session = reconciler
            .run_turn(
                user,
                scripted(vec![
                    TurnEvent::ToolCallStarted {
                        call_id: "c1".into(),
                        name: "run_code".into(),
                        arguments: serde_json::json!({"code": "1+1"}),
                        reply: ToolReply::ignored(),
                    },
                    TurnEvent::Finalized {
                        message: "two".into(),
                        committed: vec!["c1".into()],
                    },
                ]),
            )
            .await
            .unwrap();

        let nb = notebook.read();
        // user, code cell, fresh markdown answer; thinking deleted.
        assert_eq!(nb.len(), 3);
        let answer = nb.cells().last().unwrap();
        assert_eq!(answer.cell_type, CellType::Markdown);
        assert_eq!(answer.content, "two");
        assert_ne!(Some(answer.id), session.thinking_cell);
    }
}

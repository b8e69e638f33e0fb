//! Execution bridge: interpreter event stream → output items and cell state.
//!
//! The bridge owns the idle/running/success/error state machine per code
//! cell. It consumes a [`KernelEvent`] stream from whatever interpreter is
//! attached, classifies each event into normalized [`OutputItem`]s, and
//! appends them in arrival order — intermediate renders are always a strict
//! prefix of the final render.
//!
//! Classification mapping (stable across hosts):
//!
//! | Event                         | OutputItem                         |
//! |-------------------------------|------------------------------------|
//! | Stream stdout/stderr          | stdout / stderr                    |
//! | DisplayData image/png,jpeg    | img (data-URI)                     |
//! | DisplayData text/html         | html                               |
//! | DisplayData text/plain        | stdout                             |
//! | ExecuteResult image/html      | img / html                         |
//! | ExecuteResult text/plain      | result ("no value" suppressed)     |
//! | ExecError                     | error + traceback as stderr lines  |

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use regex::Regex;
use tracing::{debug, warn};

use agentbook_types::{CellId, ExecutionState, OutputItem};

use crate::notebook::SharedNotebook;

/// Literal interpreters emit for expressions with no value. Never surfaced.
const NO_VALUE: &str = "no value";

/// Default delay before auto-collapsing a successful agent-run cell.
const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(400);

// =============================================================================
// Kernel event vocabulary
// =============================================================================

/// Which textual stream a chunk belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamName {
    Stdout,
    Stderr,
}

/// One event from the interpreter's execution stream.
#[derive(Clone, Debug)]
pub enum KernelEvent {
    /// A chunk of textual stream output.
    Stream { name: StreamName, text: String },
    /// A rich display payload, keyed by mime type. Image payloads are
    /// base64-encoded.
    DisplayData { data: BTreeMap<String, String> },
    /// The value of the final expression, keyed by mime type.
    ExecuteResult { data: BTreeMap<String, String> },
    /// An interpreter error with optional traceback lines.
    ExecError {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },
}

impl KernelEvent {
    /// Convenience constructor for a stdout chunk.
    pub fn stdout(text: impl Into<String>) -> Self {
        Self::Stream {
            name: StreamName::Stdout,
            text: text.into(),
        }
    }

    /// Convenience constructor for a stderr chunk.
    pub fn stderr(text: impl Into<String>) -> Self {
        Self::Stream {
            name: StreamName::Stderr,
            text: text.into(),
        }
    }
}

/// An attached code interpreter.
///
/// `execute` yields a stream of events for one statement batch. `interrupt`
/// signals the interpreter; it does not tear down in-flight streams (stream
/// consumers observe the effect as an error or early end event).
#[async_trait]
pub trait CodeKernel: Send + Sync {
    /// Interpreter name for status display.
    fn name(&self) -> &str;

    /// Run code, yielding events until the statement batch settles.
    async fn execute(&self, code: &str) -> anyhow::Result<BoxStream<'static, KernelEvent>>;

    /// Signal the interpreter to interrupt the running statement.
    async fn interrupt(&self) -> anyhow::Result<()>;

    /// Whether the interpreter is ready to accept work.
    async fn is_available(&self) -> bool;
}

/// Inert kernel that accepts everything and produces nothing. Useful for
/// wiring tests and for documents opened without an interpreter.
pub struct NoopKernel;

#[async_trait]
impl CodeKernel for NoopKernel {
    fn name(&self) -> &str {
        "noop"
    }

    async fn execute(&self, _code: &str) -> anyhow::Result<BoxStream<'static, KernelEvent>> {
        Ok(futures::stream::empty().boxed())
    }

    async fn interrupt(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn is_available(&self) -> bool {
        true
    }
}

// =============================================================================
// Classification
// =============================================================================

/// Map one kernel event to zero or more output items. Pure function; the
/// mapping is part of the persisted-data contract and must not drift.
pub fn classify_event(event: &KernelEvent) -> Vec<OutputItem> {
    match event {
        KernelEvent::Stream { name, text } => {
            let item = match name {
                StreamName::Stdout => OutputItem::stdout(text.clone()),
                StreamName::Stderr => OutputItem::stderr(text.clone()),
            };
            vec![item]
        }
        KernelEvent::DisplayData { data } => classify_mime_map(data, false),
        KernelEvent::ExecuteResult { data } => classify_mime_map(data, true),
        KernelEvent::ExecError {
            ename,
            evalue,
            traceback,
        } => {
            let mut items = vec![OutputItem::error(ansi_to_safe_html(&format!(
                "{ename}: {evalue}"
            )))];
            for line in traceback {
                items.push(OutputItem::stderr(ansi_to_safe_html(line)));
            }
            items
        }
    }
}

/// Richest representation wins: image, then html, then plain text. For
/// execute results plain text becomes a `result` item (with the interpreter's
/// "no value" placeholder suppressed); for display data it falls back to
/// stdout.
fn classify_mime_map(data: &BTreeMap<String, String>, is_result: bool) -> Vec<OutputItem> {
    for mime in ["image/png", "image/jpeg"] {
        if let Some(payload) = data.get(mime) {
            return vec![OutputItem::img(to_data_uri(mime, payload))];
        }
    }
    if let Some(markup) = data.get("text/html") {
        return vec![OutputItem::html(markup.clone())];
    }
    if let Some(text) = data.get("text/plain") {
        if is_result {
            if text.trim() == NO_VALUE {
                return vec![];
            }
            return vec![OutputItem::result(text.clone())];
        }
        return vec![OutputItem::stdout(text.clone())];
    }
    vec![]
}

/// Wrap a base64 image payload as a data-URI, unless it already is one.
fn to_data_uri(mime: &str, payload: &str) -> String {
    if payload.starts_with("data:") {
        payload.to_string()
    } else {
        format!("data:{mime};base64,{}", payload.trim_end())
    }
}

/// Convert ANSI-colored text to inert safe HTML: escape sequences are
/// stripped and markup-significant characters are escaped, so persisted
/// output stays plain data.
pub fn ansi_to_safe_html(text: &str) -> String {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    let re = ANSI.get_or_init(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").unwrap());
    let stripped = re.replace_all(text, "");
    stripped
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

// =============================================================================
// Bridge
// =============================================================================

/// Options for one [`ExecutionBridge::execute_cell`] call.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExecuteOpts {
    /// Move focus to the next cell before awaiting completion.
    pub move_focus: bool,
    /// Auto-collapse the cell (code hidden, output shown) after the settle
    /// delay on success. Set by agent-driven runs, not direct user runs.
    pub collapse_on_success: bool,
}

impl ExecuteOpts {
    /// Options for a direct user "Run".
    pub fn user_run() -> Self {
        Self::default()
    }

    /// Options for an agent-driven run.
    pub fn agent_run() -> Self {
        Self {
            move_focus: false,
            collapse_on_success: true,
        }
    }

    /// Enable move-focus-before-await.
    pub fn with_move_focus(mut self, yes: bool) -> Self {
        self.move_focus = yes;
        self
    }
}

/// Adapts attached-kernel streams onto notebook mutations.
pub struct ExecutionBridge {
    notebook: SharedNotebook,
    kernel: parking_lot::RwLock<Option<Arc<dyn CodeKernel>>>,
    settle_delay: Duration,
}

impl ExecutionBridge {
    /// Create a bridge with no kernel attached.
    pub fn new(notebook: SharedNotebook) -> Self {
        Self {
            notebook,
            kernel: parking_lot::RwLock::new(None),
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }

    /// Override the auto-collapse settle delay.
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Attach (or replace) the interpreter.
    pub fn attach_kernel(&self, kernel: Arc<dyn CodeKernel>) {
        *self.kernel.write() = Some(kernel);
    }

    /// Detach the interpreter. Subsequent executions become no-ops.
    pub fn detach_kernel(&self) {
        *self.kernel.write() = None;
    }

    /// Whether an interpreter is attached.
    pub fn is_attached(&self) -> bool {
        self.kernel.read().is_some()
    }

    fn kernel(&self) -> Option<Arc<dyn CodeKernel>> {
        self.kernel.read().clone()
    }

    /// Run one code cell to a terminal state.
    ///
    /// No-op (Ok) when the cell is missing, not code, or no kernel is
    /// attached. Every path that sets `running` reaches a terminal state
    /// before returning, including kernel infrastructure failures.
    pub async fn execute_cell(&self, id: CellId, opts: ExecuteOpts) -> anyhow::Result<()> {
        let Some(kernel) = self.kernel() else {
            return Ok(());
        };

        // Snapshot content and prepare state under one lock.
        let code = {
            let mut nb = self.notebook.write();
            let Some(cell) = nb.get(id) else {
                return Ok(());
            };
            if !cell.is_code() {
                return Ok(());
            }
            let code = nb.live_content(id).unwrap_or_default();
            let was_collapsed = !nb.get(id).map(|c| c.code_visible()).unwrap_or(true);

            nb.update_cell_execution_state(id, ExecutionState::Running, Some(Vec::new()));
            if was_collapsed {
                // Force-expand for the run. Marked user-modified so the
                // auto-collapse pass leaves it alone afterwards.
                nb.set_visibility(id, Some(true), None);
                nb.mark_user_modified(id);
            }
            if opts.move_focus {
                if let Some(next) = nb.next_cell(id) {
                    nb.set_active(next);
                }
            }
            code
        };

        debug!(cell = %id.short(), "executing code cell");

        let mut stream = match kernel.execute(&code).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(cell = %id.short(), error = %err, "kernel refused execution");
                self.fail_with_synthetic(id, &err.to_string());
                return Ok(());
            }
        };

        let mut saw_error = false;
        loop {
            let next = stream.next().await;
            let Some(event) = next else { break };
            if matches!(event, KernelEvent::ExecError { .. }) {
                saw_error = true;
            }
            let items = classify_event(&event);
            let mut nb = self.notebook.write();
            for item in items {
                nb.append_output(id, item);
            }
        }

        {
            let mut nb = self.notebook.write();
            if saw_error {
                // Accumulated outputs are kept.
                nb.update_cell_execution_state(id, ExecutionState::Error, None);
            } else {
                nb.update_cell_execution_state(id, ExecutionState::Success, None);
                nb.assign_execution_count(id);
            }
        }

        if !saw_error && opts.collapse_on_success {
            self.schedule_collapse(id);
        }
        Ok(())
    }

    /// Terminal error with a single synthetic item — for infrastructure
    /// failures, not code errors.
    fn fail_with_synthetic(&self, id: CellId, message: &str) {
        let mut nb = self.notebook.write();
        nb.append_output(id, OutputItem::error(ansi_to_safe_html(message)));
        nb.update_cell_execution_state(id, ExecutionState::Error, None);
    }

    /// Collapse code (keep output visible) after the settle delay, unless the
    /// user toggled visibility in the meantime. Last user intent wins.
    fn schedule_collapse(&self, id: CellId) {
        let notebook = self.notebook.clone();
        let delay = self.settle_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut nb = notebook.write();
            let Some(cell) = nb.get(id) else { return };
            if cell.metadata.user_modified {
                return;
            }
            nb.set_visibility(id, Some(false), Some(true));
        });
    }

    /// Forward an interrupt to the kernel. Does not touch cell state; the
    /// effect arrives through the execution stream.
    pub async fn interrupt(&self) -> anyhow::Result<()> {
        match self.kernel() {
            Some(kernel) => kernel.interrupt().await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notebook::{shared_notebook, AddCell};
    use agentbook_types::{CellType, NotebookMetadata, OutputKind};

    /// Kernel that replays a scripted event sequence.
    pub(crate) struct ScriptedKernel {
        events: Vec<KernelEvent>,
    }

    impl ScriptedKernel {
        pub(crate) fn new(events: Vec<KernelEvent>) -> Self {
            Self { events }
        }
    }

    #[async_trait]
    impl CodeKernel for ScriptedKernel {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn execute(&self, _code: &str) -> anyhow::Result<BoxStream<'static, KernelEvent>> {
            Ok(futures::stream::iter(self.events.clone()).boxed())
        }

        async fn interrupt(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn is_available(&self) -> bool {
            true
        }
    }

    /// Kernel whose execute call itself fails.
    struct BrokenKernel;

    #[async_trait]
    impl CodeKernel for BrokenKernel {
        fn name(&self) -> &str {
            "broken"
        }

        async fn execute(&self, _code: &str) -> anyhow::Result<BoxStream<'static, KernelEvent>> {
            anyhow::bail!("connection refused")
        }

        async fn interrupt(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn is_available(&self) -> bool {
            false
        }
    }

    fn setup(events: Vec<KernelEvent>) -> (SharedNotebook, ExecutionBridge, CellId) {
        let notebook = shared_notebook(NotebookMetadata::default());
        let id = notebook
            .write()
            .add_cell(AddCell::new(CellType::Code, "print(4)"));
        let bridge =
            ExecutionBridge::new(notebook.clone()).with_settle_delay(Duration::from_millis(1));
        bridge.attach_kernel(Arc::new(ScriptedKernel::new(events)));
        (notebook, bridge, id)
    }

    #[test]
    fn test_classify_stream() {
        let items = classify_event(&KernelEvent::stdout("hi"));
        assert_eq!(items, vec![OutputItem::stdout("hi")]);
        let items = classify_event(&KernelEvent::stderr("bad"));
        assert_eq!(items, vec![OutputItem::stderr("bad")]);
    }

    #[test]
    fn test_classify_display_data_image_wins() {
        let mut data = BTreeMap::new();
        data.insert("image/png".to_string(), "AAAA".to_string());
        data.insert("text/plain".to_string(), "<Figure>".to_string());
        let items = classify_event(&KernelEvent::DisplayData { data });
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].kind, OutputKind::Img);
        assert_eq!(items[0].content, "data:image/png;base64,AAAA");
    }

    #[test]
    fn test_classify_display_data_plain_falls_back_to_stdout() {
        let mut data = BTreeMap::new();
        data.insert("text/plain".to_string(), "hello".to_string());
        let items = classify_event(&KernelEvent::DisplayData { data });
        assert_eq!(items, vec![OutputItem::stdout("hello")]);
    }

    #[test]
    fn test_classify_execute_result_plain_is_result() {
        let mut data = BTreeMap::new();
        data.insert("text/plain".to_string(), "4".to_string());
        let items = classify_event(&KernelEvent::ExecuteResult { data });
        assert_eq!(items, vec![OutputItem::result("4")]);
    }

    #[test]
    fn test_classify_suppresses_no_value_result() {
        let mut data = BTreeMap::new();
        data.insert("text/plain".to_string(), "no value".to_string());
        let items = classify_event(&KernelEvent::ExecuteResult { data });
        assert!(items.is_empty());
    }

    #[test]
    fn test_classify_error_with_traceback() {
        let items = classify_event(&KernelEvent::ExecError {
            ename: "NameError".to_string(),
            evalue: "name 'x' is not defined".to_string(),
            traceback: vec!["\x1b[31mTraceback\x1b[0m".to_string(), "  line 1".to_string()],
        });
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].kind, OutputKind::Error);
        assert_eq!(items[0].content, "NameError: name 'x' is not defined");
        assert_eq!(items[1], OutputItem::stderr("Traceback"));
        assert_eq!(items[2], OutputItem::stderr("  line 1"));
    }

    #[test]
    fn test_ansi_to_safe_html() {
        assert_eq!(
            ansi_to_safe_html("\x1b[1;31merror\x1b[0m: <bad> & worse"),
            "error: &lt;bad&gt; &amp; worse"
        );
        assert_eq!(ansi_to_safe_html("plain"), "plain");
    }

    #[tokio::test]
    async fn test_execute_success_assigns_counter() {
        let (notebook, bridge, id) = setup(vec![
            KernelEvent::stdout("a"),
            KernelEvent::stdout("b"),
        ]);
        bridge.execute_cell(id, ExecuteOpts::user_run()).await.unwrap();

        let nb = notebook.read();
        let cell = nb.get(id).unwrap();
        assert_eq!(cell.execution_state, ExecutionState::Success);
        assert_eq!(cell.execution_count, Some(1));
        let contents: Vec<_> = cell.output.iter().map(|o| o.content.as_str()).collect();
        assert_eq!(contents, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_execute_error_keeps_outputs() {
        let (notebook, bridge, id) = setup(vec![
            KernelEvent::stdout("partial"),
            KernelEvent::ExecError {
                ename: "ValueError".to_string(),
                evalue: "boom".to_string(),
                traceback: vec![],
            },
        ]);
        bridge.execute_cell(id, ExecuteOpts::user_run()).await.unwrap();

        let nb = notebook.read();
        let cell = nb.get(id).unwrap();
        assert_eq!(cell.execution_state, ExecutionState::Error);
        assert_eq!(cell.execution_count, None);
        assert_eq!(cell.output.len(), 2);
        assert_eq!(cell.output[0].content, "partial");
        assert!(cell.output[1].is_error());
    }

    #[tokio::test]
    async fn test_output_order_matches_event_order() {
        let (notebook, bridge, id) = setup(vec![
            KernelEvent::stdout("1"),
            KernelEvent::stderr("2"),
            KernelEvent::stdout("3"),
        ]);
        bridge.execute_cell(id, ExecuteOpts::user_run()).await.unwrap();

        let nb = notebook.read();
        let kinds: Vec<_> = nb.get(id).unwrap().output.iter().map(|o| o.kind).collect();
        assert_eq!(
            kinds,
            vec![OutputKind::Stdout, OutputKind::Stderr, OutputKind::Stdout]
        );
    }

    #[tokio::test]
    async fn test_infrastructure_failure_synthetic_error() {
        let notebook = shared_notebook(NotebookMetadata::default());
        let id = notebook
            .write()
            .add_cell(AddCell::new(CellType::Code, "x"));
        let bridge = ExecutionBridge::new(notebook.clone());
        bridge.attach_kernel(Arc::new(BrokenKernel));
        bridge.execute_cell(id, ExecuteOpts::user_run()).await.unwrap();

        let nb = notebook.read();
        let cell = nb.get(id).unwrap();
        assert_eq!(cell.execution_state, ExecutionState::Error);
        assert_eq!(cell.output.len(), 1);
        assert!(cell.output[0].is_error());
        assert!(cell.output[0].content.contains("connection refused"));
    }

    #[tokio::test]
    async fn test_noop_without_kernel_or_wrong_type() {
        let notebook = shared_notebook(NotebookMetadata::default());
        let code = notebook.write().add_cell(AddCell::new(CellType::Code, "x"));
        let md = notebook
            .write()
            .add_cell(AddCell::new(CellType::Markdown, "m"));
        let bridge = ExecutionBridge::new(notebook.clone());

        // No kernel attached.
        bridge.execute_cell(code, ExecuteOpts::user_run()).await.unwrap();
        assert_eq!(
            notebook.read().get(code).unwrap().execution_state,
            ExecutionState::Idle
        );

        // Markdown cells never execute.
        bridge.attach_kernel(Arc::new(NoopKernel));
        bridge.execute_cell(md, ExecuteOpts::user_run()).await.unwrap();
        assert_eq!(
            notebook.read().get(md).unwrap().execution_state,
            ExecutionState::Idle
        );

        // Unknown id is a no-op too.
        bridge
            .execute_cell(CellId::new(), ExecuteOpts::user_run())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_move_focus_before_await() {
        let (notebook, bridge, id) = setup(vec![KernelEvent::stdout("x")]);
        let next = notebook
            .write()
            .add_cell(AddCell::new(CellType::Markdown, "next"));
        // add_cell made `next` active; put focus back on the code cell.
        notebook.write().set_active(id);
        bridge
            .execute_cell(id, ExecuteOpts::user_run().with_move_focus(true))
            .await
            .unwrap();
        assert_eq!(notebook.read().active(), Some(next));
    }

    #[tokio::test]
    async fn test_agent_run_auto_collapses_after_settle() {
        let (notebook, bridge, id) = setup(vec![KernelEvent::stdout("x")]);
        bridge.execute_cell(id, ExecuteOpts::agent_run()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let nb = notebook.read();
        let cell = nb.get(id).unwrap();
        assert!(!cell.code_visible());
        assert!(cell.output_visible());
    }

    #[tokio::test]
    async fn test_user_toggle_wins_over_auto_collapse() {
        let (notebook, bridge, id) = setup(vec![KernelEvent::stdout("x")]);
        bridge.execute_cell(id, ExecuteOpts::agent_run()).await.unwrap();
        // User toggles within the settle window.
        notebook.write().toggle_code_visibility(id);
        notebook.write().toggle_code_visibility(id);
        tokio::time::sleep(Duration::from_millis(30)).await;

        let nb = notebook.read();
        assert!(nb.get(id).unwrap().code_visible());
    }

    #[tokio::test]
    async fn test_force_expand_collapsed_cell_marks_user_modified() {
        let (notebook, bridge, id) = setup(vec![KernelEvent::stdout("x")]);
        notebook.write().set_visibility(id, Some(false), None);
        bridge.execute_cell(id, ExecuteOpts::agent_run()).await.unwrap();

        let nb = notebook.read();
        let cell = nb.get(id).unwrap();
        // Expanded for the run and left expanded (user_modified blocks the
        // auto-collapse pass).
        assert!(cell.code_visible());
        assert!(cell.metadata.user_modified);
    }

    #[tokio::test]
    async fn test_interrupt_without_kernel_ok() {
        let notebook = shared_notebook(NotebookMetadata::default());
        let bridge = ExecutionBridge::new(notebook);
        bridge.interrupt().await.unwrap();
    }
}

//! Request/response transport.
//!
//! Exchanges whole messages with an agent backend: one request out, one
//! reply in, looping while the reply asks for tool results. There is no
//! streaming on the wire, so the adapter synthesizes the uniform streaming
//! contract itself — each full message is delivered as a `StreamReset`
//! followed by one `StreamDelta` carrying the complete text, and
//! `streaming_text` is set atomically per message.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::reconciler::{ToolReply, TurnEvent};
use crate::tools::{invoke_tool, CODE_TOOL};

use super::{AdapterState, ConnectionState, HistoryMessage, Transport, TurnConfig};

/// Maximum tool-call round trips per user input, to bound a misbehaving
/// backend that never finalizes.
const MAX_EXCHANGES: usize = 32;

/// One request to the backend.
#[derive(Clone, Debug)]
pub struct AgentRequest {
    pub instructions: String,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub history: Vec<HistoryMessage>,
    pub tool_declarations: Vec<Value>,
    pub input: AgentInput,
}

/// What this request carries.
#[derive(Clone, Debug)]
pub enum AgentInput {
    /// A user message.
    UserText(String),
    /// The output of a tool call from the previous reply.
    ToolOutput { call_id: String, output: String },
}

/// One reply from the backend, as an ordered item list.
#[derive(Clone, Debug)]
pub struct AgentReply {
    pub items: Vec<ReplyItem>,
}

#[derive(Clone, Debug)]
pub enum ReplyItem {
    /// A complete assistant message.
    Message { text: String },
    /// A tool call. Arguments always arrive whole on this protocol.
    ToolCall {
        call_id: String,
        name: String,
        arguments: Value,
    },
    /// The turn settled.
    Final {
        message: String,
        committed: Vec<String>,
    },
}

/// The backend an exchange loop talks to.
#[async_trait]
pub trait PollBackend: Send + Sync {
    async fn exchange(&self, request: AgentRequest) -> anyhow::Result<AgentReply>;
}

/// Request/response adapter.
pub struct PollingTransport {
    backend: Arc<dyn PollBackend>,
    shared: Arc<AdapterState>,
    config: parking_lot::Mutex<Option<TurnConfig>>,
    cancel: parking_lot::Mutex<Option<CancellationToken>>,
}

impl PollingTransport {
    /// Build over a backend.
    pub fn new(backend: Arc<dyn PollBackend>) -> Self {
        Self {
            backend,
            shared: Arc::new(AdapterState::default()),
            config: parking_lot::Mutex::new(None),
            cancel: parking_lot::Mutex::new(None),
        }
    }

    fn request(&self, config: &TurnConfig, input: AgentInput) -> AgentRequest {
        AgentRequest {
            instructions: config.instructions.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
            history: config.history.clone(),
            tool_declarations: config.tools.read().declarations(),
            input,
        }
    }
}

/// Drive one user input to a settled reply, resolving tool calls between
/// exchanges: code calls are answered by the conversation engine, other
/// tools are invoked locally. Every message is emitted as reset-then-delta.
async fn exchange_loop(
    backend: Arc<dyn PollBackend>,
    transport: Arc<AdapterState>,
    config: TurnConfig,
    first: AgentRequest,
    cancel: CancellationToken,
) {
    let events = &config.events;
    let mut request = first;

    for _ in 0..MAX_EXCHANGES {
        let reply = tokio::select! {
            _ = cancel.cancelled() => return,
            reply = backend.exchange(request.clone()) => reply,
        };
        let reply = match reply {
            Ok(reply) => reply,
            Err(err) => {
                transport.fail(&err.to_string());
                transport.reset_streaming();
                let _ = events.unbounded_send(TurnEvent::Errored {
                    message: err.to_string(),
                });
                return;
            }
        };

        let mut next_input = None;
        for item in reply.items {
            if cancel.is_cancelled() {
                return;
            }
            match item {
                ReplyItem::Message { text } => {
                    let _ = events.unbounded_send(TurnEvent::ItemCreated);
                    // Atomic set, expressed through the uniform contract.
                    transport.reset_streaming();
                    transport.append_streaming(&text);
                    let _ = events.unbounded_send(TurnEvent::StreamReset);
                    let _ = events.unbounded_send(TurnEvent::StreamDelta { text });
                }
                ReplyItem::ToolCall {
                    call_id,
                    name,
                    arguments,
                } => {
                    debug!(call = %call_id, tool = %name, "tool call");
                    let output = if name == CODE_TOOL {
                        // Code runs once, as a cell: forward the call and
                        // wait for the executed cell's outputs.
                        let (reply, rx) = ToolReply::channel();
                        let _ = events.unbounded_send(TurnEvent::ToolCallStarted {
                            call_id: call_id.clone(),
                            name: name.clone(),
                            arguments: arguments.clone(),
                            reply,
                        });
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            out = rx => out.unwrap_or_else(|_| {
                                "Error: code execution unavailable".to_string()
                            }),
                        }
                    } else {
                        let _ = events.unbounded_send(TurnEvent::ToolCallStarted {
                            call_id: call_id.clone(),
                            name: name.clone(),
                            arguments: arguments.clone(),
                            reply: ToolReply::ignored(),
                        });
                        invoke_tool(&config.tools, &name, arguments).await
                    };
                    let _ = events.unbounded_send(TurnEvent::ToolCallCompleted {
                        call_id: call_id.clone(),
                        output: output.clone(),
                    });
                    next_input = Some(AgentInput::ToolOutput { call_id, output });
                }
                ReplyItem::Final { message, committed } => {
                    transport.reset_streaming();
                    let _ = events.unbounded_send(TurnEvent::Finalized { message, committed });
                    return;
                }
            }
        }

        match next_input {
            Some(input) => request.input = input,
            // Nothing left to feed back and no Final item: settle with what
            // we have rather than spinning.
            None => {
                transport.reset_streaming();
                let _ = events.unbounded_send(TurnEvent::Finalized {
                    message: String::new(),
                    committed: vec![],
                });
                return;
            }
        }
    }

    warn!("exchange limit reached without finalization");
    let _ = events.unbounded_send(TurnEvent::Errored {
        message: "exchange limit reached".to_string(),
    });
}

#[async_trait]
impl Transport for PollingTransport {
    /// No handshake on this protocol: start records the config and reports
    /// connected immediately.
    async fn start(&self, config: TurnConfig) -> anyhow::Result<()> {
        if self.config.lock().is_some() {
            return Ok(());
        }
        *self.config.lock() = Some(config);
        self.shared.clear_error();
        self.shared.set_state(ConnectionState::Connected);
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }
        self.config.lock().take();
        self.shared.reset_streaming();
        self.shared.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    /// State flag only; no session to tear down.
    fn pause(&self) {
        self.shared.set_paused(true);
    }

    fn resume(&self) {
        self.shared.set_paused(false);
    }

    fn send_text(&self, text: &str) {
        if self.shared.is_paused() {
            warn!("send_text while paused, dropped");
            return;
        }
        let Some(config) = self.config.lock().clone() else {
            warn!("send_text while inactive, dropped");
            return;
        };
        // One in-flight exchange loop at a time.
        let cancel = CancellationToken::new();
        if let Some(previous) = self.cancel.lock().replace(cancel.clone()) {
            previous.cancel();
        }
        let request = self.request(&config, AgentInput::UserText(text.to_string()));
        tokio::spawn(exchange_loop(
            self.backend.clone(),
            self.shared.clone(),
            config,
            request,
            cancel,
        ));
    }

    fn status(&self) -> String {
        self.shared.status()
    }

    fn error(&self) -> Option<String> {
        self.shared.error()
    }

    fn connection_state(&self) -> ConnectionState {
        self.shared.state()
    }

    fn streaming_text(&self) -> Option<String> {
        self.shared.streaming()
    }
}

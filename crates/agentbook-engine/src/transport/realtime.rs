//! Duplex streaming transport.
//!
//! Wraps a realtime session carried over a peer-to-peer data channel. The
//! media/socket layer is a collaborator injected as a [`RealtimeChannel`];
//! this adapter owns the protocol: session configuration, fragmented
//! tool-call argument assembly, tool-call resolution (code calls are
//! answered by the conversation engine, other tools run locally), and
//! translation of wire frames into turn events.
//!
//! Tool-call arguments arrive as fragments keyed by the call index within
//! the response. Fragments are buffered until the done frame declares the
//! call complete, then parsed and dispatched in one piece; the reconciler
//! never sees a partial argument string.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::channel::mpsc::UnboundedSender;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::reconciler::{ToolReply, TurnEvent};
use crate::tools::{invoke_tool, CODE_TOOL};

use super::{AdapterState, ConnectionState, Transport, TurnConfig};

/// Frames received from the remote session.
#[derive(Clone, Debug)]
pub enum ServerFrame {
    /// Session handshake completed.
    SessionCreated,
    /// A new response item opened.
    ItemCreated,
    /// Assistant text fragment.
    TextDelta { text: String },
    /// Voice transcript fragment (treated identically to text).
    TranscriptDelta { text: String },
    /// Tool-call argument fragment, keyed by call index.
    FunctionCallDelta { call_index: u32, delta: String },
    /// Tool-call arguments complete.
    FunctionCallDone {
        call_index: u32,
        call_id: String,
        name: String,
    },
    /// The response settled.
    ResponseDone {
        message: String,
        committed: Vec<String>,
    },
    /// Protocol-level failure.
    Error { message: String },
}

/// Frames sent to the remote session.
#[derive(Clone, Debug)]
pub enum ClientFrame {
    /// Configure instructions, tools, and sampling.
    SessionUpdate {
        instructions: String,
        tools: Vec<Value>,
        temperature: Option<f32>,
    },
    /// User text input.
    UserText { text: String },
    /// Output of a locally-invoked tool, fed back into the protocol.
    FunctionOutput { call_id: String, output: String },
    /// Ask the model to respond.
    ResponseCreate,
}

/// The injected duplex wire. The media layer (peer connection, audio
/// capture) lives behind this pair.
pub struct RealtimeChannel {
    pub incoming: mpsc::Receiver<ServerFrame>,
    pub outgoing: mpsc::UnboundedSender<ClientFrame>,
}

struct Session {
    outgoing: mpsc::UnboundedSender<ClientFrame>,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

/// Streaming duplex adapter.
pub struct RealtimeTransport {
    shared: Arc<AdapterState>,
    channel: parking_lot::Mutex<Option<RealtimeChannel>>,
    session: parking_lot::Mutex<Option<Session>>,
}

impl RealtimeTransport {
    /// Build over an injected wire. The channel is consumed by the first
    /// successful start; after a stop or wire failure, hand a fresh wire to
    /// [`reconnect`](Self::reconnect) before starting again.
    pub fn new(channel: RealtimeChannel) -> Self {
        Self {
            shared: Arc::new(AdapterState::default()),
            channel: parking_lot::Mutex::new(Some(channel)),
            session: parking_lot::Mutex::new(None),
        }
    }

    /// Re-arm the transport with a fresh wire. The next start consumes it;
    /// a wire that was already waiting is replaced.
    pub fn reconnect(&self, channel: RealtimeChannel) {
        *self.channel.lock() = Some(channel);
    }

    fn send_frame(&self, frame: ClientFrame) -> bool {
        let session = self.session.lock();
        match session.as_ref() {
            Some(session) => session.outgoing.send(frame).is_ok(),
            None => false,
        }
    }
}

/// Frame loop state: buffered argument fragments per call index.
struct FrameAssembler {
    fragments: HashMap<u32, String>,
}

impl FrameAssembler {
    fn new() -> Self {
        Self {
            fragments: HashMap::new(),
        }
    }

    fn push(&mut self, call_index: u32, delta: &str) {
        self.fragments.entry(call_index).or_default().push_str(delta);
    }

    fn take(&mut self, call_index: u32) -> Value {
        let raw = self.fragments.remove(&call_index).unwrap_or_default();
        serde_json::from_str(&raw).unwrap_or_else(|err| {
            warn!(call_index, error = %err, "unparseable tool arguments");
            Value::Null
        })
    }
}

async fn frame_loop(
    mut incoming: mpsc::Receiver<ServerFrame>,
    outgoing: mpsc::UnboundedSender<ClientFrame>,
    config: TurnConfig,
    shared: Arc<AdapterState>,
    cancel: CancellationToken,
) {
    let events = &config.events;
    let mut assembler = FrameAssembler::new();

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = incoming.recv() => match frame {
                Some(frame) => frame,
                None => {
                    // Wire dropped underneath us.
                    if shared.state() == ConnectionState::Connected {
                        shared.fail("connection closed");
                        emit(events, TurnEvent::Errored {
                            message: "connection closed".to_string(),
                        });
                    }
                    break;
                }
            },
        };

        match frame {
            ServerFrame::SessionCreated => {
                shared.set_state(ConnectionState::Connected);
                shared.clear_error();
                // Declare tools from the live registry snapshot.
                let declarations = config.tools.read().declarations();
                let _ = outgoing.send(ClientFrame::SessionUpdate {
                    instructions: config.instructions.clone(),
                    tools: declarations,
                    temperature: config.temperature,
                });
                for message in &config.history {
                    let _ = outgoing.send(ClientFrame::UserText {
                        text: message.content.clone(),
                    });
                }
            }
            ServerFrame::ItemCreated => emit(events, TurnEvent::ItemCreated),
            ServerFrame::TextDelta { text } | ServerFrame::TranscriptDelta { text } => {
                shared.append_streaming(&text);
                emit(events, TurnEvent::StreamDelta { text });
            }
            ServerFrame::FunctionCallDelta { call_index, delta } => {
                assembler.push(call_index, &delta);
            }
            ServerFrame::FunctionCallDone {
                call_index,
                call_id,
                name,
            } => {
                let arguments = assembler.take(call_index);
                debug!(call = %call_id, tool = %name, "tool call complete");
                let output = if name == CODE_TOOL {
                    // Code runs once, as a cell: forward the call and wait
                    // for the executed cell's outputs.
                    let (reply, rx) = ToolReply::channel();
                    emit(
                        events,
                        TurnEvent::ToolCallStarted {
                            call_id: call_id.clone(),
                            name: name.clone(),
                            arguments: arguments.clone(),
                            reply,
                        },
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        out = rx => out.unwrap_or_else(|_| {
                            "Error: code execution unavailable".to_string()
                        }),
                    }
                } else {
                    emit(
                        events,
                        TurnEvent::ToolCallStarted {
                            call_id: call_id.clone(),
                            name: name.clone(),
                            arguments: arguments.clone(),
                            reply: ToolReply::ignored(),
                        },
                    );
                    // Invoke locally; failures fold into the output text.
                    invoke_tool(&config.tools, &name, arguments).await
                };
                let _ = outgoing.send(ClientFrame::FunctionOutput {
                    call_id: call_id.clone(),
                    output: output.clone(),
                });
                let _ = outgoing.send(ClientFrame::ResponseCreate);
                emit(events, TurnEvent::ToolCallCompleted { call_id, output });
            }
            ServerFrame::ResponseDone { message, committed } => {
                shared.reset_streaming();
                emit(events, TurnEvent::Finalized { message, committed });
            }
            ServerFrame::Error { message } => {
                shared.fail(&message);
                shared.reset_streaming();
                emit(events, TurnEvent::Errored { message });
            }
        }
    }
}

fn emit(events: &UnboundedSender<TurnEvent>, event: TurnEvent) {
    if events.unbounded_send(event).is_err() {
        debug!("event sink closed, frame dropped");
    }
}

#[async_trait]
impl Transport for RealtimeTransport {
    async fn start(&self, config: TurnConfig) -> anyhow::Result<()> {
        if self.session.lock().is_some() {
            // Already connected: the attempt is ignored.
            return Ok(());
        }
        let Some(channel) = self.channel.lock().take() else {
            anyhow::bail!("realtime channel already consumed");
        };
        self.shared.set_state(ConnectionState::Connecting);
        self.shared.clear_error();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(frame_loop(
            channel.incoming,
            channel.outgoing.clone(),
            config,
            self.shared.clone(),
            cancel.clone(),
        ));
        *self.session.lock() = Some(Session {
            outgoing: channel.outgoing,
            cancel,
            task,
        });
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        let Some(session) = self.session.lock().take() else {
            return Ok(());
        };
        session.cancel.cancel();
        session.task.abort();
        self.shared.reset_streaming();
        self.shared.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    /// Mute input capture. The session stays up.
    fn pause(&self) {
        self.shared.set_paused(true);
    }

    fn resume(&self) {
        self.shared.set_paused(false);
    }

    fn send_text(&self, text: &str) {
        if self.shared.is_paused() || self.connection_state() != ConnectionState::Connected {
            warn!("send_text while inactive, dropped");
            return;
        }
        let text = text.to_string();
        if self.send_frame(ClientFrame::UserText { text }) {
            self.send_frame(ClientFrame::ResponseCreate);
        } else {
            warn!("send_text with no session, dropped");
        }
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

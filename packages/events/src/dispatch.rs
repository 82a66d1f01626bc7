// ABOUTME: Routes decoded agent events to a caller-supplied handler
// ABOUTME: Tracks conversation id and in-progress state across one streamed exchange

use crate::error::{EventStreamError, FrameError};
use crate::event::{AgentEvent, ToolCall, ToolResult, CONVERSATION_STARTED, ERROR};
use crate::frame::{EventFrame, FrameDecoder};
use futures::{Stream, StreamExt};
use serde_json::Value;
use tracing::{debug, info, warn};

/// Callbacks for each event kind. Every method defaults to a no-op except
/// `on_unknown`, which logs the discriminator it was handed.
pub trait EventHandler {
    fn on_message(&mut self, _role: Option<&str>, _content: &str) {}

    fn on_tool_call(&mut self, _call: &ToolCall) {}

    fn on_tool_result(&mut self, _result: &ToolResult) {}

    fn on_status(&mut self, _message: &str) {}

    fn on_done(&mut self) {}

    fn on_error(&mut self, _message: &str) {}

    fn on_unknown(&mut self, kind: &str, _payload: &Value) {
        debug!(kind = %kind, "No handler for event type");
    }
}

/// Caller-visible state for one conversation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamSession {
    pub conversation_id: Option<String>,
    pub in_progress: bool,
}

impl StreamSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_conversation(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: Some(conversation_id.into()),
            in_progress: false,
        }
    }

    /// Mark a request as sent and awaiting events
    pub fn begin(&mut self) {
        self.in_progress = true;
    }
}

/// What the dispatcher did with one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    /// Consumed internally to update the session
    SessionUpdated,
    /// Consumed without effect because the payload was unusable
    Dropped,
    Forwarded,
}

#[derive(Debug, Default)]
pub struct Dispatcher {
    session: StreamSession,
}

impl Dispatcher {
    pub fn new(session: StreamSession) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &StreamSession {
        &self.session
    }

    pub fn into_session(self) -> StreamSession {
        self.session
    }

    pub fn dispatch<H: EventHandler + ?Sized>(
        &mut self,
        frame: EventFrame,
        handler: &mut H,
    ) -> Dispatched {
        // Fault frames end the exchange before any handler sees them
        if frame.kind == ERROR {
            self.session.in_progress = false;
        }

        match AgentEvent::from_frame(frame) {
            AgentEvent::ConversationStarted { conversation_id } => {
                info!(conversation_id = %conversation_id, "Conversation started");
                self.session.conversation_id = Some(conversation_id);
                return Dispatched::SessionUpdated;
            }
            AgentEvent::Message { role, content } => handler.on_message(role.as_deref(), &content),
            AgentEvent::ToolCall(call) => handler.on_tool_call(&call),
            AgentEvent::ToolResult(result) => handler.on_tool_result(&result),
            AgentEvent::Status { message } => handler.on_status(&message),
            AgentEvent::Done => {
                self.session.in_progress = false;
                handler.on_done();
            }
            AgentEvent::Error { message } => {
                warn!("Agent reported an error: {}", message);
                handler.on_error(&message);
            }
            AgentEvent::Unknown { kind, .. } if kind == CONVERSATION_STARTED => {
                warn!("Ignoring conversation_started frame without a conversation id");
                return Dispatched::Dropped;
            }
            AgentEvent::Unknown { kind, payload } => handler.on_unknown(&kind, &payload),
        }
        Dispatched::Forwarded
    }
}

/// Counters for one consumed stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamSummary {
    pub frames: usize,
    pub malformed: usize,
    pub discarded_bytes: usize,
    pub truncated: bool,
}

/// Decoder and dispatcher joined over one response body
#[derive(Debug, Default)]
pub struct EventStream {
    decoder: FrameDecoder,
    dispatcher: Dispatcher,
    summary: StreamSummary,
}

impl EventStream {
    pub fn new(session: StreamSession) -> Self {
        Self::with_decoder(FrameDecoder::new(), session)
    }

    pub fn with_decoder(decoder: FrameDecoder, session: StreamSession) -> Self {
        Self {
            decoder,
            dispatcher: Dispatcher::new(session),
            summary: StreamSummary::default(),
        }
    }

    pub fn session(&self) -> &StreamSession {
        self.dispatcher.session()
    }

    pub fn into_session(self) -> StreamSession {
        self.dispatcher.into_session()
    }

    /// Decode one chunk and dispatch its frames; returns how many were dispatched
    pub fn process_chunk<H: EventHandler + ?Sized>(&mut self, chunk: &[u8], handler: &mut H) -> usize {
        let mut dispatched = 0;
        for result in self.decoder.feed(chunk) {
            match result {
                Ok(frame) => {
                    self.dispatcher.dispatch(frame, handler);
                    self.summary.frames += 1;
                    dispatched += 1;
                }
                Err(e) => self.record_frame_error(e),
            }
        }
        dispatched
    }

    /// Flush the decoder at end of body. The exchange is over either way.
    pub fn finish(&mut self) -> StreamSummary {
        if let Some(e) = self.decoder.finish() {
            self.summary.truncated = true;
            self.record_frame_error(e);
        }
        self.dispatcher.session.in_progress = false;
        self.summary.discarded_bytes = self.decoder.discarded_bytes();
        self.summary.clone()
    }

    fn record_frame_error(&mut self, error: FrameError) {
        match &error {
            FrameError::Malformed { len, .. } => {
                warn!(bytes = len, "Skipping malformed event frame: {}", error);
                self.summary.malformed += 1;
            }
            FrameError::TooLarge { .. } | FrameError::Truncated { .. } => {
                warn!("Dropping event frame: {}", error);
            }
        }
    }
}

/// Drive `events` over any byte stream until it ends or yields an error
pub async fn consume_stream<S, B, E, H>(
    stream: S,
    events: &mut EventStream,
    handler: &mut H,
) -> Result<StreamSummary, EventStreamError>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Into<EventStreamError>,
    H: EventHandler + ?Sized,
{
    let mut stream = std::pin::pin!(stream);
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                events.process_chunk(bytes.as_ref(), handler);
            }
            Err(e) => {
                events.finish();
                return Err(e.into());
            }
        }
    }
    Ok(events.finish())
}

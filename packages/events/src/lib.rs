// ABOUTME: Framed agent event stream support for Tether
// ABOUTME: Decodes <event> frames from chunked HTTP bodies and dispatches typed events to handlers

pub mod client;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod frame;

pub use client::AgentStreamClient;
pub use dispatch::{
    consume_stream, Dispatched, Dispatcher, EventHandler, EventStream, StreamSession, StreamSummary,
};
pub use error::{EventStreamError, FrameError, Result};
pub use event::{AgentEvent, ToolCall, ToolResult};
pub use frame::{EventFrame, FrameDecoder, DEFAULT_MAX_FRAME_LEN};

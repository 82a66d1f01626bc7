// ABOUTME: HTTP client for the agent conversation endpoint
// ABOUTME: Posts a message and decodes the chunked <event> stream that comes back

use crate::dispatch::{consume_stream, EventHandler, EventStream, StreamSession, StreamSummary};
use crate::error::{EventStreamError, FrameError, Result};
use crate::event::AgentEvent;
use crate::frame::FrameDecoder;
use futures::Stream;
use reqwest::{Client, Response};
use serde::Serialize;
use std::time::Duration;
use tether_config::Settings;
use tracing::{error, info, warn};

const MESSAGES_PATH: &str = "/conversations/messages";

#[derive(Debug, Serialize)]
struct MessageRequest<'a> {
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    conversation_id: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct AgentStreamClient {
    client: Client,
    base_url: String,
}

impl AgentStreamClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_connect_timeout(base_url, Duration::from_secs(10))
    }

    pub fn with_connect_timeout(base_url: impl Into<String>, connect_timeout: Duration) -> Result<Self> {
        // No overall timeout: the response body stays open for the whole exchange
        let client = Client::builder().connect_timeout(connect_timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Self::with_connect_timeout(settings.agent_api_url.clone(), settings.http_connect_timeout)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post_message(&self, message: &str, conversation_id: Option<&str>) -> Result<Response> {
        let url = format!("{}{}", self.base_url, MESSAGES_PATH);
        info!(url = %url, conversation_id = ?conversation_id, "Sending message to agent");

        let response = self
            .client
            .post(&url)
            .json(&MessageRequest {
                message,
                conversation_id,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            error!("Agent API error: {} - {}", status, message);
            return Err(EventStreamError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }

    /// Send `message` and dispatch every event to `handler` until the body ends.
    ///
    /// `session` is marked in progress for the duration of the exchange and
    /// picks up the conversation id if the agent starts a new conversation.
    pub async fn send_message<H: EventHandler + ?Sized>(
        &self,
        message: &str,
        session: &mut StreamSession,
        handler: &mut H,
    ) -> Result<StreamSummary> {
        let response = self
            .post_message(message, session.conversation_id.as_deref())
            .await?;

        session.begin();
        let mut events = EventStream::new(std::mem::take(session));
        let result = consume_stream(response.bytes_stream(), &mut events, handler).await;
        *session = events.into_session();

        let summary = result?;
        info!(
            frames = summary.frames,
            malformed = summary.malformed,
            "Agent stream finished"
        );
        Ok(summary)
    }

    /// Send `message` and yield decoded events as they arrive, including
    /// `ConversationStarted`. Malformed frames are logged and skipped.
    pub async fn stream_events(
        &self,
        message: &str,
        conversation_id: Option<&str>,
    ) -> Result<impl Stream<Item = Result<AgentEvent>>> {
        let response = self.post_message(message, conversation_id).await?;

        let stream = async_stream::stream! {
            use futures::StreamExt;
            let mut byte_stream = response.bytes_stream();
            let mut decoder = FrameDecoder::new();

            while let Some(chunk_result) = byte_stream.next().await {
                match chunk_result {
                    Ok(bytes) => {
                        for frame in decoder.feed(&bytes) {
                            match frame {
                                Ok(frame) => yield Ok(AgentEvent::from_frame(frame)),
                                Err(e) => match &e {
                                    FrameError::Malformed { len, .. } => {
                                        warn!(bytes = len, "Skipping malformed event frame: {}", e);
                                    }
                                    _ => warn!("Dropping event frame: {}", e),
                                },
                            }
                        }
                    }
                    Err(e) => {
                        yield Err(EventStreamError::Http(e));
                        return;
                    }
                }
            }

            if let Some(e) = decoder.finish() {
                warn!("Dropping event frame: {}", e);
            }
        };

        Ok(stream)
    }
}

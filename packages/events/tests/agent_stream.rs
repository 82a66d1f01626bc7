// ABOUTME: Integration tests for the agent event stream client and decoder
// ABOUTME: Serve framed bodies from a mock agent API and feed hand-chunked streams

use futures::StreamExt;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tether_config::constants::TETHER_LOG;
use tether_events::{
    consume_stream, AgentEvent, AgentStreamClient, EventHandler, EventStream, EventStreamError,
    StreamSession, ToolCall,
};
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env(TETHER_LOG)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

fn frame(kind: &str, payload: Value) -> String {
    format!(
        "<event>{}</event>",
        json!({"data": {"type": kind, "payload": payload, "timestamp": "2024-05-01T12:00:00Z"}})
    )
}

#[derive(Default)]
struct Transcript {
    lines: Vec<String>,
}

impl EventHandler for Transcript {
    fn on_message(&mut self, role: Option<&str>, content: &str) {
        self.lines.push(format!("{}: {}", role.unwrap_or("agent"), content));
    }

    fn on_tool_call(&mut self, call: &ToolCall) {
        self.lines.push(format!("call {}", call.name));
    }

    fn on_status(&mut self, message: &str) {
        self.lines.push(format!("status {}", message));
    }

    fn on_done(&mut self) {
        self.lines.push("done".to_string());
    }

    fn on_error(&mut self, message: &str) {
        self.lines.push(format!("error {}", message));
    }

    fn on_unknown(&mut self, kind: &str, _payload: &Value) {
        self.lines.push(format!("unknown {}", kind));
    }
}

fn conversation_body() -> String {
    [
        frame("conversation_started", json!({"conversation_id": "conv-42"})),
        "Some narration the agent emitted outside of any frame.\n".to_string(),
        frame("status", json!({"message": "thinking"})),
        frame("tool_call", json!({"id": "t1", "name": "list_files", "arguments": {"path": "."}})),
        "<event>{\"data\": oops}</event>".to_string(),
        frame("message", json!({"role": "assistant", "content": "Found 3 files ✓"})),
        frame("plan_updated", json!({"steps": ["a", "b"]})),
        frame("done", json!({})),
    ]
    .concat()
}

#[tokio::test]
async fn test_send_message_dispatches_events_and_tracks_session() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/conversations/messages"))
        .and(body_json(json!({"message": "list my files"})))
        .respond_with(ResponseTemplate::new(200).set_body_string(conversation_body()))
        .expect(1)
        .mount(&server)
        .await;

    let client = AgentStreamClient::new(format!("{}/", server.uri())).unwrap();
    let mut session = StreamSession::new();
    let mut transcript = Transcript::default();

    let summary = client
        .send_message("list my files", &mut session, &mut transcript)
        .await
        .unwrap();

    assert_eq!(
        transcript.lines,
        vec![
            "status thinking",
            "call list_files",
            "assistant: Found 3 files ✓",
            "unknown plan_updated",
            "done",
        ]
    );
    assert_eq!(session.conversation_id.as_deref(), Some("conv-42"));
    assert!(!session.in_progress);
    assert_eq!(summary.frames, 6);
    assert_eq!(summary.malformed, 1);
    assert!(!summary.truncated);
}

#[tokio::test]
async fn test_follow_up_message_carries_conversation_id() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/conversations/messages"))
        .and(body_json(json!({"message": "and now?", "conversation_id": "conv-42"})))
        .respond_with(ResponseTemplate::new(200).set_body_string(frame(
            "error",
            json!({"error": "model overloaded"}),
        )))
        .expect(1)
        .mount(&server)
        .await;

    let client = AgentStreamClient::new(server.uri()).unwrap();
    let mut session = StreamSession::with_conversation("conv-42");
    let mut transcript = Transcript::default();

    client
        .send_message("and now?", &mut session, &mut transcript)
        .await
        .unwrap();

    assert_eq!(transcript.lines, vec!["error model overloaded"]);
    assert_eq!(session.conversation_id.as_deref(), Some("conv-42"));
    assert!(!session.in_progress);
}

#[tokio::test]
async fn test_api_error_status_is_reported() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/conversations/messages"))
        .respond_with(ResponseTemplate::new(503).set_body_string("try later"))
        .mount(&server)
        .await;

    let client = AgentStreamClient::new(server.uri()).unwrap();
    let mut session = StreamSession::new();
    let err = client
        .send_message("hello", &mut session, &mut Transcript::default())
        .await
        .unwrap_err();

    match err {
        EventStreamError::Api { status, message } => {
            assert_eq!(status, 503);
            assert_eq!(message, "try later");
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(!session.in_progress);
}

#[tokio::test]
async fn test_stream_events_yields_typed_events() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/conversations/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_string(conversation_body()))
        .mount(&server)
        .await;

    let client = AgentStreamClient::new(server.uri()).unwrap();
    let events: Vec<AgentEvent> = client
        .stream_events("list my files", None)
        .await
        .unwrap()
        .map(|event| event.unwrap())
        .collect()
        .await;

    let kinds: Vec<&str> = events.iter().map(AgentEvent::kind).collect();
    assert_eq!(
        kinds,
        vec![
            "conversation_started",
            "status",
            "tool_call",
            "message",
            "plan_updated",
            "done",
        ]
    );
    assert_eq!(
        events[0],
        AgentEvent::ConversationStarted {
            conversation_id: "conv-42".into()
        }
    );
}

#[tokio::test]
async fn test_consume_stream_over_arbitrary_chunking() {
    init_tracing();
    let body = conversation_body();
    let bytes = body.as_bytes();

    for chunk_size in [1, 2, 3, 7, 13, 64, bytes.len()] {
        let chunks: Vec<Result<Vec<u8>, std::io::Error>> =
            bytes.chunks(chunk_size).map(|c| Ok(c.to_vec())).collect();

        let mut session = StreamSession::new();
        session.begin();
        let mut events = EventStream::new(session);
        let mut transcript = Transcript::default();

        let summary = consume_stream(futures::stream::iter(chunks), &mut events, &mut transcript)
            .await
            .unwrap();

        assert_eq!(transcript.lines.len(), 5, "chunk size {}", chunk_size);
        assert_eq!(transcript.lines[2], "assistant: Found 3 files ✓");
        assert_eq!(summary.frames, 6);
        assert_eq!(summary.malformed, 1);
        assert_eq!(events.session().conversation_id.as_deref(), Some("conv-42"));
    }
}

#[tokio::test]
async fn test_consume_stream_stops_on_transport_error() {
    init_tracing();
    let chunks: Vec<Result<&[u8], std::io::Error>> = vec![
        Ok(&b"<event>{\"data\":{\"type\":\"status\",\"payload\":{\"message\":\"working\"}}}</event><event>{\"da"[..]),
        Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
        Ok(&b"ta\":{}}</event>"[..]),
    ];

    let mut session = StreamSession::new();
    session.begin();
    let mut events = EventStream::new(session);
    let mut transcript = Transcript::default();

    let err = consume_stream(futures::stream::iter(chunks), &mut events, &mut transcript)
        .await
        .unwrap_err();

    assert!(matches!(err, EventStreamError::Io(_)));
    assert_eq!(transcript.lines, vec!["status working"]);
    assert!(!events.session().in_progress);
}

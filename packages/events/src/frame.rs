// ABOUTME: Incremental decoder for <event>...</event> frames in a chunked byte stream
// ABOUTME: Handles tags, frames and UTF-8 sequences split across arbitrary chunk boundaries

use crate::error::FrameError;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, trace};

const START_TAG: &[u8] = b"<event>";
const END_TAG: &[u8] = b"</event>";

/// Upper bound on a single frame body (4 MiB)
pub const DEFAULT_MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// One decoded frame: `{"data": {"type", "payload", "timestamp"}}`
#[derive(Debug, Clone, PartialEq)]
pub struct EventFrame {
    pub kind: String,
    pub payload: Value,
    pub timestamp: Option<String>,
}

#[derive(Deserialize)]
struct Envelope {
    data: FrameData,
}

#[derive(Deserialize)]
struct FrameData {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    timestamp: Option<String>,
}

impl EventFrame {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            timestamp: None,
        }
    }

    /// Parse the bytes found between a start and end tag
    pub fn parse(body: &[u8]) -> Result<Self, FrameError> {
        let envelope: Envelope =
            serde_json::from_slice(body).map_err(|e| FrameError::Malformed {
                len: body.len(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            kind: envelope.data.kind,
            payload: envelope.data.payload,
            timestamp: envelope.data.timestamp,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecoderState {
    SeekingStart,
    Collecting,
}

/// Two-state frame decoder fed one chunk at a time.
///
/// Bytes outside `<event>` tags are discarded. While seeking, only a
/// trailing partial start tag is retained; while collecting, the frame body
/// is buffered and the end-tag scan resumes where the previous chunk left
/// off, backing up just enough to catch a tag split across chunks.
#[derive(Debug)]
pub struct FrameDecoder {
    state: DecoderState,
    pending: Vec<u8>,
    scan_from: usize,
    max_frame_len: usize,
    discarded: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            state: DecoderState::SeekingStart,
            pending: Vec::new(),
            scan_from: 0,
            max_frame_len,
            discarded: 0,
        }
    }

    /// True while a frame has been opened but not yet closed
    pub fn in_frame(&self) -> bool {
        self.state == DecoderState::Collecting
    }

    /// Total unframed bytes dropped so far
    pub fn discarded_bytes(&self) -> usize {
        self.discarded
    }

    /// Feed one chunk and return every frame it completed, in order
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Result<EventFrame, FrameError>> {
        self.pending.extend_from_slice(chunk);

        let mut frames = Vec::new();
        // Start of the unconsumed region; while collecting it is also the body start
        let mut consumed = 0;

        loop {
            match self.state {
                DecoderState::SeekingStart => {
                    let window = &self.pending[consumed..];
                    match find(window, START_TAG) {
                        Some(at) => {
                            self.discard(at);
                            consumed += at + START_TAG.len();
                            self.scan_from = consumed;
                            self.state = DecoderState::Collecting;
                        }
                        None => {
                            let keep = partial_suffix_len(window, START_TAG);
                            let dropped = window.len() - keep;
                            self.discard(dropped);
                            consumed += dropped;
                            break;
                        }
                    }
                }
                DecoderState::Collecting => {
                    match find(&self.pending[self.scan_from..], END_TAG) {
                        Some(at) => {
                            let end = self.scan_from + at;
                            let body = &self.pending[consumed..end];
                            let frame = if body.len() > self.max_frame_len {
                                Err(FrameError::TooLarge {
                                    limit: self.max_frame_len,
                                })
                            } else {
                                EventFrame::parse(body)
                            };
                            if let Ok(frame) = &frame {
                                debug!(kind = %frame.kind, bytes = body.len(), "Decoded event frame");
                            }
                            frames.push(frame);
                            consumed = end + END_TAG.len();
                            self.state = DecoderState::SeekingStart;
                        }
                        None => {
                            let body_len = self.pending.len() - consumed;
                            if body_len >= self.max_frame_len + END_TAG.len() {
                                frames.push(Err(FrameError::TooLarge {
                                    limit: self.max_frame_len,
                                }));
                                self.discard(body_len);
                                consumed = self.pending.len();
                                self.state = DecoderState::SeekingStart;
                                break;
                            }
                            self.scan_from = self
                                .pending
                                .len()
                                .saturating_sub(END_TAG.len() - 1)
                                .max(consumed);
                            break;
                        }
                    }
                }
            }
        }

        self.pending.drain(..consumed);
        self.scan_from = self.scan_from.saturating_sub(consumed);
        frames
    }

    /// Signal end of stream; reports a frame left open by the final chunk
    pub fn finish(&mut self) -> Option<FrameError> {
        let state = std::mem::replace(&mut self.state, DecoderState::SeekingStart);
        let leftover = std::mem::take(&mut self.pending);
        self.scan_from = 0;
        match state {
            DecoderState::Collecting => Some(FrameError::Truncated {
                len: leftover.len(),
            }),
            DecoderState::SeekingStart => {
                self.discard(leftover.len());
                None
            }
        }
    }

    fn discard(&mut self, len: usize) {
        if len > 0 {
            trace!(bytes = len, "Dropping unframed bytes");
            self.discarded += len;
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Length of the longest proper prefix of `tag` that `window` ends with
fn partial_suffix_len(window: &[u8], tag: &[u8]) -> usize {
    (1..tag.len())
        .rev()
        .find(|&k| window.len() >= k && window.ends_with(&tag[..k]))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const FRAME: &str = r#"<event>{"data":{"type":"message","payload":{"content":"héllo wörld ✓"},"timestamp":"2024-01-01T00:00:00Z"}}</event>"#;

    fn ok_frames(results: Vec<Result<EventFrame, FrameError>>) -> Vec<EventFrame> {
        results.into_iter().map(|r| r.expect("frame should decode")).collect()
    }

    #[test]
    fn test_single_frame_in_one_chunk() {
        let mut decoder = FrameDecoder::new();
        let frames = ok_frames(decoder.feed(FRAME.as_bytes()));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, "message");
        assert_eq!(frames[0].payload, json!({"content": "héllo wörld ✓"}));
        assert_eq!(frames[0].timestamp.as_deref(), Some("2024-01-01T00:00:00Z"));
        assert!(!decoder.in_frame());
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_every_two_way_split_matches_unsplit_decode() {
        let bytes = FRAME.as_bytes();
        let expected = ok_frames(FrameDecoder::new().feed(bytes));

        for split in 0..=bytes.len() {
            let mut decoder = FrameDecoder::new();
            let mut frames = ok_frames(decoder.feed(&bytes[..split]));
            frames.extend(ok_frames(decoder.feed(&bytes[split..])));
            assert_eq!(frames, expected, "split at byte {}", split);
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for byte in FRAME.as_bytes() {
            frames.extend(ok_frames(decoder.feed(std::slice::from_ref(byte))));
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload["content"], "héllo wörld ✓");
    }

    #[test]
    fn test_end_tag_split_across_chunks() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(b"<event>{\"data\":{\"type\":\"x\"}}</ev").is_empty());
        let frames = ok_frames(decoder.feed(b"ent>"));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, "x");
        assert_eq!(frames[0].payload, Value::Null);
    }

    #[test]
    fn test_prose_between_frames_is_dropped() {
        let mut decoder = FrameDecoder::new();
        let input = format!("Thinking about it...{}some prose <b>bold</b> {}trailing", FRAME, FRAME);
        let frames = ok_frames(decoder.feed(input.as_bytes()));
        assert_eq!(frames.len(), 2);
        assert!(decoder.discarded_bytes() > 0);
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_malformed_frame_is_skipped() {
        let mut decoder = FrameDecoder::new();
        let input = format!("<event>{{not json</event>{}", FRAME);
        let results = decoder.feed(input.as_bytes());
        assert_eq!(results.len(), 2);
        assert!(matches!(results[0], Err(FrameError::Malformed { len: 9, .. })));
        assert_eq!(results[1].as_ref().unwrap().kind, "message");
    }

    #[test]
    fn test_missing_type_is_malformed() {
        let results = FrameDecoder::new().feed(br#"<event>{"data":{"payload":{}}}</event>"#);
        assert!(matches!(results[0], Err(FrameError::Malformed { .. })));
    }

    #[test]
    fn test_truncated_frame_reported_on_finish() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(b"<event>{\"data\":").is_empty());
        assert!(decoder.in_frame());
        assert_eq!(decoder.finish(), Some(FrameError::Truncated { len: 8 }));
        assert!(!decoder.in_frame());
    }

    #[test]
    fn test_oversized_frame_is_abandoned() {
        let mut decoder = FrameDecoder::with_max_frame_len(24);
        let results = decoder.feed(b"<event>0123456789012345678901234567890123456789");
        assert_eq!(results, vec![Err(FrameError::TooLarge { limit: 24 })]);
        assert!(!decoder.in_frame());

        let frames = ok_frames(decoder.feed(br#"<event>{"data":{"type":"a"}}</event>"#));
        assert_eq!(frames[0].kind, "a");
    }

    #[test]
    fn test_partial_start_tag_is_retained() {
        assert_eq!(partial_suffix_len(b"hello <ev", START_TAG), 3);
        assert_eq!(partial_suffix_len(b"hello <", START_TAG), 1);
        assert_eq!(partial_suffix_len(b"hello", START_TAG), 0);
        assert_eq!(partial_suffix_len(b"<event", START_TAG), 6);
    }
}

// ABOUTME: Execution events emitted by a session and the sink they are delivered through
// ABOUTME: Includes incremental UTF-8 decoding for output chunks split mid-character

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub const STATUS_STARTING: &str = "Starting execution...";
pub const STATUS_COMPILING: &str = "Compiling...";
pub const STATUS_RUNNING: &str = "Running...";
pub const STATUS_COMPLETE: &str = "Execution complete";

/// One frame of the ordered status/output/error sequence of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum ExecutionEvent {
    Status(String),
    Output(String),
    Error(String),
}

impl ExecutionEvent {
    pub fn status(message: impl Into<String>) -> Self {
        Self::Status(message.into())
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(message.into())
    }

    pub fn is_output(&self) -> bool {
        matches!(self, Self::Output(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Status(_) => "status",
            Self::Output(_) => "output",
            Self::Error(_) => "error",
        }
    }
}

/// Capacity of the channel between a session and its client.
/// A full channel suspends the session until the client catches up.
pub const EVENT_BUFFER: usize = 64;

/// Sending half handed to a session. A closed receiver does not stop the session.
pub type EventSink = mpsc::Sender<ExecutionEvent>;

/// Decodes a byte stream into UTF-8 text chunk by chunk.
///
/// Incomplete trailing sequences are held back until the next chunk; invalid
/// bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Chunker {
    pending: Vec<u8>,
}

impl Utf8Chunker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);

        let mut text = String::with_capacity(self.pending.len());
        let mut consumed = 0;
        loop {
            match std::str::from_utf8(&self.pending[consumed..]) {
                Ok(valid) => {
                    text.push_str(valid);
                    consumed = self.pending.len();
                    break;
                }
                Err(e) => {
                    let valid_up_to = consumed + e.valid_up_to();
                    text.push_str(&String::from_utf8_lossy(&self.pending[consumed..valid_up_to]));
                    match e.error_len() {
                        Some(invalid) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            consumed = valid_up_to + invalid;
                        }
                        None => {
                            consumed = valid_up_to;
                            break;
                        }
                    }
                }
            }
        }

        self.pending.drain(..consumed);
        text
    }

    /// Flush whatever is still buffered, replacing an incomplete sequence
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_event_wire_format() {
        let cases = [
            (ExecutionEvent::status("Running..."), r#"{"type":"status","data":"Running..."}"#),
            (ExecutionEvent::Output("hi\n".to_string()), r#"{"type":"output","data":"hi\n"}"#),
            (ExecutionEvent::error("boom"), r#"{"type":"error","data":"boom"}"#),
        ];

        for (event, expected) in cases {
            assert_eq!(serde_json::to_string(&event).unwrap(), expected);
        }
    }

    #[test]
    fn test_chunker_passes_ascii_through() {
        let mut chunker = Utf8Chunker::new();
        assert_eq!(chunker.push(b"hello\n"), "hello\n");
        assert_eq!(chunker.finish(), "");
    }

    #[test]
    fn test_chunker_joins_split_character() {
        let snowman = "☃".as_bytes();
        let mut chunker = Utf8Chunker::new();
        assert_eq!(chunker.push(&[b'a', snowman[0]]), "a");
        assert_eq!(chunker.push(&snowman[1..2]), "");
        assert_eq!(chunker.push(&[snowman[2], b'b']), "☃b");
    }

    #[test]
    fn test_chunker_replaces_invalid_bytes() {
        let mut chunker = Utf8Chunker::new();
        assert_eq!(chunker.push(&[b'x', 0xff, b'y']), "x\u{FFFD}y");
    }

    #[test]
    fn test_chunker_finish_flushes_truncated_sequence() {
        let mut chunker = Utf8Chunker::new();
        assert_eq!(chunker.push(&[0xe2, 0x98]), "");
        assert_eq!(chunker.finish(), "\u{FFFD}");
    }
}

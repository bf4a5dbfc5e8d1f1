//! Wire decoding for streamed answers: NDJSON lines and SSE frames.

use tracing::debug;

use crate::request::Approach;
use crate::response::CitationLookup;
use crate::stream::{AnswerMetadata, StreamEvent};

/// Event name that closes an event-stream answer.
pub const END_EVENT: &str = "end";
/// Event name carrying answer text.
pub const MESSAGE_EVENT: &str = "message";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Accumulates bytes and hands out complete lines without their `\n` or
/// `\r\n` terminator.
#[derive(Default)]
struct LineBuffer {
    buf: Vec<u8>,
    // Bytes before this offset are known to hold no newline.
    scanned: usize,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        let mut start = 0;
        for idx in self.scanned..self.buf.len() {
            if self.buf[idx] != b'\n' {
                continue;
            }
            let line = &self.buf[start..idx];
            lines.push(line.strip_suffix(b"\r").unwrap_or(line).to_vec());
            start = idx + 1;
        }
        self.buf.drain(..start);
        self.scanned = self.buf.len();
        lines
    }

    /// Takes the unterminated remainder.
    fn take_rest(&mut self) -> Vec<u8> {
        self.scanned = 0;
        let rest = std::mem::take(&mut self.buf);
        match rest.strip_suffix(b"\r") {
            Some(line) => line.to_vec(),
            None => rest,
        }
    }
}

/// Line-driven event-stream parser. Field lines build up the pending frame
/// and a blank line dispatches it.
#[derive(Default)]
pub(crate) struct SseDecoder {
    lines: LineBuffer,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        let lines = self.lines.push(chunk);
        lines
            .iter()
            .filter_map(|line| self.accept_line(line))
            .collect()
    }

    /// Flushes a final frame that was not followed by a blank line.
    pub fn finish(&mut self) -> Option<SseFrame> {
        let rest = self.lines.take_rest();
        if !rest.is_empty() {
            self.accept_line(&rest);
        }
        self.dispatch()
    }

    fn accept_line(&mut self, line: &[u8]) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        let line = String::from_utf8_lossy(line);
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            // Only the single space after the colon belongs to the framing;
            // anything beyond it is answer text.
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line.as_ref(), ""),
        };
        match field {
            "event" => self.event = Some(value.trim().to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        if event.is_none() && self.data.is_empty() {
            return None;
        }
        Some(SseFrame {
            event,
            data: std::mem::take(&mut self.data).join("\n"),
        })
    }
}

/// Maps one SSE frame to a stream event. Unknown event names yield `None`.
pub(crate) fn map_sse_frame(frame: &SseFrame) -> Option<StreamEvent> {
    match frame.event.as_deref() {
        Some(END_EVENT) => Some(StreamEvent::EndSignal),
        None | Some(MESSAGE_EVENT) => {
            let text = frame.data.replace("<br>", "\n");
            (!text.is_empty()).then_some(StreamEvent::ContentDelta { text })
        }
        Some(other) => {
            debug!(event = "stream.sse_frame_ignored", sse_event = other, "ignoring SSE event");
            None
        }
    }
}

/// Splits a byte stream into complete NDJSON records.
#[derive(Default)]
pub(crate) struct NdjsonDecoder {
    lines: LineBuffer,
}

impl NdjsonDecoder {
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.lines.push(chunk)
    }

    /// Returns a trailing line that was not newline-terminated.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        let rest = self.lines.take_rest();
        (!rest.iter().all(u8::is_ascii_whitespace)).then_some(rest)
    }
}

/// Outcome of decoding one NDJSON line.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RecordOutcome {
    Event(StreamEvent),
    /// Blank or content-free line; nothing to do.
    Empty,
    /// Malformed or unrecognised record; logged and skipped by the caller.
    Skip(String),
}

pub(crate) fn decode_ndjson_line(line: &[u8]) -> RecordOutcome {
    let text = match std::str::from_utf8(line) {
        Ok(text) => text.trim(),
        Err(e) => return RecordOutcome::Skip(format!("invalid UTF-8: {e}")),
    };
    if text.is_empty() {
        return RecordOutcome::Empty;
    }
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(value) => classify_record(&value),
        Err(e) => RecordOutcome::Skip(format!("invalid JSON record: {e}")),
    }
}

/// Classifies a record: `data_points` wins over `content`, which wins over
/// `error`.
pub(crate) fn classify_record(value: &serde_json::Value) -> RecordOutcome {
    let Some(record) = value.as_object() else {
        return RecordOutcome::Skip("record is not a JSON object".into());
    };

    if record.get("data_points").is_some_and(|v| !v.is_null()) {
        return RecordOutcome::Event(StreamEvent::Metadata(Box::new(metadata_from_record(
            record,
        ))));
    }

    if let Some(content) = record.get("content").filter(|v| !v.is_null()) {
        return match content.as_str() {
            Some("") => RecordOutcome::Empty,
            Some(text) => RecordOutcome::Event(StreamEvent::ContentDelta {
                text: text.to_string(),
            }),
            None => RecordOutcome::Skip("content field is not a string".into()),
        };
    }

    if let Some(error) = record.get("error").filter(|v| !v.is_null()) {
        let message = match error {
            serde_json::Value::String(s) => s.clone(),
            other => other
                .get("message")
                .and_then(|m| m.as_str())
                .map(ToOwned::to_owned)
                .unwrap_or_else(|| other.to_string()),
        };
        if message.trim().is_empty() {
            return RecordOutcome::Skip("error field is empty".into());
        }
        return RecordOutcome::Event(StreamEvent::ErrorSignal { message });
    }

    RecordOutcome::Skip("record has no data_points, content or error field".into())
}

fn metadata_from_record(record: &serde_json::Map<String, serde_json::Value>) -> AnswerMetadata {
    let data_points = match record.get("data_points") {
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
        _ => Vec::new(),
    };
    let citation_lookup = record
        .get("citation_lookup")
        .filter(|v| !v.is_null())
        .map(|v| {
            serde_json::from_value::<CitationLookup>(v.clone()).unwrap_or_else(|e| {
                debug!(event = "stream.citation_lookup_invalid", error = %e, "ignoring malformed citation lookup");
                CitationLookup::new()
            })
        })
        .unwrap_or_default();
    AnswerMetadata {
        thoughts: record
            .get("thoughts")
            .and_then(|v| v.as_str())
            .map(ToOwned::to_owned),
        data_points,
        citation_lookup,
        thought_chain: record
            .get("thought_chain")
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default(),
        approach: record
            .get("approach")
            .and_then(|v| v.as_u64())
            .and_then(|code| u8::try_from(code).ok())
            .and_then(Approach::from_code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_decoder_handles_partial_chunk_boundaries() {
        let mut decoder = SseDecoder::default();
        let frames1 = decoder.push_chunk(b"event: message\ndata: hel");
        assert!(frames1.is_empty());
        let frames2 = decoder.push_chunk(b"lo\n\n");
        assert_eq!(frames2.len(), 1);
        assert_eq!(frames2[0].event.as_deref(), Some("message"));
        assert_eq!(frames2[0].data, "hello");
    }

    #[test]
    fn sse_data_keeps_leading_spaces_beyond_the_separator() {
        let mut decoder = SseDecoder::default();
        let frames = decoder.push_chunk(b"data:  world\r\n\r\n");
        assert_eq!(frames[0].data, " world");
        assert_eq!(frames[0].event, None);
    }

    #[test]
    fn sse_finish_flushes_unterminated_frame() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push_chunk(b"event: end\ndata: done").is_empty());
        let frame = decoder.finish().expect("trailing frame");
        assert_eq!(map_sse_frame(&frame), Some(StreamEvent::EndSignal));
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn sse_ignores_comments_and_unknown_fields() {
        let mut decoder = SseDecoder::default();
        let frames = decoder.push_chunk(b": keep-alive\n\nid: 7\nretry: 100\ndata: a\ndata\ndata: b\n\n");
        assert_eq!(
            frames,
            vec![SseFrame {
                event: None,
                data: "a\n\nb".into()
            }]
        );
    }

    #[test]
    fn sse_crlf_split_across_chunks() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push_chunk(b"event: end\r").is_empty());
        assert!(decoder.push_chunk(b"\ndata: x\r\n\r").is_empty());
        let frames = decoder.push_chunk(b"\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("end"));
        assert_eq!(frames[0].data, "x");
    }

    #[test]
    fn sse_multibyte_chars_survive_chunk_splits() {
        let text = "data: caf\u{e9} \u{1f30d}\n\n".as_bytes();
        let mut decoder = SseDecoder::default();
        let mut frames = Vec::new();
        for byte in text {
            frames.extend(decoder.push_chunk(std::slice::from_ref(byte)));
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "caf\u{e9} \u{1f30d}");
    }

    #[test]
    fn sse_message_normalizes_line_breaks() {
        let frame = SseFrame {
            event: Some("message".into()),
            data: "one<br>two".into(),
        };
        assert_eq!(
            map_sse_frame(&frame),
            Some(StreamEvent::ContentDelta {
                text: "one\ntwo".into()
            })
        );
        let other = SseFrame {
            event: Some("ping".into()),
            data: "x".into(),
        };
        assert_eq!(map_sse_frame(&other), None);
    }

    #[test]
    fn ndjson_decoder_splits_lines_across_chunks() {
        let mut decoder = NdjsonDecoder::default();
        assert!(decoder.push_chunk(b"{\"content\":\"Hel").is_empty());
        let lines = decoder.push_chunk(b"\"}\r\n{\"content\":\"lo\"}\n{\"con");
        assert_eq!(lines, vec![b"{\"content\":\"Hel\"}".to_vec(), b"{\"content\":\"lo\"}".to_vec()]);
        assert_eq!(decoder.finish(), Some(b"{\"con".to_vec()));
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn classifies_metadata_content_and_error_records() {
        let meta = classify_record(&serde_json::json!({
            "data_points": ["a.pdf| text", 7],
            "thoughts": "searched",
            "thought_chain": {"work_query": "sky"},
            "approach": 1,
            "citation_lookup": {"File0": {"citation": "c", "source_path": "s", "page_number": "2"}}
        }));
        let RecordOutcome::Event(StreamEvent::Metadata(meta)) = meta else {
            panic!("expected metadata, got {meta:?}");
        };
        assert_eq!(meta.data_points, vec!["a.pdf| text".to_string(), "7".to_string()]);
        assert_eq!(meta.thoughts.as_deref(), Some("searched"));
        assert_eq!(meta.approach, Some(Approach::ReadRetrieveRead));
        assert_eq!(meta.citation_lookup["File0"].page_number, "2");
        assert!(meta.thought_chain.contains_key("work_query"));

        assert_eq!(
            classify_record(&serde_json::json!({"content": "Hi"})),
            RecordOutcome::Event(StreamEvent::ContentDelta { text: "Hi".into() })
        );
        assert_eq!(
            classify_record(&serde_json::json!({"error": "X"})),
            RecordOutcome::Event(StreamEvent::ErrorSignal { message: "X".into() })
        );
        assert_eq!(
            classify_record(&serde_json::json!({"content": ""})),
            RecordOutcome::Empty
        );
    }

    #[test]
    fn malformed_records_are_skipped_not_fatal() {
        assert!(matches!(decode_ndjson_line(b"{not json"), RecordOutcome::Skip(_)));
        assert!(matches!(decode_ndjson_line(b"[1,2]"), RecordOutcome::Skip(_)));
        assert!(matches!(decode_ndjson_line(b"{\"other\":1}"), RecordOutcome::Skip(_)));
        assert!(matches!(decode_ndjson_line(b"{\"content\":5}"), RecordOutcome::Skip(_)));
        assert_eq!(decode_ndjson_line(b"   "), RecordOutcome::Empty);
    }

    #[test]
    fn metadata_with_broken_lookup_keeps_other_fields() {
        let outcome = classify_record(&serde_json::json!({
            "data_points": [],
            "citation_lookup": "oops"
        }));
        let RecordOutcome::Event(StreamEvent::Metadata(meta)) = outcome else {
            panic!("expected metadata");
        };
        assert!(meta.citation_lookup.is_empty());
        assert!(meta.data_points.is_empty());
    }
}

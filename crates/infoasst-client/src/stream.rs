use crate::request::Approach;
use crate::response::CitationLookup;

/// Wire framing of a streamed answer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamFormat {
    /// One JSON record per line.
    Ndjson,
    /// Server-Sent Events with `message` payloads and a closing `end` event.
    EventStream,
}

/// Provenance sent once per answer, usually before any content.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AnswerMetadata {
    pub thoughts: Option<String>,
    pub data_points: Vec<String>,
    pub citation_lookup: CitationLookup,
    pub thought_chain: serde_json::Map<String, serde_json::Value>,
    pub approach: Option<Approach>,
}

/// Protocol events decoded from an answer stream.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    /// Incremental answer text.
    ContentDelta { text: String },
    /// Provenance for the answer.
    Metadata(Box<AnswerMetadata>),
    /// Terminal failure reported by the backend.
    ErrorSignal { message: String },
    /// Terminal success.
    EndSignal,
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::ErrorSignal { .. } | StreamEvent::EndSignal)
    }
}

use crate::parser::{ParseOptions, ParsedAnswer, extract_follow_up_questions, parse_answer};
use crate::request::Approach;
use crate::response::{ChatResponse, CitationLookup};
use crate::stream::{AnswerMetadata, StreamEvent};

/// Answer state for one question/answer turn.
///
/// Owned by whoever drives the stream; a new question gets a new
/// accumulator instead of reusing this one.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AnswerAccumulator {
    raw_text: String,
    citation_lookup: Option<CitationLookup>,
    thoughts: Option<String>,
    data_points: Vec<String>,
    thought_chain: serde_json::Map<String, serde_json::Value>,
    approach: Option<Approach>,
    deltas: u64,
}

impl AnswerAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an accumulator that expects answers for `approach` when the
    /// backend does not echo one in its metadata.
    pub fn for_approach(approach: Approach) -> Self {
        Self {
            approach: Some(approach),
            ..Self::default()
        }
    }

    /// Applies a decoded event. Terminal events do not change state.
    pub fn apply(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::ContentDelta { text } => self.push_text(text),
            StreamEvent::Metadata(meta) => self.set_metadata(meta),
            StreamEvent::ErrorSignal { .. } | StreamEvent::EndSignal => {}
        }
    }

    pub fn push_text(&mut self, text: &str) {
        self.raw_text.push_str(text);
        self.deltas = self.deltas.saturating_add(1);
    }

    /// Records provenance. The citation lookup is fixed by the first metadata
    /// event of the turn.
    pub fn set_metadata(&mut self, meta: &AnswerMetadata) {
        if self.citation_lookup.is_none() {
            self.citation_lookup = Some(meta.citation_lookup.clone());
        }
        if meta.thoughts.is_some() {
            self.thoughts = meta.thoughts.clone();
        }
        self.data_points = meta.data_points.clone();
        self.thought_chain = meta.thought_chain.clone();
        if meta.approach.is_some() {
            self.approach = meta.approach;
        }
    }

    pub fn raw_text(&self) -> &str {
        &self.raw_text
    }

    pub fn citation_lookup(&self) -> &CitationLookup {
        static EMPTY: CitationLookup = CitationLookup::new();
        self.citation_lookup.as_ref().unwrap_or(&EMPTY)
    }

    pub fn approach(&self) -> Option<Approach> {
        self.approach
    }

    /// Number of content deltas applied so far.
    pub fn delta_count(&self) -> u64 {
        self.deltas
    }

    pub fn follow_up_questions(&self) -> Vec<String> {
        extract_follow_up_questions(&self.raw_text)
    }

    /// Parses the text received so far.
    pub fn parse(&self, options: &ParseOptions) -> ParsedAnswer {
        parse_answer(&self.raw_text, self.citation_lookup(), options)
    }

    /// Converts the accumulated state into a response value.
    pub fn finalize(self) -> ChatResponse {
        ChatResponse {
            answer: self.raw_text,
            thoughts: self.thoughts,
            data_points: self.data_points,
            citation_lookup: self.citation_lookup.unwrap_or_default(),
            thought_chain: self.thought_chain,
            approach: self.approach,
            error: None,
        }
    }
}

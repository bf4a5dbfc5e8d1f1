//! Common imports for typical client usage.
pub use crate::{
    AnswerStream, Approach, ChatMode, ChatRequest, ChatResponse, CitationPanel, ClientConfig,
    ClientError, Conversation, InfoAssistClient, Overrides, ParseOptions, ParsedAnswer,
    RenderMode, StreamEvent, Typewriter, parse_answer,
};

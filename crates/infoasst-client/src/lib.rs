//! Client for the Information Assistant chat backend.
//!
//! Streams answers over NDJSON or server-sent events, reveals them through a
//! typewriter queue, parses citation and follow-up markers, and resolves
//! citations for preview.
//!
//! # Streaming a chat answer
//!
//! ```no_run
//! use infoasst_client::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), ClientError> {
//! let client = InfoAssistClient::from_env()?;
//! let mut conversation = Conversation::new(ChatMode::WorkOnly);
//!
//! let request = conversation.begin_turn("What is our travel policy?")?;
//! let stream = client.chat_stream(&request, client.typewriter()).await?;
//! let typewriter = stream.typewriter().clone();
//! let response = stream.finish().await?;
//! typewriter.wait_idle().await;
//!
//! let parsed = parse_answer(
//!     &response.answer,
//!     &response.citation_lookup,
//!     &ParseOptions::default(),
//! );
//! println!("{}", parsed.to_html());
//! conversation.record_answer(response)?;
//! # Ok(())
//! # }
//! ```

/// Answer state for one question/answer turn.
pub mod accumulator;
/// Citation detail lookup and preview dispatch.
pub mod citation;
/// HTTP client for the backend endpoints.
pub mod client;
/// Client configuration and retry policy.
pub mod config;
/// Streamed answer consumer and cancellation handle.
pub mod consumer;
/// Conversation history, chat modes and per-approach answers.
pub mod conversation;
/// Public error type.
pub mod errors;
/// Tracing subscriber setup.
pub mod observability;
/// Citation and follow-up parsing.
pub mod parser;
/// Common imports for typical usage.
pub mod prelude;
/// Request bodies and retrieval options.
pub mod request;
/// Response bodies and citation lookup tables.
pub mod response;
/// Typewriter reveal queue.
pub mod reveal;
/// Decoded stream events.
pub mod stream;
mod transport;

pub use accumulator::AnswerAccumulator;
pub use citation::{CitationDetail, CitationPanel, CitationSource, Preview, RenderMode, render_preview};
pub use client::InfoAssistClient;
pub use config::{ClientConfig, RetryPolicy};
pub use consumer::{AnswerStream, CancelHandle};
pub use conversation::{Conversation, Turn};
pub use errors::ClientError;
pub use parser::{CitationReference, ParseOptions, ParsedAnswer, citation_label, parse_answer};
pub use request::{
    Approach, AskRequest, ChatMode, ChatRequest, ChatTurn, ModeSettings, Overrides, ResponseLength,
};
pub use response::{ChatResponse, CitationLookup, CitationLookupEntry};
pub use reveal::{RevealProgress, RevealQueue, Typewriter};
pub use stream::{AnswerMetadata, StreamEvent, StreamFormat};

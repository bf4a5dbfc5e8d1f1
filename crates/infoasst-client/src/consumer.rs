//! Drives one streamed answer: decodes the byte stream, feeds the typewriter,
//! accumulates the answer, and reports a terminal result.

use std::fmt::Display;
use std::sync::Arc;

use bytes::Bytes;
use futures::{Stream, StreamExt as _};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use crate::accumulator::AnswerAccumulator;
use crate::errors::ClientError;
use crate::response::ChatResponse;
use crate::reveal::Typewriter;
use crate::stream::{StreamEvent, StreamFormat};
use crate::transport::{
    NdjsonDecoder, RecordOutcome, SseDecoder, decode_ndjson_line, map_sse_frame,
};

/// Handle used to cancel a running answer stream.
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
    typewriter: Typewriter,
}

impl CancelHandle {
    /// Stops the read loop, releases the byte stream, and discards anything
    /// still queued for reveal.
    ///
    /// While the stream is still running, the typewriter is reset before
    /// this returns, so no further chars of the abandoned answer are shown.
    /// Once the stream has ended the revealed answer is left alone.
    pub fn cancel(&self) {
        // The consumer task holds the only receiver until it reports.
        if !*self.tx.borrow() && self.tx.receiver_count() > 0 {
            self.typewriter.reset();
        }
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// One in-flight answer.
///
/// Use `next_event()` to observe protocol events as they are decoded and
/// `finish()` for the final response. Dropping an unfinished stream cancels it.
pub struct AnswerStream {
    session_id: uuid::Uuid,
    format: StreamFormat,
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    final_rx: oneshot::Receiver<Result<ChatResponse, ClientError>>,
    cancel: CancelHandle,
    typewriter: Typewriter,
    saw_terminal: bool,
    finished: bool,
}

impl AnswerStream {
    /// Spawns the consumer task for `bytes`.
    ///
    /// Must be called from within a Tokio runtime. The typewriter should be
    /// idle or freshly reset; text is only fed while its generation matches
    /// the one observed here.
    pub fn spawn<S, E>(
        format: StreamFormat,
        bytes: S,
        typewriter: Typewriter,
        accumulator: AnswerAccumulator,
    ) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let session_id = uuid::Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        let (final_tx, final_rx) = oneshot::channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);

        tokio::spawn(consume_task(ConsumeTask {
            session_id,
            format,
            bytes: Box::pin(bytes),
            typewriter: typewriter.clone(),
            generation: typewriter.generation(),
            accumulator,
            tx,
            final_tx,
            cancel_rx,
        }));

        Self {
            session_id,
            format,
            rx,
            final_rx,
            cancel: CancelHandle {
                tx: Arc::new(cancel_tx),
                typewriter: typewriter.clone(),
            },
            typewriter,
            saw_terminal: false,
            finished: false,
        }
    }

    pub fn session_id(&self) -> uuid::Uuid {
        self.session_id
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    pub fn typewriter(&self) -> &Typewriter {
        &self.typewriter
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Cancels the stream; see [`CancelHandle::cancel`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the next decoded event. Returns `None` once the consumer
    /// task has stopped.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        let event = self.rx.recv().await;
        if event.as_ref().is_some_and(StreamEvent::is_terminal) {
            self.saw_terminal = true;
        }
        event
    }

    /// Drains remaining events and returns the terminal result.
    ///
    /// Safe to call after consuming events manually with `next_event()`.
    pub async fn finish(mut self) -> Result<ChatResponse, ClientError> {
        while !self.saw_terminal {
            match self.rx.recv().await {
                Some(event) if event.is_terminal() => self.saw_terminal = true,
                Some(_) => {}
                None => break,
            }
        }
        let result = match (&mut self.final_rx).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::protocol_msg(format!(
                "answer stream {} ended without a final result",
                self.session_id
            ))),
        };
        self.finished = true;
        result
    }
}

impl Drop for AnswerStream {
    fn drop(&mut self) {
        // A receiver count of zero means the task already stopped.
        if !self.finished && !self.saw_terminal && self.cancel.tx.receiver_count() > 0 {
            self.cancel.cancel();
        }
    }
}

type BoxedBytes<E> = std::pin::Pin<Box<dyn Stream<Item = Result<Bytes, E>> + Send>>;

struct ConsumeTask<E> {
    session_id: uuid::Uuid,
    format: StreamFormat,
    bytes: BoxedBytes<E>,
    typewriter: Typewriter,
    generation: u64,
    accumulator: AnswerAccumulator,
    tx: mpsc::UnboundedSender<StreamEvent>,
    final_tx: oneshot::Sender<Result<ChatResponse, ClientError>>,
    cancel_rx: watch::Receiver<bool>,
}

enum Flow {
    Continue,
    Completed,
    Failed(String),
    ReadFailed(String),
    Abandoned,
}

impl<E> ConsumeTask<E> {
    fn decode(
        &self,
        ndjson: &mut NdjsonDecoder,
        sse: &mut SseDecoder,
        chunk: &[u8],
    ) -> Vec<StreamEvent> {
        match self.format {
            StreamFormat::Ndjson => ndjson
                .push_chunk(chunk)
                .iter()
                .filter_map(|line| self.record_event(line))
                .collect(),
            StreamFormat::EventStream => sse
                .push_chunk(chunk)
                .iter()
                .filter_map(map_sse_frame)
                .collect(),
        }
    }

    fn flush(&self, ndjson: &mut NdjsonDecoder, sse: &mut SseDecoder) -> Vec<StreamEvent> {
        match self.format {
            StreamFormat::Ndjson => ndjson
                .finish()
                .and_then(|line| self.record_event(&line))
                .into_iter()
                .collect(),
            StreamFormat::EventStream => sse
                .finish()
                .as_ref()
                .and_then(map_sse_frame)
                .into_iter()
                .collect(),
        }
    }

    fn record_event(&self, line: &[u8]) -> Option<StreamEvent> {
        match decode_ndjson_line(line) {
            RecordOutcome::Event(event) => Some(event),
            RecordOutcome::Empty => None,
            RecordOutcome::Skip(reason) => {
                warn!(
                    event = "stream.record_skipped",
                    session_id = %self.session_id,
                    reason = %reason,
                    "skipping malformed stream record"
                );
                None
            }
        }
    }

    fn handle(&mut self, event: StreamEvent) -> Flow {
        match &event {
            StreamEvent::ContentDelta { text } => {
                if !self.typewriter.feed(self.generation, text) {
                    return Flow::Abandoned;
                }
                self.accumulator.apply(&event);
            }
            StreamEvent::Metadata(_) => self.accumulator.apply(&event),
            StreamEvent::ErrorSignal { message } => {
                let message = message.clone();
                let _ = self.tx.send(event);
                return Flow::Failed(message);
            }
            StreamEvent::EndSignal => {
                let _ = self.tx.send(event);
                return Flow::Completed;
            }
        }
        if self.tx.send(event).is_err() {
            return Flow::Abandoned;
        }
        Flow::Continue
    }
}

async fn consume_task<E: Display>(mut task: ConsumeTask<E>) {
    let mut ndjson = NdjsonDecoder::default();
    let mut sse = SseDecoder::default();
    debug!(event = "stream.started", session_id = %task.session_id, format = ?task.format, "answer stream started");

    let flow = loop {
        let next = tokio::select! {
            biased;
            changed = task.cancel_rx.changed() => {
                if changed.is_err() || *task.cancel_rx.borrow() {
                    break Flow::Abandoned;
                }
                continue;
            }
            next = task.bytes.next() => next,
        };

        let events = match next {
            Some(Ok(chunk)) => task.decode(&mut ndjson, &mut sse, &chunk),
            Some(Err(e)) => break Flow::ReadFailed(e.to_string()),
            None => {
                let mut tail = task.flush(&mut ndjson, &mut sse);
                tail.push(StreamEvent::EndSignal);
                tail
            }
        };

        let mut outcome = Flow::Continue;
        for event in events {
            outcome = task.handle(event);
            if !matches!(outcome, Flow::Continue) {
                break;
            }
        }
        if !matches!(outcome, Flow::Continue) {
            break outcome;
        }
    };

    // Release the connection and the cancel receiver before reporting, so a
    // cancel issued after `finish` returns sees a stopped task.
    let ConsumeTask {
        session_id,
        bytes,
        accumulator,
        tx,
        final_tx,
        cancel_rx,
        ..
    } = task;
    drop(bytes);
    drop(tx);
    drop(cancel_rx);

    let result = match flow {
        Flow::Completed => {
            debug!(event = "stream.completed", session_id = %session_id, deltas = accumulator.delta_count(), "answer stream completed");
            Ok(accumulator.finalize())
        }
        Flow::Failed(message) => {
            warn!(event = "stream.error_record", session_id = %session_id, message = %message, "backend reported a stream error");
            Err(ClientError::StreamFailed { message })
        }
        Flow::ReadFailed(error) => {
            warn!(event = "stream.transport_failed", session_id = %session_id, error = %error, "answer stream read failed");
            Err(ClientError::transport(format!("answer stream read failed: {error}")))
        }
        Flow::Abandoned | Flow::Continue => {
            debug!(event = "stream.cancelled", session_id = %session_id, "answer stream cancelled");
            Err(ClientError::Cancelled)
        }
    };
    let _ = final_tx.send(result);
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use std::time::Duration;

    fn chunks(parts: &[&str]) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static {
        let owned: Vec<Result<Bytes, std::io::Error>> = parts
            .iter()
            .map(|p| Ok(Bytes::from(p.to_string())))
            .collect();
        stream::iter(owned)
    }

    fn typewriter() -> Typewriter {
        Typewriter::new(Duration::from_millis(30))
    }

    #[tokio::test(start_paused = true)]
    async fn ndjson_chunks_drain_to_exact_text() {
        let tw = typewriter();
        let stream = AnswerStream::spawn(
            StreamFormat::Ndjson,
            chunks(&[
                "{\"content\":\"Hel\"}\n{\"cont",
                "ent\":\"lo\"}\n",
                "{\"content\":\" world\"}",
            ]),
            tw.clone(),
            AnswerAccumulator::new(),
        );
        let response = stream.finish().await.expect("completed");
        assert_eq!(response.answer, "Hello world");
        tw.wait_idle().await;
        assert_eq!(tw.visible_text(), "Hello world");
    }

    #[tokio::test]
    async fn events_arrive_in_order_with_metadata_first() {
        let mut stream = AnswerStream::spawn(
            StreamFormat::Ndjson,
            chunks(&[
                "{\"data_points\":[\"a\"],\"thoughts\":\"t\",\"citation_lookup\":{\"File0\":{\"source_path\":\"https://x/y/z/c/a.pdf\",\"page_number\":\"1\"}}}\n",
                "{\"content\":\"A [File0]\"}\n",
            ]),
            typewriter(),
            AnswerAccumulator::new(),
        );
        assert!(matches!(stream.next_event().await, Some(StreamEvent::Metadata(_))));
        assert_eq!(
            stream.next_event().await,
            Some(StreamEvent::ContentDelta { text: "A [File0]".into() })
        );
        assert_eq!(stream.next_event().await, Some(StreamEvent::EndSignal));
        let response = stream.finish().await.expect("completed");
        assert_eq!(response.thoughts.as_deref(), Some("t"));
        assert!(response.citation_lookup.contains_key("File0"));
    }

    #[tokio::test]
    async fn error_record_halts_processing() {
        let tw = typewriter();
        let mut stream = AnswerStream::spawn(
            StreamFormat::Ndjson,
            chunks(&[
                "{\"content\":\"partial\"}\n{\"error\":\"X\"}\n{\"content\":\"after\"}\n",
                "{\"content\":\"later chunk\"}\n",
            ]),
            tw.clone(),
            AnswerAccumulator::new(),
        );
        let mut seen = Vec::new();
        while let Some(event) = stream.next_event().await {
            seen.push(event);
        }
        assert_eq!(
            seen,
            vec![
                StreamEvent::ContentDelta { text: "partial".into() },
                StreamEvent::ErrorSignal { message: "X".into() },
            ]
        );
        assert_eq!(
            stream.finish().await,
            Err(ClientError::StreamFailed { message: "X".into() })
        );
        tw.skip_to_end();
        assert_eq!(tw.visible_text(), "partial");
    }

    #[tokio::test]
    async fn malformed_records_are_skipped() {
        let stream = AnswerStream::spawn(
            StreamFormat::Ndjson,
            chunks(&["{\"content\":\"a\"}\n{broken\n\n{\"unknown\":true}\n{\"content\":\"b\"}\n"]),
            typewriter(),
            AnswerAccumulator::new(),
        );
        assert_eq!(stream.finish().await.expect("completed").answer, "ab");
    }

    #[tokio::test(start_paused = true)]
    async fn event_stream_stops_at_end_event() {
        let tw = typewriter();
        let stream = AnswerStream::spawn(
            StreamFormat::EventStream,
            chunks(&[
                "event: message\ndata: line one<br>",
                "line two\n\ndata:  tail\n\n",
                "event: end\ndata: \n\n",
                "event: message\ndata: ignored\n\n",
            ]),
            tw.clone(),
            AnswerAccumulator::new(),
        );
        let response = stream.finish().await.expect("completed");
        assert_eq!(response.answer, "line one\nline two tail");
        tw.wait_idle().await;
        assert_eq!(tw.visible_text(), "line one\nline two tail");
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_discards_queued_reveal_and_stops_reading() {
        let tw = typewriter();
        let (byte_tx, byte_rx) = mpsc::unbounded_channel::<Result<Bytes, std::io::Error>>();
        let mut stream = AnswerStream::spawn(
            StreamFormat::Ndjson,
            tokio_stream_from(byte_rx),
            tw.clone(),
            AnswerAccumulator::new(),
        );
        byte_tx
            .send(Ok(Bytes::from_static(b"{\"content\":\"old answer\"}\n")))
            .expect("send");
        assert!(matches!(stream.next_event().await, Some(StreamEvent::ContentDelta { .. })));
        tokio::time::sleep(Duration::from_millis(65)).await;
        assert_eq!(tw.visible_text(), "ol");

        stream.cancel();
        assert_eq!(tw.visible_text(), "");
        assert_eq!(stream.finish().await, Err(ClientError::Cancelled));
        assert!(byte_tx.send(Ok(Bytes::from_static(b"{\"content\":\"x\"}\n"))).is_err());

        tw.enqueue("new");
        tw.wait_idle().await;
        assert_eq!(tw.visible_text(), "new");
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_after_finish_keeps_the_revealed_answer() {
        let tw = typewriter();
        let stream = AnswerStream::spawn(
            StreamFormat::Ndjson,
            chunks(&["{\"content\":\"done\"}\n"]),
            tw.clone(),
            AnswerAccumulator::new(),
        );
        let handle = stream.cancel_handle();
        assert_eq!(stream.finish().await.expect("completed").answer, "done");
        tw.wait_idle().await;
        assert_eq!(tw.visible_text(), "done");

        handle.cancel();
        assert!(handle.is_cancelled());
        assert_eq!(tw.visible_text(), "done");
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_after_finish_leaves_queued_reveal_running() {
        let tw = typewriter();
        let stream = AnswerStream::spawn(
            StreamFormat::Ndjson,
            chunks(&["{\"content\":\"finished\"}\n"]),
            tw.clone(),
            AnswerAccumulator::new(),
        );
        let handle = stream.cancel_handle();
        stream.finish().await.expect("completed");
        handle.cancel();
        tw.wait_idle().await;
        assert_eq!(tw.visible_text(), "finished");
    }

    #[tokio::test]
    async fn transport_error_fails_the_stream() {
        let parts: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"{\"content\":\"a\"}\n")),
            Err(std::io::Error::other("reset by peer")),
        ];
        let stream = AnswerStream::spawn(
            StreamFormat::Ndjson,
            stream::iter(parts),
            typewriter(),
            AnswerAccumulator::new(),
        );
        assert!(matches!(stream.finish().await, Err(ClientError::Transport(msg)) if msg.contains("reset by peer")));
    }

    fn tokio_stream_from(
        mut rx: mpsc::UnboundedReceiver<Result<Bytes, std::io::Error>>,
    ) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static {
        stream::poll_fn(move |cx| rx.poll_recv(cx))
    }
}

use std::io::Write;

use infoasst_client::{
    AnswerStream, ChatResponse, CitationLookup, ParseOptions, ParsedAnswer, Preview, StreamEvent,
    parse_answer,
};

pub type RenderError = Box<dyn std::error::Error>;

/// Terminal view of one answer while it is being revealed.
///
/// Every update re-parses the visible text and prints only the part of its
/// plain rendering that was not printed yet, so citation keys show up as
/// `[N]` and follow-up markers never reach the terminal.
#[derive(Debug)]
pub struct AnswerView {
    options: ParseOptions,
    lookup: CitationLookup,
    printed: String,
    diverged: bool,
}

impl AnswerView {
    pub fn new(options: ParseOptions) -> Self {
        Self {
            options,
            lookup: CitationLookup::new(),
            printed: String::new(),
            diverged: false,
        }
    }

    /// Uses the first citation table seen for this answer.
    pub fn set_lookup(&mut self, lookup: CitationLookup) {
        if self.lookup.is_empty() {
            self.lookup = lookup;
        }
    }

    pub fn printed(&self) -> &str {
        &self.printed
    }

    /// Prints what `visible` adds to the output so far.
    pub fn update(&mut self, visible: &str, out: &mut impl Write) -> std::io::Result<()> {
        if self.diverged {
            return Ok(());
        }
        let options = self.options.clone().streaming(true);
        let parsed = parse_answer(visible, &self.lookup, &options);
        if !self.append(&parsed.plain_text, out)? {
            self.diverged = true;
        }
        Ok(())
    }

    /// Prints the rest of the final answer and returns it parsed.
    ///
    /// If earlier output is not a prefix of the final text (for example the
    /// citation table arrived late), the whole answer is printed again on a
    /// fresh line.
    pub fn complete(
        &mut self,
        response: &ChatResponse,
        out: &mut impl Write,
    ) -> std::io::Result<ParsedAnswer> {
        self.set_lookup(response.citation_lookup.clone());
        let options = self.options.clone().streaming(false);
        let parsed = parse_answer(&response.answer, &self.lookup, &options);
        if self.diverged || !self.append(&parsed.plain_text, out)? {
            writeln!(out)?;
            out.write_all(parsed.plain_text.as_bytes())?;
            self.printed.clone_from(&parsed.plain_text);
        }
        writeln!(out)?;
        out.flush()?;
        Ok(parsed)
    }

    /// Writes the suffix of `text` past what was printed. Returns `false`
    /// when `text` does not extend the printed output.
    fn append(&mut self, text: &str, out: &mut impl Write) -> std::io::Result<bool> {
        let Some(fresh) = text.strip_prefix(self.printed.as_str()) else {
            return Ok(false);
        };
        if !fresh.is_empty() {
            out.write_all(fresh.as_bytes())?;
            out.flush()?;
            self.printed.push_str(fresh);
        }
        Ok(true)
    }
}

/// Echoes a streamed answer to `out` as the typewriter reveals it and
/// returns the final response with its parsed form.
///
/// With `reveal` off the answer is printed in one piece once the stream
/// completes.
pub async fn stream_answer(
    mut stream: AnswerStream,
    reveal: bool,
    options: ParseOptions,
    out: &mut impl Write,
) -> Result<(ChatResponse, ParsedAnswer), RenderError> {
    let typewriter = stream.typewriter().clone();
    let mut progress = typewriter.subscribe();
    let mut view = AnswerView::new(options);
    let mut reading = true;
    let mut watching = reveal;

    while reading {
        tokio::select! {
            event = stream.next_event() => match event {
                Some(StreamEvent::Metadata(meta)) => view.set_lookup(meta.citation_lookup),
                Some(event) if event.is_terminal() => reading = false,
                Some(_) => {}
                None => reading = false,
            },
            changed = progress.changed(), if watching => match changed {
                Ok(()) => view.update(&typewriter.visible_text(), out)?,
                Err(_) => watching = false,
            },
        }
    }

    let response = match stream.finish().await {
        Ok(response) => response,
        Err(err) => {
            typewriter.skip_to_end();
            view.update(&typewriter.visible_text(), out)?;
            writeln!(out)?;
            return Err(err.into());
        }
    };

    if reveal {
        loop {
            let snapshot = *progress.borrow_and_update();
            view.update(&typewriter.visible_text(), out)?;
            if snapshot.pending == 0 && !snapshot.running {
                break;
            }
            if !snapshot.running {
                typewriter.start();
            }
            if progress.changed().await.is_err() {
                break;
            }
        }
    } else {
        typewriter.skip_to_end();
    }
    let parsed = view.complete(&response, out)?;
    Ok((response, parsed))
}

pub fn print_answer(parsed: &ParsedAnswer, with_body: bool) -> std::io::Result<()> {
    let mut stdout = std::io::stdout().lock();
    if with_body {
        writeln!(stdout, "{}", parsed.plain_text)?;
    }
    if !parsed.references.is_empty() {
        writeln!(stdout, "\nCitations:")?;
        for reference in &parsed.references {
            if reference.page_number.is_empty() {
                writeln!(stdout, "  [{}] {}", reference.ordinal, reference.label)?;
            } else {
                writeln!(
                    stdout,
                    "  [{}] {} (page {})",
                    reference.ordinal, reference.label, reference.page_number
                )?;
            }
        }
    }
    if !parsed.follow_up_questions.is_empty() {
        writeln!(stdout, "\nFollow-up questions:")?;
        for question in &parsed.follow_up_questions {
            writeln!(stdout, "  - {question}")?;
        }
    }
    Ok(())
}

pub fn print_preview(preview: &Preview) {
    match preview {
        Preview::Html(html) => println!("{html}"),
        Preview::Embed(url) => println!("open: {url}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use bytes::Bytes;
    use futures::stream;
    use infoasst_client::{AnswerAccumulator, CitationLookupEntry, StreamFormat, Typewriter};

    const SKY: &str = "The sky is blue [FileA]. It is also vast [FileB]. [FileA] confirms this.<<<Why is the sky blue?>>>";
    const SKY_PLAIN: &str = "The sky is blue [1]. It is also vast [2]. [1] confirms this.";

    fn sky_lookup() -> CitationLookup {
        [
            ("FileA", "https://acct.blob.core.windows.net/containerX/docs/a.pdf"),
            ("FileB", "https://acct.blob.core.windows.net/containerX/docs/b.pdf"),
        ]
        .into_iter()
        .map(|(key, path)| {
            (
                key.to_string(),
                CitationLookupEntry {
                    citation: String::new(),
                    source_path: path.to_string(),
                    page_number: "1".into(),
                },
            )
        })
        .collect()
    }

    fn sky_response() -> ChatResponse {
        ChatResponse {
            answer: SKY.to_string(),
            citation_lookup: sky_lookup(),
            ..ChatResponse::default()
        }
    }

    #[test]
    fn char_by_char_updates_print_numbered_text_once() {
        let mut view = AnswerView::new(ParseOptions::default());
        view.set_lookup(sky_lookup());
        let mut out = Vec::new();
        for (idx, _) in SKY.char_indices() {
            view.update(&SKY[..idx], &mut out).expect("write");
        }
        view.update(SKY, &mut out).expect("write");
        let parsed = view.complete(&sky_response(), &mut out).expect("write");

        assert_eq!(String::from_utf8(out).expect("utf8"), format!("{SKY_PLAIN}\n"));
        assert_eq!(view.printed(), SKY_PLAIN);
        assert_eq!(parsed.citations, vec!["docs/a.pdf", "docs/b.pdf"]);
        assert_eq!(parsed.follow_up_questions, vec!["Why is the sky blue?"]);
    }

    #[test]
    fn late_lookup_reprints_the_final_answer() {
        let mut view = AnswerView::new(ParseOptions::default());
        let mut out = Vec::new();
        view.update("The sky is blue [FileA]. It", &mut out).expect("write");
        view.complete(&sky_response(), &mut out).expect("write");

        let text = String::from_utf8(out).expect("utf8");
        assert_eq!(text, format!("The sky is blue . It\n{SKY_PLAIN}\n"));
    }

    #[test]
    fn complete_without_updates_prints_the_whole_answer() {
        let mut view = AnswerView::new(ParseOptions::default());
        let mut out = Vec::new();
        view.complete(&sky_response(), &mut out).expect("write");
        assert_eq!(String::from_utf8(out).expect("utf8"), format!("{SKY_PLAIN}\n"));
    }

    fn ndjson(parts: &[String]) -> AnswerStream {
        let chunks: Vec<Result<Bytes, std::io::Error>> = parts
            .iter()
            .map(|p| Ok(Bytes::from(p.clone())))
            .collect();
        AnswerStream::spawn(
            StreamFormat::Ndjson,
            stream::iter(chunks),
            Typewriter::new(Duration::from_millis(5)),
            AnswerAccumulator::new(),
        )
    }

    fn content(text: &str) -> String {
        format!("{}\n", serde_json::json!({ "content": text }))
    }

    #[tokio::test(start_paused = true)]
    async fn streamed_answer_is_echoed_with_ordinals() {
        let metadata = format!(
            "{}\n",
            serde_json::json!({ "data_points": [], "citation_lookup": sky_lookup() })
        );
        let mut parts = vec![metadata];
        parts.extend(["The sky is bl", "ue [Fil", "eA]. It is also vast [FileB]. [FileA] con"]
            .into_iter()
            .map(content));
        parts.push(content("firms this.<<<Why is"));
        parts.push(content(" the sky blue?>>>"));

        let mut out = Vec::new();
        let (response, parsed) = stream_answer(ndjson(&parts), true, ParseOptions::default(), &mut out)
            .await
            .expect("answer");

        assert_eq!(response.answer, SKY);
        assert_eq!(String::from_utf8(out).expect("utf8"), format!("{SKY_PLAIN}\n"));
        assert_eq!(parsed.follow_up_questions, vec!["Why is the sky blue?"]);
    }

    #[tokio::test]
    async fn unrevealed_answer_is_printed_in_one_piece() {
        let parts = vec![content("plain [FileZ] answer")];
        let mut out = Vec::new();
        let (_, parsed) = stream_answer(ndjson(&parts), false, ParseOptions::default(), &mut out)
            .await
            .expect("answer");
        assert_eq!(String::from_utf8(out).expect("utf8"), "plain  answer\n");
        assert!(parsed.citations.is_empty());
    }

    #[tokio::test]
    async fn error_record_surfaces_after_partial_output() {
        let parts = vec![content("partial"), "{\"error\":\"index offline\"}\n".to_string()];
        let mut out = Vec::new();
        let err = stream_answer(ndjson(&parts), false, ParseOptions::default(), &mut out)
            .await
            .expect_err("stream failed");
        assert!(err.to_string().contains("index offline"), "{err}");
        assert_eq!(String::from_utf8(out).expect("utf8"), "partial\n");
    }
}

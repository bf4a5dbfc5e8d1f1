//! Turns raw answer text into display markup with numbered citations and
//! extracted follow-up questions.

use once_cell::sync::Lazy;
use pulldown_cmark::{Event, Options, Parser, html};
use regex::Regex;
use tracing::debug;

use crate::response::CitationLookup;

static FOLLOW_UP_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<<<([^>]+)>>>").expect("follow-up pattern is valid"));
static CITATION_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[([^\]]+)\]").expect("citation pattern is valid"));
static CITATION_SLOT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x{E000}(\d+)\x{E001}").expect("slot pattern is valid"));

/// Private-use code points that bracket a citation ordinal in the markdown
/// handed to the HTML renderer. They are stripped from answer text first.
const SLOT_OPEN: char = '\u{E000}';
const SLOT_CLOSE: char = '\u{E001}';

/// Options for [`parse_answer`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParseOptions {
    /// The text is still arriving; a trailing unterminated `[` or `<<<` is
    /// hidden.
    pub streaming: bool,
    /// Leading `/` segments dropped from a source path to form its label.
    pub prefix_segments: usize,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            streaming: false,
            prefix_segments: 4,
        }
    }
}

impl ParseOptions {
    pub fn streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn prefix_segments(mut self, segments: usize) -> Self {
        self.prefix_segments = segments;
        self
    }
}

/// A resolved citation as rendered into the markup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CitationReference {
    pub ordinal: usize,
    pub key: String,
    pub label: String,
    pub source_path: String,
    pub page_number: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParsedAnswer {
    /// Answer text with citation markers replaced by anchors and follow-up
    /// markers removed. Answer text is copied as is, so this is not safe to
    /// inject into a page; use [`ParsedAnswer::to_html`] for that.
    pub display_markup: String,
    /// Same text for terminals: citation markers become `[N]`.
    pub plain_text: String,
    /// Distinct citation labels, first appearance first. Ordinal N is
    /// `citations[N - 1]`.
    pub citations: Vec<String>,
    /// One entry per distinct citation, same order as `citations`.
    pub references: Vec<CitationReference>,
    pub follow_up_questions: Vec<String>,
    /// Markdown body with citations as ordinal slots, rendered by `to_html`.
    markdown_source: String,
}

impl ParsedAnswer {
    /// Renders the answer as HTML.
    ///
    /// Raw HTML in the answer text is dropped, whatever it looks like; the
    /// text between tags is kept. Citation anchors are spliced in after
    /// rendering.
    pub fn to_html(&self) -> String {
        let mut options = Options::empty();
        options.insert(Options::ENABLE_TABLES);
        options.insert(Options::ENABLE_STRIKETHROUGH);
        let parser = Parser::new_ext(&self.markdown_source, options)
            .filter(|event| !matches!(event, Event::Html(_) | Event::InlineHtml(_)));
        let mut rendered = String::new();
        html::push_html(&mut rendered, parser);
        CITATION_SLOT
            .replace_all(&rendered, |caps: &regex::Captures<'_>| {
                caps[1]
                    .parse::<usize>()
                    .ok()
                    .and_then(|ordinal| self.reference(ordinal))
                    .map(|r| citation_anchor(r.ordinal, &r.label, &r.source_path, &r.page_number))
                    .unwrap_or_default()
            })
            .into_owned()
    }

    /// Looks up the reference for a 1-based ordinal.
    pub fn reference(&self, ordinal: usize) -> Option<&CitationReference> {
        ordinal
            .checked_sub(1)
            .and_then(|idx| self.references.get(idx))
    }
}

/// Collects the contents of every `<<<...>>>` marker in order.
pub fn extract_follow_up_questions(text: &str) -> Vec<String> {
    FOLLOW_UP_MARKER
        .captures_iter(text)
        .map(|caps| caps[1].trim().to_string())
        .filter(|q| !q.is_empty())
        .collect()
}

/// Parses answer text against a citation lookup table.
///
/// Never fails: unknown citation keys are dropped and unterminated markers
/// stay as literal text.
pub fn parse_answer(text: &str, lookup: &CitationLookup, options: &ParseOptions) -> ParsedAnswer {
    let mut text = text.trim();
    if options.streaming {
        text = strip_partial_citation(strip_partial_follow_up(text));
    }

    let follow_up_questions = extract_follow_up_questions(text);
    let without_follow_ups = FOLLOW_UP_MARKER.replace_all(text, "");
    let body = without_follow_ups.trim();
    if body.is_empty() {
        return ParsedAnswer {
            follow_up_questions,
            ..ParsedAnswer::default()
        };
    }

    let mut markup = String::with_capacity(body.len());
    let mut plain = String::with_capacity(body.len());
    let mut source = String::with_capacity(body.len());
    let mut references: Vec<CitationReference> = Vec::new();
    let mut last = 0;
    for caps in CITATION_MARKER.captures_iter(body) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        let segment = &body[last..whole.start()];
        markup.push_str(segment);
        plain.push_str(segment);
        push_without_slots(&mut source, segment);
        last = whole.end();

        let key = &caps[1];
        let Some(entry) = lookup.get(key) else {
            debug!(event = "parser.citation_unresolved", citation_key = key, "dropping unknown citation key");
            continue;
        };
        let label = citation_label(&entry.source_path, options.prefix_segments);
        let ordinal = match references.iter().position(|r| r.label == label) {
            Some(idx) => idx + 1,
            None => {
                references.push(CitationReference {
                    ordinal: references.len() + 1,
                    key: key.to_string(),
                    label: label.clone(),
                    source_path: entry.source_path.clone(),
                    page_number: entry.page_number.clone(),
                });
                references.len()
            }
        };
        markup.push_str(&citation_anchor(ordinal, &label, &entry.source_path, &entry.page_number));
        plain.push_str(&format!("[{ordinal}]"));
        source.push(SLOT_OPEN);
        source.push_str(&ordinal.to_string());
        source.push(SLOT_CLOSE);
    }
    markup.push_str(&body[last..]);
    plain.push_str(&body[last..]);
    push_without_slots(&mut source, &body[last..]);

    ParsedAnswer {
        display_markup: markup,
        plain_text: plain,
        citations: references.iter().map(|r| r.label.clone()).collect(),
        references,
        follow_up_questions,
        markdown_source: source,
    }
}

fn push_without_slots(out: &mut String, segment: &str) {
    out.extend(segment.chars().filter(|ch| *ch != SLOT_OPEN && *ch != SLOT_CLOSE));
}

/// Drops the leading storage-account/container segments from a source path.
///
/// Paths too short to strip are returned unchanged.
pub fn citation_label(source_path: &str, prefix_segments: usize) -> String {
    let rest = source_path
        .split('/')
        .skip(prefix_segments)
        .collect::<Vec<_>>()
        .join("/");
    if rest.is_empty() {
        source_path.to_string()
    } else {
        rest
    }
}

/// Hides a citation marker that has been opened but not yet closed.
fn strip_partial_citation(text: &str) -> &str {
    match (text.rfind('['), text.rfind(']')) {
        (Some(open), Some(close)) if open > close => &text[..open],
        (Some(open), None) => &text[..open],
        _ => text,
    }
}

/// Hides a follow-up marker that has been opened but not yet closed, and
/// trailing `<` that may be the start of one.
fn strip_partial_follow_up(text: &str) -> &str {
    let text = match text.rfind("<<<") {
        Some(open) if !text[open..].contains(">>>") => &text[..open],
        _ => text,
    };
    text.trim_end_matches('<')
}

fn citation_anchor(ordinal: usize, label: &str, path: &str, page: &str) -> String {
    format!(
        "<a class=\"citation\" data-citation=\"{ordinal}\" data-path=\"{}\" data-page=\"{}\" title=\"{}\"><sup>{ordinal}</sup></a>",
        escape_html(path),
        escape_html(page),
        escape_html(label),
    )
}

pub(crate) fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::CitationLookupEntry;

    fn lookup(entries: &[(&str, &str)]) -> CitationLookup {
        entries
            .iter()
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

    fn sky_lookup() -> CitationLookup {
        lookup(&[
            ("FileA", "https://acct.blob.core.windows.net/containerX/docs/a.pdf"),
            ("FileB", "https://acct.blob.core.windows.net/containerX/docs/b.pdf"),
        ])
    }

    const SKY: &str = "The sky is blue [FileA]. It is also vast [FileB]. [FileA] confirms this.<<<Why is the sky blue?>>>";

    #[test]
    fn sky_scenario_numbers_citations_by_first_appearance() {
        let parsed = parse_answer(SKY, &sky_lookup(), &ParseOptions::default());
        assert_eq!(parsed.citations, vec!["docs/a.pdf", "docs/b.pdf"]);
        assert_eq!(parsed.follow_up_questions, vec!["Why is the sky blue?"]);
        assert!(!parsed.display_markup.contains("<<<"));
        assert!(!parsed.display_markup.contains(">>>"));
        assert_eq!(parsed.display_markup.matches("<sup>1</sup>").count(), 2);
        assert_eq!(parsed.display_markup.matches("<sup>2</sup>").count(), 1);
        assert!(parsed.display_markup.starts_with("The sky is blue <a class=\"citation\""));
        assert!(parsed.display_markup.ends_with("</a> confirms this."));
        assert_eq!(parsed.reference(2).map(|r| r.key.as_str()), Some("FileB"));
        assert_eq!(
            parsed.plain_text,
            "The sky is blue [1]. It is also vast [2]. [1] confirms this."
        );
    }

    #[test]
    fn parsing_is_deterministic() {
        let lookup = sky_lookup();
        let first = parse_answer(SKY, &lookup, &ParseOptions::default());
        let second = parse_answer(SKY, &lookup, &ParseOptions::default());
        assert_eq!(first, second);
    }

    #[test]
    fn repeated_key_gets_one_ordinal() {
        let text = "[FileA] ".repeat(5);
        let parsed = parse_answer(&text, &sky_lookup(), &ParseOptions::default());
        assert_eq!(parsed.citations, vec!["docs/a.pdf"]);
        assert_eq!(parsed.display_markup.matches("<sup>1</sup>").count(), 5);
        assert!(!parsed.display_markup.contains("<sup>2</sup>"));
    }

    #[test]
    fn unknown_key_contributes_nothing() {
        let parsed = parse_answer(
            "Known [FileA] unknown [FileZ] end",
            &sky_lookup(),
            &ParseOptions::default(),
        );
        assert_eq!(parsed.citations, vec!["docs/a.pdf"]);
        assert!(!parsed.display_markup.contains("FileZ"));
        assert!(parsed.display_markup.ends_with(" unknown  end"));
    }

    #[test]
    fn blank_text_yields_empty_result() {
        for text in ["", "   \n\t"] {
            let parsed = parse_answer(text, &sky_lookup(), &ParseOptions::default());
            assert_eq!(parsed, ParsedAnswer::default());
        }
    }

    #[test]
    fn unterminated_markers_stay_literal() {
        let parsed = parse_answer(
            "see [FileA and <<<half",
            &sky_lookup(),
            &ParseOptions::default(),
        );
        assert_eq!(parsed.display_markup, "see [FileA and <<<half");
        assert!(parsed.citations.is_empty());
        assert!(parsed.follow_up_questions.is_empty());
    }

    #[test]
    fn streaming_hides_half_typed_citation() {
        let opts = ParseOptions::default().streaming(true);
        let parsed = parse_answer("Blue [FileA] and [Fil", &sky_lookup(), &opts);
        assert!(parsed.display_markup.ends_with("</a> and"));
        assert_eq!(parsed.citations.len(), 1);

        let done = parse_answer("Blue [Fil", &sky_lookup(), &ParseOptions::default());
        assert_eq!(done.display_markup, "Blue [Fil");
    }

    #[test]
    fn label_strips_prefix_segments() {
        let path = "https://acct.blob.core.windows.net/upload/hr/policy.docx";
        assert_eq!(citation_label(path, 4), "hr/policy.docx");
        assert_eq!(citation_label(path, 3), "upload/hr/policy.docx");
        assert_eq!(citation_label("short.pdf", 4), "short.pdf");
    }

    #[test]
    fn anchor_attributes_are_escaped() {
        let lookup = lookup(&[("F", "https://a/b/c/d\"<x>.pdf")]);
        let parsed = parse_answer("x [F]", &lookup, &ParseOptions::default());
        assert!(parsed.display_markup.contains("d&quot;&lt;x&gt;.pdf"));
    }

    #[test]
    fn html_rendering_keeps_anchors_and_drops_other_markup() {
        let parsed = parse_answer(
            "**Blue** [FileA] <script>alert(1)</script>",
            &sky_lookup(),
            &ParseOptions::default(),
        );
        let html = parsed.to_html();
        assert!(html.contains("<strong>Blue</strong>"));
        assert!(html.contains("<sup>1</sup>"));
        assert!(!html.contains("<script>"));
        assert!(!html.contains("&lt;script"));
    }

    #[test]
    fn html_rendering_escapes_lookalike_citation_anchors() {
        let parsed = parse_answer(
            "Click <a class=\"citation\" href=\"javascript:alert(1)\" onmouseover=\"steal()\">here</a> <sup>9</sup> now [FileA]",
            &sky_lookup(),
            &ParseOptions::default(),
        );
        let html = parsed.to_html();
        assert!(!html.contains("javascript:alert"), "{html}");
        assert!(!html.contains("<a class=\"citation\" href"));
        assert!(!html.contains("onmouseover"));
        assert!(!html.contains("<sup>9</sup>"));
        assert!(html.contains("Click here 9 now"));
        assert_eq!(html.matches("<a class=\"citation\"").count(), 1);
        assert!(html.contains("data-citation=\"1\""));
    }

    #[test]
    fn html_rendering_ignores_slot_characters_in_answer_text() {
        let parsed = parse_answer(
            "forged \u{E000}1\u{E001} slot",
            &sky_lookup(),
            &ParseOptions::default(),
        );
        let html = parsed.to_html();
        assert!(!html.contains("<a "));
        assert!(html.contains("forged 1 slot"));
    }

    #[test]
    fn streaming_hides_half_typed_follow_up() {
        let opts = ParseOptions::default().streaming(true);
        let parsed = parse_answer("Blue sky.<<<Why is", &sky_lookup(), &opts);
        assert_eq!(parsed.plain_text, "Blue sky.");
        assert!(parsed.follow_up_questions.is_empty());

        let parsed = parse_answer("Blue sky. <<", &sky_lookup(), &opts);
        assert_eq!(parsed.plain_text, "Blue sky.");

        let parsed = parse_answer("Blue sky.<<<Why?>>> More", &sky_lookup(), &opts);
        assert_eq!(parsed.follow_up_questions, vec!["Why?"]);
        assert_eq!(parsed.plain_text, "Blue sky. More");
    }

    #[test]
    fn streaming_output_only_grows_toward_the_final_text() {
        let lookup = sky_lookup();
        let opts = ParseOptions::default().streaming(true);
        let last = parse_answer(SKY, &lookup, &ParseOptions::default()).plain_text;
        let mut previous = String::new();
        for (idx, _) in SKY.char_indices().skip(1) {
            let partial = parse_answer(&SKY[..idx], &lookup, &opts).plain_text;
            assert!(partial.starts_with(&previous), "{previous:?} -> {partial:?}");
            assert!(last.starts_with(&partial), "{partial:?} is not a prefix");
            previous = partial;
        }
    }
}

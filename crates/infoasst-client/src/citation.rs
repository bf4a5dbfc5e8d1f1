//! Citation detail lookup and preview dispatch for the citation side panel.

use pulldown_cmark::{Event, Options, Parser, html};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::ClientError;
use crate::parser::escape_html;

const OFFICE_VIEWER_URL: &str = "https://view.officeapps.live.com/op/view.aspx?src=";

/// Metadata and text of one indexed chunk, as returned by `/getcitation`.
///
/// Every field is optional on the wire; missing values deserialize to their
/// defaults.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CitationDetail {
    pub file_name: String,
    pub file_uri: String,
    pub title: String,
    pub translated_title: String,
    pub section: String,
    pub pages: Vec<u32>,
    pub token_count: u64,
    pub content: String,
    pub processed_datetime: String,
    pub file_class: String,
}

/// How a cited document is shown in the preview pane.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderMode {
    /// Embedded office-document viewer.
    OfficeViewer,
    /// PDF embed opened at `page` when known.
    Pdf { page: Option<u32> },
    Markdown,
    PlainText,
    /// Generic frame embed; the fallback for anything else.
    Frame,
}

impl RenderMode {
    /// Picks the render mode from the extension at the end of `path`.
    ///
    /// Query strings and fragments are ignored and matching is
    /// case-insensitive. A `#page=N` fragment selects the PDF page. Unknown
    /// or missing extensions map to [`RenderMode::Frame`].
    pub fn for_path(path: &str) -> Self {
        let (location, page) = split_page(path);
        let extension = location
            .rsplit('/')
            .next()
            .and_then(|name| name.rsplit_once('.'))
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        match extension.as_str() {
            "doc" | "docx" | "xls" | "xlsx" | "ppt" | "pptx" => Self::OfficeViewer,
            "pdf" => Self::Pdf { page },
            "md" | "markdown" => Self::Markdown,
            "txt" | "csv" | "json" | "log" => Self::PlainText,
            _ => Self::Frame,
        }
    }

    /// Same as [`RenderMode::for_path`] with an explicit page hint, such as
    /// the `page_number` of a citation lookup entry.
    pub fn for_citation(path: &str, page_number: &str) -> Self {
        match Self::for_path(path) {
            Self::Pdf { page: None } => Self::Pdf {
                page: page_number.trim().parse().ok(),
            },
            other => other,
        }
    }
}

fn split_page(path: &str) -> (&str, Option<u32>) {
    let (location, fragment) = match path.split_once('#') {
        Some((location, fragment)) => (location, Some(fragment)),
        None => (path, None),
    };
    let location = location.split_once('?').map_or(location, |(head, _)| head);
    let page = fragment
        .and_then(|f| f.strip_prefix("page="))
        .and_then(|n| n.parse().ok());
    (location, page)
}

/// What the preview pane should display.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Preview {
    /// Ready-to-insert HTML.
    Html(String),
    /// URL to embed in a frame.
    Embed(String),
}

/// Builds the preview for a cited document.
///
/// `content` is only read for the text modes; embed modes derive a URL from
/// `source_url`.
pub fn render_preview(mode: RenderMode, source_url: &str, content: &[u8]) -> Preview {
    match mode {
        RenderMode::Markdown => {
            let text = String::from_utf8_lossy(content);
            let mut options = Options::empty();
            options.insert(Options::ENABLE_TABLES);
            options.insert(Options::ENABLE_STRIKETHROUGH);
            let parser = Parser::new_ext(&text, options).map(|event| match event {
                Event::Html(raw) | Event::InlineHtml(raw) => Event::Text(raw),
                other => other,
            });
            let mut out = String::new();
            html::push_html(&mut out, parser);
            Preview::Html(out)
        }
        RenderMode::PlainText => {
            let text = String::from_utf8_lossy(content);
            Preview::Html(format!("<pre>{}</pre>", escape_html(&text)))
        }
        RenderMode::OfficeViewer => {
            Preview::Embed(format!("{OFFICE_VIEWER_URL}{}", urlencoding::encode(source_url)))
        }
        RenderMode::Pdf { page } => {
            let base = source_url.split_once('#').map_or(source_url, |(head, _)| head);
            match page {
                Some(page) => Preview::Embed(format!("{base}#page={page}")),
                None => Preview::Embed(base.to_string()),
            }
        }
        RenderMode::Frame => Preview::Embed(source_url.to_string()),
    }
}

/// Backend operations the citation panel depends on.
#[async_trait::async_trait]
pub trait CitationSource: Send + Sync {
    /// Fetches chunk metadata for a citation path.
    async fn resolve(&self, citation_path: &str) -> Result<CitationDetail, ClientError>;

    /// Fetches the raw bytes of a cited file.
    async fn fetch_content(&self, citation_key: &str) -> Result<Vec<u8>, ClientError>;
}

/// Side-panel state for the selected citation.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum CitationPanel {
    #[default]
    Loading,
    Ready(Box<CitationDetail>),
}

impl CitationPanel {
    /// Resolves `citation_path` through `source`.
    ///
    /// Failures are logged and leave the panel loading; no retry or timeout
    /// is applied here.
    pub async fn load<S: CitationSource + ?Sized>(source: &S, citation_path: &str) -> Self {
        match source.resolve(citation_path).await {
            Ok(detail) => Self::Ready(Box::new(detail)),
            Err(err) => {
                warn!(
                    event = "citation.resolve_failed",
                    citation_path,
                    error = %err,
                    "citation detail unavailable; panel stays loading"
                );
                Self::Loading
            }
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading)
    }

    pub fn detail(&self) -> Option<&CitationDetail> {
        match self {
            Self::Ready(detail) => Some(detail),
            Self::Loading => None,
        }
    }
}

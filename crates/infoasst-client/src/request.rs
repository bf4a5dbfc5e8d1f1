use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::ClientError;
use crate::response::CitationLookup;

/// Retrieval strategy selector, sent to the backend as its integer code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Approach {
    RetrieveThenRead,
    ReadRetrieveRead,
    ReadDecomposeAsk,
    GptDirect,
    ChatWebRetrieveRead,
    CompareWorkWithWeb,
    CompareWebWithWork,
}

impl Approach {
    pub const ALL: [Approach; 7] = [
        Approach::RetrieveThenRead,
        Approach::ReadRetrieveRead,
        Approach::ReadDecomposeAsk,
        Approach::GptDirect,
        Approach::ChatWebRetrieveRead,
        Approach::CompareWorkWithWeb,
        Approach::CompareWebWithWork,
    ];

    /// Wire code understood by the backend.
    pub const fn code(self) -> u8 {
        match self {
            Approach::RetrieveThenRead => 0,
            Approach::ReadRetrieveRead => 1,
            Approach::ReadDecomposeAsk => 2,
            Approach::GptDirect => 3,
            Approach::ChatWebRetrieveRead => 4,
            Approach::CompareWorkWithWeb => 5,
            Approach::CompareWebWithWork => 6,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.code() == code)
    }

    /// Compare approaches re-answer a previous turn and need its citation
    /// lookup and thought chain.
    pub fn is_compare(self) -> bool {
        matches!(
            self,
            Approach::CompareWorkWithWeb | Approach::CompareWebWithWork
        )
    }
}

impl fmt::Display for Approach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Approach::RetrieveThenRead => "retrieve-then-read",
            Approach::ReadRetrieveRead => "read-retrieve-read",
            Approach::ReadDecomposeAsk => "read-decompose-ask",
            Approach::GptDirect => "gpt-direct",
            Approach::ChatWebRetrieveRead => "chat-web-retrieve-read",
            Approach::CompareWorkWithWeb => "compare-work-with-web",
            Approach::CompareWebWithWork => "compare-web-with-work",
        };
        f.write_str(name)
    }
}

impl Serialize for Approach {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for Approach {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u8::deserialize(deserializer)?;
        Approach::from_code(code)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown approach code {code}")))
    }
}

/// Chat mode picked in the UI.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ChatMode {
    #[default]
    WorkOnly,
    WorkPlusWeb,
    Ungrounded,
}

/// Complete settings implied by a chat mode.
///
/// Every field is derived from the mode alone, so switching modes never
/// inherits leftovers from the previous one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModeSettings {
    pub mode: ChatMode,
    pub default_approach: Approach,
    pub web_enabled: bool,
    pub retrieval_enabled: bool,
}

impl ChatMode {
    pub fn settings(self) -> ModeSettings {
        match self {
            ChatMode::WorkOnly => ModeSettings {
                mode: self,
                default_approach: Approach::ReadRetrieveRead,
                web_enabled: false,
                retrieval_enabled: true,
            },
            ChatMode::WorkPlusWeb => ModeSettings {
                mode: self,
                default_approach: Approach::ReadRetrieveRead,
                web_enabled: true,
                retrieval_enabled: true,
            },
            ChatMode::Ungrounded => ModeSettings {
                mode: self,
                default_approach: Approach::GptDirect,
                web_enabled: false,
                retrieval_enabled: false,
            },
        }
    }

    /// Whether `approach` may be used while this mode is active.
    pub fn allows(self, approach: Approach) -> bool {
        match self {
            ChatMode::WorkOnly => matches!(
                approach,
                Approach::RetrieveThenRead | Approach::ReadRetrieveRead | Approach::ReadDecomposeAsk
            ),
            ChatMode::WorkPlusWeb => approach != Approach::GptDirect,
            ChatMode::Ungrounded => approach == Approach::GptDirect,
        }
    }
}

/// Response length presets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum ResponseLength {
    Succinct,
    Standard,
    Thorough,
}

impl From<ResponseLength> for u32 {
    fn from(value: ResponseLength) -> Self {
        match value {
            ResponseLength::Succinct => 1024,
            ResponseLength::Standard => 2048,
            ResponseLength::Thorough => 3072,
        }
    }
}

impl TryFrom<u32> for ResponseLength {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1024 => Ok(Self::Succinct),
            2048 => Ok(Self::Standard),
            3072 => Ok(Self::Thorough),
            other => Err(format!("unknown response length {other}")),
        }
    }
}

/// Per-request option overrides. Unset options are omitted from the body.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Overrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantic_ranker: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantic_captions: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_template_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_template_suffix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggest_followup_questions: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_persona: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_persona: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_persona: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_length: Option<ResponseLength>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_temp: Option<f32>,
    /// Comma separated folder filter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_folders: Option<String>,
    /// Comma separated tag filter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_tags: Option<String>,
}

impl Overrides {
    pub fn top(mut self, top: u32) -> Self {
        self.top = Some(top);
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn semantic_ranker(mut self, enabled: bool) -> Self {
        self.semantic_ranker = Some(enabled);
        self
    }

    pub fn suggest_followup_questions(mut self, enabled: bool) -> Self {
        self.suggest_followup_questions = Some(enabled);
        self
    }

    pub fn response_length(mut self, length: ResponseLength) -> Self {
        self.response_length = Some(length);
        self
    }

    pub fn selected_folders<I, S>(mut self, folders: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.selected_folders = join_filter(folders);
        self
    }

    pub fn selected_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.selected_tags = join_filter(tags);
        self
    }
}

fn join_filter<I, S>(items: I) -> Option<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let joined = items
        .into_iter()
        .map(|s| s.as_ref().trim().to_string())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(",");
    (!joined.is_empty()).then_some(joined)
}

/// One question/answer pair of the conversation history.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot: Option<String>,
}

impl ChatTurn {
    pub fn question(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            bot: None,
        }
    }
}

/// Body of a `/chat` request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub history: Vec<ChatTurn>,
    pub approach: Approach,
    #[serde(default)]
    pub overrides: Overrides,
    #[serde(default, skip_serializing_if = "CitationLookup::is_empty")]
    pub citation_lookup: CitationLookup,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub thought_chain: serde_json::Map<String, serde_json::Value>,
}

impl ChatRequest {
    /// Creates a single-turn request.
    pub fn new(question: impl Into<String>, approach: Approach) -> Self {
        Self {
            history: vec![ChatTurn::question(question)],
            approach,
            overrides: Overrides::default(),
            citation_lookup: CitationLookup::new(),
            thought_chain: serde_json::Map::new(),
        }
    }

    pub fn overrides(mut self, overrides: Overrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ClientError> {
        let Some(last) = self.history.last() else {
            return Err(ClientError::Validation(
                "chat history must contain at least one turn".into(),
            ));
        };
        if last.user.trim().is_empty() {
            return Err(ClientError::Validation("question must not be empty".into()));
        }
        if last.bot.is_some() {
            return Err(ClientError::Validation(
                "last history turn must not already have an answer".into(),
            ));
        }
        if self.approach.is_compare() && self.citation_lookup.is_empty() {
            return Err(ClientError::Validation(format!(
                "{} requires the previous turn's citation lookup",
                self.approach
            )));
        }
        Ok(())
    }
}

/// Body of a one-shot `/ask` request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AskRequest {
    pub question: String,
    pub approach: Approach,
    #[serde(default)]
    pub overrides: Overrides,
}

impl AskRequest {
    pub fn new(question: impl Into<String>, approach: Approach) -> Self {
        Self {
            question: question.into(),
            approach,
            overrides: Overrides::default(),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), ClientError> {
        if self.question.trim().is_empty() {
            return Err(ClientError::Validation("question must not be empty".into()));
        }
        Ok(())
    }
}

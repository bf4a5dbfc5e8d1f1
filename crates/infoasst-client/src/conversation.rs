use std::collections::BTreeMap;

use crate::errors::ClientError;
use crate::request::{Approach, ChatMode, ChatRequest, ChatTurn, ModeSettings, Overrides};
use crate::response::ChatResponse;

/// One answered question.
#[derive(Clone, Debug, PartialEq)]
pub struct Turn {
    pub question: String,
    /// Approach that produced the primary answer.
    pub approach: Approach,
    /// Answers keyed by approach; compare approaches add extra slots.
    pub answers: BTreeMap<Approach, ChatResponse>,
}

impl Turn {
    /// The answer shown for this turn and sent back as history.
    pub fn answer(&self) -> Option<&ChatResponse> {
        self.answers.get(&self.approach)
    }
}

/// Client-side conversation state: the active mode, answered turns, and the
/// question currently in flight.
#[derive(Clone, Debug)]
pub struct Conversation {
    settings: ModeSettings,
    approach: Approach,
    overrides: Overrides,
    turns: Vec<Turn>,
    pending: Option<String>,
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new(ChatMode::default())
    }
}

impl Conversation {
    pub fn new(mode: ChatMode) -> Self {
        let settings = mode.settings();
        Self {
            settings,
            approach: settings.default_approach,
            overrides: Overrides::default(),
            turns: Vec::new(),
            pending: None,
        }
    }

    /// Overrides sent with every request of this conversation.
    pub fn overrides(mut self, overrides: Overrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn set_overrides(&mut self, overrides: Overrides) {
        self.overrides = overrides;
    }

    pub fn mode(&self) -> ChatMode {
        self.settings.mode
    }

    pub fn settings(&self) -> ModeSettings {
        self.settings
    }

    pub fn approach(&self) -> Approach {
        self.approach
    }

    /// Selects the approach for the next question. It must be allowed by the
    /// active mode.
    pub fn set_approach(&mut self, approach: Approach) -> Result<(), ClientError> {
        if approach.is_compare() || !self.settings.mode.allows(approach) {
            return Err(ClientError::Validation(format!(
                "approach {approach} is not available in {:?} mode",
                self.settings.mode
            )));
        }
        self.approach = approach;
        Ok(())
    }

    /// Switches mode. The conversation is cleared and every setting is
    /// replaced by the new mode's defaults.
    pub fn switch_mode(&mut self, mode: ChatMode) {
        self.clear();
        self.settings = mode.settings();
        self.approach = self.settings.default_approach;
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn last_turn(&self) -> Option<&Turn> {
        self.turns.last()
    }

    pub fn pending_question(&self) -> Option<&str> {
        self.pending.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty() && self.pending.is_none()
    }

    /// History of answered turns, oldest first.
    pub fn history(&self) -> Vec<ChatTurn> {
        self.turns
            .iter()
            .map(|turn| ChatTurn {
                user: turn.question.clone(),
                bot: turn.answer().map(|a| a.answer.clone()),
            })
            .collect()
    }

    /// Starts a new question and returns the request to send.
    ///
    /// Only one question can be in flight; finish it with
    /// [`Conversation::record_answer`] or drop it with
    /// [`Conversation::abandon_turn`] first.
    pub fn begin_turn(&mut self, question: impl Into<String>) -> Result<ChatRequest, ClientError> {
        if self.pending.is_some() {
            return Err(ClientError::Validation(
                "a question is already in flight".into(),
            ));
        }
        let question = question.into();
        let mut history = self.history();
        history.push(ChatTurn::question(question.clone()));
        let request = ChatRequest {
            history,
            approach: self.approach,
            overrides: self.overrides.clone(),
            ..ChatRequest::new(String::new(), self.approach)
        };
        request.validate()?;
        self.pending = Some(question);
        Ok(request)
    }

    /// Stores the answer for the question in flight.
    pub fn record_answer(&mut self, response: ChatResponse) -> Result<&Turn, ClientError> {
        let Some(question) = self.pending.take() else {
            return Err(ClientError::protocol_msg("no question is in flight"));
        };
        let approach = response.approach.unwrap_or(self.approach);
        let mut answers = BTreeMap::new();
        answers.insert(approach, response);
        self.turns.push(Turn {
            question,
            approach,
            answers,
        });
        Ok(&self.turns[self.turns.len() - 1])
    }

    /// Forgets the question in flight after a cancel or failure. Returns it.
    pub fn abandon_turn(&mut self) -> Option<String> {
        self.pending.take()
    }

    /// Builds a compare request that re-answers the last turn with
    /// `approach`, carrying the last answer's citations and thought chain.
    pub fn compare_request(&self, approach: Approach) -> Result<ChatRequest, ClientError> {
        if !approach.is_compare() || !self.settings.mode.allows(approach) {
            return Err(ClientError::Validation(format!(
                "{approach} is not a compare approach available in {:?} mode",
                self.settings.mode
            )));
        }
        let Some(turn) = self.turns.last() else {
            return Err(ClientError::Validation(
                "compare needs an answered question".into(),
            ));
        };
        let Some(answer) = turn.answer() else {
            return Err(ClientError::Validation(
                "compare needs an answered question".into(),
            ));
        };
        let mut history: Vec<ChatTurn> = self.history();
        if let Some(last) = history.last_mut() {
            last.bot = None;
        }
        let request = ChatRequest {
            history,
            approach,
            overrides: self.overrides.clone(),
            citation_lookup: answer.citation_lookup.clone(),
            thought_chain: answer.thought_chain.clone(),
        };
        request.validate()?;
        Ok(request)
    }

    /// Stores a compare answer in its own slot on the last turn.
    pub fn record_compare(
        &mut self,
        approach: Approach,
        response: ChatResponse,
    ) -> Result<(), ClientError> {
        let Some(turn) = self.turns.last_mut() else {
            return Err(ClientError::protocol_msg("no turn to attach a compare answer to"));
        };
        turn.answers.insert(approach, response);
        Ok(())
    }

    /// Drops every turn and the question in flight.
    pub fn clear(&mut self) {
        self.turns.clear();
        self.pending = None;
    }

    /// Removes the last turn and returns its question so it can be asked
    /// again.
    pub fn regenerate(&mut self) -> Option<String> {
        if let Some(pending) = self.pending.take() {
            return Some(pending);
        }
        self.turns.pop().map(|turn| turn.question)
    }
}

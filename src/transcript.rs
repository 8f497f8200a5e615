use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    User,
    Model,
}

impl Speaker {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Model => "model",
        }
    }
}

/// One committed line of conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEntry {
    pub speaker: Speaker,
    pub text: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Accumulating,
}

/// Streaming partial transcriptions for the open turn plus committed history.
#[derive(Debug)]
pub struct Transcript {
    state: TurnState,
    user: String,
    model: String,
    history: Vec<TranscriptEntry>,
}

impl Default for Transcript {
    fn default() -> Self {
        Self::new()
    }
}

impl Transcript {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: TurnState::Idle,
            user: String::new(),
            model: String::new(),
            history: Vec::new(),
        }
    }

    pub fn append_user(&mut self, text: &str) {
        self.append(Speaker::User, text);
    }

    pub fn append_model(&mut self, text: &str) {
        self.append(Speaker::Model, text);
    }

    fn append(&mut self, speaker: Speaker, text: &str) {
        if text.is_empty() {
            return;
        }
        match speaker {
            Speaker::User => self.user.push_str(text),
            Speaker::Model => self.model.push_str(text),
        }
        self.state = TurnState::Accumulating;
    }

    /// Close the turn: commit non-empty accumulators (user first) and clear both.
    /// Returns the entries that were appended.
    pub fn complete_turn(&mut self) -> &[TranscriptEntry] {
        let before = self.history.len();
        let now = Utc::now();

        for (speaker, text) in [
            (Speaker::User, std::mem::take(&mut self.user)),
            (Speaker::Model, std::mem::take(&mut self.model)),
        ] {
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                self.history.push(TranscriptEntry {
                    speaker,
                    text: trimmed.to_string(),
                    at: now,
                });
            }
        }

        self.state = TurnState::Idle;
        &self.history[before..]
    }

    /// Drop everything, history included.
    pub fn reset(&mut self) {
        self.user.clear();
        self.model.clear();
        self.history.clear();
        self.state = TurnState::Idle;
    }

    #[must_use]
    pub const fn state(&self) -> TurnState {
        self.state
    }

    /// Live, untrimmed user text for the open turn.
    #[must_use]
    pub fn partial_user(&self) -> &str {
        &self.user
    }

    /// Live, untrimmed model text for the open turn.
    #[must_use]
    pub fn partial_model(&self) -> &str {
        &self.model
    }

    #[must_use]
    pub fn history(&self) -> &[TranscriptEntry] {
        &self.history
    }
}

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{BotId, SessionKey};
use crate::record::Record;

/// Lifecycle of one conversation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Debouncing,
    Processing,
    Waiting,
    Closed,
}

impl SessionState {
    /// Live sessions keep their channel awake.
    pub fn is_live(self) -> bool {
        !matches!(self, Self::Closed)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Debouncing => write!(f, "debouncing"),
            Self::Processing => write!(f, "processing"),
            Self::Waiting => write!(f, "waiting"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

impl std::str::FromStr for SessionState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debouncing" => Ok(Self::Debouncing),
            "processing" => Ok(Self::Processing),
            "waiting" => Ok(Self::Waiting),
            "closed" => Ok(Self::Closed),
            other => Err(format!("unknown session state: {other}")),
        }
    }
}

/// One exchange remembered for the conversation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryTurn {
    pub user: String,
    pub reply: String,
    pub at: DateTime<Utc>,
}

/// State of one (channel, chat) conversation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionEntry {
    pub key: SessionKey,
    pub bot_id: Option<BotId>,
    pub state: SessionState,
    /// Inbound messages merged into the current burst.
    pub focus_score: u32,
    pub chat_open: bool,
    pub last_seen: DateTime<Utc>,
    pub last_reply_time: Option<DateTime<Utc>>,
    pub language: Option<String>,
    #[serde(default)]
    pub memory: Vec<MemoryTurn>,
    #[serde(default)]
    pub files: Vec<PathBuf>,
    pub expire_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl SessionEntry {
    pub fn new(key: SessionKey, now: DateTime<Utc>) -> Self {
        Self {
            key,
            bot_id: None,
            state: SessionState::Debouncing,
            focus_score: 0,
            chat_open: true,
            last_seen: now,
            last_reply_time: None,
            language: None,
            memory: Vec::new(),
            files: Vec::new(),
            expire_at: now,
            created_at: now,
        }
    }
}

/// Mutations of a stored session, one variant per mutable field.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionUpdate {
    State(SessionState),
    FocusScore(u32),
    IncrementFocus,
    ChatOpen(bool),
    LastSeen(DateTime<Utc>),
    LastReplyTime(DateTime<Utc>),
    Language(String),
    BotId(BotId),
    /// Append a turn, dropping the oldest beyond `max_turns`.
    AppendMemory { turn: MemoryTurn, max_turns: usize },
    AddFile(PathBuf),
    ClearFiles,
    /// A new inbound message: back to debouncing, one more message in the
    /// burst, chat open. Ignored by a closed entry.
    Touch { at: DateTime<Utc> },
}

impl Record for SessionEntry {
    type Update = SessionUpdate;
    const KIND: &'static str = "session";

    fn apply(&mut self, update: &SessionUpdate) {
        match update {
            SessionUpdate::State(state) => self.state = *state,
            SessionUpdate::FocusScore(score) => self.focus_score = *score,
            SessionUpdate::IncrementFocus => {
                self.focus_score = self.focus_score.saturating_add(1);
            }
            SessionUpdate::ChatOpen(open) => self.chat_open = *open,
            SessionUpdate::LastSeen(at) => self.last_seen = *at,
            SessionUpdate::LastReplyTime(at) => self.last_reply_time = Some(*at),
            SessionUpdate::Language(lang) => self.language = Some(lang.clone()),
            SessionUpdate::BotId(bot) => self.bot_id = Some(bot.clone()),
            SessionUpdate::AppendMemory { turn, max_turns } => {
                self.memory.push(turn.clone());
                if self.memory.len() > *max_turns {
                    let excess = self.memory.len() - max_turns;
                    self.memory.drain(..excess);
                }
            }
            SessionUpdate::AddFile(path) => {
                if !self.files.contains(path) {
                    self.files.push(path.clone());
                }
            }
            SessionUpdate::ClearFiles => self.files.clear(),
            SessionUpdate::Touch { at } => {
                if self.state.is_live() {
                    self.state = SessionState::Debouncing;
                    self.last_seen = *at;
                    self.focus_score = self.focus_score.saturating_add(1);
                    self.chat_open = true;
                }
            }
        }
    }

    fn set_expire_at(&mut self, at: DateTime<Utc>) {
        self.expire_at = at;
    }
}

//! Entities persisted by the store.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, Type, ValueRef};
use serde::{Deserialize, Serialize};

/// Chat mode every new user starts in.
pub const DEFAULT_CHAT_MODE: &str = "assistant";

/// Well-known keys of the user document.
pub mod keys {
    pub const CHAT_ID: &str = "chat_id";
    pub const USERNAME: &str = "username";
    pub const FIRST_NAME: &str = "first_name";
    pub const LAST_NAME: &str = "last_name";
    pub const FIRST_SEEN: &str = "first_seen";
    pub const LAST_INTERACTION: &str = "last_interaction";
    pub const CURRENT_DIALOG_ID: &str = "current_dialog_id";
    pub const CURRENT_CHAT_MODE: &str = "current_chat_mode";
    pub const CURRENT_MODEL: &str = "current_model";
    pub const N_USED_TOKENS: &str = "n_used_tokens";
    pub const N_GENERATED_IMAGES: &str = "n_generated_images";
    pub const N_TRANSCRIBED_SECONDS: &str = "n_transcribed_seconds";
}

/// Running token totals for one model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub n_input_tokens: u64,
    pub n_output_tokens: u64,
}

/// A bot user, stored as one JSON document keyed by Telegram user id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    #[serde(skip)]
    pub id: i64,
    pub chat_id: i64,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    pub first_seen: DateTime<Utc>,
    pub last_interaction: DateTime<Utc>,
    pub current_dialog_id: Option<String>,
    pub current_chat_mode: String,
    pub current_model: String,
    #[serde(default)]
    pub n_used_tokens: HashMap<String, TokenUsage>,
    #[serde(default)]
    pub n_generated_images: u64,
    #[serde(default)]
    pub n_transcribed_seconds: f64,
}

impl User {
    /// A fresh user with zeroed counters.
    pub fn new(id: i64, chat_id: i64, default_model: &str) -> Self {
        let now = Utc::now();
        Self {
            id,
            chat_id,
            username: String::new(),
            first_name: String::new(),
            last_name: String::new(),
            first_seen: now,
            last_interaction: now,
            current_dialog_id: None,
            current_chat_mode: DEFAULT_CHAT_MODE.to_string(),
            current_model: default_model.to_string(),
            n_used_tokens: HashMap::new(),
            n_generated_images: 0,
            n_transcribed_seconds: 0.0,
        }
    }
}

/// One exchange inside a dialog: what the user said and what the bot answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialogMessage {
    pub user: String,
    pub bot: String,
    pub date: DateTime<Utc>,
}

impl DialogMessage {
    pub fn new(user: impl Into<String>, bot: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            bot: bot.into(),
            date: Utc::now(),
        }
    }
}

/// A conversation thread owned by one user.
#[derive(Debug, Clone, PartialEq)]
pub struct Dialog {
    pub id: String,
    pub user_id: i64,
    pub chat_mode: String,
    pub model: String,
    pub start_time: DateTime<Utc>,
    pub messages: Vec<DialogMessage>,
}

/// Lifecycle of a journal entry. Only `Active -> Archived` is allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Active,
    Archived,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Active => "active",
            EntryStatus::Archived => "archived",
        }
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(EntryStatus::Active),
            "archived" => Ok(EntryStatus::Archived),
            other => Err(format!("unknown entry status '{other}'")),
        }
    }
}

impl FromSql for EntryStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value.as_str()?.parse().map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

/// A user-authored note.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
    pub id: String,
    pub user_id: i64,
    pub timestamp: DateTime<Utc>,
    pub category: String,
    pub content: String,
    pub status: EntryStatus,
}

/// Fixed-width UTC timestamp so that text comparison in SQL matches time order.
pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp read from column `idx`.
pub(crate) fn parse_timestamp(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

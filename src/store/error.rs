use std::fmt;

use crate::store::models::EntryStatus;

/// Errors returned by [`crate::store::Store`].
#[derive(Debug)]
pub enum StoreError {
    /// No user document with this id.
    UserNotFound(i64),
    /// The dialog does not exist or belongs to someone else.
    DialogNotFound { user_id: i64, dialog_id: String },
    /// The user has never started a dialog.
    NoCurrentDialog(i64),
    /// The key is not set on the user document.
    MissingAttribute { user_id: i64, key: String },
    /// Key or model name that cannot be used as a document path.
    InvalidKey(String),
    /// Archived entries cannot be reactivated.
    InvalidTransition { entry_id: String, from: EntryStatus, to: EntryStatus },
    /// The counter would exceed what the document can hold. Nothing was written.
    CounterOverflow { user_id: i64, key: String },
    Io(std::io::Error),
    Sqlite(rusqlite::Error),
    Json(serde_json::Error),
}

impl StoreError {
    /// True for the not-found family (user, dialog, current dialog).
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::UserNotFound(_) | Self::DialogNotFound { .. } | Self::NoCurrentDialog(_)
        )
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UserNotFound(id) => write!(f, "user {id} does not exist"),
            Self::DialogNotFound { user_id, dialog_id } => {
                write!(f, "dialog {dialog_id} not found for user {user_id}")
            }
            Self::NoCurrentDialog(id) => write!(f, "user {id} has no current dialog"),
            Self::MissingAttribute { user_id, key } => {
                write!(f, "user {user_id} has no attribute '{key}'")
            }
            Self::InvalidKey(key) => write!(f, "invalid document key '{key}'"),
            Self::InvalidTransition { entry_id, from, to } => {
                write!(f, "journal entry {entry_id} cannot go from {from} to {to}")
            }
            Self::CounterOverflow { user_id, key } => {
                write!(f, "counter '{key}' of user {user_id} would overflow")
            }
            Self::Io(e) => write!(f, "storage directory error: {e}"),
            Self::Sqlite(e) => write!(f, "database error: {e}"),
            Self::Json(e) => write!(f, "document encoding error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Sqlite(e) => Some(e),
            Self::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Sqlite(e)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

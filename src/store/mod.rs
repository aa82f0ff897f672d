//! Persistent SQLite store for users, dialogs and journal entries.
//!
//! Users are JSON documents addressed by key, so callers can read and write
//! single attributes without a schema change. Dialogs and journal entries are
//! plain rows. Every operation that names a user fails with
//! [`StoreError::UserNotFound`] instead of creating one.

mod error;
pub mod models;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension, ToSql, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info};

pub use error::StoreError;
pub use models::{Dialog, DialogMessage, EntryStatus, JournalEntry, TokenUsage, User, keys};

use models::{format_timestamp, parse_timestamp};

pub type Result<T> = std::result::Result<T, StoreError>;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY,
    doc TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS dialogs (
    id TEXT PRIMARY KEY,
    user_id INTEGER NOT NULL,
    chat_mode TEXT NOT NULL,
    model TEXT NOT NULL,
    start_time TEXT NOT NULL,
    messages TEXT NOT NULL DEFAULT '[]'
);

CREATE TABLE IF NOT EXISTS journal_entries (
    id TEXT PRIMARY KEY,
    user_id INTEGER NOT NULL,
    timestamp TEXT NOT NULL,
    category TEXT NOT NULL,
    content TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active'
);

CREATE INDEX IF NOT EXISTS idx_dialogs_user_id ON dialogs(user_id);
CREATE INDEX IF NOT EXISTS idx_journal_user_timestamp ON journal_entries(user_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_journal_category ON journal_entries(user_id, category);
"#;

/// Persistent store shared by all handlers.
pub struct Store {
    conn: Mutex<Connection>,
    /// Model assigned to newly registered users.
    default_model: String,
}

impl Store {
    /// Open (or create) a database file.
    pub fn open(path: &Path, default_model: impl Into<String>) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 5000;
        ",
        )?;
        let store = Self::init(conn, default_model.into())?;

        let (users, dialogs, entries) = store.counts()?;
        info!(
            "Opened store at {:?} ({} users, {} dialogs, {} journal entries)",
            path, users, dialogs, entries
        );
        Ok(store)
    }

    /// Create an in-memory database.
    pub fn in_memory(default_model: impl Into<String>) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, default_model.into())
    }

    fn init(conn: Connection, default_model: String) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            default_model,
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic mid-statement leaves SQLite consistent, so a poisoned lock is still usable.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn counts(&self) -> Result<(usize, usize, usize)> {
        let conn = self.conn();
        let count = |table: &str| -> Result<usize> {
            let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
            Ok(n as usize)
        };
        Ok((count("users")?, count("dialogs")?, count("journal_entries")?))
    }

    // ==================== USER METHODS ====================

    pub fn user_exists(&self, user_id: i64) -> Result<bool> {
        let conn = self.conn();
        user_exists(&conn, user_id)
    }

    /// Register a user with default settings. Existing users are left untouched.
    ///
    /// Returns `true` if a new document was written.
    pub fn ensure_user(
        &self,
        user_id: i64,
        chat_id: i64,
        username: Option<&str>,
        first_name: Option<&str>,
        last_name: Option<&str>,
    ) -> Result<bool> {
        let mut user = User::new(user_id, chat_id, &self.default_model);
        user.username = username.unwrap_or_default().to_string();
        user.first_name = first_name.unwrap_or_default().to_string();
        user.last_name = last_name.unwrap_or_default().to_string();
        let doc = serde_json::to_string(&user)?;

        let conn = self.conn();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO users (id, doc) VALUES (?1, ?2)",
            params![user_id, doc],
        )?;

        if inserted > 0 {
            info!("👤 New user {} ({})", user_id, user.username);
        }
        Ok(inserted > 0)
    }

    /// Typed view of the whole user document.
    pub fn get_user(&self, user_id: i64) -> Result<User> {
        let conn = self.conn();
        let doc = read_user_doc(&conn, user_id)?;
        let mut user: User = serde_json::from_value(doc)?;
        user.id = user_id;
        Ok(user)
    }

    /// Read one attribute of the user document.
    ///
    /// A key stored as JSON `null` returns `Value::Null`; a key that was never
    /// set is [`StoreError::MissingAttribute`].
    pub fn get_user_attribute(&self, user_id: i64, key: &str) -> Result<Value> {
        let conn = self.conn();
        get_attribute(&conn, user_id, key)
    }

    /// Read one attribute and deserialize it.
    pub fn get_user_attribute_as<T: DeserializeOwned>(&self, user_id: i64, key: &str) -> Result<T> {
        let value = self.get_user_attribute(user_id, key)?;
        Ok(serde_json::from_value(value)?)
    }

    /// Overwrite one attribute of the user document.
    pub fn set_user_attribute<V: Serialize + ?Sized>(&self, user_id: i64, key: &str, value: &V) -> Result<()> {
        let path = attribute_path(key)?;
        let json = serde_json::to_string(value)?;

        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE users SET doc = json_set(doc, ?2, json(?3)) WHERE id = ?1",
            params![user_id, path, json],
        )?;
        if updated == 0 {
            return Err(StoreError::UserNotFound(user_id));
        }
        debug!("Set {} for user {}", key, user_id);
        Ok(())
    }

    /// Record that the user just interacted with the bot.
    pub fn touch_user(&self, user_id: i64) -> Result<()> {
        self.set_user_attribute(user_id, keys::LAST_INTERACTION, &Utc::now())
    }

    /// Add to the per-model token totals in a single statement.
    pub fn record_token_usage(
        &self,
        user_id: i64,
        model: &str,
        n_input_tokens: u64,
        n_output_tokens: u64,
    ) -> Result<()> {
        let path = model_usage_path(model)?;
        let n_input = counter_amount(user_id, keys::N_USED_TOKENS, n_input_tokens)?;
        let n_output = counter_amount(user_id, keys::N_USED_TOKENS, n_output_tokens)?;

        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE users SET doc = json_set(
                doc,
                '$.n_used_tokens', json(coalesce(json_extract(doc, '$.n_used_tokens'), '{}')),
                ?2, json_object(
                    'n_input_tokens', coalesce(json_extract(doc, ?2 || '.n_input_tokens'), 0) + ?3,
                    'n_output_tokens', coalesce(json_extract(doc, ?2 || '.n_output_tokens'), 0) + ?4
                )
             ) WHERE id = ?1
               AND coalesce(json_extract(doc, ?2 || '.n_input_tokens'), 0) <= ?5 - ?3
               AND coalesce(json_extract(doc, ?2 || '.n_output_tokens'), 0) <= ?5 - ?4",
            params![user_id, path, n_input, n_output, i64::MAX],
        )?;
        if updated == 0 {
            return Err(rejected_update(&conn, user_id, keys::N_USED_TOKENS));
        }
        debug!(
            "Recorded {}+{} tokens on {} for user {}",
            n_input_tokens, n_output_tokens, model, user_id
        );
        Ok(())
    }

    pub fn add_generated_images(&self, user_id: i64, n: u64) -> Result<()> {
        let n = counter_amount(user_id, keys::N_GENERATED_IMAGES, n)?;
        self.increment(user_id, keys::N_GENERATED_IMAGES, &n)
    }

    pub fn add_transcribed_seconds(&self, user_id: i64, seconds: f64) -> Result<()> {
        self.increment(user_id, keys::N_TRANSCRIBED_SECONDS, &seconds)
    }

    fn increment(&self, user_id: i64, key: &str, amount: &dyn ToSql) -> Result<()> {
        let path = attribute_path(key)?;
        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE users SET doc = json_set(doc, ?2, coalesce(json_extract(doc, ?2), 0) + ?3)
             WHERE id = ?1 AND coalesce(json_extract(doc, ?2), 0) <= ?4 - ?3",
            params![user_id, path, amount, i64::MAX],
        )?;
        if updated == 0 {
            return Err(rejected_update(&conn, user_id, key));
        }
        Ok(())
    }

    // ==================== DIALOG METHODS ====================

    /// Start a dialog with the user's current chat mode and model, and make it current.
    pub fn start_new_dialog(&self, user_id: i64) -> Result<String> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let doc = read_user_doc(&tx, user_id)?;
        let chat_mode = doc[keys::CURRENT_CHAT_MODE]
            .as_str()
            .unwrap_or(models::DEFAULT_CHAT_MODE)
            .to_string();
        let model = doc[keys::CURRENT_MODEL]
            .as_str()
            .unwrap_or(&self.default_model)
            .to_string();

        let dialog_id = uuid::Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO dialogs (id, user_id, chat_mode, model, start_time, messages)
             VALUES (?1, ?2, ?3, ?4, ?5, '[]')",
            params![dialog_id, user_id, chat_mode, model, format_timestamp(&Utc::now())],
        )?;
        tx.execute(
            "UPDATE users SET doc = json_set(doc, '$.current_dialog_id', ?2) WHERE id = ?1",
            params![user_id, dialog_id],
        )?;
        tx.commit()?;

        info!("💬 New {} dialog {} for user {} ({})", chat_mode, dialog_id, user_id, model);
        Ok(dialog_id)
    }

    /// Fetch a dialog owned by the user. `None` means the current dialog.
    pub fn get_dialog(&self, user_id: i64, dialog_id: Option<&str>) -> Result<Dialog> {
        let conn = self.conn();
        let dialog_id = resolve_dialog_id(&conn, user_id, dialog_id)?;

        conn.query_row(
            "SELECT id, user_id, chat_mode, model, start_time, messages
             FROM dialogs WHERE id = ?1 AND user_id = ?2",
            params![dialog_id, user_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    parse_timestamp(4, &row.get::<_, String>(4)?)?,
                    row.get::<_, String>(5)?,
                ))
            },
        )
        .optional()?
        .ok_or_else(|| StoreError::DialogNotFound { user_id, dialog_id: dialog_id.clone() })
        .and_then(|(id, user_id, chat_mode, model, start_time, messages)| {
            Ok(Dialog {
                id,
                user_id,
                chat_mode,
                model,
                start_time,
                messages: serde_json::from_str(&messages)?,
            })
        })
    }

    /// Messages of a dialog owned by the user. `None` means the current dialog.
    pub fn get_dialog_messages(&self, user_id: i64, dialog_id: Option<&str>) -> Result<Vec<DialogMessage>> {
        let conn = self.conn();
        let dialog_id = resolve_dialog_id(&conn, user_id, dialog_id)?;

        let messages: Option<String> = conn
            .query_row(
                "SELECT messages FROM dialogs WHERE id = ?1 AND user_id = ?2",
                params![dialog_id, user_id],
                |row| row.get(0),
            )
            .optional()?;

        match messages {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Err(StoreError::DialogNotFound { user_id, dialog_id }),
        }
    }

    /// Replace the whole message list of a dialog owned by the user.
    pub fn set_dialog_messages(
        &self,
        user_id: i64,
        messages: &[DialogMessage],
        dialog_id: Option<&str>,
    ) -> Result<()> {
        let json = serde_json::to_string(messages)?;
        let conn = self.conn();
        let dialog_id = resolve_dialog_id(&conn, user_id, dialog_id)?;

        let updated = conn.execute(
            "UPDATE dialogs SET messages = ?3 WHERE id = ?1 AND user_id = ?2",
            params![dialog_id, user_id, json],
        )?;
        if updated == 0 {
            return Err(StoreError::DialogNotFound { user_id, dialog_id });
        }
        debug!("Stored {} messages in dialog {}", messages.len(), dialog_id);
        Ok(())
    }

    // ==================== JOURNAL METHODS ====================

    /// Add a journal entry stamped with the current time.
    pub fn add_journal_entry(
        &self,
        user_id: i64,
        category: &str,
        content: &str,
        status: EntryStatus,
    ) -> Result<String> {
        self.add_journal_entry_at(user_id, category, content, status, Utc::now())
    }

    /// Add a journal entry with an explicit timestamp.
    pub fn add_journal_entry_at(
        &self,
        user_id: i64,
        category: &str,
        content: &str,
        status: EntryStatus,
        timestamp: DateTime<Utc>,
    ) -> Result<String> {
        let conn = self.conn();
        if !user_exists(&conn, user_id)? {
            return Err(StoreError::UserNotFound(user_id));
        }

        let entry_id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO journal_entries (id, user_id, timestamp, category, content, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![entry_id, user_id, format_timestamp(&timestamp), category, content, status.as_str()],
        )?;

        info!("📓 Journal entry {} ({}) for user {}", entry_id, category, user_id);
        Ok(entry_id)
    }

    /// Entries of a user matching every given filter, oldest first.
    pub fn get_journal_entries(
        &self,
        user_id: i64,
        category: Option<&str>,
        status: Option<EntryStatus>,
    ) -> Result<Vec<JournalEntry>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, timestamp, category, content, status FROM journal_entries
             WHERE user_id = ?1
               AND (?2 IS NULL OR category = ?2)
               AND (?3 IS NULL OR status = ?3)
             ORDER BY timestamp ASC",
        )?;

        let rows = stmt.query_map(params![user_id, category, status.map(|s| s.as_str())], |row| {
            Ok(JournalEntry {
                id: row.get(0)?,
                user_id: row.get(1)?,
                timestamp: parse_timestamp(2, &row.get::<_, String>(2)?)?,
                category: row.get(3)?,
                content: row.get(4)?,
                status: row.get(5)?,
            })
        })?;

        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Change the status of one entry.
    ///
    /// Returns `false` when no entry has this id. Moving an archived entry back
    /// to active is rejected.
    pub fn update_journal_entry_status(&self, entry_id: &str, new_status: EntryStatus) -> Result<bool> {
        let conn = self.conn();
        let current: Option<EntryStatus> = conn
            .query_row(
                "SELECT status FROM journal_entries WHERE id = ?1",
                params![entry_id],
                |row| row.get(0),
            )
            .optional()?;

        let Some(current) = current else {
            debug!("Journal entry {} not found, status unchanged", entry_id);
            return Ok(false);
        };
        if current == EntryStatus::Archived && new_status == EntryStatus::Active {
            return Err(StoreError::InvalidTransition {
                entry_id: entry_id.to_string(),
                from: current,
                to: new_status,
            });
        }

        conn.execute(
            "UPDATE journal_entries SET status = ?2 WHERE id = ?1",
            params![entry_id, new_status.as_str()],
        )?;
        Ok(true)
    }

    /// Archive every entry of the user older than `days_old` days.
    ///
    /// Returns how many entries changed status, so a repeated call returns 0.
    pub fn archive_old_entries(&self, user_id: i64, days_old: i64) -> Result<usize> {
        let Some(threshold) = Duration::try_days(days_old).and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            debug!("No entry can be older than {} days", days_old);
            return Ok(0);
        };
        let conn = self.conn();
        let archived = conn.execute(
            "UPDATE journal_entries SET status = 'archived'
             WHERE user_id = ?1 AND timestamp < ?2 AND status != 'archived'",
            params![user_id, format_timestamp(&threshold)],
        )?;

        if archived > 0 {
            info!("🗄️ Archived {} journal entries older than {} days for user {}", archived, days_old, user_id);
        }
        Ok(archived)
    }
}

fn user_exists(conn: &Connection, user_id: i64) -> Result<bool> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM users WHERE id = ?1)",
        params![user_id],
        |row| row.get(0),
    )?;
    Ok(exists)
}

fn counter_amount(user_id: i64, key: &str, amount: u64) -> Result<i64> {
    i64::try_from(amount).map_err(|_| StoreError::CounterOverflow { user_id, key: key.to_string() })
}

/// Error for a guarded counter UPDATE that touched no row.
fn rejected_update(conn: &Connection, user_id: i64, key: &str) -> StoreError {
    match user_exists(conn, user_id) {
        Ok(true) => StoreError::CounterOverflow { user_id, key: key.to_string() },
        Ok(false) => StoreError::UserNotFound(user_id),
        Err(e) => e,
    }
}

fn read_user_doc(conn: &Connection, user_id: i64) -> Result<Value> {
    let doc: Option<String> = conn
        .query_row("SELECT doc FROM users WHERE id = ?1", params![user_id], |row| row.get(0))
        .optional()?;
    match doc {
        Some(doc) => Ok(serde_json::from_str(&doc)?),
        None => Err(StoreError::UserNotFound(user_id)),
    }
}

fn get_attribute(conn: &Connection, user_id: i64, key: &str) -> Result<Value> {
    attribute_path(key)?;
    let mut doc = read_user_doc(conn, user_id)?;
    doc.get_mut(key)
        .map(Value::take)
        .ok_or_else(|| StoreError::MissingAttribute { user_id, key: key.to_string() })
}

fn resolve_dialog_id(conn: &Connection, user_id: i64, dialog_id: Option<&str>) -> Result<String> {
    if let Some(id) = dialog_id {
        if !user_exists(conn, user_id)? {
            return Err(StoreError::UserNotFound(user_id));
        }
        return Ok(id.to_string());
    }

    match get_attribute(conn, user_id, keys::CURRENT_DIALOG_ID) {
        Ok(Value::String(id)) => Ok(id),
        Ok(_) | Err(StoreError::MissingAttribute { .. }) => Err(StoreError::NoCurrentDialog(user_id)),
        Err(e) => Err(e),
    }
}

/// `$.key` for a top-level document key.
fn attribute_path(key: &str) -> Result<String> {
    let valid = !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(format!("$.{key}"))
}

/// `$.n_used_tokens."model"`. Model names may contain dots and dashes, so the label is quoted.
fn model_usage_path(model: &str) -> Result<String> {
    if model.is_empty() || model.contains(['"', '\\']) {
        return Err(StoreError::InvalidKey(model.to_string()));
    }
    Ok(format!("$.{}.\"{model}\"", keys::N_USED_TOKENS))
}

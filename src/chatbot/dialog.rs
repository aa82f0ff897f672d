//! Which dialog an incoming message continues.

use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::store::{DialogMessage, Store, StoreError};

/// Make sure the user has a current dialog before a message is answered.
///
/// A dialog is started when the user has none or the current one is gone. A
/// non-empty dialog idle for longer than `new_dialog_timeout_secs` is replaced;
/// a timeout of 0 never expires. Returns the mode name when an idle dialog was
/// replaced, so the user can be told.
pub fn ensure_current_dialog(
    store: &Store,
    config: &Config,
    user_id: i64,
    now: DateTime<Utc>,
) -> Result<Option<String>, StoreError> {
    let user = store.get_user(user_id)?;
    if user.current_dialog_id.is_none() {
        store.start_new_dialog(user_id)?;
        return Ok(None);
    }

    let messages = match store.get_dialog_messages(user_id, None) {
        Ok(messages) => messages,
        Err(e) if e.is_not_found() => {
            store.start_new_dialog(user_id)?;
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    let timeout = i64::try_from(config.new_dialog_timeout_secs).unwrap_or(i64::MAX);
    let idle = (now - user.last_interaction).num_seconds();
    if timeout > 0 && idle > timeout && !messages.is_empty() {
        store.start_new_dialog(user_id)?;
        return Ok(Some(config.chat_mode(&user.current_chat_mode).name.clone()));
    }
    Ok(None)
}

/// Remove the last exchange of the current dialog and return it.
pub fn take_last_exchange(store: &Store, user_id: i64) -> Result<Option<DialogMessage>, StoreError> {
    let mut messages = match store.get_dialog_messages(user_id, None) {
        Ok(messages) => messages,
        Err(StoreError::NoCurrentDialog(_)) => return Ok(None),
        Err(e) => return Err(e),
    };
    let Some(last) = messages.pop() else {
        return Ok(None);
    };
    store.set_dialog_messages(user_id, &messages, None)?;
    Ok(Some(last))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::keys;
    use chrono::Duration;
    use std::io::Write;

    fn test_config() -> Config {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"telegram_bot_token": "1:abc", "openai_api_key": "sk"}}"#).unwrap();
        Config::load(file.path()).unwrap()
    }

    fn store_with_user() -> Store {
        let store = Store::in_memory("gpt-4o-mini").unwrap();
        store.ensure_user(1, 1, Some("alice"), None, None).unwrap();
        store
    }

    fn idle_for(store: &Store, now: DateTime<Utc>, idle: Duration) {
        store.set_user_attribute(1, keys::LAST_INTERACTION, &(now - idle)).unwrap();
    }

    fn current_dialog(store: &Store) -> Option<String> {
        store.get_user(1).unwrap().current_dialog_id
    }

    #[test]
    fn test_starts_dialog_when_none() {
        let store = store_with_user();
        let config = test_config();

        assert_eq!(ensure_current_dialog(&store, &config, 1, Utc::now()).unwrap(), None);
        let dialog_id = current_dialog(&store).expect("dialog started");
        assert!(store.get_dialog_messages(1, Some(&dialog_id)).unwrap().is_empty());
    }

    #[test]
    fn test_replaces_vanished_dialog() {
        let store = store_with_user();
        let config = test_config();
        store.set_user_attribute(1, keys::CURRENT_DIALOG_ID, "gone").unwrap();

        assert_eq!(ensure_current_dialog(&store, &config, 1, Utc::now()).unwrap(), None);
        let dialog_id = current_dialog(&store).unwrap();
        assert_ne!(dialog_id, "gone");
        assert!(store.get_dialog(1, None).is_ok());
    }

    #[test]
    fn test_timed_out_dialog_is_replaced() {
        let store = store_with_user();
        let config = test_config();
        let now = Utc::now();
        let old_id = store.start_new_dialog(1).unwrap();
        store.set_dialog_messages(1, &[DialogMessage::new("hi", "hello")], None).unwrap();
        idle_for(&store, now, Duration::seconds(config.new_dialog_timeout_secs as i64 + 1));

        let replaced = ensure_current_dialog(&store, &config, 1, now).unwrap();
        assert_eq!(replaced, Some(config.chat_mode("assistant").name.clone()));

        let new_id = current_dialog(&store).unwrap();
        assert_ne!(new_id, old_id);
        assert!(store.get_dialog_messages(1, None).unwrap().is_empty());
        assert_eq!(store.get_dialog_messages(1, Some(&old_id)).unwrap().len(), 1);
    }

    #[test]
    fn test_recent_dialog_is_kept() {
        let store = store_with_user();
        let config = test_config();
        let now = Utc::now();
        let dialog_id = store.start_new_dialog(1).unwrap();
        store.set_dialog_messages(1, &[DialogMessage::new("hi", "hello")], None).unwrap();
        idle_for(&store, now, Duration::seconds(10));

        assert_eq!(ensure_current_dialog(&store, &config, 1, now).unwrap(), None);
        assert_eq!(current_dialog(&store).unwrap(), dialog_id);
    }

    #[test]
    fn test_empty_dialog_is_kept_after_timeout() {
        let store = store_with_user();
        let config = test_config();
        let now = Utc::now();
        let dialog_id = store.start_new_dialog(1).unwrap();
        idle_for(&store, now, Duration::hours(5));

        assert_eq!(ensure_current_dialog(&store, &config, 1, now).unwrap(), None);
        assert_eq!(current_dialog(&store).unwrap(), dialog_id);
    }

    #[test]
    fn test_zero_timeout_never_expires() {
        let store = store_with_user();
        let mut config = test_config();
        config.new_dialog_timeout_secs = 0;
        let now = Utc::now();
        let dialog_id = store.start_new_dialog(1).unwrap();
        store.set_dialog_messages(1, &[DialogMessage::new("hi", "hello")], None).unwrap();
        idle_for(&store, now, Duration::days(30));

        assert_eq!(ensure_current_dialog(&store, &config, 1, now).unwrap(), None);
        assert_eq!(current_dialog(&store).unwrap(), dialog_id);
    }

    #[test]
    fn test_unknown_user() {
        let store = Store::in_memory("gpt-4o-mini").unwrap();
        let err = ensure_current_dialog(&store, &test_config(), 5, Utc::now()).unwrap_err();
        assert!(matches!(err, StoreError::UserNotFound(5)));
    }

    #[test]
    fn test_take_last_exchange() {
        let store = store_with_user();
        assert_eq!(take_last_exchange(&store, 1).unwrap(), None);

        store.start_new_dialog(1).unwrap();
        assert_eq!(take_last_exchange(&store, 1).unwrap(), None);

        let first = DialogMessage::new("one", "1");
        let second = DialogMessage::new("two", "2");
        store.set_dialog_messages(1, &[first.clone(), second.clone()], None).unwrap();

        assert_eq!(take_last_exchange(&store, 1).unwrap(), Some(second));
        assert_eq!(store.get_dialog_messages(1, None).unwrap(), vec![first.clone()]);
        assert_eq!(take_last_exchange(&store, 1).unwrap(), Some(first));
        assert!(store.get_dialog_messages(1, None).unwrap().is_empty());
    }
}

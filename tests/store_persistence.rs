//! The store keeps its state in a file across reopen.

use chrono::{Duration, Utc};
use journalgpt::store::{DialogMessage, EntryStatus, Store, StoreError, TokenUsage, keys};

#[test]
fn test_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("journalgpt.db");

    let (dialog_id, entry_id) = {
        let store = Store::open(&path, "gpt-4o-mini").unwrap();
        store.ensure_user(42, 4242, Some("alice"), Some("Alice"), None).unwrap();
        store.set_user_attribute(42, keys::CURRENT_CHAT_MODE, "code_assistant").unwrap();

        let dialog_id = store.start_new_dialog(42).unwrap();
        store
            .set_dialog_messages(42, &[DialogMessage::new("fn main?", "fn main() {}")], None)
            .unwrap();
        store.record_token_usage(42, "gpt-4o-mini", 120, 30).unwrap();

        let entry_id = store
            .add_journal_entry(42, "work", "wrote the store", EntryStatus::Active)
            .unwrap();
        (dialog_id, entry_id)
    };

    let store = Store::open(&path, "some-other-default").unwrap();
    let user = store.get_user(42).unwrap();
    assert_eq!(user.current_model, "gpt-4o-mini");
    assert_eq!(user.current_chat_mode, "code_assistant");
    assert_eq!(user.current_dialog_id.as_deref(), Some(dialog_id.as_str()));
    assert_eq!(
        user.n_used_tokens["gpt-4o-mini"],
        TokenUsage { n_input_tokens: 120, n_output_tokens: 30 }
    );

    let dialog = store.get_dialog(42, None).unwrap();
    assert_eq!(dialog.chat_mode, "code_assistant");
    assert_eq!(dialog.messages.len(), 1);
    assert_eq!(dialog.messages[0].bot, "fn main() {}");

    let entries = store.get_journal_entries(42, Some("work"), None).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id, entry_id);

    // A new user registered after reopen gets the new default model
    store.ensure_user(7, 7, None, None, None).unwrap();
    assert_eq!(store.get_user(7).unwrap().current_model, "some-other-default");
}

#[test]
fn test_journal_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(&dir.path().join("journal.db"), "gpt-4o-mini").unwrap();
    store.ensure_user(1, 1, None, None, None).unwrap();

    let now = Utc::now();
    let stale = store
        .add_journal_entry_at(1, "health", "ran 5k", EntryStatus::Active, now - Duration::days(60))
        .unwrap();
    let fresh = store.add_journal_entry(1, "health", "ran 10k", EntryStatus::Active).unwrap();

    assert_eq!(store.archive_old_entries(1, 30).unwrap(), 1);
    assert_eq!(store.archive_old_entries(1, 30).unwrap(), 0);

    let active = store.get_journal_entries(1, None, Some(EntryStatus::Active)).unwrap();
    assert_eq!(active.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(), vec![fresh.as_str()]);

    let err = store.update_journal_entry_status(&stale, EntryStatus::Active).unwrap_err();
    assert!(matches!(err, StoreError::InvalidTransition { .. }));

    assert!(store.update_journal_entry_status(&fresh, EntryStatus::Archived).unwrap());
    assert!(store.get_journal_entries(1, None, Some(EntryStatus::Active)).unwrap().is_empty());
}

//! Update handlers: maps Telegram commands, messages and button presses to
//! store operations and LLM calls.

use std::sync::Arc;

use chrono::Utc;
use teloxide::dispatching::{HandlerExt, UpdateHandler};
use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::{
    CallbackQuery, ChatAction, InlineKeyboardButton, InlineKeyboardMarkup, InputFile, MessageId, ParseMode,
    User as TgUser,
};
use tokio::sync::OwnedMutexGuard;
use tracing::{error, info};

use crate::chatbot::commands::{Callback, Command, optional_arg, parse_days, parse_journal_entry};
use crate::chatbot::dialog;
use crate::chatbot::error::BotError;
use crate::chatbot::format::{self, HELP_MESSAGE, MAX_MESSAGE_CHARS, html_escape, split_message};
use crate::chatbot::locks::UserLocks;
use crate::chatbot::whisper::Whisper;
use crate::config::{Config, ModeKind};
use crate::openai;
use crate::store::{DialogMessage, EntryStatus, Store, keys};

type HandlerResult = Result<(), BotError>;

/// Everything the handlers share. Built once in `main`.
pub struct BotState {
    pub config: Config,
    pub store: Store,
    pub openai: openai::Client,
    pub whisper: Option<Whisper>,
    pub locks: UserLocks,
    pub bot_id: UserId,
    pub bot_username: String,
}

pub fn schema() -> UpdateHandler<teloxide::RequestError> {
    dptree::entry()
        .branch(
            Update::filter_message()
                .filter_command::<Command>()
                .endpoint(handle_command),
        )
        .branch(Update::filter_message().endpoint(handle_message))
        .branch(Update::filter_callback_query().endpoint(handle_callback))
}

async fn handle_command(bot: Bot, msg: Message, cmd: Command, state: Arc<BotState>) -> ResponseResult<()> {
    let Some(user) = msg.from.clone() else {
        return Ok(());
    };
    if !check_access(&bot, msg.chat.id, &user, &state).await {
        return Ok(());
    }

    info!("⌨️ {:?} from {} ({})", cmd, display_name(&user), user.id);
    let result = run_command(&bot, msg.chat.id, &user, cmd, &state).await;
    report(&bot, msg.chat.id, result).await
}

async fn handle_message(bot: Bot, msg: Message, state: Arc<BotState>) -> ResponseResult<()> {
    let Some(user) = msg.from.clone() else {
        return Ok(());
    };
    if user.is_bot {
        return Ok(());
    }
    if msg.text().is_none() && msg.voice().is_none() {
        return Ok(());
    }

    let replies_to_bot = msg
        .reply_to_message()
        .and_then(|r| r.from.as_ref())
        .is_some_and(|u| u.id == state.bot_id);
    let in_private = msg.chat.is_private();
    if !in_private && !replies_to_bot && !msg.text().is_some_and(|t| mentions_bot(t, &state.bot_username)) {
        return Ok(());
    }

    if !check_access(&bot, msg.chat.id, &user, &state).await {
        return Ok(());
    }

    let result = if msg.voice().is_some() {
        handle_voice(&bot, &msg, &user, &state).await
    } else {
        let text = strip_mention(msg.text().unwrap_or_default(), &state.bot_username);
        handle_text(&bot, msg.chat.id, &user, &text, &state).await
    };
    report(&bot, msg.chat.id, result).await
}

async fn handle_callback(bot: Bot, q: CallbackQuery, state: Arc<BotState>) -> ResponseResult<()> {
    bot.answer_callback_query(q.id.clone()).await.ok();

    let Some(message) = q.message.as_ref() else {
        return Ok(());
    };
    let Some(callback) = q.data.as_deref().and_then(Callback::parse) else {
        return Ok(());
    };
    let chat_id = message.chat().id;
    if !state.config.is_allowed(q.from.username.as_deref()) {
        return Ok(());
    }

    let result = apply_callback(&bot, chat_id, message.id(), &q.from, callback, &state).await;
    report(&bot, chat_id, result).await
}

/// Log a failed handler and tell the user something went wrong.
async fn report(bot: &Bot, chat_id: ChatId, result: HandlerResult) -> ResponseResult<()> {
    if let Err(e) = result {
        error!("Handler failed in chat {}: {}", chat_id.0, e);
        bot.send_message(chat_id, "Something went wrong. Please try again later.")
            .await
            .ok();
    }
    Ok(())
}

async fn check_access(bot: &Bot, chat_id: ChatId, user: &TgUser, state: &BotState) -> bool {
    if state.config.is_allowed(user.username.as_deref()) {
        return true;
    }
    info!("Denied access to {} ({})", display_name(user), user.id);
    bot.send_message(chat_id, "You're not allowed to use this bot.")
        .await
        .ok();
    false
}

/// Make sure the Telegram user has a store document.
fn register(state: &BotState, chat_id: ChatId, user: &TgUser) -> Result<i64, BotError> {
    let user_id = user.id.0 as i64;
    state.store.ensure_user(
        user_id,
        chat_id.0,
        user.username.as_deref(),
        Some(&user.first_name),
        user.last_name.as_deref(),
    )?;
    Ok(user_id)
}

/// Lock the user for a long-running request, or tell them to wait.
async fn lock_or_refuse(
    bot: &Bot,
    chat_id: ChatId,
    user_id: i64,
    state: &BotState,
) -> Result<Option<OwnedMutexGuard<()>>, BotError> {
    match state.locks.try_acquire(user_id).await {
        Some(guard) => Ok(Some(guard)),
        None => {
            bot.send_message(chat_id, "⏳ Please wait for a reply to the previous message")
                .await?;
            Ok(None)
        }
    }
}

async fn run_command(bot: &Bot, chat_id: ChatId, user: &TgUser, cmd: Command, state: &BotState) -> HandlerResult {
    let user_id = register(state, chat_id, user)?;

    match cmd {
        Command::Start => {
            let _guard = state.locks.acquire(user_id).await;
            state.store.touch_user(user_id)?;
            state.store.start_new_dialog(user_id)?;
            let text = format!("Hi! I'm a bot that talks to an AI model and keeps your journal 🤖\n\n{HELP_MESSAGE}");
            send_html(bot, chat_id, &text).await?;
            send_chat_modes(bot, chat_id, state).await
        }
        Command::Help => {
            state.store.touch_user(user_id)?;
            send_html(bot, chat_id, HELP_MESSAGE).await
        }
        Command::HelpGroupChat => {
            state.store.touch_user(user_id)?;
            send_html(bot, chat_id, &format::help_group_chat(&state.bot_username)).await
        }
        Command::Retry => {
            let Some(_guard) = lock_or_refuse(bot, chat_id, user_id, state).await? else {
                return Ok(());
            };
            retry(bot, chat_id, user_id, state).await
        }
        Command::New => {
            let _guard = state.locks.acquire(user_id).await;
            state.store.touch_user(user_id)?;
            state.store.start_new_dialog(user_id)?;
            bot.send_message(chat_id, "Starting new dialog ✅").await?;

            let mode: String = state.store.get_user_attribute_as(user_id, keys::CURRENT_CHAT_MODE)?;
            send_html(bot, chat_id, &state.config.chat_mode(&mode).welcome_message).await
        }
        Command::Mode => {
            state.store.touch_user(user_id)?;
            send_chat_modes(bot, chat_id, state).await
        }
        Command::Settings => {
            state.store.touch_user(user_id)?;
            let current: String = state.store.get_user_attribute_as(user_id, keys::CURRENT_MODEL)?;
            bot.send_message(chat_id, "🤖 Select model:")
                .reply_markup(model_keyboard(&state.config, &current))
                .await?;
            Ok(())
        }
        Command::Balance => {
            state.store.touch_user(user_id)?;
            let user = state.store.get_user(user_id)?;
            send_html(bot, chat_id, &format::balance(&user, &state.config)).await
        }
        Command::AddJournalEntry(args) => {
            state.store.touch_user(user_id)?;
            let Some((category, content)) = parse_journal_entry(&args) else {
                return send_html(bot, chat_id, "Usage: /add_journal_entry &lt;category&gt; &lt;content&gt;").await;
            };
            let entry_id = state.store.add_journal_entry(user_id, category, content, EntryStatus::Active)?;
            send_html(bot, chat_id, &format!("Journal entry added successfully.\n<code>{entry_id}</code>")).await
        }
        Command::Journal(args) => {
            state.store.touch_user(user_id)?;
            let entries = state
                .store
                .get_journal_entries(user_id, optional_arg(&args), Some(EntryStatus::Active))?;
            for chunk in split_message(&format::journal(&entries), MAX_MESSAGE_CHARS) {
                send_html(bot, chat_id, &chunk).await?;
            }
            Ok(())
        }
        Command::ArchiveEntry(args) => {
            state.store.touch_user(user_id)?;
            let Some(entry_id) = optional_arg(&args) else {
                return send_html(bot, chat_id, "Usage: /archive_entry &lt;id&gt;").await;
            };
            let owned = state
                .store
                .get_journal_entries(user_id, None, None)?
                .iter()
                .any(|e| e.id == entry_id);
            let archived = owned && state.store.update_journal_entry_status(entry_id, EntryStatus::Archived)?;
            let reply = if archived { "Entry archived 🗄️" } else { "No journal entry with that id." };
            bot.send_message(chat_id, reply).await?;
            Ok(())
        }
        Command::ArchiveJournal(args) => {
            state.store.touch_user(user_id)?;
            let days = match parse_days(&args, state.config.journal_archive_days) {
                Ok(days) => days,
                Err(e) => {
                    let usage = format!("{}\nUsage: /archive_journal [days]", html_escape(&e));
                    return send_html(bot, chat_id, &usage).await;
                }
            };
            let archived = state.store.archive_old_entries(user_id, days)?;
            bot.send_message(chat_id, format!("Archived {archived} entries older than {days} days."))
                .await?;
            Ok(())
        }
    }
}

async fn handle_text(bot: &Bot, chat_id: ChatId, user: &TgUser, text: &str, state: &BotState) -> HandlerResult {
    let user_id = register(state, chat_id, user)?;

    if text.starts_with('/') {
        return send_html(bot, chat_id, HELP_MESSAGE).await;
    }
    if text.trim().is_empty() {
        return Ok(());
    }

    let Some(_guard) = lock_or_refuse(bot, chat_id, user_id, state).await? else {
        return Ok(());
    };
    info!("📨 Message from {} ({}): {} chars", display_name(user), user_id, text.chars().count());
    converse(bot, chat_id, user_id, text, state).await
}

async fn handle_voice(bot: &Bot, msg: &Message, user: &TgUser, state: &BotState) -> HandlerResult {
    let chat_id = msg.chat.id;
    let user_id = register(state, chat_id, user)?;
    let Some(voice) = msg.voice() else {
        return Ok(());
    };
    let Some(whisper) = state.whisper.clone() else {
        bot.send_message(chat_id, "🎤 Voice messages are not enabled on this bot.")
            .await?;
        return Ok(());
    };

    let Some(_guard) = lock_or_refuse(bot, chat_id, user_id, state).await? else {
        return Ok(());
    };
    info!("🎤 Voice from {} ({})", display_name(user), user_id);

    bot.send_chat_action(chat_id, ChatAction::Typing).await?;
    let file = bot.get_file(voice.file.id.clone()).await?;
    let mut data = Vec::new();
    bot.download_file(&file.path, &mut data).await?;

    let transcription = tokio::task::spawn_blocking(move || whisper.transcribe(&data))
        .await
        .map_err(|e| BotError::Transcription(e.to_string()))?
        .map_err(BotError::Transcription)?;
    state.store.add_transcribed_seconds(user_id, transcription.seconds)?;

    if transcription.text.is_empty() {
        bot.send_message(chat_id, "🎤 I couldn't hear anything in that voice message.")
            .await?;
        return Ok(());
    }

    send_html(bot, chat_id, &format!("🎤: <i>{}</i>", html_escape(&transcription.text))).await?;
    converse(bot, chat_id, user_id, &transcription.text, state).await
}

/// Continue the user's dialog with `text`. Caller holds the user lock.
async fn converse(bot: &Bot, chat_id: ChatId, user_id: i64, text: &str, state: &BotState) -> HandlerResult {
    if let Some(mode_name) = dialog::ensure_current_dialog(&state.store, &state.config, user_id, Utc::now())? {
        let notice = format!("Starting new dialog due to timeout (<b>{}</b> mode) ✅", html_escape(&mode_name));
        send_html(bot, chat_id, &notice).await?;
    }
    state.store.touch_user(user_id)?;
    answer(bot, chat_id, user_id, text, state).await
}

/// Produce the bot's answer in the user's current mode.
async fn answer(bot: &Bot, chat_id: ChatId, user_id: i64, text: &str, state: &BotState) -> HandlerResult {
    let user = state.store.get_user(user_id)?;
    let mode = state.config.chat_mode(&user.current_chat_mode);

    match mode.kind {
        ModeKind::Image => {
            bot.send_chat_action(chat_id, ChatAction::UploadPhoto).await?;
            let image = state
                .openai
                .generate_image(&state.config.image_model, &state.config.image_size, text)
                .await?;
            state.store.add_generated_images(user_id, 1)?;
            bot.send_photo(chat_id, InputFile::memory(image).file_name("image.png"))
                .await?;
        }
        ModeKind::Text => {
            bot.send_chat_action(chat_id, ChatAction::Typing).await?;
            let mut history = state.store.get_dialog(user_id, None)?.messages;
            let completion = state
                .openai
                .chat(&user.current_model, &mode.prompt_start, &history, text)
                .await?;

            history.push(DialogMessage::new(text, completion.text.as_str()));
            state.store.set_dialog_messages(user_id, &history, None)?;
            state.store.record_token_usage(
                user_id,
                &user.current_model,
                completion.n_input_tokens,
                completion.n_output_tokens,
            )?;

            for chunk in split_message(&completion.text, MAX_MESSAGE_CHARS) {
                bot.send_message(chat_id, chunk).await?;
            }
        }
    }
    Ok(())
}

/// Drop the last exchange and answer its question again.
async fn retry(bot: &Bot, chat_id: ChatId, user_id: i64, state: &BotState) -> HandlerResult {
    let Some(last) = dialog::take_last_exchange(&state.store, user_id)? else {
        bot.send_message(chat_id, "No message to retry 🤷‍♂️").await?;
        return Ok(());
    };
    state.store.touch_user(user_id)?;
    answer(bot, chat_id, user_id, &last.user, state).await
}

async fn apply_callback(
    bot: &Bot,
    chat_id: ChatId,
    message_id: MessageId,
    user: &TgUser,
    callback: Callback,
    state: &BotState,
) -> HandlerResult {
    let user_id = register(state, chat_id, user)?;
    let _guard = state.locks.acquire(user_id).await;
    state.store.touch_user(user_id)?;

    match callback {
        Callback::SetChatMode(mode_id) => {
            let Some(mode) = state.config.chat_modes.get(&mode_id) else {
                return Ok(());
            };
            state.store.set_user_attribute(user_id, keys::CURRENT_CHAT_MODE, &mode_id)?;
            state.store.start_new_dialog(user_id)?;
            info!("User {} switched to {} mode", user_id, mode_id);
            bot.edit_message_text(chat_id, message_id, mode.welcome_message.as_str())
                .parse_mode(ParseMode::Html)
                .await?;
        }
        Callback::SetModel(model) => {
            if !state.config.available_text_models.contains(&model) {
                return Ok(());
            }
            state.store.set_user_attribute(user_id, keys::CURRENT_MODEL, &model)?;
            info!("User {} switched to model {}", user_id, model);
            bot.edit_message_text(chat_id, message_id, format!("Model set to <b>{}</b> ✅", html_escape(&model)))
                .parse_mode(ParseMode::Html)
                .await?;
        }
    }
    Ok(())
}

async fn send_chat_modes(bot: &Bot, chat_id: ChatId, state: &BotState) -> HandlerResult {
    bot.send_message(chat_id, "Select chat mode:")
        .reply_markup(chat_mode_keyboard(&state.config))
        .await?;
    Ok(())
}

async fn send_html(bot: &Bot, chat_id: ChatId, text: &str) -> HandlerResult {
    bot.send_message(chat_id, text).parse_mode(ParseMode::Html).await?;
    Ok(())
}

fn chat_mode_keyboard(config: &Config) -> InlineKeyboardMarkup {
    let rows: Vec<Vec<InlineKeyboardButton>> = config
        .chat_mode_ids()
        .into_iter()
        .map(|id| {
            vec![InlineKeyboardButton::callback(
                config.chat_mode(id).name.clone(),
                Callback::SetChatMode(id.to_string()).encode(),
            )]
        })
        .collect();
    InlineKeyboardMarkup::new(rows)
}

fn model_keyboard(config: &Config, current: &str) -> InlineKeyboardMarkup {
    let rows: Vec<Vec<InlineKeyboardButton>> = config
        .available_text_models
        .iter()
        .map(|model| {
            let label = if model == current { format!("✅ {model}") } else { model.clone() };
            vec![InlineKeyboardButton::callback(label, Callback::SetModel(model.clone()).encode())]
        })
        .collect();
    InlineKeyboardMarkup::new(rows)
}

fn display_name(user: &TgUser) -> &str {
    user.username.as_deref().unwrap_or(&user.first_name)
}

fn mentions_bot(text: &str, bot_username: &str) -> bool {
    !bot_username.is_empty() && text.contains(&format!("@{bot_username}"))
}

fn strip_mention(text: &str, bot_username: &str) -> String {
    if bot_username.is_empty() {
        return text.trim().to_string();
    }
    text.replace(&format!("@{bot_username}"), "").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mentions_bot() {
        assert!(mentions_bot("@journalbot write a poem", "journalbot"));
        assert!(mentions_bot("hey @journalbot", "journalbot"));
        assert!(!mentions_bot("hey there", "journalbot"));
        assert!(!mentions_bot("@someone", ""));
    }

    #[test]
    fn test_strip_mention() {
        assert_eq!(strip_mention("@journalbot write a poem", "journalbot"), "write a poem");
        assert_eq!(strip_mention("  plain text ", "journalbot"), "plain text");
        assert_eq!(strip_mention(" text ", ""), "text");
    }
}

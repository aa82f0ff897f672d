//! Bot commands and their argument parsing.

use teloxide::utils::command::BotCommands;

#[derive(BotCommands, Clone, Debug, PartialEq)]
#[command(rename_rule = "snake_case", description = "Commands:")]
pub enum Command {
    #[command(description = "start the bot")]
    Start,
    #[command(description = "show help")]
    Help,
    #[command(description = "how to use the bot in group chats")]
    HelpGroupChat,
    #[command(description = "regenerate the last answer")]
    Retry,
    #[command(description = "start a new dialog")]
    New,
    #[command(description = "select chat mode")]
    Mode,
    #[command(description = "select model")]
    Settings,
    #[command(description = "show token usage")]
    Balance,
    #[command(description = "add a journal entry: /add_journal_entry <category> <content>")]
    AddJournalEntry(String),
    #[command(description = "list active journal entries: /journal [category]")]
    Journal(String),
    #[command(description = "archive one entry: /archive_entry <id>")]
    ArchiveEntry(String),
    #[command(description = "archive old entries: /archive_journal [days]")]
    ArchiveJournal(String),
}

/// Inline keyboard actions, encoded as `action|value` in callback data.
#[derive(Debug, Clone, PartialEq)]
pub enum Callback {
    SetChatMode(String),
    SetModel(String),
}

impl Callback {
    pub fn encode(&self) -> String {
        match self {
            Callback::SetChatMode(mode) => format!("set_chat_mode|{mode}"),
            Callback::SetModel(model) => format!("set_model|{model}"),
        }
    }

    pub fn parse(data: &str) -> Option<Self> {
        let (action, value) = data.split_once('|')?;
        if value.is_empty() {
            return None;
        }
        match action {
            "set_chat_mode" => Some(Callback::SetChatMode(value.to_string())),
            "set_model" => Some(Callback::SetModel(value.to_string())),
            _ => None,
        }
    }
}

/// `<category> <content...>` where both parts are non-empty.
pub fn parse_journal_entry(args: &str) -> Option<(&str, &str)> {
    let (category, content) = args.trim().split_once(char::is_whitespace)?;
    let content = content.trim();
    if category.is_empty() || content.is_empty() {
        return None;
    }
    Some((category, content))
}

/// Longest archive age accepted from chat. Larger values are clamped.
pub const MAX_ARCHIVE_DAYS: i64 = 36_500;

/// Optional positive day count, falling back to `default`.
pub fn parse_days(args: &str, default: i64) -> Result<i64, String> {
    let args = args.trim();
    if args.is_empty() {
        return Ok(default);
    }
    match args.parse::<i64>() {
        Ok(days) if days >= 0 => Ok(days.min(MAX_ARCHIVE_DAYS)),
        _ => Err(format!("'{args}' is not a number of days")),
    }
}

/// Empty argument means "no filter".
pub fn optional_arg(args: &str) -> Option<&str> {
    let args = args.trim();
    if args.is_empty() { None } else { Some(args) }
}

//! Reply texts shown to users.

use crate::config::Config;
use crate::store::{EntryStatus, JournalEntry, User};

/// Telegram rejects messages longer than this.
pub const MAX_MESSAGE_CHARS: usize = 4096;

pub const HELP_MESSAGE: &str = "Commands:
⚪ /retry – Regenerate last bot answer
⚪ /new – Start new dialog
⚪ /mode – Select chat mode
⚪ /settings – Select model
⚪ /balance – Show balance
⚪ /help – Show help
⚪ /add_journal_entry &lt;category&gt; &lt;content&gt; – Add a journal entry
⚪ /journal [category] – List active journal entries
⚪ /archive_entry &lt;id&gt; – Archive one entry
⚪ /archive_journal [days] – Archive entries older than N days

🎨 Generate images from text prompts in <b>👩‍🎨 Artist</b> /mode
👥 Add bot to <b>group chat</b>: /help_group_chat
🎤 You can send <b>Voice Messages</b> instead of text";

pub fn help_group_chat(bot_username: &str) -> String {
    format!(
        "You can add bot to any <b>group chat</b> to help and entertain its participants!

Instructions:
1. Add the bot to the group chat
2. Make it an <b>admin</b>, so that it can see messages (all other rights can be restricted)
3. You're awesome!

To get a reply from the bot in the chat – @ <b>tag</b> it or <b>reply</b> to its message.
For example: \"@{} write a poem about Telegram\"",
        html_escape(bot_username)
    )
}

/// Escape text for Telegram's HTML parse mode.
pub fn html_escape(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '<' => result.push_str("&lt;"),
            '>' => result.push_str("&gt;"),
            '&' => result.push_str("&amp;"),
            _ => result.push(c),
        }
    }
    result
}

/// Split text into Telegram-sized chunks on char boundaries, preferring line breaks.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in text.split_inclusive('\n') {
        let line_len = line.chars().count();
        if current_len + line_len <= max_chars {
            current.push_str(line);
            current_len += line_len;
            continue;
        }
        if !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        let mut pieces = cut_line(line, max_chars);
        if let Some(last) = pieces.pop() {
            chunks.extend(pieces.into_iter().map(str::to_string));
            current = last.to_string();
            current_len = last.chars().count();
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Cut a line into pieces of at most `max_chars` characters.
///
/// Cuts go before an HTML entity or tag rather than through it. A piece is only
/// cut through markup when no earlier position in it is outside markup.
fn cut_line(line: &str, max_chars: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut count = 0;
    let mut safe = 0;
    let mut in_markup = false;

    for (idx, ch) in line.char_indices() {
        if !in_markup {
            safe = idx;
        }
        if count == max_chars {
            let cut = if safe > start { safe } else { idx };
            pieces.push(&line[start..cut]);
            count = line[cut..idx].chars().count();
            start = cut;
        }
        match ch {
            '&' | '<' => in_markup = true,
            ';' | '>' => in_markup = false,
            _ => {}
        }
        count += 1;
    }
    if start < line.len() {
        pieces.push(&line[start..]);
    }
    pieces
}

/// Usage summary for /balance, in HTML.
pub fn balance(user: &User, config: &Config) -> String {
    let mut models: Vec<_> = user.n_used_tokens.iter().collect();
    models.sort_by(|a, b| a.0.cmp(b.0));

    let mut total_cost = 0.0;
    let mut details = String::new();
    for (model, usage) in models {
        let price = config.model_prices.get(model).copied().unwrap_or_default();
        let cost = usage.n_input_tokens as f64 / 1000.0 * price.input_per_1k
            + usage.n_output_tokens as f64 / 1000.0 * price.output_per_1k;
        total_cost += cost;
        details.push_str(&format!(
            "- {}: <b>{:.03}$</b> / <b>{}</b> tokens\n",
            html_escape(model),
            cost,
            usage.n_input_tokens + usage.n_output_tokens
        ));
    }

    if user.n_generated_images > 0 {
        let cost = user.n_generated_images as f64 * config.image_price;
        total_cost += cost;
        details.push_str(&format!(
            "- Images: <b>{:.03}$</b> / <b>{}</b> generated\n",
            cost, user.n_generated_images
        ));
    }
    if user.n_transcribed_seconds > 0.0 {
        details.push_str(&format!(
            "- Voice: <b>{:.01}</b> seconds transcribed\n",
            user.n_transcribed_seconds
        ));
    }

    let total_tokens: u64 = user
        .n_used_tokens
        .values()
        .map(|u| u.n_input_tokens + u.n_output_tokens)
        .sum();

    format!(
        "You spent <b>{:.03}$</b>\nYou used <b>{}</b> tokens\n\n{}",
        total_cost, total_tokens, details
    )
}

/// Journal listing for /journal, in HTML.
pub fn journal(entries: &[JournalEntry]) -> String {
    if entries.is_empty() {
        return "No journal entries yet. Add one with /add_journal_entry &lt;category&gt; &lt;content&gt;".to_string();
    }

    let mut out = format!("📓 <b>{}</b> entries\n\n", entries.len());
    for entry in entries {
        let marker = match entry.status {
            EntryStatus::Active => "",
            EntryStatus::Archived => " (archived)",
        };
        out.push_str(&format!(
            "<b>{}</b> [{}]{}\n{}\n<code>{}</code>\n\n",
            entry.timestamp.format("%Y-%m-%d %H:%M"),
            html_escape(&entry.category),
            marker,
            html_escape(&entry.content),
            entry.id
        ));
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TokenUsage;
    use chrono::{TimeZone, Utc};
    use std::io::Write;

    fn test_config(extra: &str) -> Config {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"telegram_bot_token": "1:abc", "openai_api_key": "sk"{extra}}}"#
        )
        .unwrap();
        Config::load(file.path()).unwrap()
    }

    #[test]
    fn test_html_escape() {
        assert_eq!(html_escape("hello"), "hello");
        assert_eq!(html_escape("<b>&</b>"), "&lt;b&gt;&amp;&lt;/b&gt;");
    }

    #[test]
    fn test_split_short_message() {
        assert_eq!(split_message("hello", 10), vec!["hello"]);
        assert!(split_message("", 10).is_empty());
    }

    #[test]
    fn test_split_prefers_line_breaks() {
        let chunks = split_message("aaaa\nbbbb\ncccc", 10);
        assert_eq!(chunks, vec!["aaaa\nbbbb\n", "cccc"]);
    }

    #[test]
    fn test_split_long_line_on_char_boundary() {
        let text = "é".repeat(25);
        let chunks = split_message(&text, 10);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= 10));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_split_keeps_entities_whole() {
        let escaped = html_escape(&format!("x{}", "<a&b>".repeat(40)));
        let chunks = split_message(&escaped, 10);
        assert_eq!(chunks.concat(), escaped);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 10, "{chunk:?} is too long");
            assert_eq!(chunk.matches('&').count(), chunk.matches(';').count(), "{chunk:?} splits an entity");
        }
    }

    #[test]
    fn test_split_keeps_tags_whole() {
        let line = format!("{}<b>2024-01-05</b>", "a".repeat(8));
        let chunks = split_message(&line, 10);
        assert_eq!(chunks.concat(), line);
        assert!(chunks.iter().all(|c| c.matches('<').count() == c.matches('>').count()));
    }

    #[test]
    fn test_balance_with_prices() {
        let config = test_config(
            r#", "model_prices": {"gpt-4o": {"input_per_1k": 0.01, "output_per_1k": 0.03}}, "image_price": 0.04"#,
        );
        let mut user = User::new(1, 1, "gpt-4o");
        user.n_used_tokens.insert(
            "gpt-4o".to_string(),
            TokenUsage { n_input_tokens: 1000, n_output_tokens: 1000 },
        );
        user.n_used_tokens.insert(
            "local".to_string(),
            TokenUsage { n_input_tokens: 10, n_output_tokens: 5 },
        );
        user.n_generated_images = 2;

        let text = balance(&user, &config);
        assert!(text.contains("You spent <b>0.120$</b>"), "{text}");
        assert!(text.contains("You used <b>2015</b> tokens"));
        assert!(text.contains("- gpt-4o: <b>0.040$</b> / <b>2000</b> tokens"));
        assert!(text.contains("- local: <b>0.000$</b>"));
        assert!(text.contains("<b>2</b> generated"));
        assert!(!text.contains("Voice"));
    }

    #[test]
    fn test_journal_listing() {
        assert!(journal(&[]).starts_with("No journal entries"));

        let entries = vec![JournalEntry {
            id: "abc-123".to_string(),
            user_id: 1,
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 8, 30, 0).unwrap(),
            category: "health".to_string(),
            content: "ran <5k>".to_string(),
            status: EntryStatus::Active,
        }];
        let text = journal(&entries);
        assert!(text.contains("<b>2024-03-01 08:30</b> [health]"));
        assert!(text.contains("ran &lt;5k&gt;"));
        assert!(text.contains("<code>abc-123</code>"));
    }
}

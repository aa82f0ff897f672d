use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

/// Errors that can occur when loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the config file.
    ReadFile { path: PathBuf, source: std::io::Error },
    /// Failed to parse JSON.
    ParseJson { path: PathBuf, source: serde_json::Error },
    /// Validation error.
    Validation(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadFile { path, source } => {
                write!(f, "failed to read config file '{}': {}", path.display(), source)
            }
            Self::ParseJson { path, source } => {
                write!(f, "failed to parse config file '{}': {}", path.display(), source)
            }
            Self::Validation(msg) => write!(f, "config validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ReadFile { source, .. } => Some(source),
            Self::ParseJson { source, .. } => Some(source),
            Self::Validation(_) => None,
        }
    }
}

/// What a chat mode produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModeKind {
    Text,
    Image,
}

/// A persona the user can switch to with /mode.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatMode {
    pub name: String,
    pub welcome_message: String,
    #[serde(default)]
    pub prompt_start: String,
    #[serde(default = "default_mode_kind")]
    pub kind: ModeKind,
}

fn default_mode_kind() -> ModeKind {
    ModeKind::Text
}

/// Price per 1000 tokens, in dollars.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct ModelPrice {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

#[derive(Deserialize)]
struct ConfigFile {
    telegram_bot_token: String,
    openai_api_key: String,
    #[serde(default = "default_api_base")]
    openai_api_base: String,
    /// Telegram usernames allowed to talk to the bot. Empty = everyone.
    #[serde(default)]
    allowed_telegram_usernames: Vec<String>,
    #[serde(default = "default_text_models")]
    available_text_models: Vec<String>,
    #[serde(default = "default_image_model")]
    image_model: String,
    #[serde(default = "default_image_size")]
    image_size: String,
    /// Chat modes keyed by id (e.g. "assistant"). Defaults are used if empty.
    #[serde(default)]
    chat_modes: HashMap<String, ChatMode>,
    #[serde(default)]
    model_prices: HashMap<String, ModelPrice>,
    /// Dollars per generated image.
    #[serde(default)]
    image_price: f64,
    /// Start a new dialog after this many idle seconds (0 = never).
    #[serde(default = "default_new_dialog_timeout")]
    new_dialog_timeout_secs: u64,
    #[serde(default = "default_archive_days")]
    journal_archive_days: i64,
    /// Directory for state files (logs, database). Defaults to current directory.
    data_dir: Option<String>,
    /// SQLite file. Defaults to `<data_dir>/journalgpt.db`.
    database_path: Option<String>,
    /// Path to Whisper model file (.bin) for voice transcription.
    whisper_model_path: Option<String>,
}

fn default_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_text_models() -> Vec<String> {
    vec!["gpt-4o-mini".to_string(), "gpt-4o".to_string()]
}

fn default_image_model() -> String {
    "dall-e-3".to_string()
}

fn default_image_size() -> String {
    "1024x1024".to_string()
}

fn default_new_dialog_timeout() -> u64 {
    600
}

fn default_archive_days() -> i64 {
    30
}

pub struct Config {
    pub telegram_bot_token: String,
    pub openai_api_key: String,
    pub openai_api_base: String,
    /// Lowercased, without the leading `@`.
    pub allowed_telegram_usernames: HashSet<String>,
    /// First entry is the default model for new users.
    pub available_text_models: Vec<String>,
    pub image_model: String,
    pub image_size: String,
    pub chat_modes: HashMap<String, ChatMode>,
    pub model_prices: HashMap<String, ModelPrice>,
    pub image_price: f64,
    pub new_dialog_timeout_secs: u64,
    pub journal_archive_days: i64,
    /// Directory for state files (logs, database).
    pub data_dir: PathBuf,
    pub database_path: PathBuf,
    pub whisper_model_path: Option<PathBuf>,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config_path = path.as_ref().to_path_buf();
        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| ConfigError::ReadFile { path: config_path.clone(), source: e })?;
        let file: ConfigFile = serde_json::from_str(&content)
            .map_err(|e| ConfigError::ParseJson { path: config_path.clone(), source: e })?;

        // Validate required fields
        if file.telegram_bot_token.is_empty() {
            return Err(ConfigError::Validation("telegram_bot_token is required".into()));
        }
        // Telegram tokens are formatted as {bot_id}:{secret} where bot_id is numeric
        let token_parts: Vec<&str> = file.telegram_bot_token.split(':').collect();
        if token_parts.len() != 2 || token_parts[0].parse::<u64>().is_err() || token_parts[1].is_empty() {
            return Err(ConfigError::Validation(
                "telegram_bot_token appears invalid (expected format: 123456789:ABCdefGHI...)".into()
            ));
        }
        if file.openai_api_key.is_empty() {
            return Err(ConfigError::Validation("openai_api_key is required".into()));
        }
        if file.available_text_models.is_empty() {
            return Err(ConfigError::Validation("available_text_models must contain at least one model".into()));
        }
        if let Some(bad) = file.available_text_models.iter().find(|m| m.is_empty() || m.contains(['"', '\\'])) {
            return Err(ConfigError::Validation(format!("invalid model name '{bad}'")));
        }

        let chat_modes = if file.chat_modes.is_empty() {
            default_chat_modes()
        } else {
            file.chat_modes
        };
        if !chat_modes.contains_key("assistant") {
            return Err(ConfigError::Validation("chat_modes must define 'assistant'".into()));
        }

        let data_dir = file
            .data_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let database_path = file
            .database_path
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("journalgpt.db"));

        Ok(Self {
            telegram_bot_token: file.telegram_bot_token,
            openai_api_key: file.openai_api_key,
            openai_api_base: file.openai_api_base.trim_end_matches('/').to_string(),
            allowed_telegram_usernames: file
                .allowed_telegram_usernames
                .into_iter()
                .map(|s| s.trim_start_matches('@').to_lowercase())
                .collect(),
            available_text_models: file.available_text_models,
            image_model: file.image_model,
            image_size: file.image_size,
            chat_modes,
            model_prices: file.model_prices,
            image_price: file.image_price,
            new_dialog_timeout_secs: file.new_dialog_timeout_secs,
            journal_archive_days: file.journal_archive_days,
            data_dir,
            database_path,
            whisper_model_path: file.whisper_model_path.map(PathBuf::from),
        })
    }

    /// Model assigned to new users.
    pub fn default_model(&self) -> &str {
        // Non-empty, checked in load()
        &self.available_text_models[0]
    }

    pub fn is_allowed(&self, username: Option<&str>) -> bool {
        if self.allowed_telegram_usernames.is_empty() {
            return true;
        }
        username.is_some_and(|u| self.allowed_telegram_usernames.contains(&u.to_lowercase()))
    }

    /// Chat mode by id, falling back to the assistant.
    pub fn chat_mode(&self, id: &str) -> &ChatMode {
        self.chat_modes
            .get(id)
            .or_else(|| self.chat_modes.get("assistant"))
            .unwrap_or(&FALLBACK_MODE)
    }

    /// Chat mode ids in a stable order, assistant first.
    pub fn chat_mode_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.chat_modes.keys().map(String::as_str).collect();
        ids.sort_by_key(|id| (*id != "assistant", *id));
        ids
    }
}

static FALLBACK_MODE: ChatMode = ChatMode {
    name: String::new(),
    welcome_message: String::new(),
    prompt_start: String::new(),
    kind: ModeKind::Text,
};

fn default_chat_modes() -> HashMap<String, ChatMode> {
    [
        (
            "assistant",
            "👩🏼‍🎓 General Assistant",
            "👩🏼‍🎓 Hi, I'm <b>General Assistant</b>. How can I help you?",
            "As an advanced chatbot Assistant, your primary goal is to assist users to the best of your ability. Answer concisely and accurately.",
            ModeKind::Text,
        ),
        (
            "code_assistant",
            "👩🏼‍💻 Code Assistant",
            "👩🏼‍💻 Hi, I'm <b>Code Assistant</b>. How can I help you?",
            "As an advanced programming assistant, you write clean, idiomatic code and explain it briefly. Put code in fenced blocks.",
            ModeKind::Text,
        ),
        (
            "artist",
            "👩‍🎨 Artist",
            "👩‍🎨 Hi, I'm <b>Artist</b>. I'll draw anything for you. Describe the picture.",
            "",
            ModeKind::Image,
        ),
    ]
    .into_iter()
    .map(|(id, name, welcome, prompt, kind)| {
        (
            id.to_string(),
            ChatMode {
                name: name.to_string(),
                welcome_message: welcome.to_string(),
                prompt_start: prompt.to_string(),
                kind,
            },
        )
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    fn assert_err<T>(result: Result<T, ConfigError>) -> ConfigError {
        match result {
            Ok(_) => panic!("expected error, got Ok"),
            Err(e) => e,
        }
    }

    #[test]
    fn test_valid_config_defaults() {
        let file = write_config(r#"{
            "telegram_bot_token": "123456789:ABCdefGHIjklMNOpqrsTUVwxyz",
            "openai_api_key": "sk-test"
        }"#);
        let config = Config::load(file.path()).expect("should load valid config");
        assert_eq!(config.default_model(), "gpt-4o-mini");
        assert_eq!(config.openai_api_base, "https://api.openai.com/v1");
        assert_eq!(config.new_dialog_timeout_secs, 600);
        assert_eq!(config.journal_archive_days, 30);
        assert_eq!(config.database_path, PathBuf::from("./journalgpt.db"));
        assert_eq!(config.chat_mode_ids(), vec!["assistant", "artist", "code_assistant"]);
        assert_eq!(config.chat_mode("artist").kind, ModeKind::Image);
        assert!(config.is_allowed(None));
    }

    #[test]
    fn test_custom_models_and_modes() {
        let file = write_config(r#"{
            "telegram_bot_token": "123456789:ABCdef",
            "openai_api_key": "sk-test",
            "openai_api_base": "http://localhost:8080/v1/",
            "available_text_models": ["llama-3.1-8b", "gpt-4o"],
            "chat_modes": {
                "assistant": {"name": "Assistant", "welcome_message": "hi", "prompt_start": "be nice"}
            },
            "model_prices": {"gpt-4o": {"input_per_1k": 0.005, "output_per_1k": 0.015}},
            "data_dir": "/var/lib/journalgpt"
        }"#);
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.default_model(), "llama-3.1-8b");
        assert_eq!(config.openai_api_base, "http://localhost:8080/v1");
        assert_eq!(config.chat_mode_ids(), vec!["assistant"]);
        assert_eq!(config.chat_mode("unknown").name, "Assistant");
        assert_eq!(config.model_prices["gpt-4o"].output_per_1k, 0.015);
        assert_eq!(config.database_path, PathBuf::from("/var/lib/journalgpt/journalgpt.db"));
    }

    #[test]
    fn test_allowed_usernames() {
        let file = write_config(r#"{
            "telegram_bot_token": "123456789:ABCdef",
            "openai_api_key": "sk-test",
            "allowed_telegram_usernames": ["@Alice", "bob"]
        }"#);
        let config = Config::load(file.path()).unwrap();
        assert!(config.is_allowed(Some("alice")));
        assert!(config.is_allowed(Some("BOB")));
        assert!(!config.is_allowed(Some("mallory")));
        assert!(!config.is_allowed(None));
    }

    #[test]
    fn test_empty_token() {
        let file = write_config(r#"{
            "telegram_bot_token": "",
            "openai_api_key": "sk-test"
        }"#);
        let err = assert_err(Config::load(file.path()));
        assert!(matches!(err, ConfigError::Validation(_)));
        assert!(err.to_string().contains("telegram_bot_token"));
    }

    #[test]
    fn test_invalid_token_format() {
        for token in ["invalid_token_no_colon", "notanumber:ABCdef", "123456789:"] {
            let file = write_config(&format!(
                r#"{{"telegram_bot_token": "{token}", "openai_api_key": "sk-test"}}"#
            ));
            let err = assert_err(Config::load(file.path()));
            assert!(matches!(err, ConfigError::Validation(_)), "token {token} accepted");
        }
    }

    #[test]
    fn test_missing_api_key() {
        let file = write_config(r#"{
            "telegram_bot_token": "123456789:ABCdef",
            "openai_api_key": ""
        }"#);
        let err = assert_err(Config::load(file.path()));
        assert!(err.to_string().contains("openai_api_key"));
    }

    #[test]
    fn test_empty_model_list() {
        let file = write_config(r#"{
            "telegram_bot_token": "123456789:ABCdef",
            "openai_api_key": "sk-test",
            "available_text_models": []
        }"#);
        let err = assert_err(Config::load(file.path()));
        assert!(err.to_string().contains("available_text_models"));
    }

    #[test]
    fn test_modes_without_assistant() {
        let file = write_config(r#"{
            "telegram_bot_token": "123456789:ABCdef",
            "openai_api_key": "sk-test",
            "chat_modes": {"pirate": {"name": "Pirate", "welcome_message": "arr"}}
        }"#);
        let err = assert_err(Config::load(file.path()));
        assert!(err.to_string().contains("assistant"));
    }

    #[test]
    fn test_file_not_found() {
        let err = assert_err(Config::load("/nonexistent/path/config.json"));
        assert!(matches!(err, ConfigError::ReadFile { .. }));
    }

    #[test]
    fn test_invalid_json() {
        let file = write_config("{ invalid json }");
        let err = assert_err(Config::load(file.path()));
        assert!(matches!(err, ConfigError::ParseJson { .. }));
    }
}

//! Telegram front end: commands, conversations, voice and journal handling.

pub mod commands;
pub mod dialog;
pub mod error;
pub mod format;
pub mod handlers;
pub mod locks;
pub mod whisper;

pub use commands::Command;
pub use error::BotError;
pub use handlers::{BotState, schema};
pub use locks::UserLocks;
pub use whisper::{Transcription, Whisper};

use std::fmt;

use crate::openai;
use crate::store::StoreError;

/// Anything that can go wrong while handling one update.
#[derive(Debug)]
pub enum BotError {
    Store(StoreError),
    Llm(openai::Error),
    Transcription(String),
    Telegram(teloxide::RequestError),
    Download(teloxide::DownloadError),
}

impl fmt::Display for BotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store(e) => write!(f, "store: {e}"),
            Self::Llm(e) => write!(f, "llm: {e}"),
            Self::Transcription(e) => write!(f, "transcription: {e}"),
            Self::Telegram(e) => write!(f, "telegram: {e}"),
            Self::Download(e) => write!(f, "download: {e}"),
        }
    }
}

impl std::error::Error for BotError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(e) => Some(e),
            Self::Llm(e) => Some(e),
            Self::Transcription(_) => None,
            Self::Telegram(e) => Some(e),
            Self::Download(e) => Some(e),
        }
    }
}

impl From<StoreError> for BotError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<openai::Error> for BotError {
    fn from(e: openai::Error) -> Self {
        Self::Llm(e)
    }
}

impl From<teloxide::RequestError> for BotError {
    fn from(e: teloxide::RequestError) -> Self {
        Self::Telegram(e)
    }
}

impl From<teloxide::DownloadError> for BotError {
    fn from(e: teloxide::DownloadError) -> Self {
        Self::Download(e)
    }
}

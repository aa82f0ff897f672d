//! Minimal client for OpenAI-compatible chat completion and image APIs.

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::store::DialogMessage;

pub struct Client {
    api_key: String,
    api_base: String,
    http: reqwest::Client,
}

/// Generated reply plus the tokens it cost.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub n_input_tokens: u64,
    pub n_output_tokens: u64,
}

#[derive(Debug, Serialize, PartialEq)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ApiMessage>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Serialize)]
struct ImageRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    n: u32,
    size: &'a str,
    response_format: &'static str,
}

#[derive(Deserialize)]
struct ImageResponse {
    data: Vec<ImageData>,
}

#[derive(Deserialize)]
struct ImageData {
    b64_json: String,
}

impl Client {
    pub fn new(api_key: String, api_base: String) -> Self {
        Self {
            api_key,
            api_base,
            http: reqwest::Client::new(),
        }
    }

    /// Answer `message` given the dialog so far.
    pub async fn chat(
        &self,
        model: &str,
        system_prompt: &str,
        history: &[DialogMessage],
        message: &str,
    ) -> Result<Completion, Error> {
        let request = ChatRequest {
            model,
            messages: build_messages(system_prompt, history, message),
        };

        let response = self
            .http
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Api(format!("{status}: {body}")));
        }

        let body = response.text().await.map_err(|e| Error::Http(e.to_string()))?;
        parse_chat_response(&body)
    }

    /// Generate one image and return its bytes.
    pub async fn generate_image(&self, model: &str, size: &str, prompt: &str) -> Result<Vec<u8>, Error> {
        let request = ImageRequest {
            model,
            prompt,
            n: 1,
            size,
            response_format: "b64_json",
        };

        let response = self
            .http
            .post(format!("{}/images/generations", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Api(format!("{status}: {body}")));
        }

        let body = response.text().await.map_err(|e| Error::Http(e.to_string()))?;
        parse_image_response(&body)
    }
}

fn build_messages(system_prompt: &str, history: &[DialogMessage], message: &str) -> Vec<ApiMessage> {
    let mut messages = Vec::with_capacity(history.len() * 2 + 2);
    if !system_prompt.is_empty() {
        messages.push(ApiMessage {
            role: "system",
            content: system_prompt.to_string(),
        });
    }
    for turn in history {
        messages.push(ApiMessage {
            role: "user",
            content: turn.user.clone(),
        });
        messages.push(ApiMessage {
            role: "assistant",
            content: turn.bot.clone(),
        });
    }
    messages.push(ApiMessage {
        role: "user",
        content: message.to_string(),
    });
    messages
}

fn parse_chat_response(body: &str) -> Result<Completion, Error> {
    let response: ChatResponse = serde_json::from_str(body).map_err(|e| Error::Parse(e.to_string()))?;

    let text = response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or(Error::Empty)?;

    let (n_input_tokens, n_output_tokens) = response
        .usage
        .map(|u| (u.prompt_tokens, u.completion_tokens))
        .unwrap_or((0, 0));

    Ok(Completion {
        text,
        n_input_tokens,
        n_output_tokens,
    })
}

fn parse_image_response(body: &str) -> Result<Vec<u8>, Error> {
    let response: ImageResponse = serde_json::from_str(body).map_err(|e| Error::Parse(e.to_string()))?;
    let image = response.data.into_iter().next().ok_or(Error::Empty)?;
    base64::engine::general_purpose::STANDARD
        .decode(image.b64_json)
        .map_err(|e| Error::Parse(format!("invalid image data: {e}")))
}

#[derive(Debug)]
pub enum Error {
    Http(String),
    Api(String),
    Parse(String),
    Empty,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Http(e) => write!(f, "HTTP error: {e}"),
            Error::Api(e) => write!(f, "API error: {e}"),
            Error::Parse(e) => write!(f, "Parse error: {e}"),
            Error::Empty => write!(f, "Empty response"),
        }
    }
}

impl std::error::Error for Error {}

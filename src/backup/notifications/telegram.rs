//! Telegram-style bot API transport.

use crate::backup::notifications::Notification;
use crate::backup::redacted::RedactedString;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use getset::Getters;
use reqwest::blocking::{multipart, Client, Response};
use reqwest::StatusCode;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use validator::Validate;

pub const DEFAULT_API_URL: &str = "https://api.telegram.org";
const MAX_MESSAGE_CHARS: usize = 4096;
const MAX_CAPTION_CHARS: usize = 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const MESSAGE_TIMEOUT: Duration = Duration::from_secs(60);
const DOCUMENT_TIMEOUT: Duration = Duration::from_secs(3600);

/// `TG_*` settings.
#[derive(Clone, Debug, Default, Deserialize, Validate, Getters)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[getset(get = "pub")]
pub struct TelegramConfig {
    tg_bot_token: Option<RedactedString>,
    tg_chat_id: Option<String>,
    tg_api_url: Option<String>,
}

impl TelegramConfig {
    pub fn new<S: Into<String>>(token: RedactedString, chat_id: S, api_url: Option<String>) -> Self {
        Self {
            tg_bot_token: Some(token),
            tg_chat_id: Some(chat_id.into()),
            tg_api_url: api_url,
        }
    }

    /// `None` unless both the token and the chat id are set.
    pub fn transport(&self) -> Result<Option<TelegramTransport>> {
        match (&self.tg_bot_token, &self.tg_chat_id) {
            (Some(token), Some(chat_id)) => {
                let api_url = self
                    .tg_api_url
                    .as_deref()
                    .unwrap_or(DEFAULT_API_URL)
                    .trim_end_matches('/')
                    .to_string();
                let client = Client::builder()
                    .connect_timeout(CONNECT_TIMEOUT)
                    .build()
                    .map_err(Error::from)
                    .with_msg("Build HTTP client failed")?;
                Ok(Some(TelegramTransport {
                    client,
                    api_url,
                    token: token.clone(),
                    chat_id: chat_id.clone(),
                }))
            }
            (None, None) => Ok(None),
            _ => {
                tracing::warn!("Only one of TG_BOT_TOKEN and TG_CHAT_ID is set, notifications disabled");
                Ok(None)
            }
        }
    }
}

#[derive(Debug)]
pub struct TelegramTransport {
    client: Client,
    api_url: String,
    token: RedactedString,
    chat_id: String,
}

impl TelegramTransport {
    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_url, self.token.inner(), method)
    }

    fn check(method: &str, response: Response) -> Result<()> {
        let status = response.status();
        if status == StatusCode::OK {
            return Ok(());
        }
        let body = response.text().unwrap_or_default();
        Err(Error::Transport(format!(
            "{method} answered {status}: {}",
            truncate_chars(body.trim(), 512)
        )))
    }
}

impl Notification for TelegramTransport {
    fn send_status(&self, text: &str) -> Result<()> {
        let body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": truncate_chars(text, MAX_MESSAGE_CHARS),
        });
        let response = self
            .client
            .post(self.method_url("sendMessage"))
            .timeout(MESSAGE_TIMEOUT)
            .json(&body)
            .send()?;
        Self::check("sendMessage", response)
    }

    fn send_document(&self, path: &Path, caption: &str) -> Result<()> {
        let form = multipart::Form::new()
            .text("chat_id", self.chat_id.clone())
            .text("caption", truncate_chars(caption, MAX_CAPTION_CHARS).to_string())
            .file("document", path)
            .map_err(Error::from)
            .with_msg(format!("Open {:?} for upload failed", path))?;
        let response = self
            .client
            .post(self.method_url("sendDocument"))
            .timeout(DOCUMENT_TIMEOUT)
            .multipart(form)
            .send()?;
        Self::check("sendDocument", response)
    }
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((end, _)) => &s[..end],
        None => s,
    }
}

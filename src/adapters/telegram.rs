//! Telegram Bot API announcer
//!
//! Posts competition announcements and notices to agent channels. Texts over
//! the 4096-character message limit go out as several messages, each later
//! part replying to the first. With an attachment the first message is a
//! photo whose caption holds the first 1024 characters.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::config::TelegramConfig;
use crate::engine::traits::{Announcement, Announcer, ChannelInfo, MessageId};
use crate::error::{ContestError, Result};

/// Telegram's per-message character limit
pub const MESSAGE_LIMIT: usize = 4096;

/// Telegram's photo caption limit
pub const CAPTION_LIMIT: usize = 1024;

#[derive(Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to_message_id: Option<i64>,
}

#[derive(Serialize)]
struct SendPhotoRequest<'a> {
    chat_id: &'a str,
    photo: &'a str,
    caption: &'a str,
    parse_mode: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to_message_id: Option<i64>,
}

#[derive(Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Deserialize)]
struct SentMessage {
    message_id: i64,
}

#[derive(Deserialize)]
struct Chat {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    username: Option<String>,
}

/// Split `text` into parts of at most `limit` characters, preferring to
/// break after a newline
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let mut parts = Vec::new();
    let mut rest = text;

    while rest.chars().count() > limit {
        let hard_end = rest
            .char_indices()
            .nth(limit)
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        let end = match rest[..hard_end].rfind('\n') {
            Some(nl) if nl > 0 => nl + 1,
            _ => hard_end,
        };
        parts.push(rest[..end].to_string());
        rest = &rest[end..];
    }
    if !rest.is_empty() || parts.is_empty() {
        parts.push(rest.to_string());
    }
    parts
}

/// Split `text` into a photo caption and the follow-up messages
pub fn split_caption(text: &str) -> (String, Vec<String>) {
    let caption = split_message(text, CAPTION_LIMIT)
        .into_iter()
        .next()
        .unwrap_or_default();
    let rest = &text[caption.len()..];
    let follow_ups = if rest.is_empty() {
        Vec::new()
    } else {
        split_message(rest, MESSAGE_LIMIT)
    };
    (caption, follow_ups)
}

/// Telegram Bot API client
#[derive(Clone)]
pub struct TelegramAnnouncer {
    client: Client,
    api_url: String,
    bot_token: String,
}

impl TelegramAnnouncer {
    pub fn new(api_url: impl Into<String>, bot_token: impl Into<String>) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(15)).build()?;
        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            bot_token: bot_token.into(),
        })
    }

    pub fn from_config(config: &TelegramConfig) -> Result<Self> {
        let token = config
            .bot_token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ContestError::Validation("telegram.bot_token is not set".to_string()))?;
        info!("Telegram announcements enabled");
        Self::new(&config.api_url, token)
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_url, self.bot_token, method)
    }

    async fn call<B: Serialize + ?Sized, T: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        body: &B,
    ) -> Result<T> {
        let resp = self
            .client
            .post(self.method_url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| {
                error!("Telegram {} request failed: {}", method, e);
                ContestError::AnnounceFailed(e.to_string())
            })?;

        let status = resp.status();
        let body: ApiResponse<T> = resp.json().await.map_err(|e| {
            error!("Telegram {} returned unreadable body ({}): {}", method, status, e);
            ContestError::AnnounceFailed(format!("HTTP {}: {}", status, e))
        })?;

        match body.result {
            Some(result) if body.ok => Ok(result),
            _ => {
                let reason = body
                    .description
                    .unwrap_or_else(|| format!("HTTP {}", status));
                error!("Telegram API error ({}): {}", method, reason);
                Err(ContestError::AnnounceFailed(reason))
            }
        }
    }

    async fn send_one(&self, chat_id: &str, text: &str, reply_to: Option<&MessageId>) -> Result<MessageId> {
        let request = SendMessageRequest {
            chat_id,
            text,
            parse_mode: "HTML",
            reply_to_message_id: reply_to.map(|m| m.0),
        };
        let sent: SentMessage = self.call("sendMessage", &request).await?;
        Ok(MessageId(sent.message_id))
    }

    async fn send_photo(
        &self,
        chat_id: &str,
        photo: &str,
        caption: &str,
        reply_to: Option<&MessageId>,
    ) -> Result<MessageId> {
        let request = SendPhotoRequest {
            chat_id,
            photo,
            caption,
            parse_mode: "HTML",
            reply_to_message_id: reply_to.map(|m| m.0),
        };
        let sent: SentMessage = self.call("sendPhoto", &request).await?;
        Ok(MessageId(sent.message_id))
    }
}

#[async_trait]
impl Announcer for TelegramAnnouncer {
    async fn announce(&self, destination: &str, announcement: &Announcement) -> Result<MessageId> {
        if destination.trim().is_empty() {
            return Err(ContestError::AnnounceFailed("empty chat id".to_string()));
        }

        let mut first: Option<MessageId> = None;
        let parts = match announcement.attachment.as_deref() {
            Some(photo) => {
                let (caption, rest) = split_caption(&announcement.text);
                let id = self
                    .send_photo(destination, photo, &caption, announcement.reply_to.as_ref())
                    .await?;
                first = Some(id);
                rest
            }
            None => split_message(&announcement.text, MESSAGE_LIMIT),
        };
        for part in &parts {
            let reply_to = first.as_ref().or(announcement.reply_to.as_ref());
            let id = self.send_one(destination, part, reply_to).await?;
            if first.is_none() {
                first = Some(id);
            }
        }

        let first = first.ok_or_else(|| ContestError::Internal("no message parts sent".to_string()))?;
        debug!(
            "Sent announcement to {} as {} text part(s) (photo: {}), first message {}",
            destination,
            parts.len(),
            announcement.attachment.is_some(),
            first.0
        );
        Ok(first)
    }

    async fn channel_info(&self, destination: &str) -> Result<ChannelInfo> {
        let chat: Chat = self
            .call("getChat", &serde_json::json!({ "chat_id": destination }))
            .await?;
        let title = chat
            .title
            .or(chat.username)
            .unwrap_or_else(|| destination.to_string());
        Ok(ChannelInfo { title })
    }
}

/// Logs announcements instead of sending them
#[derive(Default)]
pub struct DryRunAnnouncer {
    next_id: AtomicI64,
}

impl DryRunAnnouncer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Announcer for DryRunAnnouncer {
    async fn announce(&self, destination: &str, announcement: &Announcement) -> Result<MessageId> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            "[dry-run] announcement #{} to {} ({} chars, attachment {:?})",
            id,
            destination,
            announcement.text.chars().count(),
            announcement.attachment
        );
        Ok(MessageId(id))
    }

    async fn channel_info(&self, destination: &str) -> Result<ChannelInfo> {
        Ok(ChannelInfo {
            title: destination.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_text_is_single_part() {
        assert_eq!(split_message("hello", MESSAGE_LIMIT), vec!["hello".to_string()]);
        assert_eq!(split_message("", MESSAGE_LIMIT), vec![String::new()]);
    }

    #[test]
    fn test_split_prefers_newlines() {
        let text = "aaaa\nbbbb\ncc";
        let parts = split_message(text, 6);
        assert_eq!(parts, vec!["aaaa\n", "bbbb\n", "cc"]);
        assert_eq!(parts.concat(), text);
    }

    #[test]
    fn test_split_counts_characters_not_bytes() {
        let text = "م".repeat(5000);
        let parts = split_message(&text, MESSAGE_LIMIT);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].chars().count(), MESSAGE_LIMIT);
        assert_eq!(parts[1].chars().count(), 5000 - MESSAGE_LIMIT);
    }

    #[test]
    fn test_caption_overflow_goes_to_follow_ups() {
        let (caption, rest) = split_caption("short caption");
        assert_eq!(caption, "short caption");
        assert!(rest.is_empty());

        let text = format!("{}\n{}", "a".repeat(1000), "b".repeat(500));
        let (caption, rest) = split_caption(&text);
        assert_eq!(caption.chars().count(), 1001);
        assert!(caption.ends_with('\n'));
        assert_eq!(rest, vec!["b".repeat(500)]);
        assert_eq!(format!("{}{}", caption, rest.concat()), text);
    }

    #[test]
    fn test_long_caption_splits_on_characters() {
        let text = "ج".repeat(CAPTION_LIMIT + 10);
        let (caption, rest) = split_caption(&text);
        assert_eq!(caption.chars().count(), CAPTION_LIMIT);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].chars().count(), 10);
    }

    #[test]
    fn test_method_url() {
        let t = TelegramAnnouncer::new("https://api.telegram.org/", "123:abc").unwrap();
        assert_eq!(
            t.method_url("sendMessage"),
            "https://api.telegram.org/bot123:abc/sendMessage"
        );
    }

    #[tokio::test]
    async fn test_dry_run_assigns_increasing_ids() {
        let dry = DryRunAnnouncer::new();
        let a = dry.announce("-1", &Announcement::text("x")).await.unwrap();
        let b = dry.announce("-1", &Announcement::text("y")).await.unwrap();
        assert_eq!((a, b), (MessageId(1), MessageId(2)));
        assert_eq!(dry.channel_info("-1").await.unwrap().title, "-1");
    }
}

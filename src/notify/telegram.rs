use anyhow::{bail, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::debug;

use crate::config::Config;
use crate::notify::{EventKind, NotificationEvent, NotificationSink};

pub struct TelegramSink {
    client: Client,
    bot_token: String,
    chat_id: String,
    /// Only deliver trade lifecycle and halt events.
    quiet: bool,
}

impl TelegramSink {
    /// `None` when no bot token or chat is configured.
    pub fn from_config(cfg: &Config) -> Option<Self> {
        if cfg.telegram_bot_token.is_empty() || cfg.telegram_chat_id.is_empty() {
            return None;
        }
        Some(Self::new(&cfg.telegram_bot_token, &cfg.telegram_chat_id, cfg.telegram_quiet))
    }

    pub fn new(bot_token: &str, chat_id: &str, quiet: bool) -> Self {
        Self {
            client: Client::new(),
            bot_token: bot_token.to_string(),
            chat_id: chat_id.to_string(),
            quiet,
        }
    }

    pub fn wants(&self, kind: EventKind) -> bool {
        !self.quiet
            || matches!(
                kind,
                EventKind::Fill
                    | EventKind::Reject
                    | EventKind::Trail
                    | EventKind::Close
                    | EventKind::Halt
                    | EventKind::Summary
            )
    }
}

fn emoji(kind: EventKind) -> &'static str {
    match kind {
        EventKind::Signal => "📈",
        EventKind::Dropped => "⚠️",
        EventKind::Fill => "📥",
        EventKind::Reject => "❌",
        EventKind::Trail => "🔄",
        EventKind::Close => "✅",
        EventKind::Zone => "🧱",
        EventKind::Halt => "🛑",
        EventKind::Summary => "📢",
    }
}

pub fn format_message(event: &NotificationEvent) -> String {
    format!(
        "{} <b>{}</b>\n{}\n<i>{}</i>",
        emoji(event.kind),
        event.kind.to_string().to_uppercase(),
        html_escape(&event.message),
        event.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
    )
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

#[async_trait]
impl NotificationSink for TelegramSink {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn deliver(&self, event: &NotificationEvent) -> Result<()> {
        if !self.wants(event.kind) {
            debug!("Quiet mode: skipped {} message", event.kind);
            return Ok(());
        }

        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let payload = json!({
            "chat_id": self.chat_id,
            "text": format_message(event),
            "parse_mode": "HTML",
            "disable_web_page_preview": true
        });

        let response = self.client.post(&url).json(&payload).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("telegram returned {}: {}", status, body);
        }
        Ok(())
    }
}

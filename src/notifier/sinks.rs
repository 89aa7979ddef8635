//! Delivery sinks
//!
//! A sink delivers one formatted message to one channel. The dispatcher
//! only sees the trait; concrete sinks wrap the Telegram Bot API and the
//! CallMeBot WhatsApp gateway.

use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::warn;

use crate::error::{Error, Result};

use super::types::{NotifierConfig, TelegramConfig, WhatsAppConfig};

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

pub trait NotificationSink: Send + Sync {
    /// Short channel name for logs
    fn name(&self) -> &'static str;

    /// Deliver one message to every recipient of this channel.
    fn send<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<()>>;
}

pub struct TelegramSink {
    http: reqwest::Client,
    token: String,
    chat_ids: Vec<String>,
}

impl TelegramSink {
    pub fn new(http: reqwest::Client, config: &TelegramConfig) -> Self {
        Self {
            http,
            token: config.token.clone(),
            chat_ids: config.chat_ids.clone(),
        }
    }

    async fn deliver(&self, text: &str) -> Result<()> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.token);
        let mut failures = 0usize;
        for chat_id in &self.chat_ids {
            let body = serde_json::json!({ "chat_id": chat_id, "text": text });
            match self.http.post(&url).json(&body).send().await {
                Ok(response) if response.status().is_success() => {}
                Ok(response) => {
                    warn!(chat_id = %chat_id, status = %response.status(), "Telegram send rejected");
                    failures += 1;
                }
                Err(e) => {
                    warn!(chat_id = %chat_id, error = %e, "Telegram send failed");
                    failures += 1;
                }
            }
        }
        if failures > 0 {
            return Err(Error::Network(format!(
                "telegram delivery failed for {} of {} chats",
                failures,
                self.chat_ids.len()
            )));
        }
        Ok(())
    }
}

impl NotificationSink for TelegramSink {
    fn name(&self) -> &'static str {
        "telegram"
    }

    fn send<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<()>> {
        self.deliver(text).boxed()
    }
}

pub struct WhatsAppSink {
    http: reqwest::Client,
    config: WhatsAppConfig,
}

impl WhatsAppSink {
    pub fn new(http: reqwest::Client, config: &WhatsAppConfig) -> Self {
        Self {
            http,
            config: config.clone(),
        }
    }

    async fn deliver(&self, text: &str) -> Result<()> {
        let mut failures = 0usize;
        for recipient in &self.config.recipients {
            let url = format!(
                "https://api.callmebot.com/whatsapp.php?phone={}&text={}&apikey={}",
                recipient.phone,
                urlencoding::encode(text),
                recipient.api_key
            );
            match self.http.get(&url).send().await {
                Ok(response) if response.status().is_success() => {}
                Ok(response) => {
                    warn!(phone = %recipient.phone, status = %response.status(), "WhatsApp send rejected");
                    failures += 1;
                }
                Err(e) => {
                    warn!(phone = %recipient.phone, error = %e, "WhatsApp send failed");
                    failures += 1;
                }
            }
        }
        if failures > 0 {
            return Err(Error::Network(format!(
                "whatsapp delivery failed for {} of {} recipients",
                failures,
                self.config.recipients.len()
            )));
        }
        Ok(())
    }
}

impl NotificationSink for WhatsAppSink {
    fn name(&self) -> &'static str {
        "whatsapp"
    }

    fn send<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<()>> {
        self.deliver(text).boxed()
    }
}

/// Build the enabled sinks from the notifications document. Channels that
/// are enabled but missing their credentials are skipped with a warning
/// rather than failing startup.
pub fn build_sinks(config: &NotifierConfig) -> Result<Vec<Box<dyn NotificationSink>>> {
    let http = reqwest::Client::builder().timeout(SEND_TIMEOUT).build()?;
    let mut sinks: Vec<Box<dyn NotificationSink>> = Vec::new();

    if config.telegram.enabled {
        if config.telegram.token.is_empty() || config.telegram.chat_ids.is_empty() {
            warn!("Telegram enabled but token or chat ids missing, skipping");
        } else {
            sinks.push(Box::new(TelegramSink::new(http.clone(), &config.telegram)));
        }
    }
    if config.whatsapp.enabled {
        if config.whatsapp.recipients.is_empty() {
            warn!("WhatsApp enabled but no recipients configured, skipping");
        } else {
            sinks.push(Box::new(WhatsAppSink::new(http.clone(), &config.whatsapp)));
        }
    }
    Ok(sinks)
}

#[cfg(test)]
mod tests {
    use super::super::types::WhatsAppRecipient;
    use super::*;

    #[test]
    fn test_disabled_config_builds_no_sinks() {
        let sinks = build_sinks(&NotifierConfig::default()).unwrap();
        assert!(sinks.is_empty());
    }

    #[test]
    fn test_enabled_channels_build_in_order() {
        let config = NotifierConfig {
            telegram: TelegramConfig {
                enabled: true,
                token: "123:abc".into(),
                chat_ids: vec!["42".into()],
            },
            whatsapp: WhatsAppConfig {
                enabled: true,
                recipients: vec![WhatsAppRecipient {
                    phone: "+15551234".into(),
                    api_key: "k".into(),
                }],
            },
        };
        let sinks = build_sinks(&config).unwrap();
        let names: Vec<_> = sinks.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["telegram", "whatsapp"]);
    }

    #[test]
    fn test_enabled_but_unconfigured_channel_is_skipped() {
        let config = NotifierConfig {
            telegram: TelegramConfig {
                enabled: true,
                token: String::new(),
                chat_ids: vec!["42".into()],
            },
            ..NotifierConfig::default()
        };
        assert!(build_sinks(&config).unwrap().is_empty());
    }
}

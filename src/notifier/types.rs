//! Notification channel configuration

use serde::{Deserialize, Serialize};

/// Contents of the notifications document. Everything defaults to disabled
/// so a fresh install sends nothing until configured.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifierConfig {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub whatsapp: WhatsAppConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Bot token from @BotFather
    #[serde(default)]
    pub token: String,
    /// Chat ids appear as numbers in hand-written documents and as strings
    /// in the Bot API; both shapes are accepted.
    #[serde(default, deserialize_with = "deserialize_chat_ids")]
    pub chat_ids: Vec<String>,
}

fn deserialize_chat_ids<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ChatId {
        Number(i64),
        Text(String),
    }

    let raw = Vec::<ChatId>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|id| match id {
            ChatId::Number(n) => n.to_string(),
            ChatId::Text(s) => s,
        })
        .collect())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WhatsAppConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub recipients: Vec<WhatsAppRecipient>,
}

/// CallMeBot hands out one API key per registered phone number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhatsAppRecipient {
    pub phone: String,
    pub api_key: String,
}

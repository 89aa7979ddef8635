//! Vendor cloud REST client
//!
//! Thin wrapper over the account endpoints: login (with the optional
//! email-code second step), user id lookup, device list and per-device
//! live-stream lookup. Responses are probed as loose JSON because the
//! vendor adds and renames fields between firmware releases.

use std::time::Duration;

use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

use super::types::{CloudDevice, LiveStream, LoginOutcome};

pub const DEFAULT_API_BASE: &str = "https://api.bambulab.com";

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

pub struct CloudApi {
    http: Client,
    base: String,
}

impl CloudApi {
    pub fn new(base: impl Into<String>) -> Result<Self> {
        let http = Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            http,
            base: base.into(),
        })
    }

    /// First login step. A reply without an access token means the account
    /// wants an emailed verification code; one is requested and the caller
    /// gets `NeedsVerification`.
    pub async fn login(&self, email: &str, password: &str) -> Result<LoginOutcome> {
        let reply = self
            .post_login(json!({ "account": email, "password": password }))
            .await?;
        match reply {
            Some(token) => Ok(LoginOutcome::LoggedIn { token }),
            None => {
                self.request_verification_code(email).await?;
                Ok(LoginOutcome::NeedsVerification)
            }
        }
    }

    /// Second login step carrying the emailed code.
    pub async fn login_with_code(&self, email: &str, code: &str) -> Result<LoginOutcome> {
        let reply = self
            .post_login(json!({ "account": email, "code": code }))
            .await?;
        match reply {
            Some(token) => Ok(LoginOutcome::LoggedIn { token }),
            None => Err(Error::Auth("verification code rejected".into())),
        }
    }

    async fn post_login(&self, body: Value) -> Result<Option<String>> {
        let url = format!("{}/v1/user-service/user/login", self.base);
        let response = self.http.post(&url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!(status = %status, body = %text, "Cloud login rejected");
            return Err(Error::Auth(format!(
                "login failed with HTTP {}",
                status.as_u16()
            )));
        }
        let value: Value = response.json().await?;
        Ok(extract_access_token(&value))
    }

    async fn request_verification_code(&self, email: &str) -> Result<()> {
        let url = format!("{}/v1/user-service/user/sendemail/code", self.base);
        let body = json!({ "email": email, "type": "codeLogin" });
        let response = self.http.post(&url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Auth(format!(
                "verification code request failed with HTTP {}",
                status.as_u16()
            )));
        }
        info!(email = %email, "Verification code requested");
        Ok(())
    }

    /// Numeric account uid, needed to build the MQTT username.
    pub async fn get_user_id(&self, token: &str) -> Result<String> {
        let url = format!("{}/v1/design-user-service/my/preference", self.base);
        let response = self.http.get(&url).bearer_auth(token).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Auth(format!(
                "preference lookup failed with HTTP {}",
                status.as_u16()
            )));
        }
        let value: Value = response.json().await?;
        extract_uid(&value).ok_or_else(|| Error::Protocol("preference reply carried no uid".into()))
    }

    /// Cheap token probe against the preference endpoint. `Ok(false)` means
    /// the server answered and refused the token; transport errors bubble up
    /// so an offline start does not look like a revoked token.
    pub async fn validate_token(&self, token: &str) -> Result<bool> {
        let url = format!("{}/v1/design-user-service/my/preference", self.base);
        let response = self.http.get(&url).bearer_auth(token).send().await?;
        Ok(response.status().is_success())
    }

    pub async fn list_devices(&self, token: &str) -> Result<Vec<CloudDevice>> {
        let url = format!("{}/v1/iot-service/api/user/bind", self.base);
        let response = self.http.get(&url).bearer_auth(token).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Network(format!(
                "device list failed with HTTP {}",
                status.as_u16()
            )));
        }
        let value: Value = response.json().await?;
        Ok(parse_device_list(&value))
    }

    /// Live camera feed for one device. Unavailability is a value, not an
    /// error; only transport failures bubble up.
    pub async fn live_stream(
        &self,
        token: &str,
        device_id: &str,
        access_code: &str,
    ) -> Result<LiveStream> {
        let url = format!("{}/v1/iot-service/api/devices/{}/live", self.base, device_id);
        let response = self
            .http
            .get(&url)
            .bearer_auth(token)
            .header("dev-access-code", access_code)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            debug!(device_id = %device_id, status = %status, body = %text, "Live stream refused");
            return Ok(LiveStream::Unavailable {
                reason: format!("HTTP {}", status.as_u16()),
            });
        }
        let value: Value = response.json().await?;
        Ok(parse_live_reply(&value))
    }
}

fn extract_access_token(value: &Value) -> Option<String> {
    value
        .get("accessToken")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

fn extract_uid(value: &Value) -> Option<String> {
    match value.get("uid")? {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn parse_device_list(value: &Value) -> Vec<CloudDevice> {
    value
        .get("devices")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(|d| serde_json::from_value(d.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

fn parse_live_reply(value: &Value) -> LiveStream {
    match value
        .get("url")
        .and_then(Value::as_str)
        .filter(|u| !u.is_empty())
    {
        Some(url) => LiveStream::Available {
            url: url.to_string(),
            token: value
                .get("token")
                .and_then(Value::as_str)
                .map(str::to_string),
        },
        None => LiveStream::Unavailable {
            reason: value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("reply carried no stream url")
                .to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_token_extraction() {
        let ok = json!({ "accessToken": "tok123", "refreshToken": "r" });
        assert_eq!(extract_access_token(&ok).as_deref(), Some("tok123"));

        // 2FA replies come back with code 0 and an empty or missing token.
        let pending = json!({ "code": 0, "accessToken": "" });
        assert_eq!(extract_access_token(&pending), None);
        assert_eq!(extract_access_token(&json!({ "code": 0 })), None);
    }

    #[test]
    fn test_uid_extraction_handles_number_and_string() {
        assert_eq!(
            extract_uid(&json!({ "uid": 1234567890u64 })).as_deref(),
            Some("1234567890")
        );
        assert_eq!(
            extract_uid(&json!({ "uid": "987654" })).as_deref(),
            Some("987654")
        );
        assert_eq!(extract_uid(&json!({ "name": "x" })), None);
    }

    #[test]
    fn test_device_list_parsing() {
        let reply = json!({
            "devices": [
                { "dev_id": "00M09A350100001", "name": "X1C", "dev_access_code": "12345678", "online": true },
                { "dev_id": "03K00B411200002" },
                { "bogus": true }
            ],
            "message": "success"
        });
        let devices = parse_device_list(&reply);
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].dev_id, "00M09A350100001");
        assert!(devices[0].online);
        assert_eq!(devices[1].dev_id, "03K00B411200002");
        assert!(!devices[1].online);

        assert!(parse_device_list(&json!({ "message": "success" })).is_empty());
    }

    #[test]
    fn test_live_reply_parsing() {
        let up = parse_live_reply(&json!({ "url": "rtsps://cloud/live", "token": "tkn" }));
        assert_eq!(
            up,
            LiveStream::Available {
                url: "rtsps://cloud/live".into(),
                token: Some("tkn".into())
            }
        );

        let down = parse_live_reply(&json!({ "message": "device in lan mode" }));
        assert_eq!(
            down,
            LiveStream::Unavailable {
                reason: "device in lan mode".into()
            }
        );
    }
}

//! Typed client for the Evolution API gateway.
//!
//! Normalizes the provider's heterogeneous QR-code response shapes into a
//! single `Option<String>` and classifies HTTP failures so callers can tell
//! "instance is gone" (404) apart from "provider is slow" (timeout).

use crate::config::EvolutionConfig;
use crate::error::ProviderError;
use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::{Client, Method, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;

/// Remote connection state as reported by `/instance/connectionState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Close,
    Connecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Close => "close",
            Self::Connecting => "connecting",
        }
    }

    fn parse(value: Option<&str>) -> Self {
        match value {
            Some("open") => Self::Open,
            Some("connecting") => Self::Connecting,
            // Missing or unknown states count as disconnected.
            _ => Self::Close,
        }
    }
}

#[async_trait]
pub trait WhatsAppProvider: Send + Sync {
    /// Create an instance with QR generation enabled. Returns the QR payload
    /// when the provider includes one in the creation response.
    async fn create_instance(&self, name: &str) -> Result<Option<String>, ProviderError>;

    /// Request a fresh QR code for an existing instance. `Ok(None)` means the
    /// provider accepted the request but the QR is not ready yet and will
    /// arrive via webhook.
    async fn connect_instance(&self, name: &str) -> Result<Option<String>, ProviderError>;

    async fn get_instance_status(&self, name: &str) -> Result<ConnectionState, ProviderError>;

    async fn logout_instance(&self, name: &str) -> Result<(), ProviderError>;

    async fn delete_instance(&self, name: &str) -> Result<(), ProviderError>;

    async fn send_text_message(
        &self,
        name: &str,
        number: &str,
        text: &str,
    ) -> Result<(), ProviderError>;

    async fn send_media(
        &self,
        name: &str,
        number: &str,
        media_url: &str,
        caption: Option<&str>,
    ) -> Result<(), ProviderError>;
}

pub struct EvolutionClient {
    http: Client,
    base_url: String,
    api_key: String,
    timeout_secs: u64,
}

impl EvolutionClient {
    pub fn new(config: &EvolutionConfig) -> Result<Self, ProviderError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            timeout_secs: config.timeout_secs,
        })
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, ProviderError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("Evolution API request: {} {}", method, path);

        let mut req = self
            .http
            .request(method.clone(), &url)
            .header("apikey", &self.api_key);
        if let Some(body) = body {
            req = req.json(&body);
        }

        let response = req.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(self.timeout_secs)
            } else {
                ProviderError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<Value>(&body_text)
                .ok()
                .and_then(|v| {
                    v.get("message")
                        .or_else(|| v.get("error"))
                        .and_then(|m| m.as_str().map(str::to_string))
                })
                .unwrap_or(body_text);

            warn!(
                "Evolution API error: {} {} -> {} ({})",
                method, path, status, message
            );

            return Err(match status {
                StatusCode::FORBIDDEN => ProviderError::Forbidden,
                StatusCode::NOT_FOUND => ProviderError::NotFound,
                _ => ProviderError::Remote {
                    status: status.as_u16(),
                    message,
                },
            });
        }

        // Logout and delete answer 2xx with no body.
        let body_text = response
            .text()
            .await
            .map_err(|e| ProviderError::Transport(format!("failed to read response: {e}")))?;
        if body_text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text)
            .map_err(|e| ProviderError::Transport(format!("invalid JSON response: {e}")))
    }
}

/// Extract a QR payload from any of the shapes the provider is known to use:
/// a bare string, `{"base64": …}`, `{"code": …}`, or the same pair nested
/// under `"qrcode"`. A payload carrying only a `count` field is the
/// provider's "not ready yet" signal, not a QR code, and yields `None`.
pub fn extract_qr(value: &Value) -> Option<String> {
    fn non_empty(v: &Value) -> Option<String> {
        v.as_str().filter(|s| !s.is_empty()).map(str::to_string)
    }

    if let Some(qr) = non_empty(value) {
        return Some(qr);
    }

    let nested = value.get("qrcode");
    if let Some(nested) = nested {
        if let Some(qr) = non_empty(nested) {
            return Some(qr);
        }
        if let Some(qr) = nested.get("base64").and_then(non_empty) {
            return Some(qr);
        }
        if let Some(qr) = nested.get("code").and_then(non_empty) {
            return Some(qr);
        }
    }

    if let Some(qr) = value.get("base64").and_then(non_empty) {
        return Some(qr);
    }
    value.get("code").and_then(non_empty)
}

#[async_trait]
impl WhatsAppProvider for EvolutionClient {
    async fn create_instance(&self, name: &str) -> Result<Option<String>, ProviderError> {
        info!("Creating Evolution instance: {}", name);
        let body = json!({
            "instanceName": name,
            "qrcode": true,
            "integration": "WHATSAPP-BAILEYS",
        });
        let data = self.request(Method::POST, "/instance/create", Some(body)).await?;
        Ok(extract_qr(&data))
    }

    async fn connect_instance(&self, name: &str) -> Result<Option<String>, ProviderError> {
        info!("Requesting QR code for instance: {}", name);
        let data = self
            .request(Method::GET, &format!("/instance/connect/{name}"), None)
            .await?;

        let qr = extract_qr(&data);
        if qr.is_none() {
            debug!(
                "No QR in connect response for {} (keys: {:?}); expecting it via webhook",
                name,
                data.as_object().map(|o| o.keys().collect::<Vec<_>>())
            );
        }
        Ok(qr)
    }

    async fn get_instance_status(&self, name: &str) -> Result<ConnectionState, ProviderError> {
        let data = self
            .request(Method::GET, &format!("/instance/connectionState/{name}"), None)
            .await?;

        // Some Evolution builds nest the state under "instance".
        let state = data
            .get("state")
            .or_else(|| data.get("instance").and_then(|i| i.get("state")))
            .and_then(Value::as_str);
        Ok(ConnectionState::parse(state))
    }

    async fn logout_instance(&self, name: &str) -> Result<(), ProviderError> {
        info!("Logging out instance: {}", name);
        self.request(Method::DELETE, &format!("/instance/logout/{name}"), None)
            .await?;
        Ok(())
    }

    async fn delete_instance(&self, name: &str) -> Result<(), ProviderError> {
        info!("Deleting instance: {}", name);
        self.request(Method::DELETE, &format!("/instance/delete/{name}"), None)
            .await?;
        Ok(())
    }

    async fn send_text_message(
        &self,
        name: &str,
        number: &str,
        text: &str,
    ) -> Result<(), ProviderError> {
        let body = json!({ "number": number, "text": text });
        self.request(Method::POST, &format!("/message/sendText/{name}"), Some(body))
            .await?;
        Ok(())
    }

    async fn send_media(
        &self,
        name: &str,
        number: &str,
        media_url: &str,
        caption: Option<&str>,
    ) -> Result<(), ProviderError> {
        let body = json!({ "number": number, "mediaUrl": media_url, "caption": caption });
        self.request(Method::POST, &format!("/message/sendMedia/{name}"), Some(body))
            .await?;
        Ok(())
    }
}

//! Push dispatch — provider registry and the built-in delivery channels.
//! Supports: Bark (iOS push), generic HTTP webhook.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;

use memocue_core::config::PushConfig;
use memocue_core::error::{MemoCueError, Result};
use memocue_core::traits::PushProvider;
use memocue_core::types::{Device, Priority, PushMessage, PushReceipt};

/// Registry of push providers keyed by lowercase type name.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn PushProvider>>,
}

impl ProviderRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in Bark and webhook providers.
    pub fn with_defaults(config: &PushConfig) -> Result<Self> {
        let mut registry = Self::new();
        registry.register(Arc::new(BarkProvider::new(config)?))?;
        registry.register(Arc::new(WebhookProvider::new(config)?))?;
        Ok(registry)
    }

    /// Register a provider under its own name. Names are unique.
    pub fn register(&mut self, provider: Arc<dyn PushProvider>) -> Result<()> {
        let key = provider.name().to_lowercase();
        if self.providers.contains_key(&key) {
            return Err(MemoCueError::DuplicateProvider(key));
        }
        tracing::info!("📮 Registered push provider: {}", key);
        self.providers.insert(key, provider);
        Ok(())
    }

    /// Look up the provider for a device's `providerType`.
    pub fn get(&self, provider_type: &str) -> Result<Arc<dyn PushProvider>> {
        self.providers
            .get(&provider_type.to_lowercase())
            .cloned()
            .ok_or_else(|| MemoCueError::UnknownProvider(provider_type.to_string()))
    }

    pub fn is_supported(&self, provider_type: &str) -> bool {
        self.providers.contains_key(&provider_type.to_lowercase())
    }

    /// Reject devices whose provider type is not registered.
    pub fn ensure_supported(&self, device: &Device) -> Result<()> {
        if self.is_supported(&device.provider_type) {
            Ok(())
        } else {
            Err(MemoCueError::UnknownProvider(device.provider_type.clone()))
        }
    }

    /// Registered provider names, sorted.
    pub fn available(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }
}

fn build_client(config: &PushConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .user_agent(config.user_agent.as_str())
        .build()
        .map_err(|e| MemoCueError::Http(format!("Failed to build HTTP client: {e}")))
}

#[derive(Debug, Deserialize)]
struct BarkDeviceConfig {
    key: String,
    #[serde(default)]
    server: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BarkResponse {
    code: i64,
    #[serde(default)]
    message: String,
}

/// Bark push: `GET {server}/{key}/{title}/{body}?level=..&sound=..`.
pub struct BarkProvider {
    client: reqwest::Client,
    default_server: String,
}

impl BarkProvider {
    pub fn new(config: &PushConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config)?,
            default_server: config.bark_server.clone(),
        })
    }

    fn request_url(&self, device: &Device, message: &PushMessage) -> Result<Url> {
        let cfg: BarkDeviceConfig = serde_json::from_value(device.config.clone()).map_err(|e| {
            MemoCueError::Dispatch(format!("Invalid Bark config for device {}: {e}", device.id))
        })?;
        let server = cfg.server.as_deref().unwrap_or(&self.default_server);
        bark_url(server, &cfg.key, message)
    }
}

/// Build the Bark request URL; path segments and query values are escaped.
fn bark_url(server: &str, key: &str, message: &PushMessage) -> Result<Url> {
    let mut url = Url::parse(server)
        .map_err(|e| MemoCueError::Dispatch(format!("Invalid Bark server '{server}': {e}")))?;
    url.path_segments_mut()
        .map_err(|_| MemoCueError::Dispatch(format!("Bark server '{server}' cannot be a base URL")))?
        .pop_if_empty()
        .push(key)
        .push(&message.title)
        .push(&message.body);

    {
        let mut query = url.query_pairs_mut();
        query.append_pair("level", bark_level(message.priority));
        let optional = [
            ("sound", &message.sound),
            ("icon", &message.icon),
            ("group", &message.group),
            ("url", &message.url),
        ];
        for (name, value) in optional {
            if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
                query.append_pair(name, value);
            }
        }
    }
    Ok(url)
}

fn bark_level(priority: Priority) -> &'static str {
    match priority {
        Priority::Low => "passive",
        Priority::Normal => "active",
        Priority::High => "timeSensitive",
        Priority::Urgent => "critical",
    }
}

#[async_trait]
impl PushProvider for BarkProvider {
    fn name(&self) -> &str {
        "bark"
    }

    async fn send(&self, device: &Device, message: &PushMessage) -> Result<PushReceipt> {
        let url = self.request_url(device, message)?;
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| MemoCueError::Http(format!("Bark send failed: {e}")))?;

        let status = resp.status();
        let body: BarkResponse = resp
            .json()
            .await
            .map_err(|e| MemoCueError::Dispatch(format!("Bark response {status} unreadable: {e}")))?;
        if body.code == 200 {
            tracing::debug!("✅ Bark push delivered to {}: {}", device.name, message.title);
            Ok(PushReceipt {
                provider: "bark".into(),
                message_id: None,
            })
        } else {
            Err(MemoCueError::Dispatch(format!(
                "Bark error {}: {}",
                body.code, body.message
            )))
        }
    }
}

#[derive(Debug, Deserialize)]
struct WebhookDeviceConfig {
    url: String,
    #[serde(default)]
    headers: HashMap<String, String>,
}

/// Generic HTTP webhook. JSON POST; any 2xx is success.
pub struct WebhookProvider {
    client: reqwest::Client,
}

impl WebhookProvider {
    pub fn new(config: &PushConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config)?,
        })
    }
}

#[async_trait]
impl PushProvider for WebhookProvider {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, device: &Device, message: &PushMessage) -> Result<PushReceipt> {
        let cfg: WebhookDeviceConfig = serde_json::from_value(device.config.clone()).map_err(|e| {
            MemoCueError::Dispatch(format!("Invalid webhook config for device {}: {e}", device.id))
        })?;

        let mut req = self.client.post(&cfg.url).json(&serde_json::json!({
            "title": message.title,
            "body": message.body,
            "url": message.url,
            "priority": message.priority,
            "group": message.group,
            "deviceId": device.id,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }));
        for (key, value) in &cfg.headers {
            req = req.header(key.as_str(), value.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| MemoCueError::Http(format!("Webhook send failed: {e}")))?;

        if resp.status().is_success() {
            tracing::debug!("✅ Webhook delivered to {}: {}", cfg.url, message.title);
            let message_id = resp
                .headers()
                .get("x-request-id")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            Ok(PushReceipt {
                provider: "webhook".into(),
                message_id,
            })
        } else {
            Err(MemoCueError::Dispatch(format!("Webhook error {}", resp.status())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingProvider;

    fn message() -> PushMessage {
        PushMessage {
            title: "Drink water".into(),
            body: "500ml / now".into(),
            url: Some("https://example.com/a?b=c".into()),
            sound: Some("bell".into()),
            group: None,
            icon: Some(String::new()),
            priority: Priority::High,
        }
    }

    #[test]
    fn test_bark_url_encoding() {
        let url = bark_url("https://api.day.app/", "k3y", &message()).unwrap();
        assert_eq!(url.path(), "/k3y/Drink%20water/500ml%20%2F%20now");
        let query: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(query.get("level").map(String::as_str), Some("timeSensitive"));
        assert_eq!(query.get("sound").map(String::as_str), Some("bell"));
        assert_eq!(query.get("url").map(String::as_str), Some("https://example.com/a?b=c"));
        assert!(!query.contains_key("icon"));
        assert!(!query.contains_key("group"));
    }

    #[test]
    fn test_bark_custom_server_path() {
        let url = bark_url("https://push.example.com/bark", "k", &message()).unwrap();
        assert!(url.path().starts_with("/bark/k/"));
    }

    #[test]
    fn test_bark_requires_key() {
        let provider = BarkProvider::new(&PushConfig::default()).unwrap();
        let device = Device {
            id: "d1".into(),
            name: "Phone".into(),
            provider_type: "bark".into(),
            enabled: true,
            config: serde_json::json!({}),
        };
        assert!(matches!(
            provider.request_url(&device, &message()),
            Err(MemoCueError::Dispatch(_))
        ));
    }

    #[test]
    fn test_registry_defaults() {
        let registry = ProviderRegistry::with_defaults(&PushConfig::default()).unwrap();
        assert_eq!(registry.available(), vec!["bark".to_string(), "webhook".to_string()]);
        assert!(registry.is_supported("Bark"));
        assert!(registry.get("BARK").is_ok());
        assert!(matches!(registry.get("pager"), Err(MemoCueError::UnknownProvider(_))));
    }

    #[test]
    fn test_registry_rejects_duplicates_and_unknown_devices() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(RecordingProvider::new("fake"))).unwrap();
        assert!(matches!(
            registry.register(Arc::new(RecordingProvider::new("FAKE"))),
            Err(MemoCueError::DuplicateProvider(_))
        ));

        let device = Device {
            id: "d1".into(),
            name: "Pager".into(),
            provider_type: "pager".into(),
            enabled: true,
            config: serde_json::Value::Null,
        };
        assert!(registry.ensure_supported(&device).is_err());
    }
}

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body_util::Full;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::{error, info, warn};

use crate::config::settings::AlertingConfig;

/// Kinds of events pushed to the webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertEvent {
    AutoBlock,
}

impl AlertEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertEvent::AutoBlock => "auto_block",
        }
    }
}

/// Best-effort webhook notifier. Failures are logged, never returned.
pub struct AlertManager {
    webhook_url: Option<String>,
    enabled: bool,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl AlertManager {
    pub fn new(webhook_url: Option<String>, enabled: bool) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(5))
            .build_http();
        Self {
            webhook_url,
            enabled,
            client,
        }
    }

    /// `None` when alerting is switched off.
    pub fn from_config(config: &AlertingConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        Some(Self::new(config.webhook_url.clone(), true))
    }

    pub async fn send_alert(&self, event: AlertEvent, message: &str) {
        if !self.enabled {
            return;
        }

        let url = match &self.webhook_url {
            Some(u) if !u.is_empty() => u.clone(),
            _ => {
                info!(event = event.as_str(), msg = message, "Alert (no webhook configured)");
                return;
            }
        };

        let body = alert_payload(event, message, Utc::now()).to_string();

        let req = match hyper::Request::builder()
            .method(hyper::Method::POST)
            .uri(&url)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(body)))
        {
            Ok(r) => r,
            Err(e) => {
                error!("Failed to build alert request: {}", e);
                return;
            }
        };

        match tokio::time::timeout(Duration::from_secs(10), self.client.request(req)).await {
            Ok(Ok(resp)) => {
                info!(
                    status = resp.status().as_u16(),
                    event = event.as_str(),
                    "Alert sent to webhook"
                );
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to send alert to webhook");
            }
            Err(_) => {
                warn!("Alert webhook request timed out");
            }
        }
    }
}

fn alert_payload(event: AlertEvent, message: &str, at: DateTime<Utc>) -> serde_json::Value {
    serde_json::json!({
        "event": event.as_str(),
        "message": message,
        "timestamp": at.to_rfc3339(),
        "source": "ipwarden"
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_shape() {
        let at = DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let v = alert_payload(AlertEvent::AutoBlock, "Auto-blocked 1.2.3.4", at);
        assert_eq!(v["event"], "auto_block");
        assert_eq!(v["source"], "ipwarden");
        assert_eq!(v["message"], "Auto-blocked 1.2.3.4");
        assert_eq!(v["timestamp"], "2024-05-01T12:00:00+00:00");
    }

    #[test]
    fn test_disabled_config_yields_none() {
        let config = AlertingConfig {
            enabled: false,
            webhook_url: Some("http://hooks.local/x".into()),
        };
        assert!(AlertManager::from_config(&config).is_none());
    }

    #[tokio::test]
    async fn test_missing_webhook_is_noop() {
        let manager = AlertManager::new(None, true);
        manager.send_alert(AlertEvent::AutoBlock, "nothing to see").await;
    }
}

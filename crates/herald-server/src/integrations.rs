//! Built-in delivery integrations and their factory.
//!
//! Two kinds ship with the server: `webhook` posts the alert as JSON to
//! a configured URL, `log` writes it to the process log. The factory
//! validates kind-specific settings up front so that a bad config fails
//! at build time rather than at delivery time.

use std::time::Duration;

use serde_json::json;
use tracing::info;

use herald_core::{
    Integration, IntegrationConfig, IntegrationError, IntegrationFactory, NotifyError, TestAlert,
};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Posts alerts as JSON to an HTTP endpoint.
pub struct WebhookIntegration {
    url: String,
    client: reqwest::Client,
}

impl WebhookIntegration {
    fn from_config(config: &IntegrationConfig) -> Result<Self, IntegrationError> {
        let url = config
            .settings
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or(IntegrationError::MissingSetting {
                kind: "webhook".to_string(),
                field: "url".to_string(),
            })?;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(IntegrationError::InvalidSetting {
                kind: "webhook".to_string(),
                field: "url".to_string(),
                reason: "must be an http or https URL".to_string(),
            });
        }
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .map_err(|e| IntegrationError::InvalidSetting {
                kind: "webhook".to_string(),
                field: "url".to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            url: url.to_string(),
            client,
        })
    }
}

#[async_trait::async_trait]
impl Integration for WebhookIntegration {
    fn kind(&self) -> &str {
        "webhook"
    }

    async fn notify(&self, alert: &TestAlert) -> Result<(), NotifyError> {
        let body = json!({
            "labels": alert.labels,
            "annotations": alert.annotations,
            "startsAt": alert.starts_at,
        });
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    NotifyError::Timeout
                } else {
                    NotifyError::Delivery(e.to_string())
                }
            })?;
        if !response.status().is_success() {
            return Err(NotifyError::Delivery(format!(
                "endpoint returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Writes alerts to the process log. Never fails; useful as a sink in
/// development and in tests.
pub struct LogIntegration;

#[async_trait::async_trait]
impl Integration for LogIntegration {
    fn kind(&self) -> &str {
        "log"
    }

    async fn notify(&self, alert: &TestAlert) -> Result<(), NotifyError> {
        info!(labels = ?alert.labels, starts_at = alert.starts_at, "alert delivered to log");
        Ok(())
    }
}

/// Factory for the built-in integration kinds.
#[derive(Default)]
pub struct DefaultIntegrationFactory;

impl DefaultIntegrationFactory {
    pub fn new() -> Self {
        Self
    }
}

impl IntegrationFactory for DefaultIntegrationFactory {
    fn build(&self, config: &IntegrationConfig) -> Result<Box<dyn Integration>, IntegrationError> {
        match config.kind.as_str() {
            "webhook" => Ok(Box::new(WebhookIntegration::from_config(config)?)),
            "log" => Ok(Box::new(LogIntegration)),
            other => Err(IntegrationError::UnknownKind(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(kind: &str, settings: serde_json::Value) -> IntegrationConfig {
        IntegrationConfig {
            kind: kind.to_string(),
            settings,
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let err = DefaultIntegrationFactory::new()
            .build(&config("pager", json!({})))
            .err()
            .unwrap();
        assert!(matches!(err, IntegrationError::UnknownKind(kind) if kind == "pager"));
    }

    #[test]
    fn webhook_requires_url() {
        let err = DefaultIntegrationFactory::new()
            .build(&config("webhook", json!({})))
            .err()
            .unwrap();
        assert!(matches!(err, IntegrationError::MissingSetting { ref field, .. } if field == "url"));
    }

    #[test]
    fn webhook_rejects_non_http_url() {
        let err = DefaultIntegrationFactory::new()
            .build(&config("webhook", json!({"url": "ftp://host/hook"})))
            .err()
            .unwrap();
        assert!(matches!(err, IntegrationError::InvalidSetting { .. }));
    }

    #[test]
    fn webhook_builds_with_valid_url() {
        let integration = DefaultIntegrationFactory::new()
            .build(&config("webhook", json!({"url": "http://localhost:9/hook"})))
            .unwrap();
        assert_eq!(integration.kind(), "webhook");
    }

    #[tokio::test]
    async fn log_integration_always_succeeds() {
        let integration = DefaultIntegrationFactory::new()
            .build(&config("log", json!({})))
            .unwrap();
        let alert = TestAlert::synthetic("ops");
        assert!(integration.notify(&alert).await.is_ok());
    }

    #[tokio::test]
    async fn webhook_connect_failure_is_a_delivery_error() {
        // port 9 (discard) is almost certainly closed
        let integration = DefaultIntegrationFactory::new()
            .build(&config("webhook", json!({"url": "http://127.0.0.1:9/hook"})))
            .unwrap();
        let err = integration
            .notify(&TestAlert::synthetic("ops"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, NotifyError::Delivery(_) | NotifyError::Timeout));
    }
}

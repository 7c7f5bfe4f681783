//! Processing engine HTTP API.
//!
//! The processing engine queues resources for extraction and hands the
//! results back through a cursor-based pull endpoint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use ingest_types::PullSettings;

use crate::error::ProcessingError;

/// Header carrying the service account key.
pub const SERVICE_ACCOUNT_HEADER: &str = "X-STF-NUAKEY";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PullStatus {
    Ok,
    Empty,
    Error,
}

/// One pull answer. Payloads are base64-encoded broker messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullResponse {
    pub status: PullStatus,
    #[serde(default)]
    pub payload: Option<String>,
    #[serde(default)]
    pub payloads: Vec<String>,
    /// Position to resume from after these payloads are handled
    #[serde(default)]
    pub cursor: Option<i64>,
}

impl PullResponse {
    pub fn empty() -> Self {
        Self {
            status: PullStatus::Empty,
            payload: None,
            payloads: Vec::new(),
            cursor: None,
        }
    }

    /// Every payload of the answer, in order.
    pub fn all_payloads(&self) -> impl Iterator<Item = &String> {
        self.payload.iter().chain(self.payloads.iter())
    }
}

/// Queue statistics of one knowledge box.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingStats {
    /// Resources queued or in flight
    pub incomplete: i64,
    #[serde(default)]
    pub scheduled: i64,
}

#[async_trait]
pub trait ProcessingClient: Send + Sync {
    async fn pull(
        &self,
        partition: &str,
        cursor: Option<i64>,
        timeout: Duration,
    ) -> Result<PullResponse, ProcessingError>;

    async fn stats(&self, kbid: &str, timeout: Duration) -> Result<ProcessingStats, ProcessingError>;
}

#[derive(Debug, Clone)]
pub struct ProcessingClientConfig {
    pub base_url: String,
    pub service_account: Option<SecretString>,
    /// Ceiling for every request; per-call timeouts are added on top of it
    pub timeout: Duration,
}

impl ProcessingClientConfig {
    /// Config from pull settings; `None` when no processing URL is set.
    pub fn from_settings(settings: &PullSettings) -> Option<Self> {
        let base_url = settings.processing_url.clone()?;
        Some(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            service_account: settings
                .service_account
                .clone()
                .map(SecretString::from),
            timeout: settings.api_timeout() + Duration::from_secs(5),
        })
    }
}

pub struct HttpProcessingClient {
    client: Client,
    config: ProcessingClientConfig,
}

impl HttpProcessingClient {
    pub fn new(config: ProcessingClientConfig) -> Result<Self, ProcessingError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProcessingError::Config(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/{}", self.config.base_url, path);
        let request = self.client.get(url);
        match &self.config.service_account {
            Some(key) => request.header(
                SERVICE_ACCOUNT_HEADER,
                format!("Bearer {}", key.expose_secret()),
            ),
            None => request,
        }
    }

    async fn send<T: for<'de> Deserialize<'de>>(
        request: reqwest::RequestBuilder,
    ) -> Result<T, ProcessingError> {
        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProcessingError::Status { status, body });
        }
        response
            .json()
            .await
            .map_err(|e| ProcessingError::Parse(e.to_string()))
    }
}

#[async_trait]
impl ProcessingClient for HttpProcessingClient {
    async fn pull(
        &self,
        partition: &str,
        cursor: Option<i64>,
        timeout: Duration,
    ) -> Result<PullResponse, ProcessingError> {
        let mut query = vec![
            ("partition", partition.to_string()),
            ("timeout", timeout.as_secs().to_string()),
        ];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.to_string()));
        }
        debug!(partition = %partition, cursor = ?cursor, "Pulling from processing");
        Self::send(
            self.get("api/v1/pull")
                .query(&query)
                .timeout(timeout + Duration::from_secs(5)),
        )
        .await
    }

    async fn stats(&self, kbid: &str, timeout: Duration) -> Result<ProcessingStats, ProcessingError> {
        Self::send(
            self.get("api/v1/stats")
                .query(&[("kbid", kbid)])
                .timeout(timeout),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pull_response_payload_order() {
        let response: PullResponse = serde_json::from_str(
            r#"{"status": "ok", "payload": "YQ==", "payloads": ["Yg==", "Yw=="], "cursor": 12}"#,
        )
        .unwrap();
        assert_eq!(response.status, PullStatus::Ok);
        assert_eq!(response.cursor, Some(12));
        let payloads: Vec<&String> = response.all_payloads().collect();
        assert_eq!(payloads, vec!["YQ==", "Yg==", "Yw=="]);

        let empty: PullResponse = serde_json::from_str(r#"{"status": "empty"}"#).unwrap();
        assert_eq!(empty, PullResponse::empty());
    }

    #[test]
    fn test_config_from_settings() {
        let mut settings = PullSettings::default();
        assert!(ProcessingClientConfig::from_settings(&settings).is_none());

        settings.processing_url = Some("http://processing:8080/".into());
        settings.service_account = Some("secret-key".into());
        let config = ProcessingClientConfig::from_settings(&settings).unwrap();
        assert_eq!(config.base_url, "http://processing:8080");
        assert_eq!(
            config.service_account.unwrap().expose_secret(),
            "secret-key"
        );
        assert!(HttpProcessingClient::new(ProcessingClientConfig {
            base_url: "http://localhost".into(),
            service_account: None,
            timeout: Duration::from_secs(1),
        })
        .is_ok());
    }
}

//! HTTP transport against the `/sync/upload` and `/sync/download` endpoints.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::debug;

use crate::config::Config;
use crate::error::SyncError;

use super::protocol::{DownloadResponse, SyncData, UploadRequest, UploadResponse};
use super::{Ack, Delta, RemoteDelta, Transport, TransportError};

#[derive(Debug, Clone)]
pub struct RestTransport {
    client: reqwest::Client,
    endpoint: String,
    user_id: String,
    api_key: Option<String>,
    device_id: Option<String>,
}

impl RestTransport {
    /// Creates a transport whose requests all time out after `timeout`.
    pub fn new(
        endpoint: impl Into<String>,
        user_id: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            user_id: user_id.into(),
            api_key,
            device_id: None,
        })
    }

    /// Tags uploads so the server does not announce them back to this device.
    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn from_config(config: &Config) -> Result<Self, SyncError> {
        config.sync.validate()?;
        let transport = Self::new(
            config.sync.endpoint()?,
            config.user_id()?,
            config.sync.api_key.clone(),
            config.sync.request_timeout(),
        )?;
        Ok(transport)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Builds an HTTP URL for a given path.
    fn build_http_url(&self, path: &str) -> String {
        // Convert ws(s) to http(s) if needed
        let base_url = if self.endpoint.starts_with("ws://") {
            self.endpoint.replacen("ws://", "http://", 1)
        } else if self.endpoint.starts_with("wss://") {
            self.endpoint.replacen("wss://", "https://", 1)
        } else if !self.endpoint.starts_with("http://") && !self.endpoint.starts_with("https://") {
            format!("http://{}", self.endpoint)
        } else {
            self.endpoint.clone()
        };

        format!("{}{}", base_url.trim_end_matches('/'), path)
    }

    fn download_url(&self, since: Option<DateTime<Utc>>) -> String {
        let mut url = format!(
            "{}?userId={}",
            self.build_http_url("/sync/download"),
            urlencoding::encode(&self.user_id)
        );
        if let Some(since) = since {
            let stamp = since.to_rfc3339_opts(SecondsFormat::AutoSi, true);
            url.push_str("&lastSync=");
            url.push_str(&urlencoding::encode(&stamp));
        }
        url
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("Authorization", format!("Bearer {}", key)),
            None => request,
        }
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(TransportError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl Transport for RestTransport {
    async fn upload(
        &self,
        delta: &Delta,
        last_sync: Option<DateTime<Utc>>,
    ) -> Result<Ack, TransportError> {
        let body = UploadRequest {
            user_id: self.user_id.clone(),
            data: SyncData::from(delta),
            last_sync_timestamp: last_sync,
            device_id: self.device_id.clone(),
        };
        debug!(records = delta.len(), "Uploading delta");

        let request = self
            .client
            .post(self.build_http_url("/sync/upload"))
            .json(&body);
        let response = check_status(self.authorize(request).send().await?).await?;
        let reply: UploadResponse = response.json().await?;

        if !reply.success {
            return Err(TransportError::Rejected(reply.errors));
        }
        Ok(Ack {
            errors: reply.errors,
        })
    }

    async fn download(&self, since: Option<DateTime<Utc>>) -> Result<RemoteDelta, TransportError> {
        let request = self.client.get(self.download_url(since));
        let response = check_status(self.authorize(request).send().await?).await?;
        let reply: DownloadResponse = response.json().await?;
        debug!(
            records = reply.data.entities.len() + reply.data.deleted.len(),
            "Downloaded remote delta"
        );

        Ok(RemoteDelta {
            delta: reply.data.into(),
            errors: reply.errors,
        })
    }
}

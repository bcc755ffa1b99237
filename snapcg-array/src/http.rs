//! HTTP transport
//!
//! `reqwest` client for the array's management REST API. Every request is
//! scoped to `<api_url>/storage-systems/<ssid>/` and sent with basic auth.

use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::transport::{ArrayResponse, ArrayTransport, Method, Result, TransportError};

/// Connection parameters for [`HttpTransport`]
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    /// REST API root, e.g. `https://192.168.1.100:8443/devmgr/v2`
    pub api_url: String,
    /// Storage system id
    pub ssid: String,
    pub username: String,
    pub password: String,
    /// Verify the array's TLS certificate
    pub validate_certs: bool,
    /// Per-request timeout
    pub timeout: Duration,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            api_url: "https://localhost:8443/devmgr/v2".to_string(),
            ssid: "1".to_string(),
            username: "admin".to_string(),
            password: String::new(),
            validate_certs: true,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Array transport over HTTPS
pub struct HttpTransport {
    client: Client,
    base_url: String,
    username: String,
    password: String,
}

impl HttpTransport {
    /// Create a transport for the given storage system
    pub fn new(config: HttpTransportConfig) -> Result<Self> {
        if !(config.api_url.starts_with("http://") || config.api_url.starts_with("https://")) {
            return Err(TransportError::Config(format!(
                "Protocol must be http or https. URL [{}]",
                config.api_url
            )));
        }
        if config.ssid.is_empty() {
            return Err(TransportError::Config("Storage system id must not be empty".to_string()));
        }

        let mut builder = Client::builder().timeout(config.timeout);
        if !config.validate_certs {
            warn!("Array certificate verification disabled");
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder
            .build()
            .map_err(|e| TransportError::Config(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url(&config.api_url, &config.ssid),
            username: config.username,
            password: config.password,
        })
    }

    /// Storage-system-scoped base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

fn base_url(api_url: &str, ssid: &str) -> String {
    format!("{}/storage-systems/{}/", api_url.trim_end_matches('/'), ssid)
}

#[async_trait::async_trait]
impl ArrayTransport for HttpTransport {
    async fn request(&self, path: &str, method: Method, data: Option<Value>) -> Result<ArrayResponse> {
        let url = format!("{}{}", self.base_url, path.trim_start_matches('/'));
        let mut req = match method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
            Method::Delete => self.client.delete(&url),
        };

        req = req
            .basic_auth(&self.username, Some(&self.password))
            .header("Accept", "application/json")
            .header("Content-Type", "application/json");

        // Key-value values are plain strings and go out verbatim.
        req = match data {
            Some(Value::String(raw)) => req.body(raw),
            Some(json) => req.json(&json),
            None => req,
        };

        let response = req
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;

        debug!(method = %method, url = %url, status, "Array response");

        let body = if text.trim().is_empty() {
            None
        } else {
            Some(serde_json::from_str(&text).unwrap_or(Value::String(text)))
        };

        Ok(ArrayResponse::new(status, body))
    }
}

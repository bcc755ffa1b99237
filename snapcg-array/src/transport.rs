//! Array transport contract
//!
//! The engine talks to the array through a single primitive:
//! `request(path, method, data) -> (status, body)`. Paths are relative to the
//! storage-system-scoped base path. [`ArrayClient`] layers status checking
//! and typed decoding on top of any [`ArrayTransport`].

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Transport errors
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Array returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to decode response from [{path}]: {message}")]
    Decode { path: String, message: String },

    #[error("Transport configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// HTTP methods used against the array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw response: status code and optional JSON body
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayResponse {
    pub status: u16,
    pub body: Option<Value>,
}

impl ArrayResponse {
    pub fn new(status: u16, body: Option<Value>) -> Self {
        Self { status, body }
    }

    pub fn is_success(&self) -> bool {
        self.status < 400
    }
}

/// Request/response primitive to the array's management REST API
#[async_trait::async_trait]
pub trait ArrayTransport: Send + Sync {
    /// Issue one request. Errors only on transport failure; HTTP error
    /// statuses are returned as responses.
    async fn request(&self, path: &str, method: Method, data: Option<Value>)
        -> Result<ArrayResponse>;
}

/// Status-checking, decoding wrapper around a transport
#[derive(Clone)]
pub struct ArrayClient {
    transport: Arc<dyn ArrayTransport>,
}

impl ArrayClient {
    pub fn new(transport: Arc<dyn ArrayTransport>) -> Self {
        Self { transport }
    }

    /// Issue a request and fail on statuses >= 400
    pub async fn call(&self, path: &str, method: Method, data: Option<Value>) -> Result<Option<Value>> {
        debug!(method = %method, path = %path, "Array request");
        let response = self.transport.request(path, method, data).await?;

        if response.is_success() {
            Ok(response.body)
        } else {
            let body = response
                .body
                .map(|b| b.to_string())
                .unwrap_or_default();
            Err(TransportError::Status {
                status: response.status,
                body,
            })
        }
    }

    /// GET and decode a typed body
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let body = self.call(path, Method::Get, None).await?;
        decode(path, body)
    }

    /// POST and decode a typed body
    pub async fn post<T: DeserializeOwned>(&self, path: &str, data: Option<Value>) -> Result<T> {
        let body = self.call(path, Method::Post, data).await?;
        decode(path, body)
    }

    /// POST ignoring the response body
    pub async fn post_unit(&self, path: &str, data: Option<Value>) -> Result<()> {
        self.call(path, Method::Post, data).await.map(|_| ())
    }

    /// DELETE ignoring the response body
    pub async fn delete(&self, path: &str) -> Result<()> {
        self.call(path, Method::Delete, None).await.map(|_| ())
    }
}

fn decode<T: DeserializeOwned>(path: &str, body: Option<Value>) -> Result<T> {
    serde_json::from_value(body.unwrap_or(Value::Null)).map_err(|e| TransportError::Decode {
        path: path.to_string(),
        message: e.to_string(),
    })
}

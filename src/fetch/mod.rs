pub mod peeringdb;
pub mod retry;
pub mod ripestat;
pub mod waves;

use std::time::Duration;

use reqwest::header::RETRY_AFTER;
use serde::de::DeserializeOwned;

use crate::shared::FetchError;

pub use peeringdb::PeeringDbClient;
pub use retry::{with_retry, RetryPolicy};
pub use ripestat::RipeStatClient;
pub use waves::{chunk_prefixes, Progress, WaveOutcome, WaveSummary, Waves};

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub url: String,
    pub query: Vec<(String, String)>,
    pub timeout: Duration,
}

impl HttpRequest {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        HttpRequest {
            url: url.into(),
            query: Vec::new(),
            timeout,
        }
    }

    pub fn param(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub retry_after: Option<Duration>,
    pub body: String,
}

impl HttpResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        HttpResponse {
            status: 200,
            retry_after: None,
            body: body.into(),
        }
    }

    /// Maps throttling and error statuses onto [`FetchError`], then decodes the body.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
        match self.status {
            429 => Err(FetchError::RateLimited {
                retry_after: self.retry_after,
            }),
            200..=299 => {
                serde_json::from_str(&self.body).map_err(|e| FetchError::Decode(e.to_string()))
            }
            code => Err(FetchError::Status(code)),
        }
    }
}

/// The seam between the service clients and the HTTP stack.
pub trait Transport: Send + Sync {
    /// Performs one GET. Only connection-level failures are errors; any HTTP
    /// status comes back as a response.
    fn get(&self, request: &HttpRequest) -> Result<HttpResponse, FetchError>;
}

pub struct ReqwestTransport {
    client: reqwest::blocking::Client,
}

impl ReqwestTransport {
    pub fn new(user_agent: &str) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        Ok(ReqwestTransport { client })
    }
}

impl Transport for ReqwestTransport {
    fn get(&self, request: &HttpRequest) -> Result<HttpResponse, FetchError> {
        let response = self
            .client
            .get(&request.url)
            .query(&request.query)
            .timeout(request.timeout)
            .send()
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response
            .text()
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        Ok(HttpResponse {
            status,
            retry_after,
            body,
        })
    }
}

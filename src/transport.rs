use async_trait::async_trait;
use rand::Rng;
use reqwest::{Client, Method};
use serde_json::Value;
use std::time::Duration;
use tokio::time::sleep;

use crate::error::{KininError, Result};

const MAX_ATTEMPTS: u8 = 3;
const MAX_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
}

impl HttpMethod {
    fn as_reqwest(&self) -> Method {
        match self {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
        }
    }
}

/// One API call, relative to the configured base URL
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: HttpMethod,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub bearer: Option<String>,
    pub body: Option<Value>,
    /// Safe to resend after a connection failure (reads, or writes the
    /// server dedupes by client request id)
    pub retry_safe: bool,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            path: path.into(),
            query: Vec::new(),
            bearer: None,
            body: None,
            retry_safe: true,
        }
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: HttpMethod::Post,
            path: path.into(),
            query: Vec::new(),
            bearer: None,
            body: Some(body),
            retry_safe: false,
        }
    }

    pub fn put(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: HttpMethod::Put,
            body: Some(body),
            retry_safe: false,
            ..Self::get(path)
        }
    }

    pub fn query(mut self, key: &str, value: &str) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn bearer(mut self, token: Option<String>) -> Self {
        self.bearer = token;
        self
    }

    pub fn retry_safe(mut self, safe: bool) -> Self {
        self.retry_safe = safe;
        self
    }
}

/// Status code and body text, before envelope decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub text: String,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, req: &ApiRequest) -> Result<RawResponse>;
}

pub struct HttpTransport {
    client: Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send_once(&self, req: &ApiRequest) -> std::result::Result<RawResponse, reqwest::Error> {
        let url = format!("{}{}", self.base_url, req.path);
        let mut builder = self.client.request(req.method.as_reqwest(), &url);
        if !req.query.is_empty() {
            builder = builder.query(&req.query);
        }
        if let Some(token) = &req.bearer {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }
        if let Some(body) = &req.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        Ok(RawResponse { status, text })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, req: &ApiRequest) -> Result<RawResponse> {
        let attempts_allowed = if req.retry_safe { MAX_ATTEMPTS } else { 1 };
        let mut attempts = 0;

        loop {
            attempts += 1;
            tracing::debug!(method = ?req.method, path = %req.path, attempt = attempts, "Sending API request");

            match self.send_once(req).await {
                Ok(response) => {
                    tracing::debug!(path = %req.path, status = response.status, "API response received");
                    return Ok(response);
                }
                // Only connection-level failures are retried; HTTP errors are
                // returned to the caller for classification.
                Err(e) if attempts < attempts_allowed && (e.is_connect() || e.is_timeout()) => {
                    tracing::debug!("Request to {} failed ({}), retrying", req.path, e);
                }
                Err(e) => {
                    return Err(KininError::Http(e));
                }
            }

            // Exponential backoff with jitter
            let base_delay = Duration::from_millis(200 * 2u64.pow(attempts.saturating_sub(1) as u32));
            let jitter = rand::thread_rng().gen_range(0.8..=1.2);
            let delay = Duration::from_millis((base_delay.as_millis() as f64 * jitter) as u64);
            sleep(std::cmp::min(delay, MAX_RETRY_DELAY)).await;
        }
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scripted transport: replays canned responses and records every request
    pub struct MockTransport {
        responses: Mutex<VecDeque<Result<RawResponse>>>,
        requests: Mutex<Vec<ApiRequest>>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            MockTransport {
                responses: Mutex::new(VecDeque::new()),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn respond(self, status: u16, body: Value) -> Self {
            self.respond_text(status, &body.to_string())
        }

        /// Wraps `body` the way the proxying gateway does
        pub fn respond_enveloped(self, status: u16, body: Value) -> Self {
            let wrapped = serde_json::json!({"statusCode": status, "body": body.to_string()});
            self.respond_text(status, &wrapped.to_string())
        }

        pub fn respond_text(self, status: u16, text: &str) -> Self {
            self.responses
                .lock()
                .expect("Mock transport mutex should not be poisoned")
                .push_back(Ok(RawResponse {
                    status,
                    text: text.to_string(),
                }));
            self
        }

        pub fn requests(&self) -> Vec<ApiRequest> {
            self.requests
                .lock()
                .expect("Mock transport mutex should not be poisoned")
                .clone()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&self, req: &ApiRequest) -> Result<RawResponse> {
            self.requests
                .lock()
                .expect("Mock transport mutex should not be poisoned")
                .push(req.clone());
            self.responses
                .lock()
                .expect("Mock transport mutex should not be poisoned")
                .pop_front()
                .unwrap_or_else(|| Err(KininError::Internal("No more mock responses".to_string())))
        }
    }
}

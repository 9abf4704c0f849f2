//! Web/HTTP transport - outbound step requests via reqwest
//!
//! Executes requests directly in-process. It supports:
//! - GET, POST, PUT, PATCH, DELETE, HEAD, OPTIONS
//! - Authentication (Bearer, Basic, API Key) applied to every request
//! - Default headers and an optional base URL for relative step URLs
//! - JSON or text bodies, JSON-or-text response parsing
//!
//! Each request is attempted exactly once.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{BridgeError, HttpTransport, TransportRequest, TransportResponse};
use crate::workflow::{WebAuthConfig, WebConfig};

#[derive(Debug)]
pub struct ReqwestTransport {
    config: WebConfig,
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: WebConfig) -> Result<Self, BridgeError> {
        let mut client_builder = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout))
            .redirect(if config.follow_redirects {
                reqwest::redirect::Policy::default()
            } else {
                reqwest::redirect::Policy::none()
            });

        if !config.validate_ssl {
            client_builder = client_builder.danger_accept_invalid_certs(true);
        }

        let client = client_builder
            .build()
            .map_err(|e| BridgeError::StartupFailed(e.to_string()))?;

        Ok(Self { config, client })
    }

    pub fn from_config(config: &WebConfig) -> Result<Self, BridgeError> {
        Self::new(config.clone())
    }

    /// Absolute URLs pass through; relative ones are joined to `base_url`
    fn build_url(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            return url.to_string();
        }

        match &self.config.base_url {
            Some(base) => {
                let base = base.trim_end_matches('/');
                if url.starts_with('/') {
                    format!("{}{}", base, url)
                } else {
                    format!("{}/{}", base, url)
                }
            }
            None => url.to_string(),
        }
    }

    fn apply_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.auth {
            Some(WebAuthConfig::Bearer { token }) => {
                request.header("Authorization", format!("Bearer {}", token))
            }
            Some(WebAuthConfig::Basic { username, password }) => {
                request.basic_auth(username, Some(password))
            }
            Some(WebAuthConfig::ApiKey { header, key }) => request.header(header, key),
            None => request,
        }
    }

    fn apply_headers(
        &self,
        mut request: reqwest::RequestBuilder,
        extra_headers: &HashMap<String, String>,
    ) -> reqwest::RequestBuilder {
        for (key, value) in &self.config.headers {
            request = request.header(key, value);
        }

        for (key, value) in extra_headers {
            request = request.header(key, value);
        }

        request
    }

    fn method(method: &str) -> Result<reqwest::Method, BridgeError> {
        match method.to_uppercase().as_str() {
            "GET" => Ok(reqwest::Method::GET),
            "POST" => Ok(reqwest::Method::POST),
            "PUT" => Ok(reqwest::Method::PUT),
            "PATCH" => Ok(reqwest::Method::PATCH),
            "DELETE" => Ok(reqwest::Method::DELETE),
            "HEAD" => Ok(reqwest::Method::HEAD),
            "OPTIONS" => Ok(reqwest::Method::OPTIONS),
            _ => Err(BridgeError::UnsupportedMethod(method.to_string())),
        }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, req: &TransportRequest) -> Result<TransportResponse, BridgeError> {
        let url = self.build_url(&req.url);
        let method = Self::method(&req.method)?;

        let mut request = self
            .client
            .request(method, &url)
            .timeout(Duration::from_millis(req.timeout_ms));

        request = self.apply_auth(request);
        request = self.apply_headers(request, &req.headers);

        match &req.body {
            Some(Value::String(text)) => request = request.body(text.clone()),
            Some(Value::Null) | None => {}
            Some(body) => request = request.json(body),
        }

        debug!("Executing {} {}", req.method, url);
        let start = Instant::now();

        let response = request.send().await.map_err(|e| {
            warn!("Request failed: {}", e);
            if e.is_timeout() {
                BridgeError::Timeout(req.timeout_ms)
            } else {
                BridgeError::RequestFailed(e.to_string())
            }
        })?;

        let status = response.status();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
            .collect();

        let body_text = response
            .text()
            .await
            .map_err(|e| BridgeError::RequestFailed(e.to_string()))?;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let data: Value = if body_text.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&body_text).unwrap_or(Value::String(body_text))
        };

        info!("{} {} -> {} ({}ms)", req.method, url, status.as_u16(), elapsed_ms);

        let status_text = status.canonical_reason().unwrap_or("").to_string();
        let success = status.is_success();
        Ok(TransportResponse {
            success,
            status: status.as_u16(),
            error: (!success).then(|| format!("HTTP {} {}", status.as_u16(), status_text)),
            status_text,
            headers,
            data,
            elapsed_ms,
        })
    }
}

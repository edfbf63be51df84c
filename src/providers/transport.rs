//! Request primitive for the open-platform API.
//!
//! `Transport` is the seam between the provider and HTTP: one call for
//! structured API requests (path + JSON body + optional bearer token, raw
//! bytes back) and one for raw chunk PUTs against one-time upload URLs.
//! `ReqwestTransport` is the production implementation; tests script their own.

use async_trait::async_trait;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

use super::token::TokenManager;
use super::ProviderError;

/// Header value the open platform expects on every API call
const PLATFORM: &str = "open_platform";

/// One structured API request
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    /// Path relative to the API base, e.g. `/upload/v1/file/create`
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    pub token: Option<SecretString>,
}

impl ApiRequest {
    pub fn new(method: Method, path: &str) -> Self {
        Self {
            method,
            path: path.to_string(),
            query: Vec::new(),
            body: None,
            token: None,
        }
    }

    pub fn post(path: &str, body: Value) -> Self {
        Self::new(Method::POST, path).with_body(body)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_query(mut self, key: &str, value: &str) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn with_token(mut self, token: SecretString) -> Self {
        self.token = Some(token);
        self
    }
}

/// HTTP transport contract
#[async_trait]
pub trait Transport: Send + Sync {
    /// Execute an API request and return the raw response body.
    ///
    /// Non-2xx responses fail with `ProviderError::Api` when the body carries
    /// a `{code, message}` object, `NetworkError` otherwise.
    async fn request(&self, req: ApiRequest) -> Result<Vec<u8>, ProviderError>;

    /// PUT raw bytes to an absolute one-time URL, returning the HTTP status.
    async fn put_bytes(&self, url: &str, body: Vec<u8>) -> Result<u16, ProviderError>;
}

/// reqwest-backed transport
pub struct ReqwestTransport {
    client: reqwest::Client,
    api_base: String,
}

impl ReqwestTransport {
    pub fn new(api_base: &str, timeout: Duration) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ProviderError::NetworkError(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
        })
    }

    fn build_url(&self, req: &ApiRequest) -> Result<url::Url, ProviderError> {
        let mut url = url::Url::parse(&format!("{}{}", self.api_base, req.path))
            .map_err(|e| ProviderError::InvalidConfig(format!("Invalid API URL: {}", e)))?;
        if !req.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &req.query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn request(&self, req: ApiRequest) -> Result<Vec<u8>, ProviderError> {
        let url = self.build_url(&req)?;
        let mut builder = self
            .client
            .request(req.method.clone(), url)
            .header("Platform", PLATFORM);

        if let Some(ref token) = req.token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
                .map_err(|_| ProviderError::AuthenticationFailed("Access token contains invalid characters".to_string()))?;
            builder = builder.header(AUTHORIZATION, value);
        }
        if let Some(ref body) = req.body {
            builder = builder
                .header(CONTENT_TYPE, "application/json")
                .body(body.to_string());
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(format!("{} {}: {}", req.method, req.path, e)))?;
        let status = resp.status();
        let body = resp
            .bytes()
            .await
            .map_err(|e| ProviderError::NetworkError(format!("{} {}: {}", req.method, req.path, e)))?
            .to_vec();

        if !status.is_success() {
            error!("[123open] request error {} {}: {}", req.method, req.path, String::from_utf8_lossy(&body));
            return Err(error_from_body(status.as_u16(), &body));
        }
        debug!("[123open] {} {} -> {} ({} bytes)", req.method, req.path, status, body.len());
        Ok(body)
    }

    async fn put_bytes(&self, url: &str, body: Vec<u8>) -> Result<u16, ProviderError> {
        let resp = self
            .client
            .put(url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;
        Ok(resp.status().as_u16())
    }
}

/// Map a failed HTTP response to an error, preferring the backend's own
/// `{code, message}` object.
fn error_from_body(status: u16, body: &[u8]) -> ProviderError {
    if let Ok(value) = serde_json::from_slice::<Value>(body) {
        if let Err(e) = check_envelope(&value) {
            return e;
        }
        if let Some(message) = value.get("message").and_then(Value::as_str) {
            return ProviderError::Api {
                code: status as i64,
                message: message.to_string(),
            };
        }
    }
    ProviderError::NetworkError(format!("HTTP {}", status))
}

/// Read the envelope's `code` (integer or string). Zero and empty mean success.
pub(crate) fn envelope_code(value: &Value) -> Option<i64> {
    match value.get("code")? {
        Value::Number(n) => n.as_i64().filter(|c| *c != 0),
        Value::String(s) if s.is_empty() || s == "0" => None,
        Value::String(s) => Some(s.parse().unwrap_or(-1)),
        _ => None,
    }
}

/// Fail with `ProviderError::Api` if the envelope reports an error.
pub(crate) fn check_envelope(value: &Value) -> Result<(), ProviderError> {
    match envelope_code(value) {
        Some(code) => Err(ProviderError::Api {
            code,
            message: value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        }),
        None => Ok(()),
    }
}

/// Decode the payload of an API response.
///
/// Responses are `{code, message, data}` envelopes; when `data` is absent or
/// null the whole object is decoded instead.
pub fn decode_data<T: DeserializeOwned>(raw: &[u8]) -> Result<T, ProviderError> {
    let value: Value = serde_json::from_slice(raw)
        .map_err(|e| ProviderError::ParseError(format!("Invalid JSON response: {}", e)))?;
    check_envelope(&value)?;
    let payload = match value.get("data") {
        Some(data) if !data.is_null() => data.clone(),
        _ => value,
    };
    serde_json::from_value(payload).map_err(|e| ProviderError::ParseError(e.to_string()))
}

/// Authenticated API access shared by the provider components.
///
/// Every call asks the token manager for the current access token; nothing is
/// cached here, so a refresh by the authoritative mount is seen immediately.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    tokens: TokenManager,
}

impl ApiClient {
    pub fn new(transport: Arc<dyn Transport>, tokens: TokenManager) -> Self {
        Self { transport, tokens }
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    pub async fn send(&self, req: ApiRequest) -> Result<Vec<u8>, ProviderError> {
        let token = self.tokens.access_token().await?;
        self.transport.request(req.with_token(token)).await
    }

    /// Send and decode the response payload.
    pub async fn call<T: DeserializeOwned>(&self, req: ApiRequest) -> Result<T, ProviderError> {
        let raw = self.send(req).await?;
        decode_data(&raw)
    }

    /// Send, check the envelope, and discard the payload.
    pub async fn call_unit(&self, req: ApiRequest) -> Result<(), ProviderError> {
        let _: serde::de::IgnoredAny = self.call(req).await?;
        Ok(())
    }

    pub async fn put_bytes(&self, url: &str, body: Vec<u8>) -> Result<u16, ProviderError> {
        self.transport.put_bytes(url, body).await
    }
}

/// Render an id the backend may send as a number or a string.
pub(crate) fn id_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

/// Encode an id for a request body: numeric ids go out as numbers.
pub(crate) fn id_value(id: &str) -> Value {
    match id.parse::<u64>() {
        Ok(n) => Value::from(n),
        Err(_) => Value::from(id),
    }
}

//! Scripted transport and fixtures shared by the provider tests.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use super::token::{Credential, SubjectCheck, TokenManager};
use super::transport::{ApiClient, ApiRequest, Transport};
use super::{Open123Config, ProviderError};
use crate::cloud_config::MemoryConfigStore;

/// A request as the mock saw it
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Value,
    pub token: Option<String>,
}

/// Transport answering from per-path queues of scripted responses.
///
/// Responses are consumed in order. An exhausted queue fails the request so a
/// test notices unexpected extra calls. Chunk PUTs default to `200` unless a
/// PUT script is queued.
pub struct MockTransport {
    responses: Mutex<HashMap<String, VecDeque<Result<Value, ProviderError>>>>,
    puts: Mutex<VecDeque<Result<u16, ProviderError>>>,
    pub requests: Mutex<Vec<Recorded>>,
    pub put_log: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            puts: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            put_log: Mutex::new(Vec::new()),
        }
    }

    /// Queue a successful `{code: 0, data}` response for `path`
    pub fn respond_data(&self, path: &str, data: Value) {
        self.respond(path, json!({"code": 0, "message": "ok", "data": data}));
    }

    /// Queue a raw JSON body for `path`
    pub fn respond(&self, path: &str, body: Value) {
        self.push(path, Ok(body));
    }

    pub fn fail(&self, path: &str, err: ProviderError) {
        self.push(path, Err(err));
    }

    pub fn script_put(&self, result: Result<u16, ProviderError>) {
        self.puts.lock().unwrap().push_back(result);
    }

    fn push(&self, path: &str, item: Result<Value, ProviderError>) {
        self.responses
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push_back(item);
    }

    pub fn recorded(&self, path: &str) -> Vec<Recorded> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.path == path)
            .cloned()
            .collect()
    }

    pub fn bodies(&self, path: &str) -> Vec<Value> {
        self.recorded(path).into_iter().map(|r| r.body).collect()
    }

    pub fn count(&self, path: &str) -> usize {
        self.recorded(path).len()
    }

    pub fn put_count(&self) -> usize {
        self.put_log.lock().unwrap().len()
    }

    pub fn put_urls(&self) -> Vec<String> {
        self.put_log.lock().unwrap().iter().map(|(url, _)| url.clone()).collect()
    }

    /// Paths of all API requests, in order
    pub fn paths(&self) -> Vec<String> {
        self.requests.lock().unwrap().iter().map(|r| r.path.clone()).collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn request(&self, req: ApiRequest) -> Result<Vec<u8>, ProviderError> {
        use secrecy::ExposeSecret;
        self.requests.lock().unwrap().push(Recorded {
            method: req.method.to_string(),
            path: req.path.clone(),
            query: req.query.clone(),
            body: req.body.clone().unwrap_or(Value::Null),
            token: req.token.as_ref().map(|t| t.expose_secret().to_string()),
        });
        let next = self
            .responses
            .lock()
            .unwrap()
            .get_mut(&req.path)
            .and_then(|queue| queue.pop_front());
        match next {
            Some(Ok(body)) => Ok(body.to_string().into_bytes()),
            Some(Err(e)) => Err(e),
            None => Err(ProviderError::NetworkError(format!("no scripted response for {}", req.path))),
        }
    }

    async fn put_bytes(&self, url: &str, body: Vec<u8>) -> Result<u16, ProviderError> {
        self.put_log.lock().unwrap().push((url.to_string(), body));
        self.puts.lock().unwrap().pop_front().unwrap_or(Ok(200))
    }
}

/// Unsigned JWT carrying only a `sub` claim
pub fn jwt_with_sub(sub: &str) -> String {
    let header = STANDARD_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = STANDARD_NO_PAD.encode(json!({"sub": sub}).to_string());
    format!("{}.{}.sig", header, payload)
}

/// Token manager that already holds an access token, so no refresh happens
pub fn ready_tokens(mock: &Arc<MockTransport>) -> TokenManager {
    TokenManager::owned(
        Credential::new("test-token", &jwt_with_sub("user")),
        "id",
        "secret",
        SubjectCheck::Relaxed,
        mock.clone(),
        Arc::new(MemoryConfigStore::new(Open123Config::new("id", "secret"))),
    )
}

pub fn api_client(mock: &Arc<MockTransport>) -> ApiClient {
    ApiClient::new(mock.clone(), ready_tokens(mock))
}

/// Backend file object as the listing and detail endpoints return it
pub fn api_file(id: u64, name: &str, parent: u64, is_dir: bool, size: u64) -> Value {
    json!({
        "fileId": id,
        "filename": name,
        "parentFileId": parent,
        "type": if is_dir { 1 } else { 0 },
        "size": size,
        "etag": if is_dir { "" } else { "d41d8cd98f00b204e9800998ecf8427e" },
        "createAt": "2024-05-01 10:00:00",
        "updateAt": "2024-05-02 11:30:00",
    })
}

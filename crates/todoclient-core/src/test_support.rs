//! Scripted in-process transport for unit tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::BoxFuture;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;

use crate::api::{ApiClient, ApiRequest, ApiResponse, Transport, TransportError};
use crate::auth::{CredentialStore, RefreshCoordinator};

type Handler = dyn Fn(ApiRequest) -> BoxFuture<'static, Result<ApiResponse, TransportError>> + Send + Sync;

/// Transport that answers every request through a closure and records
/// what it was sent.
pub struct MockTransport {
    handler: Box<Handler>,
    requests: Mutex<Vec<ApiRequest>>,
}

impl MockTransport {
    pub fn new<F>(handler: F) -> Arc<Self>
    where
        F: Fn(ApiRequest) -> BoxFuture<'static, Result<ApiResponse, TransportError>> + Send + Sync + 'static,
    {
        Arc::new(Self {
            handler: Box::new(handler),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Requests recorded for `method` and `path`.
    pub fn matching(&self, method: &str, path: &str) -> Vec<ApiRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.method.as_str() == method && r.path == path)
            .collect()
    }

    pub fn count(&self, method: &str, path: &str) -> usize {
        self.matching(method, path).len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        (self.handler)(request.clone()).await
    }
}

pub fn json_response(status: u16, body: serde_json::Value) -> ApiResponse {
    ApiResponse {
        status: StatusCode::from_u16(status).unwrap(),
        headers: HeaderMap::new(),
        body: body.to_string(),
    }
}

/// Pipeline over `transport` with in-memory credentials.
pub fn client_with(transport: Arc<MockTransport>, credentials: Arc<CredentialStore>) -> ApiClient {
    let refresher = Arc::new(RefreshCoordinator::new(transport.clone(), credentials.clone()));
    ApiClient::new(transport, credentials, refresher)
}

/// In-memory credentials holding an access token and a refresh credential.
pub fn logged_in_credentials(token: &str, refresh: &str) -> Arc<CredentialStore> {
    let store = CredentialStore::in_memory();
    store.save(token, None).unwrap();
    store.remember_refresh_credential(refresh).unwrap();
    Arc::new(store)
}

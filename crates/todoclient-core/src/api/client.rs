//! Request pipeline for the to-do service.
//!
//! Every call goes through `ApiClient::send`, which attaches the stored
//! access token and handles an authentication failure by refreshing the
//! token once and resending the request.

use std::sync::Arc;

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::transport::{ApiRequest, ApiResponse, HttpTransport, Transport};
use super::ApiError;
use crate::auth::credentials::{refresh_cookie_from_headers, CredentialStore, REFRESH_COOKIE_NAME};
use crate::auth::refresh::{RefreshCoordinator, RefreshError, REFRESH_PATH};
use crate::config::ClientConfig;
use crate::models::{
    AddTodoResponse, DeleteTodoResponse, LoginCredentials, LoginResponse, MeResponse, RegisterRequest,
    RegisterResponse, TodoItem, TodoListResponse, TodoUpdate, UpdateTodoResponse, User,
};

const LOGIN_PATH: &str = "/user/login";
const LOGOUT_PATH: &str = "/user/logout";
const REGISTER_PATH: &str = "/user/register";
const ME_PATH: &str = "/user/me";
const TODO_PATH: &str = "/todo";

/// One request on its way through the pipeline.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request: ApiRequest,
    /// Set once the request has been resent after a refresh.
    pub retried: bool,
    refreshable: bool,
    sent_token: Option<String>,
    sent_epoch: u64,
}

impl RequestContext {
    pub fn new(request: ApiRequest) -> Self {
        Self {
            request,
            retried: false,
            refreshable: true,
            sent_token: None,
            sent_epoch: 0,
        }
    }

    /// A request whose 401/403 is an answer, not an expired token
    /// (login with wrong password, logout with a dead session).
    pub fn without_refresh(request: ApiRequest) -> Self {
        Self {
            refreshable: false,
            ..Self::new(request)
        }
    }

    pub fn is_refresh_endpoint(&self) -> bool {
        self.request.path.starts_with(REFRESH_PATH)
    }

    fn can_refresh(&self) -> bool {
        self.refreshable && !self.retried && !self.is_refresh_endpoint()
    }
}

/// API client for the to-do service.
/// Clone is cheap - all state is behind `Arc`s shared with the refresh
/// coordinator.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    credentials: Arc<CredentialStore>,
    refresher: Arc<RefreshCoordinator>,
}

impl ApiClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        credentials: Arc<CredentialStore>,
        refresher: Arc<RefreshCoordinator>,
    ) -> Self {
        Self {
            transport,
            credentials,
            refresher,
        }
    }

    /// Build the HTTP transport and refresh coordinator from configuration.
    pub fn from_config(config: &ClientConfig, credentials: Arc<CredentialStore>) -> Result<Self> {
        let transport: Arc<dyn Transport> =
            Arc::new(HttpTransport::new(&config.base_url, config.request_timeout())?);
        let refresher = Arc::new(
            RefreshCoordinator::new(transport.clone(), credentials.clone()).with_timeout(config.refresh_timeout()),
        );
        Ok(Self::new(transport, credentials, refresher))
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    pub fn refresher(&self) -> &Arc<RefreshCoordinator> {
        &self.refresher
    }

    /// Send a request, refreshing the access token at most once on 401/403.
    ///
    /// If the refresh fails, the original authentication error is returned
    /// and the request is not resent.
    pub async fn send(&self, mut ctx: RequestContext) -> Result<ApiResponse, ApiError> {
        if !ctx.request.has_authorization() {
            if let Some(token) = self.credentials.token() {
                ctx.request.set_bearer(&token)?;
            }
        }
        ctx.sent_token = ctx.request.bearer_token().map(str::to_string);
        ctx.sent_epoch = self.credentials.epoch();

        let response = self.transport.execute(&ctx.request).await?;
        if response.is_success() {
            return Ok(response);
        }

        let error = ApiError::from_status(response.status, &response.body);
        if !error.is_auth_failure() || !ctx.can_refresh() {
            return Err(error);
        }

        ctx.retried = true;
        let token = match self.token_for_retry(&ctx).await {
            Ok(token) => token,
            Err(e) => {
                warn!(path = %ctx.request.path, error = %e, "Could not refresh token, giving up on request");
                return Err(error);
            }
        };

        ctx.request.set_bearer(&token)?;
        debug!(path = %ctx.request.path, "Resending request with refreshed token");
        let response = self.transport.execute(&ctx.request).await?;
        Self::check_response(response)
    }

    /// Token to resend with. If another request already refreshed the token
    /// since this one was dispatched, that token is reused instead of
    /// starting a new refresh cycle.
    async fn token_for_retry(&self, ctx: &RequestContext) -> Result<String, RefreshError> {
        // Never resend a request on behalf of a different identity
        if self.credentials.epoch() != ctx.sent_epoch {
            return Err(RefreshError::Superseded);
        }
        if !self.refresher.is_refreshing() {
            if let Some(current) = self.credentials.token() {
                if ctx.sent_token.as_deref() != Some(current.as_str()) {
                    debug!(path = %ctx.request.path, "Token changed since dispatch, reusing it");
                    return Ok(current);
                }
            }
        }
        self.refresher.acquire_fresh_token().await
    }

    fn check_response(response: ApiResponse) -> Result<ApiResponse, ApiError> {
        if response.is_success() {
            Ok(response)
        } else {
            Err(ApiError::from_status(response.status, &response.body))
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send(RequestContext::new(ApiRequest::get(path))).await?.json()
    }

    async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        let request = ApiRequest::post(path).json(body)?;
        self.send(RequestContext::new(request)).await?.json()
    }

    // ===== Account =====

    /// Exchange email and password for an access token. A refresh credential
    /// delivered as a `Set-Cookie` header is folded into the response.
    pub async fn login(&self, credentials: &LoginCredentials) -> Result<LoginResponse, ApiError> {
        let request = ApiRequest::post(LOGIN_PATH).json(credentials)?;
        let response = self.send(RequestContext::without_refresh(request)).await?;
        let mut login: LoginResponse = response.json()?;
        if login.refresh_token.is_none() {
            login.refresh_token = refresh_cookie_from_headers(&response.headers);
        }
        Ok(login)
    }

    pub async fn register(&self, request: &RegisterRequest) -> Result<RegisterResponse, ApiError> {
        let request = ApiRequest::post(REGISTER_PATH).json(request)?;
        let response = self.send(RequestContext::without_refresh(request)).await?;
        // Some deployments answer 201 with an empty body
        if response.body.trim().is_empty() {
            return Ok(RegisterResponse::default());
        }
        response.json()
    }

    /// Tell the server the session is over, presenting the refresh
    /// credential so it can be revoked.
    pub async fn logout(&self) -> Result<(), ApiError> {
        let mut request = ApiRequest::post(LOGOUT_PATH);
        if let Some(refresh) = self.credentials.refresh_credential() {
            request.set_cookie(REFRESH_COOKIE_NAME, &refresh)?;
        }
        self.send(RequestContext::without_refresh(request)).await?;
        Ok(())
    }

    pub async fn me(&self) -> Result<User, ApiError> {
        let response: MeResponse = self.get(ME_PATH).await?;
        Ok(response.into_user())
    }

    // ===== To-do items =====

    /// Fetch all to-do items of the logged-in user
    pub async fn fetch_todos(&self) -> Result<Vec<TodoItem>, ApiError> {
        let response: TodoListResponse = self.get(TODO_PATH).await?;
        Ok(response.data)
    }

    pub async fn add_todo(&self, task: &str) -> Result<TodoItem, ApiError> {
        let response: AddTodoResponse = self.post(TODO_PATH, &serde_json::json!({ "task": task })).await?;
        Ok(response.task_created)
    }

    pub async fn update_todo(&self, id: &str, task: &str) -> Result<TodoUpdate, ApiError> {
        let request = ApiRequest::patch(format!("{}/{}", TODO_PATH, id)).json(&serde_json::json!({ "task": task }))?;
        let response: UpdateTodoResponse = self.send(RequestContext::new(request)).await?.json()?;
        Ok(response.into())
    }

    pub async fn delete_todo(&self, id: &str) -> Result<String, ApiError> {
        let request = ApiRequest::delete(format!("{}/{}", TODO_PATH, id));
        let response = self.send(RequestContext::new(request)).await?;
        if response.body.trim().is_empty() {
            return Ok(DeleteTodoResponse::default().message_or_default());
        }
        let parsed: DeleteTodoResponse = response.json()?;
        Ok(parsed.message_or_default())
    }
}

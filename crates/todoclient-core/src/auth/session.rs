//! Session controller: startup, login, logout and the in-memory session.
//!
//! The controller is the only writer of `Session`. The refresh coordinator
//! never touches it directly; it writes tokens through the credential store
//! and reports terminal failures as `AuthEvent`s, which the controller
//! applies at the start of each operation.

use std::sync::{Mutex, PoisonError};

use thiserror::Error;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::credentials::StoredCredentials;
use super::refresh::AuthEvent;
use super::storage::StorageError;
use crate::api::{ApiClient, ApiError};
use crate::cache::CachedData;
use crate::config::ClientConfig;
use crate::models::{LoginCredentials, TodoItem, TodoUpdate, User};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Authenticated,
    Unauthenticated,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("Login succeeded but the server did not return a user profile")]
    MissingProfile,

    #[error("Failed to persist credentials: {0}")]
    Storage(#[from] StorageError),
}

impl SessionError {
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, SessionError::Api(e) if e.is_auth_failure())
    }
}

/// Behavior switches for the controller.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Fail a login whose response carries no user profile instead of
    /// synthesizing one from the email.
    pub require_server_profile: bool,
}

impl From<&ClientConfig> for SessionOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            require_server_profile: config.require_server_profile,
        }
    }
}

/// In-memory view of the logged-in account.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub access_token: Option<String>,
    pub user: Option<User>,
    pub resources: Option<CachedData<Vec<TodoItem>>>,
}

impl Session {
    pub fn resource_cache(&self) -> &[TodoItem] {
        self.resources.as_ref().map(|c| c.data.as_slice()).unwrap_or(&[])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginOutcome {
    pub success: bool,
    pub user: User,
}

struct Inner {
    state: SessionState,
    session: Session,
    // Bumped on every login/logout so results fetched for an earlier
    // identity are never written into the current cache
    generation: u64,
}

pub struct SessionController {
    api: ApiClient,
    options: SessionOptions,
    inner: RwLock<Inner>,
    events: Mutex<broadcast::Receiver<AuthEvent>>,
}

impl SessionController {
    pub fn new(api: ApiClient, options: SessionOptions) -> Self {
        let events = api.refresher().subscribe();
        Self {
            api,
            options,
            inner: RwLock::new(Inner {
                state: SessionState::Uninitialized,
                session: Session::default(),
                generation: 0,
            }),
            events: Mutex::new(events),
        }
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub async fn state(&self) -> SessionState {
        self.apply_auth_events().await;
        self.inner.read().await.state
    }

    pub async fn is_authenticated(&self) -> bool {
        self.state().await == SessionState::Authenticated
    }

    pub async fn user(&self) -> Option<User> {
        self.apply_auth_events().await;
        self.inner.read().await.session.user.clone()
    }

    pub async fn resources(&self) -> Vec<TodoItem> {
        self.apply_auth_events().await;
        self.inner.read().await.session.resource_cache().to_vec()
    }

    pub async fn snapshot(&self) -> Session {
        self.apply_auth_events().await;
        self.inner.read().await.session.clone()
    }

    /// Decide the initial authentication state from persisted credentials.
    /// Runs once; later calls return the current state.
    pub async fn initialize(&self) -> SessionState {
        {
            let mut inner = self.inner.write().await;
            if inner.state != SessionState::Uninitialized {
                return inner.state;
            }
            inner.state = SessionState::Initializing;
        }
        debug!("Initializing session");

        let stored = self.api.credentials().load().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to load stored credentials");
            StoredCredentials::default()
        });

        let resolved = match stored.token {
            Some(token) => self.restore(token, stored.user).await,
            None if self.api.credentials().refresh_credential().is_some() => self.resume_with_refresh().await,
            None => SessionState::Unauthenticated,
        };

        let mut inner = self.inner.write().await;
        if inner.state == SessionState::Initializing {
            inner.state = resolved;
        }
        info!(state = ?inner.state, "Session initialized");
        inner.state
    }

    /// Stored token found: assume authenticated and probe it.
    async fn restore(&self, token: String, user: Option<User>) -> SessionState {
        {
            let mut inner = self.inner.write().await;
            inner.session.access_token = Some(token);
            inner.session.user = user;
        }
        self.probe().await
    }

    /// Only a refresh credential survived: try to mint an access token.
    async fn resume_with_refresh(&self) -> SessionState {
        match self.api.refresher().acquire_fresh_token().await {
            Ok(token) => {
                let user = self.api.credentials().user();
                {
                    let mut inner = self.inner.write().await;
                    inner.session.access_token = Some(token);
                    inner.session.user = user;
                }
                self.probe().await
            }
            Err(e) => {
                info!(error = %e, "Could not resume session from refresh credential");
                self.logout().await;
                SessionState::Unauthenticated
            }
        }
    }

    async fn probe(&self) -> SessionState {
        match self.fetch_resources().await {
            Ok(_) => {}
            // fetch_resources already logged out
            Err(e) if e.is_auth_failure() => return SessionState::Unauthenticated,
            Err(e) => warn!(error = %e, "Session probe failed, keeping stored session"),
        }
        match self.recover_profile().await {
            Err(e) if e.is_auth_failure() => SessionState::Unauthenticated,
            _ => SessionState::Authenticated,
        }
    }

    /// Fill in a missing profile from `GET /user/me`. Only an
    /// authentication failure is reported; anything else leaves the
    /// profile empty.
    async fn recover_profile(&self) -> Result<(), SessionError> {
        let generation = {
            let inner = self.inner.read().await;
            if inner.session.user.is_some() {
                return Ok(());
            }
            inner.generation
        };
        match self.api.me().await {
            Ok(user) => {
                if let Some(token) = self.api.credentials().token() {
                    if let Err(e) = self.api.credentials().save(&token, Some(&user)) {
                        warn!(error = %e, "Failed to persist recovered profile");
                    }
                }
                self.inner.write().await.session.user = Some(user);
                Ok(())
            }
            Err(e) if e.is_auth_failure() => Err(self.handle_failure(e, generation).await),
            Err(e) => {
                debug!(error = %e, "Could not recover user profile");
                Ok(())
            }
        }
    }

    /// Log in, persist the new credentials and load the user's items.
    pub async fn login(&self, credentials: &LoginCredentials) -> Result<LoginOutcome, SessionError> {
        self.apply_auth_events().await;

        let response = self.api.login(credentials).await?;
        let token = response
            .token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ApiError::InvalidResponse("Login response did not contain a token".into()))?;

        let user = match response.user {
            Some(user) => user,
            None if self.options.require_server_profile => return Err(SessionError::MissingProfile),
            None => User::from_email(&credentials.email),
        };

        // Replaces the refresh credential of any earlier identity too
        self.api
            .credentials()
            .begin_session(&token, &user, response.refresh_token.as_deref())?;

        {
            let mut inner = self.inner.write().await;
            inner.generation += 1;
            inner.session = Session {
                access_token: Some(token),
                user: Some(user.clone()),
                resources: None,
            };
            inner.state = SessionState::Authenticated;
        }
        info!(user = %user.display_name(), "Logged in");

        if let Err(e) = self.fetch_resources().await {
            warn!(error = %e, "Failed to load items after login");
        }

        Ok(LoginOutcome { success: true, user })
    }

    /// End the session. The server is notified best effort; local state is
    /// always cleared. Safe to call repeatedly.
    pub async fn logout(&self) {
        let store = self.api.credentials();
        if store.token().is_some() || store.refresh_credential().is_some() {
            if let Err(e) = self.api.logout().await {
                warn!(error = %e, "Server logout failed, clearing local session anyway");
            }
        }
        self.clear_local().await;
        info!("Logged out");
    }

    async fn clear_local(&self) {
        let store = self.api.credentials();
        if let Err(e) = store.clear() {
            warn!(error = %e, "Failed to clear stored credentials");
        }
        if let Err(e) = store.clear_refresh_credential() {
            warn!(error = %e, "Failed to clear refresh credential");
        }
        let mut inner = self.inner.write().await;
        inner.generation += 1;
        inner.session = Session::default();
        inner.state = SessionState::Unauthenticated;
    }

    /// Reload the resource cache from the server. An authentication failure
    /// that survives the pipeline's refresh ends the session.
    pub async fn fetch_resources(&self) -> Result<Vec<TodoItem>, SessionError> {
        let generation = self.current_generation().await;

        match self.api.fetch_todos().await {
            Ok(items) => {
                let mut inner = self.inner.write().await;
                if inner.generation == generation {
                    inner.session.resources = Some(CachedData::new(items.clone()));
                } else {
                    debug!("Session changed during fetch, discarding items");
                }
                Ok(items)
            }
            Err(e) => Err(self.handle_failure(e, generation).await),
        }
    }

    /// Replace the resource cache, e.g. after a local edit.
    pub async fn set_resource_cache(&self, items: Vec<TodoItem>) {
        self.inner.write().await.session.resources = Some(CachedData::new(items));
    }

    pub async fn add_todo(&self, task: &str) -> Result<TodoItem, SessionError> {
        let generation = self.current_generation().await;
        match self.api.add_todo(task).await {
            Ok(item) => {
                let mut inner = self.inner.write().await;
                if inner.generation != generation {
                    return Ok(item);
                }
                let mut items = inner.session.resource_cache().to_vec();
                items.push(item.clone());
                inner.session.resources = Some(CachedData::new(items));
                Ok(item)
            }
            Err(e) => Err(self.handle_failure(e, generation).await),
        }
    }

    pub async fn update_todo(&self, id: &str, task: &str) -> Result<TodoUpdate, SessionError> {
        let generation = self.current_generation().await;
        match self.api.update_todo(id, task).await {
            Ok(update) => {
                let mut inner = self.inner.write().await;
                if inner.generation != generation {
                    return Ok(update);
                }
                let mut items = inner.session.resource_cache().to_vec();
                if let Some(existing) = items.iter_mut().find(|i| i.id == id) {
                    match update {
                        TodoUpdate::Updated(ref item) => *existing = item.clone(),
                        TodoUpdate::Message(_) => existing.task = task.to_string(),
                    }
                    inner.session.resources = Some(CachedData::new(items));
                }
                Ok(update)
            }
            Err(e) => Err(self.handle_failure(e, generation).await),
        }
    }

    pub async fn delete_todo(&self, id: &str) -> Result<String, SessionError> {
        let generation = self.current_generation().await;
        match self.api.delete_todo(id).await {
            Ok(message) => {
                let mut inner = self.inner.write().await;
                if inner.generation != generation {
                    return Ok(message);
                }
                let items: Vec<_> = inner
                    .session
                    .resource_cache()
                    .iter()
                    .filter(|i| i.id != id)
                    .cloned()
                    .collect();
                inner.session.resources = Some(CachedData::new(items));
                Ok(message)
            }
            Err(e) => Err(self.handle_failure(e, generation).await),
        }
    }

    async fn current_generation(&self) -> u64 {
        self.apply_auth_events().await;
        self.inner.read().await.generation
    }

    /// End the session on an authentication failure, unless the failed
    /// request belonged to an identity that has since been replaced.
    async fn handle_failure(&self, error: ApiError, generation: u64) -> SessionError {
        if error.is_auth_failure() {
            if self.inner.read().await.generation == generation {
                warn!(error = %error, "Authentication failed after refresh, ending session");
                self.logout().await;
            } else {
                debug!(error = %error, "Ignoring authentication failure from an earlier session");
            }
        }
        error.into()
    }

    /// Apply refresh outcomes reported since the last operation. Events
    /// from an earlier credential epoch are ignored.
    async fn apply_auth_events(&self) {
        let store = self.api.credentials();
        let current = store.epoch();
        let mut terminated = false;
        let mut refreshed = false;
        let mut lagged = false;
        {
            let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
            loop {
                match events.try_recv() {
                    Ok(AuthEvent::RefreshFailed { epoch, .. }) if epoch == current => terminated = true,
                    Ok(AuthEvent::TokenRefreshed { epoch }) if epoch == current => refreshed = true,
                    Ok(event) => debug!(?event, "Ignoring auth event from an earlier session"),
                    Err(TryRecvError::Lagged(skipped)) => {
                        debug!(skipped, "Missed auth events, resyncing from store");
                        lagged = true;
                    }
                    Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                }
            }
        }

        if lagged {
            // A skipped failure still ends the session
            terminated |= self.api.refresher().failed_in_epoch(current);
            refreshed = true;
        }

        let signed_in = self.inner.read().await.state == SessionState::Authenticated;
        if terminated {
            if signed_in {
                info!("Refresh failed, ending session");
                self.clear_local().await;
            }
        } else if refreshed {
            let token = store.token();
            if token.is_none() && signed_in {
                info!("Stored credentials are gone, ending session");
                self.clear_local().await;
                return;
            }
            let mut inner = self.inner.write().await;
            if inner.session.access_token.is_some() || inner.state == SessionState::Initializing {
                inner.session.access_token = token;
            }
        }
    }
}

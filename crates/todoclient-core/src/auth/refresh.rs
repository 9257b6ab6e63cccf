//! Single-flight access token refresh.
//!
//! When many requests hit an expired token at once, only the first caller
//! contacts the refresh endpoint. Everyone else parks on a oneshot waiter
//! and receives the same outcome when that one call settles.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

use super::credentials::{refresh_cookie_from_headers, CredentialStore, REFRESH_COOKIE_NAME};
use crate::api::{ApiError, ApiRequest, Transport};
use crate::models::User;

pub const REFRESH_PATH: &str = "/user/refresh";

/// Upper bound on one refresh exchange, waiters included.
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(15);

pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 16;

#[derive(Error, Debug, Clone)]
pub enum RefreshError {
    #[error("No refresh credential available")]
    NoCredential,

    #[error("Refresh denied by server (status {0})")]
    Denied(u16),

    #[error("Refresh response did not contain an access token")]
    MissingToken,

    #[error("Refresh failed: {0}")]
    Failed(ApiError),

    #[error("Refresh timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Refresh was abandoned before it settled")]
    Abandoned,

    #[error("Session changed while the refresh was in flight")]
    Superseded,

    #[error("Failed to persist refreshed token: {0}")]
    Storage(String),
}

/// Broadcast to observers (the session controller, UIs) when a refresh
/// cycle settles. `epoch` is the credential epoch the refresh ran under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    TokenRefreshed { epoch: u64 },
    RefreshFailed { reason: String, epoch: u64 },
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    #[serde(default, rename = "accessToken")]
    access_token: Option<String>,
    #[serde(default)]
    user: Option<User>,
}

type Outcome = Result<String, RefreshError>;

#[derive(Default)]
struct RefreshState {
    in_flight: bool,
    waiters: Vec<oneshot::Sender<Outcome>>,
    last_failed_epoch: Option<u64>,
}

pub struct RefreshCoordinator {
    transport: Arc<dyn Transport>,
    credentials: Arc<CredentialStore>,
    state: Mutex<RefreshState>,
    timeout: Duration,
    events: broadcast::Sender<AuthEvent>,
}

impl RefreshCoordinator {
    pub fn new(transport: Arc<dyn Transport>, credentials: Arc<CredentialStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            transport,
            credentials,
            state: Mutex::new(RefreshState::default()),
            timeout: DEFAULT_REFRESH_TIMEOUT,
            events,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    pub fn is_refreshing(&self) -> bool {
        self.lock_state().in_flight
    }

    /// Number of callers parked on the in-flight refresh.
    pub fn waiter_count(&self) -> usize {
        self.lock_state().waiters.len()
    }

    /// Whether a refresh under `epoch` has failed. Lets observers that
    /// missed events catch up.
    pub fn failed_in_epoch(&self, epoch: u64) -> bool {
        self.lock_state().last_failed_epoch == Some(epoch)
    }

    fn lock_state(&self) -> MutexGuard<'_, RefreshState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Obtain a new access token, joining the in-flight refresh if there is
    /// one. Every caller of one refresh cycle gets the same outcome.
    pub async fn acquire_fresh_token(&self) -> Result<String, RefreshError> {
        let waiter = {
            let mut state = self.lock_state();
            if state.in_flight {
                let (tx, rx) = oneshot::channel();
                state.waiters.push(tx);
                Some(rx)
            } else {
                state.in_flight = true;
                None
            }
        };

        if let Some(rx) = waiter {
            debug!("Refresh already in flight, waiting for its outcome");
            return rx.await.unwrap_or(Err(RefreshError::Abandoned));
        }

        let mut guard = InFlightGuard {
            coordinator: self,
            settled: false,
        };
        let (epoch, credential) = self.credentials.refresh_snapshot();
        let outcome = match self.perform_refresh(epoch, credential).await {
            // A failure that belongs to a replaced identity is not this
            // session's failure
            Err(e) if !matches!(e, RefreshError::Superseded) && self.credentials.epoch() != epoch => {
                debug!(error = %e, "Refresh failed after the session changed");
                Err(RefreshError::Superseded)
            }
            other => other,
        };
        guard.settle(&outcome);

        match outcome {
            Ok(_) => {
                info!("Access token refreshed");
                let _ = self.events.send(AuthEvent::TokenRefreshed { epoch });
            }
            Err(RefreshError::Superseded) => {
                info!("Discarded refresh started by an earlier session");
            }
            Err(ref e) => {
                warn!(error = %e, "Token refresh failed");
                self.lock_state().last_failed_epoch = Some(epoch);
                let _ = self.events.send(AuthEvent::RefreshFailed {
                    reason: e.to_string(),
                    epoch,
                });
            }
        }
        outcome
    }

    /// Resolve every waiter with `outcome` and clear the in-flight flag.
    fn settle(&self, outcome: &Outcome) {
        let waiters = {
            let mut state = self.lock_state();
            let waiters = std::mem::take(&mut state.waiters);
            state.in_flight = false;
            waiters
        };
        debug!(waiters = waiters.len(), ok = outcome.is_ok(), "Refresh settled");
        for waiter in waiters {
            // A waiter whose caller went away is not an error
            let _ = waiter.send(outcome.clone());
        }
    }

    async fn perform_refresh(&self, epoch: u64, credential: Option<String>) -> Outcome {
        let credential = credential.ok_or(RefreshError::NoCredential)?;

        // Sent straight to the transport: the pipeline's retry logic must
        // never see the refresh call.
        let mut request = ApiRequest::post(REFRESH_PATH);
        request
            .set_cookie(REFRESH_COOKIE_NAME, &credential)
            .map_err(RefreshError::Failed)?;

        let response = match tokio::time::timeout(self.timeout, self.transport.execute(&request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(RefreshError::Failed(ApiError::Transport(e))),
            Err(_) => return Err(RefreshError::TimedOut(self.timeout)),
        };

        if !response.is_success() {
            let status = response.status.as_u16();
            return Err(match status {
                401 | 403 => RefreshError::Denied(status),
                _ => RefreshError::Failed(ApiError::from_status(response.status, &response.body)),
            });
        }

        let parsed = serde_json::from_str::<RefreshResponse>(&response.body).ok();
        let (token, user) = match parsed {
            Some(RefreshResponse {
                access_token: Some(token),
                user,
            }) if !token.is_empty() => (token, user),
            _ => return Err(RefreshError::MissingToken),
        };

        let rotated = refresh_cookie_from_headers(&response.headers);
        let committed = self
            .credentials
            .commit_refresh(epoch, &token, user.as_ref(), rotated.as_deref())
            .map_err(|e| RefreshError::Storage(e.to_string()))?;
        if !committed {
            return Err(RefreshError::Superseded);
        }

        Ok(token)
    }
}

/// Settles waiters if the leading caller is dropped mid-refresh, so the
/// coordinator never stays stuck in flight.
struct InFlightGuard<'a> {
    coordinator: &'a RefreshCoordinator,
    settled: bool,
}

impl InFlightGuard<'_> {
    fn settle(&mut self, outcome: &Outcome) {
        self.settled = true;
        self.coordinator.settle(outcome);
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            warn!("Refresh abandoned by its caller, releasing waiters");
            self.coordinator.settle(&Err(RefreshError::Abandoned));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{json_response, MockTransport};
    use futures::FutureExt;
    use serde_json::json;
    use tokio::sync::Notify;

    fn credentials_with_refresh(value: &str) -> Arc<CredentialStore> {
        let store = CredentialStore::in_memory();
        store.save("T1", None).unwrap();
        store.remember_refresh_credential(value).unwrap();
        Arc::new(store)
    }

    #[tokio::test]
    async fn test_successful_refresh_stores_token() {
        let transport = MockTransport::new(|req| {
            async move {
                assert_eq!(req.path, REFRESH_PATH);
                assert_eq!(
                    req.headers.get("cookie").and_then(|v| v.to_str().ok()),
                    Some("refreshToken=R1")
                );
                Ok(json_response(200, json!({ "accessToken": "T2", "user": { "email": "a@b.c" } })))
            }
            .boxed()
        });
        let credentials = credentials_with_refresh("R1");
        let coordinator = RefreshCoordinator::new(transport.clone(), credentials.clone());
        let mut events = coordinator.subscribe();

        assert_eq!(coordinator.acquire_fresh_token().await.unwrap(), "T2");
        assert_eq!(credentials.token().as_deref(), Some("T2"));
        assert_eq!(credentials.user().and_then(|u| u.email).as_deref(), Some("a@b.c"));
        assert_eq!(
            events.try_recv().unwrap(),
            AuthEvent::TokenRefreshed {
                epoch: credentials.epoch()
            }
        );
        assert!(!coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn test_denied_refresh_emits_failure() {
        let transport =
            MockTransport::new(|_| async { Ok(json_response(401, json!({ "message": "expired" }))) }.boxed());
        let credentials = credentials_with_refresh("R1");
        let coordinator = RefreshCoordinator::new(transport, credentials.clone());
        let mut events = coordinator.subscribe();

        assert!(matches!(
            coordinator.acquire_fresh_token().await,
            Err(RefreshError::Denied(401))
        ));
        assert!(matches!(events.try_recv().unwrap(), AuthEvent::RefreshFailed { .. }));
        assert!(coordinator.failed_in_epoch(credentials.epoch()));
        assert!(!coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn test_missing_token_is_a_failure() {
        let transport = MockTransport::new(|_| async { Ok(json_response(200, json!({ "user": null }))) }.boxed());
        let credentials = credentials_with_refresh("R1");
        let coordinator = RefreshCoordinator::new(transport, credentials.clone());

        assert!(matches!(
            coordinator.acquire_fresh_token().await,
            Err(RefreshError::MissingToken)
        ));
        assert_eq!(credentials.token().as_deref(), Some("T1"));
    }

    #[tokio::test]
    async fn test_no_credential_skips_network() {
        let transport = MockTransport::new(|_| async { Ok(json_response(200, json!({ "accessToken": "T2" }))) }.boxed());
        let coordinator = RefreshCoordinator::new(transport.clone(), Arc::new(CredentialStore::in_memory()));

        assert!(matches!(
            coordinator.acquire_fresh_token().await,
            Err(RefreshError::NoCredential)
        ));
        assert_eq!(transport.request_count(), 0);
    }

    #[tokio::test]
    async fn test_waiters_share_the_single_outcome() {
        let release = Arc::new(Notify::new());
        let transport = MockTransport::new({
            let release = release.clone();
            move |_| {
                let release = release.clone();
                async move {
                    release.notified().await;
                    Ok(json_response(200, json!({ "accessToken": "T2" })))
                }
                .boxed()
            }
        });
        let coordinator = Arc::new(RefreshCoordinator::new(transport.clone(), credentials_with_refresh("R1")));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let coordinator = coordinator.clone();
                tokio::spawn(async move { coordinator.acquire_fresh_token().await })
            })
            .collect();

        while coordinator.waiter_count() < 3 {
            tokio::task::yield_now().await;
        }
        release.notify_one();

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "T2");
        }
        assert_eq!(transport.count("POST", REFRESH_PATH), 1);
        assert_eq!(coordinator.waiter_count(), 0);
        assert!(!coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn test_waiters_share_failure() {
        let release = Arc::new(Notify::new());
        let transport = MockTransport::new({
            let release = release.clone();
            move |_| {
                let release = release.clone();
                async move {
                    release.notified().await;
                    Ok(json_response(403, json!({})))
                }
                .boxed()
            }
        });
        let coordinator = Arc::new(RefreshCoordinator::new(transport.clone(), credentials_with_refresh("R1")));

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let coordinator = coordinator.clone();
                tokio::spawn(async move { coordinator.acquire_fresh_token().await })
            })
            .collect();

        while coordinator.waiter_count() < 2 {
            tokio::task::yield_now().await;
        }
        release.notify_one();

        for handle in handles {
            assert!(matches!(handle.await.unwrap(), Err(RefreshError::Denied(403))));
        }
        assert_eq!(transport.count("POST", REFRESH_PATH), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_refresh_times_out() {
        let transport = MockTransport::new(|_| {
            async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(json_response(200, json!({ "accessToken": "late" })))
            }
            .boxed()
        });
        let coordinator = RefreshCoordinator::new(transport, credentials_with_refresh("R1"))
            .with_timeout(Duration::from_secs(5));

        assert!(matches!(
            coordinator.acquire_fresh_token().await,
            Err(RefreshError::TimedOut(_))
        ));
        assert!(!coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn test_abandoned_leader_releases_waiters() {
        let transport = MockTransport::new(|_| futures::future::pending().boxed());
        let coordinator = Arc::new(RefreshCoordinator::new(transport, credentials_with_refresh("R1")));

        let leader = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.acquire_fresh_token().await }
        });
        while !coordinator.is_refreshing() {
            tokio::task::yield_now().await;
        }
        let follower = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.acquire_fresh_token().await }
        });
        while coordinator.waiter_count() < 1 {
            tokio::task::yield_now().await;
        }

        leader.abort();
        assert!(matches!(follower.await.unwrap(), Err(RefreshError::Abandoned)));
        assert!(!coordinator.is_refreshing());
    }

    fn held_refresh(release: Arc<Notify>, status: u16) -> Arc<MockTransport> {
        MockTransport::new(move |_| {
            let release = release.clone();
            async move {
                release.notified().await;
                Ok(json_response(status, json!({ "accessToken": "old-identity" })))
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_refresh_does_not_commit_over_new_identity() {
        let release = Arc::new(Notify::new());
        let credentials = credentials_with_refresh("R1");
        let coordinator = Arc::new(RefreshCoordinator::new(
            held_refresh(release.clone(), 200),
            credentials.clone(),
        ));
        let mut events = coordinator.subscribe();

        let pending = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.acquire_fresh_token().await }
        });
        while !coordinator.is_refreshing() {
            tokio::task::yield_now().await;
        }
        credentials
            .begin_session("T-new", &User::from_email("bob@example.com"), Some("R-new"))
            .unwrap();
        release.notify_one();

        assert!(matches!(pending.await.unwrap(), Err(RefreshError::Superseded)));
        assert_eq!(credentials.token().as_deref(), Some("T-new"));
        assert_eq!(credentials.refresh_credential().as_deref(), Some("R-new"));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failure_after_logout_emits_no_event() {
        let release = Arc::new(Notify::new());
        let credentials = credentials_with_refresh("R1");
        let coordinator = Arc::new(RefreshCoordinator::new(
            held_refresh(release.clone(), 401),
            credentials.clone(),
        ));
        let mut events = coordinator.subscribe();

        let pending = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.acquire_fresh_token().await }
        });
        while !coordinator.is_refreshing() {
            tokio::task::yield_now().await;
        }
        credentials.clear().unwrap();
        release.notify_one();

        assert!(matches!(pending.await.unwrap(), Err(RefreshError::Superseded)));
        assert!(events.try_recv().is_err());
        assert!(!coordinator.failed_in_epoch(credentials.epoch()));
    }
}

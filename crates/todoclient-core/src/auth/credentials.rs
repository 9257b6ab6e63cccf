//! Persistent credentials: access token, cached user profile and the
//! refresh credential.
//!
//! The token and the profile live in the session storage under independent
//! keys. The refresh credential lives in a separate cookie-like storage,
//! with the attributes a browser would enforce (secure, same-site, expiry).
//!
//! Every change of identity (a new login, or clearing the session) bumps the
//! store's epoch. Writers that started under an older epoch, such as a
//! refresh that was in flight during a login, cannot commit.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use reqwest::header::{self, HeaderMap};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::storage::{MemoryStorage, Storage, StorageError};
use crate::models::User;

const TOKEN_KEY: &str = "token";
const USER_KEY: &str = "user";

/// Name of the refresh credential, both as storage key and as cookie name.
pub const REFRESH_COOKIE_NAME: &str = "refreshToken";

/// Default lifetime of the refresh credential.
pub const DEFAULT_REFRESH_TTL_DAYS: i64 = 7;

/// Longest accepted refresh credential lifetime.
pub const MAX_REFRESH_TTL_DAYS: i64 = 3650;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

/// Attributes applied when writing the refresh credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieOptions {
    /// Whether the channel the credential travels over is HTTPS.
    pub secure: bool,
    pub same_site: SameSite,
    pub ttl_days: i64,
}

impl CookieOptions {
    pub fn strict(secure: bool, ttl_days: i64) -> Self {
        Self {
            secure,
            same_site: SameSite::Strict,
            ttl_days,
        }
    }
}

impl Default for CookieOptions {
    fn default() -> Self {
        Self::strict(true, DEFAULT_REFRESH_TTL_DAYS)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredCookie {
    value: String,
    secure: bool,
    same_site: SameSite,
    path: String,
    expires_at: DateTime<Utc>,
}

impl StoredCookie {
    fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredCredentials {
    pub token: Option<String>,
    pub user: Option<User>,
}

pub struct CredentialStore {
    session: Arc<dyn Storage>,
    cookies: Arc<dyn Storage>,
    cookie_options: CookieOptions,
    allow_insecure_cookie: bool,
    // Identity epoch. Held across multi-key reads and writes so no reader
    // sees half a save
    lock: Mutex<u64>,
}

impl CredentialStore {
    pub fn new(session: Arc<dyn Storage>, cookies: Arc<dyn Storage>) -> Self {
        Self {
            session,
            cookies,
            cookie_options: CookieOptions::default(),
            allow_insecure_cookie: false,
            lock: Mutex::new(0),
        }
    }

    /// Store backed by process memory only.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStorage::new()), Arc::new(MemoryStorage::new()))
    }

    pub fn with_cookie_options(mut self, options: CookieOptions) -> Self {
        self.cookie_options = options;
        self
    }

    /// Permit writing the refresh credential over plain HTTP.
    pub fn allow_insecure_cookie(mut self, allow: bool) -> Self {
        self.allow_insecure_cookie = allow;
        self
    }

    pub fn cookie_options(&self) -> &CookieOptions {
        &self.cookie_options
    }

    fn guard(&self) -> MutexGuard<'_, u64> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current identity epoch.
    pub fn epoch(&self) -> u64 {
        *self.guard()
    }

    /// Start a new identity: token, profile and refresh credential replace
    /// whatever was stored before, and the epoch moves on.
    pub fn begin_session(&self, token: &str, user: &User, refresh: Option<&str>) -> Result<(), StorageError> {
        let user_json = serde_json::to_string(user)?;
        let mut epoch = self.guard();
        *epoch += 1;
        self.session
            .apply(&[(TOKEN_KEY, Some(token)), (USER_KEY, Some(user_json.as_str()))])?;
        self.cookies.remove(REFRESH_COOKIE_NAME)?;
        if let Some(refresh) = refresh {
            self.write_refresh_cookie(refresh, &self.cookie_options)?;
        }
        debug!(epoch = *epoch, "Started new credential epoch");
        Ok(())
    }

    /// Epoch and refresh credential read together, for a refresh about to
    /// start.
    pub fn refresh_snapshot(&self) -> (u64, Option<String>) {
        let epoch = self.guard();
        (*epoch, self.refresh_credential())
    }

    /// Store the result of a refresh that started at `epoch`. Returns
    /// `false` without writing if the identity changed since.
    pub fn commit_refresh(
        &self,
        epoch: u64,
        token: &str,
        user: Option<&User>,
        rotated: Option<&str>,
    ) -> Result<bool, StorageError> {
        let user_json = user.map(serde_json::to_string).transpose()?;
        let current = self.guard();
        if *current != epoch {
            debug!(started = epoch, current = *current, "Discarding refresh from an earlier session");
            return Ok(false);
        }
        match user_json {
            Some(ref json) => self
                .session
                .apply(&[(TOKEN_KEY, Some(token)), (USER_KEY, Some(json.as_str()))])?,
            None => self.session.set(TOKEN_KEY, token)?,
        }
        if let Some(rotated) = rotated {
            if let Err(e) = self.write_refresh_cookie(rotated, &self.cookie_options) {
                warn!(error = %e, "Failed to store rotated refresh credential");
            }
        }
        Ok(true)
    }

    /// Persist the access token together with the user profile.
    pub fn save(&self, token: &str, user: Option<&User>) -> Result<(), StorageError> {
        let user_json = user.map(serde_json::to_string).transpose()?;
        let _guard = self.guard();
        self.session.apply(&[
            (TOKEN_KEY, Some(token)),
            (USER_KEY, user_json.as_deref()),
        ])
    }

    /// Replace only the access token, keeping the stored profile.
    pub fn save_token(&self, token: &str) -> Result<(), StorageError> {
        let _guard = self.guard();
        self.session.set(TOKEN_KEY, token)
    }

    pub fn load(&self) -> Result<StoredCredentials, StorageError> {
        let _guard = self.guard();
        let token = self.session.get(TOKEN_KEY)?.filter(|t| !t.is_empty());
        let user = self.read_user()?;
        Ok(StoredCredentials { token, user })
    }

    /// Current access token. Storage failures are logged and read as absent.
    pub fn token(&self) -> Option<String> {
        let _guard = self.guard();
        match self.session.get(TOKEN_KEY) {
            Ok(token) => token.filter(|t| !t.is_empty()),
            Err(e) => {
                warn!(error = %e, "Failed to read stored access token");
                None
            }
        }
    }

    pub fn user(&self) -> Option<User> {
        let _guard = self.guard();
        self.read_user().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to read stored user");
            None
        })
    }

    // Caller holds the lock
    fn read_user(&self) -> Result<Option<User>, StorageError> {
        let Some(raw) = self.session.get(USER_KEY)? else {
            return Ok(None);
        };
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed == "undefined" || trimmed == "null" {
            debug!("Stored user is empty, treating as absent");
            return Ok(None);
        }
        match serde_json::from_str::<User>(trimmed) {
            Ok(user) => Ok(Some(user)),
            Err(e) => {
                warn!(error = %e, "Discarding corrupt stored user");
                self.session.remove(USER_KEY)?;
                Ok(None)
            }
        }
    }

    /// Remove the access token and the profile, ending the current epoch.
    /// Idempotent.
    pub fn clear(&self) -> Result<(), StorageError> {
        let mut epoch = self.guard();
        *epoch += 1;
        self.session.apply(&[(TOKEN_KEY, None), (USER_KEY, None)])
    }

    /// Write the refresh credential. Returns `false` without writing when
    /// the channel is not secure and insecure cookies are not allowed.
    pub fn set_refresh_credential(&self, value: &str, options: &CookieOptions) -> Result<bool, StorageError> {
        self.write_refresh_cookie(value, options)
    }

    // Does not take the lock
    fn write_refresh_cookie(&self, value: &str, options: &CookieOptions) -> Result<bool, StorageError> {
        if !options.secure && !self.allow_insecure_cookie {
            warn!("Refusing to store refresh credential over an insecure channel");
            return Ok(false);
        }
        let cookie = StoredCookie {
            value: value.to_string(),
            secure: options.secure,
            same_site: options.same_site,
            path: "/".to_string(),
            expires_at: expiry_after(options.ttl_days)?,
        };
        let serialized = serde_json::to_string(&cookie)?;
        self.cookies.set(REFRESH_COOKIE_NAME, &serialized)?;
        debug!(ttl_days = options.ttl_days, "Refresh credential stored");
        Ok(true)
    }

    /// Write the refresh credential with this store's default attributes.
    pub fn remember_refresh_credential(&self, value: &str) -> Result<bool, StorageError> {
        let options = self.cookie_options.clone();
        self.set_refresh_credential(value, &options)
    }

    /// Current refresh credential; expired or unreadable values are removed
    /// and read as absent.
    pub fn refresh_credential(&self) -> Option<String> {
        let raw = match self.cookies.get(REFRESH_COOKIE_NAME) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "Failed to read refresh credential");
                return None;
            }
        };
        match serde_json::from_str::<StoredCookie>(&raw) {
            Ok(cookie) if !cookie.is_expired() => return Some(cookie.value),
            Ok(_) => debug!("Refresh credential expired"),
            Err(e) => warn!(error = %e, "Discarding corrupt refresh credential"),
        }
        if let Err(e) = self.cookies.remove(REFRESH_COOKIE_NAME) {
            warn!(error = %e, "Failed to remove stale refresh credential");
        }
        None
    }

    pub fn clear_refresh_credential(&self) -> Result<(), StorageError> {
        self.cookies.remove(REFRESH_COOKIE_NAME)
    }
}

fn expiry_after(ttl_days: i64) -> Result<DateTime<Utc>, StorageError> {
    if !(1..=MAX_REFRESH_TTL_DAYS).contains(&ttl_days) {
        return Err(StorageError::InvalidLifetime(ttl_days));
    }
    Duration::try_days(ttl_days)
        .and_then(|ttl| Utc::now().checked_add_signed(ttl))
        .ok_or(StorageError::InvalidLifetime(ttl_days))
}

/// Extract a rotated refresh credential from `Set-Cookie` response headers.
pub fn refresh_cookie_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|cookie| cookie.split(';').next())
        .filter_map(|pair| pair.trim().strip_prefix(REFRESH_COOKIE_NAME)?.strip_prefix('='))
        .find(|value| !value.is_empty())
        .map(str::to_string)
}

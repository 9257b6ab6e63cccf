//! Authentication module: credentials, token refresh and the session.
//!
//! This module provides:
//! - `CredentialStore`: persisted access token, user profile and refresh
//!   credential, over pluggable `Storage` backends
//! - `RefreshCoordinator`: single-flight refresh of the access token
//! - `SessionController`: startup, login and logout state machine

pub mod credentials;
pub mod refresh;
pub mod session;
pub mod storage;

pub use credentials::{CookieOptions, CredentialStore, SameSite, StoredCredentials};
pub use refresh::{AuthEvent, RefreshCoordinator, RefreshError};
pub use session::{LoginOutcome, Session, SessionController, SessionError, SessionOptions, SessionState};
pub use storage::{FileStorage, KeyringStorage, MemoryStorage, Storage, StorageError};

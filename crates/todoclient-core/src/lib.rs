//! Core library for the to-do service client.
//!
//! This crate holds everything that is not presentation:
//!
//! - `api`: the request pipeline (`ApiClient`) and HTTP transport
//! - `auth`: credential persistence, the refresh coordinator and the
//!   session controller
//! - `cache`: timestamped wrappers for fetched data
//! - `models`: users and to-do items as the service returns them
//! - `config`: client configuration and its on-disk location

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod models;

#[cfg(test)]
pub(crate) mod test_support;

pub use api::{ApiClient, ApiError, ApiRequest, ApiResponse, HttpTransport, RequestContext, Transport};
pub use auth::{
    AuthEvent, CredentialStore, RefreshCoordinator, RefreshError, Session, SessionController,
    SessionError, SessionOptions, SessionState,
};
pub use config::ClientConfig;
pub use models::{LoginCredentials, RegisterRequest, TodoItem, TodoUpdate, User};

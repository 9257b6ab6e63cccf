//! REST API client module for the to-do service.
//!
//! This module provides the `ApiClient` request pipeline, which attaches the
//! stored bearer token to every request and recovers from an expired token
//! by refreshing it once and resending the request.
//!
//! The network itself sits behind the `Transport` trait so the pipeline can
//! be driven by `HttpTransport` in production and by scripted transports in
//! tests.

pub mod client;
pub mod error;
pub mod transport;

pub use client::{ApiClient, RequestContext};
pub use error::ApiError;
pub use transport::{ApiRequest, ApiResponse, HttpTransport, Transport, TransportError};

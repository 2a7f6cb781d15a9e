//! Client-side authentication sessions with transparent token refresh
//!
//! An [`AuthSession`] signs a user in against an HTTP API, turns the token
//! the server hands back into a set of request headers, and keeps those
//! headers in a [`CredentialStore`] so that they survive restarts. Every
//! request sent through the session is decorated with those headers when it
//! targets the configured API.
//!
//! When the server answers `401 Unauthorized` with a body of
//! `["token_expired", …]`, the session exchanges its credentials at the
//! refresh endpoint and replays the original request once. Any other
//! unauthorized answer invalidates the session.
//!
//! Sign-in and validation never run concurrently: a caller who starts one
//! while another is pending is handed the pending [`Operation`]. Progress is
//! published as [`AuthEvent`]s to any number of subscribers.
//!
//! The session does not speak HTTP on its own. Provide a [`Transport`] that
//! exchanges [`ApiRequest`]s for [`ApiResponse`]s; the `tessera_reqwest`
//! crate provides one built on `reqwest`.
//!
//! ```
//! use async_trait::async_trait;
//! use http::StatusCode;
//! use serde_json::json;
//! use tessera::{ApiRequest, ApiResponse, AuthConfig, AuthSession, BoxError, Transport};
//!
//! struct Issuer;
//!
//! #[async_trait]
//! impl Transport for Issuer {
//!     async fn send(&self, _: ApiRequest) -> Result<ApiResponse, BoxError> {
//!         Ok(ApiResponse::new(StatusCode::OK, json!({ "token": "abc123" })))
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! let session = AuthSession::builder(AuthConfig::default()).build(Issuer);
//!
//! session
//!     .sign_in(&json!({ "email": "user@example.com", "password": "hunter2" }))
//!     .await
//!     .unwrap();
//!
//! assert!(session.is_authenticated());
//! assert_eq!(
//!     session.auth_headers().unwrap()["Authorization"],
//!     "Bearer abc123"
//! );
//! # }
//! ```
//!
//! # Features
//!
//! * `file` (default): Provides [`FileStorage`], a durable storage tier
//!   using the local filesystem.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod braids;
pub mod config;
pub mod error;
pub mod events;
pub mod headers;
mod interceptor;
mod operation;
mod session;
pub mod store;
pub mod transport;

#[cfg(test)]
mod testing;

pub use braids::*;
pub use config::AuthConfig;
pub use error::{Rejection, RejectionReason, RequestError};
pub use events::{AuthEvent, AuthStage};
pub use headers::{AuthHeaders, HeaderFormatter};
pub use interceptor::Recovery;
pub use operation::{Operation, OperationResult};
pub use session::{AuthSession, AuthSessionBuilder};
#[cfg(feature = "file")]
pub use store::FileStorage;
pub use store::{CredentialStore, MemoryStorage, Storage};
pub use transport::{ApiRequest, ApiResponse, BoxError, Transport};
